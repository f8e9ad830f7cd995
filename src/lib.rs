pub mod cli;
pub mod config;
pub mod handlers;
pub mod mapping;
pub mod migrations;
pub mod models;
pub mod processing;
pub mod schema;
pub mod storage;
pub mod sync;

// Convenient re-exports for tests and external callers
pub use config::*;
pub use mapping::*;
pub use models::*;
pub use storage::*;
pub use sync::*;
