pub mod dedup;
pub mod engine;
pub mod importer;

pub use dedup::*;
pub use engine::*;
pub use importer::*;
