pub mod image;
pub mod storage;

pub use self::image::*;
pub use storage::*;
