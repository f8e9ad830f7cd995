pub mod initial_indexes;

pub use initial_indexes::ensure_indexes;
