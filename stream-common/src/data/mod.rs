// stream-common/src/data/mod.rs
pub mod types;

pub use types::*;
