// book/mod.rs
pub mod replica;
pub mod sync;

pub use replica::{DepthDiff, DepthSnapshot, DiffCheck, OrderBookReplica};
pub use sync::{BookSync, SyncOutcome};
