// stream/mod.rs
pub mod backoff;
pub mod channel;
pub mod client;
pub mod errors;
pub mod keepalive;
pub mod lifecycle;
pub mod multiplexer;
mod slot;
pub mod types;

// Re-export main interfaces for easy access
pub use backoff::{Backoff, BackoffStep};
pub use channel::{ChannelCounters, DataReceiver, Emitter, ERROR_BUFFER_SIZE};
pub use client::StreamClient;
pub use errors::StreamError;
pub use keepalive::{Watchdog, WatchdogAction};
pub use lifecycle::{Done, Subscription};
pub use multiplexer::Multiplexer;
pub use slot::SlotKey;
pub use types::*;
