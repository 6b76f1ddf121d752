// exchange/mod.rs
pub mod binance;
pub mod errors;
pub mod registry;
pub mod traits;
pub mod types;
pub mod utils;

// Re-export main interfaces for easy access
pub use binance::BinanceExchange;
pub use errors::ExchangeError;
pub use registry::{ExchangeFactory, ExchangeOptions, ExchangeRegistry, Provider};
pub use traits::{Connection, Decoded, Exchange, FeedPayload, Inbound, Outbound};
