// exchange/traits.rs

use async_trait::async_trait;
use stream_common::data::types::{Kline, KlineInterval, Symbol, Ticker, Trade};
use tokio::sync::mpsc;

use super::{ExchangeError, Provider};
use crate::book::{DepthDiff, DepthSnapshot};
use crate::stream::{FeedKind, SubscriptionKey};

/// Frame delivered by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    Pong,
    /// Transport is gone; nothing follows
    Closed(String),
}

/// Frame handed to a transport
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Ping,
    Pong(Vec<u8>),
    Close,
}

/// One open duplex transport.
///
/// Dropping the connection releases the transport tasks behind it.
#[derive(Debug)]
pub struct Connection {
    pub inbound: mpsc::Receiver<Inbound>,
    pub outbound: mpsc::Sender<Outbound>,
}

/// Normalized payload of one decoded message
#[derive(Debug, Clone, PartialEq)]
pub enum FeedPayload {
    Ticker(Ticker),
    Trade(Trade),
    Kline(Kline),
    Snapshot(DepthSnapshot),
    Diff(DepthDiff),
}

/// Decoded message tagged with the stream it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub stream: String,
    pub payload: FeedPayload,
}

/// Capability interface every exchange connector implements
#[async_trait]
pub trait Exchange: Send + Sync {
    fn provider(&self) -> Provider;

    /// WebSocket endpoint serving a feed kind
    fn endpoint(&self, kind: FeedKind) -> String;

    /// Whether several streams can share one connection
    fn supports_combined(&self) -> bool {
        true
    }

    /// Whether book snapshots arrive over the stream instead of REST
    fn pushes_snapshots(&self) -> bool {
        false
    }

    /// Exchange-side stream name, also the routing key for decoded messages
    fn stream_name(&self, key: &SubscriptionKey) -> String;

    fn subscribe_message(&self, streams: &[String], request_id: u64)
        -> Result<String, ExchangeError>;

    fn unsubscribe_message(
        &self,
        streams: &[String],
        request_id: u64,
    ) -> Result<String, ExchangeError>;

    async fn open(&self, endpoint: &str) -> Result<Connection, ExchangeError>;

    /// Decode one raw message, Ok(None) for control acknowledgements
    fn decode(&self, raw: &str) -> Result<Option<Decoded>, ExchangeError>;

    async fn fetch_snapshot(
        &self,
        symbol: &Symbol,
        depth: u32,
    ) -> Result<DepthSnapshot, ExchangeError>;

    // REST market data queries, optional per exchange

    async fn fetch_ticker(&self, _symbol: &Symbol) -> Result<Ticker, ExchangeError> {
        Err(ExchangeError::Unsupported(format!(
            "{} ticker queries",
            self.provider()
        )))
    }

    /// Most recent trades, newest last
    async fn fetch_trades(
        &self,
        _symbol: &Symbol,
        _limit: u32,
    ) -> Result<Vec<Trade>, ExchangeError> {
        Err(ExchangeError::Unsupported(format!(
            "{} trade queries",
            self.provider()
        )))
    }

    async fn fetch_klines(
        &self,
        _symbol: &Symbol,
        _interval: KlineInterval,
        _limit: u32,
    ) -> Result<Vec<Kline>, ExchangeError> {
        Err(ExchangeError::Unsupported(format!(
            "{} kline queries",
            self.provider()
        )))
    }

    /// Symbols currently open for trading
    async fn fetch_symbols(&self) -> Result<Vec<Symbol>, ExchangeError> {
        Err(ExchangeError::Unsupported(format!(
            "{} symbol listing",
            self.provider()
        )))
    }
}
