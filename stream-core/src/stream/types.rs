use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stream_common::data::types::{Kline, KlineInterval, OrderBook, Symbol, Ticker, Trade};

use super::StreamError;

/// Category of normalized market data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    Ticker,
    OrderBook,
    Trade,
    Kline,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Ticker => "ticker",
            FeedKind::OrderBook => "orderbook",
            FeedKind::Trade => "trade",
            FeedKind::Kline => "kline",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional per-feed parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedParam {
    None,
    Depth(u32),
    Interval(KlineInterval),
}

/// Identifies one logical feed: kind, symbol and parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub kind: FeedKind,
    pub symbol: Symbol,
    pub param: FeedParam,
}

impl SubscriptionKey {
    pub fn ticker(symbol: impl Into<Symbol>) -> Self {
        Self {
            kind: FeedKind::Ticker,
            symbol: symbol.into(),
            param: FeedParam::None,
        }
    }

    pub fn order_book(symbol: impl Into<Symbol>, depth: u32) -> Self {
        Self {
            kind: FeedKind::OrderBook,
            symbol: symbol.into(),
            param: FeedParam::Depth(depth),
        }
    }

    pub fn trade(symbol: impl Into<Symbol>) -> Self {
        Self {
            kind: FeedKind::Trade,
            symbol: symbol.into(),
            param: FeedParam::None,
        }
    }

    pub fn kline(symbol: impl Into<Symbol>, interval: KlineInterval) -> Self {
        Self {
            kind: FeedKind::Kline,
            symbol: symbol.into(),
            param: FeedParam::Interval(interval),
        }
    }

    /// Depth limit for order book views, None means the whole replica
    pub fn depth(&self) -> Option<usize> {
        match self.param {
            FeedParam::Depth(0) => None,
            FeedParam::Depth(depth) => Some(depth as usize),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        self.symbol
            .validate()
            .map_err(|e| StreamError::Config(e.to_string()))?;

        match (self.kind, self.param) {
            (FeedKind::Kline, FeedParam::Interval(_)) => Ok(()),
            (FeedKind::Kline, _) => Err(StreamError::Config(
                "kline feeds require an interval".to_string(),
            )),
            (FeedKind::OrderBook, FeedParam::Depth(_)) | (FeedKind::OrderBook, FeedParam::None) => {
                Ok(())
            }
            (kind, FeedParam::None) if kind != FeedKind::OrderBook => Ok(()),
            (kind, param) => Err(StreamError::Config(format!(
                "parameter {:?} is not valid for {} feeds",
                param, kind
            ))),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.param {
            FeedParam::None => write!(f, "{}:{}", self.kind, self.symbol),
            FeedParam::Depth(depth) => write!(f, "{}:{}:{}", self.kind, self.symbol, depth),
            FeedParam::Interval(interval) => {
                write!(f, "{}:{}:{}", self.kind, self.symbol, interval)
            }
        }
    }
}

/// Engine-assigned identity of one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Lifecycle state of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Connecting,
    Active,
    Reconnecting,
    Closing,
    Closed,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Connecting => "connecting",
            StreamState::Active => "active",
            StreamState::Reconnecting => "reconnecting",
            StreamState::Closing => "closing",
            StreamState::Closed => "closed",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closing | StreamState::Closed)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which item is sacrificed when a data channel is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest pending item, keep the new one
    #[default]
    DropOldest,
    /// Keep pending items, discard the new one
    DropNewest,
}

/// Stream engine configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Data channel capacity, 0 hands items over only to a waiting consumer
    pub buffer_size: usize,
    pub overflow_policy: OverflowPolicy,
    pub reconnect: bool,
    /// 0 means unlimited
    pub max_reconnect_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    /// Deadline for a connect attempt, including the initial book snapshot
    pub connect_timeout: Duration,
    /// Levels requested from the REST depth snapshot
    pub snapshot_depth: u32,
    /// Diffs held while waiting for a snapshot
    pub max_buffered_diffs: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            overflow_policy: OverflowPolicy::DropOldest,
            reconnect: true,
            max_reconnect_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            snapshot_depth: 1000,
            max_buffered_diffs: 1000,
        }
    }
}

impl StreamConfig {
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_keepalive(mut self, ping_interval: Duration, pong_timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.pong_timeout = pong_timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Reject inconsistent settings before anything is spawned
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.max_delay < self.base_delay {
            return Err(StreamError::Config(format!(
                "max delay {:?} is below base delay {:?}",
                self.max_delay, self.base_delay
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(StreamError::Config(
                "connect timeout must be positive".to_string(),
            ));
        }
        if self.reconnect {
            if self.base_delay.is_zero() {
                return Err(StreamError::Config(
                    "base delay must be positive when reconnect is enabled".to_string(),
                ));
            }
            if self.ping_interval.is_zero() || self.pong_timeout.is_zero() {
                return Err(StreamError::Config(
                    "ping interval and pong timeout must be positive when reconnect is enabled"
                        .to_string(),
                ));
            }
        }
        if self.max_buffered_diffs == 0 {
            return Err(StreamError::Config(
                "max buffered diffs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Decoded market event as routed to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Ticker(Ticker),
    Trade(Trade),
    Kline(Kline),
    OrderBook(OrderBook),
}

impl MarketEvent {
    pub fn kind(&self) -> FeedKind {
        match self {
            MarketEvent::Ticker(_) => FeedKind::Ticker,
            MarketEvent::Trade(_) => FeedKind::Trade,
            MarketEvent::Kline(_) => FeedKind::Kline,
            MarketEvent::OrderBook(_) => FeedKind::OrderBook,
        }
    }
}

/// Item type a typed subscription delivers
pub trait FeedItem: Send + 'static {
    fn from_event(event: MarketEvent) -> Option<Self>
    where
        Self: Sized;
}

impl FeedItem for MarketEvent {
    fn from_event(event: MarketEvent) -> Option<Self> {
        Some(event)
    }
}

impl FeedItem for Ticker {
    fn from_event(event: MarketEvent) -> Option<Self> {
        match event {
            MarketEvent::Ticker(ticker) => Some(ticker),
            _ => None,
        }
    }
}

impl FeedItem for Trade {
    fn from_event(event: MarketEvent) -> Option<Self> {
        match event {
            MarketEvent::Trade(trade) => Some(trade),
            _ => None,
        }
    }
}

impl FeedItem for Kline {
    fn from_event(event: MarketEvent) -> Option<Self> {
        match event {
            MarketEvent::Kline(kline) => Some(kline),
            _ => None,
        }
    }
}

impl FeedItem for OrderBook {
    fn from_event(event: MarketEvent) -> Option<Self> {
        match event {
            MarketEvent::OrderBook(book) => Some(book),
            _ => None,
        }
    }
}

/// Per-subscription delivery statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub state: StreamState,
    /// Items handed to the data channel
    pub emitted: u64,
    /// Items sacrificed by the overflow policy
    pub dropped: u64,
    /// Errors lost to a full error channel
    pub errors_dropped: u64,
    /// Completed transitions back into Active
    pub reconnects: u64,
}
