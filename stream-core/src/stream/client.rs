// =================================================================
// stream/client.rs - Stream Client Facade
// =================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use stream_common::data::types::{Kline, KlineInterval, OrderBook, Symbol, Ticker, Trade};
use tracing::info;

use super::{
    FeedItem, MarketEvent, Multiplexer, SlotKey, StreamConfig, StreamError, Subscription,
    SubscriptionId, SubscriptionKey,
};
use crate::exchange::Exchange;

/// Entry point for creating subscriptions against one exchange.
///
/// Every subscription created here shares the client's multiplexer, so feeds
/// of the same kind ride one connection where the exchange allows it.
pub struct StreamClient {
    exchange: Arc<dyn Exchange>,
    mux: Multiplexer,
    config: Arc<StreamConfig>,
    next_id: AtomicU64,
}

impl StreamClient {
    /// Validate `config` and start the multiplexer. Needs a Tokio runtime.
    pub fn new(exchange: Arc<dyn Exchange>, config: StreamConfig) -> Result<Self, StreamError> {
        config.validate()?;
        let config = Arc::new(config);
        let mux = Multiplexer::spawn(Arc::clone(&exchange), Arc::clone(&config));

        info!(
            "Stream client ready for {} (buffer {}, reconnect {})",
            exchange.provider(),
            config.buffer_size,
            config.reconnect
        );

        Ok(Self {
            exchange,
            mux,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn ticker_stream(
        &self,
        symbol: impl Into<Symbol>,
    ) -> Result<Subscription<Ticker>, StreamError> {
        self.open(SubscriptionKey::ticker(symbol))
    }

    /// Order book views limited to `depth` levels per side, 0 for all
    pub fn order_book_stream(
        &self,
        symbol: impl Into<Symbol>,
        depth: u32,
    ) -> Result<Subscription<OrderBook>, StreamError> {
        self.open(SubscriptionKey::order_book(symbol, depth))
    }

    pub fn trade_stream(
        &self,
        symbol: impl Into<Symbol>,
    ) -> Result<Subscription<Trade>, StreamError> {
        self.open(SubscriptionKey::trade(symbol))
    }

    pub fn kline_stream(
        &self,
        symbol: impl Into<Symbol>,
        interval: KlineInterval,
    ) -> Result<Subscription<Kline>, StreamError> {
        self.open(SubscriptionKey::kline(symbol, interval))
    }

    /// Untyped subscription for any key
    pub fn market_stream(
        &self,
        key: SubscriptionKey,
    ) -> Result<Subscription<MarketEvent>, StreamError> {
        self.open(key)
    }

    pub fn exchange(&self) -> &Arc<dyn Exchange> {
        &self.exchange
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub async fn slots(&self) -> Result<Vec<SlotKey>, StreamError> {
        self.mux.slots().await
    }

    pub async fn slot_count(&self) -> Result<usize, StreamError> {
        self.mux.slot_count().await
    }

    fn open<T: FeedItem>(&self, key: SubscriptionKey) -> Result<Subscription<T>, StreamError> {
        key.validate()?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Ok(Subscription::new(
            id,
            key,
            Arc::clone(&self.config),
            self.mux.clone(),
        ))
    }
}
