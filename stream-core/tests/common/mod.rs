#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use stream_common::data::types::{PriceLevel, Side, Symbol, Trade};
use stream_core::book::{DepthDiff, DepthSnapshot};
use stream_core::exchange::{
    Connection, Decoded, Exchange, ExchangeError, FeedPayload, Inbound, Outbound, Provider,
};
use stream_core::stream::{
    DataReceiver, FeedItem, FeedKind, StreamConfig, StreamState, Subscription, SubscriptionKey,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

/// Test side of one connection opened by the engine
pub struct Link {
    pub inbound: mpsc::Sender<Inbound>,
    pub outbound: mpsc::Receiver<Outbound>,
}

impl Link {
    pub async fn push(&self, frame: String) {
        self.inbound.send(Inbound::Text(frame)).await.unwrap();
    }

    /// Next control text written by the engine, pings skipped
    pub async fn next_text(&mut self) -> String {
        loop {
            match timeout(WAIT, self.outbound.recv()).await {
                Ok(Some(Outbound::Text(text))) => return text,
                Ok(Some(Outbound::Ping)) | Ok(Some(Outbound::Pong(_))) => continue,
                Ok(Some(Outbound::Close)) => panic!("connection closed by engine"),
                Ok(None) => panic!("engine dropped the connection"),
                Err(_) => panic!("no outbound text within {:?}", WAIT),
            }
        }
    }

    pub async fn next_frame(&mut self) -> Option<Outbound> {
        timeout(WAIT, self.outbound.recv())
            .await
            .expect("no outbound frame in time")
    }
}

/// Scripted in-memory exchange.
///
/// Every successful `open` hands a [`Link`] to the test through the channel
/// returned by [`MockExchange::new`].
pub struct MockExchange {
    links: mpsc::UnboundedSender<Link>,
    open_error: Mutex<Option<ExchangeError>>,
    opens: AtomicUsize,
    snapshot_fetches: AtomicUsize,
    snapshot: Mutex<Option<DepthSnapshot>>,
    snapshot_error: Mutex<Option<ExchangeError>>,
}

impl MockExchange {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Link>) {
        let (links, links_rx) = mpsc::unbounded_channel();
        let mock = Arc::new(Self {
            links,
            open_error: Mutex::new(None),
            opens: AtomicUsize::new(0),
            snapshot_fetches: AtomicUsize::new(0),
            snapshot: Mutex::new(None),
            snapshot_error: Mutex::new(None),
        });
        (mock, links_rx)
    }

    /// Refuse every open with a retryable network error
    pub fn fail_opens(&self, fail: bool) {
        *self.open_error.lock().unwrap() =
            fail.then(|| ExchangeError::NetworkError("connection refused".to_string()));
    }

    pub fn reject_opens(&self, err: ExchangeError) {
        *self.open_error.lock().unwrap() = Some(err);
    }

    pub fn reject_snapshots(&self, err: ExchangeError) {
        *self.snapshot_error.lock().unwrap() = Some(err);
    }

    /// Open attempts, failed ones included
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn snapshot_fetches(&self) -> usize {
        self.snapshot_fetches.load(Ordering::SeqCst)
    }

    pub fn set_snapshot(&self, last_update_id: u64, bids: &[(i64, i64)], asks: &[(i64, i64)]) {
        *self.snapshot.lock().unwrap() = Some(DepthSnapshot {
            symbol: Symbol::new("BTCUSDT"),
            last_update_id,
            bids: levels(bids),
            asks: levels(asks),
        });
    }
}

#[async_trait]
impl Exchange for MockExchange {
    fn provider(&self) -> Provider {
        Provider::Binance
    }

    fn endpoint(&self, _kind: FeedKind) -> String {
        "mock://stream".to_string()
    }

    fn stream_name(&self, key: &SubscriptionKey) -> String {
        format!("{}@{}", key.symbol.to_lowercase(), key.kind)
    }

    fn subscribe_message(&self, streams: &[String], request_id: u64) -> Result<String, ExchangeError> {
        Ok(json!({"method": "subscribe", "params": streams, "id": request_id}).to_string())
    }

    fn unsubscribe_message(
        &self,
        streams: &[String],
        request_id: u64,
    ) -> Result<String, ExchangeError> {
        Ok(json!({"method": "unsubscribe", "params": streams, "id": request_id}).to_string())
    }

    async fn open(&self, _endpoint: &str) -> Result<Connection, ExchangeError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let open_error = self.open_error.lock().unwrap().clone();
        if let Some(err) = open_error {
            return Err(err);
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let _ = self.links.send(Link {
            inbound: inbound_tx,
            outbound: outbound_rx,
        });

        Ok(Connection {
            inbound: inbound_rx,
            outbound: outbound_tx,
        })
    }

    fn decode(&self, raw: &str) -> Result<Option<Decoded>, ExchangeError> {
        let value: Value = serde_json::from_str(raw)?;
        let stream = value["stream"].as_str().unwrap_or_default().to_string();
        let symbol = Symbol::new(value["symbol"].as_str().unwrap_or_default());

        let payload = match value["type"].as_str() {
            Some("ack") => return Ok(None),
            Some("trade") => FeedPayload::Trade(Trade {
                id: value["id"].to_string(),
                symbol,
                price: Decimal::from(value["price"].as_i64().unwrap_or(1)),
                quantity: Decimal::ONE,
                side: Side::Buy,
                timestamp: now(),
                is_buyer_maker: false,
            }),
            Some("diff") => FeedPayload::Diff(DepthDiff {
                symbol,
                first_update_id: value["first"].as_u64().unwrap_or(0),
                final_update_id: value["last"].as_u64().unwrap_or(0),
                bids: json_levels(&value["bids"]),
                asks: json_levels(&value["asks"]),
                event_time: now(),
            }),
            other => {
                return Err(ExchangeError::ParseError(format!(
                    "unknown frame type {:?}",
                    other
                )))
            }
        };

        Ok(Some(Decoded { stream, payload }))
    }

    async fn fetch_snapshot(
        &self,
        symbol: &Symbol,
        _depth: u32,
    ) -> Result<DepthSnapshot, ExchangeError> {
        self.snapshot_fetches.fetch_add(1, Ordering::SeqCst);
        let snapshot_error = self.snapshot_error.lock().unwrap().clone();
        if let Some(err) = snapshot_error {
            return Err(err);
        }
        let snapshot = self.snapshot.lock().unwrap().clone();
        match snapshot {
            Some(mut snapshot) => {
                snapshot.symbol = symbol.clone();
                Ok(snapshot)
            }
            None => Err(ExchangeError::Timeout),
        }
    }
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

fn json_levels(value: &Value) -> Vec<PriceLevel> {
    value
        .as_array()
        .map(|levels| {
            levels
                .iter()
                .map(|l| level(l[0].as_i64().unwrap_or(0), l[1].as_i64().unwrap_or(0)))
                .collect()
        })
        .unwrap_or_default()
}

pub fn level(price: i64, quantity: i64) -> PriceLevel {
    PriceLevel::new(Decimal::from(price), Decimal::from(quantity))
}

pub fn levels(raw: &[(i64, i64)]) -> Vec<PriceLevel> {
    raw.iter().map(|(p, q)| level(*p, *q)).collect()
}

pub fn trade_frame(stream: &str, symbol: &str, id: u64, price: i64) -> String {
    json!({"stream": stream, "type": "trade", "symbol": symbol, "id": id, "price": price})
        .to_string()
}

pub fn diff_frame(
    stream: &str,
    first: u64,
    last: u64,
    bids: &[(i64, i64)],
    asks: &[(i64, i64)],
) -> String {
    json!({
        "stream": stream,
        "type": "diff",
        "symbol": "BTCUSDT",
        "first": first,
        "last": last,
        "bids": bids.iter().map(|(p, q)| vec![*p, *q]).collect::<Vec<_>>(),
        "asks": asks.iter().map(|(p, q)| vec![*p, *q]).collect::<Vec<_>>(),
    })
    .to_string()
}

/// Short timings so reconnect paths run in milliseconds
pub fn fast_config() -> StreamConfig {
    StreamConfig::default()
        .with_backoff(Duration::from_millis(20), Duration::from_millis(100))
        .with_keepalive(Duration::from_secs(60), Duration::from_secs(60))
        .with_connect_timeout(Duration::from_secs(1))
}

pub async fn next_link(links: &mut mpsc::UnboundedReceiver<Link>) -> Link {
    timeout(WAIT, links.recv())
        .await
        .expect("no connection opened in time")
        .expect("link channel closed")
}

pub async fn wait_for_state<T: FeedItem>(sub: &Subscription<T>, state: StreamState) {
    let mut changes = sub.state_changes();
    let reached = timeout(WAIT, changes.wait_for(|s| *s == state))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
    assert!(reached, "never reached {}, still {}", state, sub.state());
}

pub async fn recv_item<T>(rx: &mut DataReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("no item in time")
        .expect("data channel closed")
}

/// Poll until `check` holds, panicking after [`WAIT`]
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
