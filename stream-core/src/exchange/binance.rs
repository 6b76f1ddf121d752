// =================================================================
// exchange/binance.rs - Binance Exchange Implementation
// =================================================================

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use stream_common::data::types::{Kline, KlineInterval, Symbol, Ticker, Trade};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{
    errors::ExchangeError,
    registry::{ExchangeOptions, Provider},
    traits::{Connection, Decoded, Exchange, FeedPayload, Inbound, Outbound},
    types::{
        BinanceDepthSnapshot, BinanceDepthUpdate, BinanceErrorReply, BinanceExchangeInfo,
        BinanceKlineMessage, BinanceRestKline, BinanceRestTicker, BinanceRestTrade,
        BinanceStreamMessage, BinanceSubscribeMessage, BinanceTickerMessage, BinanceTradeMessage,
    },
    utils::{
        build_stream_name, convert_depth_snapshot, convert_depth_update, convert_kline,
        convert_rest_kline, convert_rest_ticker, convert_rest_trade, convert_ticker,
        convert_trade, trading_symbols, validate_binance_symbol,
    },
};
use crate::book::DepthSnapshot;
use crate::stream::{FeedKind, SubscriptionKey};

// Constants
const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/stream";
const BINANCE_API_URL: &str = "https://api.binance.com";
const BINANCE_TESTNET_WS_URL: &str = "wss://testnet.binance.vision/stream";
const BINANCE_TESTNET_API_URL: &str = "https://testnet.binance.vision";
const MAX_SNAPSHOT_LIMIT: u32 = 5000;
const MAX_REST_LIMIT: u32 = 1000;
const INBOUND_BUFFER: usize = 1024;
const OUTBOUND_BUFFER: usize = 64;

/// Binance exchange implementation
pub struct BinanceExchange {
    ws_url: String,
    api_url: String,
    client: reqwest::Client,
}

impl BinanceExchange {
    /// Create a new Binance exchange instance
    pub fn new() -> Self {
        Self {
            ws_url: BINANCE_WS_URL.to_string(),
            api_url: BINANCE_API_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_options(options: &ExchangeOptions) -> Result<Self, ExchangeError> {
        let (default_ws, default_api) = if options.testnet {
            (BINANCE_TESTNET_WS_URL, BINANCE_TESTNET_API_URL)
        } else {
            (BINANCE_WS_URL, BINANCE_API_URL)
        };

        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()?;

        Ok(Self {
            ws_url: options
                .ws_url
                .clone()
                .unwrap_or_else(|| default_ws.to_string()),
            api_url: options
                .api_url
                .clone()
                .unwrap_or_else(|| default_api.to_string()),
            client,
        })
    }

    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    /// GET a REST endpoint and decode its JSON body
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ExchangeError> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            if status.as_u16() == 429 || status.as_u16() == 418 {
                return Err(ExchangeError::RateLimit(error_text));
            }
            if status.is_server_error() {
                return Err(ExchangeError::NetworkError(format!(
                    "HTTP {}: {}",
                    status, error_text
                )));
            }
            return Err(ExchangeError::ApiError(format!(
                "HTTP {}: {}",
                status, error_text
            )));
        }

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Dispatch one combined-stream payload on its event type
    fn decode_event(&self, event: &str, data: serde_json::Value) -> Result<FeedPayload, ExchangeError> {
        match event {
            "24hrTicker" => {
                let msg: BinanceTickerMessage = serde_json::from_value(data)?;
                Ok(FeedPayload::Ticker(convert_ticker(msg)?))
            }
            "trade" => {
                let msg: BinanceTradeMessage = serde_json::from_value(data)?;
                Ok(FeedPayload::Trade(convert_trade(msg)?))
            }
            "kline" => {
                let msg: BinanceKlineMessage = serde_json::from_value(data)?;
                Ok(FeedPayload::Kline(convert_kline(msg)?))
            }
            "depthUpdate" => {
                let msg: BinanceDepthUpdate = serde_json::from_value(data)?;
                Ok(FeedPayload::Diff(convert_depth_update(msg)?))
            }
            other => Err(ExchangeError::ParseError(format!(
                "Unsupported event type: {}",
                other
            ))),
        }
    }
}

impl Default for BinanceExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exchange for BinanceExchange {
    fn provider(&self) -> Provider {
        Provider::Binance
    }

    fn endpoint(&self, _kind: FeedKind) -> String {
        self.ws_url.clone()
    }

    fn stream_name(&self, key: &SubscriptionKey) -> String {
        build_stream_name(key)
    }

    fn subscribe_message(
        &self,
        streams: &[String],
        request_id: u64,
    ) -> Result<String, ExchangeError> {
        let msg = BinanceSubscribeMessage::subscribe(streams.to_vec(), request_id);
        Ok(serde_json::to_string(&msg)?)
    }

    fn unsubscribe_message(
        &self,
        streams: &[String],
        request_id: u64,
    ) -> Result<String, ExchangeError> {
        let msg = BinanceSubscribeMessage::unsubscribe(streams.to_vec(), request_id);
        Ok(serde_json::to_string(&msg)?)
    }

    async fn open(&self, endpoint: &str) -> Result<Connection, ExchangeError> {
        let (ws_stream, _) = connect_async(endpoint)
            .await
            .map_err(|e| ExchangeError::WebSocketError(format!("Failed to connect: {}", e)))?;

        info!("WebSocket connected to {}", endpoint);

        let (mut write, mut read) = ws_stream.split();
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(INBOUND_BUFFER);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);

        // Writer: the only task touching the sink
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let message = match frame {
                    Outbound::Text(text) => Message::Text(text),
                    Outbound::Ping => Message::Ping(Vec::new()),
                    Outbound::Pong(payload) => Message::Pong(payload),
                    Outbound::Close => {
                        if let Err(e) = write.send(Message::Close(None)).await {
                            warn!("Failed to send close frame: {}", e);
                        }
                        break;
                    }
                };
                if let Err(e) = write.send(message).await {
                    warn!("WebSocket write failed: {}", e);
                    break;
                }
            }
            debug!("WebSocket writer stopped");
        });

        // Reader: forwards frames until the socket or the consumer goes away
        let pong_tx = outbound_tx.clone();
        tokio::spawn(async move {
            let reason = loop {
                let msg = tokio::select! {
                    _ = inbound_tx.closed() => break None,
                    msg = read.next() => msg,
                };

                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(Inbound::Text(text)).await.is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = pong_tx.send(Outbound::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        if inbound_tx.send(Inbound::Pong).await.is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                        break Some(reason);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break Some("stream ended".to_string()),
                }
            };

            if let Some(reason) = reason {
                info!("WebSocket closed: {}", reason);
                let _ = inbound_tx.send(Inbound::Closed(reason)).await;
            }
            debug!("WebSocket reader stopped");
        });

        Ok(Connection {
            inbound: inbound_rx,
            outbound: outbound_tx,
        })
    }

    fn decode(&self, raw: &str) -> Result<Option<Decoded>, ExchangeError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;

        // Replies to SUBSCRIBE / UNSUBSCRIBE carry an id instead of a stream
        if value.get("id").is_some() && value.get("stream").is_none() {
            if let Some(error) = value.get("error") {
                let reply: BinanceErrorReply = serde_json::from_value(error.clone())?;
                return Err(ExchangeError::ApiError(format!(
                    "{}: {}",
                    reply.code, reply.msg
                )));
            }
            debug!("Received control reply: {}", raw);
            return Ok(None);
        }

        let envelope: BinanceStreamMessage = serde_json::from_value(value)?;
        let event = envelope
            .data
            .get("e")
            .and_then(|e| e.as_str())
            .ok_or_else(|| {
                ExchangeError::ParseError(format!("Missing event type on {}", envelope.stream))
            })?
            .to_string();

        let payload = self.decode_event(&event, envelope.data)?;
        Ok(Some(Decoded {
            stream: envelope.stream,
            payload,
        }))
    }

    async fn fetch_snapshot(
        &self,
        symbol: &Symbol,
        depth: u32,
    ) -> Result<DepthSnapshot, ExchangeError> {
        let validated = validate_binance_symbol(symbol.as_str())?;
        let limit = depth.clamp(1, MAX_SNAPSHOT_LIMIT);
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.api_url, validated, limit
        );

        debug!("Fetching depth snapshot from: {}", url);
        let snapshot: BinanceDepthSnapshot = self.get_json(&url).await?;

        info!(
            "Fetched depth snapshot for {} at update {}",
            symbol, snapshot.last_update_id
        );
        convert_depth_snapshot(symbol, snapshot)
    }

    async fn fetch_ticker(&self, symbol: &Symbol) -> Result<Ticker, ExchangeError> {
        let validated = validate_binance_symbol(symbol.as_str())?;
        let url = format!("{}/api/v3/ticker/24hr?symbol={}", self.api_url, validated);

        debug!("Fetching ticker from: {}", url);
        let ticker: BinanceRestTicker = self.get_json(&url).await?;
        convert_rest_ticker(ticker)
    }

    async fn fetch_trades(&self, symbol: &Symbol, limit: u32) -> Result<Vec<Trade>, ExchangeError> {
        let validated = validate_binance_symbol(symbol.as_str())?;
        let limit = limit.clamp(1, MAX_REST_LIMIT);
        let url = format!(
            "{}/api/v3/trades?symbol={}&limit={}",
            self.api_url, validated, limit
        );

        debug!("Fetching recent trades from: {}", url);
        let trades: Vec<BinanceRestTrade> = self.get_json(&url).await?;

        let mut result = Vec::with_capacity(trades.len());
        for trade in trades {
            match convert_rest_trade(symbol, trade) {
                Ok(trade) => result.push(trade),
                Err(e) => warn!("Failed to convert trade for {}: {}", symbol, e),
            }
        }

        info!("Fetched {} recent trades for {}", result.len(), symbol);
        Ok(result)
    }

    async fn fetch_klines(
        &self,
        symbol: &Symbol,
        interval: KlineInterval,
        limit: u32,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let validated = validate_binance_symbol(symbol.as_str())?;
        let limit = limit.clamp(1, MAX_REST_LIMIT);
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.api_url, validated, interval, limit
        );

        debug!("Fetching klines from: {}", url);
        let rows: Vec<BinanceRestKline> = self.get_json(&url).await?;

        let now = Utc::now();
        let klines = rows
            .into_iter()
            .map(|row| convert_rest_kline(symbol, interval, row, now))
            .collect::<Result<Vec<_>, _>>()?;

        info!("Fetched {} {} klines for {}", klines.len(), interval, symbol);
        Ok(klines)
    }

    async fn fetch_symbols(&self) -> Result<Vec<Symbol>, ExchangeError> {
        let url = format!("{}/api/v3/exchangeInfo", self.api_url);

        debug!("Fetching exchange info from: {}", url);
        let info: BinanceExchangeInfo = self.get_json(&url).await?;
        Ok(trading_symbols(info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use stream_common::data::types::{KlineInterval, Side};

    #[test]
    fn test_decode_trade_message() {
        let exchange = BinanceExchange::new();

        let stream_msg = r#"{
            "stream": "btcusdt@trade",
            "data": {
                "e": "trade",
                "E": 1672515782136,
                "s": "BTCUSDT",
                "t": 12345,
                "p": "50000.00",
                "q": "0.001",
                "b": 88,
                "a": 50,
                "T": 1672515782136,
                "m": false,
                "M": true
            }
        }"#;

        let decoded = exchange.decode(stream_msg).unwrap().unwrap();
        assert_eq!(decoded.stream, "btcusdt@trade");
        match decoded.payload {
            FeedPayload::Trade(trade) => {
                assert_eq!(trade.symbol.as_str(), "BTCUSDT");
                assert_eq!(trade.price, dec!(50000.00));
                assert_eq!(trade.quantity, dec!(0.001));
                assert_eq!(trade.side, Side::Buy); // is_buyer_maker = false -> Buy
                assert_eq!(trade.id, "12345");
                assert!(!trade.is_buyer_maker);
            }
            other => panic!("expected trade, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_depth_update() {
        let exchange = BinanceExchange::new();

        let msg = r#"{
            "stream": "btcusdt@depth@100ms",
            "data": {
                "e": "depthUpdate",
                "E": 1672515782136,
                "s": "BTCUSDT",
                "U": 157,
                "u": 160,
                "b": [["0.0024", "10"]],
                "a": [["0.0026", "100"], ["0.0027", "0.00000000"]]
            }
        }"#;

        let decoded = exchange.decode(msg).unwrap().unwrap();
        match decoded.payload {
            FeedPayload::Diff(diff) => {
                assert_eq!(diff.first_update_id, 157);
                assert_eq!(diff.final_update_id, 160);
                assert_eq!(diff.bids.len(), 1);
                assert_eq!(diff.asks[1].quantity, dec!(0));
            }
            other => panic!("expected diff, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_ticker_and_kline() {
        let exchange = BinanceExchange::new();

        let ticker = r#"{
            "stream": "ethusdt@ticker",
            "data": {
                "e": "24hrTicker", "E": 1672515782136, "s": "ETHUSDT",
                "p": "12.5", "P": "0.42", "w": "3000", "x": "2990",
                "c": "3002.5", "Q": "1", "b": "3002.4", "B": "4.2",
                "a": "3002.6", "A": "1.1", "o": "2990", "h": "3050",
                "l": "2950", "v": "1000", "q": "3000000",
                "O": 0, "C": 1, "F": 1, "L": 2, "n": 2
            }
        }"#;
        match exchange.decode(ticker).unwrap().unwrap().payload {
            FeedPayload::Ticker(t) => {
                assert_eq!(t.last_price, dec!(3002.5));
                assert_eq!(t.spread(), dec!(0.2));
            }
            other => panic!("expected ticker, got {:?}", other),
        }

        let kline = r#"{
            "stream": "btcusdt@kline_1m",
            "data": {
                "e": "kline", "E": 1672515782136, "s": "BTCUSDT",
                "k": {
                    "t": 1672515780000, "T": 1672515839999, "s": "BTCUSDT",
                    "i": "1m", "f": 100, "L": 200, "o": "0.0010", "c": "0.0020",
                    "h": "0.0025", "l": "0.0015", "v": "1000", "n": 100,
                    "x": false, "q": "1.0000", "V": "500", "Q": "0.500", "B": "0"
                }
            }
        }"#;
        match exchange.decode(kline).unwrap().unwrap().payload {
            FeedPayload::Kline(k) => {
                assert_eq!(k.interval, KlineInterval::OneMinute);
                assert_eq!(k.trade_count, 100);
                assert!(k.is_bullish());
                assert!(!k.is_closed);
            }
            other => panic!("expected kline, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_subscription_confirmation() {
        let exchange = BinanceExchange::new();

        let confirmation_msg = r#"{
            "result": null,
            "id": 1
        }"#;

        assert_eq!(exchange.decode(confirmation_msg).unwrap(), None);
    }

    #[test]
    fn test_decode_error_reply() {
        let exchange = BinanceExchange::new();
        let reply = r#"{"error": {"code": 2, "msg": "Invalid request"}, "id": 7}"#;

        assert!(matches!(
            exchange.decode(reply),
            Err(ExchangeError::ApiError(_))
        ));
    }

    #[test]
    fn test_decode_garbage_is_parse_error() {
        let exchange = BinanceExchange::new();
        assert!(matches!(
            exchange.decode("not json"),
            Err(ExchangeError::ParseError(_))
        ));
        assert!(matches!(
            exchange.decode(r#"{"stream": "x", "data": {"e": "unknown"}}"#),
            Err(ExchangeError::ParseError(_))
        ));
    }

    #[test]
    fn test_control_messages() {
        let exchange = BinanceExchange::new();
        let streams = vec!["btcusdt@trade".to_string(), "ethusdt@trade".to_string()];

        let subscribe = exchange.subscribe_message(&streams, 3).unwrap();
        let value: serde_json::Value = serde_json::from_str(&subscribe).unwrap();
        assert_eq!(value["method"], "SUBSCRIBE");
        assert_eq!(value["params"][1], "ethusdt@trade");
        assert_eq!(value["id"], 3);

        let unsubscribe = exchange.unsubscribe_message(&streams[..1], 4).unwrap();
        assert!(unsubscribe.contains("UNSUBSCRIBE"));
    }

    #[test]
    fn test_options_select_testnet() {
        let options = ExchangeOptions {
            testnet: true,
            ..ExchangeOptions::default()
        };
        let exchange = BinanceExchange::from_options(&options).unwrap();
        assert_eq!(exchange.endpoint(FeedKind::Ticker), BINANCE_TESTNET_WS_URL);

        let exchange = BinanceExchange::new().with_ws_url("ws://127.0.0.1:9000/stream");
        assert_eq!(exchange.endpoint(FeedKind::OrderBook), "ws://127.0.0.1:9000/stream");
    }

    #[tokio::test]
    async fn test_rest_queries_validate_symbol_first() {
        // Unroutable API url: validation must fail before any request
        let exchange = BinanceExchange::new().with_api_url("http://127.0.0.1:1");
        let bad = Symbol::new("BTC-USDT");

        let err = exchange.fetch_ticker(&bad).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidSymbol(_)));
        assert!(!err.is_retryable());

        let err = exchange
            .fetch_klines(&bad, KlineInterval::OneHour, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidSymbol(_)));
    }

    #[tokio::test]
    async fn test_unreachable_api_is_retryable() {
        let exchange = BinanceExchange::new().with_api_url("http://127.0.0.1:1");

        let err = exchange
            .fetch_snapshot(&Symbol::new("BTCUSDT"), 100)
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "unexpected {:?}", err);

        let err = exchange.fetch_symbols().await.unwrap_err();
        assert!(err.is_retryable(), "unexpected {:?}", err);
    }
}
