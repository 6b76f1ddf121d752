// =================================================================
// data/types.rs - Normalized Market Data Types
// =================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Quote assets recognized when splitting a symbol, longest match first
const QUOTE_ASSETS: [&str; 7] = ["USDT", "USDC", "BUSD", "BTC", "ETH", "BNB", "USD"];

/// Errors raised while building or deriving values from market data
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("Validation error on '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

impl DataError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        DataError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Trading pair identifier, always stored upper-cased and trimmed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A symbol is valid when it is non-empty and purely alphanumeric
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.chars().all(|c| c.is_ascii_alphanumeric())
    }

    pub fn validate(&self) -> Result<(), DataError> {
        if self.0.is_empty() {
            return Err(DataError::validation("symbol", "symbol cannot be empty"));
        }
        if !self.is_valid() {
            return Err(DataError::validation(
                "symbol",
                format!("'{}' contains invalid characters", self.0),
            ));
        }
        Ok(())
    }

    /// Quote asset, if the symbol ends with a known one
    pub fn quote(&self) -> Option<&str> {
        QUOTE_ASSETS
            .iter()
            .find(|quote| self.0.len() > quote.len() && self.0.ends_with(*quote))
            .copied()
    }

    /// Base asset, derived by stripping the quote asset
    pub fn base(&self) -> Option<&str> {
        self.quote().map(|quote| &self.0[..self.0.len() - quote.len()])
    }

    pub fn to_lowercase(&self) -> String {
        self.0.to_lowercase()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Symbol {
    fn from(raw: String) -> Self {
        Symbol::new(raw)
    }
}

impl From<&str> for Symbol {
    fn from(raw: &str) -> Self {
        Symbol::new(raw)
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.0
    }
}

/// Taker side of a trade, or side of the book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" | "bid" => Ok(Side::Buy),
            "sell" | "ask" => Ok(Side::Sell),
            other => Err(DataError::validation(
                "side",
                format!("unknown side '{}'", other),
            )),
        }
    }
}

/// 24h rolling ticker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: Symbol,
    pub last_price: Decimal,
    pub bid_price: Decimal,
    pub bid_qty: Decimal,
    pub ask_price: Decimal,
    pub ask_qty: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub volume_24h: Decimal,
    pub quote_volume_24h: Decimal,
    pub price_change: Decimal,
    pub price_change_percent: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Ticker {
    pub fn spread(&self) -> Decimal {
        self.ask_price - self.bid_price
    }

    pub fn mid_price(&self) -> Decimal {
        (self.bid_price + self.ask_price) / Decimal::TWO
    }

    /// Spread as a percentage of the mid price
    pub fn spread_percent(&self) -> Result<Decimal, DataError> {
        let mid = self.mid_price();
        if mid.is_zero() {
            return Err(DataError::InvalidValue(
                "mid price is zero, spread percent undefined".to_string(),
            ));
        }
        Ok(self.spread() / mid * Decimal::ONE_HUNDRED)
    }
}

/// One price level of an order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }

    /// Notional value of the level
    pub fn value(&self) -> Decimal {
        self.price * self.quantity
    }
}

/// Consumer-facing view of an order book at one watermark.
///
/// Bids are sorted best (highest) first, asks best (lowest) first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: Symbol,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub last_update_id: u64,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / Decimal::TWO),
            _ => None,
        }
    }

    /// Number of bid and ask levels
    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }
}

/// Public trade print
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub symbol: Symbol,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
    pub is_buyer_maker: bool,
}

impl Trade {
    pub fn value(&self) -> Decimal {
        self.price * self.quantity
    }
}

/// Candle interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KlineInterval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "3m")]
    ThreeMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "2h")]
    TwoHours,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "8h")]
    EightHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "3d")]
    ThreeDays,
    #[serde(rename = "1w")]
    OneWeek,
    #[serde(rename = "1M")]
    OneMonth,
}

impl KlineInterval {
    pub const ALL: [KlineInterval; 15] = [
        KlineInterval::OneMinute,
        KlineInterval::ThreeMinutes,
        KlineInterval::FiveMinutes,
        KlineInterval::FifteenMinutes,
        KlineInterval::ThirtyMinutes,
        KlineInterval::OneHour,
        KlineInterval::TwoHours,
        KlineInterval::FourHours,
        KlineInterval::SixHours,
        KlineInterval::EightHours,
        KlineInterval::TwelveHours,
        KlineInterval::OneDay,
        KlineInterval::ThreeDays,
        KlineInterval::OneWeek,
        KlineInterval::OneMonth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KlineInterval::OneMinute => "1m",
            KlineInterval::ThreeMinutes => "3m",
            KlineInterval::FiveMinutes => "5m",
            KlineInterval::FifteenMinutes => "15m",
            KlineInterval::ThirtyMinutes => "30m",
            KlineInterval::OneHour => "1h",
            KlineInterval::TwoHours => "2h",
            KlineInterval::FourHours => "4h",
            KlineInterval::SixHours => "6h",
            KlineInterval::EightHours => "8h",
            KlineInterval::TwelveHours => "12h",
            KlineInterval::OneDay => "1d",
            KlineInterval::ThreeDays => "3d",
            KlineInterval::OneWeek => "1w",
            KlineInterval::OneMonth => "1M",
        }
    }
}

impl fmt::Display for KlineInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KlineInterval {
    type Err = DataError;

    // Case-sensitive: "1m" is a minute, "1M" is a month
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KlineInterval::ALL
            .iter()
            .find(|interval| interval.as_str() == s.trim())
            .copied()
            .ok_or_else(|| {
                DataError::validation("interval", format!("unsupported kline interval '{}'", s))
            })
    }
}

/// OHLCV candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: Symbol,
    pub interval: KlineInterval,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trade_count: u64,
    pub is_closed: bool,
}

impl Kline {
    pub fn change(&self) -> Decimal {
        self.close - self.open
    }

    pub fn change_percent(&self) -> Result<Decimal, DataError> {
        if self.open.is_zero() {
            return Err(DataError::InvalidValue(
                "open price is zero, change percent undefined".to_string(),
            ));
        }
        Ok(self.change() / self.open * Decimal::ONE_HUNDRED)
    }

    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    /// Volume weighted average price, None when nothing traded
    pub fn vwap(&self) -> Option<Decimal> {
        if self.volume.is_zero() {
            None
        } else {
            Some(self.quote_volume / self.volume)
        }
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}
