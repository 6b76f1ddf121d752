// =================================================================
// exchange/utils.rs - Utility Functions
// =================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use stream_common::data::types::{
    Kline, KlineInterval, PriceLevel, Side, Symbol, Ticker, Trade,
};

use super::types::{
    BinanceDepthSnapshot, BinanceDepthUpdate, BinanceExchangeInfo, BinanceKlineMessage,
    BinanceRestKline, BinanceRestTicker, BinanceRestTrade, BinanceTickerMessage,
    BinanceTradeMessage,
};
use super::ExchangeError;
use crate::book::{DepthDiff, DepthSnapshot};
use crate::stream::{FeedKind, FeedParam, SubscriptionKey};

/// Diff depth update speed requested from Binance
const DEPTH_UPDATE_SPEED: &str = "100ms";

fn parse_decimal(field: &str, value: &str) -> Result<Decimal, ExchangeError> {
    Decimal::from_str(value)
        .map_err(|e| ExchangeError::ParseError(format!("Invalid {} '{}': {}", field, value, e)))
}

fn timestamp_from_millis(millis: i64) -> Result<DateTime<Utc>, ExchangeError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| ExchangeError::ParseError("Invalid timestamp".to_string()))
}

/// Parse `[price, quantity]` pairs; zero quantities are kept as removals
pub fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<PriceLevel>, ExchangeError> {
    raw.iter()
        .map(|[price, quantity]| {
            let price = parse_decimal("price", price)?;
            let quantity = parse_decimal("quantity", quantity)?;
            if price <= Decimal::ZERO || quantity < Decimal::ZERO {
                return Err(ExchangeError::ParseError(format!(
                    "Invalid level {} @ {}",
                    quantity, price
                )));
            }
            Ok(PriceLevel::new(price, quantity))
        })
        .collect()
}

/// Convert Binance trade message to the normalized Trade
pub fn convert_trade(msg: BinanceTradeMessage) -> Result<Trade, ExchangeError> {
    let timestamp = timestamp_from_millis(msg.trade_time as i64)?;
    let price = parse_decimal("price", &msg.price)?;
    let quantity = parse_decimal("quantity", &msg.quantity)?;

    if price <= Decimal::ZERO {
        return Err(ExchangeError::ParseError("Price must be positive".to_string()));
    }

    if quantity <= Decimal::ZERO {
        return Err(ExchangeError::ParseError("Quantity must be positive".to_string()));
    }

    // If buyer is maker, a sell order was the taker
    let side = if msg.is_buyer_maker {
        Side::Sell
    } else {
        Side::Buy
    };

    Ok(Trade {
        id: msg.trade_id.to_string(),
        symbol: Symbol::new(&msg.symbol),
        price,
        quantity,
        side,
        timestamp,
        is_buyer_maker: msg.is_buyer_maker,
    })
}

pub fn convert_ticker(msg: BinanceTickerMessage) -> Result<Ticker, ExchangeError> {
    Ok(Ticker {
        symbol: Symbol::new(&msg.symbol),
        last_price: parse_decimal("last price", &msg.last_price)?,
        bid_price: parse_decimal("bid price", &msg.bid_price)?,
        bid_qty: parse_decimal("bid quantity", &msg.bid_qty)?,
        ask_price: parse_decimal("ask price", &msg.ask_price)?,
        ask_qty: parse_decimal("ask quantity", &msg.ask_qty)?,
        high_24h: parse_decimal("high", &msg.high_price)?,
        low_24h: parse_decimal("low", &msg.low_price)?,
        volume_24h: parse_decimal("volume", &msg.volume)?,
        quote_volume_24h: parse_decimal("quote volume", &msg.quote_volume)?,
        price_change: parse_decimal("price change", &msg.price_change)?,
        price_change_percent: parse_decimal("price change percent", &msg.price_change_percent)?,
        timestamp: timestamp_from_millis(msg.event_time as i64)?,
    })
}

pub fn convert_kline(msg: BinanceKlineMessage) -> Result<Kline, ExchangeError> {
    let k = msg.kline;
    let interval = KlineInterval::from_str(&k.interval)
        .map_err(|e| ExchangeError::ParseError(e.to_string()))?;

    Ok(Kline {
        symbol: Symbol::new(&msg.symbol),
        interval,
        open_time: timestamp_from_millis(k.open_time)?,
        close_time: timestamp_from_millis(k.close_time)?,
        open: parse_decimal("open", &k.open)?,
        high: parse_decimal("high", &k.high)?,
        low: parse_decimal("low", &k.low)?,
        close: parse_decimal("close", &k.close)?,
        volume: parse_decimal("volume", &k.volume)?,
        quote_volume: parse_decimal("quote volume", &k.quote_volume)?,
        trade_count: k.trade_count,
        is_closed: k.is_closed,
    })
}

pub fn convert_depth_update(msg: BinanceDepthUpdate) -> Result<DepthDiff, ExchangeError> {
    if msg.first_update_id > msg.final_update_id {
        return Err(ExchangeError::ParseError(format!(
            "Depth update range {}..{} is inverted",
            msg.first_update_id, msg.final_update_id
        )));
    }

    Ok(DepthDiff {
        symbol: Symbol::new(&msg.symbol),
        first_update_id: msg.first_update_id,
        final_update_id: msg.final_update_id,
        bids: parse_levels(&msg.bids)?,
        asks: parse_levels(&msg.asks)?,
        event_time: timestamp_from_millis(msg.event_time)?,
    })
}

pub fn convert_depth_snapshot(
    symbol: &Symbol,
    msg: BinanceDepthSnapshot,
) -> Result<DepthSnapshot, ExchangeError> {
    Ok(DepthSnapshot {
        symbol: symbol.clone(),
        last_update_id: msg.last_update_id,
        bids: parse_levels(&msg.bids)?,
        asks: parse_levels(&msg.asks)?,
    })
}

pub fn convert_rest_ticker(msg: BinanceRestTicker) -> Result<Ticker, ExchangeError> {
    Ok(Ticker {
        symbol: Symbol::new(&msg.symbol),
        last_price: parse_decimal("last price", &msg.last_price)?,
        bid_price: parse_decimal("bid price", &msg.bid_price)?,
        bid_qty: parse_decimal("bid quantity", &msg.bid_qty)?,
        ask_price: parse_decimal("ask price", &msg.ask_price)?,
        ask_qty: parse_decimal("ask quantity", &msg.ask_qty)?,
        high_24h: parse_decimal("high", &msg.high_price)?,
        low_24h: parse_decimal("low", &msg.low_price)?,
        volume_24h: parse_decimal("volume", &msg.volume)?,
        quote_volume_24h: parse_decimal("quote volume", &msg.quote_volume)?,
        price_change: parse_decimal("price change", &msg.price_change)?,
        price_change_percent: parse_decimal("price change percent", &msg.price_change_percent)?,
        timestamp: timestamp_from_millis(msg.close_time)?,
    })
}

pub fn convert_rest_trade(symbol: &Symbol, msg: BinanceRestTrade) -> Result<Trade, ExchangeError> {
    let side = if msg.is_buyer_maker {
        Side::Sell
    } else {
        Side::Buy
    };

    Ok(Trade {
        id: msg.id.to_string(),
        symbol: symbol.clone(),
        price: parse_decimal("price", &msg.price)?,
        quantity: parse_decimal("quantity", &msg.qty)?,
        side,
        timestamp: timestamp_from_millis(msg.time)?,
        is_buyer_maker: msg.is_buyer_maker,
    })
}

/// Rows from the klines endpoint are always closed unless they are the current bar
pub fn convert_rest_kline(
    symbol: &Symbol,
    interval: KlineInterval,
    row: BinanceRestKline,
    now: DateTime<Utc>,
) -> Result<Kline, ExchangeError> {
    let close_time = timestamp_from_millis(row.6)?;

    Ok(Kline {
        symbol: symbol.clone(),
        interval,
        open_time: timestamp_from_millis(row.0)?,
        close_time,
        open: parse_decimal("open", &row.1)?,
        high: parse_decimal("high", &row.2)?,
        low: parse_decimal("low", &row.3)?,
        close: parse_decimal("close", &row.4)?,
        volume: parse_decimal("volume", &row.5)?,
        quote_volume: parse_decimal("quote volume", &row.7)?,
        trade_count: row.8,
        is_closed: close_time < now,
    })
}

/// Symbols with status TRADING
pub fn trading_symbols(info: BinanceExchangeInfo) -> Vec<Symbol> {
    info.symbols
        .into_iter()
        .filter(|s| s.status == "TRADING")
        .map(|s| Symbol::new(&s.symbol))
        .collect()
}

/// Validate symbol format for Binance
pub fn validate_binance_symbol(symbol: &str) -> Result<String, ExchangeError> {
    if symbol.is_empty() {
        return Err(ExchangeError::InvalidSymbol("Symbol cannot be empty".to_string()));
    }

    let symbol = symbol.to_uppercase();

    if !symbol.chars().all(char::is_alphanumeric) {
        return Err(ExchangeError::InvalidSymbol(format!(
            "Symbol '{}' contains invalid characters",
            symbol
        )));
    }

    if symbol.len() < 3 || symbol.len() > 20 {
        return Err(ExchangeError::InvalidSymbol(format!(
            "Symbol '{}' has invalid length",
            symbol
        )));
    }

    Ok(symbol)
}

/// Binance stream name for a subscription, e.g. "btcusdt@kline_1m"
pub fn build_stream_name(key: &SubscriptionKey) -> String {
    let symbol = key.symbol.to_lowercase();
    match (key.kind, key.param) {
        (FeedKind::Ticker, _) => format!("{}@ticker", symbol),
        (FeedKind::Trade, _) => format!("{}@trade", symbol),
        (FeedKind::Kline, FeedParam::Interval(interval)) => {
            format!("{}@kline_{}", symbol, interval)
        }
        (FeedKind::Kline, _) => format!("{}@kline_{}", symbol, KlineInterval::OneMinute),
        (FeedKind::OrderBook, _) => format!("{}@depth@{}", symbol, DEPTH_UPDATE_SPEED),
    }
}
