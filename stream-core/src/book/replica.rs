// =================================================================
// book/replica.rs - Local Order Book Replica
// =================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use stream_common::data::types::{OrderBook, PriceLevel, Symbol};

/// Full authoritative book state at `last_update_id`
#[derive(Debug, Clone, PartialEq)]
pub struct DepthSnapshot {
    pub symbol: Symbol,
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Incremental update covering `[first_update_id, final_update_id]`
#[derive(Debug, Clone, PartialEq)]
pub struct DepthDiff {
    pub symbol: Symbol,
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub event_time: DateTime<Utc>,
}

/// How a diff relates to the replica's watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffCheck {
    /// first <= last + 1 <= final
    Applicable,
    /// final <= last, already reflected in the replica
    Stale,
    /// first > last + 1, updates were missed
    Gap { expected: u64 },
}

/// Sorted price levels plus the update watermark.
///
/// Bids iterate best (highest) first, asks best (lowest) first. A level with
/// zero quantity is never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBookReplica {
    symbol: Symbol,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_update_id: u64,
    sequence: u64,
    updated_at: DateTime<Utc>,
}

impl OrderBookReplica {
    pub fn from_snapshot(snapshot: &DepthSnapshot) -> Self {
        let mut replica = Self {
            symbol: snapshot.symbol.clone(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: snapshot.last_update_id,
            sequence: 1,
            updated_at: Utc::now(),
        };
        upsert_levels(&mut replica.bids, &snapshot.bids);
        upsert_levels(&mut replica.asks, &snapshot.asks);
        replica
    }

    pub fn check(&self, diff: &DepthDiff) -> DiffCheck {
        let expected = self.last_update_id + 1;
        if diff.final_update_id <= self.last_update_id {
            DiffCheck::Stale
        } else if diff.first_update_id > expected {
            DiffCheck::Gap { expected }
        } else {
            DiffCheck::Applicable
        }
    }

    /// Apply `diff` if it is contiguous with the watermark.
    ///
    /// Stale and gapped diffs leave the replica untouched.
    pub fn apply_diff(&mut self, diff: &DepthDiff) -> DiffCheck {
        let check = self.check(diff);
        if check == DiffCheck::Applicable {
            upsert_levels(&mut self.bids, &diff.bids);
            upsert_levels(&mut self.asks, &diff.asks);
            self.last_update_id = diff.final_update_id;
            self.sequence += 1;
            self.updated_at = diff.event_time;
        }
        check
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn bids(&self) -> impl Iterator<Item = PriceLevel> + '_ {
        self.bids
            .iter()
            .rev()
            .map(|(price, quantity)| PriceLevel::new(*price, *quantity))
    }

    pub fn asks(&self) -> impl Iterator<Item = PriceLevel> + '_ {
        self.asks
            .iter()
            .map(|(price, quantity)| PriceLevel::new(*price, *quantity))
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids().next()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks().next()
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        Some((self.best_ask()?.price + self.best_bid()?.price) / Decimal::TWO)
    }

    /// Number of bid and ask levels
    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    /// Consumer view truncated to `limit` levels per side
    pub fn to_order_book(&self, limit: Option<usize>) -> OrderBook {
        let limit = limit.unwrap_or(usize::MAX);
        OrderBook {
            symbol: self.symbol.clone(),
            bids: self.bids().take(limit).collect(),
            asks: self.asks().take(limit).collect(),
            last_update_id: self.last_update_id,
            sequence: self.sequence,
            timestamp: self.updated_at,
        }
    }
}

fn upsert_levels(side: &mut BTreeMap<Decimal, Decimal>, levels: &[PriceLevel]) {
    for level in levels {
        if level.quantity.is_zero() {
            side.remove(&level.price);
        } else {
            side.insert(level.price, level.quantity);
        }
    }
}
