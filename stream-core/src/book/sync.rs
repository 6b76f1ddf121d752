// =================================================================
// book/sync.rs - Snapshot + Diff Consistency Engine
// =================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use stream_common::data::types::Symbol;
use tracing::{debug, warn};

use super::replica::{DepthDiff, DepthSnapshot, DiffCheck, OrderBookReplica};

/// Result of feeding one snapshot or diff into [`BookSync`]
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// No replica yet, the diff was held for replay
    Buffered,
    /// Snapshot applied and buffered diffs replayed
    Ready(Arc<OrderBookReplica>),
    /// Diff applied, a new version is published
    Applied(Arc<OrderBookReplica>),
    /// Diff already covered by the watermark
    Stale,
    /// Missed updates; the replica is gone until the next snapshot
    Gap { expected: u64, first_update_id: u64 },
}

/// Keeps one symbol's replica consistent with the exchange.
///
/// Every applied change produces a new `Arc` version via copy-on-write, so a
/// reader holding an older version never sees it change underneath.
#[derive(Debug)]
pub struct BookSync {
    symbol: Symbol,
    replica: Option<Arc<OrderBookReplica>>,
    pending: VecDeque<DepthDiff>,
    max_pending: usize,
    sequence: u64,
    evicted: u64,
}

impl BookSync {
    pub fn new(symbol: Symbol, max_pending: usize) -> Self {
        Self {
            symbol,
            replica: None,
            pending: VecDeque::new(),
            max_pending: max_pending.max(1),
            sequence: 0,
            evicted: 0,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn is_synced(&self) -> bool {
        self.replica.is_some()
    }

    pub fn current(&self) -> Option<Arc<OrderBookReplica>> {
        self.replica.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Diffs evicted from a full pending buffer
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn on_diff(&mut self, diff: DepthDiff) -> SyncOutcome {
        let Some(replica) = self.replica.as_mut() else {
            if self.pending.len() >= self.max_pending {
                // The replay will report the hole as a gap
                self.pending.pop_front();
                self.evicted += 1;
            }
            self.pending.push_back(diff);
            return SyncOutcome::Buffered;
        };

        match replica.check(&diff) {
            DiffCheck::Stale => {
                debug!(
                    "Stale diff for {} ignored: final {} <= watermark {}",
                    self.symbol,
                    diff.final_update_id,
                    replica.last_update_id()
                );
                SyncOutcome::Stale
            }
            DiffCheck::Gap { expected } => {
                warn!(
                    "Gap on {}: expected update {}, received {}",
                    self.symbol, expected, diff.first_update_id
                );
                self.invalidate();
                SyncOutcome::Gap {
                    expected,
                    first_update_id: diff.first_update_id,
                }
            }
            DiffCheck::Applicable => {
                self.sequence += 1;
                let next = Arc::make_mut(replica);
                next.apply_diff(&diff);
                next.set_sequence(self.sequence);
                SyncOutcome::Applied(Arc::clone(replica))
            }
        }
    }

    pub fn on_snapshot(&mut self, snapshot: DepthSnapshot) -> SyncOutcome {
        let mut replica = OrderBookReplica::from_snapshot(&snapshot);

        while let Some(diff) = self.pending.pop_front() {
            if let DiffCheck::Gap { expected } = replica.apply_diff(&diff) {
                warn!(
                    "Snapshot {} for {} does not line up with buffered diff {}",
                    snapshot.last_update_id, self.symbol, diff.first_update_id
                );
                self.invalidate();
                return SyncOutcome::Gap {
                    expected,
                    first_update_id: diff.first_update_id,
                };
            }
        }

        self.sequence += 1;
        replica.set_sequence(self.sequence);
        let replica = Arc::new(replica);
        self.replica = Some(Arc::clone(&replica));

        debug!(
            "Order book {} synced at update {}",
            self.symbol,
            replica.last_update_id()
        );
        SyncOutcome::Ready(replica)
    }

    /// Drop the replica and every buffered diff
    pub fn invalidate(&mut self) {
        self.replica = None;
        self.pending.clear();
    }
}
