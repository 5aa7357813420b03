//! In-memory oracle state.
//!
//! Two symmetric per-chain stores, each owning its trade table, processing
//! set, and deferred event queues under a single lock, plus the shared
//! cross-chain pair table. All concurrency discipline for the trade state
//! lives here: callers interact through the operations, never the maps.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use alloy::primitives::{B256, U256};

use crate::chain::{ChainRole, TimeRequestEvent};

/// Oracle-local mirror of one swap leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeRecord {
    pub trade_id: U256,
    /// Oracle wall-clock seconds of the first stamp for this leg.
    pub inception_time: u64,
    /// Swap validity window, supplied by the contract event.
    pub duration: u64,
    /// Most recent oracle request id seen for this leg.
    pub last_request_id: B256,
    /// Oracle wall-clock seconds of that last request.
    pub last_request_time: u64,
    /// Set when the leg entered Confirmed.
    pub confirmation_time: Option<u64>,
    /// False until the second TimeRequestSent for this trade id.
    pub is_confirmation_phase: bool,
}

struct StoreInner {
    trades: HashMap<U256, TradeRecord>,
    processing: HashSet<U256>,
    deferred: HashMap<U256, VecDeque<TimeRequestEvent>>,
}

/// Per-chain trade state under one lock.
pub struct ChainStore {
    role: ChainRole,
    inner: Mutex<StoreInner>,
}

impl ChainStore {
    pub fn new(role: ChainRole) -> Self {
        Self {
            role,
            inner: Mutex::new(StoreInner {
                trades: HashMap::new(),
                processing: HashSet::new(),
                deferred: HashMap::new(),
            }),
        }
    }

    pub fn role(&self) -> ChainRole {
        self.role
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, trade_id: U256) -> Option<TradeRecord> {
        self.lock().trades.get(&trade_id).cloned()
    }

    pub fn insert(&self, record: TradeRecord) {
        self.lock().trades.insert(record.trade_id, record);
    }

    pub fn remove(&self, trade_id: U256) -> Option<TradeRecord> {
        self.lock().trades.remove(&trade_id)
    }

    /// Mutate a record in place; returns false when the record is gone.
    pub fn update(&self, trade_id: U256, f: impl FnOnce(&mut TradeRecord)) -> bool {
        let mut inner = self.lock();
        match inner.trades.get_mut(&trade_id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    /// Claim the processing slot for an incoming event, or defer it FIFO
    /// behind the handler that already owns the slot.
    ///
    /// Returns true when the caller now owns the slot and must process the
    /// event (and eventually call [`ChainStore::finish`]).
    pub fn begin_or_defer(&self, event: TimeRequestEvent) -> bool {
        let mut inner = self.lock();
        if inner.processing.contains(&event.trade_id) {
            inner
                .deferred
                .entry(event.trade_id)
                .or_default()
                .push_back(event);
            false
        } else {
            inner.processing.insert(event.trade_id);
            true
        }
    }

    /// Claim the processing slot with no event attached (sweeper, paired
    /// cancellation). Returns false when a handler currently owns it.
    pub fn try_begin(&self, trade_id: U256) -> bool {
        self.lock().processing.insert(trade_id)
    }

    /// Release the slot, or hand back the next deferred event.
    ///
    /// When `Some(event)` is returned the slot stays claimed and the caller
    /// must process that event and call `finish` again.
    pub fn finish(&self, trade_id: U256) -> Option<TimeRequestEvent> {
        let mut inner = self.lock();
        let next = inner
            .deferred
            .get_mut(&trade_id)
            .and_then(|queue| queue.pop_front());
        if next.is_none() {
            inner.deferred.remove(&trade_id);
            inner.processing.remove(&trade_id);
        }
        next
    }

    pub fn snapshot(&self) -> Vec<TradeRecord> {
        self.lock().trades.values().cloned().collect()
    }

    pub fn active_trade_ids(&self) -> Vec<U256> {
        let mut ids: Vec<U256> = self.lock().trades.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn trade_count(&self) -> usize {
        self.lock().trades.len()
    }

    pub fn pending_event_count(&self) -> usize {
        self.lock().deferred.values().map(VecDeque::len).sum()
    }

    pub fn processing_count(&self) -> usize {
        self.lock().processing.len()
    }

    /// Drop any deferred events for a trade that just went terminal.
    /// The on-chain state is authoritative; stale requests must not be
    /// replayed as fresh creations. Returns the number dropped.
    pub fn purge_deferred(&self, trade_id: U256) -> usize {
        self.lock()
            .deferred
            .remove(&trade_id)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }
}

/// Two legs bound by a shared trade id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossChainPair {
    pub asset_trade_id: U256,
    pub payment_trade_id: U256,
}

impl CrossChainPair {
    /// The trade id of the leg living on `role`'s chain.
    pub fn leg(&self, role: ChainRole) -> U256 {
        match role {
            ChainRole::Asset => self.asset_trade_id,
            ChainRole::Payment => self.payment_trade_id,
        }
    }
}

/// Shared map from trade id to its cross-chain pair.
pub struct PairTable {
    inner: Mutex<HashMap<U256, CrossChainPair>>,
}

impl Default for PairTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PairTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<U256, CrossChainPair>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bind(&self, asset_trade_id: U256, payment_trade_id: U256) {
        let pair = CrossChainPair {
            asset_trade_id,
            payment_trade_id,
        };
        let mut map = self.lock();
        map.insert(asset_trade_id, pair);
        map.insert(payment_trade_id, pair);
    }

    pub fn get(&self, trade_id: U256) -> Option<CrossChainPair> {
        self.lock().get(&trade_id).copied()
    }

    /// Remove the pair entry from both sides.
    pub fn clear(&self, trade_id: U256) {
        let mut map = self.lock();
        if let Some(pair) = map.remove(&trade_id) {
            map.remove(&pair.asset_trade_id);
            map.remove(&pair.payment_trade_id);
        }
    }

    pub fn snapshot(&self) -> Vec<CrossChainPair> {
        let map = self.lock();
        let mut pairs: Vec<CrossChainPair> = Vec::new();
        for pair in map.values() {
            if !pairs.contains(pair) {
                pairs.push(*pair);
            }
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(trade: u64, request: u8) -> TimeRequestEvent {
        TimeRequestEvent {
            request_id: B256::repeat_byte(request),
            trade_id: U256::from(trade),
            duration: 3600,
            block_number: 1,
            block_timestamp: 0,
        }
    }

    #[test]
    fn idle_trade_begins_immediately() {
        let store = ChainStore::new(ChainRole::Asset);
        assert!(store.begin_or_defer(event(42, 1)));
        assert_eq!(store.pending_event_count(), 0);
    }

    #[test]
    fn busy_trade_defers_fifo() {
        let store = ChainStore::new(ChainRole::Asset);
        assert!(store.begin_or_defer(event(42, 1)));
        assert!(!store.begin_or_defer(event(42, 2)));
        assert!(!store.begin_or_defer(event(42, 3)));
        assert_eq!(store.pending_event_count(), 2);

        let next = store.finish(U256::from(42)).expect("first deferred");
        assert_eq!(next.request_id, B256::repeat_byte(2));
        let next = store.finish(U256::from(42)).expect("second deferred");
        assert_eq!(next.request_id, B256::repeat_byte(3));
        assert!(store.finish(U256::from(42)).is_none());

        // slot released: a new event begins immediately
        assert!(store.begin_or_defer(event(42, 4)));
    }

    #[test]
    fn distinct_trades_do_not_contend() {
        let store = ChainStore::new(ChainRole::Payment);
        assert!(store.begin_or_defer(event(1, 1)));
        assert!(store.begin_or_defer(event(2, 2)));
    }

    #[test]
    fn try_begin_respects_held_slot() {
        let store = ChainStore::new(ChainRole::Asset);
        assert!(store.try_begin(U256::from(7)));
        assert!(!store.try_begin(U256::from(7)));
        assert!(store.finish(U256::from(7)).is_none());
        assert!(store.try_begin(U256::from(7)));
    }

    #[test]
    fn update_mutates_in_place() {
        let store = ChainStore::new(ChainRole::Asset);
        store.insert(TradeRecord {
            trade_id: U256::from(42),
            inception_time: 100,
            duration: 3600,
            last_request_id: B256::repeat_byte(1),
            last_request_time: 100,
            confirmation_time: None,
            is_confirmation_phase: false,
        });

        assert!(store.update(U256::from(42), |r| {
            r.confirmation_time = Some(220);
            r.is_confirmation_phase = true;
        }));
        let record = store.get(U256::from(42)).unwrap();
        assert_eq!(record.confirmation_time, Some(220));
        assert!(!store.update(U256::from(99), |_| {}));
    }

    #[test]
    fn pair_table_clears_both_sides() {
        let pairs = PairTable::new();
        pairs.bind(U256::from(42), U256::from(42));
        assert!(pairs.get(U256::from(42)).is_some());

        pairs.clear(U256::from(42));
        assert!(pairs.get(U256::from(42)).is_none());
        assert!(pairs.snapshot().is_empty());
    }
}
