//! LRU cache of completed transactions, layered over a backing store.
//!
//! Transaction lookups dominate the read path: every unresolved cell a
//! reader encounters costs a store lookup. Terminal transactions never
//! change, so their views can be cached forever; active transactions are
//! never cached because their state is still in flight.
//!
//! The cache is an explicit [`TxnStore`] decorator. Callers that want
//! caching compose it over the authoritative store; nothing is hidden
//! behind the store itself.

use parking_lot::Mutex;
use sierra_core::{
    SiResult, TransitionOutcome, Txn, TxnId, TxnStore, TxnTransition, TxnView,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters exposed by [`CompletedTxnCache::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the cache without touching the backing store.
    pub hits: u64,
    /// Lookups that fell through to the backing store.
    pub misses: u64,
    /// Views currently cached.
    pub entries: usize,
}

struct LruEntry {
    key: TxnId,
    view: TxnView,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Index-based intrusive LRU list. Entries live in a slab so links are
/// plain indices rather than pointers.
struct LruShard {
    capacity: usize,
    map: HashMap<TxnId, usize>,
    entries: Vec<Option<LruEntry>>,
    free_list: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl LruShard {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::with_capacity(capacity),
            entries: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn get(&mut self, key: &TxnId) -> Option<&TxnView> {
        if let Some(&index) = self.map.get(key) {
            self.move_to_front(index);
            self.entries[index].as_ref().map(|e| &e.view)
        } else {
            None
        }
    }

    /// Lookup that does not refresh recency. Used by presence probes so
    /// that instrumentation does not perturb eviction order.
    fn peek(&self, key: &TxnId) -> bool {
        self.map.contains_key(key)
    }

    fn put(&mut self, key: TxnId, view: TxnView) {
        if let Some(&index) = self.map.get(&key) {
            if let Some(entry) = &mut self.entries[index] {
                entry.view = view;
            }
            self.move_to_front(index);
        } else {
            if self.map.len() >= self.capacity {
                self.evict();
            }
            let index = self.allocate(key, view);
            self.map.insert(key, index);
            self.push_front(index);
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn allocate(&mut self, key: TxnId, view: TxnView) -> usize {
        let entry = LruEntry {
            key,
            view,
            prev: None,
            next: None,
        };
        if let Some(index) = self.free_list.pop() {
            self.entries[index] = Some(entry);
            index
        } else {
            self.entries.push(Some(entry));
            self.entries.len() - 1
        }
    }

    fn push_front(&mut self, index: usize) {
        if let Some(entry) = &mut self.entries[index] {
            entry.prev = None;
            entry.next = self.head;
        }
        if let Some(old_head) = self.head {
            if let Some(entry) = &mut self.entries[old_head] {
                entry.prev = Some(index);
            }
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = match &self.entries[index] {
            Some(entry) => (entry.prev, entry.next),
            None => return,
        };

        match prev {
            Some(prev_index) => {
                if let Some(entry) = &mut self.entries[prev_index] {
                    entry.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(next_index) => {
                if let Some(entry) = &mut self.entries[next_index] {
                    entry.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn move_to_front(&mut self, index: usize) {
        if self.head == Some(index) {
            return;
        }
        self.unlink(index);
        self.push_front(index);
    }

    fn evict(&mut self) {
        if let Some(tail_index) = self.tail {
            self.unlink(tail_index);
            if let Some(entry) = self.entries[tail_index].take() {
                self.map.remove(&entry.key);
            }
            self.free_list.push(tail_index);
        }
    }
}

/// Caching decorator over a [`TxnStore`].
///
/// Contracts:
/// - Only terminal transactions are ever cached; an `Active` view always
///   falls through to the backing store.
/// - A cache hit never touches the backing store.
/// - Cached views are materialized with their destination tables, so one
///   entry serves both lookup shapes.
///
/// The cache fills on the lookup path only. There is no single-flight
/// guard: concurrent misses on the same id each hit the backing store once
/// and the last insert wins, which is harmless because terminal views are
/// immutable.
pub struct CompletedTxnCache {
    inner: Arc<dyn TxnStore>,
    shards: Vec<Mutex<LruShard>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CompletedTxnCache {
    /// Default total capacity, split across shards.
    pub const DEFAULT_CAPACITY: usize = 1 << 16;
    /// Default shard count; bounds lock contention on the hot read path.
    pub const DEFAULT_SHARDS: usize = 16;

    pub fn new(inner: Arc<dyn TxnStore>) -> Self {
        Self::with_capacity(inner, Self::DEFAULT_CAPACITY, Self::DEFAULT_SHARDS)
    }

    /// Create a cache with an explicit capacity and shard count. Capacity
    /// is divided evenly across shards.
    pub fn with_capacity(inner: Arc<dyn TxnStore>, capacity: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        let per_shard = (capacity / shards).max(1);
        Self {
            inner,
            shards: (0..shards).map(|_| Mutex::new(LruShard::new(per_shard))).collect(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Hit/miss counters and current entry count.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.shards.iter().map(|s| s.lock().len()).sum(),
        }
    }

    fn shard(&self, id: TxnId) -> &Mutex<LruShard> {
        &self.shards[id.raw() as usize % self.shards.len()]
    }
}

impl TxnStore for CompletedTxnCache {
    fn record_new_transaction(&self, txn: Txn) -> SiResult<()> {
        self.inner.record_new_transaction(txn)
    }

    fn get_transaction(&self, id: TxnId, _fetch_destination_tables: bool) -> SiResult<TxnView> {
        if let Some(view) = self.shard(id).lock().get(&id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(view.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // Cached entries always carry destination tables so one entry can
        // serve every caller.
        let view = self.inner.get_transaction(id, true)?;
        if view.state().is_terminal() {
            self.shard(id).lock().put(id, view.clone());
        }
        Ok(view)
    }

    fn register_destination_table(&self, id: TxnId, table: Vec<u8>) -> SiResult<()> {
        // Only active transactions register tables, and actives are never
        // cached, so there is no entry to invalidate.
        self.inner.register_destination_table(id, table)
    }

    fn get_transaction_from_cache(&self, id: TxnId) -> Option<TxnView> {
        match self.shard(id).lock().get(&id) {
            Some(view) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(view.clone())
            }
            None => None,
        }
    }

    fn transaction_cached(&self, id: TxnId) -> bool {
        self.shard(id).lock().peek(&id)
    }

    fn transition(&self, id: TxnId, transition: TxnTransition) -> SiResult<TransitionOutcome> {
        self.inner.transition(id, transition)
    }
}
