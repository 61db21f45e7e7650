//! SierraDB - snapshot-isolation core for a distributed SQL engine over a
//! partitioned key-value store.
//!
//! Every transaction sees a consistent view of data as of its begin
//! timestamp, without readers locking against writers. Write conflicts
//! resolve first-committer-wins; deletion is expressed as tombstones;
//! resolved transaction outcomes are rolled forward into cell metadata by
//! background workers.
//!
//! # Quick start
//!
//! ```
//! use sierradb::SiCore;
//!
//! let core = SiCore::builder("orders").build();
//!
//! let txn = core.begin()?;
//! core.put(txn.id(), b"row-1".to_vec(), b"hello".to_vec())?;
//! core.commit(txn.id())?;
//!
//! let reader = core.begin()?;
//! assert_eq!(core.get(reader.id(), b"row-1")?, Some(b"hello".to_vec()));
//! # Ok::<(), sierradb::SiError>(())
//! ```
//!
//! # Architecture
//!
//! [`SiCore`] wires the layers together: a [`Region`] hosts the versioned
//! cells and invokes the snapshot-isolation observer at every boundary;
//! the observer consults the transaction store (behind a
//! completed-transaction cache) and feeds the roll-forward queue. Each
//! layer is usable on its own through the `sierra-*` crates.

pub use sierra_core::{
    Cell, CellMeta, CellValue, IsolationLevel, RowKey, SiError, SiResult, TxnId, TxnState,
    TxnView,
};
pub use sierra_encoding::{DecodedRow, EncodingError, FieldKind, FieldValue, RowEncoder, RowLayout};
pub use sierra_si::{PartitionState, RollForwardConfig, RollForwardStats};
pub use sierra_storage::Region;
pub use sierra_txn::CacheStats;

use sierra_core::{
    BackupCoordinator, DeleteRequest, GetRequest, PutRequest, RegionHost, ScanRequest, TxnStore,
};
use sierra_si::{
    HostRollForwardAction, InMemoryBackupCoordinator, PartitionStateMachine, RollForwardQueue,
    SiObserver,
};
use sierra_txn::{
    CompletedTxnCache, InMemoryTxnStore, MonotonicTimestampSource, TxnLifecycleManager,
};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Configures and builds an [`SiCore`].
pub struct SiCoreBuilder {
    partition: String,
    cache_capacity: usize,
    cache_shards: usize,
    rollforward: RollForwardConfig,
    maintenance_wait: Duration,
    backup: Option<Arc<dyn BackupCoordinator>>,
    start_timestamp: u64,
}

impl SiCoreBuilder {
    fn new(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            cache_capacity: CompletedTxnCache::DEFAULT_CAPACITY,
            cache_shards: CompletedTxnCache::DEFAULT_SHARDS,
            rollforward: RollForwardConfig::default(),
            maintenance_wait: Duration::from_secs(30),
            backup: None,
            start_timestamp: 0,
        }
    }

    /// Completed-transaction cache capacity and shard count.
    pub fn cache(mut self, capacity: usize, shards: usize) -> Self {
        self.cache_capacity = capacity;
        self.cache_shards = shards;
        self
    }

    /// Roll-forward queue tuning.
    pub fn rollforward(mut self, config: RollForwardConfig) -> Self {
        self.rollforward = config;
        self
    }

    /// Bound on how long flush/compact/split wait for the partition.
    pub fn maintenance_wait(mut self, wait: Duration) -> Self {
        self.maintenance_wait = wait;
        self
    }

    /// External backup coordinator. Defaults to a process-local one.
    pub fn backup(mut self, backup: Arc<dyn BackupCoordinator>) -> Self {
        self.backup = Some(backup);
        self
    }

    /// Resume timestamp allocation above a persisted high-water mark.
    pub fn start_timestamp(mut self, start: u64) -> Self {
        self.start_timestamp = start;
        self
    }

    pub fn build(self) -> SiCore {
        let timestamps = Arc::new(MonotonicTimestampSource::with_start(self.start_timestamp));
        let authoritative: Arc<dyn TxnStore> = Arc::new(InMemoryTxnStore::new());
        let cache = Arc::new(CompletedTxnCache::with_capacity(
            authoritative,
            self.cache_capacity,
            self.cache_shards,
        ));
        let store: Arc<dyn TxnStore> = Arc::clone(&cache) as Arc<dyn TxnStore>;
        let lifecycle = Arc::new(TxnLifecycleManager::new(timestamps, Arc::clone(&store)));
        let backup = self
            .backup
            .unwrap_or_else(|| Arc::new(InMemoryBackupCoordinator::new()));

        let mut installed = None;
        let region = Arc::new_cyclic(|weak: &Weak<Region>| {
            let host: Weak<dyn RegionHost> = weak.clone();
            let queue = Arc::new(RollForwardQueue::new(
                Box::new(HostRollForwardAction::new(Arc::clone(&store), host)),
                self.rollforward.clone(),
            ));
            let state = PartitionStateMachine::new(
                self.partition.clone(),
                Arc::clone(&backup),
                self.maintenance_wait,
            );
            let observer = Arc::new(SiObserver::new(
                Arc::clone(&lifecycle),
                Arc::clone(&store),
                queue,
                state,
            ));
            installed = Some(Arc::clone(&observer));
            Region::new(self.partition.clone()).with_observer(observer)
        });
        let observer = installed.expect("observer installed during region construction");

        SiCore {
            region,
            lifecycle,
            observer,
            cache,
        }
    }
}

/// Combined metrics snapshot.
#[derive(Debug, Clone, Copy)]
pub struct CoreStats {
    /// Completed-transaction cache counters.
    pub cache: CacheStats,
    /// Roll-forward queue counters.
    pub rollforward: RollForwardStats,
    /// In-flight transactions.
    pub active_txns: usize,
    /// Rows with at least one stored version.
    pub rows: usize,
    /// Stored versions across all rows.
    pub cells: usize,
}

/// One partition's snapshot-isolation engine, fully wired.
pub struct SiCore {
    region: Arc<Region>,
    lifecycle: Arc<TxnLifecycleManager>,
    observer: Arc<SiObserver>,
    cache: Arc<CompletedTxnCache>,
}

impl SiCore {
    pub fn builder(partition: impl Into<String>) -> SiCoreBuilder {
        SiCoreBuilder::new(partition)
    }

    /// Start a transaction at the default isolation level.
    pub fn begin(&self) -> SiResult<TxnView> {
        self.lifecycle.begin()
    }

    /// Start a transaction with an explicit parent and isolation level.
    pub fn begin_with(
        &self,
        parent: Option<TxnId>,
        isolation: IsolationLevel,
    ) -> SiResult<TxnView> {
        self.lifecycle.begin_with(parent, isolation)
    }

    /// Commit, returning the commit timestamp. Idempotent.
    pub fn commit(&self, id: TxnId) -> SiResult<u64> {
        self.lifecycle.commit(id)
    }

    /// Roll back. Idempotent.
    pub fn rollback(&self, id: TxnId) -> SiResult<()> {
        self.lifecycle.rollback(id)
    }

    /// Write a value under a transaction.
    pub fn put(&self, txn: TxnId, row: RowKey, value: Vec<u8>) -> SiResult<()> {
        self.region.put(PutRequest {
            row,
            txn,
            value: CellValue::Data(value),
        })
    }

    /// Delete a row by writing a tombstone under the transaction.
    pub fn put_tombstone(&self, txn: TxnId, row: RowKey) -> SiResult<()> {
        self.region.put(PutRequest {
            row,
            txn,
            value: CellValue::Tombstone,
        })
    }

    /// Direct physical delete. Always rejected by the snapshot-isolation
    /// observer; present so callers get the canonical error.
    pub fn delete(&self, txn: TxnId, row: RowKey) -> SiResult<()> {
        self.region.delete(DeleteRequest { row, txn })
    }

    /// Transactional point read. Tombstones read as absence.
    pub fn get(&self, txn: TxnId, row: &[u8]) -> SiResult<Option<Vec<u8>>> {
        let cell = self.region.get(GetRequest::new(row.to_vec(), txn))?;
        Ok(match cell {
            Some(Cell {
                value: CellValue::Data(bytes),
                ..
            }) => Some(bytes),
            _ => None,
        })
    }

    /// Transactional range read over `[start, end)`. Rows whose visible
    /// version is a tombstone are omitted.
    pub fn scan(
        &self,
        txn: TxnId,
        start: RowKey,
        end: Option<RowKey>,
    ) -> SiResult<Vec<(RowKey, Vec<u8>)>> {
        let cells = self.region.scan(ScanRequest::new(start, end, txn))?;
        Ok(cells
            .into_iter()
            .filter_map(|(row, cell)| match cell.value {
                CellValue::Data(bytes) => Some((row, bytes)),
                CellValue::Tombstone => None,
            })
            .collect())
    }

    /// Flush the partition (blocks on an existing backup marker).
    pub fn flush(&self) -> SiResult<()> {
        self.region.flush()
    }

    /// Compact the partition, returning the number of cells removed.
    pub fn compact(&self) -> SiResult<usize> {
        self.region.compact()
    }

    /// Split the partition at `split_key`, returning the upper-range
    /// sibling region. The sibling shares this core's observer.
    pub fn split(&self, split_key: &[u8], new_name: impl Into<String>) -> SiResult<Region> {
        self.region.split(split_key, new_name)
    }

    /// Answer a backup-prepare request for this partition.
    pub fn prepare_backup(&self) -> SiResult<()> {
        self.observer.prepare_backup()
    }

    /// Finish an in-progress backup.
    pub fn complete_backup(&self) {
        self.observer.complete_backup()
    }

    /// Oldest begin timestamp among active transactions.
    pub fn low_watermark(&self) -> u64 {
        self.lifecycle.low_watermark()
    }

    /// Current partition maintenance state.
    pub fn partition_state(&self) -> PartitionState {
        self.observer.partition_state()
    }

    /// Block until the roll-forward queue has processed its ready backlog.
    pub fn drain_rollforward(&self) {
        self.observer.rollforward().drain()
    }

    /// Combined metrics snapshot.
    pub fn stats(&self) -> CoreStats {
        CoreStats {
            cache: self.cache.stats(),
            rollforward: self.observer.rollforward().stats(),
            active_txns: self.lifecycle.active_count(),
            rows: self.region.row_count(),
            cells: self.region.cell_count(),
        }
    }

    /// The hosting region, for direct inspection.
    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    /// The transaction store behind the cache.
    pub fn txn_store(&self) -> Arc<dyn TxnStore> {
        Arc::clone(&self.cache) as Arc<dyn TxnStore>
    }
}
