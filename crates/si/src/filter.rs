//! Per-version visibility filtering for snapshot reads.

use crate::rollforward::RollForwardQueue;
use sierra_core::{
    Cell, CellMeta, FilterDecision, IsolationLevel, SiError, SiResult, TxnId, TxnState, TxnStore,
    TxnView, VersionFilter,
};
use std::sync::Arc;

/// Visibility predicate for one reading transaction.
///
/// A committed version is visible under snapshot isolation iff its commit
/// timestamp is at or before the reader's begin timestamp; the reader's
/// own writes are always visible; active and rolled-back writers are
/// visible to nobody else. Cells whose metadata has not yet been rolled
/// forward are resolved against the transaction store, and the resolution
/// is handed to the roll-forward queue so the next reader finds it already
/// written into the cell.
pub struct SiFilter {
    store: Arc<dyn TxnStore>,
    queue: Arc<RollForwardQueue>,
    reader: TxnView,
}

impl SiFilter {
    pub fn new(store: Arc<dyn TxnStore>, queue: Arc<RollForwardQueue>, reader: TxnView) -> Self {
        Self {
            store,
            queue,
            reader,
        }
    }

    fn enqueue_rollforward(&self, txn: TxnId, row: &[u8]) {
        self.queue.enqueue(txn, std::iter::once(row.to_vec()));
    }

    fn committed_visible(&self, commit_ts: u64) -> FilterDecision {
        match self.reader.isolation() {
            IsolationLevel::SnapshotIsolation => {
                if commit_ts <= self.reader.begin_ts() {
                    FilterDecision::Include
                } else {
                    FilterDecision::Skip
                }
            }
            // Relaxed levels accept any committed version.
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                FilterDecision::Include
            }
        }
    }
}

impl VersionFilter for SiFilter {
    fn check(&self, row: &[u8], cell: &Cell) -> SiResult<FilterDecision> {
        match cell.meta {
            CellMeta::Committed { commit_ts, .. } => Ok(self.committed_visible(commit_ts)),
            CellMeta::RolledBack { .. } => Ok(FilterDecision::Skip),
            CellMeta::Unresolved { txn } => {
                if txn == self.reader.id() {
                    // Own writes are visible regardless of resolution.
                    return Ok(FilterDecision::Include);
                }
                let writer = match self.store.get_transaction(txn, false) {
                    Ok(view) => view,
                    // A writer the store has never heard of cannot be
                    // proven committed; its cell stays invisible.
                    Err(SiError::TransactionNotFound(_)) => return Ok(FilterDecision::Skip),
                    Err(err) => return Err(err),
                };

                match writer.state() {
                    TxnState::Active => {
                        if self.reader.isolation() == IsolationLevel::ReadUncommitted {
                            Ok(FilterDecision::Include)
                        } else {
                            Ok(FilterDecision::Skip)
                        }
                    }
                    TxnState::Committed => {
                        self.enqueue_rollforward(txn, row);
                        // The store just told us this writer committed.
                        let commit_ts = writer.commit_ts().unwrap_or(u64::MAX);
                        Ok(self.committed_visible(commit_ts))
                    }
                    TxnState::RolledBack => {
                        self.enqueue_rollforward(txn, row);
                        Ok(FilterDecision::Skip)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollforward::{RollForwardConfig, RollForwardOutcome};
    use sierra_core::{CellValue, RowKey, TxnTransition};
    use sierra_txn::InMemoryTxnStore;
    use std::time::Duration;

    struct NoopAction;
    impl crate::rollforward::RollForwardAction for NoopAction {
        fn attempt(&self, _txn: TxnId, _rows: &[RowKey]) -> RollForwardOutcome {
            RollForwardOutcome::Resolved { cells_rewritten: 0 }
        }
    }

    fn queue() -> Arc<RollForwardQueue> {
        Arc::new(RollForwardQueue::new(
            Box::new(NoopAction),
            RollForwardConfig {
                max_pending: 64,
                workers: 1,
                retry_interval: Duration::from_millis(10),
            },
        ))
    }

    fn store_with_reader(begin_ts: u64) -> (Arc<InMemoryTxnStore>, TxnView) {
        let store = Arc::new(InMemoryTxnStore::new());
        let txn = sierra_core::Txn::begin(begin_ts, None, IsolationLevel::SnapshotIsolation);
        let view = txn.view(false);
        store.record_new_transaction(txn).unwrap();
        (store, view)
    }

    fn committed_writer(store: &InMemoryTxnStore, begin_ts: u64, commit_ts: u64) -> TxnId {
        let txn = sierra_core::Txn::begin(begin_ts, None, IsolationLevel::SnapshotIsolation);
        let id = txn.id();
        store.record_new_transaction(txn).unwrap();
        store
            .transition(id, TxnTransition::Commit { commit_ts })
            .unwrap();
        id
    }

    fn data(meta: CellMeta) -> Cell {
        Cell {
            meta,
            value: CellValue::Data(b"v".to_vec()),
        }
    }

    #[test]
    fn test_resolved_commit_before_snapshot_is_visible() {
        let (store, reader) = store_with_reader(10);
        let filter = SiFilter::new(store, queue(), reader);

        let cell = data(CellMeta::Committed {
            txn: TxnId::new(1),
            commit_ts: 5,
        });
        assert_eq!(filter.check(b"r", &cell).unwrap(), FilterDecision::Include);

        let later = data(CellMeta::Committed {
            txn: TxnId::new(11),
            commit_ts: 12,
        });
        assert_eq!(filter.check(b"r", &later).unwrap(), FilterDecision::Skip);
    }

    #[test]
    fn test_rolled_back_cell_is_never_visible() {
        let (store, reader) = store_with_reader(10);
        let filter = SiFilter::new(store, queue(), reader);
        let cell = data(CellMeta::RolledBack { txn: TxnId::new(2) });
        assert_eq!(filter.check(b"r", &cell).unwrap(), FilterDecision::Skip);
    }

    #[test]
    fn test_own_unresolved_write_is_visible() {
        let (store, reader) = store_with_reader(10);
        let id = reader.id();
        let filter = SiFilter::new(store, queue(), reader);
        let cell = data(CellMeta::Unresolved { txn: id });
        assert_eq!(filter.check(b"r", &cell).unwrap(), FilterDecision::Include);
    }

    #[test]
    fn test_unresolved_cell_of_active_writer_is_invisible() {
        let (store, _) = store_with_reader(5);
        let writer = sierra_core::Txn::begin(6, None, IsolationLevel::SnapshotIsolation);
        let writer_id = writer.id();
        store.record_new_transaction(writer).unwrap();

        let reader = store.get_transaction(TxnId::new(5), false).unwrap();
        let filter = SiFilter::new(store, queue(), reader);
        let cell = data(CellMeta::Unresolved { txn: writer_id });
        assert_eq!(filter.check(b"r", &cell).unwrap(), FilterDecision::Skip);
    }

    #[test]
    fn test_unresolved_cell_resolves_through_store() {
        let (store, _) = store_with_reader(20);
        let early = committed_writer(&store, 1, 2);
        let late = committed_writer(&store, 21, 25);

        let reader = store.get_transaction(TxnId::new(20), false).unwrap();
        let q = queue();
        let filter = SiFilter::new(store, Arc::clone(&q), reader);

        let visible = data(CellMeta::Unresolved { txn: early });
        assert_eq!(filter.check(b"r", &visible).unwrap(), FilterDecision::Include);

        let invisible = data(CellMeta::Unresolved { txn: late });
        assert_eq!(filter.check(b"r", &invisible).unwrap(), FilterDecision::Skip);

        // Both resolutions were handed to the roll-forward queue.
        q.drain();
        assert_eq!(q.stats().completed, 2);
        q.shutdown();
    }

    #[test]
    fn test_unknown_writer_is_skipped() {
        let (store, reader) = store_with_reader(10);
        let filter = SiFilter::new(store, queue(), reader);
        let cell = data(CellMeta::Unresolved { txn: TxnId::new(999) });
        assert_eq!(filter.check(b"r", &cell).unwrap(), FilterDecision::Skip);
    }

    #[test]
    fn test_read_uncommitted_sees_active_writes() {
        let store = Arc::new(InMemoryTxnStore::new());
        let reader_txn =
            sierra_core::Txn::begin(5, None, IsolationLevel::ReadUncommitted);
        let reader = reader_txn.view(false);
        store.record_new_transaction(reader_txn).unwrap();

        let writer = sierra_core::Txn::begin(6, None, IsolationLevel::SnapshotIsolation);
        let writer_id = writer.id();
        store.record_new_transaction(writer).unwrap();

        let filter = SiFilter::new(store, queue(), reader);
        let cell = data(CellMeta::Unresolved { txn: writer_id });
        assert_eq!(filter.check(b"r", &cell).unwrap(), FilterDecision::Include);
    }
}
