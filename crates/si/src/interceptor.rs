//! The snapshot-isolation observer installed on every partition.
//!
//! All transactional semantics enter the host store through this type: it
//! injects the visibility filter into reads, enforces first-committer-wins
//! on writes, rejects physical deletes, supplies the compaction filter,
//! and guards partition maintenance against in-flight backups.

use crate::filter::SiFilter;
use crate::region_state::{PartitionState, PartitionStateMachine};
use crate::rollforward::RollForwardQueue;
use sierra_core::{
    Cell, CellMeta, CompactionDecision, CompactionFilter, DeleteRequest, GetRequest,
    ObserverVerdict, PutRequest, RegionHost, RegionObserver, RowKey, ScanRequest, SiError,
    SiResult, TxnState, TxnStore, TxnView,
};
use sierra_txn::TxnLifecycleManager;
use std::sync::Arc;
use tracing::debug;

/// Region observer implementing the snapshot-isolation protocol.
pub struct SiObserver {
    lifecycle: Arc<TxnLifecycleManager>,
    /// Usually the completed-transaction cache over the authoritative
    /// store; every resolution on the hot path goes through here.
    store: Arc<dyn TxnStore>,
    queue: Arc<RollForwardQueue>,
    state: PartitionStateMachine,
}

impl SiObserver {
    pub fn new(
        lifecycle: Arc<TxnLifecycleManager>,
        store: Arc<dyn TxnStore>,
        queue: Arc<RollForwardQueue>,
        state: PartitionStateMachine,
    ) -> Self {
        Self {
            lifecycle,
            store,
            queue,
            state,
        }
    }

    /// Answer a backup-prepare request for this partition.
    pub fn prepare_backup(&self) -> SiResult<()> {
        self.state.prepare_backup()
    }

    /// Finish a backup started by [`SiObserver::prepare_backup`].
    pub fn complete_backup(&self) {
        self.state.complete_backup()
    }

    /// Current partition state.
    pub fn partition_state(&self) -> PartitionState {
        self.state.current()
    }

    /// The roll-forward queue feeding this partition.
    pub fn rollforward(&self) -> &Arc<RollForwardQueue> {
        &self.queue
    }

    fn reader_filter(&self, reader: sierra_core::TxnId) -> SiResult<Arc<SiFilter>> {
        let view = self.store.get_transaction(reader, false)?;
        Ok(Arc::new(SiFilter::new(
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            view,
        )))
    }

    /// First-committer-wins check for one row.
    ///
    /// A conflict exists when any other transaction committed the row
    /// after this writer's snapshot began, or is still actively writing
    /// it. Every version must be examined: commit order is independent of
    /// writer id order. Called by the host under its row lock so the
    /// verdict cannot go stale before the write lands.
    fn check_conflicts(&self, row: &[u8], versions: &[Cell], writer: &TxnView) -> SiResult<()> {
        let conflict = |conflicting| SiError::WriteConflict {
            row: row.to_vec(),
            writer: writer.id(),
            conflicting,
        };

        for cell in versions {
            let other = cell.meta.txn();
            if other == writer.id() {
                continue;
            }
            match cell.meta {
                CellMeta::Committed { commit_ts, .. } => {
                    if commit_ts > writer.begin_ts() {
                        return Err(conflict(other));
                    }
                }
                CellMeta::RolledBack { .. } => {}
                CellMeta::Unresolved { txn } => {
                    let view = match self.store.get_transaction(txn, false) {
                        Ok(view) => view,
                        // A cell whose writer the store never recorded
                        // cannot be proven conflicting.
                        Err(SiError::TransactionNotFound(_)) => continue,
                        Err(err) => return Err(err),
                    };
                    match (view.state(), view.commit_ts()) {
                        // The row already has an in-flight writer; under
                        // first-committer-wins one of the two must lose,
                        // and we fail the late arrival immediately.
                        (TxnState::Active, _) => return Err(conflict(txn)),
                        (TxnState::Committed, Some(commit_ts)) => {
                            self.queue.enqueue(txn, std::iter::once(row.to_vec()));
                            if commit_ts > writer.begin_ts() {
                                return Err(conflict(txn));
                            }
                        }
                        (TxnState::Committed, None) => return Err(conflict(txn)),
                        (TxnState::RolledBack, _) => {
                            self.queue.enqueue(txn, std::iter::once(row.to_vec()));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl RegionObserver for SiObserver {
    fn pre_get(&self, _host: &dyn RegionHost, get: &mut GetRequest) -> SiResult<()> {
        if let Some(reader) = get.reader {
            get.filters.push(self.reader_filter(reader)?);
        }
        Ok(())
    }

    fn pre_scan(&self, _host: &dyn RegionHost, scan: &mut ScanRequest) -> SiResult<()> {
        if let Some(reader) = scan.reader {
            scan.filters.push(self.reader_filter(reader)?);
        }
        Ok(())
    }

    fn pre_put(&self, host: &dyn RegionHost, put: &PutRequest) -> SiResult<ObserverVerdict> {
        let writer = self.store.get_transaction(put.txn, false)?;
        if writer.state() != TxnState::Active {
            return Err(SiError::UnsupportedOperation(format!(
                "write under {} transaction {}",
                writer.state(),
                writer.id()
            )));
        }

        // Two concurrent writers of one row must not both pass the check,
        // so the verdict and the insert are a single step under the host's
        // row lock.
        host.write_cell_checked(
            put.row.clone(),
            Cell::unresolved(put.txn, put.value.clone()),
            &|versions| self.check_conflicts(&put.row, versions, &writer),
        )?;
        self.store
            .register_destination_table(put.txn, host.partition().as_bytes().to_vec())?;
        Ok(ObserverVerdict::Bypass)
    }

    fn pre_delete(
        &self,
        _host: &dyn RegionHost,
        delete: &DeleteRequest,
    ) -> SiResult<ObserverVerdict> {
        Err(SiError::UnsupportedOperation(format!(
            "direct delete of row {:02x?} by {}; deletion must be written as a tombstone",
            delete.row, delete.txn
        )))
    }

    fn pre_flush(&self, host: &dyn RegionHost) -> SiResult<()> {
        debug!(partition = %host.partition(), "flush requested");
        self.state.begin_maintenance(PartitionState::Flushing)
    }

    fn post_flush(&self, _host: &dyn RegionHost) -> SiResult<()> {
        self.state.finish_maintenance();
        Ok(())
    }

    fn pre_compact(&self, host: &dyn RegionHost) -> SiResult<Option<Box<dyn CompactionFilter>>> {
        self.state.begin_maintenance(PartitionState::Compacting)?;
        let low_watermark = self.lifecycle.low_watermark();
        debug!(partition = %host.partition(), low_watermark, "compaction starting");
        Ok(Some(Box::new(SiCompactionFilter::new(
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            low_watermark,
        ))))
    }

    fn post_compact(&self, _host: &dyn RegionHost) -> SiResult<()> {
        self.state.finish_maintenance();
        Ok(())
    }

    fn pre_split(&self, host: &dyn RegionHost) -> SiResult<()> {
        debug!(partition = %host.partition(), "split requested");
        self.state.begin_maintenance(PartitionState::Splitting)
    }

    fn post_split(&self, _host: &dyn RegionHost) -> SiResult<()> {
        self.state.finish_maintenance();
        Ok(())
    }
}

/// Compaction-time cleanup for one compaction run.
///
/// Fed every cell, rows in key order and versions newest first. Drops
/// cells of definitively rolled-back writers, and committed cells
/// superseded by a newer committed version that is itself at or below the
/// low watermark (no in-flight snapshot can still prefer the older cell).
pub struct SiCompactionFilter {
    store: Arc<dyn TxnStore>,
    queue: Arc<RollForwardQueue>,
    low_watermark: u64,
    current_row: Option<RowKey>,
    /// Set once a committed version at or below the watermark has been
    /// seen in the current row; everything older is superseded.
    superseded: bool,
}

impl SiCompactionFilter {
    pub fn new(
        store: Arc<dyn TxnStore>,
        queue: Arc<RollForwardQueue>,
        low_watermark: u64,
    ) -> Self {
        Self {
            store,
            queue,
            low_watermark,
            current_row: None,
            superseded: false,
        }
    }

    fn committed(&mut self, commit_ts: u64) -> CompactionDecision {
        if self.superseded {
            return CompactionDecision::Drop;
        }
        if commit_ts <= self.low_watermark {
            self.superseded = true;
        }
        CompactionDecision::Keep
    }
}

impl CompactionFilter for SiCompactionFilter {
    fn check(&mut self, row: &[u8], cell: &Cell) -> SiResult<CompactionDecision> {
        if self.current_row.as_deref() != Some(row) {
            self.current_row = Some(row.to_vec());
            self.superseded = false;
        }

        match cell.meta {
            CellMeta::RolledBack { .. } => Ok(CompactionDecision::Drop),
            CellMeta::Committed { commit_ts, .. } => Ok(self.committed(commit_ts)),
            CellMeta::Unresolved { txn } => {
                let view = match self.store.get_transaction(txn, false) {
                    Ok(view) => view,
                    Err(SiError::TransactionNotFound(_)) => return Ok(CompactionDecision::Keep),
                    Err(err) => return Err(err),
                };
                match (view.state(), view.commit_ts()) {
                    (TxnState::Active, _) => Ok(CompactionDecision::Keep),
                    (TxnState::RolledBack, _) => {
                        // Definitive: the cell can go now, no rewrite needed.
                        Ok(CompactionDecision::Drop)
                    }
                    (TxnState::Committed, Some(commit_ts)) => {
                        // Metadata catches up asynchronously.
                        self.queue.enqueue(txn, std::iter::once(row.to_vec()));
                        Ok(self.committed(commit_ts))
                    }
                    (TxnState::Committed, None) => Ok(CompactionDecision::Keep),
                }
            }
        }
    }
}
