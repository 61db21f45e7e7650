//! Begin/commit/rollback orchestration and the compaction low watermark.

use parking_lot::Mutex;
use sierra_core::{
    IsolationLevel, SiResult, TimestampSource, TransitionOutcome, Txn, TxnId, TxnStore,
    TxnTransition, TxnView,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Drives transaction lifecycles against a [`TxnStore`].
///
/// The manager decides transitions, allocates timestamps for them, and
/// maintains the set of active begin timestamps that defines the low
/// watermark. The store only applies what the manager decides.
pub struct TxnLifecycleManager {
    timestamps: Arc<dyn TimestampSource>,
    store: Arc<dyn TxnStore>,
    /// Begin timestamps of in-flight transactions, ordered so the oldest
    /// is always the first element.
    active: Mutex<BTreeSet<u64>>,
}

impl TxnLifecycleManager {
    pub fn new(timestamps: Arc<dyn TimestampSource>, store: Arc<dyn TxnStore>) -> Self {
        Self {
            timestamps,
            store,
            active: Mutex::new(BTreeSet::new()),
        }
    }

    /// The transaction store this manager drives.
    pub fn store(&self) -> Arc<dyn TxnStore> {
        Arc::clone(&self.store)
    }

    /// Start a top-level transaction at the default isolation level.
    pub fn begin(&self) -> SiResult<TxnView> {
        self.begin_with(None, IsolationLevel::default())
    }

    /// Start a transaction with an explicit parent and isolation level.
    pub fn begin_with(
        &self,
        parent: Option<TxnId>,
        isolation: IsolationLevel,
    ) -> SiResult<TxnView> {
        // Allocate under the active-set lock so a concurrent watermark
        // reader can never observe a timestamp newer than a transaction it
        // has not yet seen as active.
        let begin_ts = {
            let mut active = self.active.lock();
            let ts = self.timestamps.next();
            active.insert(ts);
            ts
        };

        let txn = Txn::begin(begin_ts, parent, isolation);
        let view = txn.view(false);
        if let Err(err) = self.store.record_new_transaction(txn) {
            self.active.lock().remove(&begin_ts);
            return Err(err);
        }

        debug!(txn = %view.id(), begin_ts, ?isolation, "transaction started");
        Ok(view)
    }

    /// Commit a transaction, returning its commit timestamp.
    ///
    /// Idempotent: committing an already committed transaction returns the
    /// original commit timestamp. Committing a rolled-back transaction
    /// fails with `IllegalStateTransition`.
    pub fn commit(&self, id: TxnId) -> SiResult<u64> {
        // The timestamp is allocated before the transition lands. If the
        // transition loses a race it is simply wasted; timestamps are
        // never reused.
        let commit_ts = self.timestamps.next();
        let outcome = self
            .store
            .transition(id, TxnTransition::Commit { commit_ts })?;

        let view = outcome.view();
        self.retire(view.begin_ts());

        // A committed record always carries its timestamp.
        let committed_at = view.commit_ts().unwrap_or(commit_ts);
        match outcome {
            TransitionOutcome::Applied(_) => {
                debug!(txn = %id, commit_ts = committed_at, "transaction committed");
            }
            TransitionOutcome::AlreadyTerminal(_) => {
                debug!(txn = %id, commit_ts = committed_at, "commit replayed on committed transaction");
            }
        }
        Ok(committed_at)
    }

    /// Roll back a transaction. Idempotent on already rolled-back ids.
    pub fn rollback(&self, id: TxnId) -> SiResult<()> {
        let outcome = self.store.transition(id, TxnTransition::Rollback)?;
        self.retire(outcome.view().begin_ts());
        debug!(txn = %id, "transaction rolled back");
        Ok(())
    }

    /// Record a table an active transaction writes to.
    pub fn register_destination_table(&self, id: TxnId, table: Vec<u8>) -> SiResult<()> {
        self.store.register_destination_table(id, table)
    }

    /// Oldest begin timestamp among active transactions.
    ///
    /// Every version whose fate matters only to snapshots at or above this
    /// timestamp may be judged by compaction. With no active transactions
    /// the watermark sits just above the last allocated timestamp.
    pub fn low_watermark(&self) -> u64 {
        let active = self.active.lock();
        match active.iter().next() {
            Some(&oldest) => oldest,
            None => self.timestamps.current() + 1,
        }
    }

    /// Number of in-flight transactions.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    fn retire(&self, begin_ts: u64) {
        self.active.lock().remove(&begin_ts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTxnStore;
    use crate::timestamp::MonotonicTimestampSource;
    use sierra_core::{SiError, TxnState};

    fn manager() -> TxnLifecycleManager {
        TxnLifecycleManager::new(
            Arc::new(MonotonicTimestampSource::new()),
            Arc::new(InMemoryTxnStore::new()),
        )
    }

    #[test]
    fn test_begin_commit_round_trip() {
        let mgr = manager();
        let view = mgr.begin().unwrap();
        assert_eq!(view.state(), TxnState::Active);

        let commit_ts = mgr.commit(view.id()).unwrap();
        assert!(commit_ts > view.begin_ts());

        let stored = mgr.store().get_transaction(view.id(), false).unwrap();
        assert_eq!(stored.state(), TxnState::Committed);
        assert_eq!(stored.commit_ts(), Some(commit_ts));
    }

    #[test]
    fn test_commit_is_idempotent() {
        let mgr = manager();
        let view = mgr.begin().unwrap();
        let first = mgr.commit(view.id()).unwrap();
        let second = mgr.commit(view.id()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_commit_after_rollback_fails() {
        let mgr = manager();
        let view = mgr.begin().unwrap();
        mgr.rollback(view.id()).unwrap();
        let err = mgr.commit(view.id()).unwrap_err();
        assert!(matches!(err, SiError::IllegalStateTransition { .. }));
    }

    #[test]
    fn test_watermark_tracks_oldest_active() {
        let mgr = manager();
        let a = mgr.begin().unwrap();
        let b = mgr.begin().unwrap();
        let c = mgr.begin().unwrap();
        assert_eq!(mgr.low_watermark(), a.begin_ts());

        // Finishing a newer transaction leaves the watermark in place.
        mgr.commit(b.id()).unwrap();
        assert_eq!(mgr.low_watermark(), a.begin_ts());

        // Finishing the oldest advances it to the next oldest.
        mgr.rollback(a.id()).unwrap();
        assert_eq!(mgr.low_watermark(), c.begin_ts());
    }

    #[test]
    fn test_watermark_with_no_active_transactions() {
        let mgr = manager();
        let view = mgr.begin().unwrap();
        let commit_ts = mgr.commit(view.id()).unwrap();
        assert_eq!(mgr.active_count(), 0);
        assert_eq!(mgr.low_watermark(), commit_ts + 1);
    }

    #[test]
    fn test_nested_transaction_records_parent() {
        let mgr = manager();
        let parent = mgr.begin().unwrap();
        let child = mgr
            .begin_with(Some(parent.id()), IsolationLevel::ReadCommitted)
            .unwrap();
        assert_eq!(child.parent(), Some(parent.id()));
        assert_eq!(child.isolation(), IsolationLevel::ReadCommitted);
        assert!(child.begin_ts() > parent.begin_ts());
    }

    #[test]
    fn test_destination_table_registration() {
        let mgr = manager();
        let view = mgr.begin().unwrap();
        mgr.register_destination_table(view.id(), b"orders".to_vec())
            .unwrap();

        let full = mgr.store().get_transaction(view.id(), true).unwrap();
        assert_eq!(full.destination_tables().unwrap(), &[b"orders".to_vec()]);
    }
}
