//! Transaction records, views, and the lifecycle state machine.
//!
//! A [`Txn`] is the authoritative record of fact for one transaction. The
//! state machine lives on the record itself so that any store can apply
//! transitions atomically under its own entry lock; the store never decides
//! a transition, it only applies one.

use crate::error::{SiError, SiResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a transaction.
///
/// Ids are derived from the begin timestamp and are never reused, which
/// makes them totally ordered by transaction start.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TxnId(u64);

impl TxnId {
    /// Create a transaction id from its raw timestamp value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw timestamp value backing this id.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Lifecycle state of a transaction.
///
/// Transitions are one-way: `Active` moves exactly once to `Committed` or
/// `RolledBack` and never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    /// Transaction is executing; its writes are not visible to others.
    Active,
    /// Transaction committed; writes become visible to later snapshots.
    Committed,
    /// Transaction rolled back; its writes are never visible.
    RolledBack,
}

impl TxnState {
    /// Whether the state can never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxnState::Active)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnState::Active => write!(f, "ACTIVE"),
            TxnState::Committed => write!(f, "COMMITTED"),
            TxnState::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

/// Isolation level recorded on a transaction and honored by the read filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Reads see only versions committed at or before the snapshot timestamp.
    #[default]
    SnapshotIsolation,
    /// Reads see any committed version, regardless of commit order.
    ReadCommitted,
    /// Reads see unresolved writes from in-flight transactions.
    ReadUncommitted,
}

/// A lifecycle transition request, applied atomically by the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnTransition {
    /// Move to `Committed` with the given commit timestamp.
    Commit {
        /// Commit timestamp allocated by the lifecycle manager.
        commit_ts: u64,
    },
    /// Move to `RolledBack`.
    Rollback,
}

/// Outcome of applying a [`TxnTransition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The transition was applied; the view reflects the new state.
    Applied(TxnView),
    /// The transaction was already in the requested terminal state.
    /// Commit idempotence: the view carries the original commit timestamp.
    AlreadyTerminal(TxnView),
}

impl TransitionOutcome {
    /// The view after the transition, whichever way it resolved.
    pub fn view(&self) -> &TxnView {
        match self {
            TransitionOutcome::Applied(v) | TransitionOutcome::AlreadyTerminal(v) => v,
        }
    }
}

/// Authoritative record of one transaction.
///
/// Owned exclusively by the transaction store once recorded; only the
/// lifecycle manager requests state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Txn {
    id: TxnId,
    parent: Option<TxnId>,
    begin_ts: u64,
    commit_ts: Option<u64>,
    state: TxnState,
    isolation: IsolationLevel,
    destination_tables: Vec<Vec<u8>>,
}

impl Txn {
    /// Create a new active transaction. The id is derived from the begin
    /// timestamp.
    pub fn begin(begin_ts: u64, parent: Option<TxnId>, isolation: IsolationLevel) -> Self {
        Self {
            id: TxnId::new(begin_ts),
            parent,
            begin_ts,
            commit_ts: None,
            state: TxnState::Active,
            isolation,
            destination_tables: Vec::new(),
        }
    }

    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Begin timestamp.
    pub fn begin_ts(&self) -> u64 {
        self.begin_ts
    }

    /// Commit timestamp, set once the transaction commits.
    pub fn commit_ts(&self) -> Option<u64> {
        self.commit_ts
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Isolation level the transaction was started with.
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Parent transaction for nested transactions, if any.
    pub fn parent(&self) -> Option<TxnId> {
        self.parent
    }

    /// Record a table this transaction writes to. Repeat registrations of
    /// the same table are collapsed.
    pub fn add_destination_table(&mut self, table: Vec<u8>) {
        if !self.destination_tables.contains(&table) {
            self.destination_tables.push(table);
        }
    }

    /// Apply a lifecycle transition.
    ///
    /// The state machine is one-way: a terminal state never changes.
    /// Re-applying the same terminal transition is reported as
    /// `AlreadyTerminal` (commit idempotence); the conflicting terminal
    /// transition is an [`SiError::IllegalStateTransition`].
    pub fn apply(&mut self, transition: TxnTransition) -> SiResult<TransitionOutcome> {
        match (self.state, transition) {
            (TxnState::Active, TxnTransition::Commit { commit_ts }) => {
                self.commit_ts = Some(commit_ts);
                self.state = TxnState::Committed;
                Ok(TransitionOutcome::Applied(self.view(false)))
            }
            (TxnState::Active, TxnTransition::Rollback) => {
                self.state = TxnState::RolledBack;
                Ok(TransitionOutcome::Applied(self.view(false)))
            }
            (TxnState::Committed, TxnTransition::Commit { .. }) => {
                Ok(TransitionOutcome::AlreadyTerminal(self.view(false)))
            }
            (TxnState::RolledBack, TxnTransition::Rollback) => {
                Ok(TransitionOutcome::AlreadyTerminal(self.view(false)))
            }
            (from, TxnTransition::Commit { .. }) => Err(SiError::IllegalStateTransition {
                txn: self.id,
                from,
                attempted: TxnState::Committed,
            }),
            (from, TxnTransition::Rollback) => Err(SiError::IllegalStateTransition {
                txn: self.id,
                from,
                attempted: TxnState::RolledBack,
            }),
        }
    }

    /// Build an immutable view of this record.
    ///
    /// `fetch_destination_tables` controls whether the (potentially large)
    /// destination table list is materialized into the view.
    pub fn view(&self, fetch_destination_tables: bool) -> TxnView {
        TxnView {
            id: self.id,
            parent: self.parent,
            begin_ts: self.begin_ts,
            commit_ts: self.commit_ts,
            state: self.state,
            isolation: self.isolation,
            destination_tables: fetch_destination_tables
                .then(|| self.destination_tables.clone()),
        }
    }
}

/// Immutable, read-only projection of a [`Txn`] handed to callers.
///
/// Never mutated after construction. A cached view of a terminal
/// transaction is valid forever because terminal states never change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnView {
    id: TxnId,
    parent: Option<TxnId>,
    begin_ts: u64,
    commit_ts: Option<u64>,
    state: TxnState,
    isolation: IsolationLevel,
    destination_tables: Option<Vec<Vec<u8>>>,
}

impl TxnView {
    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Parent transaction, if any.
    pub fn parent(&self) -> Option<TxnId> {
        self.parent
    }

    /// Begin timestamp.
    pub fn begin_ts(&self) -> u64 {
        self.begin_ts
    }

    /// Commit timestamp, present once committed.
    pub fn commit_ts(&self) -> Option<u64> {
        self.commit_ts
    }

    /// Lifecycle state at the time the view was taken.
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Isolation level.
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Destination tables, if they were fetched.
    pub fn destination_tables(&self) -> Option<&[Vec<u8>]> {
        self.destination_tables.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_is_active() {
        let txn = Txn::begin(7, None, IsolationLevel::SnapshotIsolation);
        assert_eq!(txn.id(), TxnId::new(7));
        assert_eq!(txn.begin_ts(), 7);
        assert_eq!(txn.state(), TxnState::Active);
        assert_eq!(txn.commit_ts(), None);
        assert!(!txn.state().is_terminal());
    }

    #[test]
    fn test_commit_transition() {
        let mut txn = Txn::begin(1, None, IsolationLevel::SnapshotIsolation);
        let outcome = txn.apply(TxnTransition::Commit { commit_ts: 5 }).unwrap();
        assert!(matches!(outcome, TransitionOutcome::Applied(_)));
        assert_eq!(txn.state(), TxnState::Committed);
        assert_eq!(txn.commit_ts(), Some(5));
    }

    #[test]
    fn test_commit_is_idempotent() {
        let mut txn = Txn::begin(1, None, IsolationLevel::SnapshotIsolation);
        txn.apply(TxnTransition::Commit { commit_ts: 5 }).unwrap();
        let outcome = txn.apply(TxnTransition::Commit { commit_ts: 9 }).unwrap();
        match outcome {
            TransitionOutcome::AlreadyTerminal(view) => {
                // Original commit timestamp is preserved
                assert_eq!(view.commit_ts(), Some(5));
            }
            other => panic!("expected AlreadyTerminal, got {:?}", other),
        }
        assert_eq!(txn.commit_ts(), Some(5));
    }

    #[test]
    fn test_commit_after_rollback_fails() {
        let mut txn = Txn::begin(1, None, IsolationLevel::SnapshotIsolation);
        txn.apply(TxnTransition::Rollback).unwrap();
        let err = txn.apply(TxnTransition::Commit { commit_ts: 5 }).unwrap_err();
        assert!(matches!(err, SiError::IllegalStateTransition { .. }));
        assert_eq!(txn.state(), TxnState::RolledBack);
    }

    #[test]
    fn test_rollback_after_commit_fails() {
        let mut txn = Txn::begin(1, None, IsolationLevel::SnapshotIsolation);
        txn.apply(TxnTransition::Commit { commit_ts: 5 }).unwrap();
        let err = txn.apply(TxnTransition::Rollback).unwrap_err();
        assert!(matches!(err, SiError::IllegalStateTransition { .. }));
        assert_eq!(txn.state(), TxnState::Committed);
    }

    #[test]
    fn test_rollback_is_idempotent() {
        let mut txn = Txn::begin(1, None, IsolationLevel::SnapshotIsolation);
        txn.apply(TxnTransition::Rollback).unwrap();
        let outcome = txn.apply(TxnTransition::Rollback).unwrap();
        assert!(matches!(outcome, TransitionOutcome::AlreadyTerminal(_)));
    }

    #[test]
    fn test_view_omits_destination_tables() {
        let mut txn = Txn::begin(3, None, IsolationLevel::SnapshotIsolation);
        txn.add_destination_table(b"orders".to_vec());
        txn.add_destination_table(b"order_index".to_vec());

        let lean = txn.view(false);
        assert!(lean.destination_tables().is_none());

        let full = txn.view(true);
        assert_eq!(full.destination_tables().unwrap().len(), 2);
    }

    #[test]
    fn test_child_transaction_records_parent() {
        let parent = Txn::begin(1, None, IsolationLevel::SnapshotIsolation);
        let child = Txn::begin(2, Some(parent.id()), IsolationLevel::SnapshotIsolation);
        assert_eq!(child.parent(), Some(TxnId::new(1)));
        assert_eq!(child.view(false).parent(), Some(TxnId::new(1)));
    }

    #[test]
    fn test_view_serde_round_trip() {
        let mut txn = Txn::begin(11, None, IsolationLevel::ReadCommitted);
        txn.apply(TxnTransition::Commit { commit_ts: 20 }).unwrap();
        let view = txn.view(false);

        let bytes = bincode::serialize(&view).unwrap();
        let decoded: TxnView = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, view);
        assert_eq!(decoded.commit_ts(), Some(20));
        assert_eq!(decoded.isolation(), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn test_txn_id_ordering_follows_begin_ts() {
        assert!(TxnId::new(1) < TxnId::new(2));
        assert_eq!(format!("{}", TxnId::new(42)), "txn-42");
    }
}
