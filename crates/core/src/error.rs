//! Error taxonomy for the snapshot-isolation core.
//!
//! We use `thiserror` for automatic `Display` and `Error` trait
//! implementations. Errors on the read/write path abort the triggering
//! operation and surface to its caller; roll-forward failures never reach
//! this type (they are swallowed and retried by the queue).

use crate::types::{TxnId, TxnState};
use thiserror::Error;

/// Result type alias for snapshot-isolation operations.
pub type SiResult<T> = std::result::Result<T, SiError>;

/// Errors surfaced by the snapshot-isolation core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SiError {
    /// Lookup of a transaction id that was never recorded.
    #[error("transaction not found: {0}")]
    TransactionNotFound(TxnId),

    /// Attempt to record a transaction id that already exists.
    #[error("duplicate transaction: {0}")]
    DuplicateTransaction(TxnId),

    /// A lifecycle transition that the one-way state machine forbids
    /// (commit after rollback or vice versa).
    #[error("illegal state transition for {txn}: {from} -> {attempted}")]
    IllegalStateTransition {
        /// The transaction whose transition was rejected.
        txn: TxnId,
        /// State at the time of the attempt.
        from: TxnState,
        /// Terminal state the caller tried to reach.
        attempted: TxnState,
    },

    /// First-committer-wins conflict: the caller must abort and retry with
    /// a fresh transaction.
    #[error("write conflict on row {row:02x?}: {writer} conflicts with {conflicting}")]
    WriteConflict {
        /// The contested row.
        row: Vec<u8>,
        /// The transaction attempting the write.
        writer: TxnId,
        /// The transaction it conflicts with.
        conflicting: TxnId,
    },

    /// Operation the snapshot-isolation layer refuses outright, e.g. a
    /// direct physical delete.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Backup preparation declined because the partition is busy.
    /// Non-fatal: the caller polls and retries.
    #[error("backup preparation declined for partition {partition}: {reason}")]
    BackupPreparationDeclined {
        /// The partition that declined.
        partition: String,
        /// Why it declined (which maintenance operation was in flight).
        reason: String,
    },

    /// A flush, compaction, or split waited out its bound without the
    /// partition becoming available. Retryable once the blocker clears.
    #[error("maintenance blocked on partition {partition}: {reason}")]
    MaintenanceBlocked {
        /// The partition that stayed busy.
        partition: String,
        /// What was holding it (current state or backup marker).
        reason: String,
    },
}

impl SiError {
    /// Whether the caller can recover by starting a new transaction and
    /// retrying the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SiError::WriteConflict { .. }
                | SiError::BackupPreparationDeclined { .. }
                | SiError::MaintenanceBlocked { .. }
        )
    }
}
