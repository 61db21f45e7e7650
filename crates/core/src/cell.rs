//! The versioned cell model persisted by partitions.
//!
//! Every stored version of a row is tagged with its writing transaction.
//! The tag starts out unresolved and is rewritten in place once the
//! writer's outcome is known (the roll-forward path), so later reads can
//! decide visibility without consulting the transaction store.

use crate::types::TxnId;
use serde::{Deserialize, Serialize};

/// Row identifier within a partition.
pub type RowKey = Vec<u8>;

/// Stored payload of a versioned cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellValue {
    /// Real data, typically a row-encoder payload.
    Data(Vec<u8>),
    /// Logical deletion marker. Tombstones are the only representation of
    /// deletion; cells are physically removed only at compaction.
    Tombstone,
}

impl CellValue {
    /// Whether this cell records a deletion.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, CellValue::Tombstone)
    }
}

/// Resolution state of a cell's writing transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellMeta {
    /// Writer outcome unknown at write time; readers must resolve it.
    Unresolved {
        /// The writing transaction.
        txn: TxnId,
    },
    /// Writer known committed; visibility is decided from `commit_ts` alone.
    Committed {
        /// The writing transaction.
        txn: TxnId,
        /// The writer's commit timestamp.
        commit_ts: u64,
    },
    /// Writer known rolled back; the cell is never visible and is dropped
    /// at the next compaction.
    RolledBack {
        /// The writing transaction.
        txn: TxnId,
    },
}

impl CellMeta {
    /// The writing transaction, regardless of resolution state.
    pub fn txn(&self) -> TxnId {
        match self {
            CellMeta::Unresolved { txn }
            | CellMeta::Committed { txn, .. }
            | CellMeta::RolledBack { txn } => *txn,
        }
    }

    /// Whether the writer outcome still needs resolution.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, CellMeta::Unresolved { .. })
    }
}

/// One stored version of a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    /// Writer tag and resolution state.
    pub meta: CellMeta,
    /// Payload or tombstone.
    pub value: CellValue,
}

impl Cell {
    /// Create a freshly written, unresolved cell.
    pub fn unresolved(txn: TxnId, value: CellValue) -> Self {
        Self {
            meta: CellMeta::Unresolved { txn },
            value,
        }
    }
}
