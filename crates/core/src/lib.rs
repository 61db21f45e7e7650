//! Core types and traits for the Sierra snapshot-isolation layer.
//!
//! This crate defines the vocabulary shared by every other crate:
//! - Transaction records and their read-only views
//! - The versioned cell model stored in partitions
//! - The error taxonomy
//! - Trait seams (timestamps, transaction store, region observation,
//!   backup coordination) that let the upper layers be swapped or mocked

pub mod cell;
pub mod error;
pub mod traits;
pub mod types;

pub use cell::{Cell, CellMeta, CellValue, RowKey};
pub use error::{SiError, SiResult};
pub use traits::{
    BackupCoordinator, CompactionDecision, CompactionFilter, DeleteRequest, FilterDecision,
    GetRequest, ObserverVerdict, PutRequest, RegionHost, RegionObserver, ScanRequest,
    TimestampSource, TxnStore, VersionFilter,
};
pub use types::{
    IsolationLevel, TransitionOutcome, Txn, TxnId, TxnState, TxnTransition, TxnView,
};
