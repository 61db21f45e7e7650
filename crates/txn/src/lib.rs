//! Transaction lifecycle management for the Sierra snapshot-isolation layer.
//!
//! The pieces compose bottom-up:
//! - [`MonotonicTimestampSource`]: the global timestamp authority
//! - [`InMemoryTxnStore`]: the authoritative transaction record store
//! - [`CompletedTxnCache`]: an LRU decorator that short-circuits lookups of
//!   terminal transactions
//! - [`TxnLifecycleManager`]: begin/commit/rollback orchestration plus the
//!   low watermark used by compaction

pub mod cache;
pub mod lifecycle;
pub mod store;
pub mod timestamp;

pub use cache::{CacheStats, CompletedTxnCache};
pub use lifecycle::TxnLifecycleManager;
pub use store::InMemoryTxnStore;
pub use timestamp::MonotonicTimestampSource;
