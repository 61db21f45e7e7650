//! The snapshot-isolation protocol layer.
//!
//! Everything transactional happens here, behind the host region's hook
//! points:
//! - [`SiFilter`] decides per-version visibility at read time
//! - [`SiObserver`] intercepts reads, writes, and partition maintenance
//! - [`RollForwardQueue`] rewrites resolved cell metadata off the hot path
//! - [`PartitionStateMachine`] serializes flush/compact/split/backup

pub mod filter;
pub mod interceptor;
pub mod region_state;
pub mod rollforward;

pub use filter::SiFilter;
pub use interceptor::{SiCompactionFilter, SiObserver};
pub use region_state::{InMemoryBackupCoordinator, PartitionState, PartitionStateMachine};
pub use rollforward::{
    HostRollForwardAction, RollForwardAction, RollForwardConfig, RollForwardOutcome,
    RollForwardQueue, RollForwardStats,
};
