//! The global timestamp authority.

use sierra_core::TimestampSource;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic timestamp source backed by an atomic counter.
///
/// Every allocation is unique and strictly increasing. Timestamps double as
/// transaction ids, so they are never reused even when a transaction aborts
/// before doing any work.
#[derive(Debug)]
pub struct MonotonicTimestampSource {
    last: AtomicU64,
}

impl MonotonicTimestampSource {
    /// Create a source whose first allocated timestamp is 1.
    pub fn new() -> Self {
        Self::with_start(0)
    }

    /// Create a source whose first allocated timestamp is `start + 1`.
    ///
    /// Used when resuming from a persisted high-water mark so new
    /// timestamps never collide with ones already handed out.
    pub fn with_start(start: u64) -> Self {
        Self {
            last: AtomicU64::new(start),
        }
    }
}

impl Default for MonotonicTimestampSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampSource for MonotonicTimestampSource {
    fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}
