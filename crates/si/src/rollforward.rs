//! Asynchronous roll-forward of resolved cell metadata.
//!
//! When a reader resolves a cell whose writer outcome was unknown at write
//! time, it enqueues the (transaction, rows) pair here instead of rewriting
//! anything itself. Background workers later rewrite the cells' metadata to
//! the resolved outcome, so future reads decide visibility without a
//! transaction store lookup. The queue is pure amortization: a dropped or
//! delayed task only means future reads redo resolution.

use parking_lot::{Condvar, Mutex};
use sierra_core::{CellMeta, RegionHost, RowKey, TxnId, TxnState, TxnStore};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Result of one roll-forward attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollForwardOutcome {
    /// The writer was terminal; the listed cells were rewritten.
    Resolved {
        /// Cells whose metadata was actually replaced.
        cells_rewritten: usize,
    },
    /// The writer is still active; the task should be retried later.
    WriterStillActive,
    /// The writer cannot be resolved (unknown id, host gone). The task is
    /// abandoned.
    WriterUnknown,
}

/// Performs the actual metadata rewrite for one task.
pub trait RollForwardAction: Send + Sync {
    /// Attempt to roll forward every row written by `txn`.
    fn attempt(&self, txn: TxnId, rows: &[RowKey]) -> RollForwardOutcome;
}

/// Action that resolves writers through a [`TxnStore`] and rewrites cells
/// through a [`RegionHost`].
///
/// Holds the host weakly: the host owns the observer that owns the queue,
/// and a strong reference here would keep the whole partition alive.
pub struct HostRollForwardAction {
    store: Arc<dyn TxnStore>,
    host: Weak<dyn RegionHost>,
}

impl HostRollForwardAction {
    pub fn new(store: Arc<dyn TxnStore>, host: Weak<dyn RegionHost>) -> Self {
        Self { store, host }
    }
}

impl RollForwardAction for HostRollForwardAction {
    fn attempt(&self, txn: TxnId, rows: &[RowKey]) -> RollForwardOutcome {
        let host = match self.host.upgrade() {
            Some(host) => host,
            None => return RollForwardOutcome::WriterUnknown,
        };
        let view = match self.store.get_transaction(txn, false) {
            Ok(view) => view,
            Err(err) => {
                warn!(txn = %txn, %err, "roll-forward writer lookup failed");
                return RollForwardOutcome::WriterUnknown;
            }
        };

        let meta = match (view.state(), view.commit_ts()) {
            (TxnState::Active, _) => return RollForwardOutcome::WriterStillActive,
            (TxnState::Committed, Some(commit_ts)) => CellMeta::Committed { txn, commit_ts },
            (TxnState::Committed, None) => {
                warn!(txn = %txn, "committed writer missing commit timestamp");
                return RollForwardOutcome::WriterUnknown;
            }
            (TxnState::RolledBack, _) => CellMeta::RolledBack { txn },
        };

        let mut cells_rewritten = 0;
        for row in rows {
            if host.replace_meta(row, txn, meta) {
                cells_rewritten += 1;
            }
        }
        RollForwardOutcome::Resolved { cells_rewritten }
    }
}

/// Queue tuning knobs.
#[derive(Debug, Clone)]
pub struct RollForwardConfig {
    /// Maximum distinct transactions queued at once; submissions beyond
    /// this are dropped (logged only).
    pub max_pending: usize,
    /// Worker thread count.
    pub workers: usize,
    /// How long a still-active writer's task waits before the next
    /// resolution attempt.
    pub retry_interval: Duration,
}

impl Default for RollForwardConfig {
    fn default() -> Self {
        Self {
            max_pending: 10_000,
            workers: 1,
            retry_interval: Duration::from_secs(10),
        }
    }
}

/// Queue metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollForwardStats {
    /// Tasks ready for a worker.
    pub queued: usize,
    /// Tasks parked until the next retry interval.
    pub deferred: usize,
    /// Tasks currently being processed.
    pub active: usize,
    /// Tasks that finished with a resolved writer.
    pub completed: u64,
    /// Submissions dropped at capacity plus tasks abandoned unresolvable.
    pub dropped: u64,
    /// Times a task was parked because its writer was still active.
    pub requeued: u64,
    /// Total cell metadata rewrites performed.
    pub cells_rewritten: u64,
}

struct QueueState {
    /// Row sets keyed by transaction; submissions for a queued transaction
    /// merge here instead of creating a second task.
    rows: HashMap<TxnId, BTreeSet<RowKey>>,
    ready: VecDeque<TxnId>,
    deferred: Vec<TxnId>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    work_ready: Condvar,
    idle: Condvar,
    shutdown: AtomicBool,
    active: AtomicUsize,
    completed: AtomicU64,
    dropped: AtomicU64,
    requeued: AtomicU64,
    cells_rewritten: AtomicU64,
    max_pending: usize,
    retry_interval: Duration,
    action: Box<dyn RollForwardAction>,
}

/// Bounded, deduplicating roll-forward task queue with its worker pool.
pub struct RollForwardQueue {
    inner: Arc<QueueInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RollForwardQueue {
    /// Start the queue and its workers. Workers are named
    /// `sierra-rollfwd-0`, `sierra-rollfwd-1`, ...
    pub fn new(action: Box<dyn RollForwardAction>, config: RollForwardConfig) -> Self {
        let inner = Arc::new(QueueInner {
            state: Mutex::new(QueueState {
                rows: HashMap::new(),
                ready: VecDeque::new(),
                deferred: Vec::new(),
            }),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            shutdown: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            cells_rewritten: AtomicU64::new(0),
            max_pending: config.max_pending,
            retry_interval: config.retry_interval,
            action,
        });

        let mut workers = Vec::with_capacity(config.workers);
        for i in 0..config.workers.max(1) {
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("sierra-rollfwd-{}", i))
                .spawn(move || worker_loop(&inner))
                .expect("failed to spawn roll-forward worker");
            workers.push(handle);
        }

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Submit rows written by `txn` for eventual metadata rewrite.
    ///
    /// Never blocks and never fails: a submission for an already-queued
    /// transaction merges row sets, and a submission at capacity is
    /// dropped with only a log line. Correctness does not depend on it.
    pub fn enqueue(&self, txn: TxnId, rows: impl IntoIterator<Item = RowKey>) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        {
            let mut state = self.inner.state.lock();
            if let Some(existing) = state.rows.get_mut(&txn) {
                existing.extend(rows);
            } else {
                if state.rows.len() >= self.inner.max_pending {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    drop(state);
                    warn!(txn = %txn, "roll-forward queue full, submission dropped");
                    return;
                }
                state.rows.insert(txn, rows.into_iter().collect());
                state.ready.push_back(txn);
            }
        }
        self.inner.work_ready.notify_one();
    }

    /// Block until every ready task has been processed. Tasks deferred on
    /// a still-active writer are not waited for; they complete on their
    /// own once the writer terminates.
    pub fn drain(&self) {
        let mut state = self.inner.state.lock();
        while !state.ready.is_empty() || self.inner.active.load(Ordering::Acquire) > 0 {
            self.inner.idle.wait(&mut state);
        }
    }

    /// Signal workers to finish the ready backlog and exit, then join
    /// them. Deferred tasks are abandoned.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            // Lock before notifying so a worker between its shutdown check
            // and its wait cannot miss the wakeup.
            let state = self.inner.state.lock();
            if !state.deferred.is_empty() {
                debug!(
                    abandoned = state.deferred.len(),
                    "roll-forward shutdown with unresolved writers"
                );
            }
            self.inner.work_ready.notify_all();
        }

        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn stats(&self) -> RollForwardStats {
        let state = self.inner.state.lock();
        RollForwardStats {
            queued: state.ready.len(),
            deferred: state.deferred.len(),
            active: self.inner.active.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            requeued: self.inner.requeued.load(Ordering::Relaxed),
            cells_rewritten: self.inner.cells_rewritten.load(Ordering::Relaxed),
        }
    }
}

impl Drop for RollForwardQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decrements `active` and wakes drain waiters, even if the task panics.
struct ActiveTaskGuard<'a> {
    inner: &'a QueueInner,
}

impl Drop for ActiveTaskGuard<'_> {
    fn drop(&mut self) {
        let prev = self.inner.active.fetch_sub(1, Ordering::Release);
        if prev == 1 {
            let state = self.inner.state.lock();
            if state.ready.is_empty() {
                self.inner.idle.notify_all();
            }
        }
    }
}

fn worker_loop(inner: &QueueInner) {
    loop {
        let (txn, rows) = {
            let mut state = inner.state.lock();
            loop {
                if let Some(txn) = state.ready.pop_front() {
                    let rows = state.rows.remove(&txn).unwrap_or_default();
                    inner.active.fetch_add(1, Ordering::Release);
                    break (txn, rows);
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if state.deferred.is_empty() {
                    inner.work_ready.wait(&mut state);
                } else {
                    // Wake after the retry interval so deferred writers
                    // get re-polled even with no new submissions.
                    let _ = inner
                        .work_ready
                        .wait_for(&mut state, inner.retry_interval);
                    let deferred = std::mem::take(&mut state.deferred);
                    state.ready.extend(deferred);
                }
            }
        };

        let _guard = ActiveTaskGuard { inner };
        let row_list: Vec<RowKey> = rows.iter().cloned().collect();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            inner.action.attempt(txn, &row_list)
        }));

        match outcome {
            Ok(RollForwardOutcome::Resolved { cells_rewritten }) => {
                inner.completed.fetch_add(1, Ordering::Relaxed);
                inner
                    .cells_rewritten
                    .fetch_add(cells_rewritten as u64, Ordering::Relaxed);
            }
            Ok(RollForwardOutcome::WriterStillActive) => {
                inner.requeued.fetch_add(1, Ordering::Relaxed);
                let mut state = inner.state.lock();
                // Merge with rows that arrived while we held the task.
                state.rows.entry(txn).or_default().extend(rows);
                if !state.deferred.contains(&txn) && !state.ready.contains(&txn) {
                    state.deferred.push(txn);
                }
            }
            Ok(RollForwardOutcome::WriterUnknown) => {
                inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) => {
                error!(
                    txn = %txn,
                    "roll-forward task panicked: {:?}",
                    payload.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use static_assertions::assert_impl_all;

    assert_impl_all!(RollForwardQueue: Send, Sync);

    /// Scripted action that records attempts and answers from a queue of
    /// canned outcomes.
    struct ScriptedAction {
        attempts: PlMutex<Vec<(TxnId, Vec<RowKey>)>>,
        outcomes: PlMutex<VecDeque<RollForwardOutcome>>,
        fallback: RollForwardOutcome,
        delay: Duration,
    }

    impl ScriptedAction {
        fn new(fallback: RollForwardOutcome) -> Arc<Self> {
            Arc::new(Self {
                attempts: PlMutex::new(Vec::new()),
                outcomes: PlMutex::new(VecDeque::new()),
                fallback,
                delay: Duration::ZERO,
            })
        }

        fn slow(fallback: RollForwardOutcome, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                attempts: PlMutex::new(Vec::new()),
                outcomes: PlMutex::new(VecDeque::new()),
                fallback,
                delay,
            })
        }
    }

    impl RollForwardAction for Arc<ScriptedAction> {
        fn attempt(&self, txn: TxnId, rows: &[RowKey]) -> RollForwardOutcome {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.attempts.lock().push((txn, rows.to_vec()));
            self.outcomes.lock().pop_front().unwrap_or(self.fallback)
        }
    }

    fn fast_config(max_pending: usize) -> RollForwardConfig {
        RollForwardConfig {
            max_pending,
            workers: 1,
            retry_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_tasks_reach_the_action() {
        let action = ScriptedAction::new(RollForwardOutcome::Resolved { cells_rewritten: 1 });
        let queue = RollForwardQueue::new(Box::new(Arc::clone(&action)), fast_config(100));

        queue.enqueue(TxnId::new(1), vec![b"r1".to_vec()]);
        queue.enqueue(TxnId::new(2), vec![b"r2".to_vec()]);
        queue.drain();

        let attempts = action.attempts.lock();
        assert_eq!(attempts.len(), 2);
        let stats = queue.stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.cells_rewritten, 2);
        queue.shutdown();
    }

    #[test]
    fn test_submissions_merge_by_transaction() {
        let action = ScriptedAction::new(RollForwardOutcome::Resolved { cells_rewritten: 0 });
        let queue = RollForwardQueue::new(Box::new(Arc::clone(&action)), fast_config(100));

        // The worker may pop the first submission before the second lands,
        // so assert on the union of rows across attempts rather than on a
        // single merged task.
        queue.enqueue(TxnId::new(1), vec![b"a".to_vec()]);
        queue.enqueue(TxnId::new(1), vec![b"b".to_vec()]);
        queue.drain();
        queue.shutdown();

        let attempts = action.attempts.lock();
        let all_rows: BTreeSet<RowKey> = attempts
            .iter()
            .filter(|(txn, _)| *txn == TxnId::new(1))
            .flat_map(|(_, rows)| rows.iter().cloned())
            .collect();
        assert!(all_rows.contains(&b"a".to_vec()));
        assert!(all_rows.contains(&b"b".to_vec()));
    }

    #[test]
    fn test_capacity_overflow_drops_silently() {
        // A slow action keeps the single worker busy so the backlog
        // overflows the capacity of 1.
        let action = ScriptedAction::slow(
            RollForwardOutcome::Resolved { cells_rewritten: 0 },
            Duration::from_millis(5),
        );
        let queue = RollForwardQueue::new(Box::new(Arc::clone(&action)), fast_config(1));

        for i in 0..50 {
            queue.enqueue(TxnId::new(i), vec![b"r".to_vec()]);
        }
        queue.drain();
        let stats = queue.stats();
        // Everything either completed or was dropped; nothing errored.
        assert_eq!(stats.completed + stats.dropped, 50);
        assert!(stats.dropped > 0);
        queue.shutdown();
    }

    #[test]
    fn test_still_active_writer_is_retried() {
        let action = ScriptedAction::new(RollForwardOutcome::Resolved { cells_rewritten: 1 });
        action
            .outcomes
            .lock()
            .push_back(RollForwardOutcome::WriterStillActive);
        let queue = RollForwardQueue::new(Box::new(Arc::clone(&action)), fast_config(100));

        queue.enqueue(TxnId::new(1), vec![b"r1".to_vec()]);

        // First attempt defers, the retry interval promotes it, second
        // attempt resolves.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while queue.stats().completed == 0 {
            assert!(std::time::Instant::now() < deadline, "retry never resolved");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(queue.stats().requeued, 1);
        assert!(action.attempts.lock().len() >= 2);
        queue.shutdown();
    }

    #[test]
    fn test_unknown_writer_is_abandoned() {
        let action = ScriptedAction::new(RollForwardOutcome::WriterUnknown);
        let queue = RollForwardQueue::new(Box::new(Arc::clone(&action)), fast_config(100));

        queue.enqueue(TxnId::new(1), vec![b"r1".to_vec()]);
        queue.drain();
        let stats = queue.stats();
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.deferred, 0);
        queue.shutdown();
    }

    #[test]
    fn test_enqueue_after_shutdown_is_dropped() {
        let action = ScriptedAction::new(RollForwardOutcome::Resolved { cells_rewritten: 0 });
        let queue = RollForwardQueue::new(Box::new(Arc::clone(&action)), fast_config(100));
        queue.shutdown();

        queue.enqueue(TxnId::new(1), vec![b"r1".to_vec()]);
        assert_eq!(queue.stats().dropped, 1);
        assert!(action.attempts.lock().is_empty());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let action = ScriptedAction::new(RollForwardOutcome::Resolved { cells_rewritten: 0 });
        let queue = RollForwardQueue::new(Box::new(Arc::clone(&action)), fast_config(100));
        queue.enqueue(TxnId::new(1), vec![b"r1".to_vec()]);
        queue.drain();
        queue.shutdown();
        queue.shutdown();
    }
}
