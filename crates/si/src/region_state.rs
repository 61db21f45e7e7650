//! Per-partition coordination of flush, compaction, split, and backup.
//!
//! One explicit state machine per partition replaces ad-hoc boolean flags:
//! at most one maintenance operation runs at a time, and its identity is
//! always known. Backup preparation declines fast when the partition is
//! busy; flush/compact/split wait (bounded) on an existing backup marker.

use parking_lot::{Condvar, Mutex};
use sierra_core::{BackupCoordinator, SiError, SiResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What a partition is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Idle,
    Flushing,
    Compacting,
    Splitting,
    BackingUp,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionState::Idle => "idle",
            PartitionState::Flushing => "flushing",
            PartitionState::Compacting => "compacting",
            PartitionState::Splitting => "splitting",
            PartitionState::BackingUp => "backing up",
        };
        f.write_str(s)
    }
}

/// Guarded state transitions for one partition.
pub struct PartitionStateMachine {
    partition: String,
    backup: Arc<dyn BackupCoordinator>,
    state: Mutex<PartitionState>,
    changed: Condvar,
    /// Upper bound on how long a maintenance request waits for the
    /// partition to come free.
    max_wait: Duration,
}

/// The backup marker may be cleared by an external process, which cannot
/// signal our condvar; waiters re-check it on this cadence.
const MARKER_POLL_INTERVAL: Duration = Duration::from_millis(20);

impl PartitionStateMachine {
    pub fn new(
        partition: impl Into<String>,
        backup: Arc<dyn BackupCoordinator>,
        max_wait: Duration,
    ) -> Self {
        Self {
            partition: partition.into(),
            backup,
            state: Mutex::new(PartitionState::Idle),
            changed: Condvar::new(),
            max_wait,
        }
    }

    pub fn current(&self) -> PartitionState {
        *self.state.lock()
    }

    /// Enter a maintenance state (`Flushing`, `Compacting`, or
    /// `Splitting`), waiting up to the configured bound for the partition
    /// to be idle and free of backup markers.
    ///
    /// A marker whose backup was aborted externally is cleared here rather
    /// than waited on forever.
    pub fn begin_maintenance(&self, target: PartitionState) -> SiResult<()> {
        debug_assert!(matches!(
            target,
            PartitionState::Flushing | PartitionState::Compacting | PartitionState::Splitting
        ));

        let deadline = Instant::now() + self.max_wait;
        let mut state = self.state.lock();
        loop {
            let marker = self.backup.marker_exists(&self.partition);
            if *state == PartitionState::Idle && !marker {
                *state = target;
                return Ok(());
            }

            if marker && self.backup.backup_aborted(&self.partition) {
                warn!(
                    partition = %self.partition,
                    "clearing marker of externally aborted backup"
                );
                self.backup.clear_marker(&self.partition);
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                let reason = if marker {
                    "backup in progress".to_string()
                } else {
                    format!("partition is {}", *state)
                };
                return Err(SiError::MaintenanceBlocked {
                    partition: self.partition.clone(),
                    reason,
                });
            }

            let wait = MARKER_POLL_INTERVAL.min(deadline - now);
            let _ = self.changed.wait_for(&mut state, wait);
        }
    }

    /// Leave a maintenance state.
    pub fn finish_maintenance(&self) {
        let mut state = self.state.lock();
        *state = PartitionState::Idle;
        self.changed.notify_all();
    }

    /// Answer a backup-prepare request. Declines without waiting if any
    /// maintenance operation is in flight; otherwise creates the marker
    /// and enters `BackingUp`.
    pub fn prepare_backup(&self) -> SiResult<()> {
        let mut state = self.state.lock();
        if *state != PartitionState::Idle {
            debug!(partition = %self.partition, state = %*state, "backup preparation declined");
            return Err(SiError::BackupPreparationDeclined {
                partition: self.partition.clone(),
                reason: format!("partition is {}", *state),
            });
        }
        self.backup.create_marker(&self.partition)?;
        *state = PartitionState::BackingUp;
        Ok(())
    }

    /// Finish a backup: clear the marker and free the partition.
    pub fn complete_backup(&self) {
        let mut state = self.state.lock();
        self.backup.clear_marker(&self.partition);
        *state = PartitionState::Idle;
        self.changed.notify_all();
    }
}

#[derive(Default)]
struct MarkerEntry {
    aborted: bool,
}

/// Process-local backup marker registry.
///
/// Stands in for the external backup orchestrator in single-process
/// deployments and tests; the core only ever talks to the
/// [`BackupCoordinator`] trait.
#[derive(Default)]
pub struct InMemoryBackupCoordinator {
    markers: Mutex<HashMap<String, MarkerEntry>>,
}

impl InMemoryBackupCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a partition's backup as externally aborted, leaving its marker
    /// behind the way a crashed orchestrator would.
    pub fn abort(&self, partition: &str) {
        if let Some(entry) = self.markers.lock().get_mut(partition) {
            entry.aborted = true;
        }
    }
}

impl BackupCoordinator for InMemoryBackupCoordinator {
    fn create_marker(&self, partition: &str) -> SiResult<()> {
        self.markers
            .lock()
            .insert(partition.to_string(), MarkerEntry::default());
        Ok(())
    }

    fn clear_marker(&self, partition: &str) {
        self.markers.lock().remove(partition);
    }

    fn marker_exists(&self, partition: &str) -> bool {
        self.markers.lock().contains_key(partition)
    }

    fn backup_aborted(&self, partition: &str) -> bool {
        self.markers
            .lock()
            .get(partition)
            .map(|e| e.aborted)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(max_wait: Duration) -> (PartitionStateMachine, Arc<InMemoryBackupCoordinator>) {
        let backup = Arc::new(InMemoryBackupCoordinator::new());
        let machine = PartitionStateMachine::new(
            "p0",
            Arc::clone(&backup) as Arc<dyn BackupCoordinator>,
            max_wait,
        );
        (machine, backup)
    }

    #[test]
    fn test_maintenance_round_trip() {
        let (machine, _) = machine(Duration::from_millis(100));
        machine.begin_maintenance(PartitionState::Flushing).unwrap();
        assert_eq!(machine.current(), PartitionState::Flushing);
        machine.finish_maintenance();
        assert_eq!(machine.current(), PartitionState::Idle);
    }

    #[test]
    fn test_backup_declined_while_compacting() {
        let (machine, backup) = machine(Duration::from_millis(100));
        machine
            .begin_maintenance(PartitionState::Compacting)
            .unwrap();

        let err = machine.prepare_backup().unwrap_err();
        assert!(matches!(err, SiError::BackupPreparationDeclined { .. }));
        // A declined preparation leaves no marker behind.
        assert!(!backup.marker_exists("p0"));

        machine.finish_maintenance();
        machine.prepare_backup().unwrap();
        assert!(backup.marker_exists("p0"));
        assert_eq!(machine.current(), PartitionState::BackingUp);
    }

    #[test]
    fn test_maintenance_blocks_on_backup_marker() {
        let (machine, _backup) = machine(Duration::from_millis(50));
        machine.prepare_backup().unwrap();

        let err = machine
            .begin_maintenance(PartitionState::Flushing)
            .unwrap_err();
        assert!(matches!(err, SiError::MaintenanceBlocked { .. }));
        assert!(err.is_retryable());

        machine.complete_backup();
        machine.begin_maintenance(PartitionState::Flushing).unwrap();
    }

    #[test]
    fn test_maintenance_proceeds_once_backup_completes() {
        let machine = Arc::new({
            let backup = Arc::new(InMemoryBackupCoordinator::new());
            PartitionStateMachine::new(
                "p0",
                backup as Arc<dyn BackupCoordinator>,
                Duration::from_secs(5),
            )
        });
        machine.prepare_backup().unwrap();

        let waiter = {
            let machine = Arc::clone(&machine);
            std::thread::spawn(move || {
                machine.begin_maintenance(PartitionState::Splitting)?;
                machine.finish_maintenance();
                Ok::<(), SiError>(())
            })
        };

        std::thread::sleep(Duration::from_millis(30));
        machine.complete_backup();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_aborted_backup_marker_is_cleared() {
        let (machine, backup) = machine(Duration::from_secs(5));
        machine.prepare_backup().unwrap();
        // The orchestrator dies: state goes stale with the marker behind.
        machine.finish_maintenance();
        backup.abort("p0");

        machine.begin_maintenance(PartitionState::Compacting).unwrap();
        assert!(!backup.marker_exists("p0"));
        machine.finish_maintenance();
    }

    #[test]
    fn test_only_one_maintenance_at_a_time() {
        let (machine, _) = machine(Duration::from_millis(50));
        machine.begin_maintenance(PartitionState::Flushing).unwrap();
        let err = machine
            .begin_maintenance(PartitionState::Compacting)
            .unwrap_err();
        assert!(matches!(err, SiError::MaintenanceBlocked { .. }));
        machine.finish_maintenance();
    }
}
