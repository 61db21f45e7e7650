//! Backup markers against partition maintenance, through the facade.

mod common;

use common::test_core;
use sierra_core::BackupCoordinator;
use sierra_si::InMemoryBackupCoordinator;
use sierradb::{PartitionState, RollForwardConfig, SiCore, SiError};
use std::sync::Arc;
use std::time::Duration;

fn shared_core(partition: &str, backup: Arc<InMemoryBackupCoordinator>) -> SiCore {
    common::init_tracing();
    SiCore::builder(partition)
        .backup(backup as Arc<dyn BackupCoordinator>)
        .rollforward(RollForwardConfig {
            max_pending: 1024,
            workers: 1,
            retry_interval: Duration::from_millis(10),
        })
        .maintenance_wait(Duration::from_millis(100))
        .build()
}

#[test]
fn test_backup_window_blocks_maintenance() {
    let core = test_core("p0");
    assert_eq!(core.partition_state(), PartitionState::Idle);

    core.prepare_backup().unwrap();
    assert_eq!(core.partition_state(), PartitionState::BackingUp);

    let err = core.flush().unwrap_err();
    assert!(matches!(err, SiError::MaintenanceBlocked { .. }));
    assert!(err.is_retryable());
    let err = core.compact().unwrap_err();
    assert!(matches!(err, SiError::MaintenanceBlocked { .. }));

    core.complete_backup();
    assert_eq!(core.partition_state(), PartitionState::Idle);
    core.flush().unwrap();
    core.compact().unwrap();
}

#[test]
fn test_second_backup_request_is_declined() {
    let core = test_core("p0");
    core.prepare_backup().unwrap();

    let err = core.prepare_backup().unwrap_err();
    assert!(matches!(err, SiError::BackupPreparationDeclined { .. }));
    assert!(err.is_retryable());

    // The decline left the original window intact.
    assert_eq!(core.partition_state(), PartitionState::BackingUp);
    core.complete_backup();
    core.prepare_backup().unwrap();
    core.complete_backup();
}

#[test]
fn test_backup_windows_are_per_partition() {
    let backup = Arc::new(InMemoryBackupCoordinator::new());
    let p0 = shared_core("p0", Arc::clone(&backup));
    let p1 = shared_core("p1", Arc::clone(&backup));

    p0.prepare_backup().unwrap();
    assert!(backup.marker_exists("p0"));
    assert!(!backup.marker_exists("p1"));

    // A marker on p0 does not hold p1's maintenance.
    p1.flush().unwrap();
    assert!(matches!(
        p0.flush().unwrap_err(),
        SiError::MaintenanceBlocked { .. }
    ));

    p0.complete_backup();
    p0.flush().unwrap();
}

#[test]
fn test_externally_created_marker_blocks_flush() {
    let backup = Arc::new(InMemoryBackupCoordinator::new());
    let core = shared_core("p0", Arc::clone(&backup));

    // Another process owns the backup; this core only sees the marker.
    backup.create_marker("p0").unwrap();
    let err = core.flush().unwrap_err();
    assert!(matches!(err, SiError::MaintenanceBlocked { .. }));

    backup.clear_marker("p0");
    core.flush().unwrap();
}

#[test]
fn test_aborted_external_backup_is_cleaned_up() {
    let backup = Arc::new(InMemoryBackupCoordinator::new());
    let core = shared_core("p0", Arc::clone(&backup));

    // The external orchestrator crashed mid-backup: the marker stays
    // behind but the backup is flagged aborted.
    backup.create_marker("p0").unwrap();
    backup.abort("p0");

    // Maintenance clears the stale marker instead of timing out.
    core.flush().unwrap();
    assert!(!backup.marker_exists("p0"));
}

#[test]
fn test_writes_proceed_during_backup_window() {
    let core = test_core("p0");
    core.prepare_backup().unwrap();

    // Backup only excludes maintenance; transactions keep flowing.
    let txn = core.begin().unwrap();
    core.put(txn.id(), b"r".to_vec(), b"v".to_vec()).unwrap();
    core.commit(txn.id()).unwrap();

    let reader = core.begin().unwrap();
    assert_eq!(core.get(reader.id(), b"r").unwrap(), Some(b"v".to_vec()));
    core.complete_backup();
}

#[test]
fn test_maintenance_waits_out_a_short_backup() {
    let core = Arc::new(
        SiCore::builder("p0")
            .maintenance_wait(Duration::from_secs(5))
            .build(),
    );
    core.prepare_backup().unwrap();

    let flusher = {
        let core = Arc::clone(&core);
        std::thread::spawn(move || core.flush())
    };

    std::thread::sleep(Duration::from_millis(30));
    core.complete_backup();
    flusher.join().unwrap().unwrap();
}
