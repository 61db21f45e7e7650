//! Shared helpers for the integration test suites.
//!
//! Import via `mod common;` from any test's main file.

#![allow(dead_code)]

use sierradb::{RollForwardConfig, SiCore};
use std::sync::Once;
use std::time::Duration;

static INIT_TRACING: Once = Once::new();

/// Install a test-writer tracing subscriber once per test binary.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// A core tuned for tests: short roll-forward retry interval and a short
/// maintenance wait so blocked-maintenance tests fail fast.
pub fn test_core(partition: &str) -> SiCore {
    init_tracing();
    SiCore::builder(partition)
        .rollforward(RollForwardConfig {
            max_pending: 1024,
            workers: 1,
            retry_interval: Duration::from_millis(10),
        })
        .maintenance_wait(Duration::from_millis(100))
        .build()
}
