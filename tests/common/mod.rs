#![allow(dead_code)]

use deferred_kernel::{Scheduler, SchedulerBuilder};

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs a test-friendly tracing subscriber once per test binary.
///
/// Set `RUST_LOG=deferred_kernel=trace` to see scheduler cycles.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A scheduler driven by a manual clock.
pub fn manual_scheduler() -> Scheduler {
    init_test_logging();
    SchedulerBuilder::new()
        .manual_clock()
        .build()
        .expect("manual scheduler")
}

/// A scheduler reading the wall clock.
pub fn wall_scheduler() -> Scheduler {
    init_test_logging();
    SchedulerBuilder::new().build().expect("wall scheduler")
}
