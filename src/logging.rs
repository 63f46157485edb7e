//! Tracing initialization, matching the teacher's
//! `tracing_subscriber::fmt().with_env_filter(...)` idiom used at process
//! start in `knhk-sidecar::run`.

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber. Safe to call more than once
/// per process in tests; subsequent calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
