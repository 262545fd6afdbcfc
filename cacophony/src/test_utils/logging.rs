//! Logging during tests.

use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};

/// Captures log output of the calling test thread.
///
/// Output goes through the test harness capture and only shows for failing tests. The
/// filter comes from `RUST_LOG` and defaults to everything at TRACE. Worker threads log to
/// whatever global subscriber exists, so their events are not captured here.
#[must_use = "logging stops when the guard is dropped"]
pub fn setup() -> tracing::subscriber::DefaultGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trace"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .with_test_writer()
        .finish()
        .set_default()
}
