//! Tracing setup for tests and benchmarks.
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan, util::SubscriberInitExt};

/// Initializes a tracing subscriber with an [`EnvFilter`] for use in tests.
///
/// Keep the returned guard alive for the duration of the test. Output is
/// configured via the `RUST_LOG` env variable.
///
/// ```ignore
/// let _g = silentot_core::test_utils::init_tracing();
/// ```
pub fn init_tracing() -> tracing::dispatcher::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_test_writer()
        .set_default()
}

/// Install a global subscriber for benchmarks. Subsequent calls are ignored.
pub fn init_bench_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}
