//! Diagnostic tracing on stderr, controlled by `RUST_LOG`.
//!
//! This is separate from the run log under `.orchestrator/runs/`, which is
//! always written and never filtered.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_DIRECTIVE: &str = "warn";

/// Install the global subscriber. A no-op if one is already installed.
///
/// ```bash
/// RUST_LOG=orchestrator::execution=debug orchestrator run "add a health endpoint"
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .try_init();
}
