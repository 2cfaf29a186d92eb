//! Diagnostic logging setup
//!
//! `LANONASIS_VERBOSE` (truthy) turns on debug-level output; `RUST_LOG`
//! still wins when set explicitly.

use lanonasis_core::defaults;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. Safe to call more than once;
/// later calls are no-ops.
pub fn init_logging() {
    let default_directive = if verbose_enabled() { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Whether `LANONASIS_VERBOSE` holds a truthy value.
pub fn verbose_enabled() -> bool {
    std::env::var(defaults::ENV_VERBOSE)
        .map(|value| defaults::is_truthy(&value))
        .unwrap_or(false)
}
