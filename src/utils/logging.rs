//! Structured logging setup.
//!
//! Embedding applications call [`init`] once at startup; libraries only emit
//! `tracing` events and never install subscribers themselves.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Install a global subscriber honoring `RUST_LOG` with the configured
/// filter as fallback. Safe to call more than once; later calls are no-ops.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter.clone()));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
