// packages/protocol/src/observability.rs
//! Tracing setup
//!
//! `RUST_LOG` controls verbosity, e.g.
//! `RUST_LOG=replicator_protocol=debug cargo test`.

use crate::utils::config::InterceptorConfig;
use crate::utils::errors::{InterceptError, Result};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber
pub fn init_tracing(config: &InterceptorConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    };

    result.map_err(|e| InterceptError::Observability(e.to_string()))
}

/// Install a test-writer subscriber once per process; later calls are no-ops
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
