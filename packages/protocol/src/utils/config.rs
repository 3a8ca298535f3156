// packages/protocol/src/utils/config.rs
//! Interceptor configuration
//!
//! Defaults can be overridden through `REPLICATOR_PROTOCOL_*` environment
//! variables, e.g. `REPLICATOR_PROTOCOL_BODY_CHUNK_SIZE=512`.

use crate::utils::errors::Result;
use config::{Config, Environment};
use serde::Deserialize;
use tracing::debug;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "REPLICATOR_PROTOCOL";

/// Configuration shared by the registry hook and its interceptors
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Split whole response bodies into chunks of at most this many bytes
    pub body_chunk_size: Option<usize>,

    /// Log intercepted requests
    pub log_requests: bool,

    /// Log synthetic responses
    pub log_responses: bool,

    /// Request bodies are logged up to this many bytes
    pub max_log_body_size: usize,

    /// Emit logs as JSON
    pub log_json: bool,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            body_chunk_size: None,
            log_requests: true,
            log_responses: true,
            max_log_body_size: 10_000,
            log_json: false,
        }
    }
}

impl InterceptorConfig {
    /// Load configuration from the environment on top of the defaults
    pub fn load() -> Result<Self> {
        let settings = Config::builder()
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .try_parsing(true),
            )
            .build()?;

        let config: InterceptorConfig = settings.try_deserialize()?;
        debug!("Loaded interceptor config: {:?}", config);
        Ok(config)
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.body_chunk_size = Some(size.max(1));
        self
    }
}
