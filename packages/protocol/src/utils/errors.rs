// packages/protocol/src/utils/errors.rs
//! Error types for the interception layer
//!
//! Delegate-declared failures travel unchanged to the caller. Anything that
//! goes wrong inside a delegate is normalized into a single generic
//! interception failure.

use crate::interception::decision::SyntheticFailure;
use thiserror::Error;

/// Code reported for failures the delegate did not declare itself
pub const GENERIC_FAILURE_CODE: &str = "interception-error";

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, InterceptError>;

/// Errors surfaced by the interception layer
#[derive(Debug, Error)]
pub enum InterceptError {
    /// Failure decided by the delegate, delivered verbatim
    #[error("{0}")]
    Synthetic(SyntheticFailure),

    /// Delegate returned an error or panicked while deciding
    #[error("interception failed: {0}")]
    DelegateMalfunction(String),

    #[error("request canceled")]
    Canceled,

    #[error("invalid interceptor state: {0}")]
    InvalidState(String),

    #[error("invalid request uri: {0}")]
    InvalidUri(#[from] hyper::http::uri::InvalidUri),

    /// Error from the real transport on the pass-through path
    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("observability error: {0}")]
    Observability(String),
}

impl InterceptError {
    /// Failure code as seen by the caller
    pub fn code(&self) -> &str {
        match self {
            InterceptError::Synthetic(failure) => failure.code(),
            InterceptError::Canceled => "canceled",
            _ => GENERIC_FAILURE_CODE,
        }
    }

    /// Whether this failure was declared by the delegate
    pub fn is_synthetic(&self) -> bool {
        matches!(self, InterceptError::Synthetic(_))
    }
}

impl From<SyntheticFailure> for InterceptError {
    fn from(failure: SyntheticFailure) -> Self {
        InterceptError::Synthetic(failure)
    }
}
