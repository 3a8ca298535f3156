// packages/protocol/src/lib.rs
//! Replicator URL Protocol
//!
//! Network interception for replication acceptance tests. Tests install a
//! delegate that decides which outbound requests to intercept and what the
//! replicator should observe for each: a synthetic response, streamed or
//! whole, or a synthetic failure. Everything else goes over the real
//! transport.
//!
//! # Architecture
//!
//! - **interception**: registry hook, interceptors, protocol stack, tower host
//! - **observability**: tracing subscriber setup
//! - **utils**: configuration and error types

pub mod interception;
pub mod observability;
pub mod utils;

// Re-export commonly used types
pub use interception::{
    DelegateDecision, InstallGuard, InterceptDelegate, InterceptLayer, InterceptedRequest,
    InterceptionContext, Interceptor, ProtocolStack, ReplicatorProtocol, SyntheticFailure,
    SyntheticResponse,
};
pub use utils::config::InterceptorConfig;
pub use utils::errors::{InterceptError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
