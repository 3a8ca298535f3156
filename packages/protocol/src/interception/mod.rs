// packages/protocol/src/interception/mod.rs
//! Request interception layer
//!
//! Lets acceptance tests answer the replicator's HTTP traffic with canned or
//! faulty responses instead of a live server:
//!
//! - **Registry**: the single active delegate and the handler that exposes it
//! - **Interceptor**: per-request lifecycle replaying a delegate decision
//! - **Stack**: pluggable-transport extension point handlers register with
//! - **Service**: tower layer hosting the stack in front of a real transport
//!
//! # Architecture
//!
//! ```text
//! Replicator
//!     │
//!     └─ HTTP Request → InterceptService ─┬─ claimed → Interceptor → Delegate
//!                                         └─ unclaimed → Real Transport
//! ```

pub mod client;
pub mod decision;
pub mod delegate;
pub mod interceptor;
pub mod registry;
pub mod request;
pub mod service;
pub mod stack;

// Re-export commonly used types
pub use client::{ProtocolClient, TransportEvent};
pub use decision::{DelegateDecision, ResponseBody, SyntheticFailure, SyntheticResponse};
pub use delegate::InterceptDelegate;
pub use interceptor::{InterceptOutcome, Interceptor, InterceptorState};
pub use registry::{InstallGuard, InterceptionContext, ReplicatorProtocol};
pub use request::InterceptedRequest;
pub use service::{InterceptBody, InterceptLayer, InterceptService};
pub use stack::{HandlerId, ProtocolHandler, ProtocolStack, ProtocolTask};
