// packages/protocol/src/interception/delegate.rs
//! Capability interface implemented by test code
//!
//! A delegate decides which requests to intercept and what each of them
//! should observe. Decisions may be produced immediately or after an
//! asynchronous delay; delegates must never block the calling thread to
//! simulate latency.

use crate::interception::decision::DelegateDecision;
use crate::interception::request::InterceptedRequest;
use async_trait::async_trait;

#[async_trait]
pub trait InterceptDelegate: Send + Sync {
    /// Whether this request should be intercepted. Must be side-effect free.
    fn matches(&self, request: &InterceptedRequest) -> bool;

    /// Produce the decision for an intercepted request.
    ///
    /// Called at most once per request. An `Err` (or a panic) is reported to
    /// the caller as a generic interception failure.
    async fn decide(&self, request: &InterceptedRequest) -> anyhow::Result<DelegateDecision>;

    /// Called once when the caller cancels an in-flight interception.
    fn on_cancel(&self, _request: &InterceptedRequest) {}
}
