// packages/protocol/src/interception/interceptor.rs
//! Per-request interceptor
//!
//! Owns the lifecycle of one intercepted request, standing in for a real
//! transport: it asks the delegate captured at creation for a decision and
//! replays that decision to the host through the client sink.
//!
//! # State machine
//!
//! ```text
//! Created ──start──▶ AwaitingDecision ──response──▶ EmittingResponse ──▶ Finished
//!    │                    │       └──────failure──▶ Failed ─────────────▶ Finished
//!    └──────stop──────────┴──────────stop──────────────▶ Canceled
//! ```
//!
//! Every emission is gated on the current state under one lock, so `stop()`
//! racing with delivery either happens before an event (and suppresses it)
//! or after it; exactly one terminal path is ever taken.

use crate::interception::client::{ProtocolClient, TransportEvent};
use crate::interception::decision::{DelegateDecision, ResponseBody, SyntheticResponse};
use crate::interception::delegate::InterceptDelegate;
use crate::interception::request::InterceptedRequest;
use crate::interception::stack::ProtocolTask;
use crate::utils::config::InterceptorConfig;
use crate::utils::errors::{InterceptError, Result};
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of an interceptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptorState {
    Created,
    AwaitingDecision,
    EmittingResponse,
    /// Held while the failure signal is emitted
    Failed,
    Finished,
    Canceled,
}

impl InterceptorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InterceptorState::Finished | InterceptorState::Canceled)
    }
}

/// Which terminal path an interceptor took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptOutcome {
    /// Response metadata, body and completion were emitted
    Completed,
    /// A failure was emitted. Usually it stands alone; if the body stream
    /// malfunctioned, `Response` and some `Data` went out before it.
    Failed,
    /// Stopped before finishing; nothing further was emitted
    Canceled,
}

struct Lifecycle {
    state: InterceptorState,
    outcome: Option<InterceptOutcome>,
}

struct Shared {
    request: Arc<InterceptedRequest>,
    delegate: Arc<dyn InterceptDelegate>,
    client: Arc<dyn ProtocolClient>,
    config: InterceptorConfig,
    lifecycle: Mutex<Lifecycle>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one interception; clones share the same lifecycle
#[derive(Clone)]
pub struct Interceptor {
    shared: Arc<Shared>,
}

impl Interceptor {
    /// Create an interceptor bound to an already captured delegate
    pub fn new(
        request: Arc<InterceptedRequest>,
        delegate: Arc<dyn InterceptDelegate>,
        client: Arc<dyn ProtocolClient>,
        config: InterceptorConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                request,
                delegate,
                client,
                config,
                lifecycle: Mutex::new(Lifecycle {
                    state: InterceptorState::Created,
                    outcome: None,
                }),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn request(&self) -> &InterceptedRequest {
        &self.shared.request
    }

    pub fn state(&self) -> InterceptorState {
        self.shared.lifecycle.lock().state
    }

    /// Terminal path taken, once the interceptor has reached one
    pub fn outcome(&self) -> Option<InterceptOutcome> {
        self.shared.lifecycle.lock().outcome
    }

    /// Begin interception on the current tokio runtime
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            InterceptError::InvalidState("interceptor started outside a tokio runtime".into())
        })?;

        {
            let mut lifecycle = self.shared.lifecycle.lock();
            if lifecycle.state != InterceptorState::Created {
                return Err(InterceptError::InvalidState(format!(
                    "cannot start interceptor in state {:?}",
                    lifecycle.state
                )));
            }
            lifecycle.state = InterceptorState::AwaitingDecision;
        }

        debug!(
            "Starting interception {} for {} {}",
            self.shared.request.id(),
            self.shared.request.method(),
            self.shared.request.uri()
        );

        let shared = Arc::clone(&self.shared);
        let handle = runtime.spawn(async move { shared.run().await });
        *self.shared.task.lock() = Some(handle);

        Ok(())
    }

    /// Cancel the interception. Returns `false` if it had already ended.
    pub fn stop(&self) -> bool {
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            if lifecycle.state.is_terminal() {
                return false;
            }
            lifecycle.state = InterceptorState::Canceled;
            lifecycle.outcome = Some(InterceptOutcome::Canceled);
        }

        self.shared.cancel.cancel();
        info!("Interception {} canceled", self.shared.request.id());

        let delegate = &self.shared.delegate;
        let request = &self.shared.request;
        if std::panic::catch_unwind(AssertUnwindSafe(|| delegate.on_cancel(request))).is_err() {
            warn!("Delegate panicked while observing cancellation of {}", request.id());
        }

        true
    }

    /// Wait until the background task has exited
    pub async fn join(&self) {
        let handle = self.shared.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Interceptor task failed: {}", e);
            }
        }
    }
}

impl ProtocolTask for Interceptor {
    fn start(&self) -> Result<()> {
        Interceptor::start(self)
    }

    fn stop(&self) -> bool {
        Interceptor::stop(self)
    }
}

impl Shared {
    async fn run(self: Arc<Self>) {
        let decision = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            decision = self.decide() => decision,
        };

        match decision {
            Ok(DelegateDecision::Respond(response)) => self.respond(response).await,
            Ok(DelegateDecision::Fail(failure)) => {
                debug!("Delegate failed {} with {}", self.request.id(), failure);
                self.fail(InterceptError::Synthetic(failure));
            }
            Err(e) => {
                warn!("Delegate malfunction on {}: {}", self.request.id(), e);
                self.fail(e);
            }
        }
    }

    /// Ask the delegate, containing errors and panics
    async fn decide(&self) -> Result<DelegateDecision> {
        match AssertUnwindSafe(self.delegate.decide(&self.request))
            .catch_unwind()
            .await
        {
            Ok(Ok(decision)) => Ok(decision),
            Ok(Err(e)) => Err(InterceptError::DelegateMalfunction(format!("{:#}", e))),
            Err(panic) => Err(InterceptError::DelegateMalfunction(panic_message(&*panic))),
        }
    }

    async fn respond(&self, response: SyntheticResponse) {
        let SyntheticResponse {
            status,
            headers,
            body,
        } = response;

        if self.config.log_responses {
            debug!("Synthetic response for {}: {}", self.request.id(), status);
        }

        let metadata = TransportEvent::Response { status, headers };
        if !self.emit(
            InterceptorState::AwaitingDecision,
            InterceptorState::EmittingResponse,
            metadata,
        ) {
            return;
        }

        match body {
            ResponseBody::Empty => {}
            ResponseBody::Full(bytes) => {
                for chunk in split_body(bytes, self.config.body_chunk_size) {
                    if !self.emit_data(chunk) {
                        return;
                    }
                }
            }
            ResponseBody::Chunks(chunks) => {
                for chunk in chunks {
                    if !self.emit_data(chunk) {
                        return;
                    }
                }
            }
            ResponseBody::Stream(mut stream) => loop {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return,
                    next = AssertUnwindSafe(stream.next()).catch_unwind() => next,
                };

                match next {
                    Ok(Some(chunk)) => {
                        if !self.emit_data(chunk) {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(panic) => {
                        let reason = panic_message(&*panic);
                        warn!("Body stream for {} panicked: {}", self.request.id(), reason);
                        self.fail(InterceptError::DelegateMalfunction(reason));
                        return;
                    }
                }
            },
        }

        if self.emit(
            InterceptorState::EmittingResponse,
            InterceptorState::Finished,
            TransportEvent::Finished,
        ) {
            self.lifecycle.lock().outcome = Some(InterceptOutcome::Completed);
            debug!("Interception {} finished", self.request.id());
        }
    }

    fn emit_data(&self, chunk: Bytes) -> bool {
        if chunk.is_empty() {
            return self.lifecycle.lock().state == InterceptorState::EmittingResponse;
        }
        self.emit(
            InterceptorState::EmittingResponse,
            InterceptorState::EmittingResponse,
            TransportEvent::Data(chunk),
        )
    }

    /// Emit `event` only if still in `expected`, moving to `next`
    fn emit(&self, expected: InterceptorState, next: InterceptorState, event: TransportEvent) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != expected {
            debug!(
                "Suppressed {:?} for {} in state {:?}",
                event,
                self.request.id(),
                lifecycle.state
            );
            return false;
        }
        lifecycle.state = next;
        self.client.emit(event);
        true
    }

    fn fail(&self, error: InterceptError) {
        let mut lifecycle = self.lifecycle.lock();
        if !matches!(
            lifecycle.state,
            InterceptorState::AwaitingDecision | InterceptorState::EmittingResponse
        ) {
            debug!("Suppressed failure for {}: {}", self.request.id(), error);
            return;
        }
        lifecycle.state = InterceptorState::Failed;
        self.client.emit(TransportEvent::Failed(error));
        lifecycle.state = InterceptorState::Finished;
        lifecycle.outcome = Some(InterceptOutcome::Failed);
    }
}

/// Split a whole body into zero-copy slices of at most `chunk_size` bytes
fn split_body(body: Bytes, chunk_size: Option<usize>) -> Vec<Bytes> {
    match chunk_size {
        Some(size) if size > 0 && body.len() > size => (0..body.len())
            .step_by(size)
            .map(|start| body.slice(start..(start + size).min(body.len())))
            .collect(),
        _ => vec![body],
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("delegate panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("delegate panicked: {}", message)
    } else {
        "delegate panicked".to_string()
    }
}
