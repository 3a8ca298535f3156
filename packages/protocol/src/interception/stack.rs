// packages/protocol/src/interception/stack.rs
//! Pluggable-transport extension point
//!
//! The stack keeps the protocol handlers registered with it and, for each
//! outbound request, picks the handler that will serve it. Handlers are
//! consulted most recently registered first; a request no handler claims
//! goes over the real transport.

use crate::interception::client::ProtocolClient;
use crate::interception::request::InterceptedRequest;
use crate::utils::errors::Result;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A handler the stack can route requests to
pub trait ProtocolHandler: Send + Sync {
    /// Human readable handler name, used in logs
    fn name(&self) -> &str;

    /// Whether this handler wants the request. Must be side-effect free.
    fn can_handle(&self, request: &InterceptedRequest) -> bool;

    /// Create the task serving one request, reporting through `client`.
    ///
    /// `None` means the handler changed its mind between `can_handle` and
    /// creation; the host then falls back to the real transport.
    fn create(
        &self,
        request: Arc<InterceptedRequest>,
        client: Arc<dyn ProtocolClient>,
    ) -> Option<Box<dyn ProtocolTask>>;
}

/// Lifecycle callbacks of one handled request
pub trait ProtocolTask: Send + Sync {
    fn start(&self) -> Result<()>;

    /// Cancel the request. Idempotent; returns whether anything was canceled.
    fn stop(&self) -> bool;
}

/// Identifier returned by [`ProtocolStack::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    handler: Arc<dyn ProtocolHandler>,
}

/// Registry of protocol handlers
pub struct ProtocolStack {
    /// Registration order; lookups walk it in reverse
    handlers: RwLock<Vec<Registration>>,

    next_id: AtomicU64,
}

static GLOBAL_STACK: Lazy<Arc<ProtocolStack>> = Lazy::new(|| Arc::new(ProtocolStack::new()));

impl ProtocolStack {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Process-wide stack
    pub fn global() -> Arc<ProtocolStack> {
        Arc::clone(&GLOBAL_STACK)
    }

    /// Register a handler; it takes precedence over earlier registrations
    pub fn register(&self, handler: Arc<dyn ProtocolHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));

        info!("Registering protocol handler {} ({:?})", handler.name(), id);

        self.handlers.write().push(Registration { id, handler });
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();

        match handlers.iter().position(|r| r.id == id) {
            Some(index) => {
                let removed = handlers.remove(index);
                info!("Unregistered protocol handler {} ({:?})", removed.handler.name(), id);
                true
            }
            None => {
                warn!("Protocol handler {:?} was not registered", id);
                false
            }
        }
    }

    pub fn is_registered(&self, id: HandlerId) -> bool {
        self.handlers.read().iter().any(|r| r.id == id)
    }

    /// Handler that will serve `request`, if any
    pub fn handler_for(&self, request: &InterceptedRequest) -> Option<Arc<dyn ProtocolHandler>> {
        let handlers = self.handlers.read();

        for registration in handlers.iter().rev() {
            if registration.handler.can_handle(request) {
                debug!(
                    "Handler {} claims {} {}",
                    registration.handler.name(),
                    request.method(),
                    request.uri()
                );
                return Some(Arc::clone(&registration.handler));
            }
        }

        debug!("No handler for {} {}, passing through", request.method(), request.uri());
        None
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl Default for ProtocolStack {
    fn default() -> Self {
        Self::new()
    }
}
