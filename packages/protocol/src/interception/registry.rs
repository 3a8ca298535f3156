// packages/protocol/src/interception/registry.rs
//! Protocol registry hook
//!
//! [`InterceptionContext`] holds the single active delegate. It does not own
//! the delegate: the test keeps it alive, and once the test drops it the
//! context falls back to pass-through. [`ReplicatorProtocol`] exposes the
//! context to a [`ProtocolStack`] as a protocol handler, and
//! [`InstallGuard`] brackets that registration so interception never leaks
//! past the scope that installed it.
//!
//! # Usage
//!
//! ```ignore
//! let context = Arc::new(InterceptionContext::new(InterceptorConfig::default()));
//! let stack = Arc::new(ProtocolStack::new());
//! let guard = ReplicatorProtocol::install(context, stack.clone());
//!
//! let delegate: Arc<dyn InterceptDelegate> = Arc::new(MyDelegate::new());
//! guard.set_delegate(Some(&delegate));
//! // ... drive the replicator through an InterceptLayer built on `stack` ...
//! ```

use crate::interception::client::ProtocolClient;
use crate::interception::delegate::InterceptDelegate;
use crate::interception::interceptor::Interceptor;
use crate::interception::request::InterceptedRequest;
use crate::interception::stack::{HandlerId, ProtocolHandler, ProtocolStack, ProtocolTask};
use crate::utils::config::InterceptorConfig;
use arc_swap::ArcSwapOption;
use once_cell::sync::Lazy;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

static GLOBAL_CONTEXT: Lazy<Arc<InterceptionContext>> = Lazy::new(|| {
    let config = InterceptorConfig::load().unwrap_or_else(|e| {
        warn!("Falling back to default interceptor config: {}", e);
        InterceptorConfig::default()
    });
    Arc::new(InterceptionContext::new(config))
});

/// Holder of the active delegate
pub struct InterceptionContext {
    /// Swapped atomically; readers see either the old or the new delegate
    active: ArcSwapOption<Weak<dyn InterceptDelegate>>,

    /// Live install guards; the last one to drop clears the delegate
    installs: AtomicUsize,

    config: InterceptorConfig,
}

impl InterceptionContext {
    pub fn new(config: InterceptorConfig) -> Self {
        Self {
            active: ArcSwapOption::empty(),
            installs: AtomicUsize::new(0),
            config,
        }
    }

    /// Process-wide context, configured from the environment
    pub fn global() -> Arc<InterceptionContext> {
        Arc::clone(&GLOBAL_CONTEXT)
    }

    pub fn config(&self) -> &InterceptorConfig {
        &self.config
    }

    /// Replace the active delegate; `None` restores pass-through
    pub fn set_delegate(&self, delegate: Option<&Arc<dyn InterceptDelegate>>) {
        match delegate {
            Some(delegate) => {
                debug!("Installing interception delegate");
                self.active.store(Some(Arc::new(Arc::downgrade(delegate))));
            }
            None => self.clear_delegate(),
        }
    }

    pub fn clear_delegate(&self) {
        if self.active.swap(None).is_some() {
            debug!("Cleared interception delegate");
        }
    }

    /// Strong reference to the delegate, if one is installed and alive
    pub fn active_delegate(&self) -> Option<Arc<dyn InterceptDelegate>> {
        self.active.load_full().and_then(|weak| weak.upgrade())
    }

    pub fn has_delegate(&self) -> bool {
        self.active_delegate().is_some()
    }

    /// Number of install guards currently holding this context
    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    /// Whether the active delegate wants to intercept `request`
    pub fn can_handle(&self, request: &InterceptedRequest) -> bool {
        match self.active_delegate() {
            Some(delegate) => delegate_matches(delegate.as_ref(), request),
            None => false,
        }
    }
}

impl Default for InterceptionContext {
    fn default() -> Self {
        Self::new(InterceptorConfig::default())
    }
}

/// A panicking match predicate declines rather than taking the stack down
fn delegate_matches(delegate: &dyn InterceptDelegate, request: &InterceptedRequest) -> bool {
    std::panic::catch_unwind(AssertUnwindSafe(|| delegate.matches(request))).unwrap_or_else(|_| {
        warn!("Delegate match predicate panicked for {}; passing through", request.id());
        false
    })
}

/// Protocol handler routing matched requests to per-request interceptors
pub struct ReplicatorProtocol {
    context: Arc<InterceptionContext>,
}

impl ReplicatorProtocol {
    pub fn new(context: Arc<InterceptionContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<InterceptionContext> {
        &self.context
    }

    /// Register with `stack` until the returned guard is dropped
    pub fn install(context: Arc<InterceptionContext>, stack: Arc<ProtocolStack>) -> InstallGuard {
        let handler = Arc::new(ReplicatorProtocol::new(Arc::clone(&context)));
        let id = stack.register(handler);
        context.installs.fetch_add(1, Ordering::SeqCst);

        info!("Replicator interception installed");

        InstallGuard { stack, context, id }
    }

    /// Register the global context with the global stack
    pub fn install_global() -> InstallGuard {
        Self::install(InterceptionContext::global(), ProtocolStack::global())
    }

    /// Set the delegate of the global context
    pub fn set_test_delegate(delegate: Option<&Arc<dyn InterceptDelegate>>) {
        InterceptionContext::global().set_delegate(delegate);
    }
}

impl ProtocolHandler for ReplicatorProtocol {
    fn name(&self) -> &str {
        "replicator"
    }

    fn can_handle(&self, request: &InterceptedRequest) -> bool {
        self.context.can_handle(request)
    }

    fn create(
        &self,
        request: Arc<InterceptedRequest>,
        client: Arc<dyn ProtocolClient>,
    ) -> Option<Box<dyn ProtocolTask>> {
        // The delegate captured here serves the request to completion
        let delegate = self.context.active_delegate()?;
        if !delegate_matches(delegate.as_ref(), &request) {
            debug!("Delegate changed before {} was created; passing through", request.id());
            return None;
        }

        if self.context.config.log_requests {
            debug!("Intercepting {} {} ({})", request.method(), request.uri(), request.id());
        }

        let interceptor = Interceptor::new(request, delegate, client, self.context.config.clone());
        Some(Box::new(interceptor))
    }
}

/// Keeps interception registered; unregisters on drop
///
/// The context's delegate is cleared when the last guard installed on that
/// context is dropped. Other guards sharing the context keep it.
#[must_use = "interception is uninstalled as soon as the guard is dropped"]
pub struct InstallGuard {
    stack: Arc<ProtocolStack>,
    context: Arc<InterceptionContext>,
    id: HandlerId,
}

impl InstallGuard {
    pub fn context(&self) -> &Arc<InterceptionContext> {
        &self.context
    }

    pub fn stack(&self) -> &Arc<ProtocolStack> {
        &self.stack
    }

    pub fn handler_id(&self) -> HandlerId {
        self.id
    }

    pub fn set_delegate(&self, delegate: Option<&Arc<dyn InterceptDelegate>>) {
        self.context.set_delegate(delegate);
    }
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        self.stack.unregister(self.id);
        if self.context.installs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.context.clear_delegate();
        }
        info!("Replicator interception uninstalled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interception::client::{channel_client, TransportEvent};
    use crate::interception::decision::{DelegateDecision, SyntheticResponse};
    use async_trait::async_trait;
    use hyper::{Method, StatusCode};
    use proptest::prelude::*;
    use serial_test::serial;

    struct StatusDelegate {
        method: Method,
        status: StatusCode,
    }

    #[async_trait]
    impl InterceptDelegate for StatusDelegate {
        fn matches(&self, request: &InterceptedRequest) -> bool {
            request.method() == self.method
        }

        async fn decide(&self, _request: &InterceptedRequest) -> anyhow::Result<DelegateDecision> {
            Ok(SyntheticResponse::new(self.status).into())
        }
    }

    struct PanickyMatcher;

    #[async_trait]
    impl InterceptDelegate for PanickyMatcher {
        fn matches(&self, _request: &InterceptedRequest) -> bool {
            panic!("matcher bug")
        }

        async fn decide(&self, _request: &InterceptedRequest) -> anyhow::Result<DelegateDecision> {
            Ok(SyntheticResponse::ok().into())
        }
    }

    fn get_delegate(status: StatusCode) -> Arc<dyn InterceptDelegate> {
        Arc::new(StatusDelegate {
            method: Method::GET,
            status,
        })
    }

    #[test]
    fn test_no_delegate_passes_through() {
        let context = InterceptionContext::default();
        assert!(!context.has_delegate());
        assert!(!context.can_handle(&InterceptedRequest::get("/db/_changes").unwrap()));
    }

    #[test]
    fn test_delegate_decides_match() {
        let context = InterceptionContext::default();
        let delegate = get_delegate(StatusCode::OK);
        context.set_delegate(Some(&delegate));

        assert!(context.can_handle(&InterceptedRequest::get("/db/_changes").unwrap()));
        assert!(!context.can_handle(&InterceptedRequest::post("/db/_bulk_docs").unwrap()));
    }

    #[test]
    fn test_clearing_delegate() {
        let context = InterceptionContext::default();
        let delegate = get_delegate(StatusCode::OK);
        let request = InterceptedRequest::get("/db/_changes").unwrap();

        context.set_delegate(Some(&delegate));
        assert!(context.can_handle(&request));

        context.set_delegate(None);
        assert!(!context.can_handle(&request));
    }

    #[test]
    fn test_dropped_delegate_passes_through() {
        let context = InterceptionContext::default();
        let delegate = get_delegate(StatusCode::OK);
        context.set_delegate(Some(&delegate));

        drop(delegate);
        assert!(!context.has_delegate());
        assert!(!context.can_handle(&InterceptedRequest::get("/db/_changes").unwrap()));
    }

    #[test]
    fn test_panicking_matcher_declines() {
        let context = InterceptionContext::default();
        let delegate: Arc<dyn InterceptDelegate> = Arc::new(PanickyMatcher);
        context.set_delegate(Some(&delegate));

        assert!(!context.can_handle(&InterceptedRequest::get("/db/_changes").unwrap()));
    }

    #[test]
    fn test_install_guard_unregisters() {
        let stack = Arc::new(ProtocolStack::new());
        let context = Arc::new(InterceptionContext::default());
        let delegate = get_delegate(StatusCode::OK);
        let request = InterceptedRequest::get("/db/_changes").unwrap();

        {
            let guard = ReplicatorProtocol::install(Arc::clone(&context), Arc::clone(&stack));
            guard.set_delegate(Some(&delegate));
            assert!(stack.is_registered(guard.handler_id()));
            assert!(stack.handler_for(&request).is_some());
        }

        assert!(stack.is_empty());
        assert!(!context.has_delegate());
        assert!(stack.handler_for(&request).is_none());
    }

    #[test]
    fn test_shared_context_keeps_delegate_until_last_guard() {
        let stack = Arc::new(ProtocolStack::new());
        let context = Arc::new(InterceptionContext::default());
        let delegate = get_delegate(StatusCode::OK);
        let request = InterceptedRequest::get("/db/_changes").unwrap();

        let first = ReplicatorProtocol::install(Arc::clone(&context), Arc::clone(&stack));
        let second = ReplicatorProtocol::install(Arc::clone(&context), Arc::clone(&stack));
        first.set_delegate(Some(&delegate));
        assert_eq!(context.install_count(), 2);

        drop(first);
        assert_eq!(context.install_count(), 1);
        assert!(context.has_delegate());
        assert!(context.can_handle(&request));
        assert!(stack.handler_for(&request).is_some());

        drop(second);
        assert_eq!(context.install_count(), 0);
        assert!(!context.has_delegate());
        assert!(stack.is_empty());
    }

    #[test]
    fn test_install_guard_released_on_panic() {
        let stack = Arc::new(ProtocolStack::new());
        let context = Arc::new(InterceptionContext::default());

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = ReplicatorProtocol::install(Arc::clone(&context), Arc::clone(&stack));
            panic!("test assertion failed");
        }));

        assert!(result.is_err());
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn test_replacing_delegate_keeps_captured_one() {
        let context = Arc::new(InterceptionContext::default());
        let handler = ReplicatorProtocol::new(Arc::clone(&context));
        let first = get_delegate(StatusCode::OK);
        let second = get_delegate(StatusCode::INTERNAL_SERVER_ERROR);

        context.set_delegate(Some(&first));
        let (tx, mut rx) = channel_client();
        let task = handler
            .create(Arc::new(InterceptedRequest::get("/db/_changes").unwrap()), Arc::new(tx))
            .unwrap();

        context.set_delegate(Some(&second));
        drop(first);
        task.start().unwrap();

        match rx.recv().await {
            Some(TransportEvent::Response { status, .. }) => assert_eq!(status, StatusCode::OK),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(rx.recv().await, Some(TransportEvent::Finished)));
    }

    #[test]
    fn test_create_without_delegate() {
        let context = Arc::new(InterceptionContext::default());
        let handler = ReplicatorProtocol::new(context);
        let (tx, _rx) = channel_client();

        let task = handler.create(Arc::new(InterceptedRequest::get("/db/_changes").unwrap()), Arc::new(tx));
        assert!(task.is_none());
    }

    #[test]
    fn test_concurrent_swaps_and_matches() {
        let context = Arc::new(InterceptionContext::default());
        let delegates: Vec<_> = (0..4).map(|_| get_delegate(StatusCode::OK)).collect();

        std::thread::scope(|scope| {
            for delegate in &delegates {
                let context = Arc::clone(&context);
                scope.spawn(move || {
                    for _ in 0..200 {
                        context.set_delegate(Some(delegate));
                        context.clear_delegate();
                    }
                });
            }
            for _ in 0..4 {
                let context = Arc::clone(&context);
                scope.spawn(move || {
                    let request = InterceptedRequest::get("/db/_changes").unwrap();
                    for _ in 0..200 {
                        let _ = context.can_handle(&request);
                    }
                });
            }
        });

        context.set_delegate(Some(&delegates[0]));
        assert!(context.can_handle(&InterceptedRequest::get("/db/_changes").unwrap()));
    }

    #[test]
    #[serial]
    fn test_global_test_delegate() {
        let guard = ReplicatorProtocol::install_global();
        let delegate = get_delegate(StatusCode::OK);
        let request = InterceptedRequest::get("/db/_changes").unwrap();

        ReplicatorProtocol::set_test_delegate(Some(&delegate));
        assert!(ProtocolStack::global().handler_for(&request).is_some());

        ReplicatorProtocol::set_test_delegate(None);
        assert!(ProtocolStack::global().handler_for(&request).is_none());

        drop(guard);
        ReplicatorProtocol::set_test_delegate(Some(&delegate));
        assert!(ProtocolStack::global().handler_for(&request).is_none());
        ReplicatorProtocol::set_test_delegate(None);
    }

    fn method_strategy() -> impl Strategy<Value = Method> {
        prop_oneof![
            Just(Method::GET),
            Just(Method::POST),
            Just(Method::PUT),
            Just(Method::DELETE),
        ]
    }

    proptest! {
        #[test]
        fn prop_no_delegate_never_handles(path in "[a-z_/]{0,24}", method in method_strategy()) {
            let context = InterceptionContext::default();
            let request = InterceptedRequest::new(method, format!("/{}", path).parse().unwrap());
            prop_assert!(!context.can_handle(&request));
        }

        #[test]
        fn prop_can_handle_is_idempotent(path in "[a-z_/]{0,24}", method in method_strategy()) {
            let context = InterceptionContext::default();
            let delegate = get_delegate(StatusCode::OK);
            context.set_delegate(Some(&delegate));

            let request = InterceptedRequest::new(method.clone(), format!("/{}", path).parse().unwrap());
            let first = context.can_handle(&request);
            let second = context.can_handle(&request);
            prop_assert_eq!(first, second);
            prop_assert_eq!(first, method == Method::GET);
        }
    }
}
