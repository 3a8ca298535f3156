// packages/protocol/src/interception/service.rs
//! Tower host for the protocol stack
//!
//! Wraps the real HTTP transport used by the replicator. Each request is
//! offered to the [`ProtocolStack`]; a claimed request is answered by its
//! protocol task and never reaches the network, anything else is forwarded
//! to the inner service unchanged. Synthetic responses stream their body
//! from the task's events, so callers cannot tell them from real ones.
//!
//! Dropping the response future or the response body stops the task.

use crate::interception::client::{channel_client, TransportEvent};
use crate::interception::request::InterceptedRequest;
use crate::interception::registry::InterceptionContext;
use crate::interception::stack::{ProtocolStack, ProtocolTask};
use crate::utils::config::InterceptorConfig;
use crate::utils::errors::{InterceptError, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame};
use hyper::{Request, Response};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tower::{Layer, Service};
use tracing::{debug, trace};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type returned for both intercepted and pass-through responses
pub type InterceptBody = UnsyncBoxBody<Bytes, InterceptError>;

/// Layer installing the protocol stack in front of a transport service
#[derive(Clone)]
pub struct InterceptLayer {
    stack: Arc<ProtocolStack>,
    config: Arc<InterceptorConfig>,
}

impl InterceptLayer {
    pub fn new(stack: Arc<ProtocolStack>) -> Self {
        Self {
            stack,
            config: Arc::new(InterceptorConfig::default()),
        }
    }

    /// Layer bound to the process-wide stack and the global context's config
    pub fn global() -> Self {
        Self::new(ProtocolStack::global())
            .with_config(InterceptionContext::global().config().clone())
    }

    /// Logging settings for requests passing through the layer
    pub fn with_config(mut self, config: InterceptorConfig) -> Self {
        self.config = Arc::new(config);
        self
    }
}

impl<S> Layer<S> for InterceptLayer {
    type Service = InterceptService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InterceptService {
            inner,
            stack: Arc::clone(&self.stack),
            config: Arc::clone(&self.config),
        }
    }
}

/// Service consulting the protocol stack before the real transport
#[derive(Clone)]
pub struct InterceptService<S> {
    inner: S,
    stack: Arc<ProtocolStack>,
    config: Arc<InterceptorConfig>,
}

impl<S> InterceptService<S> {
    pub fn new(inner: S, stack: Arc<ProtocolStack>) -> Self {
        InterceptLayer::new(stack).layer(inner)
    }

    pub fn config(&self) -> &InterceptorConfig {
        &self.config
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for InterceptService<S>
where
    S: Service<Request<Full<Bytes>>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    ReqBody: Body<Data = Bytes> + Send + 'static,
    ReqBody::Error: Into<BoxError>,
    ResBody: Body<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<InterceptBody>;
    type Error = InterceptError;
    type Future = BoxFuture<'static, Result<Self::Response>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.inner.poll_ready(cx).map_err(transport_error)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Keep the service that was driven to readiness
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let stack = Arc::clone(&self.stack);
        let config = Arc::clone(&self.config);

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = body.collect().await.map_err(transport_error)?.to_bytes();

            let request = Arc::new(InterceptedRequest::from_parts(
                parts.method.clone(),
                parts.uri.clone(),
                parts.headers.clone(),
                body.clone(),
            ));
            if config.log_requests {
                log_request(&request, config.max_log_body_size);
            }

            if let Some(handler) = stack.handler_for(&request) {
                let (tx, rx) = channel_client();
                if let Some(task) = handler.create(Arc::clone(&request), Arc::new(tx)) {
                    return intercept(task, rx, config.log_responses).await;
                }
            }

            debug!("Passing {} {} to the real transport", parts.method, parts.uri);

            let response = inner
                .call(Request::from_parts(parts, Full::new(body)))
                .await
                .map_err(transport_error)?;

            Ok(response.map(|body| body.map_err(transport_error).boxed_unsync()))
        })
    }
}

/// Drive one protocol task until its response metadata or failure arrives
async fn intercept(
    task: Box<dyn ProtocolTask>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    log_responses: bool,
) -> Result<Response<InterceptBody>> {
    let task = StopOnDrop(task);
    task.0.start()?;

    match events.recv().await {
        Some(TransportEvent::Response { status, headers }) => {
            let body = SyntheticBody {
                events,
                _task: task,
                done: false,
            };

            let mut response = Response::new(body.boxed_unsync());
            *response.status_mut() = status;
            *response.headers_mut() = headers;

            if log_responses {
                log_response(&response);
            }
            Ok(response)
        }
        Some(TransportEvent::Failed(e)) => {
            debug!("Intercepted request failed: {}", e);
            Err(e)
        }
        Some(event) => Err(InterceptError::InvalidState(format!(
            "{:?} before response metadata",
            event
        ))),
        None => Err(InterceptError::Canceled),
    }
}

/// Stops the task when the caller loses interest
struct StopOnDrop(Box<dyn ProtocolTask>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.stop();
    }
}

/// Response body fed by a protocol task's `Data` events
struct SyntheticBody {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    _task: StopOnDrop,
    done: bool,
}

impl Body for SyntheticBody {
    type Data = Bytes;
    type Error = InterceptError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }

        let frame = match this.events.poll_recv(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Some(TransportEvent::Data(bytes))) => {
                return Poll::Ready(Some(Ok(Frame::data(bytes))))
            }
            Poll::Ready(Some(TransportEvent::Finished)) => None,
            Poll::Ready(Some(TransportEvent::Failed(e))) => Some(Err(e)),
            Poll::Ready(Some(event)) => Some(Err(InterceptError::InvalidState(format!(
                "unexpected {:?} in response body",
                event
            )))),
            Poll::Ready(None) => Some(Err(InterceptError::Canceled)),
        };

        this.done = true;
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }
}

fn transport_error<E: Into<BoxError>>(e: E) -> InterceptError {
    InterceptError::Transport(e.into().to_string())
}

fn log_request(request: &InterceptedRequest, max_body: usize) {
    trace!("Request: {} {}", request.method(), request.uri());
    for (name, value) in request.headers() {
        if let Ok(val_str) = value.to_str() {
            trace!("  {}: {}", name, val_str);
        }
    }
    if let Some(body) = request.body() {
        trace!("  body: {}", body_preview(body, max_body));
    }
}

/// Lossy text of at most `max` body bytes, noting how much was cut
fn body_preview(body: &[u8], max: usize) -> String {
    if body.len() <= max {
        return String::from_utf8_lossy(body).into_owned();
    }
    format!(
        "{}... ({} of {} bytes)",
        String::from_utf8_lossy(&body[..max]),
        max,
        body.len()
    )
}

fn log_response(response: &Response<InterceptBody>) {
    trace!("Synthetic response: {}", response.status());
    for (name, value) in response.headers() {
        if let Ok(val_str) = value.to_str() {
            trace!("  {}: {}", name, val_str);
        }
    }
}
