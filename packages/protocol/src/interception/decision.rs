// packages/protocol/src/interception/decision.rs
//! Delegate decisions: a synthetic response or a synthetic failure

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use futures::Stream;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{HeaderMap, StatusCode};
use serde::Serialize;
use std::fmt;

/// Outcome the delegate produces for one intercepted request
#[derive(Debug)]
pub enum DelegateDecision {
    Respond(SyntheticResponse),
    Fail(SyntheticFailure),
}

impl DelegateDecision {
    pub fn respond(response: SyntheticResponse) -> Self {
        DelegateDecision::Respond(response)
    }

    pub fn fail(code: impl Into<String>, reason: impl Into<String>) -> Self {
        DelegateDecision::Fail(SyntheticFailure::new(code, reason))
    }
}

impl From<SyntheticResponse> for DelegateDecision {
    fn from(response: SyntheticResponse) -> Self {
        DelegateDecision::Respond(response)
    }
}

impl From<SyntheticFailure> for DelegateDecision {
    fn from(failure: SyntheticFailure) -> Self {
        DelegateDecision::Fail(failure)
    }
}

/// Response body as supplied by the delegate
pub enum ResponseBody {
    Empty,
    /// Whole body, split only if the interceptor is configured to chunk
    Full(Bytes),
    /// Pre-split chunks, emitted in order
    Chunks(Vec<Bytes>),
    /// Chunks delivered asynchronously, emitted as they arrive
    Stream(BoxStream<'static, Bytes>),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Full(bytes) => write!(f, "Full({} bytes)", bytes.len()),
            ResponseBody::Chunks(chunks) => write!(f, "Chunks({})", chunks.len()),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Synthetic response metadata plus body
#[derive(Debug)]
pub struct SyntheticResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl SyntheticResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    /// JSON response with a matching content type
    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> serde_json::Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(status)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(body))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = ResponseBody::Full(body.into());
        self
    }

    pub fn with_chunks<I, B>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.body = ResponseBody::Chunks(chunks.into_iter().map(Into::into).collect());
        self
    }

    /// Body produced by a stream the delegate drives, e.g. a `_changes` feed
    pub fn with_stream<S>(mut self, stream: S) -> Self
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        self.body = ResponseBody::Stream(stream.boxed());
        self
    }
}

/// Failure the delegate wants the caller to observe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticFailure {
    code: String,
    reason: String,
}

impl SyntheticFailure {
    pub fn new(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for SyntheticFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_response() {
        let response =
            SyntheticResponse::json(StatusCode::OK, &serde_json::json!({ "ok": true })).unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers.get(CONTENT_TYPE).unwrap(), "application/json");
        match response.body {
            ResponseBody::Full(body) => assert_eq!(&body[..], br#"{"ok":true}"#),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_failure_display() {
        let failure = SyntheticFailure::new("connection-lost", "socket closed");
        assert_eq!(failure.to_string(), "connection-lost: socket closed");
        assert_eq!(SyntheticFailure::new("timeout", "").to_string(), "timeout");
    }

    #[test]
    fn test_decision_from_parts() {
        let decision: DelegateDecision = SyntheticFailure::new("connection-lost", "").into();
        assert!(matches!(decision, DelegateDecision::Fail(_)));

        let decision: DelegateDecision = SyntheticResponse::ok().into();
        assert!(matches!(decision, DelegateDecision::Respond(_)));
    }
}
