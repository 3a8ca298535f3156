// packages/protocol/src/interception/request.rs
//! Immutable description of one outbound call

use crate::utils::errors::Result;
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Method, Uri};
use std::fmt;
use ulid::Ulid;

/// An outbound request offered to the interception layer
///
/// Built once by the host when the caller issues a request, then shared
/// read-only with the handler, the interceptor and the delegate.
#[derive(Clone)]
pub struct InterceptedRequest {
    id: Ulid,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl InterceptedRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            id: Ulid::new(),
            method,
            uri,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Build a request from a textual URI
    pub fn parse(method: Method, uri: &str) -> Result<Self> {
        Ok(Self::new(method, uri.parse::<Uri>()?))
    }

    pub fn get(uri: &str) -> Result<Self> {
        Self::parse(Method::GET, uri)
    }

    pub fn post(uri: &str) -> Result<Self> {
        Self::parse(Method::POST, uri)
    }

    /// Assemble a request from its parts. An empty body counts as absent.
    pub fn from_parts(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            id: Ulid::new(),
            method,
            uri,
            headers,
            body: if body.is_empty() { None } else { Some(body) },
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.body = if body.is_empty() { None } else { Some(body) };
        self
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Path component of the target address
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Body decoded as JSON, if present and well formed
    pub fn json_body(&self) -> Option<serde_json::Value> {
        self.body
            .as_ref()
            .and_then(|body| serde_json::from_slice(body).ok())
    }
}

impl fmt::Debug for InterceptedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptedRequest")
            .field("id", &self.id.to_string())
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("headers", &self.headers.len())
            .field("body", &self.body.as_ref().map(|b| b.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::errors::InterceptError;
    use hyper::header::CONTENT_TYPE;

    #[test]
    fn test_empty_body_is_absent() {
        let req = InterceptedRequest::post("http://localhost:5984/db/_bulk_docs").unwrap().with_body("");
        assert!(req.body().is_none());

        let req = InterceptedRequest::from_parts(
            Method::PUT,
            "/db/doc".parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
        );
        assert!(req.body().is_none());
    }

    #[test]
    fn test_accessors() {
        let req = InterceptedRequest::post("http://localhost:5984/db/_bulk_docs?new_edits=false").unwrap()
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(r#"{"docs":[]}"#);

        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.path(), "/db/_bulk_docs");
        assert_eq!(req.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(req.json_body().unwrap()["docs"], serde_json::json!([]));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = InterceptedRequest::get("/db/_changes").unwrap();
        let b = InterceptedRequest::get("/db/_changes").unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_malformed_uri_is_rejected() {
        let err = InterceptedRequest::get("http://local host/db").unwrap_err();
        assert!(matches!(err, InterceptError::InvalidUri(_)));

        let req = InterceptedRequest::parse(Method::DELETE, "/db/doc?rev=1-a").unwrap();
        assert_eq!(req.method(), Method::DELETE);
        assert_eq!(req.path(), "/db/doc");
    }
}
