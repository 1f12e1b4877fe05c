//! # Core Types Module
//!
//! The request and response shapes the cache controller works with. The HTTP server
//! itself is somebody else's job; these types carry only what the cache needs to make
//! its decisions (method, URI, headers, the caller's namespace) and what it needs to
//! store or replay (status, headers, body).
//!
//! Header types come from `axum::http` so converting to and from a framework request is
//! a move of the parts, not a re-parse.

use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

/// Namespace under which a request's cache entries live.
///
/// Set by an earlier layer (usually authentication) as a request extension, most
/// commonly the user id. Requests without one are never cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheNamespace(pub String);

impl CacheNamespace {
    pub fn new<S: Into<String>>(namespace: S) -> Self {
        Self(namespace.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Request as seen by the cache controller
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// HTTP method
    pub method: Method,

    /// Request URI including path and query
    pub uri: Uri,

    /// Request headers (`If-None-Match` and `Accept-Encoding` are read from here)
    pub headers: HeaderMap,

    /// Caller namespace, if one was resolved upstream
    pub namespace: Option<CacheNamespace>,
}

impl IncomingRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
            namespace: None,
        }
    }

    /// Attach the caller namespace
    pub fn with_namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.namespace = Some(CacheNamespace::new(namespace));
        self
    }

    /// Request path without the query string
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Raw query string, if any
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Header value by name, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Namespace as a non-empty string
    pub fn namespace(&self) -> Option<&str> {
        self.namespace
            .as_ref()
            .map(CacheNamespace::as_str)
            .filter(|ns| !ns.is_empty())
    }
}

/// Response produced by a handler or replayed from the cache
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Response with a body and a `Content-Type`
    pub fn with_content_type(
        status: StatusCode,
        content_type: &'static str,
        body: impl Into<Bytes>,
    ) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        Self::new(status, headers, body)
    }

    /// Plain text response
    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        Self::with_content_type(status, "text/plain; charset=utf-8", text.into())
    }

    /// Empty-bodied response with only a status
    pub fn empty(status: StatusCode) -> Self {
        Self::new(status, HeaderMap::new(), Bytes::new())
    }

    /// `Content-Type` header as a string, empty if absent
    pub fn content_type(&self) -> &str {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
    }

    /// Whether the response's own `Cache-Control` forbids storing it
    pub fn forbids_storage(&self) -> bool {
        self.headers
            .get_all(CACHE_CONTROL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|directive| directive.trim().eq_ignore_ascii_case("no-store"))
    }
}

impl IntoResponse for HttpResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}
