//! axum adapters for the cache controller.
//!
//! Each function here is meant for `axum::middleware::from_fn_with_state`:
//!
//! ```ignore
//! let route = CacheRoute::new(middleware.clone(), policy.clone(), "items");
//! get(show_item.layer(from_fn_with_state(route, cache_response)))
//! ```
//!
//! The namespace comes from a [`CacheNamespace`] request extension. Something earlier
//! in the stack has to set it, for example [`namespace_from_header`] or an
//! authentication layer; requests without it are passed straight through.

use super::{CacheMiddleware, CachePolicy};
use crate::core::types::{CacheNamespace, HttpResponse, IncomingRequest};
use axum::extract::{Request, State};
use axum::http::{HeaderName, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::error;

/// State for [`cache_response`]
#[derive(Clone)]
pub struct CacheRoute {
    pub middleware: Arc<CacheMiddleware>,
    pub policy: Arc<CachePolicy>,
    pub group: String,
}

impl CacheRoute {
    pub fn new(
        middleware: Arc<CacheMiddleware>,
        policy: Arc<CachePolicy>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            middleware,
            policy,
            group: group.into(),
        }
    }
}

/// State for [`invalidate_groups`]
#[derive(Clone)]
pub struct InvalidateRoute {
    pub middleware: Arc<CacheMiddleware>,
    pub groups: Vec<String>,
}

impl InvalidateRoute {
    pub fn new<I, S>(middleware: Arc<CacheMiddleware>, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            middleware,
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }
}

/// Serve the wrapped route through the cache
pub async fn cache_response(
    State(route): State<CacheRoute>,
    request: Request,
    next: Next,
) -> Response {
    let incoming = incoming_request(&request);

    route
        .middleware
        .cached(&incoming, &route.policy, &route.group, || run(next, request))
        .await
        .into_response()
}

/// Invalidate the configured groups when the wrapped route answers 200
pub async fn invalidate_groups(
    State(route): State<InvalidateRoute>,
    request: Request,
    next: Next,
) -> Response {
    let incoming = incoming_request(&request);
    let groups: Vec<&str> = route.groups.iter().map(String::as_str).collect();

    route
        .middleware
        .clear_group(&incoming, &groups, || run(next, request))
        .await
        .into_response()
}

/// Set the cache namespace from a request header, e.g. one added by an
/// authenticating proxy.
pub async fn namespace_from_header(
    State(header): State<HeaderName>,
    mut request: Request,
    next: Next,
) -> Response {
    let namespace = request
        .headers()
        .get(&header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(CacheNamespace::new);

    if let Some(namespace) = namespace {
        request.extensions_mut().insert(namespace);
    }

    next.run(request).await
}

fn incoming_request(request: &Request) -> IncomingRequest {
    IncomingRequest {
        method: request.method().clone(),
        uri: request.uri().clone(),
        headers: request.headers().clone(),
        namespace: request.extensions().get::<CacheNamespace>().cloned(),
    }
}

/// Run the inner service and buffer its body so it can be stored
async fn run(next: Next, request: Request) -> HttpResponse {
    let (parts, body) = next.run(request).await.into_parts();

    match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => HttpResponse::new(parts.status, parts.headers, body),
        Err(e) => {
            error!(error = %e, "Failed to read response body");
            HttpResponse::empty(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
