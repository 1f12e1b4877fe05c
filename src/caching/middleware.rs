//! # Cache Middleware
//!
//! The per-request decision logic for cached routes. For each request
//! [`CacheMiddleware::cached`] picks one of four outcomes:
//!
//! - no namespace: run the handler, touch nothing
//! - validator match: `304 Not Modified`, handler not run
//! - stored body: replay it, handler not run
//! - otherwise: run the handler and, if the response may be stored, fill the cache
//!
//! Store failures never fail the request. A failed lookup is a miss and a failed fill
//! just means the next request misses too. Both are logged and counted.

use super::compression::{self, CompressionPolicy};
use super::deduplication::Coalescer;
use super::etag;
use super::{CacheResult, Compression, Item, KeyGenerationStrategy, Store};
use crate::core::types::{HttpResponse, IncomingRequest};
use crate::observability::metrics::{self, LookupOutcome, StoreOperation};
use axum::http::header::{
    ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, ETAG, IF_NONE_MATCH, VARY,
};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Cache policy for a route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Expiry applied to the route's group on every fill. `None` keeps entries until
    /// they are invalidated.
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,

    /// Generate validators on fill and answer matching `If-None-Match` with 304
    pub etag: bool,

    /// Store only the validator. Replays re-run the handler but 304s still work.
    pub no_blob: bool,

    /// What part of the request identifies the cached resource
    pub key_strategy: KeyGenerationStrategy,

    pub compression: CompressionPolicy,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: None,
            etag: true,
            no_blob: false,
            key_strategy: KeyGenerationStrategy::Path,
            compression: CompressionPolicy::default(),
        }
    }
}

/// Cache controller shared by every cached route of a service.
///
/// Reads go through a [`Coalescer`] owned by this instance, so concurrent misses
/// for the same key cost one backend read.
pub struct CacheMiddleware {
    store: Coalescer,
}

impl CacheMiddleware {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store: Coalescer::new(store),
        }
    }

    /// Serve `request` from the cache or run `handler` and cache its response.
    ///
    /// `handler` runs at most once.
    pub async fn cached<F, Fut>(
        &self,
        request: &IncomingRequest,
        policy: &CachePolicy,
        group: &str,
        handler: F,
    ) -> HttpResponse
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = HttpResponse>,
    {
        let Some(namespace) = request.namespace() else {
            debug!(path = request.path(), "No cache namespace, bypassing cache");
            metrics::record_lookup(LookupOutcome::Bypass);
            return handler().await;
        };

        let uri = policy.key_strategy.fingerprint(request);

        let cached = match self.store.get(namespace, group, &uri).await {
            Ok(item) => item,
            Err(e) => {
                warn!(
                    namespace, group, uri = %uri, error = %e,
                    "Cache lookup failed, treating as miss"
                );
                metrics::record_store_error(StoreOperation::Get);
                None
            }
        };

        if let Some(item) = &cached {
            if policy.etag && validator_matches(request, &item.etag) {
                debug!(namespace, group, uri = %uri, "Validator matched");
                metrics::record_lookup(LookupOutcome::NotModified);
                return not_modified(&item.etag);
            }

            if item.has_blob() {
                debug!(namespace, group, uri = %uri, "Serving cached response");
                metrics::record_lookup(LookupOutcome::Hit);
                return serve_item(request, policy, item);
            }
        }

        metrics::record_lookup(LookupOutcome::Miss);
        let mut response = handler().await;

        if response.status != StatusCode::OK || response.forbids_storage() {
            return response;
        }

        match self.fill(namespace, group, &uri, policy, &response).await {
            Ok(Some(validator)) => {
                if let Ok(value) = HeaderValue::from_str(&etag::quoted(&validator)) {
                    response.headers.insert(ETAG, value);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(namespace, group, uri = %uri, error = %e, "Failed to cache response");
                metrics::record_store_error(StoreOperation::Put);
            }
        }

        response
    }

    /// Run `handler` and, if it returns 200, drop every entry of `groups` in the
    /// request's namespace.
    pub async fn clear_group<F, Fut>(
        &self,
        request: &IncomingRequest,
        groups: &[&str],
        handler: F,
    ) -> HttpResponse
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = HttpResponse>,
    {
        let Some(namespace) = request.namespace() else {
            debug!(path = request.path(), "No cache namespace, skipping invalidation");
            return handler().await;
        };

        let response = handler().await;

        if response.status == StatusCode::OK {
            match self.store.del_group(namespace, groups).await {
                Ok(()) => {
                    debug!(namespace, ?groups, "Cache groups invalidated");
                    metrics::record_invalidation(groups.len());
                }
                Err(e) => {
                    warn!(namespace, ?groups, error = %e, "Failed to invalidate cache groups");
                    metrics::record_store_error(StoreOperation::DelGroup);
                }
            }
        }

        response
    }

    /// Delete one cached uri
    pub async fn del(&self, namespace: &str, group: &str, uri: &str) -> CacheResult<()> {
        let result = self.store.del(namespace, group, uri).await;
        if let Err(e) = &result {
            warn!(namespace, group, uri, error = %e, "Failed to delete cached entry");
            metrics::record_store_error(StoreOperation::Del);
        }
        result
    }

    /// Delete whole groups
    pub async fn del_group(&self, namespace: &str, groups: &[&str]) -> CacheResult<()> {
        let result = self.store.del_group(namespace, groups).await;
        match &result {
            Ok(()) => metrics::record_invalidation(groups.len()),
            Err(e) => {
                warn!(namespace, ?groups, error = %e, "Failed to invalidate cache groups");
                metrics::record_store_error(StoreOperation::DelGroup);
            }
        }
        result
    }

    /// Flush pending writes and stop background work in the store
    pub async fn shutdown(&self) {
        self.store.shutdown().await
    }

    /// Store the response. Returns the validator minted for it, if any.
    async fn fill(
        &self,
        namespace: &str,
        group: &str,
        uri: &str,
        policy: &CachePolicy,
        response: &HttpResponse,
    ) -> CacheResult<Option<String>> {
        let validator = if policy.etag {
            Some(etag::generate_etag()?)
        } else {
            None
        };

        let mut item = Item {
            content_type: response.content_type().to_string(),
            etag: validator.clone().unwrap_or_default(),
            compression: Compression::None,
            blob: if policy.no_blob {
                Bytes::new()
            } else {
                response.body.clone()
            },
        };

        if policy.compression.should_compress(item.blob.len()) {
            match compression::compress(&item.blob) {
                Ok(compressed) => {
                    item.blob = compressed;
                    item.compression = Compression::Gzip;
                }
                Err(e) => {
                    warn!(namespace, group, uri, error = %e, "Storing blob uncompressed");
                    metrics::record_store_error(StoreOperation::Compress);
                }
            }
        }

        self.store.put(namespace, group, uri, &item, policy.ttl).await?;
        metrics::record_fill();

        Ok(validator)
    }
}

fn validator_matches(request: &IncomingRequest, stored: &str) -> bool {
    request
        .header(IF_NONE_MATCH.as_str())
        .map_or(false, |header| etag::matches(header, stored))
}

fn not_modified(stored: &str) -> HttpResponse {
    let mut response = HttpResponse::empty(StatusCode::NOT_MODIFIED);
    if let Ok(value) = HeaderValue::from_str(&etag::quoted(stored)) {
        response.headers.insert(ETAG, value);
    }
    response
}

fn serve_item(request: &IncomingRequest, policy: &CachePolicy, item: &Item) -> HttpResponse {
    let mut headers = HeaderMap::new();

    if let Ok(value) = HeaderValue::from_str(&item.content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    if policy.etag && !item.etag.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&etag::quoted(&item.etag)) {
            headers.insert(ETAG, value);
        }
    }

    let body = match item.compression {
        Compression::None => item.blob.clone(),
        Compression::Gzip => {
            let client_accepts = request
                .header(ACCEPT_ENCODING.as_str())
                .map_or(false, |header| compression::accepts(header, Compression::Gzip));

            if policy.compression.respect_headers {
                headers.insert(VARY, HeaderValue::from_static("Accept-Encoding"));
            }

            if policy.compression.respect_headers && client_accepts {
                headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                item.blob.clone()
            } else {
                let decompressed = compression::decompress(&item.blob);
                if let Some(e) = decompressed.error {
                    warn!(error = %e, "Serving partially decompressed blob");
                    metrics::record_store_error(StoreOperation::Decompress);
                }
                decompressed.body
            }
        }
    };

    HttpResponse::new(StatusCode::OK, headers, body)
}
