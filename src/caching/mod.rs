//! # Caching System Module
//!
//! HTTP response caching with request coalescing, an asynchronous write-back pipeline
//! and group invalidation.
//!
//! ## Architecture
//! The caching system follows a layered approach:
//! 1. **Cache Middleware** ([`middleware`]): per-request decision state machine
//!    (pass through, 304, serve hit, execute and fill).
//! 2. **Key Generation** ([`key_generator`]): fingerprints a request path and,
//!    optionally, its query string into the `uri` part of the cache key.
//! 3. **Negotiation** ([`etag`], [`compression`]): validators and gzip handling.
//! 4. **Deduplication** ([`deduplication`]): collapses concurrent reads of the same key
//!    into one backend call.
//! 5. **Stores** ([`stores`]): in-memory and Redis backends plus the write-back
//!    decorator that batches puts.
//!
//! ## Keys
//! Every entry is addressed by `(namespace, group, uri)`. The namespace partitions
//! callers (usually a user id), the group buckets related endpoints so a write handler
//! can drop them together, and the uri is a digest of the request.
//!
//! A TTL set by any put applies to the whole `(namespace, group)` bucket. Writing one
//! uri with a TTL and another without leaves both subject to the last TTL set on the
//! bucket. Stores keep this coupling; it is part of the addressing scheme.

pub mod compression;
pub mod deduplication;
pub mod etag;
pub mod key_generator;
pub mod layer;
pub mod middleware;
pub mod stores;

pub use compression::CompressionPolicy;
pub use deduplication::Coalescer;
pub use key_generator::KeyGenerationStrategy;
pub use layer::{
    cache_response, invalidate_groups, namespace_from_header, CacheRoute, InvalidateRoute,
};
pub use middleware::{CacheMiddleware, CachePolicy};
pub use stores::{
    build_store, InMemoryStore, InMemoryStoreConfig, RedisStore, RedisStoreConfig, StoreBackend,
    StoreConfig, WriteBackConfig, WriteBackStore,
};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Cache operation result
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific error types.
///
/// `Clone` because a single coalesced backend read hands the same outcome to every
/// waiting caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("No cache namespace on request")]
    NamespaceMissing,

    #[error("Cache store read error: {message}")]
    StoreRead { message: String },

    #[error("Cache store write error: {message}")]
    StoreWrite { message: String },

    #[error("Compression error: {message}")]
    Compression { message: String },

    #[error("Malformed stored value for field '{field}': {reason}")]
    MalformedStoredValue { field: String, reason: String },

    #[error("Cache configuration error: {message}")]
    Configuration { message: String },

    #[error("Cache not available: {message}")]
    Unavailable { message: String },
}

impl CacheError {
    pub fn store_read<S: Into<String>>(message: S) -> Self {
        Self::StoreRead {
            message: message.into(),
        }
    }

    pub fn store_write<S: Into<String>>(message: S) -> Self {
        Self::StoreWrite {
            message: message.into(),
        }
    }

    pub fn malformed<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::MalformedStoredValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// Compression applied to a stored blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl Compression {
    /// Tag persisted next to the blob. Uncompressed blobs carry an empty tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => "gzip",
        }
    }

    pub fn is_compressed(&self) -> bool {
        !matches!(self, Compression::None)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = CacheError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            other => Err(CacheError::malformed(
                "comp",
                format!("unknown compression tag '{}'", other),
            )),
        }
    }
}

/// One cached response body with its metadata.
///
/// Immutable once built; a put replaces the whole item for its key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Item {
    pub content_type: String,
    pub etag: String,
    pub compression: Compression,
    pub blob: Bytes,
}

impl Item {
    /// Whether there is a body to replay
    pub fn has_blob(&self) -> bool {
        !self.blob.is_empty()
    }

    /// Copy of this item whose blob does not share memory with the original buffer.
    pub fn detached(&self) -> Self {
        Self {
            content_type: self.content_type.clone(),
            etag: self.etag.clone(),
            compression: self.compression,
            blob: Bytes::copy_from_slice(&self.blob),
        }
    }
}

/// A queued write, owned outright so it can outlive the request that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    pub namespace: String,
    pub group: String,
    pub uri: String,
    pub item: Item,
    pub ttl: Option<Duration>,
}

impl PutRequest {
    pub fn new(
        namespace: &str,
        group: &str,
        uri: &str,
        item: &Item,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            group: group.to_string(),
            uri: uri.to_string(),
            item: item.detached(),
            ttl,
        }
    }
}

/// Backend data store for cached responses.
///
/// Implementations must be safe for concurrent readers and writers.
#[async_trait]
pub trait Store: Send + Sync {
    /// Item for one uri. `Ok(None)` and `Err(_)` both mean "miss" to the controller.
    async fn get(&self, namespace: &str, group: &str, uri: &str) -> CacheResult<Option<Item>>;

    /// Replace the item for one uri. A TTL applies to the whole group bucket.
    async fn put(
        &self,
        namespace: &str,
        group: &str,
        uri: &str,
        item: &Item,
        ttl: Option<Duration>,
    ) -> CacheResult<()>;

    /// Delete one uri.
    async fn del(&self, namespace: &str, group: &str, uri: &str) -> CacheResult<()>;

    /// Delete whole groups within a namespace.
    async fn del_group(&self, namespace: &str, groups: &[&str]) -> CacheResult<()>;

    /// Flush and stop any background work. No-op for stores without any.
    async fn shutdown(&self) {}
}

/// A store that can commit many puts in one round trip.
#[async_trait]
pub trait BatchWriter: Send + Sync {
    async fn put_batch(&self, batch: &[PutRequest]) -> CacheResult<()>;
}
