//! # Response Cache
//!
//! An HTTP response cache for axum services. Cached routes are served from a backing
//! store with conditional (`ETag` / `If-None-Match`) and gzip negotiation, while write
//! routes invalidate whole groups of entries.
//!
//! Three pieces do most of the work:
//! - a per-instance read coalescer, so a burst of misses for one key costs a single
//!   store read ([`caching::Coalescer`])
//! - an asynchronous write-back pipeline that batches fills into pipelined store
//!   writes off the serving path ([`caching::WriteBackStore`])
//! - the per-request decision logic ([`caching::CacheMiddleware`])
//!
//! Stores: in-memory ([`caching::InMemoryStore`]) and Redis, single node or cluster
//! ([`caching::RedisStore`]).

/// Error types, configuration and the request/response shapes the cache works with
pub mod core;

/// Cache controller, negotiation, coalescing and stores
pub mod caching;

/// Structured logging and metrics
pub mod observability;

pub use crate::core::config::{ServerConfig, ServiceConfig};
pub use crate::core::error::{ServiceError, ServiceResult};
pub use crate::core::types::{CacheNamespace, HttpResponse, IncomingRequest};

pub use crate::caching::{CacheError, CacheMiddleware, CachePolicy, CacheResult, Item, Store};
