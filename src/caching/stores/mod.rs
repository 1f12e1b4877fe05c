//! # Cache Stores Module
//!
//! Backends for cached responses and the write-back decorator that sits in front of
//! them. [`build_store`] assembles the configured backend behind a [`WriteBackStore`].

pub mod memory;
pub mod redis_store;
pub mod write_back;

pub use memory::{InMemoryStore, InMemoryStoreConfig, InMemoryStoreStats};
pub use redis_store::{RedisStore, RedisStoreConfig};
pub use write_back::{WriteBackConfig, WriteBackStore};

use super::{CacheResult, Store};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Which backend holds cached items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub memory: InMemoryStoreConfig,
    pub redis: RedisStoreConfig,
    pub write_back: WriteBackConfig,
}

/// Build the configured backend wrapped in the write-back pipeline.
///
/// Call [`Store::shutdown`] on the result before exiting so queued writes are
/// committed.
pub async fn build_store(config: &StoreConfig) -> CacheResult<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match config.backend {
        StoreBackend::Memory => {
            let backend = Arc::new(InMemoryStore::new(config.memory.clone()));
            Arc::new(WriteBackStore::new(backend, config.write_back.clone())?)
        }
        StoreBackend::Redis if config.redis.is_cluster() => {
            let backend = Arc::new(RedisStore::connect_cluster(&config.redis).await?);
            Arc::new(WriteBackStore::new(backend, config.write_back.clone())?)
        }
        StoreBackend::Redis => {
            let backend = Arc::new(RedisStore::connect(&config.redis).await?);
            Arc::new(WriteBackStore::new(backend, config.write_back.clone())?)
        }
    };

    info!(
        backend = ?config.backend,
        asynchronous = config.write_back.asynchronous,
        "Cache store ready"
    );
    Ok(store)
}
