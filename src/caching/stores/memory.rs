//! # In-Memory Cache Store
//!
//! Process-local store keyed the same way as the Redis backend: one bucket per
//! `(namespace, group)` holding an item per uri. Expiry is tracked per bucket, so the
//! TTL of the most recent put governs every uri in the group.

use super::super::{BatchWriter, CacheResult, Item, PutRequest, Store};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::debug;

/// In-memory store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryStoreConfig {
    /// How often expired buckets are reaped
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for InMemoryStoreConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

type BucketKey = (String, String);

#[derive(Debug, Default)]
struct Bucket {
    items: HashMap<String, Item>,
    expires_at: Option<Instant>,
}

impl Bucket {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// Snapshot of store counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InMemoryStoreStats {
    pub buckets: usize,
    pub items: usize,
    pub hits: u64,
    pub misses: u64,
    pub expired_cleanups: u64,
}

pub struct InMemoryStore {
    buckets: Arc<DashMap<BucketKey, Bucket>>,
    hits: AtomicU64,
    misses: AtomicU64,
    expired_cleanups: Arc<AtomicU64>,
    cleanup_task: JoinHandle<()>,
}

impl InMemoryStore {
    /// Create the store and start its reaper. Must be called inside a tokio runtime.
    pub fn new(config: InMemoryStoreConfig) -> Self {
        let buckets: Arc<DashMap<BucketKey, Bucket>> = Arc::new(DashMap::new());
        let expired_cleanups = Arc::new(AtomicU64::new(0));

        let cleanup_task = {
            let buckets = buckets.clone();
            let expired_cleanups = expired_cleanups.clone();
            let period = config.cleanup_interval.max(Duration::from_millis(1));

            tokio::spawn(async move {
                let mut ticker = interval(period);
                loop {
                    ticker.tick().await;
                    Self::cleanup_expired_buckets(&buckets, &expired_cleanups);
                }
            })
        };

        Self {
            buckets,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired_cleanups,
            cleanup_task,
        }
    }

    fn cleanup_expired_buckets(buckets: &DashMap<BucketKey, Bucket>, expired_cleanups: &AtomicU64) {
        let now = Instant::now();
        let before = buckets.len();
        buckets.retain(|_, bucket| !bucket.is_expired(now));
        let removed = before.saturating_sub(buckets.len());

        if removed > 0 {
            expired_cleanups.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "Reaped expired cache buckets");
        }
    }

    fn bucket_key(namespace: &str, group: &str) -> BucketKey {
        (namespace.to_string(), group.to_string())
    }

    fn insert(&self, namespace: &str, group: &str, uri: &str, item: Item, ttl: Option<Duration>) {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(Self::bucket_key(namespace, group)).or_default();

        if bucket.is_expired(now) {
            *bucket = Bucket::default();
        }
        if let Some(ttl) = ttl {
            bucket.expires_at = Some(now + ttl);
        }
        bucket.items.insert(uri.to_string(), item);
    }

    pub fn stats(&self) -> InMemoryStoreStats {
        let now = Instant::now();
        let (buckets, items) = self
            .buckets
            .iter()
            .filter(|bucket| !bucket.is_expired(now))
            .fold((0, 0), |(buckets, items), bucket| (buckets + 1, items + bucket.items.len()));

        InMemoryStoreStats {
            buckets,
            items,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired_cleanups: self.expired_cleanups.load(Ordering::Relaxed),
        }
    }
}

impl Drop for InMemoryStore {
    fn drop(&mut self) {
        self.cleanup_task.abort();
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, namespace: &str, group: &str, uri: &str) -> CacheResult<Option<Item>> {
        let key = Self::bucket_key(namespace, group);
        let item = self
            .buckets
            .get(&key)
            .filter(|bucket| !bucket.is_expired(Instant::now()))
            .and_then(|bucket| bucket.items.get(uri).cloned());

        match item {
            Some(item) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(item))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put(
        &self,
        namespace: &str,
        group: &str,
        uri: &str,
        item: &Item,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        self.insert(namespace, group, uri, item.detached(), ttl);
        Ok(())
    }

    async fn del(&self, namespace: &str, group: &str, uri: &str) -> CacheResult<()> {
        if let Some(mut bucket) = self.buckets.get_mut(&Self::bucket_key(namespace, group)) {
            bucket.items.remove(uri);
        }
        Ok(())
    }

    async fn del_group(&self, namespace: &str, groups: &[&str]) -> CacheResult<()> {
        for group in groups {
            self.buckets.remove(&Self::bucket_key(namespace, group));
        }
        Ok(())
    }
}

#[async_trait]
impl BatchWriter for InMemoryStore {
    async fn put_batch(&self, batch: &[PutRequest]) -> CacheResult<()> {
        for request in batch {
            self.insert(
                &request.namespace,
                &request.group,
                &request.uri,
                request.item.clone(),
                request.ttl,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::Compression;
    use bytes::Bytes;
    use tokio::time::sleep;

    fn item(body: &'static str) -> Item {
        Item {
            content_type: "text/plain".to_string(),
            etag: "0123456789abcdef".to_string(),
            compression: Compression::None,
            blob: Bytes::from_static(body.as_bytes()),
        }
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let store = InMemoryStore::new(InMemoryStoreConfig::default());

        store.put("ns", "users", "a", &item("alpha"), None).await.unwrap();
        let found = store.get("ns", "users", "a").await.unwrap();
        assert_eq!(found, Some(item("alpha")));

        store.del("ns", "users", "a").await.unwrap();
        assert_eq!(store.get("ns", "users", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_replaces_whole_item() {
        let store = InMemoryStore::new(InMemoryStoreConfig::default());

        store.put("ns", "g", "u", &item("first"), None).await.unwrap();
        let mut second = item("second");
        second.etag = "fedcba9876543210".to_string();
        store.put("ns", "g", "u", &second, None).await.unwrap();

        assert_eq!(store.get("ns", "g", "u").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_del_group_only_touches_named_groups() {
        let store = InMemoryStore::new(InMemoryStoreConfig::default());

        store.put("ns", "users", "a", &item("a"), None).await.unwrap();
        store.put("ns", "orders", "b", &item("b"), None).await.unwrap();
        store.put("other", "users", "a", &item("c"), None).await.unwrap();

        store.del_group("ns", &["users"]).await.unwrap();

        assert_eq!(store.get("ns", "users", "a").await.unwrap(), None);
        assert!(store.get("ns", "orders", "b").await.unwrap().is_some());
        assert!(store.get("other", "users", "a").await.unwrap().is_some());

        store.del_group("ns", &[]).await.unwrap();
        assert!(store.get("ns", "orders", "b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ttl_applies_to_whole_group() {
        let store = InMemoryStore::new(InMemoryStoreConfig::default());

        store.put("ns", "g", "no-ttl", &item("x"), None).await.unwrap();
        store
            .put("ns", "g", "short", &item("y"), Some(Duration::from_millis(50)))
            .await
            .unwrap();

        sleep(Duration::from_millis(80)).await;

        assert_eq!(store.get("ns", "g", "no-ttl").await.unwrap(), None);
        assert_eq!(store.get("ns", "g", "short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reaper_removes_expired_buckets() {
        let store = InMemoryStore::new(InMemoryStoreConfig {
            cleanup_interval: Duration::from_millis(20),
        });

        store
            .put("ns", "g", "u", &item("x"), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        sleep(Duration::from_millis(80)).await;

        let stats = store.stats();
        assert_eq!(stats.buckets, 0);
        assert_eq!(stats.expired_cleanups, 1);
    }

    #[tokio::test]
    async fn test_put_batch_and_stats() {
        let store = InMemoryStore::new(InMemoryStoreConfig::default());
        let batch: Vec<PutRequest> = (0..3)
            .map(|i| PutRequest::new("ns", "g", &format!("u{}", i), &item("body"), None))
            .collect();

        store.put_batch(&batch).await.unwrap();
        store.get("ns", "g", "u0").await.unwrap();
        store.get("ns", "g", "missing").await.unwrap();

        let stats = store.stats();
        assert_eq!(stats.buckets, 1);
        assert_eq!(stats.items, 3);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }
}
