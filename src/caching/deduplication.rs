//! # Request Deduplication Module
//!
//! Collapses concurrent reads of the same cache key into a single backend call so a
//! burst of requests for a cold resource does not stampede the store.
//!
//! The first caller for a key becomes the leader and performs the read; everyone who
//! arrives while it is in flight subscribes to the leader's `watch` channel and gets a
//! clone of the same outcome, error included. Writes are not deduplicated.

use super::{CacheResult, Item, Store};
use crate::observability::metrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

type ReadOutcome = CacheResult<Option<Item>>;

/// In-flight read identity. Kept as separate fields so `("a", "bc", x)` and
/// `("ab", "c", x)` never share a flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlightKey {
    namespace: String,
    group: String,
    uri: String,
}

impl FlightKey {
    fn new(namespace: &str, group: &str, uri: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            group: group.to_string(),
            uri: uri.to_string(),
        }
    }
}

type InFlightMap = Mutex<HashMap<FlightKey, watch::Receiver<Option<ReadOutcome>>>>;

enum Role {
    Leader(watch::Sender<Option<ReadOutcome>>),
    Follower(watch::Receiver<Option<ReadOutcome>>),
}

/// Removes the leader's entry when its read finishes or is cancelled
struct FlightGuard<'a> {
    in_flight: &'a InFlightMap,
    key: &'a FlightKey,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(self.key);
    }
}

/// Store decorator that deduplicates concurrent reads per `(namespace, group, uri)`.
///
/// One instance per backend store; nothing here is process-global.
pub struct Coalescer {
    store: Arc<dyn Store>,
    in_flight: InFlightMap,
}

impl Coalescer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped store
    pub fn inner(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Number of reads currently in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    async fn coalesced_get(&self, namespace: &str, group: &str, uri: &str) -> ReadOutcome {
        let key = FlightKey::new(namespace, group, uri);

        loop {
            let role = {
                let mut in_flight = self.in_flight.lock();
                match in_flight.get(&key) {
                    Some(receiver) => Role::Follower(receiver.clone()),
                    None => {
                        let (sender, receiver) = watch::channel(None);
                        in_flight.insert(key.clone(), receiver);
                        Role::Leader(sender)
                    }
                }
            };

            match role {
                Role::Leader(sender) => {
                    let guard = FlightGuard {
                        in_flight: &self.in_flight,
                        key: &key,
                    };
                    let outcome = self.store.get(namespace, group, uri).await;
                    drop(guard);

                    sender.send_replace(Some(outcome.clone()));
                    return outcome;
                }
                Role::Follower(mut receiver) => {
                    metrics::record_coalesced_read();
                    let shared = receiver
                        .wait_for(Option::is_some)
                        .await
                        .ok()
                        .and_then(|outcome| outcome.clone());

                    match shared {
                        Some(outcome) => return outcome,
                        None => {
                            // Leader was cancelled before publishing; try again
                            debug!(namespace, group, uri, "In-flight read abandoned, retrying");
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Store for Coalescer {
    async fn get(&self, namespace: &str, group: &str, uri: &str) -> CacheResult<Option<Item>> {
        self.coalesced_get(namespace, group, uri).await
    }

    async fn put(
        &self,
        namespace: &str,
        group: &str,
        uri: &str,
        item: &Item,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        self.store.put(namespace, group, uri, item, ttl).await
    }

    async fn del(&self, namespace: &str, group: &str, uri: &str) -> CacheResult<()> {
        self.store.del(namespace, group, uri).await
    }

    async fn del_group(&self, namespace: &str, groups: &[&str]) -> CacheResult<()> {
        self.store.del_group(namespace, groups).await
    }

    async fn shutdown(&self) {
        self.store.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::CacheError;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store whose reads are slow and counted
    struct SlowStore {
        gets: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl SlowStore {
        fn new(delay: Duration, fail: bool) -> Self {
            Self {
                gets: AtomicUsize::new(0),
                delay,
                fail,
            }
        }
    }

    #[async_trait]
    impl Store for SlowStore {
        async fn get(&self, _: &str, _: &str, uri: &str) -> CacheResult<Option<Item>> {
            tokio::time::sleep(self.delay).await;
            self.gets.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CacheError::store_read("backend down"));
            }
            Ok(Some(Item {
                content_type: "text/plain".to_string(),
                etag: "etag".to_string(),
                blob: Bytes::from(uri.to_string()),
                ..Default::default()
            }))
        }

        async fn put(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &Item,
            _: Option<Duration>,
        ) -> CacheResult<()> {
            Ok(())
        }

        async fn del(&self, _: &str, _: &str, _: &str) -> CacheResult<()> {
            Ok(())
        }

        async fn del_group(&self, _: &str, _: &[&str]) -> CacheResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_gets_hit_backend_once() {
        let backend = Arc::new(SlowStore::new(Duration::from_millis(100), false));
        let coalescer = Arc::new(Coalescer::new(backend.clone()));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let coalescer = coalescer.clone();
                tokio::spawn(async move { coalescer.get("namespace", "group", "uri").await })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;

        assert_eq!(backend.gets.load(Ordering::SeqCst), 1);
        for result in results {
            let item = result.unwrap().unwrap().unwrap();
            assert_eq!(&item.blob[..], b"uri");
        }
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_errors_are_shared() {
        let backend = Arc::new(SlowStore::new(Duration::from_millis(50), true));
        let coalescer = Arc::new(Coalescer::new(backend.clone()));

        let (a, b) = tokio::join!(
            coalescer.get("ns", "g", "u"),
            coalescer.get("ns", "g", "u")
        );

        assert_eq!(backend.gets.load(Ordering::SeqCst), 1);
        assert!(matches!(a, Err(CacheError::StoreRead { .. })));
        assert!(matches!(b, Err(CacheError::StoreRead { .. })));
    }

    #[tokio::test]
    async fn test_distinct_keys_are_not_merged() {
        let backend = Arc::new(SlowStore::new(Duration::from_millis(50), false));
        let coalescer = Arc::new(Coalescer::new(backend.clone()));

        let (a, b) = tokio::join!(
            coalescer.get("a", "bc", "x"),
            coalescer.get("ab", "c", "x")
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(backend.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sequential_gets_are_not_cached() {
        let backend = Arc::new(SlowStore::new(Duration::from_millis(1), false));
        let coalescer = Coalescer::new(backend.clone());

        coalescer.get("ns", "g", "u").await.unwrap();
        coalescer.get("ns", "g", "u").await.unwrap();

        assert_eq!(backend.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_leader_hands_over() {
        let backend = Arc::new(SlowStore::new(Duration::from_millis(100), false));
        let coalescer = Arc::new(Coalescer::new(backend.clone()));

        let leader = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move { coalescer.get("ns", "g", "u").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move { coalescer.get("ns", "g", "u").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        let item = follower.await.unwrap().unwrap().unwrap();
        assert_eq!(&item.blob[..], b"u");
        assert_eq!(coalescer.in_flight(), 0);
    }
}
