//! # Write-Back Pipeline
//!
//! Store decorator that takes puts off the serving path. In asynchronous mode a put is
//! copied into a [`PutRequest`], queued on a bounded channel, and acknowledged at
//! once; a single worker task drains the queue and commits batches through
//! [`BatchWriter::put_batch`].
//!
//! A batch commits when it reaches `max_commit_size` writes or when the commit timer
//! fires with at least one write pending. A full queue makes callers wait.
//!
//! ## Delivery
//! Writes are at-most-once. The caller has already been told the put succeeded, so
//! when a commit fails the whole batch is dropped, logged and counted under
//! `response_cache_write_back_lost_writes_total`. There is no retry. For a cache this
//! only costs extra misses, but a deployment that needs every fill to land should run
//! with `asynchronous: false`.
//!
//! Reads, deletes and group deletes bypass the queue, so a delete may be overtaken by
//! a put that was queued before it.

use super::super::{BatchWriter, CacheError, CacheResult, Item, PutRequest, Store};
use crate::observability::metrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Write-back configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteBackConfig {
    /// Queue puts and commit them in the background
    pub asynchronous: bool,

    /// Queue capacity; a full queue blocks callers
    pub buffer_size: usize,

    /// Writes per commit
    pub max_commit_size: usize,

    /// Commit pending writes at least this often
    #[serde(with = "humantime_serde")]
    pub commit_interval: Duration,
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self {
            asynchronous: true,
            buffer_size: 1000,
            max_commit_size: 100,
            commit_interval: Duration::from_millis(100),
        }
    }
}

impl WriteBackConfig {
    pub fn validate(&self) -> CacheResult<()> {
        if self.buffer_size == 0 {
            return Err(CacheError::config("write_back.buffer_size must be greater than 0"));
        }
        if self.max_commit_size == 0 {
            return Err(CacheError::config("write_back.max_commit_size must be greater than 0"));
        }
        if self.commit_interval.is_zero() {
            return Err(CacheError::config("write_back.commit_interval must be greater than 0"));
        }
        Ok(())
    }
}

/// Store decorator running the write-back pipeline over `S`
pub struct WriteBackStore<S> {
    inner: Arc<S>,
    sender: Option<mpsc::Sender<PutRequest>>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S> WriteBackStore<S>
where
    S: Store + BatchWriter + 'static,
{
    /// Wrap `inner`. In asynchronous mode this spawns the commit worker, so it must be
    /// called inside a tokio runtime.
    pub fn new(inner: Arc<S>, config: WriteBackConfig) -> CacheResult<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();

        if !config.asynchronous {
            return Ok(Self {
                inner,
                sender: None,
                shutdown,
                worker: Mutex::new(None),
            });
        }

        let (sender, receiver) = mpsc::channel(config.buffer_size);
        let worker = CommitWorker {
            store: inner.clone(),
            receiver,
            shutdown: shutdown.clone(),
            max_commit_size: config.max_commit_size,
            commit_interval: config.commit_interval,
        };
        let handle = tokio::spawn(worker.run());

        info!(
            buffer_size = config.buffer_size,
            max_commit_size = config.max_commit_size,
            commit_interval = ?config.commit_interval,
            "Write-back pipeline started"
        );

        Ok(Self {
            inner,
            sender: Some(sender),
            shutdown,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    pub fn is_asynchronous(&self) -> bool {
        self.sender.is_some()
    }
}

#[async_trait]
impl<S> Store for WriteBackStore<S>
where
    S: Store + BatchWriter + 'static,
{
    async fn get(&self, namespace: &str, group: &str, uri: &str) -> CacheResult<Option<Item>> {
        self.inner.get(namespace, group, uri).await
    }

    async fn put(
        &self,
        namespace: &str,
        group: &str,
        uri: &str,
        item: &Item,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let Some(sender) = &self.sender else {
            return self.inner.put(namespace, group, uri, item, ttl).await;
        };

        if self.shutdown.is_cancelled() {
            return Err(CacheError::Unavailable {
                message: "write-back pipeline is shut down".to_string(),
            });
        }

        sender
            .send(PutRequest::new(namespace, group, uri, item, ttl))
            .await
            .map_err(|_| CacheError::Unavailable {
                message: "write-back pipeline is shut down".to_string(),
            })
    }

    async fn del(&self, namespace: &str, group: &str, uri: &str) -> CacheResult<()> {
        self.inner.del(namespace, group, uri).await
    }

    async fn del_group(&self, namespace: &str, groups: &[&str]) -> CacheResult<()> {
        self.inner.del_group(namespace, groups).await
    }

    /// Stop accepting puts, commit everything still queued and wait for the worker.
    async fn shutdown(&self) {
        self.shutdown.cancel();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Write-back worker terminated abnormally");
            }
        }
    }
}

impl<S> Drop for WriteBackStore<S> {
    fn drop(&mut self) {
        // Closing the channel makes the worker flush and exit on its own
        self.sender.take();
    }
}

struct CommitWorker<S> {
    store: Arc<S>,
    receiver: mpsc::Receiver<PutRequest>,
    shutdown: CancellationToken,
    max_commit_size: usize,
    commit_interval: Duration,
}

impl<S> CommitWorker<S>
where
    S: BatchWriter + 'static,
{
    async fn run(mut self) {
        let mut batch: Vec<PutRequest> = Vec::with_capacity(self.max_commit_size);
        let mut ticker = interval(self.commit_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    self.receiver.close();
                    while let Ok(request) = self.receiver.try_recv() {
                        batch.push(request);
                    }
                    self.commit(&mut batch).await;
                    break;
                }
                received = self.receiver.recv() => match received {
                    Some(request) => {
                        batch.push(request);
                        if batch.len() >= self.max_commit_size {
                            self.commit(&mut batch).await;
                        }
                    }
                    None => {
                        self.commit(&mut batch).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.commit(&mut batch).await;
                    }
                }
            }
        }

        debug!("Write-back worker stopped");
    }

    async fn commit(&self, batch: &mut Vec<PutRequest>) {
        if batch.is_empty() {
            return;
        }

        let writes = batch.len();
        match self.store.put_batch(batch).await {
            Ok(()) => {
                debug!(writes, "Write-back batch committed");
                metrics::record_commit(writes, true);
            }
            Err(e) => {
                error!(writes, error = %e, "Write-back batch failed, writes discarded");
                metrics::record_commit(writes, false);
            }
        }
        batch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::stores::{InMemoryStore, InMemoryStoreConfig};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout};

    fn item(body: &str) -> Item {
        Item {
            content_type: "text/plain".to_string(),
            etag: "0123456789abcdef".to_string(),
            blob: Bytes::copy_from_slice(body.as_bytes()),
            ..Default::default()
        }
    }

    /// Records every committed batch size and can be told to fail or stall
    #[derive(Default)]
    struct RecordingStore {
        batches: Mutex<Vec<usize>>,
        direct_puts: AtomicUsize,
        fail: AtomicBool,
        commit_delay: Duration,
    }

    #[async_trait]
    impl Store for RecordingStore {
        async fn get(&self, _: &str, _: &str, _: &str) -> CacheResult<Option<Item>> {
            Ok(None)
        }

        async fn put(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &Item,
            _: Option<Duration>,
        ) -> CacheResult<()> {
            self.direct_puts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn del(&self, _: &str, _: &str, _: &str) -> CacheResult<()> {
            Ok(())
        }

        async fn del_group(&self, _: &str, _: &[&str]) -> CacheResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl BatchWriter for RecordingStore {
        async fn put_batch(&self, batch: &[PutRequest]) -> CacheResult<()> {
            self.batches.lock().push(batch.len());
            if !self.commit_delay.is_zero() {
                sleep(self.commit_delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(CacheError::store_write("connection reset"));
            }
            Ok(())
        }
    }

    fn config(max_commit_size: usize, commit_interval: Duration) -> WriteBackConfig {
        WriteBackConfig {
            asynchronous: true,
            buffer_size: 64,
            max_commit_size,
            commit_interval,
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(WriteBackConfig::default().validate().is_ok());

        let bad = WriteBackConfig {
            max_commit_size: 0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(CacheError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_async_puts_become_visible() {
        let backend = Arc::new(InMemoryStore::new(InMemoryStoreConfig::default()));
        let store = WriteBackStore::new(backend, config(5, Duration::from_millis(100))).unwrap();

        for i in 0..20 {
            store
                .put("ns", "g", &format!("uri-{}", i), &item(&format!("body-{}", i)), None)
                .await
                .unwrap();
        }

        sleep(Duration::from_millis(200)).await;

        for i in 0..20 {
            let found = store.get("ns", "g", &format!("uri-{}", i)).await.unwrap().unwrap();
            assert_eq!(found.blob, Bytes::from(format!("body-{}", i)));
        }
    }

    #[tokio::test]
    async fn test_commit_on_size() {
        let backend = Arc::new(RecordingStore::default());
        let store =
            WriteBackStore::new(backend.clone(), config(3, Duration::from_secs(60))).unwrap();

        for i in 0..6 {
            store.put("ns", "g", &i.to_string(), &item("x"), None).await.unwrap();
        }
        sleep(Duration::from_millis(50)).await;

        assert_eq!(*backend.batches.lock(), vec![3, 3]);
    }

    #[tokio::test]
    async fn test_commit_on_timer() {
        let backend = Arc::new(RecordingStore::default());
        let store =
            WriteBackStore::new(backend.clone(), config(100, Duration::from_millis(30))).unwrap();

        store.put("ns", "g", "u", &item("x"), None).await.unwrap();
        assert!(backend.batches.lock().is_empty());

        sleep(Duration::from_millis(100)).await;
        assert_eq!(*backend.batches.lock(), vec![1]);
    }

    #[tokio::test]
    async fn test_failed_commit_is_dropped() {
        let backend = Arc::new(RecordingStore::default());
        backend.fail.store(true, Ordering::SeqCst);
        let store =
            WriteBackStore::new(backend.clone(), config(2, Duration::from_millis(20))).unwrap();

        assert!(store.put("ns", "g", "a", &item("x"), None).await.is_ok());
        assert!(store.put("ns", "g", "b", &item("x"), None).await.is_ok());
        sleep(Duration::from_millis(80)).await;

        // One attempt, no retry
        assert_eq!(*backend.batches.lock(), vec![2]);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_writes() {
        let backend = Arc::new(RecordingStore::default());
        let store =
            WriteBackStore::new(backend.clone(), config(100, Duration::from_secs(60))).unwrap();

        for i in 0..7 {
            store.put("ns", "g", &i.to_string(), &item("x"), None).await.unwrap();
        }
        store.shutdown().await;

        assert_eq!(backend.batches.lock().iter().sum::<usize>(), 7);
        let after = store.put("ns", "g", "late", &item("x"), None).await;
        assert!(matches!(after, Err(CacheError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_synchronous_mode_writes_through() {
        let backend = Arc::new(RecordingStore::default());
        let store = WriteBackStore::new(
            backend.clone(),
            WriteBackConfig {
                asynchronous: false,
                ..Default::default()
            },
        )
        .unwrap();

        store.put("ns", "g", "u", &item("x"), None).await.unwrap();

        assert!(!store.is_asynchronous());
        assert_eq!(backend.direct_puts.load(Ordering::SeqCst), 1);
        assert!(backend.batches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_blocks_put() {
        let backend = Arc::new(RecordingStore {
            commit_delay: Duration::from_millis(500),
            ..Default::default()
        });
        let config = WriteBackConfig {
            asynchronous: true,
            buffer_size: 2,
            max_commit_size: 1,
            commit_interval: Duration::from_secs(60),
        };
        let store = WriteBackStore::new(backend.clone(), config).unwrap();

        // The worker takes the first put and stalls committing it; two more fill the queue
        store.put("ns", "g", "0", &item("x"), None).await.unwrap();
        sleep(Duration::from_millis(20)).await;
        store.put("ns", "g", "1", &item("x"), None).await.unwrap();
        store.put("ns", "g", "2", &item("x"), None).await.unwrap();

        let blocked = timeout(
            Duration::from_millis(100),
            store.put("ns", "g", "3", &item("x"), None),
        )
        .await;
        assert!(blocked.is_err());

        store.shutdown().await;
        assert_eq!(backend.batches.lock().iter().sum::<usize>(), 3);
    }
}
