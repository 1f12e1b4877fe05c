//! # Redis Cache Store
//!
//! Stores each `(namespace, group)` bucket as one Redis hash, so a group delete is a
//! single `DEL` and a TTL is an `PEXPIRE` on the whole bucket.
//!
//! Layout for key `prefix + namespace + ":" + group`:
//!
//! | field          | value                        |
//! |----------------|------------------------------|
//! | `<uri>_ctype`  | content type                 |
//! | `<uri>_etag`   | validator                    |
//! | `<uri>_comp`   | `""` or `"gzip"`             |
//! | `<uri>_blob`   | body bytes                   |
//!
//! Works over a single-node [`ConnectionManager`] or an async cluster connection. On a
//! cluster, put a `{hash_tag}` in the prefix to keep a namespace on one slot.

use super::super::{BatchWriter, CacheError, CacheResult, Compression, Item, PutRequest, Store};
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{Client, Value};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const CONTENT_TYPE_SUFFIX: &str = "_ctype";
const ETAG_SUFFIX: &str = "_etag";
const COMPRESSION_SUFFIX: &str = "_comp";
const BLOB_SUFFIX: &str = "_blob";

/// Redis store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisStoreConfig {
    /// Connection URL for a single node
    pub url: String,

    /// Prepended to every hash key
    pub prefix: String,

    /// Seed nodes; a non-empty list selects cluster mode
    pub cluster_nodes: Vec<String>,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            prefix: "response-cache:".to_string(),
            cluster_nodes: Vec::new(),
        }
    }
}

impl RedisStoreConfig {
    pub fn is_cluster(&self) -> bool {
        !self.cluster_nodes.is_empty()
    }
}

/// Redis-backed store, generic over the connection so single-node and cluster
/// deployments share one implementation.
pub struct RedisStore<C = ConnectionManager> {
    connection: C,
    prefix: String,
    /// Cluster pipelines cannot span slots, so batches are split per hash key
    split_batches: bool,
}

impl RedisStore<ConnectionManager> {
    /// Connect to a single node. The manager reconnects on its own after failures.
    pub async fn connect(config: &RedisStoreConfig) -> CacheResult<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| CacheError::config(format!("Invalid Redis URL '{}': {}", config.url, e)))?;

        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Unavailable {
                message: format!("Failed to connect to Redis at {}: {}", config.url, e),
            })?;

        info!(url = %config.url, "Redis cache store connected");
        Ok(Self::with_connection(connection, config.prefix.clone(), false))
    }
}

impl RedisStore<ClusterConnection> {
    /// Connect to a Redis cluster through the configured seed nodes
    pub async fn connect_cluster(config: &RedisStoreConfig) -> CacheResult<Self> {
        let client = ClusterClient::new(config.cluster_nodes.clone())
            .map_err(|e| CacheError::config(format!("Invalid Redis cluster nodes: {}", e)))?;

        let connection = client
            .get_async_connection()
            .await
            .map_err(|e| CacheError::Unavailable {
                message: format!("Failed to connect to Redis cluster: {}", e),
            })?;

        info!(nodes = ?config.cluster_nodes, "Redis cluster cache store connected");
        Ok(Self::with_connection(connection, config.prefix.clone(), true))
    }
}

impl<C> RedisStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    pub fn with_connection(connection: C, prefix: String, split_batches: bool) -> Self {
        Self {
            connection,
            prefix,
            split_batches,
        }
    }

    fn key(&self, namespace: &str, group: &str) -> String {
        format!("{}{}:{}", self.prefix, namespace, group)
    }

    fn append_put(&self, pipe: &mut redis::Pipeline, request: &PutRequest) {
        let key = self.key(&request.namespace, &request.group);
        let fields = field_names(&request.uri);
        let item = &request.item;

        pipe.cmd("HSET")
            .arg(&key)
            .arg(&fields[0])
            .arg(&item.content_type)
            .arg(&fields[1])
            .arg(&item.etag)
            .arg(&fields[2])
            .arg(item.compression.as_str())
            .arg(&fields[3])
            .arg(&item.blob[..])
            .ignore();

        if let Some(ttl) = request.ttl {
            pipe.cmd("PEXPIRE").arg(&key).arg(ttl_millis(ttl)).ignore();
        }
    }

    async fn run_pipeline(&self, pipe: &redis::Pipeline) -> CacheResult<()> {
        let mut connection = self.connection.clone();
        pipe.query_async::<_, ()>(&mut connection)
            .await
            .map_err(|e| CacheError::store_write(e.to_string()))
    }
}

#[async_trait]
impl<C> Store for RedisStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, group: &str, uri: &str) -> CacheResult<Option<Item>> {
        let key = self.key(namespace, group);
        let mut connection = self.connection.clone();

        let reply: Value = redis::cmd("HMGET")
            .arg(&key)
            .arg(&field_names(uri)[..])
            .query_async(&mut connection)
            .await
            .map_err(|e| CacheError::store_read(e.to_string()))?;

        decode_item(reply)
    }

    async fn put(
        &self,
        namespace: &str,
        group: &str,
        uri: &str,
        item: &Item,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let mut pipe = redis::pipe();
        self.append_put(&mut pipe, &PutRequest::new(namespace, group, uri, item, ttl));
        self.run_pipeline(&pipe).await
    }

    async fn del(&self, namespace: &str, group: &str, uri: &str) -> CacheResult<()> {
        let mut connection = self.connection.clone();
        redis::cmd("HDEL")
            .arg(self.key(namespace, group))
            .arg(&field_names(uri)[..])
            .query_async::<_, ()>(&mut connection)
            .await
            .map_err(|e| CacheError::store_write(e.to_string()))
    }

    async fn del_group(&self, namespace: &str, groups: &[&str]) -> CacheResult<()> {
        if groups.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = groups.iter().map(|group| self.key(namespace, group)).collect();

        let mut first_error = None;
        for command in delete_commands(&keys, self.split_batches) {
            let mut connection = self.connection.clone();
            if let Err(e) = command.query_async::<_, ()>(&mut connection).await {
                first_error.get_or_insert(CacheError::store_write(e.to_string()));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<C> BatchWriter for RedisStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn put_batch(&self, batch: &[PutRequest]) -> CacheResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        if !self.split_batches {
            let mut pipe = redis::pipe();
            for request in batch {
                self.append_put(&mut pipe, request);
            }
            debug!(writes = batch.len(), "Committing write batch");
            return self.run_pipeline(&pipe).await;
        }

        // One pipeline per hash key, first-seen order
        let mut pipelines: Vec<(String, redis::Pipeline)> = Vec::new();
        for request in batch {
            let key = self.key(&request.namespace, &request.group);
            let index = match pipelines.iter().position(|(existing, _)| *existing == key) {
                Some(index) => index,
                None => {
                    pipelines.push((key, redis::pipe()));
                    pipelines.len() - 1
                }
            };
            self.append_put(&mut pipelines[index].1, request);
        }

        debug!(writes = batch.len(), keys = pipelines.len(), "Committing write batch");
        let mut first_error = None;
        for (_, pipe) in &pipelines {
            if let Err(e) = self.run_pipeline(pipe).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// `DEL` commands for a set of group keys. On a cluster each key is deleted on its
/// own, as group keys rarely share a slot.
fn delete_commands(keys: &[String], per_key: bool) -> Vec<redis::Cmd> {
    if !per_key {
        let mut command = redis::cmd("DEL");
        command.arg(keys);
        return vec![command];
    }

    keys.iter()
        .map(|key| {
            let mut command = redis::cmd("DEL");
            command.arg(key);
            command
        })
        .collect()
}

fn field_names(uri: &str) -> [String; 4] {
    [
        format!("{}{}", uri, CONTENT_TYPE_SUFFIX),
        format!("{}{}", uri, ETAG_SUFFIX),
        format!("{}{}", uri, COMPRESSION_SUFFIX),
        format!("{}{}", uri, BLOB_SUFFIX),
    ]
}

/// Redis rejects a zero expiry, so sub-millisecond TTLs round up
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Turn an `HMGET` reply for the four item fields into an item.
///
/// All four fields missing is a miss. Anything else that is not four byte strings
/// is rejected rather than guessed at.
pub(crate) fn decode_item(reply: Value) -> CacheResult<Option<Item>> {
    let values = match reply {
        Value::Bulk(values) => values,
        Value::Nil => return Ok(None),
        other => {
            return Err(CacheError::malformed(
                "reply",
                format!("expected a multi-bulk reply, got {:?}", other),
            ))
        }
    };

    if values.len() != 4 {
        return Err(CacheError::malformed(
            "reply",
            format!("expected 4 fields, got {}", values.len()),
        ));
    }

    if values.iter().all(|value| matches!(value, Value::Nil)) {
        return Ok(None);
    }

    let mut fields = values.into_iter();
    let mut next = |name: &str| -> CacheResult<Vec<u8>> {
        match fields.next() {
            Some(Value::Data(bytes)) => Ok(bytes),
            Some(Value::Nil) | None => Err(CacheError::malformed(name, "missing")),
            Some(other) => Err(CacheError::malformed(name, format!("unexpected type {:?}", other))),
        }
    };

    let content_type = utf8("ctype", next("ctype")?)?;
    let etag = utf8("etag", next("etag")?)?;
    let compression: Compression = utf8("comp", next("comp")?)?.parse()?;
    let blob = Bytes::from(next("blob")?);

    Ok(Some(Item {
        content_type,
        etag,
        compression,
        blob,
    }))
}

fn utf8(field: &str, bytes: Vec<u8>) -> CacheResult<String> {
    String::from_utf8(bytes).map_err(|_| CacheError::malformed(field, "not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(value: &[u8]) -> Value {
        Value::Data(value.to_vec())
    }

    #[test]
    fn test_decode_complete_item() {
        let reply = Value::Bulk(vec![
            data(b"application/json"),
            data(b"AbCdEfGh12345678"),
            data(b"gzip"),
            data(&[0x1f, 0x8b, 0x08]),
        ]);

        let item = decode_item(reply).unwrap().unwrap();
        assert_eq!(item.content_type, "application/json");
        assert_eq!(item.etag, "AbCdEfGh12345678");
        assert_eq!(item.compression, Compression::Gzip);
        assert_eq!(&item.blob[..], &[0x1f, 0x8b, 0x08]);
    }

    #[test]
    fn test_decode_all_missing_is_miss() {
        let reply = Value::Bulk(vec![Value::Nil, Value::Nil, Value::Nil, Value::Nil]);
        assert_eq!(decode_item(reply).unwrap(), None);
    }

    #[test]
    fn test_decode_empty_blob_keeps_validator() {
        let reply = Value::Bulk(vec![data(b"text/plain"), data(b"etag"), data(b""), data(b"")]);
        let item = decode_item(reply).unwrap().unwrap();
        assert!(!item.has_blob());
        assert_eq!(item.compression, Compression::None);
    }

    #[test]
    fn test_decode_fails_closed() {
        let partial = Value::Bulk(vec![data(b"text/plain"), Value::Nil, data(b""), data(b"x")]);
        assert!(matches!(
            decode_item(partial),
            Err(CacheError::MalformedStoredValue { ref field, .. }) if field == "etag"
        ));

        let wrong_type =
            Value::Bulk(vec![data(b"text/plain"), Value::Int(7), data(b""), data(b"x")]);
        assert!(matches!(decode_item(wrong_type), Err(CacheError::MalformedStoredValue { .. })));

        let bad_utf8 = Value::Bulk(vec![data(&[0xff, 0xfe]), data(b"e"), data(b""), data(b"x")]);
        assert!(matches!(
            decode_item(bad_utf8),
            Err(CacheError::MalformedStoredValue { ref field, .. }) if field == "ctype"
        ));

        let unknown_tag =
            Value::Bulk(vec![data(b"text/plain"), data(b"e"), data(b"br"), data(b"x")]);
        assert!(matches!(
            decode_item(unknown_tag),
            Err(CacheError::MalformedStoredValue { ref field, .. }) if field == "comp"
        ));

        let short = Value::Bulk(vec![Value::Nil]);
        assert!(decode_item(short).is_err());
        assert!(decode_item(Value::Int(1)).is_err());
    }

    #[test]
    fn test_field_layout() {
        let fields = field_names("abc");
        assert_eq!(fields, ["abc_ctype", "abc_etag", "abc_comp", "abc_blob"].map(String::from));
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn test_group_deletes_split_per_key_on_cluster() {
        let keys = vec!["rc:ns:users".to_string(), "rc:ns:orders".to_string()];
        let packed = |commands: Vec<redis::Cmd>| -> Vec<Vec<u8>> {
            commands.iter().map(redis::Cmd::get_packed_command).collect()
        };

        assert_eq!(
            packed(delete_commands(&keys, true)),
            vec![
                redis::cmd("DEL").arg("rc:ns:users").get_packed_command(),
                redis::cmd("DEL").arg("rc:ns:orders").get_packed_command(),
            ]
        );
        assert_eq!(
            packed(delete_commands(&keys, false)),
            vec![redis::cmd("DEL").arg("rc:ns:users").arg("rc:ns:orders").get_packed_command()]
        );
    }

    mod live {
        use super::*;
        use testcontainers::{clients::Cli, core::WaitFor, GenericImage};

        fn redis_image() -> GenericImage {
            GenericImage::new("redis", "7.2-alpine")
                .with_exposed_port(6379)
                .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        }

        fn item() -> Item {
            Item {
                content_type: "text/plain".to_string(),
                etag: "0123456789abcdef".to_string(),
                compression: Compression::None,
                blob: Bytes::from_static(b"hello"),
            }
        }

        #[tokio::test]
        #[ignore] // Requires Docker for Redis container
        async fn test_round_trip_and_group_delete() {
            let docker = Cli::default();
            let node = docker.run(redis_image());
            let config = RedisStoreConfig {
                url: format!("redis://127.0.0.1:{}", node.get_host_port_ipv4(6379)),
                ..Default::default()
            };
            let store = RedisStore::connect(&config).await.unwrap();

            store.put("ns", "users", "u1", &item(), None).await.unwrap();
            assert_eq!(store.get("ns", "users", "u1").await.unwrap(), Some(item()));

            store.del("ns", "users", "u1").await.unwrap();
            assert_eq!(store.get("ns", "users", "u1").await.unwrap(), None);

            store.put("ns", "users", "u2", &item(), None).await.unwrap();
            store.del_group("ns", &["users"]).await.unwrap();
            assert_eq!(store.get("ns", "users", "u2").await.unwrap(), None);
        }

        #[tokio::test]
        #[ignore] // Requires Docker for Redis container
        async fn test_batch_with_group_ttl() {
            let docker = Cli::default();
            let node = docker.run(redis_image());
            let config = RedisStoreConfig {
                url: format!("redis://127.0.0.1:{}", node.get_host_port_ipv4(6379)),
                ..Default::default()
            };
            let store = RedisStore::connect(&config).await.unwrap();

            let batch = vec![
                PutRequest::new("ns", "g", "a", &item(), None),
                PutRequest::new("ns", "g", "b", &item(), Some(Duration::from_millis(200))),
            ];
            store.put_batch(&batch).await.unwrap();
            assert!(store.get("ns", "g", "a").await.unwrap().is_some());

            tokio::time::sleep(Duration::from_millis(400)).await;
            assert_eq!(store.get("ns", "g", "a").await.unwrap(), None);
            assert_eq!(store.get("ns", "g", "b").await.unwrap(), None);
        }
    }
}
