//! Broker connections.
//!
//! The composition root creates every connection through a
//! [`ConnectionFactory`] and hands them to queues and workers; the shutdown
//! coordinator closes them. Nothing in this crate opens a connection on its
//! own.
//!
//! - **Shared**: one per process, used concurrently by producers and the
//!   admin endpoints for short, non-blocking commands.
//! - **Dedicated**: one per worker, able to park on a blocking claim for as
//!   long as it takes.

use crate::broker::{Broker, DEFAULT_PREFIX, MemoryBroker, MemoryStore, RedisBroker};
use crate::error::QueueError;
use async_trait::async_trait;
use core_config::redis::RedisConfig;
use futures::future::join_all;
use std::sync::Arc;
use strum::{AsRefStr, Display};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionKind {
    Shared,
    Dedicated,
}

/// Opens broker handles for a factory.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, kind: ConnectionKind, name: &str)
    -> Result<Arc<dyn Broker>, QueueError>;
}

/// Connects to Redis.
pub struct RedisConnector {
    client: redis::Client,
    prefix: String,
}

impl RedisConnector {
    pub fn new(config: &RedisConfig, prefix: impl Into<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| QueueError::Config(format!("invalid Redis URL: {e}")))?;
        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(
        &self,
        kind: ConnectionKind,
        name: &str,
    ) -> Result<Arc<dyn Broker>, QueueError> {
        let broker = RedisBroker::connect(
            self.client.clone(),
            self.prefix.clone(),
            name,
            kind == ConnectionKind::Dedicated,
        )
        .await?;
        Ok(Arc::new(broker))
    }
}

/// Connects to an in-process store shared by every connection it creates.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        _kind: ConnectionKind,
        name: &str,
    ) -> Result<Arc<dyn Broker>, QueueError> {
        Ok(Arc::new(MemoryBroker::new(self.store.clone(), name)))
    }
}

/// A named broker handle.
#[derive(Clone)]
pub struct Connection {
    name: String,
    kind: ConnectionKind,
    broker: Arc<dyn Broker>,
}

impl Connection {
    pub fn new(name: impl Into<String>, kind: ConnectionKind, broker: Arc<dyn Broker>) -> Self {
        Self {
            name: name.into(),
            kind,
            broker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn is_closed(&self) -> bool {
        self.broker.is_closed()
    }

    /// Close the connection. A second call is a no-op.
    pub async fn close(&self) -> Result<(), QueueError> {
        self.broker.close().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Result of closing one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseOutcome {
    pub name: String,
    pub kind: ConnectionKind,
    pub error: Option<String>,
}

impl CloseOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Close every connection independently; one failure never stops the rest.
pub async fn close_all(connections: &[Connection]) -> Vec<CloseOutcome> {
    join_all(connections.iter().map(|connection| async move {
        let result = connection.close().await;
        if let Err(e) = &result {
            error!(connection = %connection.name(), error = %e, "Failed to close connection");
        }
        CloseOutcome {
            name: connection.name().to_string(),
            kind: connection.kind(),
            error: result.err().map(|e| e.to_string()),
        }
    }))
    .await
}

/// Creates connections through a [`Connector`].
#[derive(Clone)]
pub struct ConnectionFactory {
    connector: Arc<dyn Connector>,
}

impl ConnectionFactory {
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self {
            connector: Arc::new(connector),
        }
    }

    /// Redis-backed factory using the default `bull` key prefix.
    pub fn redis(config: &RedisConfig) -> Result<Self, QueueError> {
        Self::redis_with_prefix(config, DEFAULT_PREFIX)
    }

    pub fn redis_with_prefix(config: &RedisConfig, prefix: &str) -> Result<Self, QueueError> {
        Ok(Self::new(RedisConnector::new(config, prefix)?))
    }

    pub fn memory() -> Self {
        Self::new(MemoryConnector::new())
    }

    /// Open a connection. Fails fast if the broker is unreachable.
    pub async fn create(&self, kind: ConnectionKind, name: &str) -> Result<Connection, QueueError> {
        let broker = self.connector.connect(kind, name).await?;
        info!(connection = %name, kind = %kind, "Connection created");
        Ok(Connection::new(name, kind, broker))
    }

    /// The producer/admin connection.
    pub async fn shared(&self) -> Result<Connection, QueueError> {
        self.create(ConnectionKind::Shared, "producer").await
    }

    /// A connection owned by a single worker.
    pub async fn dedicated(&self, name: &str) -> Result<Connection, QueueError> {
        self.create(ConnectionKind::Dedicated, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_factory_connections_share_store() {
        let factory = ConnectionFactory::memory();
        let producer = factory.shared().await.unwrap();
        let worker = factory.dedicated("worker-1").await.unwrap();

        assert_eq!(producer.kind(), ConnectionKind::Shared);
        assert_eq!(worker.kind(), ConnectionKind::Dedicated);
        assert_eq!(worker.name(), "worker-1");

        let job = crate::job::NewJob {
            name: "ping".into(),
            data: serde_json::json!({}),
            options: Default::default(),
            delay: None,
        };
        producer.broker().add_job("q", job).await.unwrap();
        assert_eq!(worker.broker().counts("q").await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_close_all_closes_each_connection() {
        let factory = ConnectionFactory::memory();
        let connections = vec![
            factory.dedicated("worker-1").await.unwrap(),
            factory.dedicated("worker-2").await.unwrap(),
        ];

        let outcomes = close_all(&connections).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(CloseOutcome::is_ok));
        assert!(connections.iter().all(Connection::is_closed));

        // Closing again is a no-op.
        assert!(close_all(&connections).await.iter().all(CloseOutcome::is_ok));
    }

    #[test]
    fn test_invalid_redis_url() {
        let config = RedisConfig::new("not a url");
        assert!(matches!(
            ConnectionFactory::redis(&config),
            Err(QueueError::Config(_))
        ));
    }

    // Requires Docker: run with `cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_redis_factory_round_trip() {
        let redis = test_utils::TestRedis::new().await;
        let factory = ConnectionFactory::redis(&RedisConfig::new(redis.url())).unwrap();
        let producer = factory.shared().await.unwrap();
        producer.broker().ping().await.unwrap();
        producer.close().await.unwrap();
        assert!(producer.is_closed());
    }

    #[tokio::test]
    async fn test_unreachable_redis_fails_fast() {
        let factory = ConnectionFactory::redis(&RedisConfig::new("redis://127.0.0.1:1")).unwrap();
        let err = factory.shared().await.unwrap_err();
        assert!(matches!(err, QueueError::Connect { .. }));
    }
}
