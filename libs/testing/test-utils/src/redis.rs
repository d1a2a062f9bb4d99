//! Redis container for integration tests.

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Redis 8 container, stopped and removed on drop.
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    client: redis::Client,
    url: String,
}

impl TestRedis {
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag("8-alpine")
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let url = format!("redis://127.0.0.1:{host_port}");
        let client = redis::Client::open(url.as_str()).expect("Failed to create Redis client");

        tracing::info!(port = host_port, "Test Redis ready");

        Self {
            container,
            client,
            url,
        }
    }

    /// URL for `RedisConfig::new`.
    pub fn url(&self) -> String {
        self.url.clone()
    }

    /// A raw connection, for asserting on keys directly.
    pub async fn connection(&self) -> MultiplexedConnection {
        self.client
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis")
    }

    /// Keys matching `pattern`, sorted.
    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        let mut conn = self.connection().await;
        let mut keys: Vec<String> = conn.keys(pattern).await.expect("KEYS failed");
        keys.sort();
        keys
    }
}

impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test Redis container");
    }
}
