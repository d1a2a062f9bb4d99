//! Shared test utilities for the job queue crates
//!
//! - `TestRedis`: Redis container with automatic cleanup
//! - `TestKeys`: deterministic key prefixes and queue names, so tests sharing
//!   one Redis never see each other's keys
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::{TestKeys, TestRedis};
//!
//! #[tokio::test]
//! #[ignore]
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let keys = TestKeys::from_test_name("my_redis_test");
//!     let factory = ConnectionFactory::redis_with_prefix(
//!         &RedisConfig::new(redis.url()),
//!         &keys.prefix(),
//!     ).unwrap();
//! }
//! ```

mod redis;

pub use redis::TestRedis;

use uuid::Uuid;

/// Deterministic names derived from a seed
pub struct TestKeys {
    seed: u64,
}

impl TestKeys {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Seed from the test name, so reruns use the same names.
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Key prefix for this test, e.g. `test-1234`.
    pub fn prefix(&self) -> String {
        format!("test-{}", self.seed)
    }

    /// Queue name, e.g. `emails-1234`. Never contains `:`.
    pub fn queue(&self, name: &str) -> String {
        format!("{}-{}", name, self.seed)
    }

    /// Worker id that differs per call, for tests running several workers.
    pub fn worker_id(&self, index: usize) -> String {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&(index as u64).to_le_bytes());
        format!("worker-{}", Uuid::from_bytes(uuid_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_deterministic() {
        let first = TestKeys::from_test_name("my_test");
        let second = TestKeys::from_test_name("my_test");
        assert_eq!(first.prefix(), second.prefix());
        assert_eq!(first.queue("emails"), second.queue("emails"));
    }

    #[test]
    fn test_keys_differ_by_name() {
        let first = TestKeys::from_test_name("test1");
        let second = TestKeys::from_test_name("test2");
        assert_ne!(first.prefix(), second.prefix());
    }

    #[test]
    fn test_worker_ids_are_distinct() {
        let keys = TestKeys::new(42);
        assert_ne!(keys.worker_id(0), keys.worker_id(1));
        assert!(!keys.queue("emails").contains(':'));
    }
}
