//! Broker backends.
//!
//! Every state change a job goes through is one call on [`Broker`], executed
//! atomically by the backend. [`RedisBroker`] runs each of them as a Lua
//! script; [`MemoryBroker`] holds a mutex over an in-process store.

mod memory;
mod redis;

pub use self::memory::{MemoryBroker, MemoryStore};
pub use self::redis::{QueueKeys, RedisBroker};

use crate::error::QueueError;
use crate::job::{JobCounts, JobRecord, NewJob};
use crate::state::JobState;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Default key prefix, shared with BullMQ tooling.
pub const DEFAULT_PREFIX: &str = "bull";

#[async_trait]
pub trait Broker: Send + Sync {
    /// Create a job in `waiting`, or `delayed` when `job.delay` is set.
    /// Returns the new id.
    async fn add_job(&self, queue: &str, job: NewJob) -> Result<String, QueueError>;

    /// Claim the next waiting job, waiting up to `block` for one.
    ///
    /// Promotes due delayed jobs first. The claimed job moves to `active`
    /// with `attempts_made` incremented.
    async fn claim(&self, queue: &str, block: Duration) -> Result<Option<JobRecord>, QueueError>;

    async fn update_progress(&self, queue: &str, id: &str, progress: &Value)
    -> Result<(), QueueError>;

    /// `active -> completed`, then trim completed jobs down to `keep`.
    async fn complete(
        &self,
        queue: &str,
        id: &str,
        result: &Value,
        keep: u64,
    ) -> Result<(), QueueError>;

    /// `active -> delayed`, due after `delay`.
    async fn retry_later(
        &self,
        queue: &str,
        id: &str,
        reason: &str,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// `active -> failed`, then trim failed jobs down to `keep`.
    async fn fail(&self, queue: &str, id: &str, reason: &str, keep: u64)
    -> Result<(), QueueError>;

    async fn get_job(&self, queue: &str, id: &str) -> Result<Option<JobRecord>, QueueError>;

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError>;

    /// Jobs in `state`, by inclusive index range. Waiting jobs come oldest
    /// first, delayed jobs soonest due first, finished jobs most recent first.
    async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        start: usize,
        end: usize,
    ) -> Result<Vec<JobRecord>, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;

    /// Close the underlying connection. Closing twice is a no-op.
    async fn close(&self) -> Result<(), QueueError>;

    fn is_closed(&self) -> bool;
}
