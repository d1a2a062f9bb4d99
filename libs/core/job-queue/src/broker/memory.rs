//! In-process broker.
//!
//! Same semantics as the Redis broker, with a mutex as the atomicity
//! boundary. Timing uses `tokio::time`, so tests running on a paused clock
//! see backoff delays elapse deterministically.

use super::Broker;
use crate::error::QueueError;
use crate::job::{JobCounts, JobRecord, NewJob};
use crate::state::JobState;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

/// Cap for due times so `Instant` arithmetic never overflows.
const MAX_DELAY: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 10);

#[derive(Default)]
struct QueueData {
    next_id: u64,
    jobs: HashMap<String, JobRecord>,
    /// Front is the oldest waiting job
    wait: VecDeque<String>,
    active: Vec<String>,
    /// Sorted by (due, sequence)
    delayed: Vec<(Instant, u64, String)>,
    delayed_seq: u64,
    /// Back is the most recently finished job
    completed: VecDeque<String>,
    failed: VecDeque<String>,
}

impl QueueData {
    fn schedule(&mut self, id: String, due: Instant) {
        self.delayed_seq += 1;
        let entry = (due, self.delayed_seq, id);
        let index = self.delayed.partition_point(|existing| existing < &entry);
        self.delayed.insert(index, entry);
    }

    fn promote_due(&mut self, now: Instant) -> usize {
        let due = self.delayed.partition_point(|(at, _, _)| *at <= now);
        for (_, _, id) in self.delayed.drain(..due) {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
                job.delay_until = None;
            }
            self.wait.push_back(id);
        }
        due
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.first().map(|(at, _, _)| *at)
    }

    /// Validate and apply a move out of `active`.
    fn leave_active(
        &mut self,
        queue: &str,
        id: &str,
        to: JobState,
    ) -> Result<&mut JobRecord, QueueError> {
        let current = self
            .jobs
            .get(id)
            .map(|job| job.state)
            .ok_or_else(|| QueueError::not_found(queue, id))?;
        JobState::transition(Some(current), to)?;

        self.active.retain(|active| active != id);
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::not_found(queue, id))?;
        job.state = to;
        Ok(job)
    }

    fn trim(finished: &mut VecDeque<String>, jobs: &mut HashMap<String, JobRecord>, keep: u64) {
        while finished.len() as u64 > keep {
            if let Some(id) = finished.pop_front() {
                jobs.remove(&id);
            }
        }
    }

    fn ids(&self, state: JobState) -> Vec<&String> {
        match state {
            JobState::Waiting => self.wait.iter().collect(),
            JobState::Active => self.active.iter().rev().collect(),
            JobState::Delayed => self.delayed.iter().map(|(_, _, id)| id).collect(),
            JobState::Completed => self.completed.iter().rev().collect(),
            JobState::Failed => self.failed.iter().rev().collect(),
        }
    }
}

/// Shared state behind every [`MemoryBroker`] handle created from it.
#[derive(Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<String, QueueData>>,
    changed: Notify,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// One connection to a [`MemoryStore`]. Closing it leaves the store and
/// other handles untouched.
pub struct MemoryBroker {
    name: String,
    store: Arc<MemoryStore>,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new(store: Arc<MemoryStore>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::ConnectionClosed(self.name.clone()));
        }
        Ok(())
    }
}

fn due_after(delay: Duration) -> Instant {
    Instant::now() + delay.min(MAX_DELAY)
}

fn wall_clock_after(delay: Duration) -> Option<DateTime<Utc>> {
    let delta = TimeDelta::from_std(delay.min(MAX_DELAY)).ok()?;
    Utc::now().checked_add_signed(delta)
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn add_job(&self, queue: &str, job: NewJob) -> Result<String, QueueError> {
        self.ensure_open()?;
        let mut queues = self.store.queues.lock().await;
        let data = queues.entry(queue.to_string()).or_default();

        data.next_id += 1;
        let id = data.next_id.to_string();
        let delay = job.delay.filter(|d| !d.is_zero());
        let state = if delay.is_some() {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        JobState::transition(None, state)?;

        data.jobs.insert(
            id.clone(),
            JobRecord {
                id: id.clone(),
                queue: queue.to_string(),
                name: job.name,
                data: job.data,
                options: job.options,
                state,
                attempts_made: 0,
                progress: None,
                result: None,
                failure_reason: None,
                created_at: Utc::now(),
                processed_at: None,
                finished_at: None,
                delay_until: delay.and_then(wall_clock_after),
            },
        );

        match delay {
            Some(delay) => data.schedule(id.clone(), due_after(delay)),
            None => data.wait.push_back(id.clone()),
        }
        drop(queues);

        self.store.changed.notify_waiters();
        Ok(id)
    }

    async fn claim(&self, queue: &str, block: Duration) -> Result<Option<JobRecord>, QueueError> {
        self.ensure_open()?;
        let deadline = due_after(block);

        loop {
            let changed = self.store.changed.notified();
            let wake = {
                let mut queues = self.store.queues.lock().await;
                let data = queues.entry(queue.to_string()).or_default();
                let now = Instant::now();

                let promoted = data.promote_due(now);
                if promoted > 0 {
                    debug!(queue = %queue, promoted, "Promoted delayed jobs");
                }

                while let Some(id) = data.wait.pop_front() {
                    let Some(job) = data.jobs.get_mut(&id) else {
                        continue;
                    };
                    job.state = JobState::transition(Some(job.state), JobState::Active)?;
                    job.attempts_made += 1;
                    job.processed_at = Some(Utc::now());
                    let claimed = job.clone();
                    data.active.push(id);
                    return Ok(Some(claimed));
                }

                if now >= deadline {
                    return Ok(None);
                }
                data.next_due().map_or(deadline, |due| due.min(deadline))
            };

            tokio::select! {
                _ = changed => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
            self.ensure_open()?;
        }
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        progress: &Value,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut queues = self.store.queues.lock().await;
        let job = queues
            .get_mut(queue)
            .and_then(|data| data.jobs.get_mut(id))
            .ok_or_else(|| QueueError::not_found(queue, id))?;
        job.progress = Some(progress.clone());
        Ok(())
    }

    async fn complete(
        &self,
        queue: &str,
        id: &str,
        result: &Value,
        keep: u64,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut queues = self.store.queues.lock().await;
        let data = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::not_found(queue, id))?;

        let job = data.leave_active(queue, id, JobState::Completed)?;
        job.result = Some(result.clone());
        job.finished_at = Some(Utc::now());

        data.completed.push_back(id.to_string());
        QueueData::trim(&mut data.completed, &mut data.jobs, keep);
        Ok(())
    }

    async fn retry_later(
        &self,
        queue: &str,
        id: &str,
        reason: &str,
        delay: Duration,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut queues = self.store.queues.lock().await;
        let data = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::not_found(queue, id))?;

        let job = data.leave_active(queue, id, JobState::Delayed)?;
        job.failure_reason = Some(reason.to_string());
        job.delay_until = wall_clock_after(delay);

        data.schedule(id.to_string(), due_after(delay));
        drop(queues);

        self.store.changed.notify_waiters();
        Ok(())
    }

    async fn fail(
        &self,
        queue: &str,
        id: &str,
        reason: &str,
        keep: u64,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut queues = self.store.queues.lock().await;
        let data = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::not_found(queue, id))?;

        let job = data.leave_active(queue, id, JobState::Failed)?;
        job.failure_reason = Some(reason.to_string());
        job.finished_at = Some(Utc::now());

        data.failed.push_back(id.to_string());
        QueueData::trim(&mut data.failed, &mut data.jobs, keep);
        Ok(())
    }

    async fn get_job(&self, queue: &str, id: &str) -> Result<Option<JobRecord>, QueueError> {
        self.ensure_open()?;
        let queues = self.store.queues.lock().await;
        Ok(queues
            .get(queue)
            .and_then(|data| data.jobs.get(id))
            .cloned())
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        self.ensure_open()?;
        let queues = self.store.queues.lock().await;
        Ok(queues
            .get(queue)
            .map(|data| JobCounts {
                waiting: data.wait.len() as u64,
                active: data.active.len() as u64,
                delayed: data.delayed.len() as u64,
                completed: data.completed.len() as u64,
                failed: data.failed.len() as u64,
            })
            .unwrap_or_default())
    }

    async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        start: usize,
        end: usize,
    ) -> Result<Vec<JobRecord>, QueueError> {
        self.ensure_open()?;
        if end < start {
            return Ok(Vec::new());
        }
        let queues = self.store.queues.lock().await;
        let Some(data) = queues.get(queue) else {
            return Ok(Vec::new());
        };

        Ok(data
            .ids(state)
            .into_iter()
            .skip(start)
            .take(end - start + 1)
            .filter_map(|id| data.jobs.get(id).cloned())
            .collect())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(connection = %self.name, "Closed in-memory connection");
            self.store.changed.notify_waiters();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::JobOptions;
    use serde_json::json;

    fn new_job(name: &str, delay: Option<Duration>) -> NewJob {
        NewJob {
            name: name.into(),
            data: json!({"name": name}),
            options: JobOptions::default(),
            delay,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_is_fifo_and_counts_attempts() {
        let broker = MemoryBroker::new(MemoryStore::new(), "test");
        let first = broker.add_job("q", new_job("a", None)).await.unwrap();
        let second = broker.add_job("q", new_job("b", None)).await.unwrap();

        let claimed = broker.claim("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempts_made, 1);
        assert!(claimed.processed_at.is_some());

        let next = broker.claim("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(next.id, second);
        assert!(broker.claim("q", Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_waits_for_new_job() {
        let store = MemoryStore::new();
        let consumer = MemoryBroker::new(store.clone(), "consumer");
        let producer = MemoryBroker::new(store, "producer");

        let claim = tokio::spawn(async move { consumer.claim("q", Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let id = producer.add_job("q", new_job("late", None)).await.unwrap();

        let claimed = claim.await.unwrap().unwrap().unwrap();
        assert_eq!(claimed.id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_job_promoted_when_due() {
        let broker = MemoryBroker::new(MemoryStore::new(), "test");
        let id = broker
            .add_job("q", new_job("later", Some(Duration::from_millis(1500))))
            .await
            .unwrap();
        assert_eq!(broker.counts("q").await.unwrap().delayed, 1);

        let start = Instant::now();
        let claimed = broker
            .claim("q", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, id);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(1500), "{waited:?}");
        assert!(waited < Duration::from_millis(1600), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_keeps_most_recent() {
        let broker = MemoryBroker::new(MemoryStore::new(), "test");
        for i in 0..5 {
            broker.add_job("q", new_job(&format!("job-{i}"), None)).await.unwrap();
        }
        for _ in 0..5 {
            let job = broker.claim("q", Duration::ZERO).await.unwrap().unwrap();
            broker.complete("q", &job.id, &json!(true), 2).await.unwrap();
        }

        let remaining = broker.list_jobs("q", JobState::Completed, 0, 10).await.unwrap();
        let ids: Vec<_> = remaining.iter().map(|job| job.id.as_str()).collect();
        assert_eq!(ids, ["5", "4"]);
        assert!(broker.get_job("q", "1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_job_cannot_move() {
        let broker = MemoryBroker::new(MemoryStore::new(), "test");
        broker.add_job("q", new_job("a", None)).await.unwrap();
        let job = broker.claim("q", Duration::ZERO).await.unwrap().unwrap();
        broker.fail("q", &job.id, "boom", 10).await.unwrap();

        let err = broker
            .retry_later("q", &job.id, "again", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_close_is_per_handle_and_idempotent() {
        let store = MemoryStore::new();
        let first = MemoryBroker::new(store.clone(), "first");
        let second = MemoryBroker::new(store, "second");

        first.close().await.unwrap();
        first.close().await.unwrap();
        assert!(first.is_closed());
        assert!(matches!(first.ping().await, Err(QueueError::ConnectionClosed(_))));
        assert!(second.ping().await.is_ok());
    }
}
