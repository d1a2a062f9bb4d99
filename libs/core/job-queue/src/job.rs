//! Job records and the typed view handed to processors.

use crate::broker::Broker;
use crate::error::QueueError;
use crate::events::WorkerEvent;
use crate::options::JobOptions;
use crate::state::JobState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

/// Broker-resident job, as stored and as returned by inspection calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub data: Value,
    pub options: JobOptions,
    pub state: JobState,
    pub attempts_made: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<DateTime<Utc>>,
}

/// A validated job ready to hand to the broker.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub data: Value,
    pub options: JobOptions,
    /// Created in `delayed` instead of `waiting` when set
    pub delay: Option<Duration>,
}

/// Returned by enqueue; the job itself lives in the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub id: String,
    pub queue: String,
}

/// Job totals per state for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Active => self.active,
            JobState::Delayed => self.delayed,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.delayed + self.completed + self.failed
    }
}

/// A claimed job as seen by a processor.
pub struct Job<D> {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub data: D,
    /// Attempt number of the current execution, starting at 1
    pub attempts_made: u32,
    pub options: JobOptions,
    pub created_at: DateTime<Utc>,
    broker: Arc<dyn Broker>,
    events: broadcast::Sender<WorkerEvent>,
    /// Highest numeric progress reported in this attempt, as `f64` bits
    numeric_progress: AtomicU64,
}

impl<D> Job<D> {
    pub(crate) fn new(
        record: &JobRecord,
        data: D,
        broker: Arc<dyn Broker>,
        events: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            id: record.id.clone(),
            queue: record.queue.clone(),
            name: record.name.clone(),
            data,
            attempts_made: record.attempts_made,
            options: record.options,
            created_at: record.created_at,
            broker,
            events,
            numeric_progress: AtomicU64::new(f64::NEG_INFINITY.to_bits()),
        }
    }

    /// Persist progress on the job record and publish a progress event.
    ///
    /// Numeric progress is monotonic within an attempt: a number lower than
    /// one already reported is rejected with `QueueError::Validation` and
    /// nothing is stored. Non-numeric progress (objects, strings) is stored
    /// as given.
    pub async fn report_progress(&self, progress: impl Into<Value>) -> Result<(), QueueError> {
        let progress = progress.into();
        if let Some(value) = progress.as_f64() {
            self.numeric_progress
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                    (value >= f64::from_bits(last)).then_some(value.to_bits())
                })
                .map_err(|last| {
                    QueueError::Validation(format!(
                        "progress {value} is below previously reported {}",
                        f64::from_bits(last)
                    ))
                })?;
        }

        self.broker
            .update_progress(&self.queue, &self.id, &progress)
            .await?;
        let _ = self.events.send(WorkerEvent::Progress {
            queue: self.queue.clone(),
            job_id: self.id.clone(),
            progress,
        });
        Ok(())
    }
}

impl<D: std::fmt::Debug> std::fmt::Debug for Job<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("name", &self.name)
            .field("data", &self.data)
            .field("attempts_made", &self.attempts_made)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_state() {
        let counts = JobCounts {
            waiting: 2,
            active: 1,
            delayed: 3,
            completed: 10,
            failed: 4,
        };
        assert_eq!(counts.get(JobState::Delayed), 3);
        assert_eq!(counts.get(JobState::Failed), 4);
        assert_eq!(counts.total(), 20);
    }

    fn waiting_record() -> JobRecord {
        JobRecord {
            id: "1".into(),
            queue: "emails".into(),
            name: "welcome".into(),
            data: serde_json::json!({"to": "a@b.c"}),
            options: JobOptions::default(),
            state: JobState::Waiting,
            attempts_made: 0,
            progress: None,
            result: None,
            failure_reason: None,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            delay_until: None,
        }
    }

    #[test]
    fn test_record_omits_empty_fields() {
        let json = serde_json::to_value(waiting_record()).unwrap();
        assert_eq!(json["state"], "waiting");
        assert!(json.get("result").is_none());
        assert!(json.get("failure_reason").is_none());
    }

    #[tokio::test]
    async fn test_numeric_progress_cannot_go_backwards() {
        use crate::broker::{MemoryBroker, MemoryStore};

        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new(MemoryStore::new(), "test"));
        let record = waiting_record();
        let id = broker
            .add_job(
                &record.queue,
                NewJob {
                    name: record.name.clone(),
                    data: record.data.clone(),
                    options: record.options,
                    delay: None,
                },
            )
            .await
            .unwrap();
        let record = JobRecord { id, ..record };

        let (events, _) = broadcast::channel(8);
        let job = Job::new(&record, (), broker.clone(), events);

        job.report_progress(40).await.unwrap();
        job.report_progress(40).await.unwrap();
        job.report_progress(serde_json::json!({ "stage": "upload" }))
            .await
            .unwrap();
        job.report_progress(75.5).await.unwrap();

        let err = job.report_progress(10).await.unwrap_err();
        assert!(err.is_validation());

        let stored = broker.get_job(&record.queue, &record.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, Some(serde_json::json!(75.5)));
    }
}
