//! Producer side of a queue.

use crate::config::QueueSettings;
use crate::connection::Connection;
use crate::error::QueueError;
use crate::job::{JobCounts, JobHandle, JobRecord, NewJob};
use crate::metrics;
use crate::options::{JobOptions, JobOptionsOverride};
use crate::registry::QueueInspector;
use crate::schema::{JobData, to_validated_value, validate_value};
use crate::state::JobState;
use async_trait::async_trait;
use serde_json::Value;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, warn};

/// A named queue bound to payload type `D`.
///
/// Cheap to clone; clones share the producer connection.
pub struct Queue<D> {
    name: String,
    connection: Connection,
    defaults: JobOptions,
    _payload: PhantomData<fn() -> D>,
}

impl<D> Clone for Queue<D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            connection: self.connection.clone(),
            defaults: self.defaults,
            _payload: PhantomData,
        }
    }
}

impl<D: JobData> Queue<D> {
    /// Bind `name` to the shared connection with `defaults` as the
    /// default job options.
    pub fn new(
        name: impl Into<String>,
        connection: Connection,
        defaults: JobOptions,
    ) -> Result<Self, QueueError> {
        let name = name.into();
        if name.is_empty() || name.contains(':') {
            return Err(QueueError::Config(format!(
                "queue name '{name}' must be non-empty and contain no ':'"
            )));
        }
        defaults.check()?;
        Ok(Self {
            name,
            connection,
            defaults,
            _payload: PhantomData,
        })
    }

    pub fn from_settings(
        name: impl Into<String>,
        connection: Connection,
        settings: &QueueSettings,
    ) -> Result<Self, QueueError> {
        Self::new(name, connection, settings.default_options)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn defaults(&self) -> &JobOptions {
        &self.defaults
    }

    /// Validate `data` and add a job in `waiting`.
    ///
    /// Invalid payloads or options fail before the broker is touched.
    pub async fn enqueue(
        &self,
        name: &str,
        data: &D,
        options: Option<JobOptionsOverride>,
    ) -> Result<JobHandle, QueueError> {
        let value = to_validated_value(data)?;
        self.submit(name, value, options, None).await
    }

    /// Like [`Queue::enqueue`], for raw JSON from a request body.
    pub async fn enqueue_json(
        &self,
        name: &str,
        data: Value,
        options: Option<JobOptionsOverride>,
    ) -> Result<JobHandle, QueueError> {
        let typed: D = validate_value(&data)?;
        let value = serde_json::to_value(&typed)?;
        self.submit(name, value, options, None).await
    }

    /// Add a job that becomes eligible to run after `delay`.
    pub async fn enqueue_delayed(
        &self,
        name: &str,
        data: &D,
        delay: Duration,
        options: Option<JobOptionsOverride>,
    ) -> Result<JobHandle, QueueError> {
        let value = to_validated_value(data)?;
        self.submit(name, value, options, Some(delay)).await
    }

    async fn submit(
        &self,
        job_name: &str,
        data: Value,
        overrides: Option<JobOptionsOverride>,
        delay: Option<Duration>,
    ) -> Result<JobHandle, QueueError> {
        if job_name.is_empty() {
            return Err(QueueError::Validation("job name must not be empty".into()));
        }
        let options = overrides
            .map(|o| self.defaults.merge(&o))
            .unwrap_or(self.defaults);
        options.check()?;

        let delay = delay.filter(|d| !d.is_zero());
        let id = self
            .connection
            .broker()
            .add_job(
                &self.name,
                NewJob {
                    name: job_name.to_string(),
                    data,
                    options,
                    delay,
                },
            )
            .await
            .inspect_err(|e| {
                warn!(queue = %self.name, job = %job_name, error = %e, "Enqueue failed")
            })?;

        metrics::job_enqueued(&self.name, delay.is_some());
        debug!(queue = %self.name, job = %job_name, job_id = %id, "Job enqueued");

        Ok(JobHandle {
            id,
            queue: self.name.clone(),
        })
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, QueueError> {
        self.connection.broker().get_job(&self.name, id).await
    }

    pub async fn counts(&self) -> Result<JobCounts, QueueError> {
        self.connection.broker().counts(&self.name).await
    }

    pub async fn jobs(
        &self,
        state: JobState,
        start: usize,
        end: usize,
    ) -> Result<Vec<JobRecord>, QueueError> {
        self.connection
            .broker()
            .list_jobs(&self.name, state, start, end)
            .await
    }
}

#[async_trait]
impl<D: JobData> QueueInspector for Queue<D> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        Queue::counts(self).await
    }

    async fn jobs(
        &self,
        state: JobState,
        start: usize,
        end: usize,
    ) -> Result<Vec<JobRecord>, QueueError> {
        Queue::jobs(self, state, start, end).await
    }

    async fn job(&self, id: &str) -> Result<Option<JobRecord>, QueueError> {
        self.get_job(id).await
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.connection.broker().ping().await
    }
}
