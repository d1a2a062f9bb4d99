//! Consumer side: the `JobProcessor` trait and the `Worker` loop.
//!
//! A worker claims jobs from one queue over its own dedicated connection,
//! runs at most `concurrency` of them at once, and resolves every attempt
//! into the job state machine:
//!
//! - success: `active -> completed`, result stored, old completed jobs trimmed
//! - failure with attempts left: `active -> delayed` for the backoff delay
//! - failure on the last attempt: `active -> failed`, old failed jobs trimmed
//!
//! Processor errors, payloads that no longer validate and processor panics
//! are all failed attempts. Nothing a processor does can stop the worker.

use crate::broker::Broker;
use crate::config::WorkerConfig;
use crate::connection::{Connection, ConnectionKind};
use crate::error::QueueError;
use crate::events::WorkerEvent;
use crate::job::{Job, JobRecord};
use crate::metrics::WorkerMetrics;
use crate::schema::{JobData, validate_value};
use crate::state::AttemptOutcome;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Trait for job processors.
///
/// # Example
///
/// ```rust,ignore
/// struct SendWelcome { mailer: Mailer }
///
/// #[async_trait]
/// impl JobProcessor<WelcomeEmail> for SendWelcome {
///     async fn process(&self, job: &Job<WelcomeEmail>) -> eyre::Result<Value> {
///         self.mailer.send(&job.data.to).await?;
///         job.report_progress(100).await?;
///         Ok(json!({ "sent": true }))
///     }
/// }
/// ```
#[async_trait]
pub trait JobProcessor<D: JobData>: Send + Sync + 'static {
    /// Run one attempt. The returned value is stored as the job result.
    async fn process(&self, job: &Job<D>) -> eyre::Result<Value>;

    /// Processor name for logging and metrics
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[async_trait]
impl<D: JobData, P: JobProcessor<D>> JobProcessor<D> for Arc<P> {
    async fn process(&self, job: &Job<D>) -> eyre::Result<Value> {
        (**self).process(job).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Shared by the claim loop and every job task.
struct Executor<D, P> {
    queue: String,
    worker_id: String,
    broker: Arc<dyn Broker>,
    processor: Arc<P>,
    events: broadcast::Sender<WorkerEvent>,
    metrics: WorkerMetrics,
    config: WorkerConfig,
    in_flight: AtomicUsize,
    _payload: PhantomData<fn() -> D>,
}

/// Worker bound to one queue and one dedicated connection.
pub struct Worker<D, P> {
    connection: Connection,
    executor: Arc<Executor<D, P>>,
    semaphore: Arc<Semaphore>,
}

impl<D, P> Worker<D, P>
where
    D: JobData,
    P: JobProcessor<D>,
{
    pub fn new(
        queue: impl Into<String>,
        connection: Connection,
        processor: P,
        config: WorkerConfig,
    ) -> Result<Self, QueueError> {
        Self::with_arc_processor(queue, connection, Arc::new(processor), config)
    }

    /// Create a worker sharing a processor with other workers.
    pub fn with_arc_processor(
        queue: impl Into<String>,
        connection: Connection,
        processor: Arc<P>,
        config: WorkerConfig,
    ) -> Result<Self, QueueError> {
        if connection.kind() != ConnectionKind::Dedicated {
            return Err(QueueError::Config(format!(
                "worker needs a dedicated connection, got {} connection '{}'",
                connection.kind(),
                connection.name()
            )));
        }

        let queue = queue.into();
        let (events, _) = broadcast::channel(config.event_capacity);
        let executor = Executor {
            metrics: WorkerMetrics::new(&queue, &config.worker_id),
            worker_id: config.worker_id.clone(),
            queue,
            broker: connection.broker().clone(),
            processor,
            events,
            in_flight: AtomicUsize::new(0),
            config,
            _payload: PhantomData,
        };

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(executor.config.concurrency)),
            executor: Arc::new(executor),
            connection,
        })
    }

    /// Subscribe to this worker's events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.executor.events.subscribe()
    }

    pub fn queue(&self) -> &str {
        &self.executor.queue
    }

    pub fn worker_id(&self) -> &str {
        &self.executor.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.executor.config
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Jobs currently running.
    pub fn in_flight(&self) -> usize {
        self.executor.in_flight.load(Ordering::SeqCst)
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped), then
    /// wait for every in-flight job to reach its next state.
    ///
    /// A claim already waiting on the broker is never abandoned, so stopping
    /// can take up to `block_timeout`. Returns an error only if the
    /// connection was closed underneath the worker.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        let executor = &self.executor;
        info!(
            queue = %executor.queue,
            worker_id = %executor.worker_id,
            processor = %executor.processor.name(),
            concurrency = executor.config.concurrency,
            block_timeout_ms = executor.config.block_timeout.as_millis() as u64,
            "Starting worker"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut consecutive_errors: u32 = 0;
        let mut outcome = Ok(());

        loop {
            if *shutdown.borrow() {
                info!(queue = %executor.queue, "Received shutdown signal, stopping worker");
                break;
            }
            reap_finished(&mut tasks);

            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        outcome = Err(QueueError::Internal("worker semaphore closed".into()));
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match executor
                .broker
                .claim(&executor.queue, executor.config.block_timeout)
                .await
            {
                Ok(Some(record)) => {
                    if consecutive_errors > 0 {
                        info!(
                            queue = %executor.queue,
                            consecutive_errors,
                            "Broker recovered"
                        );
                        consecutive_errors = 0;
                    }
                    let executor = Arc::clone(executor);
                    tasks.spawn(async move { executor.execute(record, permit).await });
                }
                Ok(None) => {
                    debug!(queue = %executor.queue, "Claim timed out, no jobs");
                    consecutive_errors = 0;
                }
                Err(QueueError::ConnectionClosed(name)) => {
                    error!(
                        queue = %executor.queue,
                        connection = %name,
                        "Connection closed, stopping worker"
                    );
                    outcome = Err(QueueError::ConnectionClosed(name));
                    break;
                }
                Err(e) => {
                    drop(permit);
                    consecutive_errors += 1;
                    let backoff = executor.config.error_backoff(consecutive_errors);
                    executor.broker_error(&e);
                    if e.is_transient() {
                        warn!(
                            queue = %executor.queue,
                            error = %e,
                            consecutive_errors,
                            backoff_ms = backoff.as_millis() as u64,
                            "Broker error while claiming, backing off"
                        );
                    } else {
                        error!(
                            queue = %executor.queue,
                            error = %e,
                            consecutive_errors,
                            backoff_ms = backoff.as_millis() as u64,
                            "Unexpected error while claiming, backing off"
                        );
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        if !tasks.is_empty() {
            info!(queue = %executor.queue, in_flight = tasks.len(), "Waiting for in-flight jobs");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(queue = %executor.queue, error = %e, "Job task aborted");
            }
        }

        info!(queue = %executor.queue, worker_id = %executor.worker_id, "Worker stopped");
        outcome
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.try_join_next() {
        if let Err(e) = joined {
            error!(error = %e, "Job task aborted");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl<D, P> Executor<D, P>
where
    D: JobData,
    P: JobProcessor<D>,
{
    /// Run one claimed job to its next state.
    async fn execute(self: Arc<Self>, record: JobRecord, _permit: OwnedSemaphorePermit) {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.in_flight(running);
        self.metrics.job_received();
        self.emit(WorkerEvent::Active {
            queue: self.queue.clone(),
            job_id: record.id.clone(),
            attempt: record.attempts_made,
        });
        debug!(
            queue = %self.queue,
            job_id = %record.id,
            job = %record.name,
            attempt = record.attempts_made,
            "Processing job"
        );

        let started = Instant::now();
        match self.attempt(&record).await {
            Ok(result) => self.complete(&record, result, started.elapsed()).await,
            Err(reason) => self.fail_attempt(&record, reason).await,
        }

        let running = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        self.metrics.in_flight(running);
    }

    /// Re-validate the payload and run the processor, folding every kind of
    /// failure into a reason string.
    async fn attempt(&self, record: &JobRecord) -> Result<Value, String> {
        let data: D = validate_value(&record.data).map_err(|e| format!("invalid payload: {e}"))?;
        let job = Job::new(record, data, self.broker.clone(), self.events.clone());

        match AssertUnwindSafe(self.processor.process(&job))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(report)) => Err(format!("{report:#}")),
            Err(panic) => Err(format!("processor panicked: {}", panic_message(panic.as_ref()))),
        }
    }

    async fn complete(&self, record: &JobRecord, result: Value, elapsed: Duration) {
        let keep = record.options.retain_on_complete;
        let stored = self
            .persist("complete", &record.id, || {
                self.broker.complete(&self.queue, &record.id, &result, keep)
            })
            .await;
        if stored.is_err() {
            return;
        }

        self.metrics.job_completed(elapsed);
        info!(
            queue = %self.queue,
            job_id = %record.id,
            job = %record.name,
            attempt = record.attempts_made,
            duration_ms = elapsed.as_millis() as u64,
            "Job completed"
        );
        self.emit(WorkerEvent::Completed {
            queue: self.queue.clone(),
            job_id: record.id.clone(),
            result,
            duration_ms: elapsed.as_millis() as u64,
        });
    }

    async fn fail_attempt(&self, record: &JobRecord, reason: String) {
        match AttemptOutcome::after_failure(record.attempts_made, &record.options) {
            AttemptOutcome::Retry { delay } => {
                let stored = self
                    .persist("retry", &record.id, || {
                        self.broker
                            .retry_later(&self.queue, &record.id, &reason, delay)
                    })
                    .await;
                if stored.is_err() {
                    return;
                }

                self.metrics.job_retried();
                warn!(
                    queue = %self.queue,
                    job_id = %record.id,
                    job = %record.name,
                    attempt = record.attempts_made,
                    max_attempts = record.options.attempts,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Job attempt failed, retrying"
                );
                self.emit(WorkerEvent::Retrying {
                    queue: self.queue.clone(),
                    job_id: record.id.clone(),
                    attempt: record.attempts_made,
                    delay_ms: delay.as_millis() as u64,
                    reason,
                });
            }
            AttemptOutcome::Exhausted => {
                let keep = record.options.retain_on_fail;
                let stored = self
                    .persist("fail", &record.id, || {
                        self.broker.fail(&self.queue, &record.id, &reason, keep)
                    })
                    .await;
                if stored.is_err() {
                    return;
                }

                self.metrics.job_failed();
                error!(
                    queue = %self.queue,
                    job_id = %record.id,
                    job = %record.name,
                    attempts_made = record.attempts_made,
                    reason = %reason,
                    "Job failed, attempts exhausted"
                );
                self.emit(WorkerEvent::Failed {
                    queue: self.queue.clone(),
                    job_id: record.id.clone(),
                    attempts_made: record.attempts_made,
                    reason,
                });
            }
        }
    }

    /// Write a job outcome, retrying transient broker errors with the capped
    /// error backoff until the write lands.
    ///
    /// A claimed job has no other owner, so giving up on a transient error
    /// would leave it in `active` for good. Only errors that retrying cannot
    /// fix (closed connection, job no longer active) end the loop.
    async fn persist<F, Fut>(&self, action: &str, job_id: &str, write: F) -> Result<(), ()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), QueueError>>,
    {
        let mut failures: u32 = 0;
        loop {
            match write().await {
                Ok(()) => {
                    if failures > 0 {
                        info!(
                            queue = %self.queue,
                            job_id = %job_id,
                            action,
                            failures,
                            "Stored job outcome after broker recovered"
                        );
                    }
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    failures = failures.saturating_add(1);
                    let backoff = self.config.error_backoff(failures);
                    warn!(
                        queue = %self.queue,
                        job_id = %job_id,
                        action,
                        error = %e,
                        failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "Failed to store job outcome, retrying"
                    );
                    self.broker_error(&e);
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    error!(
                        queue = %self.queue,
                        job_id = %job_id,
                        action,
                        error = %e,
                        "Failed to store job outcome"
                    );
                    self.broker_error(&e);
                    return Err(());
                }
            }
        }
    }

    fn broker_error(&self, error: &QueueError) {
        self.metrics.broker_error();
        self.emit(WorkerEvent::Error {
            queue: self.queue.clone(),
            message: error.to_string(),
        });
    }

    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
