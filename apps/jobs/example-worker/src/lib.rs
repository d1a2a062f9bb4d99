//! Example Worker Service
//!
//! Composition root for the `example` queue: builds the connections, the
//! queue, one worker and the admin server, then waits for a shutdown signal.
//!
//! ## Architecture
//!
//! ```text
//! Producers (Queue<ExampleJobData>, shared connection)
//!   ↓ bull:example:wait
//! Worker<ExampleJobData, ExampleProcessor> (dedicated connection)
//!   ↓
//! bull:example:completed / bull:example:failed
//! ```
//!
//! ## Endpoints (`ADMIN_PORT`, default 8082)
//!
//! - Liveness: `/health`, `/healthz`
//! - Readiness: `/ready`, `/readyz`
//! - Prometheus metrics: `/metrics`
//! - Queue inspection: `/admin/queues/*` (Basic auth)

use async_trait::async_trait;
use chrono::Utc;
use core_config::redis::RedisConfig;
use core_config::server::ServerConfig;
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr, eyre};
use job_queue::{
    AdminSettings, AdminState, Connection, ConnectionFactory, Job, JobProcessor, Queue,
    QueueError, QueueRegistry, QueueSettings, ShutdownCoordinator, Worker, WorkerEvent,
    admin_router, init_metrics, shutdown_signal,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use validator::Validate;

pub const EXAMPLE_QUEUE: &str = "example";

/// Payload of jobs on the `example` queue.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ExampleJobData {
    pub message: String,
}

pub struct ExampleProcessor;

#[async_trait]
impl JobProcessor<ExampleJobData> for ExampleProcessor {
    async fn process(&self, job: &Job<ExampleJobData>) -> eyre::Result<Value> {
        job.report_progress(10).await?;

        info!(job_id = %job.id, message = %job.data.message, "Processing example job");

        job.report_progress(100).await?;

        Ok(json!({
            "processed": true,
            "timestamp": Utc::now().timestamp_millis(),
        }))
    }

    fn name(&self) -> &'static str {
        "example"
    }
}

/// The `example` queue on the shared connection.
pub fn example_queue(
    producer: Connection,
    settings: &QueueSettings,
) -> Result<Queue<ExampleJobData>, QueueError> {
    Queue::from_settings(EXAMPLE_QUEUE, producer, settings)
}

/// Log terminal outcomes and broker errors until the worker goes away.
fn log_events(mut events: broadcast::Receiver<WorkerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::Completed {
                    job_id,
                    result,
                    duration_ms,
                    ..
                }) => {
                    info!(job_id = %job_id, result = %result, duration_ms, "Job completed");
                }
                Ok(WorkerEvent::Failed { job_id, reason, .. }) => {
                    error!(job_id = %job_id, reason = %reason, "Job failed");
                }
                Ok(WorkerEvent::Error { message, .. }) => {
                    error!(error = %message, "Example worker error");
                }
                Ok(event) => debug!(?event, "Worker event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Serve the admin router until shutdown starts.
async fn start_admin_server(
    state: AdminState,
    config: ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind admin server to {addr}"))?;

    info!(address = %addr, "Admin server listening");

    axum::serve(listener, admin_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stopping| *stopping).await;
        })
        .await
        .wrap_err("Admin server failed")?;

    Ok(())
}

/// Run the example worker service
///
/// 1. Sets up error reports, logging and metrics
/// 2. Loads and validates all configuration
/// 3. Opens the shared connection and one dedicated worker connection
/// 4. Runs the worker and the admin server until SIGINT/SIGTERM
/// 5. Drains the worker and closes every connection
///
/// # Errors
///
/// Returns an error if configuration is invalid, Redis is unreachable at
/// startup, or shutdown could not close everything cleanly.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    init_metrics();

    let app_name = env!("CARGO_PKG_NAME");
    let app_version = env!("CARGO_PKG_VERSION");
    info!(
        name = %app_name,
        version = %app_version,
        environment = ?environment,
        "Starting example worker service"
    );

    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;
    let settings = QueueSettings::from_env().wrap_err("Failed to load queue configuration")?;
    let admin_settings = AdminSettings::from_env().wrap_err("Failed to load admin configuration")?;
    let server_config = ServerConfig::from_env().wrap_err("Failed to load server configuration")?;
    if admin_settings.credentials.is_none() {
        warn!("ADMIN_USERNAME/ADMIN_PASSWORD not set, /admin endpoints will reject every request");
    }

    let factory = ConnectionFactory::redis_with_prefix(&redis_config, &settings.prefix)?;
    let producer = factory
        .shared()
        .await
        .wrap_err("Failed to connect to Redis")?;

    let queue = example_queue(producer.clone(), &settings)?;
    let registry = QueueRegistry::new().with_queue(Arc::new(queue))?;

    let mut coordinator = ShutdownCoordinator::new();
    coordinator.set_producer(producer.clone());

    let worker_config = settings.worker_config();
    info!(
        queue = EXAMPLE_QUEUE,
        worker_id = %worker_config.worker_id,
        concurrency = worker_config.concurrency,
        block_timeout_ms = worker_config.block_timeout.as_millis() as u64,
        "Worker configuration loaded"
    );
    let connection = factory
        .dedicated(&worker_config.worker_id)
        .await
        .wrap_err("Failed to open worker connection")?;
    let worker = Worker::new(EXAMPLE_QUEUE, connection, ExampleProcessor, worker_config)?;
    let event_logger = log_events(worker.subscribe());
    coordinator.spawn_worker(worker);

    let admin_state = AdminState::new(registry, producer, admin_settings, app_name, app_version);
    let server = tokio::spawn(start_admin_server(
        admin_state,
        server_config,
        coordinator.subscribe(),
    ));

    shutdown_signal()
        .await
        .wrap_err("Failed to listen for shutdown signals")?;

    let report = coordinator.shutdown().await;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Admin server stopped with error"),
        Err(e) => error!(error = %e, "Admin server task failed"),
    }
    let _ = event_logger.await;

    if !report.is_clean() {
        return Err(eyre!(
            "Shutdown finished with errors: {}",
            report.failures().join("; ")
        ));
    }

    info!("Example worker service stopped");
    Ok(())
}
