//! Graceful shutdown.
//!
//! Order matters: workers stop claiming and drain their in-flight jobs
//! first, then their dedicated connections are closed, and the shared
//! producer connection goes last so enqueues from running jobs still work.

use crate::connection::{CloseOutcome, Connection, close_all};
use crate::error::QueueError;
use crate::schema::JobData;
use crate::worker::{JobProcessor, Worker};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

struct RunningWorker {
    name: String,
    connection: Connection,
    task: JoinHandle<Result<(), QueueError>>,
}

/// How one worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStop {
    pub name: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub workers: Vec<WorkerStop>,
    pub connections: Vec<CloseOutcome>,
}

impl ShutdownReport {
    /// Every worker stopped cleanly and every connection closed.
    pub fn is_clean(&self) -> bool {
        self.workers.iter().all(|w| w.error.is_none())
            && self.connections.iter().all(CloseOutcome::is_ok)
    }

    /// Human-readable list of everything that went wrong.
    pub fn failures(&self) -> Vec<String> {
        let workers = self.workers.iter().filter_map(|w| {
            w.error
                .as_ref()
                .map(|e| format!("worker '{}': {}", w.name, e))
        });
        let connections = self.connections.iter().filter_map(|c| {
            c.error
                .as_ref()
                .map(|e| format!("connection '{}': {}", c.name, e))
        });
        workers.chain(connections).collect()
    }
}

/// Owns the running workers and the connections to close on shutdown.
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
    workers: Vec<RunningWorker>,
    producer: Option<Connection>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            workers: Vec::new(),
            producer: None,
        }
    }

    /// Receiver that flips to `true` when shutdown starts.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    /// Register the shared connection, closed after every worker.
    pub fn set_producer(&mut self, connection: Connection) {
        self.producer = Some(connection);
    }

    /// Spawn `worker` on the runtime. Its connection is closed on shutdown.
    pub fn spawn_worker<D, P>(&mut self, worker: Worker<D, P>)
    where
        D: JobData,
        P: JobProcessor<D>,
    {
        let name = worker.worker_id().to_string();
        let connection = worker.connection().clone();
        let shutdown = self.subscribe();
        let task = tokio::spawn(async move { worker.run(shutdown).await });

        self.workers.push(RunningWorker {
            name,
            connection,
            task,
        });
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal every worker, wait for them, then close all connections.
    ///
    /// Never fails: errors are collected into the report.
    pub async fn shutdown(self) -> ShutdownReport {
        info!(workers = self.workers.len(), "Initiating graceful shutdown");
        self.tx.send_replace(true);

        let mut report = ShutdownReport::default();
        let mut connections = Vec::with_capacity(self.workers.len());

        for worker in self.workers {
            let error = match worker.task.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) if e.is_panic() => Some("worker task panicked".to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(e) = &error {
                error!(worker = %worker.name, error = %e, "Worker stopped with error");
            }
            report.workers.push(WorkerStop {
                name: worker.name,
                error,
            });
            connections.push(worker.connection);
        }

        report.connections = close_all(&connections).await;

        if let Some(producer) = self.producer {
            report
                .connections
                .extend(close_all(std::slice::from_ref(&producer)).await);
        }

        if report.is_clean() {
            info!(
                connections = report.connections.len(),
                "Shutdown complete"
            );
        } else {
            warn!(failures = ?report.failures(), "Shutdown finished with errors");
        }
        report
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        },
    }

    Ok(())
}
