//! Prometheus metrics for queues and workers.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls are no-ops. If another
/// recorder is already installed, metrics are still recorded there and
/// `/metrics` renders empty.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_try_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .inspect(|_| info!("Prometheus metrics initialized"))
            .inspect_err(|e| warn!(error = %e, "Failed to install Prometheus recorder"))
    });
}

fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format, `None` before `init_metrics`.
pub fn render_metrics() -> Option<String> {
    prometheus_handle().map(|h| h.render())
}

/// Record an enqueue on the producer side.
pub fn job_enqueued(queue: &str, delayed: bool) {
    counter!(
        "job_queue_jobs_enqueued_total",
        "queue" => queue.to_string(),
        "delayed" => delayed.to_string()
    )
    .increment(1);
}

/// Per-worker metrics helper
#[derive(Clone)]
pub struct WorkerMetrics {
    queue: String,
    worker: String,
}

impl WorkerMetrics {
    pub fn new(queue: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            worker: worker.into(),
        }
    }

    pub fn job_received(&self) {
        counter!(
            "job_queue_jobs_received_total",
            "queue" => self.queue.clone(),
            "worker" => self.worker.clone()
        )
        .increment(1);
    }

    pub fn job_completed(&self, duration: Duration) {
        counter!(
            "job_queue_jobs_processed_total",
            "queue" => self.queue.clone(),
            "worker" => self.worker.clone(),
            "status" => "completed"
        )
        .increment(1);

        histogram!(
            "job_queue_job_duration_seconds",
            "queue" => self.queue.clone(),
            "worker" => self.worker.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn job_retried(&self) {
        counter!(
            "job_queue_jobs_retried_total",
            "queue" => self.queue.clone(),
            "worker" => self.worker.clone()
        )
        .increment(1);
    }

    /// Attempts exhausted
    pub fn job_failed(&self) {
        counter!(
            "job_queue_jobs_processed_total",
            "queue" => self.queue.clone(),
            "worker" => self.worker.clone(),
            "status" => "failed"
        )
        .increment(1);
    }

    pub fn broker_error(&self) {
        counter!(
            "job_queue_broker_errors_total",
            "queue" => self.queue.clone(),
            "worker" => self.worker.clone()
        )
        .increment(1);
    }

    pub fn in_flight(&self, count: usize) {
        gauge!(
            "job_queue_jobs_in_flight",
            "queue" => self.queue.clone(),
            "worker" => self.worker.clone()
        )
        .set(count as f64);
    }
}
