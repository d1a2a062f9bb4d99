//! Job Queue
//!
//! A Redis-backed background job queue with typed payloads, retries with
//! backoff, delayed jobs and bounded retention of finished jobs. Keys follow
//! the `bull:{queue}:*` layout.
//!
//! ## Features
//!
//! - **Typed queues**: `Queue<D>` validates payloads before they reach Redis
//! - **Workers**: `Worker<D, P>` with bounded concurrency and graceful drain
//! - **Retries**: fixed or exponential backoff, then `failed`
//! - **Atomic transitions**: every state change is a single Lua script
//! - **Admin endpoints**: counts and job inspection behind Basic auth
//! - **Prometheus metrics**
//!
//! ## Example
//!
//! ```ignore
//! use job_queue::{ConnectionFactory, JobOptions, JobProcessor, Queue, Worker, WorkerConfig};
//!
//! #[derive(Clone, Serialize, Deserialize, Validate)]
//! struct Email {
//!     #[validate(email)]
//!     to: String,
//! }
//!
//! let factory = ConnectionFactory::redis(&redis_config)?;
//! let queue = Queue::<Email>::new("emails", factory.shared().await?, JobOptions::default())?;
//! queue.enqueue("welcome", &Email { to: "a@example.com".into() }, None).await?;
//!
//! let connection = factory.dedicated("emails-1").await?;
//! let worker = Worker::new("emails", connection, processor, WorkerConfig::new())?;
//! worker.run(shutdown_rx).await?;
//! ```

pub mod admin;
pub mod broker;
mod config;
mod connection;
mod error;
mod events;
mod job;
pub mod metrics;
mod options;
mod queue;
mod registry;
mod schema;
mod shutdown;
mod state;
mod worker;

// Re-export main types
pub use admin::{AdminState, router as admin_router};
pub use broker::{Broker, DEFAULT_PREFIX};
pub use config::{AdminCredentials, AdminSettings, QueueSettings, WorkerConfig};
pub use connection::{
    CloseOutcome, Connection, ConnectionFactory, ConnectionKind, Connector, MemoryConnector,
    RedisConnector, close_all,
};
pub use error::QueueError;
pub use events::WorkerEvent;
pub use job::{Job, JobCounts, JobHandle, JobRecord, NewJob};
pub use metrics::{WorkerMetrics, init_metrics};
pub use options::{Backoff, BackoffKind, JobOptions, JobOptionsOverride};
pub use queue::Queue;
pub use registry::{QueueInspector, QueueRegistry};
pub use schema::{JobData, to_validated_value, validate_value};
pub use shutdown::{ShutdownCoordinator, ShutdownReport, WorkerStop, shutdown_signal};
pub use state::{AttemptOutcome, JobState};
pub use worker::{JobProcessor, Worker};
