//! Queue error types
//!
//! Broker errors are split into transient failures (the worker loop backs off
//! and retries) and everything else. Processor failures never surface here;
//! they are folded into the job's retry policy.

use crate::state::JobState;
use core_config::ConfigError;
use thiserror::Error;

/// Job queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis command or script error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Initial connection to the broker could not be established
    #[error("Failed to connect '{name}': {source}")]
    Connect {
        name: String,
        #[source]
        source: redis::RedisError,
    },

    /// The connection was closed by the shutdown sequence
    #[error("Connection '{0}' is closed")]
    ConnectionClosed(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Payload rejected by the queue's schema
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Job options rejected (for example `attempts = 0`)
    #[error("Invalid job options: {0}")]
    InvalidOptions(String),

    /// No record for this id in the queue
    #[error("Job {id} not found in queue '{queue}'")]
    JobNotFound { queue: String, id: String },

    /// State machine violation
    #[error("Invalid job transition: {from:?} -> {to}")]
    InvalidTransition {
        from: Option<JobState>,
        to: JobState,
    },

    /// A queue with this name is already registered
    #[error("Queue '{0}' is already registered")]
    DuplicateQueue(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    pub fn not_found(queue: impl Into<String>, id: impl Into<String>) -> Self {
        QueueError::JobNotFound {
            queue: queue.into(),
            id: id.into(),
        }
    }

    /// Broker failures the worker loop should survive by backing off.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Redis(e) => {
                e.is_timeout()
                    || e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
            }
            QueueError::Connect { .. } => true,
            _ => false,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            QueueError::Validation(_) | QueueError::InvalidOptions(_)
        )
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

impl From<validator::ValidationErrors> for QueueError {
    fn from(err: validator::ValidationErrors) -> Self {
        QueueError::Validation(err.to_string())
    }
}

impl From<ConfigError> for QueueError {
    fn from(err: ConfigError) -> Self {
        QueueError::Config(err.to_string())
    }
}
