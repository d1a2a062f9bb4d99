//! Worker lifecycle events
//!
//! Workers publish these on a broadcast channel instead of invoking
//! registered callbacks. Subscribers that fall behind miss events; the job
//! state in the broker is always the source of truth.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// A job was claimed and is about to run
    Active {
        queue: String,
        job_id: String,
        attempt: u32,
    },
    /// The processor reported progress
    Progress {
        queue: String,
        job_id: String,
        progress: Value,
    },
    /// The processor succeeded
    Completed {
        queue: String,
        job_id: String,
        result: Value,
        duration_ms: u64,
    },
    /// The attempt failed and the job was scheduled again
    Retrying {
        queue: String,
        job_id: String,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    /// The attempt failed and no attempts remain
    Failed {
        queue: String,
        job_id: String,
        attempts_made: u32,
        reason: String,
    },
    /// Broker error in the worker itself, not tied to a processor outcome
    Error { queue: String, message: String },
}

impl WorkerEvent {
    pub fn queue(&self) -> &str {
        match self {
            WorkerEvent::Active { queue, .. }
            | WorkerEvent::Progress { queue, .. }
            | WorkerEvent::Completed { queue, .. }
            | WorkerEvent::Retrying { queue, .. }
            | WorkerEvent::Failed { queue, .. }
            | WorkerEvent::Error { queue, .. } => queue,
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            WorkerEvent::Active { job_id, .. }
            | WorkerEvent::Progress { job_id, .. }
            | WorkerEvent::Completed { job_id, .. }
            | WorkerEvent::Retrying { job_id, .. }
            | WorkerEvent::Failed { job_id, .. } => Some(job_id),
            WorkerEvent::Error { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_accessors() {
        let event = WorkerEvent::Failed {
            queue: "emails".into(),
            job_id: "3".into(),
            attempts_made: 3,
            reason: "boom".into(),
        };
        assert_eq!(event.queue(), "emails");
        assert_eq!(event.job_id(), Some("3"));

        let error = WorkerEvent::Error {
            queue: "emails".into(),
            message: "connection reset".into(),
        };
        assert_eq!(error.job_id(), None);
    }

    #[test]
    fn test_event_serialization() {
        let event = WorkerEvent::Progress {
            queue: "emails".into(),
            job_id: "1".into(),
            progress: json!(50),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "progress", "queue": "emails", "job_id": "1", "progress": 50})
        );
    }
}
