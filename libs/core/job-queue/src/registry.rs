//! Registered queues, as seen by the admin endpoints.

use crate::error::QueueError;
use crate::job::{JobCounts, JobRecord};
use crate::state::JobState;
use async_trait::async_trait;
use std::sync::Arc;

/// Read-only, payload-agnostic view of a queue.
#[async_trait]
pub trait QueueInspector: Send + Sync {
    fn name(&self) -> &str;

    async fn counts(&self) -> Result<JobCounts, QueueError>;

    async fn jobs(
        &self,
        state: JobState,
        start: usize,
        end: usize,
    ) -> Result<Vec<JobRecord>, QueueError>;

    async fn job(&self, id: &str) -> Result<Option<JobRecord>, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}

/// Queues in registration order. Names are unique.
#[derive(Clone, Default)]
pub struct QueueRegistry {
    queues: Vec<Arc<dyn QueueInspector>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, queue: Arc<dyn QueueInspector>) -> Result<(), QueueError> {
        if self.get(queue.name()).is_some() {
            return Err(QueueError::DuplicateQueue(queue.name().to_string()));
        }
        self.queues.push(queue);
        Ok(())
    }

    /// Builder form of [`QueueRegistry::register`].
    pub fn with_queue(mut self, queue: Arc<dyn QueueInspector>) -> Result<Self, QueueError> {
        self.register(queue)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn QueueInspector>> {
        self.queues.iter().find(|queue| queue.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.queues.iter().map(|queue| queue.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn QueueInspector>> {
        self.queues.iter()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionFactory;
    use crate::options::JobOptions;
    use crate::queue::Queue;
    use serde::{Deserialize, Serialize};
    use validator::Validate;

    #[derive(Debug, Clone, Serialize, Deserialize, Validate)]
    struct Payload {
        value: u32,
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let connection = ConnectionFactory::memory().shared().await.unwrap();
        let first =
            Queue::<Payload>::new("reports", connection.clone(), JobOptions::default()).unwrap();
        let second =
            Queue::<Payload>::new("reports", connection.clone(), JobOptions::default()).unwrap();
        let other = Queue::<Payload>::new("exports", connection, JobOptions::default()).unwrap();

        let mut registry = QueueRegistry::new();
        registry.register(Arc::new(first)).unwrap();
        let err = registry.register(Arc::new(second)).unwrap_err();
        assert!(matches!(err, QueueError::DuplicateQueue(ref name) if name == "reports"));

        registry.register(Arc::new(other)).unwrap();
        assert_eq!(registry.names(), ["reports", "exports"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.get("exports").is_some());
        assert!(registry.get("missing").is_none());
    }
}
