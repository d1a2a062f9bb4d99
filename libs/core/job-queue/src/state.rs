//! Job lifecycle.
//!
//! ```text
//! (enqueue) -> waiting -> active -> completed
//!                 ^          |----> failed
//! (enqueue) -> delayed <-----'  (retry with backoff)
//! ```
//!
//! `completed` and `failed` are terminal. A failed attempt moves the job to
//! `delayed` while attempts remain, and the broker promotes it back to
//! `waiting` once its backoff has elapsed.

use crate::error::QueueError;
use crate::options::JobOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// States a job may be created in.
    pub fn is_initial(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Delayed)
    }

    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Waiting, Active)
                | (Active, Completed)
                | (Active, Delayed)
                | (Active, Failed)
                | (Delayed, Waiting)
        )
    }

    /// Validate a move from `from` (`None` for a new job) to `to`.
    pub fn transition(from: Option<JobState>, to: JobState) -> Result<JobState, QueueError> {
        let allowed = match from {
            None => to.is_initial(),
            Some(current) => current.can_transition_to(to),
        };
        if allowed {
            Ok(to)
        } else {
            Err(QueueError::InvalidTransition { from, to })
        }
    }
}

/// What happens to a job after an attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Attempts remain; run again after `delay`.
    Retry { delay: Duration },
    /// All attempts used; the job is failed for good.
    Exhausted,
}

impl AttemptOutcome {
    pub fn after_failure(attempts_made: u32, options: &JobOptions) -> Self {
        if attempts_made < options.attempts {
            AttemptOutcome::Retry {
                delay: options.backoff.delay_for(attempts_made),
            }
        } else {
            AttemptOutcome::Exhausted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{Backoff, JobOptions};

    #[test]
    fn test_lifecycle_edges() {
        assert!(JobState::Waiting.can_transition_to(JobState::Active));
        assert!(JobState::Active.can_transition_to(JobState::Completed));
        assert!(JobState::Active.can_transition_to(JobState::Delayed));
        assert!(JobState::Active.can_transition_to(JobState::Failed));
        assert!(JobState::Delayed.can_transition_to(JobState::Waiting));

        assert!(!JobState::Waiting.can_transition_to(JobState::Completed));
        assert!(!JobState::Delayed.can_transition_to(JobState::Active));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for terminal in [JobState::Completed, JobState::Failed] {
            assert!(terminal.is_terminal());
            for to in JobState::all() {
                assert!(!terminal.can_transition_to(to), "{terminal} -> {to}");
            }
        }
    }

    #[test]
    fn test_creation_states() {
        assert_eq!(JobState::transition(None, JobState::Waiting).unwrap(), JobState::Waiting);
        assert_eq!(JobState::transition(None, JobState::Delayed).unwrap(), JobState::Delayed);
        assert!(JobState::transition(None, JobState::Active).is_err());
        assert!(JobState::transition(Some(JobState::Failed), JobState::Waiting).is_err());
    }

    #[test]
    fn test_after_failure_retries_until_exhausted() {
        let options = JobOptions::default();
        assert_eq!(
            AttemptOutcome::after_failure(1, &options),
            AttemptOutcome::Retry {
                delay: Duration::from_millis(1000)
            }
        );
        assert_eq!(
            AttemptOutcome::after_failure(2, &options),
            AttemptOutcome::Retry {
                delay: Duration::from_millis(2000)
            }
        );
        assert_eq!(AttemptOutcome::after_failure(3, &options), AttemptOutcome::Exhausted);
    }

    #[test]
    fn test_single_attempt_goes_straight_to_failed() {
        let options = JobOptions {
            attempts: 1,
            backoff: Backoff::fixed(10),
            ..JobOptions::default()
        };
        let outcome = AttemptOutcome::after_failure(1, &options);
        assert_eq!(outcome, AttemptOutcome::Exhausted);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(JobState::Waiting.to_string(), "waiting");
        assert_eq!("delayed".parse::<JobState>().unwrap(), JobState::Delayed);
    }
}
