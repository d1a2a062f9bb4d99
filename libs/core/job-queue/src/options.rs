//! Per-job retry and retention policy.

use crate::error::QueueError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};
use validator::Validate;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay before every retry.
    Fixed,
    /// `delay * 2^(attempts_made - 1)`.
    Exponential,
}

/// Backoff policy applied after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds
    pub delay_ms: u64,
}

impl Backoff {
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay_ms,
        }
    }

    pub fn exponential(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms,
        }
    }

    /// Delay before the next attempt, given how many attempts have been made.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let ms = match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1).min(63);
                self.delay_ms.saturating_mul(1u64 << exponent)
            }
        };
        Duration::from_millis(ms)
    }
}

/// Fully resolved options stored with every job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct JobOptions {
    /// Total attempts including the first one
    #[validate(range(min = 1, message = "attempts must be at least 1"))]
    pub attempts: u32,
    pub backoff: Backoff,
    /// Completed jobs kept per queue, most recently finished first
    pub retain_on_complete: u64,
    /// Failed jobs kept per queue, most recently finished first
    pub retain_on_fail: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::exponential(1000),
            retain_on_complete: 100,
            retain_on_fail: 500,
        }
    }
}

impl JobOptions {
    /// Apply the fields set in `overrides`, keeping `self` for the rest.
    pub fn merge(&self, overrides: &JobOptionsOverride) -> Self {
        Self {
            attempts: overrides.attempts.unwrap_or(self.attempts),
            backoff: overrides.backoff.unwrap_or(self.backoff),
            retain_on_complete: overrides
                .retain_on_complete
                .unwrap_or(self.retain_on_complete),
            retain_on_fail: overrides.retain_on_fail.unwrap_or(self.retain_on_fail),
        }
    }

    pub fn check(&self) -> Result<(), QueueError> {
        self.validate()
            .map_err(|e| QueueError::InvalidOptions(e.to_string()))
    }
}

/// Caller-supplied options; unset fields fall back to the queue defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptionsOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retain_on_complete: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retain_on_fail: Option<u64>,
}

impl JobOptionsOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_retain_on_complete(mut self, count: u64) -> Self {
        self.retain_on_complete = Some(count);
        self
    }

    pub fn with_retain_on_fail(mut self, count: u64) -> Self {
        self.retain_on_fail = Some(count);
        self
    }
}
