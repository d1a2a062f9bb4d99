//! Worker, queue and admin configuration.
//!
//! `WorkerConfig` is built in code; `QueueSettings` and `AdminSettings` are
//! read from the environment once at startup.

use crate::broker::DEFAULT_PREFIX;
use crate::options::{Backoff, BackoffKind, JobOptions};
use core_config::{ConfigError, FromEnv, env_optional, env_or_default, env_parse_or};
use std::time::Duration;
use uuid::Uuid;

/// Configuration for a single worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker id, used for logs, metrics and the connection name
    pub worker_id: String,

    /// Maximum jobs running at once
    pub concurrency: usize,

    /// Longest a single claim blocks waiting for work
    pub block_timeout: Duration,

    /// Capacity of the event broadcast channel
    pub event_capacity: usize,

    /// First and last delay of the backoff after broker errors
    pub min_error_backoff: Duration,
    pub max_error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            concurrency: 1,
            block_timeout: Duration::from_secs(5),
            event_capacity: 1024,
            min_error_backoff: Duration::from_secs(1),
            max_error_backoff: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the maximum concurrent jobs (at least 1)
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn with_error_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_error_backoff = min;
        self.max_error_backoff = max.max(min);
        self
    }

    /// Backoff after `consecutive_errors` broker errors in a row.
    pub fn error_backoff(&self, consecutive_errors: u32) -> Duration {
        let exponent = consecutive_errors.saturating_sub(1).min(16);
        self.min_error_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_error_backoff)
    }
}

/// Queue-wide settings.
///
/// | Variable | Default |
/// |---|---|
/// | `QUEUE_PREFIX` | `bull` |
/// | `WORKER_CONCURRENCY` | `5` |
/// | `WORKER_BLOCK_TIMEOUT_MS` | `5000` |
/// | `JOB_ATTEMPTS` | `3` |
/// | `JOB_BACKOFF_TYPE` | `exponential` |
/// | `JOB_BACKOFF_DELAY_MS` | `1000` |
/// | `JOB_RETAIN_ON_COMPLETE` | `100` |
/// | `JOB_RETAIN_ON_FAIL` | `500` |
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub prefix: String,
    pub worker_concurrency: usize,
    pub block_timeout: Duration,
    pub default_options: JobOptions,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            worker_concurrency: 5,
            block_timeout: Duration::from_secs(5),
            default_options: JobOptions::default(),
        }
    }
}

impl QueueSettings {
    /// Worker config carrying these settings.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new()
            .with_concurrency(self.worker_concurrency)
            .with_block_timeout(self.block_timeout)
    }
}

impl FromEnv for QueueSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = QueueSettings::default();
        let default_options = defaults.default_options;

        let prefix = env_or_default("QUEUE_PREFIX", DEFAULT_PREFIX);
        if prefix.trim().is_empty() || prefix.contains(' ') {
            return Err(ConfigError::invalid("QUEUE_PREFIX", "must be a non-empty word"));
        }

        let worker_concurrency: usize =
            env_parse_or("WORKER_CONCURRENCY", defaults.worker_concurrency)?;
        if worker_concurrency == 0 {
            return Err(ConfigError::invalid("WORKER_CONCURRENCY", "must be at least 1"));
        }

        let block_timeout_ms: u64 = env_parse_or(
            "WORKER_BLOCK_TIMEOUT_MS",
            defaults.block_timeout.as_millis() as u64,
        )?;
        if block_timeout_ms == 0 {
            return Err(ConfigError::invalid("WORKER_BLOCK_TIMEOUT_MS", "must be positive"));
        }

        let attempts: u32 = env_parse_or("JOB_ATTEMPTS", default_options.attempts)?;
        if attempts == 0 {
            return Err(ConfigError::invalid("JOB_ATTEMPTS", "must be at least 1"));
        }

        let backoff_kind: BackoffKind =
            env_parse_or("JOB_BACKOFF_TYPE", default_options.backoff.kind)?;
        let backoff_delay: u64 =
            env_parse_or("JOB_BACKOFF_DELAY_MS", default_options.backoff.delay_ms)?;

        Ok(Self {
            prefix,
            worker_concurrency,
            block_timeout: Duration::from_millis(block_timeout_ms),
            default_options: JobOptions {
                attempts,
                backoff: Backoff {
                    kind: backoff_kind,
                    delay_ms: backoff_delay,
                },
                retain_on_complete: env_parse_or(
                    "JOB_RETAIN_ON_COMPLETE",
                    default_options.retain_on_complete,
                )?,
                retain_on_fail: env_parse_or("JOB_RETAIN_ON_FAIL", default_options.retain_on_fail)?,
            },
        })
    }
}

/// Basic auth credentials for the admin endpoints.
#[derive(Clone, PartialEq, Eq)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Admin endpoint settings (`ADMIN_USERNAME`, `ADMIN_PASSWORD`).
///
/// Both or neither must be set. Without credentials every `/admin` request
/// is rejected.
#[derive(Debug, Clone, Default)]
pub struct AdminSettings {
    pub credentials: Option<AdminCredentials>,
}

impl AdminSettings {
    pub fn with_credentials(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Some(AdminCredentials {
                username: username.into(),
                password: password.into(),
            }),
        }
    }
}

impl FromEnv for AdminSettings {
    fn from_env() -> Result<Self, ConfigError> {
        match (env_optional("ADMIN_USERNAME"), env_optional("ADMIN_PASSWORD")) {
            (Some(username), Some(password)) => Ok(Self::with_credentials(username, password)),
            (None, None) => Ok(Self::default()),
            (Some(_), None) => Err(ConfigError::MissingEnvVar("ADMIN_PASSWORD".to_string())),
            (None, Some(_)) => Err(ConfigError::MissingEnvVar("ADMIN_USERNAME".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE_VARS: [&str; 8] = [
        "QUEUE_PREFIX",
        "WORKER_CONCURRENCY",
        "WORKER_BLOCK_TIMEOUT_MS",
        "JOB_ATTEMPTS",
        "JOB_BACKOFF_TYPE",
        "JOB_BACKOFF_DELAY_MS",
        "JOB_RETAIN_ON_COMPLETE",
        "JOB_RETAIN_ON_FAIL",
    ];

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::new()
            .with_worker_id("worker-a")
            .with_concurrency(0)
            .with_block_timeout(Duration::from_millis(250));
        assert_eq!(config.worker_id, "worker-a");
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.block_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_error_backoff_is_capped() {
        let config = WorkerConfig::new();
        assert_eq!(config.error_backoff(1), Duration::from_secs(1));
        assert_eq!(config.error_backoff(2), Duration::from_secs(2));
        assert_eq!(config.error_backoff(5), Duration::from_secs(16));
        assert_eq!(config.error_backoff(6), Duration::from_secs(30));
        assert_eq!(config.error_backoff(100), Duration::from_secs(30));
    }

    #[test]
    fn test_queue_settings_defaults() {
        temp_env::with_vars_unset(QUEUE_VARS, || {
            let settings = QueueSettings::from_env().unwrap();
            assert_eq!(settings.prefix, "bull");
            assert_eq!(settings.worker_concurrency, 5);
            assert_eq!(settings.block_timeout, Duration::from_secs(5));
            assert_eq!(settings.default_options, JobOptions::default());
        });
    }

    #[test]
    fn test_queue_settings_overrides() {
        temp_env::with_vars(
            [
                ("QUEUE_PREFIX", Some("jobs")),
                ("WORKER_CONCURRENCY", Some("8")),
                ("JOB_ATTEMPTS", Some("5")),
                ("JOB_BACKOFF_TYPE", Some("fixed")),
                ("JOB_BACKOFF_DELAY_MS", Some("250")),
                ("JOB_RETAIN_ON_COMPLETE", Some("10")),
            ],
            || {
                let settings = QueueSettings::from_env().unwrap();
                assert_eq!(settings.prefix, "jobs");
                assert_eq!(settings.worker_config().concurrency, 8);
                assert_eq!(settings.default_options.attempts, 5);
                assert_eq!(settings.default_options.backoff, Backoff::fixed(250));
                assert_eq!(settings.default_options.retain_on_complete, 10);
                assert_eq!(settings.default_options.retain_on_fail, 500);
            },
        );
    }

    #[test]
    fn test_queue_settings_rejects_invalid_values() {
        temp_env::with_var("JOB_ATTEMPTS", Some("0"), || {
            let err = QueueSettings::from_env().unwrap_err();
            assert!(err.to_string().contains("JOB_ATTEMPTS"));
        });
        temp_env::with_var("JOB_BACKOFF_TYPE", Some("linear"), || {
            let err = QueueSettings::from_env().unwrap_err();
            assert!(err.to_string().contains("JOB_BACKOFF_TYPE"));
        });
        temp_env::with_var("WORKER_CONCURRENCY", Some("0"), || {
            assert!(QueueSettings::from_env().is_err());
        });
    }

    #[test]
    fn test_admin_settings() {
        temp_env::with_vars(
            [("ADMIN_USERNAME", Some("ops")), ("ADMIN_PASSWORD", Some("pw"))],
            || {
                let settings = AdminSettings::from_env().unwrap();
                let credentials = settings.credentials.unwrap();
                assert_eq!(credentials.username, "ops");
                assert!(!format!("{credentials:?}").contains("pw"));
            },
        );
        temp_env::with_vars_unset(["ADMIN_USERNAME", "ADMIN_PASSWORD"], || {
            assert!(AdminSettings::from_env().unwrap().credentials.is_none());
        });
        temp_env::with_vars(
            [("ADMIN_USERNAME", Some("ops")), ("ADMIN_PASSWORD", None)],
            || {
                let err = AdminSettings::from_env().unwrap_err();
                assert!(err.to_string().contains("ADMIN_PASSWORD"));
            },
        );
    }
}
