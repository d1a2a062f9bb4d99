//! Property tests for retry accounting.

use async_trait::async_trait;
use job_queue::*;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::watch;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct Flaky {
    /// Attempts that fail before one succeeds
    failures: u32,
}

struct FlakyProcessor;

#[async_trait]
impl JobProcessor<Flaky> for FlakyProcessor {
    async fn process(&self, job: &Job<Flaky>) -> eyre::Result<Value> {
        if job.attempts_made <= job.data.failures {
            eyre::bail!("attempt {} failed", job.attempts_made);
        }
        Ok(json!({ "attempt": job.attempts_made }))
    }
}

/// Run one job to a terminal state and return its record.
fn run_to_end(attempts: u32, backoff: Backoff, failures: u32) -> JobRecord {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap();

    runtime.block_on(async move {
        let factory = ConnectionFactory::memory();
        let queue = Queue::<Flaky>::new(
            "flaky",
            factory.shared().await.unwrap(),
            JobOptions::default(),
        )
        .unwrap();
        let worker = Worker::new(
            "flaky",
            factory.dedicated("flaky-1").await.unwrap(),
            FlakyProcessor,
            WorkerConfig::new().with_block_timeout(Duration::from_millis(100)),
        )
        .unwrap();

        let handle = queue
            .enqueue(
                "try",
                &Flaky { failures },
                Some(
                    JobOptionsOverride::new()
                        .with_attempts(attempts)
                        .with_backoff(backoff),
                ),
            )
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(async move { worker.run(rx).await });

        let record = loop {
            let record = queue.get_job(&handle.id).await.unwrap().unwrap();
            if record.state.is_terminal() {
                break record;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        tx.send(true).unwrap();
        run.await.unwrap().unwrap();
        record
    })
}

fn backoff_strategy() -> impl Strategy<Value = Backoff> {
    prop_oneof![
        (1u64..500).prop_map(Backoff::fixed),
        (1u64..200).prop_map(Backoff::exponential),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn attempts_made_never_exceeds_attempts(
        attempts in 1u32..6,
        failures in 0u32..8,
        backoff in backoff_strategy(),
    ) {
        let record = run_to_end(attempts, backoff, failures);

        prop_assert!(record.attempts_made <= attempts);
        if failures < attempts {
            prop_assert_eq!(record.state, JobState::Completed);
            prop_assert_eq!(record.attempts_made, failures + 1);
            prop_assert!(record.failure_reason.is_none() || failures > 0);
        } else {
            prop_assert_eq!(record.state, JobState::Failed);
            prop_assert_eq!(record.attempts_made, attempts);
        }
    }

    #[test]
    fn retry_only_while_attempts_remain(
        attempts in 1u32..20,
        attempts_made in 1u32..25,
        backoff in backoff_strategy(),
    ) {
        let options = JobOptions { attempts, backoff, ..JobOptions::default() };
        match AttemptOutcome::after_failure(attempts_made, &options) {
            AttemptOutcome::Retry { delay } => {
                prop_assert!(attempts_made < attempts);
                prop_assert_eq!(delay, backoff.delay_for(attempts_made));
            }
            AttemptOutcome::Exhausted => prop_assert!(attempts_made >= attempts),
        }
    }

    #[test]
    fn exponential_delay_never_shrinks(delay_ms in 1u64..10_000, attempt in 1u32..40) {
        let backoff = Backoff::exponential(delay_ms);
        prop_assert!(backoff.delay_for(attempt + 1) >= backoff.delay_for(attempt));
    }
}
