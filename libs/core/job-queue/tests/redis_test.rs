//! Redis integration tests
//!
//! These use a real Redis via testcontainers and need Docker:
//! `cargo test -p job-queue -- --ignored`

use async_trait::async_trait;
use core_config::redis::RedisConfig;
use job_queue::broker::QueueKeys;
use job_queue::*;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use test_utils::{TestKeys, TestRedis};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct Thumbnail {
    #[validate(url)]
    source: String,
}

fn thumbnail(i: usize) -> Thumbnail {
    Thumbnail {
        source: format!("https://cdn.example.com/{i}.png"),
    }
}

/// Fails the first `failures` attempts of every job.
struct Resizer {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl JobProcessor<Thumbnail> for Resizer {
    async fn process(&self, job: &Job<Thumbnail>) -> eyre::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        job.report_progress(json!({ "stage": "resizing" })).await?;
        if job.attempts_made <= self.failures {
            eyre::bail!("resize failed on attempt {}", job.attempts_made);
        }
        Ok(json!({ "source": job.data.source, "width": 128 }))
    }
}

async fn factory(redis: &TestRedis, keys: &TestKeys) -> ConnectionFactory {
    ConnectionFactory::redis_with_prefix(&RedisConfig::new(redis.url()), &keys.prefix()).unwrap()
}

async fn wait_for(queue: &Queue<Thumbnail>, check: impl Fn(&JobCounts) -> bool) -> JobCounts {
    for _ in 0..500 {
        let counts = queue.counts().await.unwrap();
        if check(&counts) {
            return counts;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never reached: {:?}", queue.counts().await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_enqueue_uses_bull_key_layout() {
    let redis = TestRedis::new().await;
    let keys = TestKeys::from_test_name("test_enqueue_uses_bull_key_layout");
    let factory = factory(&redis, &keys).await;
    let name = keys.queue("thumbnails");

    let producer = factory.shared().await.unwrap();
    let queue = Queue::<Thumbnail>::new(&name, producer, JobOptions::default()).unwrap();
    let first = queue.enqueue("resize", &thumbnail(1), None).await.unwrap();
    let second = queue.enqueue("resize", &thumbnail(2), None).await.unwrap();
    assert_eq!(first.id, "1");
    assert_eq!(second.id, "2");

    let layout = QueueKeys::new(&keys.prefix(), &name);
    let mut conn = redis.connection().await;
    let waiting: Vec<String> = conn.lrange(layout.wait(), 0, -1).await.unwrap();
    assert_eq!(waiting, vec!["2".to_string(), "1".to_string()]);
    let job_name: String = conn.hget(layout.job("1"), "name").await.unwrap();
    assert_eq!(job_name, "resize");

    let listed = queue.jobs(JobState::Waiting, 0, 10).await.unwrap();
    let ids: Vec<_> = listed.iter().map(|job| job.id.as_str()).collect();
    assert_eq!(ids, ["1", "2"]);
}

#[tokio::test]
#[ignore]
async fn test_worker_retries_then_completes() {
    let redis = TestRedis::new().await;
    let keys = TestKeys::from_test_name("test_worker_retries_then_completes");
    let factory = factory(&redis, &keys).await;
    let name = keys.queue("thumbnails");

    let producer = factory.shared().await.unwrap();
    let queue = Queue::<Thumbnail>::new(&name, producer.clone(), JobOptions::default()).unwrap();
    let handle = queue
        .enqueue(
            "resize",
            &thumbnail(7),
            Some(
                JobOptionsOverride::new()
                    .with_attempts(3)
                    .with_backoff(Backoff::fixed(200)),
            ),
        )
        .await
        .unwrap();

    let mut coordinator = ShutdownCoordinator::new();
    coordinator.set_producer(producer);
    let worker = Worker::new(
        &name,
        factory.dedicated(&keys.worker_id(0)).await.unwrap(),
        Resizer {
            failures: 2,
            calls: AtomicU32::new(0),
        },
        WorkerConfig::new().with_block_timeout(Duration::from_millis(500)),
    )
    .unwrap();
    coordinator.spawn_worker(worker);

    wait_for(&queue, |c| c.completed == 1).await;
    let record = queue.get_job(&handle.id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.attempts_made, 3);
    assert_eq!(record.progress, Some(json!({ "stage": "resizing" })));
    assert_eq!(record.result.unwrap()["width"], 128);

    let report = coordinator.shutdown().await;
    assert!(report.is_clean(), "{:?}", report.failures());
}

#[tokio::test]
#[ignore]
async fn test_retention_and_exhaustion_against_redis() {
    let redis = TestRedis::new().await;
    let keys = TestKeys::from_test_name("test_retention_and_exhaustion_against_redis");
    let factory = factory(&redis, &keys).await;
    let name = keys.queue("thumbnails");

    let producer = factory.shared().await.unwrap();
    let queue = Queue::<Thumbnail>::new(
        &name,
        producer.clone(),
        JobOptions {
            attempts: 1,
            retain_on_fail: 3,
            ..JobOptions::default()
        },
    )
    .unwrap();
    for i in 0..5 {
        queue.enqueue("resize", &thumbnail(i), None).await.unwrap();
    }

    let mut coordinator = ShutdownCoordinator::new();
    coordinator.set_producer(producer);
    let worker = Worker::new(
        &name,
        factory.dedicated(&keys.worker_id(0)).await.unwrap(),
        Resizer {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        },
        WorkerConfig::new().with_block_timeout(Duration::from_millis(500)),
    )
    .unwrap();
    coordinator.spawn_worker(worker);

    let counts = wait_for(&queue, |c| c.waiting == 0 && c.active == 0 && c.failed == 3).await;
    assert_eq!(counts.total(), 3);

    let layout = QueueKeys::new(&keys.prefix(), &name);
    let job_keys = redis.keys(&format!("{}*", layout.job_prefix())).await;
    let hashes = job_keys
        .iter()
        .filter(|key| key[layout.job_prefix().len()..].parse::<u64>().is_ok())
        .count();
    assert_eq!(hashes, 3, "trimmed job hashes must be deleted: {job_keys:?}");

    // One job at a time, so ids fail in order and the newest three survive.
    let kept: Vec<String> = queue
        .jobs(JobState::Failed, 0, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(kept, ["5", "4", "3"]);
    assert!(queue.get_job("1").await.unwrap().is_none());

    let report = coordinator.shutdown().await;
    assert!(report.is_clean(), "{:?}", report.failures());
}

#[tokio::test]
#[ignore]
async fn test_close_all_quits_connections() {
    let redis = TestRedis::new().await;
    let keys = TestKeys::from_test_name("test_close_all_quits_connections");
    let factory = factory(&redis, &keys).await;

    let connections = vec![
        factory.shared().await.unwrap(),
        factory.dedicated(&keys.worker_id(0)).await.unwrap(),
        factory.dedicated(&keys.worker_id(1)).await.unwrap(),
    ];
    let outcomes = close_all(&connections).await;
    assert!(outcomes.iter().all(CloseOutcome::is_ok), "{outcomes:?}");
    for connection in &connections {
        assert!(connection.is_closed());
        assert!(matches!(
            connection.broker().ping().await,
            Err(QueueError::ConnectionClosed(_))
        ));
    }
}
