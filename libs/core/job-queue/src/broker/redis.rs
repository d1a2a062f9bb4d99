//! Redis broker.
//!
//! Key layout per queue, under `<prefix>:<queue>`:
//!
//! | Key | Type | Contents |
//! |---|---|---|
//! | `:id` | string | id counter |
//! | `:<id>` | hash | job record |
//! | `:wait` | list | waiting ids, newest on the left |
//! | `:active` | list | running ids |
//! | `:delayed` | zset | delayed ids scored by due time (ms) |
//! | `:completed` / `:failed` | zset | finished ids scored by finish order |
//! | `:finished` | string | finish sequence counter |
//! | `:marker` | zset | wake-up marker for parked claims |
//!
//! Claiming is one script: promote due delayed jobs, move the oldest waiting
//! id to `:active` and start it. When there is nothing to claim the script
//! clears `:marker` and the worker parks in `BZPOPMIN` on it, bounded by
//! `block_timeout` and the next delayed due time. Adding a job and scheduling
//! a retry set the marker in the same script, so a parked claim always wakes
//! for new work no matter which client produced it.
//!
//! A dedicated connection carries two multiplexed channels: one that only
//! ever parks on the marker (no response timeout), and one for everything
//! else, so a parked claim never delays progress or completion writes from
//! running jobs.

use super::Broker;
use crate::error::QueueError;
use crate::job::{JobCounts, JobRecord, NewJob};
use crate::options::JobOptions;
use crate::state::JobState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

const ADD_JOB_LUA: &str = include_str!("lua/add_job.lua");
const MOVE_TO_ACTIVE_LUA: &str = include_str!("lua/move_to_active.lua");
const FINISH_JOB_LUA: &str = include_str!("lua/finish_job.lua");
const RETRY_JOB_LUA: &str = include_str!("lua/retry_job.lua");
const UPDATE_PROGRESS_LUA: &str = include_str!("lua/update_progress.lua");

/// Shortest BZPOPMIN timeout; zero would block forever.
const MIN_BLOCK_SECS: f64 = 0.01;

/// Redis keys for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    base: String,
}

impl QueueKeys {
    pub fn new(prefix: &str, queue: &str) -> Self {
        Self {
            base: format!("{prefix}:{queue}"),
        }
    }

    pub fn id(&self) -> String {
        format!("{}:id", self.base)
    }

    pub fn wait(&self) -> String {
        format!("{}:wait", self.base)
    }

    pub fn active(&self) -> String {
        format!("{}:active", self.base)
    }

    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.base)
    }

    pub fn completed(&self) -> String {
        format!("{}:completed", self.base)
    }

    pub fn failed(&self) -> String {
        format!("{}:failed", self.base)
    }

    pub fn finished_seq(&self) -> String {
        format!("{}:finished", self.base)
    }

    pub fn marker(&self) -> String {
        format!("{}:marker", self.base)
    }

    /// Prefix that, followed by a job id, forms the job hash key.
    pub fn job_prefix(&self) -> String {
        format!("{}:", self.base)
    }

    pub fn job(&self, id: &str) -> String {
        format!("{}:{id}", self.base)
    }

    /// List or zset holding jobs in `state`.
    pub fn for_state(&self, state: JobState) -> String {
        match state {
            JobState::Waiting => self.wait(),
            JobState::Active => self.active(),
            JobState::Delayed => self.delayed(),
            JobState::Completed => self.completed(),
            JobState::Failed => self.failed(),
        }
    }
}

struct Scripts {
    add_job: Script,
    move_to_active: Script,
    finish_job: Script,
    retry_job: Script,
    update_progress: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            add_job: Script::new(ADD_JOB_LUA),
            move_to_active: Script::new(MOVE_TO_ACTIVE_LUA),
            finish_job: Script::new(FINISH_JOB_LUA),
            retry_job: Script::new(RETRY_JOB_LUA),
            update_progress: Script::new(UPDATE_PROGRESS_LUA),
        }
    }
}

/// Broker backed by a single Redis instance.
pub struct RedisBroker {
    name: String,
    prefix: String,
    commands: ConnectionManager,
    blocking: Option<ConnectionManager>,
    closed: AtomicBool,
    scripts: Scripts,
}

impl RedisBroker {
    /// Reconnect backoff: 50 ms doubling up to 2 s.
    pub fn manager_config() -> ConnectionManagerConfig {
        ConnectionManagerConfig::new()
            .set_min_delay(Duration::from_millis(50))
            .set_exponent_base(2.0)
            .set_max_delay(Duration::from_millis(2000))
    }

    /// Connect eagerly. With `dedicated`, a second channel without response
    /// timeout is opened for blocking claims.
    pub async fn connect(
        client: redis::Client,
        prefix: impl Into<String>,
        name: impl Into<String>,
        dedicated: bool,
    ) -> Result<Self, QueueError> {
        let name = name.into();

        let commands = ConnectionManager::new_with_config(client.clone(), Self::manager_config())
            .await
            .map_err(|source| QueueError::Connect {
                name: name.clone(),
                source,
            })?;

        let blocking = if dedicated {
            let config = Self::manager_config().set_response_timeout(None);
            let manager = ConnectionManager::new_with_config(client, config)
                .await
                .map_err(|source| QueueError::Connect {
                    name: name.clone(),
                    source,
                })?;
            Some(manager)
        } else {
            None
        };

        info!(connection = %name, dedicated, "Connected to Redis");

        Ok(Self {
            name,
            prefix: prefix.into(),
            commands,
            blocking,
            closed: AtomicBool::new(false),
            scripts: Scripts::load(),
        })
    }

    fn keys(&self, queue: &str) -> QueueKeys {
        QueueKeys::new(&self.prefix, queue)
    }

    fn conn(&self) -> Result<ConnectionManager, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::ConnectionClosed(self.name.clone()));
        }
        Ok(self.commands.clone())
    }

    /// Run the claim script once.
    async fn move_to_active(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        keys: &QueueKeys,
        now: i64,
    ) -> Result<ClaimReply, QueueError> {
        let reply: Vec<String> = self
            .scripts
            .move_to_active
            .key(keys.wait())
            .key(keys.active())
            .key(keys.delayed())
            .key(keys.marker())
            .arg(keys.job_prefix())
            .arg(now)
            .invoke_async(conn)
            .await?;

        ClaimReply::parse(queue, reply)
    }

    async fn finish(
        &self,
        queue: &str,
        id: &str,
        to: JobState,
        field: &str,
        value: String,
        keep: u64,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let keys = self.keys(queue);
        let prior: String = self
            .scripts
            .finish_job
            .key(keys.active())
            .key(keys.for_state(to))
            .key(keys.job(id))
            .key(keys.finished_seq())
            .arg(id)
            .arg(to.as_ref())
            .arg(field)
            .arg(value)
            .arg(now_ms())
            .arg(keep)
            .arg(keys.job_prefix())
            .invoke_async(&mut conn)
            .await?;

        check_prior(queue, id, &prior, to)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn add_job(&self, queue: &str, job: NewJob) -> Result<String, QueueError> {
        let mut conn = self.conn()?;
        let keys = self.keys(queue);
        let delay_ms = job.delay.map(millis).unwrap_or(0);

        let id: String = self
            .scripts
            .add_job
            .key(keys.id())
            .key(keys.wait())
            .key(keys.delayed())
            .key(keys.marker())
            .arg(keys.job_prefix())
            .arg(&job.name)
            .arg(serde_json::to_string(&job.data)?)
            .arg(serde_json::to_string(&job.options)?)
            .arg(now_ms())
            .arg(delay_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(id)
    }

    async fn claim(&self, queue: &str, block: Duration) -> Result<Option<JobRecord>, QueueError> {
        let mut conn = self.conn()?;
        let keys = self.keys(queue);

        let now = now_ms();
        let next_due = match self.move_to_active(&mut conn, queue, &keys, now).await? {
            ClaimReply::Claimed(record) => return Ok(Some(record)),
            ClaimReply::Idle { next_due } => next_due,
        };

        let mut wait = block;
        if let Some(next_due) = next_due {
            let until_due = Duration::from_millis((next_due - now).max(0) as u64);
            wait = wait.min(until_due);
        }

        // Parks until a producer or a retry sets the marker, the next delayed
        // job is due, or `block` runs out. The pop result itself is unused.
        let mut blocking = self.blocking.clone().unwrap_or_else(|| conn.clone());
        let _: redis::Value = redis::cmd("BZPOPMIN")
            .arg(keys.marker())
            .arg(wait.as_secs_f64().max(MIN_BLOCK_SECS))
            .query_async(&mut blocking)
            .await?;

        match self.move_to_active(&mut conn, queue, &keys, now_ms()).await? {
            ClaimReply::Claimed(record) => Ok(Some(record)),
            ClaimReply::Idle { .. } => Ok(None),
        }
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        progress: &Value,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let keys = self.keys(queue);
        let stored: i64 = self
            .scripts
            .update_progress
            .key(keys.job(id))
            .arg(serde_json::to_string(progress)?)
            .invoke_async(&mut conn)
            .await?;

        if stored == 0 {
            return Err(QueueError::not_found(queue, id));
        }
        Ok(())
    }

    async fn complete(
        &self,
        queue: &str,
        id: &str,
        result: &Value,
        keep: u64,
    ) -> Result<(), QueueError> {
        let value = serde_json::to_string(result)?;
        self.finish(queue, id, JobState::Completed, "result", value, keep)
            .await
    }

    async fn retry_later(
        &self,
        queue: &str,
        id: &str,
        reason: &str,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let keys = self.keys(queue);
        let due = now_ms().saturating_add(millis(delay));
        let prior: String = self
            .scripts
            .retry_job
            .key(keys.active())
            .key(keys.delayed())
            .key(keys.job(id))
            .key(keys.marker())
            .arg(id)
            .arg(reason)
            .arg(due)
            .invoke_async(&mut conn)
            .await?;

        check_prior(queue, id, &prior, JobState::Delayed)
    }

    async fn fail(
        &self,
        queue: &str,
        id: &str,
        reason: &str,
        keep: u64,
    ) -> Result<(), QueueError> {
        self.finish(
            queue,
            id,
            JobState::Failed,
            "failure_reason",
            reason.to_string(),
            keep,
        )
        .await
    }

    async fn get_job(&self, queue: &str, id: &str) -> Result<Option<JobRecord>, QueueError> {
        let mut conn = self.conn()?;
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys(queue).job(id))
            .query_async(&mut conn)
            .await?;

        if raw.is_empty() {
            return Ok(None);
        }
        record_from_hash(queue, id, raw).map(Some)
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        let mut conn = self.conn()?;
        let keys = self.keys(queue);
        let (waiting, active, delayed, completed, failed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .cmd("LLEN")
                .arg(keys.wait())
                .cmd("LLEN")
                .arg(keys.active())
                .cmd("ZCARD")
                .arg(keys.delayed())
                .cmd("ZCARD")
                .arg(keys.completed())
                .cmd("ZCARD")
                .arg(keys.failed())
                .query_async(&mut conn)
                .await?;

        Ok(JobCounts {
            waiting,
            active,
            delayed,
            completed,
            failed,
        })
    }

    async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        start: usize,
        end: usize,
    ) -> Result<Vec<JobRecord>, QueueError> {
        if end < start {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        let keys = self.keys(queue);
        let key = keys.for_state(state);

        let ids: Vec<String> = match state {
            JobState::Waiting => {
                // Oldest jobs sit at the right end of the list.
                let mut ids: Vec<String> = redis::cmd("LRANGE")
                    .arg(&key)
                    .arg(-(end as i64) - 1)
                    .arg(-(start as i64) - 1)
                    .query_async(&mut conn)
                    .await?;
                ids.reverse();
                ids
            }
            JobState::Active => {
                redis::cmd("LRANGE")
                    .arg(&key)
                    .arg(start)
                    .arg(end)
                    .query_async(&mut conn)
                    .await?
            }
            JobState::Delayed => {
                redis::cmd("ZRANGE")
                    .arg(&key)
                    .arg(start)
                    .arg(end)
                    .query_async(&mut conn)
                    .await?
            }
            JobState::Completed | JobState::Failed => {
                redis::cmd("ZREVRANGE")
                    .arg(&key)
                    .arg(start)
                    .arg(end)
                    .query_async(&mut conn)
                    .await?
            }
        };

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.cmd("HGETALL").arg(keys.job(id));
        }
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        ids.iter()
            .zip(hashes)
            .filter(|(_, raw)| !raw.is_empty())
            .map(|(id, raw)| record_from_hash(queue, id, raw))
            .collect()
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut outcome = Ok(());
        let channels = std::iter::once(self.commands.clone()).chain(self.blocking.clone());
        for mut channel in channels {
            if let Err(e) = redis::cmd("QUIT").query_async::<()>(&mut channel).await {
                warn!(connection = %self.name, error = %e, "QUIT failed");
                outcome = Err(QueueError::Redis(e));
            }
        }
        outcome
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Reply of the claim script.
#[derive(Debug)]
enum ClaimReply {
    Claimed(JobRecord),
    Idle { next_due: Option<i64> },
}

impl ClaimReply {
    fn parse(queue: &str, reply: Vec<String>) -> Result<Self, QueueError> {
        let mut items = reply.into_iter();
        match items.next().as_deref() {
            Some("job") => {
                let id = items.next().ok_or_else(|| {
                    QueueError::Serialization(format!("claim reply in '{queue}' has no job id"))
                })?;
                let mut raw = HashMap::new();
                while let (Some(field), Some(value)) = (items.next(), items.next()) {
                    raw.insert(field, value);
                }
                record_from_hash(queue, &id, raw).map(ClaimReply::Claimed)
            }
            Some("idle") => {
                let next_due = items
                    .next()
                    .and_then(|due| due.parse::<f64>().ok())
                    .filter(|due| *due >= 0.0)
                    .map(|due| due as i64);
                Ok(ClaimReply::Idle { next_due })
            }
            other => Err(QueueError::Serialization(format!(
                "unexpected claim reply in '{queue}': {other:?}"
            ))),
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn check_prior(queue: &str, id: &str, prior: &str, to: JobState) -> Result<(), QueueError> {
    if prior.is_empty() {
        return Err(QueueError::not_found(queue, id));
    }
    let from = prior.parse::<JobState>().ok();
    JobState::transition(from, to).map(|_| ())
}

fn millis_field(raw: &HashMap<String, String>, field: &str) -> Option<DateTime<Utc>> {
    raw.get(field)
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
}

fn json_field(raw: &HashMap<String, String>, field: &str) -> Result<Option<Value>, QueueError> {
    raw.get(field)
        .map(|v| serde_json::from_str(v))
        .transpose()
        .map_err(QueueError::from)
}

fn record_from_hash(
    queue: &str,
    id: &str,
    raw: HashMap<String, String>,
) -> Result<JobRecord, QueueError> {
    let field = |name: &str| {
        raw.get(name).ok_or_else(|| {
            QueueError::Serialization(format!("job {id} in '{queue}' is missing '{name}'"))
        })
    };

    let state = field("state")?
        .parse::<JobState>()
        .map_err(|e| QueueError::Serialization(format!("job {id}: {e}")))?;
    let options: JobOptions = serde_json::from_str(field("opts")?)?;

    Ok(JobRecord {
        id: id.to_string(),
        queue: queue.to_string(),
        name: field("name")?.clone(),
        data: serde_json::from_str(field("data")?)?,
        options,
        state,
        attempts_made: raw
            .get("attempts_made")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        progress: json_field(&raw, "progress")?,
        result: json_field(&raw, "result")?,
        failure_reason: raw.get("failure_reason").cloned(),
        created_at: millis_field(&raw, "created_at").unwrap_or_else(Utc::now),
        processed_at: millis_field(&raw, "processed_at"),
        finished_at: millis_field(&raw, "finished_at"),
        delay_until: millis_field(&raw, "delay_until"),
    })
}
