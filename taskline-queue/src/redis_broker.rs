//! Redis-backed broker.
//!
//! Key layout under `{namespace}:{queue}`:
//!
//! - `job:{id}` - JSON job record; expires after the retention time once
//!   the job has completed or been dead-lettered
//! - `seq` - counter handing out waiting-set scores
//! - `waiting:{priority}` - sorted set of ready jobs, scored by `seq`
//! - `delayed` - sorted set of scheduled jobs, scored by ready time
//! - `active` - sorted set of delivered jobs, scored by delivery time
//! - `completed` / `failed` - finished jobs, scored by finish time and
//!   trimmed to the retention window

use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Client, aio::ConnectionManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::broker::{BrokerConnector, JobCounts, QueueBroker, QueueConfig, STALLED_REASON};
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobData, JobHandle, JobId, JobPriority, JobState, NewJob};

/// Expiry in seconds for a job record in `state`. Only finished jobs expire.
fn record_ttl(state: JobState, retention: Duration) -> Option<u64> {
    match state {
        JobState::Completed | JobState::Failed => Some(retention.as_secs().max(1)),
        JobState::Waiting | JobState::Delayed | JobState::Active => None,
    }
}

/// One queue's dedicated Redis client.
pub struct RedisQueueBroker {
    connection: RwLock<Option<ConnectionManager>>,
    config: QueueConfig,
}

impl RedisQueueBroker {
    /// Open a dedicated connection for one queue.
    pub async fn connect(url: &str, config: QueueConfig, timeout: Duration) -> QueueResult<Self> {
        debug!(
            queue = %config.queue_name,
            prefix = %config.key_prefix(),
            max_size = config.max_size,
            "Opening queue connection"
        );

        let client = Client::open(url).map_err(|e| QueueError::Config(e.to_string()))?;

        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| QueueError::Timeout)??;

        info!(queue = %config.queue_name, "Job queue ready");
        Ok(Self {
            connection: RwLock::new(Some(connection)),
            config,
        })
    }

    /// The queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn conn(&self) -> QueueResult<ConnectionManager> {
        self.connection
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or_else(|| QueueError::Closed(self.config.queue_name.clone()))
    }

    fn job_key(&self, job_id: JobId) -> String {
        self.config.key(&format!("job:{}", job_id))
    }

    fn waiting_key(&self, priority: JobPriority) -> String {
        self.config.key(&format!("waiting:{}", priority.as_str()))
    }

    async fn save_job(&self, conn: &mut ConnectionManager, job: &Job) -> QueueResult<()> {
        let job_json = serde_json::to_string(job)?;
        let _: () = match record_ttl(job.state, self.config.retention_time) {
            Some(ttl) => conn.set_ex(self.job_key(job.id), job_json, ttl).await?,
            None => conn.set(self.job_key(job.id), job_json).await?,
        };
        Ok(())
    }

    async fn load_job(&self, conn: &mut ConnectionManager, job_id: JobId) -> QueueResult<Option<Job>> {
        let job_json: Option<String> = conn.get(self.job_key(job_id)).await?;

        match job_json {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| QueueError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn waiting_count(&self, conn: &mut ConnectionManager) -> QueueResult<usize> {
        let mut total = 0;
        for priority in JobPriority::DESCENDING {
            let count: usize = conn.zcard(self.waiting_key(priority)).await?;
            total += count;
        }
        Ok(total)
    }

    /// Append a job to its priority's waiting set.
    async fn make_waiting(&self, conn: &mut ConnectionManager, job: &Job) -> QueueResult<()> {
        let seq: i64 = conn.incr(self.config.key("seq"), 1).await?;
        let _: () = conn
            .zadd(self.waiting_key(job.priority()), job.id.to_string(), seq)
            .await?;
        Ok(())
    }

    /// Place a job in the waiting or delayed set according to its schedule.
    async fn schedule(&self, conn: &mut ConnectionManager, job: &Job) -> QueueResult<()> {
        match job.scheduled_at {
            Some(at) if !job.is_ready() => {
                let _: () = conn
                    .zadd(self.config.key("delayed"), job.id.to_string(), at.timestamp_millis())
                    .await?;
                Ok(())
            }
            _ => self.make_waiting(conn, job).await,
        }
    }

    /// Record a finished job in `set` and drop entries older than the
    /// retention window.
    async fn finish(&self, conn: &mut ConnectionManager, set: &str, job_id: JobId) -> QueueResult<()> {
        let key = self.config.key(set);
        let now = Utc::now().timestamp_millis();
        let retention_ms = i64::try_from(self.config.retention_time.as_millis()).unwrap_or(i64::MAX);

        let _: () = conn.zadd(&key, job_id.to_string(), now).await?;
        let _: () = conn
            .zrembyscore(&key, "-inf", format!("({}", now.saturating_sub(retention_ms)))
            .await?;
        Ok(())
    }

    /// Count a failed attempt and either reschedule the job or dead-letter it.
    async fn retry_or_bury(
        &self,
        conn: &mut ConnectionManager,
        job: &mut Job,
        reason: String,
    ) -> QueueResult<()> {
        let retrying = job.fail(reason);
        self.save_job(conn, job).await?;

        if retrying {
            debug!(
                queue = %self.config.queue_name,
                job_id = %job.id,
                attempt = job.attempts,
                max_attempts = job.max_attempts(),
                "Job scheduled for retry"
            );
            self.schedule(conn, job).await
        } else {
            warn!(
                queue = %self.config.queue_name,
                job_id = %job.id,
                attempts = job.attempts,
                "Job moved to dead letter set"
            );
            self.finish(conn, "failed", job.id).await
        }
    }

    /// Fail active jobs that have outlived the stalled timeout.
    async fn recover_stalled(&self, conn: &mut ConnectionManager) -> QueueResult<()> {
        if self.config.stalled_timeout.is_zero() {
            return Ok(());
        }

        let active_key = self.config.key("active");
        let timeout_ms = i64::try_from(self.config.stalled_timeout.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(timeout_ms);

        let stalled: Vec<String> = conn.zrangebyscore(&active_key, "-inf", cutoff).await?;

        for job_id_str in stalled {
            let removed: usize = conn.zrem(&active_key, &job_id_str).await?;
            if removed == 0 {
                continue;
            }

            let Ok(job_id) = job_id_str.parse::<JobId>() else {
                warn!(queue = %self.config.queue_name, member = %job_id_str, "Dropping malformed active entry");
                continue;
            };

            let Some(mut job) = self.load_job(conn, job_id).await? else {
                warn!(queue = %self.config.queue_name, job_id = %job_id, "Stalled job has no record");
                continue;
            };

            warn!(queue = %self.config.queue_name, job_id = %job_id, "Recovering stalled job");
            self.retry_or_bury(conn, &mut job, STALLED_REASON.to_string()).await?;
        }

        Ok(())
    }

    /// Move delayed jobs whose time has come to their waiting set, oldest
    /// ready time first.
    async fn promote_delayed(&self, conn: &mut ConnectionManager) -> QueueResult<()> {
        let delayed_key = self.config.key("delayed");
        let now = Utc::now().timestamp_millis();

        let due: Vec<String> = conn.zrangebyscore(&delayed_key, "-inf", now).await?;

        for job_id_str in due {
            // Whoever removes the member owns the promotion.
            let removed: usize = conn.zrem(&delayed_key, &job_id_str).await?;
            if removed == 0 {
                continue;
            }

            let Ok(job_id) = job_id_str.parse::<JobId>() else {
                warn!(queue = %self.config.queue_name, member = %job_id_str, "Dropping malformed delayed entry");
                continue;
            };

            let Some(mut job) = self.load_job(conn, job_id).await? else {
                warn!(queue = %self.config.queue_name, job_id = %job_id, "Delayed job has no record");
                continue;
            };

            job.state = JobState::Waiting;
            self.save_job(conn, &job).await?;
            self.make_waiting(conn, &job).await?;
        }

        Ok(())
    }

    /// Remove all keys belonging to this queue.
    pub async fn clear(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        let pattern = format!("{}:*", self.config.key_prefix());
        let keys: Vec<String> = conn.keys(&pattern).await?;

        if !keys.is_empty() {
            let _: () = conn.del(keys).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl QueueBroker for RedisQueueBroker {
    async fn push(&self, new_job: NewJob) -> QueueResult<JobHandle> {
        let mut conn = self.conn().await?;

        if self.config.max_size > 0 && self.waiting_count(&mut conn).await? >= self.config.max_size {
            return Err(QueueError::QueueFull(self.config.queue_name.clone()));
        }

        let job = Job::from_new(&self.config.queue_name, new_job)?;
        self.save_job(&mut conn, &job).await?;
        self.schedule(&mut conn, &job).await?;

        debug!(queue = %self.config.queue_name, job_id = %job.id, "Job stored");
        Ok(job.handle())
    }

    async fn fetch(&self) -> QueueResult<Option<Job>> {
        let mut conn = self.conn().await?;
        self.recover_stalled(&mut conn).await?;
        self.promote_delayed(&mut conn).await?;

        for priority in JobPriority::DESCENDING {
            let queue_key = self.waiting_key(priority);

            loop {
                let popped: Vec<String> = conn.zpopmin(&queue_key, 1).await?;
                let Some(job_id_str) = popped.first() else {
                    break;
                };

                let Ok(job_id) = job_id_str.parse::<JobId>() else {
                    warn!(queue = %self.config.queue_name, member = %job_id_str, "Dropping malformed waiting entry");
                    continue;
                };

                let Some(mut job) = self.load_job(&mut conn, job_id).await? else {
                    warn!(queue = %self.config.queue_name, job_id = %job_id, "Waiting job has no record");
                    continue;
                };

                job.start_processing();
                self.save_job(&mut conn, &job).await?;

                let _: () = conn
                    .zadd(
                        self.config.key("active"),
                        job_id.to_string(),
                        Utc::now().timestamp_millis(),
                    )
                    .await?;

                return Ok(Some(job));
            }
        }

        Ok(None)
    }

    async fn ack(&self, job_id: JobId, return_value: JobData) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let mut job = self
            .load_job(&mut conn, job_id)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))?;

        job.complete(return_value);
        self.save_job(&mut conn, &job).await?;

        let _: () = conn.zrem(self.config.key("active"), job_id.to_string()).await?;
        self.finish(&mut conn, "completed", job_id).await
    }

    async fn nack(&self, job_id: JobId, reason: String) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let mut job = self
            .load_job(&mut conn, job_id)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))?;

        let _: () = conn.zrem(self.config.key("active"), job_id.to_string()).await?;
        self.retry_or_bury(&mut conn, &mut job, reason).await
    }

    async fn get_job(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.conn().await?;
        self.load_job(&mut conn, job_id).await
    }

    async fn counts(&self) -> QueueResult<JobCounts> {
        let mut conn = self.conn().await?;

        let waiting = self.waiting_count(&mut conn).await?;
        let delayed: usize = conn.zcard(self.config.key("delayed")).await?;
        let active: usize = conn.zcard(self.config.key("active")).await?;
        let completed: usize = conn.zcard(self.config.key("completed")).await?;
        let failed: usize = conn.zcard(self.config.key("failed")).await?;

        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn close(&self) -> QueueResult<()> {
        if self.connection.write().await.take().is_some() {
            info!(queue = %self.config.queue_name, "Queue connection closed");
        }
        Ok(())
    }
}

/// Opens one Redis connection per queue name.
#[derive(Debug, Clone)]
pub struct RedisBrokerConnector {
    connection_timeout: Duration,
}

impl RedisBrokerConnector {
    /// Connector with the given connect timeout.
    pub fn new(connection_timeout: Duration) -> Self {
        Self { connection_timeout }
    }
}

impl Default for RedisBrokerConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl BrokerConnector for RedisBrokerConnector {
    async fn open(&self, url: &str, config: QueueConfig) -> QueueResult<Arc<dyn QueueBroker>> {
        let broker = RedisQueueBroker::connect(url, config, self.connection_timeout).await?;
        Ok(Arc::new(broker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use serde_json::json;

    const REDIS_URL: &str = "redis://localhost:6379";

    async fn broker(name: &str) -> RedisQueueBroker {
        broker_with(QueueConfig::new(name)).await
    }

    async fn broker_with(config: QueueConfig) -> RedisQueueBroker {
        let config = config.with_namespace("taskline:test");
        let broker = RedisQueueBroker::connect(REDIS_URL, config, Duration::from_secs(2))
            .await
            .unwrap();
        broker.clear().await.unwrap();
        broker
    }

    #[test]
    fn test_only_finished_records_expire() {
        let retention = Duration::from_secs(60);

        assert_eq!(record_ttl(JobState::Waiting, retention), None);
        assert_eq!(record_ttl(JobState::Delayed, retention), None);
        assert_eq!(record_ttl(JobState::Active, retention), None);
        assert_eq!(record_ttl(JobState::Completed, retention), Some(60));
        assert_eq!(record_ttl(JobState::Failed, retention), Some(60));
        assert_eq!(record_ttl(JobState::Failed, Duration::from_millis(10)), Some(1));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let result =
            RedisQueueBroker::connect("not a url", QueueConfig::new("x"), Duration::from_secs(1))
                .await;
        assert!(matches!(result, Err(QueueError::Config(_))));
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_push_fetch_ack() {
        let broker = broker("push_fetch_ack").await;

        let handle = broker
            .push(NewJob::new(&json!({"task": "x"}), None).unwrap())
            .await
            .unwrap();
        assert_eq!(handle.queue, "push_fetch_ack");

        let job = broker.fetch().await.unwrap().unwrap();
        assert_eq!(job.id, handle.id);
        assert_eq!(job.attempts, 1);

        broker.ack(job.id, json!("ok")).await.unwrap();
        let counts = broker.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.active, 0);

        broker.clear().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_priority_and_fifo_order() {
        let broker = broker("priority_order").await;

        let first = broker.push(NewJob::new(&1, None).unwrap()).await.unwrap();
        let second = broker.push(NewJob::new(&2, None).unwrap()).await.unwrap();
        let urgent = broker
            .push(NewJob::new(&3, Some(JobOptions::new().priority(JobPriority::Critical))).unwrap())
            .await
            .unwrap();

        assert_eq!(broker.fetch().await.unwrap().unwrap().id, urgent.id);
        assert_eq!(broker.fetch().await.unwrap().unwrap().id, first.id);
        assert_eq!(broker.fetch().await.unwrap().unwrap().id, second.id);

        broker.clear().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_exhausted_job_is_dead_lettered() {
        let broker = broker("dead_letter").await;

        broker.push(NewJob::new(&json!({}), None).unwrap()).await.unwrap();
        let job = broker.fetch().await.unwrap().unwrap();
        broker.nack(job.id, "boom".into()).await.unwrap();

        let counts = broker.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.delayed, 0);

        let stored = broker.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.failed_reason.as_deref(), Some("boom"));

        broker.clear().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_closed_broker_rejects_operations() {
        let broker = broker("closed").await;
        broker.close().await.unwrap();

        let err = broker.fetch().await.unwrap_err();
        assert!(matches!(err, QueueError::Closed(_)));
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_burst_keeps_submission_order() {
        let broker = broker("burst_order").await;

        let mut pushed = Vec::new();
        for n in 0..50 {
            pushed.push(broker.push(NewJob::new(&n, None).unwrap()).await.unwrap().id);
        }

        let mut fetched = Vec::new();
        while let Some(job) = broker.fetch().await.unwrap() {
            fetched.push(job.id);
        }
        assert_eq!(fetched, pushed);

        broker.clear().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_delay_longer_than_retention_is_delivered() {
        let broker =
            broker_with(QueueConfig::new("long_delay").with_retention_time(Duration::from_secs(1)))
                .await;

        let handle = broker
            .push(
                NewJob::new(&json!({}), Some(JobOptions::new().delay(Duration::from_millis(2500))))
                    .unwrap(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2600)).await;

        let job = broker.fetch().await.unwrap().unwrap();
        assert_eq!(job.id, handle.id);

        broker.ack(job.id, json!(null)).await.unwrap();
        let mut conn = broker.conn().await.unwrap();
        let ttl: i64 = conn.ttl(broker.job_key(job.id)).await.unwrap();
        assert!(ttl > 0);

        broker.clear().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_stalled_job_is_retried() {
        let broker = broker_with(
            QueueConfig::new("stalled").with_stalled_timeout(Duration::from_millis(100)),
        )
        .await;

        broker
            .push(NewJob::new(&json!({}), Some(JobOptions::new().attempts(2))).unwrap())
            .await
            .unwrap();
        let abandoned = broker.fetch().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(broker.fetch().await.unwrap().is_none());

        let stored = broker.get_job(abandoned.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Delayed);
        assert_eq!(stored.failed_reason.as_deref(), Some(STALLED_REASON));

        let counts = broker.counts().await.unwrap();
        assert_eq!(counts.active, 0);
        assert_eq!(counts.delayed, 1);

        broker.clear().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_finished_sets_are_trimmed() {
        let broker =
            broker_with(QueueConfig::new("trimmed").with_retention_time(Duration::from_secs(1)))
                .await;

        broker.push(NewJob::new(&1, None).unwrap()).await.unwrap();
        let old = broker.fetch().await.unwrap().unwrap();
        broker.ack(old.id, json!(null)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;

        broker.push(NewJob::new(&2, None).unwrap()).await.unwrap();
        let recent = broker.fetch().await.unwrap().unwrap();
        broker.ack(recent.id, json!(null)).await.unwrap();

        assert_eq!(broker.counts().await.unwrap().completed, 1);

        broker.clear().await.unwrap();
    }
}
