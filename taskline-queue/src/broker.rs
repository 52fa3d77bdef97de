//! The broker seam.
//!
//! A [`QueueBroker`] is one queue's client on a durable broker. Retry,
//! backoff and dead-lettering are the broker's business; everything above
//! this trait only submits, fetches and acknowledges.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::QueueResult;
use crate::job::{Job, JobData, JobHandle, JobId, NewJob};

/// Failure reason recorded on jobs recovered from the active set.
pub const STALLED_REASON: &str = "Job stalled";

/// Per-state job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    /// Ready to be fetched
    pub waiting: usize,
    /// Scheduled for later
    pub delayed: usize,
    /// Handed to a consumer
    pub active: usize,
    /// Finished successfully
    pub completed: usize,
    /// Attempts exhausted
    pub failed: usize,
}

/// One queue's connection to the broker.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Store a new job and return its broker-assigned handle.
    async fn push(&self, job: NewJob) -> QueueResult<JobHandle>;

    /// Take the next deliverable job, if any, and mark it active.
    async fn fetch(&self) -> QueueResult<Option<Job>>;

    /// Report success for an active job.
    async fn ack(&self, job_id: JobId, return_value: JobData) -> QueueResult<()>;

    /// Report failure for an active job; the broker decides on retry.
    async fn nack(&self, job_id: JobId, reason: String) -> QueueResult<()>;

    /// Look a job up by id.
    async fn get_job(&self, job_id: JobId) -> QueueResult<Option<Job>>;

    /// Current job counts.
    async fn counts(&self) -> QueueResult<JobCounts>;

    /// Release the client connection.
    async fn close(&self) -> QueueResult<()>;
}

/// Opens per-queue broker clients.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a client for the queue described by `config` at `url`.
    async fn open(&self, url: &str, config: QueueConfig) -> QueueResult<Arc<dyn QueueBroker>>;
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name
    pub queue_name: String,

    /// Namespace prepended to every key
    pub namespace: String,

    /// Maximum number of waiting jobs (0 = unlimited)
    pub max_size: usize,

    /// How long finished job records are kept
    pub retention_time: Duration,

    /// How long a job may stay active before it is treated as abandoned
    /// (zero disables recovery)
    pub stalled_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: String::new(),
            namespace: "taskline:queue".to_string(),
            max_size: 0,
            retention_time: Duration::from_secs(86400), // 24 hours
            stalled_timeout: Duration::from_secs(300),
        }
    }
}

impl QueueConfig {
    /// Create a new queue configuration.
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Default::default()
        }
    }

    /// Same settings for a different queue.
    pub fn named(&self, queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..self.clone()
        }
    }

    /// Set the key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the maximum queue size.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the retention time for job records.
    pub fn with_retention_time(mut self, retention_time: Duration) -> Self {
        self.retention_time = retention_time;
        self
    }

    /// Set how long a job may stay active before it is recovered.
    pub fn with_stalled_timeout(mut self, stalled_timeout: Duration) -> Self {
        self.stalled_timeout = stalled_timeout;
        self
    }

    /// Prefix shared by all keys of this queue.
    pub fn key_prefix(&self) -> String {
        format!("{}:{}", self.namespace, self.queue_name)
    }

    /// Build a key under this queue's prefix.
    pub fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.key_prefix(), suffix)
    }
}
