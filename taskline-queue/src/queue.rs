//! Named queue handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::broker::{JobCounts, QueueBroker};
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobData, JobHandle, JobId, JobOptions, NewJob};

/// A named queue bound to its own broker client.
///
/// Handles are shared through the [`QueueRegistry`](crate::QueueRegistry);
/// two lookups of the same name return the same `Arc<Queue>`.
pub struct Queue {
    name: String,
    broker: Arc<dyn QueueBroker>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Queue {
    /// Wrap a broker client.
    pub fn new(name: impl Into<String>, broker: Arc<dyn QueueBroker>) -> Self {
        Self {
            name: name.into(),
            broker,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.is_closed() {
            Err(QueueError::Closed(self.name.clone()))
        } else {
            Ok(())
        }
    }

    /// Submit a payload. Options reach the broker untouched.
    pub async fn add<T: serde::Serialize + ?Sized>(
        &self,
        payload: &T,
        options: Option<JobOptions>,
    ) -> QueueResult<JobHandle> {
        self.ensure_open()?;
        let new_job = NewJob::new(payload, options)?;
        let handle = self.broker.push(new_job).await?;
        debug!(queue = %self.name, job_id = %handle.id, "Job added");
        Ok(handle)
    }

    /// Take the next deliverable job.
    pub async fn fetch(&self) -> QueueResult<Option<Job>> {
        self.ensure_open()?;
        self.broker.fetch().await
    }

    /// Acknowledge a delivered job.
    pub async fn ack(&self, job_id: JobId, return_value: JobData) -> QueueResult<()> {
        self.ensure_open()?;
        self.broker.ack(job_id, return_value).await
    }

    /// Report a delivered job as failed.
    pub async fn nack(&self, job_id: JobId, reason: String) -> QueueResult<()> {
        self.ensure_open()?;
        self.broker.nack(job_id, reason).await
    }

    /// Look up a job.
    pub async fn get_job(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        self.ensure_open()?;
        self.broker.get_job(job_id).await
    }

    /// Current job counts.
    pub async fn counts(&self) -> QueueResult<JobCounts> {
        self.ensure_open()?;
        self.broker.counts().await
    }

    /// Close the broker client.
    ///
    /// Returns `Ok(false)` when the queue was already closed.
    pub async fn close(&self) -> QueueResult<bool> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.broker.close().await?;
        debug!(queue = %self.name, "Queue closed");
        Ok(true)
    }
}
