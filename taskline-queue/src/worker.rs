//! Pull-based worker for processing jobs.
//!
//! A worker fetches one job at a time, hands its payload to the consumer and
//! reports the outcome back to the broker. A failing job is logged and
//! nacked; it never stops the loop or reaches other queues.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::job::{JobData, JobId};
use crate::queue::Queue;

/// Future returned by a [`JobHandler`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<JobData, String>> + Send>>;

/// Type-erased consumer: payload in, return value or failure reason out.
pub type JobHandler = Arc<dyn Fn(JobData) -> HandlerFuture + Send + Sync>;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of jobs processed at the same time
    pub concurrency: usize,

    /// How long an idle worker waits before polling again
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    /// Set the concurrency. Values below one are treated as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the idle poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Processes jobs from one queue.
pub struct Worker {
    queue: Arc<Queue>,
    handler: JobHandler,
    config: WorkerConfig,
}

impl Worker {
    /// Create a worker around a type-erased handler.
    pub fn new(queue: Arc<Queue>, handler: JobHandler) -> Self {
        Self {
            queue,
            handler,
            config: WorkerConfig::default(),
        }
    }

    /// Create a worker around a typed consumer.
    ///
    /// Payloads that do not decode into `T` count as failed jobs, as do
    /// consumer errors and panics.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use serde::Deserialize;
    /// use std::sync::Arc;
    /// use taskline_queue::*;
    ///
    /// #[derive(Deserialize)]
    /// struct Email {
    ///     to: String,
    /// }
    ///
    /// # fn example(queue: Arc<Queue>) {
    /// let worker = Worker::for_consumer(queue, |email: Email| async move {
    ///     println!("Sending email to {}", email.to);
    ///     Ok::<_, String>(())
    /// });
    /// let handle = worker.spawn();
    /// # }
    /// ```
    pub fn for_consumer<T, R, E, F, Fut>(queue: Arc<Queue>, consumer: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |data: JobData| -> HandlerFuture {
            let pending = serde_json::from_value::<T>(data).map(&consumer);
            Box::pin(async move {
                let pending = pending.map_err(|e| format!("Invalid payload: {}", e))?;
                let value = pending.await.map_err(|e| e.to_string())?;
                serde_json::to_value(value).map_err(|e| format!("Invalid return value: {}", e))
            })
        });
        Self::new(queue, handler)
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// The queue this worker drains.
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Process at most one job.
    ///
    /// Returns the id of the job that was handled successfully, `None` when
    /// nothing was ready, and [`QueueError::Processing`] when the consumer
    /// failed. A failed job has already been nacked when this returns.
    pub async fn run_once(&self) -> QueueResult<Option<JobId>> {
        let Some(job) = self.queue.fetch().await? else {
            return Ok(None);
        };
        let queue = self.queue.name();
        let job_id = job.id;

        debug!(queue = %queue, job_id = %job_id, attempt = job.attempts, "Processing job");

        // The consumer runs on its own task so a panic is reported as a failure.
        let outcome = match tokio::spawn((self.handler)(job.data.clone())).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err("Consumer panicked".to_string()),
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(return_value) => {
                self.queue.ack(job_id, return_value).await?;
                debug!(queue = %queue, job_id = %job_id, "Job completed");
                Ok(Some(job_id))
            }
            Err(reason) => {
                error!(
                    queue = %queue,
                    job_id = %job_id,
                    payload = %job.data,
                    error = %reason,
                    "Job failed"
                );
                self.queue.nack(job_id, reason.clone()).await?;
                Err(QueueError::Processing {
                    queue: queue.to_string(),
                    job_id,
                    reason,
                })
            }
        }
    }

    /// Start the processing loop on the tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (stop, stop_rx) = watch::channel(false);
        let concurrency = self.config.concurrency.max(1);
        let queue = self.queue.name().to_string();
        let worker = Arc::new(self);

        let tasks = (0..concurrency)
            .map(|slot| {
                let worker = worker.clone();
                let stop_rx = stop_rx.clone();
                tokio::spawn(async move { worker.run(slot, stop_rx).await })
            })
            .collect();

        info!(queue = %queue, concurrency, "Worker started");
        WorkerHandle { queue, stop, tasks }
    }

    async fn run(&self, slot: usize, mut stop: watch::Receiver<bool>) {
        let queue = self.queue.name();

        loop {
            if *stop.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) if e.is_processing_error() => continue,
                Err(QueueError::Closed(_)) => {
                    debug!(queue = %queue, worker = slot, "Queue closed");
                    break;
                }
                Err(e) => warn!(queue = %queue, worker = slot, error = %e, "Failed to poll queue"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(queue = %queue, worker = slot, "Worker loop exited");
    }
}

/// Handle on a spawned worker.
pub struct WorkerHandle {
    queue: String,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Queue the worker drains.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Whether every worker task has exited.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }

    /// Stop the worker.
    ///
    /// Idle tasks wake up immediately; a task in the middle of a job finishes
    /// that job before exiting.
    pub async fn stop(self) {
        self.stop.send_replace(true);

        for task in self.tasks {
            if let Err(e) = task.await {
                error!(queue = %self.queue, error = %e, "Worker task ended abnormally");
            }
        }

        info!(queue = %self.queue, "Worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBroker, MemoryQueue};
    use crate::job::{JobOptions, JobState};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Task {
        task: String,
    }

    fn queue() -> (Arc<Queue>, Arc<MemoryQueue>) {
        let broker = MemoryBroker::new("test-queue");
        let storage = broker.storage();
        (Arc::new(Queue::new("test-queue", Arc::new(broker))), storage)
    }

    fn fast() -> WorkerConfig {
        WorkerConfig::default().with_poll_interval(Duration::from_millis(10))
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.with_concurrency(0).concurrency, 1);
    }

    #[tokio::test]
    async fn test_run_once_calls_consumer_once_with_payload() {
        let (queue, storage) = queue();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handle = queue.add(&json!({"task": "x"}), None).await.unwrap();

        let captured = seen.clone();
        let worker = Worker::for_consumer(queue.clone(), move |task: Task| {
            let captured = captured.clone();
            async move {
                captured.lock().unwrap().push(task);
                Ok::<(), String>(())
            }
        });

        assert_eq!(worker.run_once().await.unwrap(), Some(handle.id));
        assert_eq!(worker.run_once().await.unwrap(), None);

        assert_eq!(*seen.lock().unwrap(), vec![Task { task: "x".into() }]);
        assert_eq!(storage.acks(), vec![(handle.id, json!(null))]);
    }

    #[tokio::test]
    async fn test_return_value_is_acked() {
        let (queue, storage) = queue();
        let handle = queue.add(&json!({"task": "sum"}), None).await.unwrap();

        let worker = Worker::for_consumer(queue, |_: Task| async { Ok::<_, String>(json!({"total": 3})) });
        worker.run_once().await.unwrap();

        assert_eq!(storage.acks(), vec![(handle.id, json!({"total": 3}))]);
        assert_eq!(storage.job(handle.id).unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_consumer_failure_is_nacked() {
        let (queue, storage) = queue();
        let handle = queue.add(&json!({"task": "x"}), None).await.unwrap();

        let worker = Worker::for_consumer(queue, |_: Task| async { Err::<(), _>("boom") });
        let err = worker.run_once().await.unwrap_err();

        match err {
            QueueError::Processing { queue, job_id, reason } => {
                assert_eq!(queue, "test-queue");
                assert_eq!(job_id, handle.id);
                assert_eq!(reason, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(storage.nacks(), vec![(handle.id, "boom".to_string())]);
        assert!(storage.acks().is_empty());
        assert_eq!(storage.job(handle.id).unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_failure_with_attempts_left_is_retried_by_broker() {
        let (queue, storage) = queue();
        let handle = queue
            .add(&json!({"task": "x"}), Some(JobOptions::new().attempts(2)))
            .await
            .unwrap();

        let worker = Worker::for_consumer(queue, |_: Task| async { Err::<(), _>("flaky") });
        assert!(worker.run_once().await.is_err());

        assert_eq!(storage.job(handle.id).unwrap().state, JobState::Delayed);
    }

    #[tokio::test]
    async fn test_invalid_payload_counts_as_failure() {
        let (queue, storage) = queue();
        let calls = Arc::new(AtomicU32::new(0));
        queue.add(&json!(42), None).await.unwrap();

        let counter = calls.clone();
        let worker = Worker::for_consumer(queue, move |_: Task| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), String>(()) }
        });

        let err = worker.run_once().await.unwrap_err();
        assert!(err.is_processing_error());
        assert!(err.to_string().contains("Invalid payload"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(storage.nacks().len(), 1);
    }

    #[tokio::test]
    async fn test_consumer_panic_is_isolated() {
        let (queue, storage) = queue();
        queue.add(&json!({"task": "explode"}), None).await.unwrap();
        queue.add(&json!({"task": "fine"}), None).await.unwrap();

        let worker = Worker::for_consumer(queue, |task: Task| async move {
            if task.task == "explode" {
                panic!("consumer exploded");
            }
            Ok::<(), String>(())
        });

        let err = worker.run_once().await.unwrap_err();
        assert!(err.to_string().contains("Consumer panicked"));
        assert!(worker.run_once().await.unwrap().is_some());
        assert_eq!(storage.acks().len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_worker_drains_queue_past_failures() {
        let (queue, storage) = queue();
        for task in ["a", "fail", "b"] {
            queue.add(&json!({ "task": task }), None).await.unwrap();
        }

        let handle = Worker::for_consumer(queue, |task: Task| async move {
            if task.task == "fail" {
                Err("rejected".to_string())
            } else {
                Ok(())
            }
        })
        .with_config(fast())
        .spawn();

        wait_until(|| storage.acks().len() == 2 && storage.nacks().len() == 1).await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_job() {
        let (queue, _) = queue();
        let started = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        queue.add(&json!({"task": "slow"}), None).await.unwrap();

        let (on_start, on_finish) = (started.clone(), finished.clone());
        let handle = Worker::for_consumer(queue, move |_: Task| {
            let (on_start, on_finish) = (on_start.clone(), on_finish.clone());
            async move {
                on_start.notify_one();
                tokio::time::sleep(Duration::from_millis(50)).await;
                on_finish.store(true, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        })
        .with_config(fast())
        .spawn();

        started.notified().await;
        handle.stop().await;

        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_interrupts_idle_wait() {
        let (queue, _) = queue();
        let handle = Worker::for_consumer(queue, |_: Task| async { Ok::<(), String>(()) })
            .with_config(WorkerConfig::default().with_poll_interval(Duration::from_secs(3600)))
            .spawn();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let stopped = tokio::time::timeout(Duration::from_secs(1), handle.stop()).await;
        assert!(stopped.is_ok());
    }

    #[tokio::test]
    async fn test_worker_exits_when_queue_closes() {
        let (queue, _) = queue();
        let handle = Worker::for_consumer(queue.clone(), |_: Task| async { Ok::<(), String>(()) })
            .with_config(fast())
            .spawn();

        queue.close().await.unwrap();

        wait_until(|| handle.is_finished()).await;
        assert_eq!(handle.queue(), "test-queue");
        handle.stop().await;
    }
}
