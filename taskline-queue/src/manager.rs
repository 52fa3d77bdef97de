//! The `JobQueues` context.
//!
//! One value owns the shared connection, the queue registry and the running
//! workers. Whoever creates it decides when [`JobQueues::shutdown`] runs.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use taskline_redis::{ConnectionManager, Connector, RedisConfig, RedisConnector, SharedConnection};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::{BrokerConnector, QueueConfig};
use crate::error::{QueueError, QueueResult};
use crate::job::{JobHandle, JobOptions, JobPayload};
use crate::queue::Queue;
use crate::redis_broker::RedisBrokerConnector;
use crate::registry::QueueRegistry;
use crate::worker::{Worker, WorkerConfig, WorkerHandle};

/// Connection, queues and workers of one application.
///
/// # Examples
///
/// ```no_run
/// use serde::{Deserialize, Serialize};
/// use taskline_queue::*;
///
/// #[derive(Serialize, Deserialize)]
/// struct Email {
///     to: String,
/// }
///
/// impl JobPayload for Email {
///     const QUEUE: &'static str = "emails";
/// }
///
/// # async fn example() -> QueueResult<()> {
/// let queues = JobQueues::from_env();
///
/// queues
///     .process(|email: Email| async move {
///         println!("Sending email to {}", email.to);
///         Ok::<_, String>(())
///     })
///     .await?;
///
/// queues.enqueue(&Email { to: "user@example.com".into() }, None).await?;
///
/// queues.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct JobQueues {
    connections: ConnectionManager,
    registry: QueueRegistry,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    worker_config: WorkerConfig,
}

impl JobQueues {
    /// Context backed by Redis.
    pub fn new(config: RedisConfig) -> Self {
        let brokers = RedisBrokerConnector::new(config.connection_timeout);
        Self::with_connectors(config, Arc::new(RedisConnector), Arc::new(brokers))
    }

    /// Context configured from `REDIS_*` environment variables.
    ///
    /// A missing `REDIS_URL` is not an error here; the first operation that
    /// needs the broker reports it.
    pub fn from_env() -> Self {
        Self::new(RedisConfig::from_env().build())
    }

    /// Context with custom connection and broker connectors.
    pub fn with_connectors(
        config: RedisConfig,
        connector: Arc<dyn Connector>,
        brokers: Arc<dyn BrokerConnector>,
    ) -> Self {
        Self {
            registry: QueueRegistry::new(config.clone(), brokers),
            connections: ConnectionManager::with_connector(config, connector),
            workers: Mutex::new(HashMap::new()),
            worker_config: WorkerConfig::default(),
        }
    }

    /// Configuration for workers started after this call.
    pub fn with_worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    /// Settings for every queue this context opens.
    pub fn with_queue_defaults(mut self, defaults: QueueConfig) -> Self {
        self.registry = self.registry.with_defaults(defaults);
        self
    }

    /// The shared broker connection, created on first use.
    pub async fn get_connection(&self) -> QueueResult<SharedConnection> {
        Ok(self.connections.get_connection().await?)
    }

    /// Close the shared connection. Does nothing when none is open.
    pub async fn close_connection(&self) -> QueueResult<()> {
        Ok(self.connections.close_connection().await?)
    }

    /// Whether the shared connection is currently open.
    pub async fn is_connected(&self) -> bool {
        self.connections.is_connected().await
    }

    /// Ping the broker over the shared connection.
    pub async fn health_check(&self) -> QueueResult<()> {
        let connection = self.get_connection().await?;
        Ok(connection.ping().await?)
    }

    /// Look up a queue by name, opening it on first use.
    pub async fn get_queue(&self, name: &str) -> QueueResult<Arc<Queue>> {
        self.registry.get_queue(name).await
    }

    /// Names of all open queues.
    pub async fn queue_names(&self) -> Vec<String> {
        self.registry.queue_names().await
    }

    /// Submit a job to a named queue.
    ///
    /// `options` reaches the broker exactly as given. Errors are returned to
    /// the caller without any local retry.
    pub async fn add_job<T: Serialize + ?Sized>(
        &self,
        queue_name: &str,
        payload: &T,
        options: Option<JobOptions>,
    ) -> QueueResult<JobHandle> {
        let queue = self.get_queue(queue_name).await?;
        queue.add(payload, options).await
    }

    /// Submit a typed payload to its own queue.
    pub async fn enqueue<P: JobPayload>(
        &self,
        payload: &P,
        options: Option<JobOptions>,
    ) -> QueueResult<JobHandle> {
        self.add_job(P::QUEUE, payload, options).await
    }

    /// Start a worker that feeds every job on `queue_name` to `consumer`.
    ///
    /// Only one processor may run per queue; a second registration fails
    /// with [`QueueError::ProcessorAlreadyRegistered`].
    pub async fn process_queue<T, R, E, F, Fut>(&self, queue_name: &str, consumer: F) -> QueueResult<()>
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        Self::check_slot(&*self.workers.lock().await, queue_name)?;

        // Opening the queue may wait on the broker; the worker map stays
        // unlocked meanwhile and the slot is checked again before insert.
        let queue = self.get_queue(queue_name).await?;

        let mut workers = self.workers.lock().await;
        Self::check_slot(&workers, queue_name)?;
        if workers.contains_key(queue_name) {
            debug!(queue = %queue_name, "Replacing finished worker");
        }

        let handle = Worker::for_consumer(queue, consumer)
            .with_config(self.worker_config.clone())
            .spawn();
        workers.insert(queue_name.to_string(), handle);

        Ok(())
    }

    fn check_slot(workers: &HashMap<String, WorkerHandle>, queue_name: &str) -> QueueResult<()> {
        match workers.get(queue_name) {
            Some(existing) if !existing.is_finished() => {
                warn!(queue = %queue_name, "Processor already registered, ignoring new one");
                Err(QueueError::ProcessorAlreadyRegistered(queue_name.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Start a worker for a typed payload's queue.
    pub async fn process<P, R, E, F, Fut>(&self, consumer: F) -> QueueResult<()>
    where
        P: JobPayload,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        self.process_queue(P::QUEUE, consumer).await
    }

    /// Whether a worker is running for the queue.
    pub async fn is_processing(&self, queue_name: &str) -> bool {
        self.workers
            .lock()
            .await
            .get(queue_name)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the worker for one queue, waiting for its current job.
    ///
    /// Returns `false` when no worker was registered.
    pub async fn stop_processing(&self, queue_name: &str) -> bool {
        let Some(handle) = self.workers.lock().await.remove(queue_name) else {
            return false;
        };
        handle.stop().await;
        true
    }

    async fn stop_all_workers(&self) {
        let handles: Vec<_> = self.workers.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.stop().await;
        }
    }

    /// Stop the queue's worker, then close and forget the queue.
    pub async fn close_queue(&self, queue_name: &str) -> QueueResult<()> {
        self.stop_processing(queue_name).await;
        self.registry.close_queue(queue_name).await
    }

    /// Stop every worker, then close and forget every queue.
    pub async fn close_all_queues(&self) {
        self.stop_all_workers().await;
        self.registry.close_all_queues().await;
    }

    /// Release everything this context holds.
    ///
    /// Workers finish their current job, queues close, and the shared
    /// connection closes last. Safe to call more than once.
    pub async fn shutdown(&self) -> QueueResult<()> {
        info!("Shutting down job queues");
        self.close_all_queues().await;
        self.close_connection().await?;
        info!("Job queues shut down");
        Ok(())
    }
}
