//! Named job queues and background processing for Taskline.
//!
//! Provides a job queue system with:
//! - 📦 Redis-backed persistence, one client per queue name
//! - 🔌 One shared, lazily opened broker connection per context
//! - 🔄 Broker-side retries with exponential backoff
//! - ⭐ Job priorities
//! - ⏰ Delayed jobs
//! - 💀 Dead letter set for exhausted jobs
//! - 🩺 Recovery of jobs abandoned by a dead worker
//! - 👷 Pull-based workers with error isolation
//!
//! ## Job Options
//!
//! Options travel to the broker exactly as given.
//!
//! ```
//! use taskline_queue::{JobOptions, JobPriority};
//! use std::time::Duration;
//!
//! let options = JobOptions::new()
//!     .delay(Duration::from_millis(1000))
//!     .attempts(3)
//!     .priority(JobPriority::High);
//!
//! assert_eq!(options.attempts, Some(3));
//! assert_eq!(JobOptions::new().delay, None);
//! ```
//!
//! ## Queue Configuration
//!
//! ```
//! use taskline_queue::QueueConfig;
//! use std::time::Duration;
//!
//! let defaults = QueueConfig::default()
//!     .with_namespace("myapp:queue")
//!     .with_max_size(10000)
//!     .with_retention_time(Duration::from_secs(86400));
//!
//! let emails = defaults.named("emails");
//! assert_eq!(emails.key_prefix(), "myapp:queue:emails");
//! assert_eq!(emails.max_size, 10000);
//! ```
//!
//! ## Complete Example
//!
//! ```no_run
//! use taskline_queue::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueueError> {
//!     let queues = JobQueues::from_env();
//!
//!     // Process jobs
//!     queues
//!         .process_queue("emails", |job: serde_json::Value| async move {
//!             println!("Sending email: {}", job);
//!             Ok::<_, String>(())
//!         })
//!         .await?;
//!
//!     // Enqueue a job
//!     let handle = queues
//!         .add_job("emails", &json!({"to": "user@example.com"}), None)
//!         .await?;
//!     println!("Queued job {}", handle.id);
//!
//!     queues.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod error;
pub mod job;
pub mod manager;
pub mod memory;
pub mod queue;
pub mod redis_broker;
pub mod registry;
pub mod worker;

pub use broker::{BrokerConnector, JobCounts, QueueBroker, QueueConfig, STALLED_REASON};
pub use error::{QueueError, QueueResult};
pub use job::{
    Job, JobData, JobHandle, JobId, JobOptions, JobPayload, JobPriority, JobState, NewJob,
};
pub use manager::JobQueues;
pub use memory::{MemoryBroker, MemoryBrokerConnector, MemoryQueue};
pub use queue::Queue;
pub use redis_broker::{RedisBrokerConnector, RedisQueueBroker};
pub use registry::QueueRegistry;
pub use worker::{HandlerFuture, JobHandler, Worker, WorkerConfig, WorkerHandle};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::job::{JobData, JobHandle, JobId, JobOptions, JobPayload, JobPriority};
    pub use crate::manager::JobQueues;
    pub use crate::queue::Queue;
    pub use crate::worker::{Worker, WorkerConfig};
}
