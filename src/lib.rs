//! # Taskline
//!
//! Named Redis job queues behind one explicitly owned context.
//!
//! - [`redis`] holds the configuration and the shared connection manager.
//! - [`queue`] holds jobs, queues, workers and the [`JobQueues`](queue::JobQueues)
//!   context that ties them together (enabled by the default `queue` feature).
//!
//! ```no_run
//! use taskline::prelude::*;
//!
//! # async fn example() -> QueueResult<()> {
//! let queues = JobQueues::from_env();
//! queues.add_job("emails", &serde_json::json!({"to": "user@example.com"}), None).await?;
//! queues.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub use taskline_redis as redis;

#[cfg(feature = "queue")]
pub use taskline_queue as queue;

/// Commonly used types from every enabled crate.
pub mod prelude {
    pub use taskline_redis::{ConnectionManager, RedisConfig, RedisError};

    #[cfg(feature = "queue")]
    pub use taskline_queue::prelude::*;
}
