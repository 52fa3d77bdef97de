//! Error types for queue operations.

use taskline_redis::RedisError;
use thiserror::Error;

use crate::job::JobId;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-specific errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Broker address missing or malformed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared connection error
    #[error("Connection error: {0}")]
    Connection(#[source] RedisError),

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Broker-side failure that is not a Redis error
    #[error("Broker error: {0}")]
    Broker(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Job options that cannot be honored
    #[error("Invalid job options: {0}")]
    InvalidOptions(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// The consumer failed while handling a delivered job
    #[error("Job {job_id} failed in queue '{queue}': {reason}")]
    Processing {
        /// Queue the job was delivered from
        queue: String,
        /// Failed job
        job_id: JobId,
        /// Consumer error message
        reason: String,
    },

    /// A processor is already registered for this queue
    #[error("A processor is already registered for queue '{0}'")]
    ProcessorAlreadyRegistered(String),

    /// Queue has been closed
    #[error("Queue '{0}' is closed")]
    Closed(String),

    /// Queue is full
    #[error("Queue '{0}' is full")]
    QueueFull(String),

    /// Connection timeout
    #[error("Operation timeout")]
    Timeout,
}

impl QueueError {
    /// Check if this is a configuration error.
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Check if this is a consumer failure.
    pub fn is_processing_error(&self) -> bool {
        matches!(self, Self::Processing { .. })
    }
}

impl From<RedisError> for QueueError {
    fn from(err: RedisError) -> Self {
        match err {
            RedisError::Config(msg) => Self::Config(msg),
            RedisError::Redis(e) => Self::Redis(e),
            RedisError::Timeout => Self::Timeout,
            RedisError::Serialization(msg) => Self::Serialization(msg),
            other => Self::Connection(other),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
