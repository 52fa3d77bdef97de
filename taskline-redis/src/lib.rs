//! # Taskline Redis
//!
//! Shared Redis connection management for Taskline.
//!
//! ## Features
//!
//! - **Lazy connection**: nothing touches the network until the first caller needs it
//! - **Typed configuration errors**: a missing `REDIS_URL` is reported to that first caller
//! - **Fault observation**: a background ping logs connection faults instead of raising them
//! - **Graceful shutdown**: `QUIT` on close, and the slot resets for the next use
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use taskline_redis::{ConnectionManager, RedisConfig};
//!
//! # async fn example() -> taskline_redis::Result<()> {
//! let manager = ConnectionManager::new(RedisConfig::from_env().build());
//!
//! let connection = manager.get_connection().await?;
//! connection.ping().await?;
//!
//! manager.close_connection().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod error;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{REDIS_URL_VAR, RedisConfig, RedisConfigBuilder};
pub use connection::{
    BrokerConnection, ConnectionManager, Connector, RedisConnection, RedisConnector,
    SharedConnection,
};
pub use error::{RedisError, Result};

// Re-export redis crate for convenience
pub use redis;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::config::{RedisConfig, RedisConfigBuilder};
    pub use crate::connection::{BrokerConnection, ConnectionManager, Connector, SharedConnection};
    pub use crate::error::{RedisError, Result};
}
