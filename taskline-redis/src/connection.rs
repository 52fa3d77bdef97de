//! The shared broker connection.
//!
//! [`ConnectionManager`] owns at most one live connection. It is created on
//! first use, watched by a background health check, and torn down with a
//! graceful `QUIT`. After [`ConnectionManager::close_connection`] the slot is
//! empty again and the next [`ConnectionManager::get_connection`] builds a
//! fresh connection.

use async_trait::async_trait;
use redis::aio::ConnectionManager as RedisConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{RedisConfig, RedisError, Result};

/// A live connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Round-trip a `PING`.
    async fn ping(&self) -> Result<()>;

    /// Ask the server to close the connection.
    async fn quit(&self) -> Result<()>;

    /// The underlying Redis connection, when this is one.
    fn as_redis(&self) -> Option<&RedisConnection> {
        None
    }
}

/// Shared handle to the process connection.
pub type SharedConnection = Arc<dyn BrokerConnection>;

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection using the given configuration.
    async fn connect(&self, config: &RedisConfig) -> Result<SharedConnection>;
}

/// Connection backed by redis-rs' auto-reconnecting connection manager.
#[derive(Clone)]
pub struct RedisConnection {
    manager: RedisConnectionManager,
}

impl RedisConnection {
    /// A cloned handle for issuing arbitrary commands.
    pub fn manager(&self) -> RedisConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl BrokerConnection for RedisConnection {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn quit(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("QUIT").query_async(&mut conn).await?;
        Ok(())
    }

    fn as_redis(&self) -> Option<&RedisConnection> {
        Some(self)
    }
}

/// Default connector: one redis-rs connection manager per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisConnector;

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self, config: &RedisConfig) -> Result<SharedConnection> {
        let url = config.connection_url()?;
        let client =
            redis::Client::open(url.as_str()).map_err(|e| RedisError::Config(e.to_string()))?;

        let manager =
            tokio::time::timeout(config.connection_timeout, RedisConnectionManager::new(client))
                .await
                .map_err(|_| RedisError::Timeout)??;

        Ok(Arc::new(RedisConnection { manager }))
    }
}

struct Slot {
    connection: SharedConnection,
    observer: Option<JoinHandle<()>>,
}

/// Owner of the single shared broker connection.
pub struct ConnectionManager {
    config: RedisConfig,
    connector: Arc<dyn Connector>,
    slot: Mutex<Option<Slot>>,
}

impl ConnectionManager {
    /// Manager that connects to Redis.
    pub fn new(config: RedisConfig) -> Self {
        Self::with_connector(config, Arc::new(RedisConnector))
    }

    /// Manager with a custom connector.
    pub fn with_connector(config: RedisConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            slot: Mutex::new(None),
        }
    }

    /// The configuration connections are built from.
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Return the shared connection, creating it on first use.
    ///
    /// Fails with [`RedisError::Config`] before any network I/O when no
    /// broker address is configured.
    pub async fn get_connection(&self) -> Result<SharedConnection> {
        let mut slot = self.slot.lock().await;

        if let Some(existing) = slot.as_ref() {
            return Ok(existing.connection.clone());
        }

        self.config.require_url()?;

        debug!(url = %self.config.redacted_url(), "Opening shared Redis connection");
        let connection = self.connector.connect(&self.config).await?;
        let observer = spawn_fault_observer(connection.clone(), self.config.health_check_interval);

        info!(url = %self.config.redacted_url(), "Shared Redis connection ready");

        *slot = Some(Slot {
            connection: connection.clone(),
            observer,
        });

        Ok(connection)
    }

    /// Gracefully close the shared connection, if one exists.
    ///
    /// The slot is cleared even when `QUIT` fails. Calling this with no open
    /// connection does nothing.
    pub async fn close_connection(&self) -> Result<()> {
        let Some(slot) = self.slot.lock().await.take() else {
            return Ok(());
        };

        if let Some(observer) = slot.observer {
            observer.abort();
        }

        let result = slot.connection.quit().await;
        match &result {
            Ok(()) => info!("Shared Redis connection closed"),
            Err(e) => warn!(error = %e, "Redis QUIT failed, dropping connection"),
        }
        result
    }

    /// Whether a shared connection is currently held.
    pub async fn is_connected(&self) -> bool {
        self.slot.lock().await.is_some()
    }
}

/// Watch a connection in the background and log faults.
///
/// Faults never reach callers; the redis-rs manager reconnects on its own.
fn spawn_fault_observer(connection: SharedConnection, interval: Duration) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;

        let mut healthy = true;
        loop {
            ticker.tick().await;
            match connection.ping().await {
                Ok(()) => {
                    if !healthy {
                        info!("Redis connection recovered");
                        healthy = true;
                    }
                }
                Err(e) if healthy => {
                    error!(error = %e, "Redis connection error");
                    healthy = false;
                }
                Err(e) => debug!(error = %e, "Redis connection still failing"),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubConnector;

    fn config() -> RedisConfig {
        RedisConfig::builder()
            .url("redis://localhost:6379")
            .health_check_interval(Duration::ZERO)
            .build()
    }

    #[tokio::test]
    async fn test_missing_url_fails_without_connecting() {
        let connector = Arc::new(StubConnector::new());
        let manager = ConnectionManager::with_connector(RedisConfig::default(), connector.clone());

        let err = manager.get_connection().await.err().unwrap();

        assert!(err.is_config_error());
        assert_eq!(connector.connects(), 0);
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_connection_is_reused() {
        let connector = Arc::new(StubConnector::new());
        let manager = ConnectionManager::with_connector(config(), connector.clone());

        let first = manager.get_connection().await.unwrap();
        let second = manager.get_connection().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_connects_once() {
        let connector = Arc::new(StubConnector::new());
        let manager = Arc::new(ConnectionManager::with_connector(config(), connector.clone()));

        let a = tokio::spawn({
            let manager = manager.clone();
            async move { manager.get_connection().await.unwrap() }
        });
        let b = tokio::spawn({
            let manager = manager.clone();
            async move { manager.get_connection().await.unwrap() }
        });

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_close_without_connection_is_noop() {
        let connector = Arc::new(StubConnector::new());
        let manager = ConnectionManager::with_connector(config(), connector.clone());

        manager.close_connection().await.unwrap();
        manager.close_connection().await.unwrap();

        assert_eq!(connector.connects(), 0);
        assert_eq!(connector.quits(), 0);
    }

    #[tokio::test]
    async fn test_close_quits_once_and_resets_slot() {
        let connector = Arc::new(StubConnector::new());
        let manager = ConnectionManager::with_connector(config(), connector.clone());

        let first = manager.get_connection().await.unwrap();
        manager.close_connection().await.unwrap();
        manager.close_connection().await.unwrap();

        assert_eq!(connector.quits(), 1);
        assert!(!manager.is_connected().await);

        let second = manager.get_connection().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_failed_quit_still_clears_slot() {
        let connector = Arc::new(StubConnector::new().failing_quit());
        let manager = ConnectionManager::with_connector(config(), connector.clone());

        manager.get_connection().await.unwrap();
        assert!(manager.close_connection().await.is_err());
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_slot_empty() {
        let connector = Arc::new(StubConnector::new().refusing());
        let manager = ConnectionManager::with_connector(config(), connector.clone());

        assert!(manager.get_connection().await.is_err());
        assert!(!manager.is_connected().await);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_observer_pings_without_failing_callers() {
        let connector = Arc::new(StubConnector::new().failing_ping());
        let config = RedisConfig::builder()
            .url("redis://localhost:6379")
            .health_check_interval(Duration::from_secs(1))
            .build();
        let manager = ConnectionManager::with_connector(config, connector.clone());

        manager.get_connection().await.unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert!(connector.pings() >= 3);
        assert!(manager.get_connection().await.is_ok());

        manager.close_connection().await.unwrap();
        let pings = connector.pings();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.pings(), pings);
    }
}
