//! Connection test doubles.
//!
//! Enabled for this crate's own tests and, through the `testing` feature,
//! for downstream crates that need a [`ConnectionManager`](crate::ConnectionManager)
//! without a Redis server.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{BrokerConnection, Connector, RedisConfig, RedisError, Result, SharedConnection};

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    pings: AtomicUsize,
    quits: AtomicUsize,
}

/// Connector that hands out in-memory connections and counts what happens to them.
#[derive(Clone, Default)]
pub struct StubConnector {
    counters: Arc<Counters>,
    refuse: bool,
    fail_ping: bool,
    fail_quit: bool,
}

impl StubConnector {
    /// A connector whose connections always succeed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `connect` fails with a connection error.
    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    /// Connections answer `PING` with an error.
    pub fn failing_ping(mut self) -> Self {
        self.fail_ping = true;
        self
    }

    /// Connections answer `QUIT` with an error.
    pub fn failing_quit(mut self) -> Self {
        self.fail_quit = true;
        self
    }

    /// Number of `connect` calls, including refused ones.
    pub fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    /// Number of `PING`s across all connections.
    pub fn pings(&self) -> usize {
        self.counters.pings.load(Ordering::SeqCst)
    }

    /// Number of `QUIT`s across all connections.
    pub fn quits(&self) -> usize {
        self.counters.quits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(&self, config: &RedisConfig) -> Result<SharedConnection> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        config.connection_url()?;

        if self.refuse {
            return Err(RedisError::Connection("connection refused".into()));
        }

        Ok(Arc::new(StubConnection {
            counters: self.counters.clone(),
            fail_ping: self.fail_ping,
            fail_quit: self.fail_quit,
        }))
    }
}

struct StubConnection {
    counters: Arc<Counters>,
    fail_ping: bool,
    fail_quit: bool,
}

#[async_trait]
impl BrokerConnection for StubConnection {
    async fn ping(&self) -> Result<()> {
        self.counters.pings.fetch_add(1, Ordering::SeqCst);
        if self.fail_ping {
            Err(RedisError::Connection("broken pipe".into()))
        } else {
            Ok(())
        }
    }

    async fn quit(&self) -> Result<()> {
        self.counters.quits.fetch_add(1, Ordering::SeqCst);
        if self.fail_quit {
            Err(RedisError::Command("QUIT rejected".into()))
        } else {
            Ok(())
        }
    }
}
