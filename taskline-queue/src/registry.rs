//! Name to queue registry.

use std::collections::HashMap;
use std::sync::Arc;
use taskline_redis::RedisConfig;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::broker::{BrokerConnector, QueueConfig};
use crate::error::QueueResult;
use crate::queue::Queue;

type Slot = Arc<OnceCell<Arc<Queue>>>;

/// Holds exactly one live [`Queue`] per name.
///
/// Each name gets its own broker client opened against the configured
/// broker address. The map lock only guards slot lookup; opening a client
/// happens inside the name's own slot, so a slow open never blocks other
/// names.
pub struct QueueRegistry {
    redis: RedisConfig,
    defaults: QueueConfig,
    connector: Arc<dyn BrokerConnector>,
    queues: Mutex<HashMap<String, Slot>>,
}

impl QueueRegistry {
    /// Empty registry.
    pub fn new(redis: RedisConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            redis,
            defaults: QueueConfig::default(),
            connector,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Settings applied to every queue this registry opens.
    pub fn with_defaults(mut self, defaults: QueueConfig) -> Self {
        self.defaults = defaults;
        self
    }

    /// Look up a queue, opening it on first use.
    ///
    /// Concurrent callers asking for the same new name wait on one open and
    /// share its queue.
    pub async fn get_queue(&self, name: &str) -> QueueResult<Arc<Queue>> {
        loop {
            let slot = self.slot(name).await;

            let queue = match slot.get_or_try_init(|| self.open(name)).await {
                Ok(queue) => queue.clone(),
                Err(e) => {
                    let mut queues = self.queues.lock().await;
                    if queues.get(name).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                        queues.remove(name);
                    }
                    return Err(e);
                }
            };

            // The slot may have been dropped by a close while it was opening.
            let mut queues = self.queues.lock().await;
            match queues.get(name).map(|current| Arc::ptr_eq(current, &slot)) {
                Some(true) => return Ok(queue),
                None => {
                    queues.insert(name.to_string(), slot);
                    return Ok(queue);
                }
                Some(false) => {
                    drop(queues);
                    debug!(queue = %name, "Discarding queue superseded while opening");
                    if let Err(e) = queue.close().await {
                        warn!(queue = %name, error = %e, "Failed to close queue");
                    }
                }
            }
        }
    }

    async fn slot(&self, name: &str) -> Slot {
        let mut queues = self.queues.lock().await;

        if let Some(slot) = queues.get(name) {
            if !slot.get().is_some_and(|queue| queue.is_closed()) {
                return slot.clone();
            }
            debug!(queue = %name, "Replacing closed queue");
        }

        let slot = Slot::default();
        queues.insert(name.to_string(), slot.clone());
        slot
    }

    async fn open(&self, name: &str) -> QueueResult<Arc<Queue>> {
        let url = self.redis.connection_url()?;
        let broker = self.connector.open(&url, self.defaults.named(name)).await?;

        info!(queue = %name, "Queue registered");
        Ok(Arc::new(Queue::new(name, broker)))
    }

    /// Close one queue and forget it. Unknown names are ignored.
    pub async fn close_queue(&self, name: &str) -> QueueResult<()> {
        let Some(slot) = self.queues.lock().await.remove(name) else {
            return Ok(());
        };
        if let Some(queue) = slot.get() {
            queue.close().await?;
        }
        Ok(())
    }

    /// Close every registered queue and empty the registry.
    ///
    /// Each entry is closed once; already-closed queues are skipped and close
    /// errors are logged without stopping the sweep.
    pub async fn close_all_queues(&self) {
        let drained: Vec<(String, Slot)> = self.queues.lock().await.drain().collect();

        for (name, slot) in drained {
            let Some(queue) = slot.get() else {
                continue;
            };
            match queue.close().await {
                Ok(true) => debug!(queue = %name, "Queue closed"),
                Ok(false) => debug!(queue = %name, "Queue was already closed"),
                Err(e) => warn!(queue = %name, error = %e, "Failed to close queue"),
            }
        }
    }

    /// Names of all registered queues.
    pub async fn queue_names(&self) -> Vec<String> {
        self.queues
            .lock()
            .await
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Number of registered queues.
    pub async fn len(&self) -> usize {
        self.queues
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Whether no queue is registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
