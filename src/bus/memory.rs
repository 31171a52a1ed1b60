//! In-process bus
//!
//! Counters live in a map behind a mutex; pub/sub is a single tokio
//! broadcast channel filtered per subscriber. Several hubs sharing one
//! `Arc<MemoryBus>` behave like several instances sharing one Redis.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use tokio::sync::{broadcast, Mutex};

use super::{Bus, BusError, BusMessage, Subscription};

/// Default capacity of the internal broadcast channel
const DEFAULT_CAPACITY: usize = 1024;

/// In-process implementation of [`Bus`]
pub struct MemoryBus {
    counters: Mutex<HashMap<String, i64>>,
    tx: broadcast::Sender<BusMessage>,
}

impl MemoryBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an empty bus whose subscribers buffer up to `capacity` messages.
    /// A capacity of zero is treated as one.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            counters: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Current value of a counter (0 if never touched)
    pub async fn counter(&self, key: &str) -> i64 {
        self.counters.lock().await.get(key).copied().unwrap_or(0)
    }

    async fn add(&self, key: &str, delta: i64) -> i64 {
        let mut counters = self.counters.lock().await;
        let value = counters.entry(key.to_string()).or_insert(0);
        *value += delta;
        *value
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn incr(&self, key: &str) -> Result<i64, BusError> {
        Ok(self.add(key, 1).await)
    }

    async fn decr(&self, key: &str) -> Result<i64, BusError> {
        Ok(self.add(key, -1).await)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        // No receivers is not an error, same as PUBLISH returning 0
        let _ = self.tx.send(BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, BusError> {
        let rx = self.tx.subscribe();
        let channels: HashSet<String> = channels.iter().cloned().collect();

        let subscription = stream::unfold((rx, channels), |(mut rx, channels)| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) if channels.contains(&msg.channel) => {
                        return Some((msg, (rx, channels)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Memory bus subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(subscription.boxed())
    }
}
