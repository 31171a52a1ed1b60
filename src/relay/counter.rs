//! Connection Counter Protocol
//!
//! The total number of open sessions across all instances lives in one
//! shared integer, mutated only by atomic increment/decrement on the bus.
//! Every change is republished on the count channel.
//!
//! A session holds a [`CounterLease`] from the moment it is counted. The
//! lease decrements exactly once: through [`CounterLease::release`], or
//! from its `Drop` if release never ran.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use crate::bus::{Bus, FailurePolicy};

use super::messages::CountUpdate;

/// Shared connection counter on the bus
pub struct ConnectionCounter {
    bus: Arc<dyn Bus>,
    key: String,
    channel: String,
    policy: FailurePolicy,
    /// Most recent total seen from our own calls or count updates
    last_known: AtomicI64,
}

impl ConnectionCounter {
    pub fn new(
        bus: Arc<dyn Bus>,
        key: impl Into<String>,
        channel: impl Into<String>,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            bus,
            key: key.into(),
            channel: channel.into(),
            policy,
            last_known: AtomicI64::new(0),
        }
    }

    /// Count a new connection.
    ///
    /// Never fails: if the increment does not go through, the returned lease
    /// is uncounted and its release will not decrement.
    pub async fn acquire(self: &Arc<Self>) -> CounterLease {
        let counted = match self.policy.run("incr", || self.bus.incr(&self.key)).await {
            Ok(count) => {
                self.announce(count).await;
                true
            }
            Err(e) => {
                tracing::error!(
                    key = %self.key,
                    error = %e,
                    "Connection not counted, shared count will drift"
                );
                false
            }
        };

        CounterLease {
            counter: Arc::clone(self),
            counted,
            released: AtomicBool::new(false),
        }
    }

    /// Most recent total observed by this instance
    pub fn last_known(&self) -> i64 {
        self.last_known.load(Ordering::Relaxed)
    }

    /// Record a total seen on the count channel
    pub fn observe(&self, count: i64) {
        self.last_known.store(count, Ordering::Relaxed);
    }

    async fn decrement(&self) -> Option<i64> {
        match self.policy.run("decr", || self.bus.decr(&self.key)).await {
            Ok(count) => {
                self.announce(count).await;
                Some(count)
            }
            Err(e) => {
                tracing::error!(
                    key = %self.key,
                    error = %e,
                    "Disconnect not counted, shared count will drift"
                );
                None
            }
        }
    }

    /// Publish the new total. Best-effort.
    async fn announce(&self, count: i64) {
        self.observe(count);

        let payload = CountUpdate::new(count).to_payload();
        if let Err(e) = self
            .policy
            .run("publish count", || self.bus.publish(&self.channel, &payload))
            .await
        {
            tracing::warn!(count, error = %e, "Count update not published");
        } else {
            tracing::debug!(count, "Connection count updated");
        }
    }
}

/// Proof that one connection was counted
pub struct CounterLease {
    counter: Arc<ConnectionCounter>,
    counted: bool,
    released: AtomicBool,
}

impl CounterLease {
    /// Whether the increment reached the store
    pub fn is_counted(&self) -> bool {
        self.counted
    }

    /// Decrement the counter. Only the first call has any effect.
    ///
    /// Returns the new total when a decrement actually happened.
    pub async fn release(&self) -> Option<i64> {
        if self.released.swap(true, Ordering::AcqRel) || !self.counted {
            return None;
        }
        self.counter.decrement().await
    }
}

impl Drop for CounterLease {
    fn drop(&mut self) {
        if !self.counted || self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let counter = Arc::clone(&self.counter);
                handle.spawn(async move {
                    counter.decrement().await;
                });
            }
            Err(_) => {
                tracing::error!("Counter lease dropped outside a runtime, count will drift");
            }
        }
    }
}
