//! Shared Broadcast Bus
//!
//! The bus is the only state shared between relay instances. It offers
//! two things: atomic counters keyed by name, and fire-and-forget
//! publish/subscribe on named channels.
//!
//! ## Backends
//!
//! - **RedisBus**: `INCR`/`DECR`/`PUBLISH`/`SUBSCRIBE` against a Redis server
//! - **MemoryBus**: in-process, for single-instance mode and tests
//!
//! Bus failures are never fatal to a chat session. Callers route every
//! call through a [`FailurePolicy`] that either logs the failure or
//! retries with backoff.

mod memory;
mod policy;
mod redis_bus;

pub use memory::MemoryBus;
pub use policy::FailurePolicy;
pub use redis_bus::RedisBus;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

/// URI scheme that selects the in-process bus
pub const MEMORY_SCHEME: &str = "memory://";

/// A payload delivered on a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Channel the payload was published on
    pub channel: String,
    /// Opaque payload, published verbatim
    pub payload: String,
}

/// Stream of delivered payloads. Ends when the bus connection closes.
pub type Subscription = BoxStream<'static, BusMessage>;

/// Publish/subscribe and atomic counter primitives
#[async_trait]
pub trait Bus: Send + Sync {
    /// Atomically increment `key` and return the new value
    async fn incr(&self, key: &str) -> Result<i64, BusError>;

    /// Atomically decrement `key` and return the new value
    async fn decr(&self, key: &str) -> Result<i64, BusError>;

    /// Publish `payload` on `channel`
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;

    /// Subscribe to every channel in `channels`
    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, BusError>;
}

/// Connect to the bus named by `uri`.
///
/// `memory://` selects a fresh [`MemoryBus`]; anything else is handed to
/// [`RedisBus::connect`].
pub async fn connect(uri: &str) -> Result<Arc<dyn Bus>, BusError> {
    if uri.starts_with(MEMORY_SCHEME) {
        tracing::info!("Using in-process memory bus");
        return Ok(Arc::new(MemoryBus::new()));
    }

    let bus = RedisBus::connect(uri).await?;
    Ok(Arc::new(bus))
}

/// Errors returned by bus operations
#[derive(Debug, Error)]
pub enum BusError {
    /// Redis command or connection failure
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Bus could not be reached
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    /// Bus connection was closed
    #[error("Bus connection closed")]
    Closed,
}
