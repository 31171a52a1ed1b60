//! Redis-backed bus
//!
//! Commands share one multiplexed connection. Each subscription opens its
//! own pub/sub connection, as Redis requires.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use super::{Bus, BusError, BusMessage, Subscription};

/// [`Bus`] implementation on top of a Redis server
pub struct RedisBus {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisBus {
    /// Connect to the server at `uri`.
    ///
    /// Accepts full `redis://` / `rediss://` URLs as well as a bare
    /// `host:port` address.
    pub async fn connect(uri: &str) -> Result<Self, BusError> {
        let url = normalize_uri(uri);
        let client = redis::Client::open(url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;

        tracing::info!(uri = %url, "Connected to Redis bus");
        Ok(Self { client, conn })
    }
}

/// Turn a bare `host:port` address into a `redis://` URL
pub(crate) fn normalize_uri(uri: &str) -> String {
    let uri = uri.trim();
    if uri.contains("://") || uri.starts_with("unix:") {
        uri.to_string()
    } else {
        format!("redis://{}", uri)
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn incr(&self, key: &str) -> Result<i64, BusError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1i64).await?;
        Ok(value)
    }

    async fn decr(&self, key: &str) -> Result<i64, BusError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.decr(key, 1i64).await?;
        Ok(value)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _receivers: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel.as_str()).await?;
        }

        tracing::debug!(channels = ?channels, "Subscribed to Redis channels");

        let subscription = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(BusMessage { channel, payload }),
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "Dropping undecodable bus payload");
                    None
                }
            }
        });

        Ok(subscription.boxed())
    }
}
