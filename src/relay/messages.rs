//! Relay Message Types
//!
//! The JSON shape delivered to clients, the frames read from them, and the
//! count update payload carried on the bus.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel every chat message is published on
pub const NEW_MESSAGE_CHANNEL: &str = "chat:new-message";

/// Key of the shared connection counter
pub const CONNECTION_COUNT_KEY: &str = "chat:connection-count";

/// Channel carrying the counter's new value after every change
pub const CONNECTION_COUNT_UPDATE_CHANNEL: &str = "chat:connection-count-updated";

/// Message delivered to clients.
///
/// This exact shape is the compatibility contract with existing clients:
/// `{"channelName": ..., "message": ..., "id": ..., "port": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    /// Bus channel the payload arrived on
    pub channel_name: String,
    /// Payload, verbatim as published
    pub message: String,
    /// Unique per delivery
    pub id: String,
    /// Origin tag of the delivering instance
    pub port: String,
}

impl BroadcastMessage {
    /// Wrap a bus payload for delivery, minting a fresh id
    pub fn wrap(channel_name: &str, message: &str, port: &str) -> Self {
        Self {
            channel_name: channel_name.to_string(),
            message: message.to_string(),
            id: Uuid::new_v4().to_string(),
            port: port.to_string(),
        }
    }
}

/// A frame read from a client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Chat payload to publish
    Text(String),
    /// Ping/pong and other keepalive traffic
    Control,
    /// Client asked to close the connection
    Close,
}

impl Frame {
    /// Binary frames are relayed as text, invalid UTF-8 is replaced
    pub fn from_binary(bytes: &[u8]) -> Self {
        Frame::Text(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// New value of the shared connection counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountUpdate {
    pub count: i64,
}

impl CountUpdate {
    pub fn new(count: i64) -> Self {
        Self { count }
    }

    /// Bus payload: the count as a decimal string
    pub fn to_payload(&self) -> String {
        self.count.to_string()
    }

    /// Parse a bus payload, `None` if it is not an integer
    pub fn parse(payload: &str) -> Option<Self> {
        payload.trim().parse().ok().map(Self::new)
    }
}
