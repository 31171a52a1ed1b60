//! Chat Relay Core
//!
//! Bridges client WebSocket connections to the shared bus so that a message
//! sent to any instance reaches every client on every instance.
//!
//! ## Architecture
//!
//! - **RelayHub**: one per instance; owns the bus subscription, the local
//!   fan-out and the session registry
//! - **Session**: one per client; an inbound and an outbound task
//! - **ConnectionCounter**: the shared connection count and its leases
//! - **Handler**: WebSocket upgrade at `/ws`
//! - **Messages**: wire shape and bus payloads
//!
//! ## Wire format
//!
//! Clients send plain text frames. Every frame is published verbatim and
//! delivered back to all clients (sender included) as:
//!
//! ```json
//! {"channelName": "chat:new-message", "message": "hello", "id": "<uuid>", "port": "8080"}
//! ```

mod counter;
mod handler;
mod hub;
mod messages;
mod session;

pub use counter::{ConnectionCounter, CounterLease};
pub use handler::websocket_handler;
pub use hub::{Deliveries, HubConfig, HubError, HubStats, RelayHub};
pub use messages::{
    BroadcastMessage, CountUpdate, Frame, CONNECTION_COUNT_KEY, CONNECTION_COUNT_UPDATE_CHANNEL,
    NEW_MESSAGE_CHANNEL,
};
pub use session::{Session, SessionId, SessionState, TransportError};
