//! Connection Session
//!
//! One accepted duplex connection and the two tasks that bridge it to the
//! hub: inbound (client -> bus) and outbound (hub fan-out -> client).
//!
//! ## Lifecycle
//!
//! `Accepted -> Active -> Closing -> Closed`, strictly forward. Either task
//! ending cancels the session token, which unblocks the other one.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::hub::{Deliveries, RelayHub};
use super::messages::{BroadcastMessage, Frame};

/// Unique identifier for a session
pub type SessionId = Uuid;

/// Upper bound on flushing the close frame during teardown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    Accepted = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Accepted,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// One client connection owned by a hub
pub struct Session {
    id: SessionId,
    state: AtomicU8,
    cancel: CancellationToken,
}

impl Session {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: AtomicU8::new(SessionState::Accepted as u8),
            cancel,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Accepted -> Active. Fails once the session started closing.
    pub(crate) fn activate(&self) -> bool {
        self.transition(SessionState::Accepted, SessionState::Active)
    }

    /// Accepted/Active -> Closing. True only for the first caller.
    pub(crate) fn begin_close(&self) -> bool {
        self.transition(SessionState::Active, SessionState::Closing)
            || self.transition(SessionState::Accepted, SessionState::Closing)
    }

    /// Closing -> Closed
    pub(crate) fn finish_close(&self) -> bool {
        self.transition(SessionState::Closing, SessionState::Closed)
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Signal both forwarding tasks to stop
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Errors from the client-facing stream
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Read failed: {0}")]
    Read(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Connection closed")]
    Closed,
}

/// Read frames from the client and publish them on the message channel.
///
/// Ends on read error, end of stream, a close frame, or cancellation. Bus
/// failures are logged by the hub and do not end the session.
pub(crate) async fn forward_inbound<S>(session: Arc<Session>, hub: Arc<RelayHub>, mut inbound: S)
where
    S: Stream<Item = Result<Frame, TransportError>> + Unpin,
{
    let token = session.token().clone();

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = inbound.next() => next,
        };

        match next {
            Some(Ok(Frame::Text(text))) => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = hub.publish_message(&text) => {}
                }
            }
            Some(Ok(Frame::Control)) => {}
            Some(Ok(Frame::Close)) => {
                tracing::debug!(session_id = %session.id(), "Client requested close");
                break;
            }
            Some(Err(e)) => {
                tracing::debug!(session_id = %session.id(), error = %e, "Session read failed");
                break;
            }
            None => {
                tracing::debug!(session_id = %session.id(), "Session stream ended");
                break;
            }
        }
    }

    hub.close_session(session.id()).await;
}

/// Deliver every fanned-out bus message to the client.
///
/// Each delivery is wrapped with a fresh id and this instance's origin tag.
/// Ends on write error, hub shutdown, or cancellation.
pub(crate) async fn forward_outbound<K>(
    session: Arc<Session>,
    hub: Arc<RelayHub>,
    mut deliveries: Deliveries,
    mut outbound: K,
) where
    K: Sink<String, Error = TransportError> + Unpin,
{
    let token = session.token().clone();

    loop {
        let delivery = tokio::select! {
            _ = token.cancelled() => break,
            delivery = deliveries.recv() => delivery,
        };

        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(
                    session_id = %session.id(),
                    skipped,
                    "Session fell behind, messages dropped"
                );
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let message = BroadcastMessage::wrap(&delivery.channel, &delivery.payload, hub.origin());
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize message");
                continue;
            }
        };

        let sent = tokio::select! {
            _ = token.cancelled() => break,
            sent = outbound.send(text) => sent,
        };
        if let Err(e) = sent {
            tracing::debug!(session_id = %session.id(), error = %e, "Session write failed");
            break;
        }
    }

    drop(deliveries);
    if tokio::time::timeout(CLOSE_TIMEOUT, outbound.close()).await.is_err() {
        tracing::debug!(session_id = %session.id(), "Timed out closing session stream");
    }

    hub.close_session(session.id()).await;
}
