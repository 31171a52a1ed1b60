//! Relay Hub
//!
//! Per-instance coordinator between client sessions and the shared bus.
//! Holds one bus subscription for the whole instance and fans every
//! delivered payload out to local sessions through a tokio broadcast
//! channel. Counts sessions in and out of the shared connection counter.

use futures_util::{Sink, Stream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::counter::{ConnectionCounter, CounterLease};
use super::messages::{
    CountUpdate, Frame, CONNECTION_COUNT_KEY, CONNECTION_COUNT_UPDATE_CHANNEL,
    NEW_MESSAGE_CHANNEL,
};
use super::session::{self, Session, SessionId, SessionState, TransportError};
use crate::bus::{Bus, BusMessage, FailurePolicy};

/// A session's view of the local fan-out
pub type Deliveries = broadcast::Receiver<Arc<BusMessage>>;

const RESUBSCRIBE_BASE_DELAY: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(5);

/// Configuration for the relay hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Channel chat messages are published on
    pub message_channel: String,
    /// Key of the shared connection counter
    pub count_key: String,
    /// Channel count updates are published on
    pub count_channel: String,
    /// Origin tag stamped on every delivered message
    pub origin: String,
    /// Messages buffered per session before it starts dropping
    pub fanout_capacity: usize,
    /// Maximum number of concurrent sessions on this instance
    pub max_connections: usize,
    /// Also deliver count updates to clients
    pub forward_count_updates: bool,
    /// Failure handling for bus calls
    pub policy: FailurePolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            message_channel: NEW_MESSAGE_CHANNEL.to_string(),
            count_key: CONNECTION_COUNT_KEY.to_string(),
            count_channel: CONNECTION_COUNT_UPDATE_CHANNEL.to_string(),
            origin: String::new(),
            fanout_capacity: 1024,
            max_connections: 10_000,
            forward_count_updates: false,
            policy: FailurePolicy::LogOnly,
        }
    }
}

/// Snapshot of hub activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Sessions open on this instance
    pub local_connections: usize,
    /// Last total seen on the shared counter
    pub total_connections: i64,
}

struct SessionEntry {
    session: Arc<Session>,
    lease: CounterLease,
    /// Connection slot, returned when the entry is dropped
    _slot: OwnedSemaphorePermit,
}

/// Bridges local sessions to the shared bus
pub struct RelayHub {
    bus: Arc<dyn Bus>,
    config: HubConfig,
    counter: Arc<ConnectionCounter>,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    slots: Arc<Semaphore>,
    /// Opens and teardowns in flight; shutdown waits for them
    teardown: TaskTracker,
    fanout: broadcast::Sender<Arc<BusMessage>>,
    subscribed: watch::Sender<bool>,
    shutdown: CancellationToken,
}

impl RelayHub {
    /// Create a hub on top of an injected bus handle
    pub fn new(bus: Arc<dyn Bus>, config: HubConfig) -> Arc<Self> {
        let (fanout, _) = broadcast::channel(config.fanout_capacity.max(1));
        let (subscribed, _) = watch::channel(false);
        let slots = Arc::new(Semaphore::new(
            config.max_connections.min(Semaphore::MAX_PERMITS),
        ));
        let counter = Arc::new(ConnectionCounter::new(
            Arc::clone(&bus),
            config.count_key.clone(),
            config.count_channel.clone(),
            config.policy.clone(),
        ));

        Arc::new(Self {
            bus,
            config,
            counter,
            sessions: RwLock::new(HashMap::new()),
            slots,
            teardown: TaskTracker::new(),
            fanout,
            subscribed,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Origin tag stamped on deliveries from this instance
    pub fn origin(&self) -> &str {
        &self.config.origin
    }

    /// Start the subscription pump that feeds local sessions
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move { hub.pump().await })
    }

    /// Wait until the pump holds a live bus subscription
    pub async fn wait_subscribed(&self) {
        let mut rx = self.subscribed.subscribe();
        let _ = rx.wait_for(|subscribed| *subscribed).await;
    }

    pub fn is_subscribed(&self) -> bool {
        *self.subscribed.borrow()
    }

    async fn pump(&self) {
        let mut channels = vec![self.config.message_channel.clone()];
        if self.config.count_channel != self.config.message_channel {
            channels.push(self.config.count_channel.clone());
        }
        let mut failures: u32 = 0;

        loop {
            let subscription = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                subscription = self.bus.subscribe(&channels) => subscription,
            };

            match subscription {
                Ok(mut subscription) => {
                    failures = 0;
                    self.subscribed.send_replace(true);
                    tracing::info!(channels = ?channels, "Relay subscribed to bus");

                    loop {
                        let next = tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            next = subscription.next() => next,
                        };
                        match next {
                            Some(message) => self.dispatch(message),
                            None => {
                                tracing::warn!("Bus subscription ended, resubscribing");
                                break;
                            }
                        }
                    }

                    self.subscribed.send_replace(false);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    tracing::warn!(attempt = failures, error = %e, "Bus subscribe failed");
                }
            }

            let delay = resubscribe_delay(failures);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!("Relay pump stopped");
    }

    fn dispatch(&self, message: BusMessage) {
        if message.channel == self.config.count_channel {
            match CountUpdate::parse(&message.payload) {
                Some(update) => self.counter.observe(update.count),
                None => tracing::warn!(payload = %message.payload, "Malformed count update"),
            }
            if !self.config.forward_count_updates {
                return;
            }
        }

        // No local sessions is not an error
        let _ = self.fanout.send(Arc::new(message));
    }

    /// Publish a client payload on the message channel. Best-effort.
    pub async fn publish_message(&self, payload: &str) {
        let channel = &self.config.message_channel;
        if let Err(e) = self
            .config
            .policy
            .run("publish message", || self.bus.publish(channel, payload))
            .await
        {
            tracing::warn!(bytes = payload.len(), error = %e, "Message dropped");
        }
    }

    /// Accept a new session: reserve a slot, join the local fan-out, then
    /// count it.
    ///
    /// Joining the fan-out first means the session can receive its own
    /// first message. The counter lease lives in the registry until
    /// [`RelayHub::close_session`] releases it.
    pub async fn open_session(&self) -> Result<(Arc<Session>, Deliveries), HubError> {
        let _in_flight = self.teardown.token();
        if self.shutdown.is_cancelled() {
            return Err(HubError::ShuttingDown);
        }
        let slot = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| HubError::TooManyConnections(self.config.max_connections))?;

        let session = Arc::new(Session::new(self.shutdown.child_token()));
        let deliveries = self.fanout.subscribe();
        let lease = self.counter.acquire().await;

        self.sessions.write().await.insert(
            session.id(),
            SessionEntry {
                session: Arc::clone(&session),
                lease,
                _slot: slot,
            },
        );

        // Shutdown may have taken its snapshot while we were counting
        if self.shutdown.is_cancelled() {
            self.close_session(session.id()).await;
            return Err(HubError::ShuttingDown);
        }

        tracing::info!(session_id = %session.id(), "Session opened");
        Ok((session, deliveries))
    }

    /// Tear a session down: stop its tasks, release its count.
    ///
    /// Idempotent. Returns false if the session was already closed; the
    /// first caller may still be releasing the count at that point.
    pub async fn close_session(&self, id: SessionId) -> bool {
        let _in_flight = self.teardown.token();
        let entry = self.sessions.write().await.remove(&id);
        let Some(entry) = entry else {
            return false;
        };

        entry.session.begin_close();
        entry.session.cancel();
        entry.lease.release().await;
        entry.session.finish_close();

        tracing::info!(session_id = %id, "Session closed");
        true
    }

    /// Run one connection from accept to teardown
    pub async fn run_session<S, K>(self: &Arc<Self>, inbound: S, outbound: K) -> Result<SessionId, HubError>
    where
        S: Stream<Item = Result<Frame, TransportError>> + Unpin + Send + 'static,
        K: Sink<String, Error = TransportError> + Unpin + Send + 'static,
    {
        let (session, deliveries) = self.open_session().await?;
        Ok(self.drive_session(session, deliveries, inbound, outbound).await)
    }

    /// Relay an opened session until either direction ends.
    ///
    /// Spawns the inbound and outbound forwarding tasks and waits for both.
    pub async fn drive_session<S, K>(
        self: &Arc<Self>,
        session: Arc<Session>,
        deliveries: Deliveries,
        inbound: S,
        outbound: K,
    ) -> SessionId
    where
        S: Stream<Item = Result<Frame, TransportError>> + Unpin + Send + 'static,
        K: Sink<String, Error = TransportError> + Unpin + Send + 'static,
    {
        let id = session.id();

        let inbound_task = tokio::spawn(session::forward_inbound(
            Arc::clone(&session),
            Arc::clone(self),
            inbound,
        ));
        let outbound_task = tokio::spawn(session::forward_outbound(
            Arc::clone(&session),
            Arc::clone(self),
            deliveries,
            outbound,
        ));

        if session.activate() {
            tracing::debug!(session_id = %id, "Session active");
        }

        let (inbound_result, outbound_result) = tokio::join!(inbound_task, outbound_task);
        for result in [inbound_result, outbound_result] {
            if let Err(e) = result {
                tracing::error!(session_id = %id, error = %e, "Session task failed");
            }
        }

        // Covers a panicked task that never reached its own teardown
        self.close_session(id).await;
        id
    }

    /// Sessions currently open on this instance
    pub async fn connection_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// State of a session still registered with this hub
    pub async fn session_state(&self, id: SessionId) -> Option<SessionState> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|entry| entry.session.state())
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            local_connections: self.connection_count().await,
            total_connections: self.counter.last_known(),
        }
    }

    /// Stop the pump and close every session.
    ///
    /// Returns once every teardown in flight, including those started by
    /// the sessions themselves, has released its count.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let ids: Vec<SessionId> = self.sessions.read().await.keys().copied().collect();
        let closing = ids.len();
        for id in ids {
            self.close_session(id).await;
        }

        self.teardown.close();
        self.teardown.wait().await;

        tracing::info!(sessions = closing, "Relay hub shut down");
    }
}

fn resubscribe_delay(failures: u32) -> Duration {
    let factor = failures.max(1).saturating_mul(failures.max(1));
    RESUBSCRIBE_BASE_DELAY
        .saturating_mul(factor)
        .min(RESUBSCRIBE_MAX_DELAY)
}

/// Errors that can occur when opening a session
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Too many connections (limit: {0})")]
    TooManyConnections(usize),

    #[error("Relay is shutting down")]
    ShuttingDown,
}
