//! Session lifecycle tests driven through the hub without sockets

mod common;

use futures_util::stream::{self, BoxStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::PollSender;

use chat_relay::bus::{FailurePolicy, MemoryBus};
use chat_relay::relay::{
    BroadcastMessage, Frame, HubConfig, HubError, RelayHub, SessionId, SessionState,
    TransportError,
    CONNECTION_COUNT_KEY, NEW_MESSAGE_CHANNEL,
};

use common::{eventually, FlakyBus, SlowBus, TIMEOUT};

type Inbound = BoxStream<'static, Result<Frame, TransportError>>;

/// Test side of one in-memory connection
struct Client {
    frames: mpsc::Sender<Result<Frame, TransportError>>,
    deliveries: mpsc::Receiver<String>,
    task: JoinHandle<Result<SessionId, HubError>>,
}

impl Client {
    async fn send(&self, text: &str) {
        self.frames
            .send(Ok(Frame::Text(text.to_string())))
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> BroadcastMessage {
        let text = timeout(TIMEOUT, self.deliveries.recv())
            .await
            .expect("delivery timed out")
            .expect("session ended");
        serde_json::from_str(&text).unwrap()
    }

    /// Hang up and wait for the session to finish
    async fn hang_up(self) -> SessionId {
        drop(self.frames);
        timeout(TIMEOUT, self.task)
            .await
            .expect("session did not end")
            .unwrap()
            .unwrap()
    }
}

fn attach(hub: &Arc<RelayHub>) -> Client {
    let (frame_tx, frame_rx) = mpsc::channel(16);
    let (out_tx, out_rx) = mpsc::channel(16);

    let inbound: Inbound = stream::unfold(frame_rx, |mut rx| async move {
        rx.recv().await.map(|frame| (frame, rx))
    })
    .boxed();
    let outbound = PollSender::new(out_tx).sink_map_err(|_| TransportError::Closed);

    let hub = Arc::clone(hub);
    let task = tokio::spawn(async move { hub.run_session(inbound, outbound).await });

    Client {
        frames: frame_tx,
        deliveries: out_rx,
        task,
    }
}

async fn started(bus: Arc<dyn chat_relay::bus::Bus>, config: HubConfig) -> Arc<RelayHub> {
    let hub = RelayHub::new(bus, config);
    hub.start();
    hub.wait_subscribed().await;
    hub
}

#[tokio::test]
async fn test_round_trip_through_hub() {
    let bus = Arc::new(MemoryBus::new());
    let hub = started(bus.clone(), HubConfig::default()).await;

    let mut client = attach(&hub);
    eventually("session open", || async { hub.connection_count().await == 1 }).await;

    client.send("ping").await;
    let msg = client.recv().await;
    assert_eq!(msg.message, "ping");
    assert_eq!(msg.channel_name, NEW_MESSAGE_CHANNEL);
    assert_eq!(msg.port, hub.origin());

    client.hang_up().await;
    assert_eq!(hub.connection_count().await, 0);
    assert_eq!(bus.counter(CONNECTION_COUNT_KEY).await, 0);
}

#[tokio::test]
async fn test_publish_failure_keeps_session_active() {
    let bus = Arc::new(FlakyBus::new(NEW_MESSAGE_CHANNEL, 1));
    let hub = started(bus.clone(), HubConfig::default()).await;

    let mut client = attach(&hub);
    eventually("session open", || async { hub.connection_count().await == 1 }).await;

    client.send("lost").await;
    client.send("kept").await;

    assert_eq!(client.recv().await.message, "kept");
    let id = client.hang_up().await;
    assert_eq!(hub.session_state(id).await, None);
    assert_eq!(bus.inner.counter(CONNECTION_COUNT_KEY).await, 0);
}

#[tokio::test]
async fn test_session_active_while_bus_fails() {
    let bus = Arc::new(FlakyBus::new(NEW_MESSAGE_CHANNEL, 0));
    let hub = started(bus.clone(), HubConfig::default()).await;

    let client = attach(&hub);
    eventually("session open", || async { hub.connection_count().await == 1 }).await;
    assert_eq!(hub.stats().await.local_connections, 1);

    bus.fail_next(3);
    for _ in 0..3 {
        client.send("dropped").await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hub.connection_count().await, 1);

    client.hang_up().await;
}

#[tokio::test]
async fn test_retry_policy_recovers_publish() {
    let bus = Arc::new(FlakyBus::new(NEW_MESSAGE_CHANNEL, 2));
    let config = HubConfig {
        policy: FailurePolicy::Retry {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        ..Default::default()
    };
    let hub = started(bus.clone(), config).await;

    let mut client = attach(&hub);
    eventually("session open", || async { hub.connection_count().await == 1 }).await;

    client.send("eventually").await;
    assert_eq!(client.recv().await.message, "eventually");

    client.hang_up().await;
}

#[tokio::test]
async fn test_write_failure_tears_down() {
    let bus = Arc::new(MemoryBus::new());
    let hub = started(bus.clone(), HubConfig::default()).await;

    let other = attach(&hub);
    let Client {
        frames,
        deliveries,
        task,
    } = attach(&hub);
    eventually("sessions open", || async { hub.connection_count().await == 2 }).await;

    // The client stops reading; the next delivery fails to write
    drop(deliveries);
    other.send("anyone there").await;

    timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(hub.connection_count().await, 1);
    assert_eq!(bus.counter(CONNECTION_COUNT_KEY).await, 1);

    drop(frames);
    other.hang_up().await;
    assert_eq!(bus.counter(CONNECTION_COUNT_KEY).await, 0);
}

#[tokio::test]
async fn test_read_error_tears_down() {
    let bus = Arc::new(MemoryBus::new());
    let hub = started(bus.clone(), HubConfig::default()).await;

    let client = attach(&hub);
    eventually("session open", || async { hub.connection_count().await == 1 }).await;

    client
        .frames
        .send(Err(TransportError::Read("reset by peer".into())))
        .await
        .unwrap();

    timeout(TIMEOUT, client.task).await.unwrap().unwrap().unwrap();
    assert_eq!(hub.connection_count().await, 0);
    assert_eq!(bus.counter(CONNECTION_COUNT_KEY).await, 0);
}

#[tokio::test]
async fn test_close_frame_tears_down() {
    let bus = Arc::new(MemoryBus::new());
    let hub = started(bus.clone(), HubConfig::default()).await;

    let client = attach(&hub);
    eventually("session open", || async { hub.connection_count().await == 1 }).await;

    client.frames.send(Ok(Frame::Close)).await.unwrap();
    timeout(TIMEOUT, client.task).await.unwrap().unwrap().unwrap();
    assert_eq!(bus.counter(CONNECTION_COUNT_KEY).await, 0);
}

#[tokio::test]
async fn test_external_close_is_idempotent() {
    let bus = Arc::new(MemoryBus::new());
    let hub = started(bus.clone(), HubConfig::default()).await;

    let (session, _deliveries) = hub.open_session().await.unwrap();
    assert_eq!(session.state(), SessionState::Accepted);
    assert_eq!(bus.counter(CONNECTION_COUNT_KEY).await, 1);

    let (first, second) = tokio::join!(
        hub.close_session(session.id()),
        hub.close_session(session.id())
    );
    assert!(first ^ second);
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.is_cancelled());
    assert_eq!(bus.counter(CONNECTION_COUNT_KEY).await, 0);
}

#[tokio::test]
async fn test_counter_matches_open_sessions() {
    let bus = Arc::new(MemoryBus::new());
    let hub = started(bus.clone(), HubConfig::default()).await;

    // Fixed pseudo-random connect/disconnect sequence
    let mut seed: u64 = 0x5eed;
    let mut open: Vec<Client> = Vec::new();
    for _ in 0..60 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let connect = open.is_empty() || (seed >> 33) % 3 != 0;

        if connect {
            open.push(attach(&hub));
            let expected = open.len();
            eventually("session open", || async {
                hub.connection_count().await == expected
            })
            .await;
        } else {
            let index = ((seed >> 17) as usize) % open.len();
            open.swap_remove(index).hang_up().await;
        }

        assert_eq!(bus.counter(CONNECTION_COUNT_KEY).await, open.len() as i64);
    }

    for client in open.drain(..) {
        client.hang_up().await;
    }
    assert_eq!(bus.counter(CONNECTION_COUNT_KEY).await, 0);
    eventually("last known total is zero", || async {
        hub.stats().await.total_connections == 0
    })
    .await;
}

#[tokio::test]
async fn test_shutdown_ends_running_sessions() {
    let bus = Arc::new(MemoryBus::new());
    let hub = started(bus.clone(), HubConfig::default()).await;

    let clients: Vec<Client> = (0..3).map(|_| attach(&hub)).collect();
    eventually("sessions open", || async { hub.connection_count().await == 3 }).await;

    hub.shutdown().await;
    for client in clients {
        timeout(TIMEOUT, client.task).await.unwrap().unwrap().unwrap();
    }
    assert_eq!(bus.counter(CONNECTION_COUNT_KEY).await, 0);
    assert!(hub.open_session().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_with_slow_store_releases_counts() {
    let bus = Arc::new(SlowBus::new(Duration::ZERO, Duration::from_millis(200)));
    let hub = started(bus.clone(), HubConfig::default()).await;

    let clients: Vec<Client> = (0..8).map(|_| attach(&hub)).collect();
    eventually("sessions open", || async { hub.connection_count().await == 8 }).await;
    assert_eq!(bus.inner.counter(CONNECTION_COUNT_KEY).await, 8);

    hub.shutdown().await;
    assert_eq!(bus.inner.counter(CONNECTION_COUNT_KEY).await, 0);

    for client in clients {
        timeout(TIMEOUT, client.task).await.unwrap().unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_disconnects_with_slow_store_keep_count_exact() {
    let bus = Arc::new(SlowBus::new(
        Duration::from_millis(20),
        Duration::from_millis(50),
    ));
    let hub = started(bus.clone(), HubConfig::default()).await;

    let clients: Vec<Client> = (0..4).map(|_| attach(&hub)).collect();
    eventually("sessions open", || async { hub.connection_count().await == 4 }).await;

    let mut remaining = clients.len() as i64;
    for client in clients {
        client.hang_up().await;
        remaining -= 1;
        assert_eq!(bus.inner.counter(CONNECTION_COUNT_KEY).await, remaining);
    }
}

#[tokio::test]
async fn test_concurrent_connects_respect_limit() {
    let bus = Arc::new(SlowBus::new(Duration::from_millis(50), Duration::ZERO));
    let config = HubConfig {
        max_connections: 1,
        ..Default::default()
    };
    let hub = started(bus.clone(), config).await;

    let clients: Vec<Client> = (0..5).map(|_| attach(&hub)).collect();
    eventually("one session open", || async { hub.connection_count().await == 1 }).await;
    eventually("extra connects rejected", || async {
        clients.iter().filter(|c| c.task.is_finished()).count() == 4
    })
    .await;

    let mut accepted = Vec::new();
    let mut rejected = 0;
    for client in clients {
        if client.task.is_finished() {
            let result = client.task.await.unwrap();
            assert!(matches!(result, Err(HubError::TooManyConnections(1))));
            rejected += 1;
        } else {
            accepted.push(client);
        }
    }

    assert_eq!(accepted.len(), 1);
    assert_eq!(rejected, 4);
    assert_eq!(bus.inner.counter(CONNECTION_COUNT_KEY).await, 1);

    for client in accepted {
        client.hang_up().await;
    }
}
