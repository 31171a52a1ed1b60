//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use chat_relay::api::{serve_with_shutdown, AppState, ServerResult};
use chat_relay::bus::{Bus, BusError, MemoryBus, Subscription};
use chat_relay::config::ServerConfig;
use chat_relay::relay::{BroadcastMessage, HubConfig, RelayHub};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// One relay instance serving on an ephemeral port
pub struct Instance {
    pub url: String,
    pub hub: Arc<RelayHub>,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<ServerResult<()>>,
}

impl Instance {
    /// Shut the instance down and wait for the server to stop
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        timeout(TIMEOUT, &mut self.server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

/// Boot an instance on `bus` tagged with `origin`
pub async fn boot(bus: Arc<dyn Bus>, origin: &str) -> Instance {
    boot_with(
        bus,
        HubConfig {
            origin: origin.to_string(),
            ..Default::default()
        },
    )
    .await
}

pub async fn boot_with(bus: Arc<dyn Bus>, config: HubConfig) -> Instance {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let hub = RelayHub::new(bus, config);
    hub.start();
    hub.wait_subscribed().await;

    let state = AppState::new(
        Arc::clone(&hub),
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
        },
    );

    let (tx, rx) = oneshot::channel::<()>();
    let shutdown_hub = Arc::clone(&hub);
    let server = tokio::spawn(serve_with_shutdown(listener, state, async move {
        let _ = rx.await;
        shutdown_hub.shutdown().await;
    }));

    Instance {
        url: format!("ws://{addr}/ws"),
        hub,
        shutdown: Some(tx),
        server,
    }
}

pub async fn connect(url: &str) -> WsStream {
    let (ws, _) = timeout(TIMEOUT, connect_async(url))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

pub async fn send_text(ws: &mut WsStream, text: &str) {
    ws.send(Message::text(text.to_string())).await.unwrap();
}

/// Next relay message, skipping control frames
pub async fn recv_message(ws: &mut WsStream) -> BroadcastMessage {
    loop {
        let frame = timeout(TIMEOUT, ws.next())
            .await
            .expect("receive timed out")
            .expect("stream ended")
            .expect("receive failed");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("not a relay message");
        }
    }
}

/// Poll `check` until it holds or the timeout elapses
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Memory bus whose first `failures` publishes on one channel fail
pub struct FlakyBus {
    pub inner: MemoryBus,
    channel: String,
    remaining: AtomicU32,
}

impl FlakyBus {
    pub fn new(channel: &str, failures: u32) -> Self {
        Self {
            inner: MemoryBus::new(),
            channel: channel.to_string(),
            remaining: AtomicU32::new(failures),
        }
    }

    /// Make the next `n` publishes on the channel fail
    pub fn fail_next(&self, n: u32) {
        self.remaining.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Bus for FlakyBus {
    async fn incr(&self, key: &str) -> Result<i64, BusError> {
        self.inner.incr(key).await
    }

    async fn decr(&self, key: &str) -> Result<i64, BusError> {
        self.inner.decr(key).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        if channel == self.channel
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(BusError::Unavailable("injected failure".into()));
        }
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, BusError> {
        self.inner.subscribe(channels).await
    }
}

/// Memory bus whose counter store answers after a delay
pub struct SlowBus {
    pub inner: MemoryBus,
    incr_delay: Duration,
    decr_delay: Duration,
}

impl SlowBus {
    pub fn new(incr_delay: Duration, decr_delay: Duration) -> Self {
        Self {
            inner: MemoryBus::new(),
            incr_delay,
            decr_delay,
        }
    }
}

#[async_trait]
impl Bus for SlowBus {
    async fn incr(&self, key: &str) -> Result<i64, BusError> {
        tokio::time::sleep(self.incr_delay).await;
        self.inner.incr(key).await
    }

    async fn decr(&self, key: &str) -> Result<i64, BusError> {
        tokio::time::sleep(self.decr_delay).await;
        self.inner.decr(key).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, BusError> {
        self.inner.subscribe(channels).await
    }
}
