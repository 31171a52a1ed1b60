//! Chat Relay Terminal Client
//!
//! Connects to a relay, sends every stdin line as a chat message and prints
//! everything the relay delivers. Ctrl+C closes the connection cleanly.

use anyhow::Context;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat_relay::relay::BroadcastMessage;

/// How long to wait for the server to acknowledge our close frame
const CLOSE_WAIT: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "chat-relay-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Terminal client for the chat relay")]
struct Cli {
    /// Relay WebSocket URL
    #[arg(long, default_value = "ws://localhost:8000/ws")]
    url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "chat_relay_cli=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    tracing::info!("connecting to {}", cli.url);

    let (socket, _) = connect_async(cli.url.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", cli.url))?;
    let (mut sender, mut receiver) = socket.split();

    // Print everything the relay delivers
    let mut reader = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => println!("{}", render(&text)),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "read failed");
                    break;
                }
            }
        }
    });

    println!("Type your messages and press Enter to send. Press Ctrl+C to exit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, closing connection");
                break;
            }
            _ = &mut reader => {
                tracing::info!("connection closed by server");
                return Ok(());
            }
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Err(e) = sender.send(Message::text(line)).await {
                        tracing::warn!(error = %e, "write failed");
                        break;
                    }
                }
                // stdin closed; keep receiving until interrupted
                None => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = &mut reader => return Ok(()),
                    }
                    break;
                }
            },
        }
    }

    let close = Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }));
    sender.send(close).await.context("Failed to send close frame")?;

    if tokio::time::timeout(CLOSE_WAIT, reader).await.is_err() {
        tracing::warn!("server did not close the connection in time");
    }

    Ok(())
}

/// Show relay messages as `[port] message`, anything else verbatim
fn render(text: &str) -> String {
    match serde_json::from_str::<BroadcastMessage>(text) {
        Ok(message) if message.port.is_empty() => message.message,
        Ok(message) => format!("[{}] {}", message.port, message.message),
        Err(_) => text.to_string(),
    }
}
