//! WebSocket Handler
//!
//! Upgrades `/ws` requests and hands the socket to the relay hub as a
//! frame stream plus a text sink.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{future, SinkExt, StreamExt};
use std::sync::Arc;

use super::hub::RelayHub;
use super::messages::Frame;
use super::session::TransportError;
use crate::api::AppState;

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Run an upgraded socket through the hub until it closes
async fn handle_socket(mut socket: WebSocket, hub: Arc<RelayHub>) {
    let (session, deliveries) = match hub.open_session().await {
        Ok(opened) => opened,
        Err(e) => {
            tracing::warn!(error = %e, "Rejecting WebSocket connection");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::AGAIN,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let (sender, receiver) = socket.split();
    let inbound = receiver.map(|result| {
        result
            .map(to_frame)
            .map_err(|e| TransportError::Read(e.to_string()))
    });
    let outbound = sender
        .with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text))))
        .sink_map_err(|e| TransportError::Write(e.to_string()));

    hub.drive_session(session, deliveries, inbound, outbound).await;
}

fn to_frame(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text),
        Message::Binary(bytes) => Frame::from_binary(&bytes),
        Message::Ping(_) | Message::Pong(_) => Frame::Control,
        Message::Close(_) => Frame::Close,
    }
}
