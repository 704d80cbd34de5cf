//! WebSocket subscriber endpoint
//!
//! Each socket becomes one event-bus subscription. The first frame is the
//! `init` snapshot, then every broadcast envelope follows in order. Client
//! text frames are small JSON commands: `ping` and `refresh`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::events::{self, EventKind};
use crate::monitor::Monitor;

use super::handlers::MonitorState;

#[derive(Debug, Deserialize)]
struct ClientCommand {
    #[serde(rename = "type")]
    kind: String,
}

/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<MonitorState>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state.monitor))
}

async fn serve_socket(socket: WebSocket, monitor: Arc<Monitor>) {
    let mut subscription = match monitor.subscribe() {
        Ok(sub) => sub,
        Err(e) => {
            warn!(error = %e, "Failed to encode init snapshot, closing socket");
            return;
        }
    };
    let id = subscription.id();
    info!(subscriber = id, "WebSocket client connected");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            outbound = subscription.recv() => {
                let Some(text) = outbound else {
                    debug!(subscriber = id, "Dropped by event bus");
                    break;
                };
                if sink.send(Message::Text(text.to_string())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = reply_to(&monitor, &text) {
                        if sink.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(subscriber = id, error = %e, "WebSocket read failed");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    info!(subscriber = id, "WebSocket client disconnected");
}

/// Answer a client command, if it is one we understand.
fn reply_to(monitor: &Monitor, text: &str) -> Option<String> {
    let command: ClientCommand = serde_json::from_str(text).ok()?;
    match command.kind.as_str() {
        "ping" => Some(serde_json::json!({"type": "pong", "data": null}).to_string()),
        "refresh" => events::encode(EventKind::Services, &monitor.registry().get_all())
            .ok()
            .map(|s| s.to_string()),
        other => {
            debug!(command = other, "Ignoring unknown client command");
            None
        }
    }
}
