//! The push channel: WebSocket endpoint streaming hub events to observers.
//!
//! Framing discipline: exactly one complete JSON event per text frame,
//! never coalesced. Each connection gets its own hub subscription, a 30 s
//! ping, and a 60 s pong deadline.

use axum::extract::State;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::body::Bytes;
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::hub::events::{Event, EventKind};
use crate::server::SharedState;

/// Heartbeat interval per observer.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a pong before declaring the observer dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let subscription = state.hub.subscribe();
    let observer_id = subscription.id;

    // Observers learn license liveness the moment they connect.
    let welcome = Event::new(EventKind::Connection {
        status: "connected".to_string(),
        license: state.license.liveness().await,
    });

    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, subscription.rx, welcome).await;

    state.hub.unsubscribe(observer_id);
    debug!(observer = observer_id, "push channel closed");
}

/// Forward hub events one-per-frame with ping/pong keepalive. Exits when
/// the client goes away, the hub drops the observer, or the pong deadline
/// passes.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: mpsc::Receiver<Event>,
    welcome: Event,
) {
    if send_event(&mut sender, &welcome).await.is_err() {
        return;
    }

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick fires immediately; consume it so the first real ping
    // lands after a full interval.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            event = rx.recv() => {
                match event {
                    Some(event) => {
                        if send_event(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                    // Hub dropped us (slow consumer or shutdown).
                    None => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Clients only listen; ignore anything they send.
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

/// One event, one frame.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &Event,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event)
        .map_err(axum::Error::new)?;
    sender.send(Message::Text(Utf8Bytes::from(json))).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_deadline_exceeds_interval() {
        // A fresh connection must not be declared dead before its first
        // ping round-trip has a chance to complete.
        assert!(PONG_TIMEOUT > PING_INTERVAL);
    }

    #[test]
    fn events_serialize_to_single_json_objects() {
        let event = Event::new(EventKind::PipelineReset {});
        let json = serde_json::to_string(&event).unwrap();
        // A frame must parse as exactly one object.
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value.is_object());
        assert!(!json.contains('\n'));
    }
}
