use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::app::AppState;

/// Streams progress and log events to an observer.
pub async fn events_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    info!("🔌 Event stream connection request");
    ws.on_upgrade(move |socket| handle_events(socket, state))
}

/// Endpoint the browser-side executor connects to.
pub async fn bridge_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| async move { state.bridge.serve_client(socket).await })
}

async fn handle_events(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.status.subscribe();
    let mut forwarded: u64 = 0;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let text = match serde_json::to_string(&event) {
                            Ok(text) => text,
                            Err(e) => {
                                error!(error = %e, "❌ Failed to serialize event");
                                continue;
                            }
                        };
                        if let Err(e) = sender.send(Message::Text(text.into())).await {
                            warn!(error = %e, "❌ Failed to send event");
                            break;
                        }
                        forwarded += 1;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "⚠️ Event stream lagged");
                        let notice = json!({ "type": "lagged", "skipped": skipped });
                        if sender.send(Message::Text(notice.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        info!("📡 Event channel closed, ending stream");
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.as_str() == "ping" {
                            let _ = sender.send(Message::Text("pong".into())).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "❌ WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(forwarded, "🔌 Event stream disconnected");
}
