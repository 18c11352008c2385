//! `TargetDriver` backed by a browser-side executor connected over WebSocket.
//!
//! The executor connects to `/api/bridge`. Every driver call becomes one
//! `{id, action, params}` request; the matching `{id, ok, result, error}`
//! reply is routed back through a pending map. No executor, or no reply in
//! time, is reported as `CommunicationLost`. A failed reply carrying
//! `"code": "notFound"` means the element handle no longer resolves and is
//! reported as `ElementNotFound`; any other failure is a `Driver` error.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use batchpilot::{
    Condition, ElementRef, InsertStrategy, Interaction, PilotError, SessionId, StatusChannel,
    Target, TargetDriver,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::types::{BridgeIncoming, BridgeRequest, TypedIncoming};

/// Executor error code for an element handle that no longer resolves.
const NOT_FOUND_CODE: &str = "notFound";

#[derive(Debug)]
struct ExecutorFailure {
    code: Option<String>,
    message: String,
}

type BridgeResult = Result<Value, ExecutorFailure>;
type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<BridgeResult>>>>;
type Clients = Arc<Mutex<Vec<Client>>>;

struct Client {
    id: Uuid,
    sender: mpsc::UnboundedSender<Message>,
}

pub struct BridgeDriver {
    clients: Clients,
    pending: Pending,
    timeout: Duration,
    status: StatusChannel,
}

impl BridgeDriver {
    pub fn new(timeout: Duration, status: StatusChannel) -> Self {
        Self {
            clients: Arc::new(Mutex::new(Vec::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            status,
        }
    }

    pub async fn is_client_connected(&self) -> bool {
        !self.clients.lock().await.is_empty()
    }

    /// Serve one executor connection until it closes.
    pub async fn serve_client(&self, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    warn!(error = %e, "Bridge send error");
                    break;
                }
            }
        });

        let client_id = self.register(tx).await;
        info!(%client_id, "🔌 Browser executor connected");

        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => self.handle_incoming(text.as_str()).await,
                Message::Close(_) => break,
                _ => {}
            }
        }

        self.clients.lock().await.retain(|c| c.id != client_id);
        writer.abort();
        info!(%client_id, "🔌 Browser executor disconnected");
    }

    async fn register(&self, sender: mpsc::UnboundedSender<Message>) -> Uuid {
        let id = Uuid::new_v4();
        self.clients.lock().await.push(Client { id, sender });
        id
    }

    async fn handle_incoming(&self, text: &str) {
        match serde_json::from_str::<BridgeIncoming>(text) {
            Ok(BridgeIncoming::Reply {
                id,
                ok,
                result,
                error,
                code,
            }) => {
                let reply = if ok {
                    Ok(result.unwrap_or(Value::Null))
                } else {
                    let err = error.unwrap_or_else(|| "unknown error".into());
                    let head: String = err.chars().take(400).collect();
                    error!(id = %id, error = %head, "Bridge request failed in executor");
                    Err(ExecutorFailure { code, message: err })
                };
                match self.pending.lock().await.remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => debug!(id = %id, "Reply for a request nobody is waiting on"),
                }
            }
            Ok(BridgeIncoming::Typed(TypedIncoming::Log {
                message,
                data,
                timestamp,
            })) => {
                info!(source = "executor", ts = timestamp.as_deref().unwrap_or(""), "{message}");
                self.status.log(message, data);
            }
            Ok(BridgeIncoming::Typed(TypedIncoming::Hello { from })) => {
                info!(from = from.as_deref().unwrap_or("unknown"), "Executor said hello");
            }
            Ok(BridgeIncoming::Typed(TypedIncoming::Pong)) => {}
            Err(e) => warn!(error = %e, "Invalid incoming bridge JSON"),
        }
    }

    /// One request/response round trip with the first connected executor.
    async fn request(&self, action: &str, params: Value) -> Result<Value, PilotError> {
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(&BridgeRequest {
            id: id.clone(),
            action: action.to_string(),
            params,
        })?;

        let (tx, rx) = oneshot::channel::<BridgeResult>();
        self.pending.lock().await.insert(id.clone(), tx);

        let sent = {
            let clients = self.clients.lock().await;
            match clients.first() {
                Some(client) => client.sender.send(Message::Text(payload.into())).is_ok(),
                None => false,
            }
        };
        if !sent {
            self.pending.lock().await.remove(&id);
            return Err(PilotError::CommunicationLost(format!(
                "{action}: no browser executor connected"
            )));
        }
        debug!(id = %id, action, "Sent bridge request");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(failure))) => {
                let reason = format!("{action}: {}", failure.message);
                if failure.code.as_deref() == Some(NOT_FOUND_CODE) {
                    Err(PilotError::ElementNotFound(reason))
                } else {
                    Err(PilotError::Driver(reason))
                }
            }
            Ok(Err(_canceled)) => Err(PilotError::CommunicationLost(format!(
                "{action}: request dropped"
            ))),
            Err(_elapsed) => {
                self.pending.lock().await.remove(&id);
                warn!(id = %id, action, "Timed out waiting for bridge reply");
                Err(PilotError::CommunicationLost(format!(
                    "{action}: no reply within {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

fn expect_bool(action: &str, value: Value) -> Result<bool, PilotError> {
    value
        .as_bool()
        .ok_or_else(|| PilotError::Driver(format!("{action}: expected a boolean, got {value}")))
}

fn expect_string(action: &str, value: &Value, field: &str) -> Result<String, PilotError> {
    value
        .as_str()
        .or_else(|| value.get(field).and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| PilotError::Driver(format!("{action}: expected `{field}`, got {value}")))
}

fn interaction_params(interaction: &Interaction) -> Value {
    match interaction {
        Interaction::Click => json!({ "type": "click" }),
        Interaction::SetValue(value) => json!({ "type": "setValue", "value": value }),
        Interaction::PressKey(key) => json!({ "type": "pressKey", "key": key }),
    }
}

#[async_trait]
impl TargetDriver for BridgeDriver {
    async fn open_session(&self, url: &str) -> Result<SessionId, PilotError> {
        let result = self.request("openSession", json!({ "url": url })).await?;
        Ok(SessionId(expect_string("openSession", &result, "sessionId")?))
    }

    async fn close_session(&self, session: &SessionId) -> Result<(), PilotError> {
        self.request("closeSession", json!({ "sessionId": session }))
            .await?;
        Ok(())
    }

    async fn is_ready(&self, session: &SessionId) -> Result<bool, PilotError> {
        let result = self.request("isReady", json!({ "sessionId": session })).await?;
        expect_bool("isReady", result)
    }

    async fn locate(
        &self,
        session: &SessionId,
        target: &Target,
    ) -> Result<Option<ElementRef>, PilotError> {
        let result = self
            .request("locate", json!({ "sessionId": session, "target": target }))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        Ok(Some(ElementRef(expect_string("locate", &result, "element")?)))
    }

    async fn is_enabled(
        &self,
        session: &SessionId,
        element: &ElementRef,
    ) -> Result<bool, PilotError> {
        let result = self
            .request("isEnabled", json!({ "sessionId": session, "element": element }))
            .await?;
        expect_bool("isEnabled", result)
    }

    async fn act(
        &self,
        session: &SessionId,
        element: &ElementRef,
        interaction: &Interaction,
    ) -> Result<(), PilotError> {
        let params = json!({
            "sessionId": session,
            "element": element,
            "interaction": interaction_params(interaction),
        });
        self.request("act", params).await?;
        Ok(())
    }

    async fn insert_content(
        &self,
        session: &SessionId,
        element: &ElementRef,
        text: &str,
        strategy: InsertStrategy,
    ) -> Result<(), PilotError> {
        let strategy = match strategy {
            InsertStrategy::Replace => json!({ "mode": "replace" }),
            InsertStrategy::Chunked { chunk_size } => {
                json!({ "mode": "chunked", "chunkSize": chunk_size })
            }
        };
        let params = json!({
            "sessionId": session,
            "element": element,
            "text": text,
            "strategy": strategy,
        });
        self.request("insertContent", params).await?;
        Ok(())
    }

    async fn content_length(
        &self,
        session: &SessionId,
        element: &ElementRef,
    ) -> Result<usize, PilotError> {
        let result = self
            .request("contentLength", json!({ "sessionId": session, "element": element }))
            .await?;
        result
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| PilotError::Driver(format!("contentLength: expected a number, got {result}")))
    }

    async fn is_busy(&self, session: &SessionId, condition: &Condition) -> Result<bool, PilotError> {
        let result = self
            .request("isBusy", json!({ "sessionId": session, "condition": condition }))
            .await?;
        expect_bool("isBusy", result)
    }

    async fn result_value(&self, session: &SessionId) -> Result<String, PilotError> {
        let result = self
            .request("resultValue", json!({ "sessionId": session }))
            .await?;
        expect_string("resultValue", &result, "value")
    }
}
