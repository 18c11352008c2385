use axum::{
    routing::{get, post},
    Router,
};
use batchpilot::{
    PilotError, QueueDriver, StateStore, StatusChannel, StepScript, TargetDriver, TaskRunner,
    Timings,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api;
use crate::bridge::BridgeDriver;
use crate::websocket;

/// Shared state behind every route.
pub struct AppState {
    pub queue: QueueDriver,
    pub status: StatusChannel,
    pub bridge: Arc<BridgeDriver>,
}

impl AppState {
    pub async fn new(
        script: StepScript,
        store: Arc<dyn StateStore>,
        timings: Timings,
        bridge_timeout: Duration,
    ) -> Result<Self, PilotError> {
        let status = StatusChannel::new();
        let bridge = Arc::new(BridgeDriver::new(bridge_timeout, status.clone()));
        let driver: Arc<dyn TargetDriver> = bridge.clone();
        let runner = Arc::new(TaskRunner::new(driver, status.clone(), timings));
        let queue = QueueDriver::spawn(runner, Arc::new(script), store, status.clone()).await?;
        Ok(Self {
            queue,
            status,
            bridge,
        })
    }
}

pub fn router(state: Arc<AppState>, cors: bool) -> Router {
    let mut app = Router::new()
        // Health check
        .route("/api/health", get(api::health))
        // Batch control
        .route("/api/batch/start", post(api::start_batch))
        .route("/api/batch/stop", post(api::stop_batch))
        .route("/api/batch/status", get(api::get_status))
        // WebSockets: observers and the browser executor
        .route("/api/batch/events", get(websocket::events_handler))
        .route("/api/bridge", get(websocket::bridge_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if cors {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }
    app
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchpilot::MemoryStore;
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    const SCRIPT: &str = r#"
name: e2e
steps:
  - kind: open
    url: https://target.example/
  - kind: waitForReady
  - kind: insertContent
    target: { css: "div[contenteditable=true]" }
    source: firstUnit
  - kind: waitForCompletion
    condition: { name: generation, selectors: [".spinner"] }
  - kind: finalize
"#;

    fn fast_timings() -> Timings {
        let ms = Duration::from_millis;
        Timings {
            element_poll_interval: ms(10),
            element_timeout: ms(500),
            ready_poll_interval: ms(10),
            ready_timeout: ms(500),
            ready_settle: ms(1),
            action_settle: ms(1),
            completion_poll_interval: ms(10),
            completion_initial_delay: ms(1),
            completion_settle: ms(1),
            insert_verify_delay: ms(1),
            insert_min_length: 10,
            insert_chunk_size: 100,
            enable_poll_interval: ms(10),
            enable_attempts: 3,
            inter_item_delay: ms(10),
            stop_query_timeout: ms(500),
        }
    }

    async fn serve() -> String {
        let script = StepScript::from_yaml_str(SCRIPT).unwrap();
        let state = AppState::new(
            script,
            Arc::new(MemoryStore::new()),
            fast_timings(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(Arc::new(state), false))
                .await
                .unwrap();
        });
        addr.to_string()
    }

    /// Connects a browser executor that always finds elements and, unless
    /// `busy`, reports the target idle.
    async fn connect_executor(addr: &str, busy: bool) {
        let (ws, _) = connect_async(format!("ws://{addr}/api/bridge")).await.unwrap();
        let (mut write, mut read) = ws.split();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = read.next().await {
                if !msg.is_text() {
                    continue;
                }
                let request: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
                let result = match request["action"].as_str().unwrap_or_default() {
                    "openSession" => json!({ "sessionId": "tab-1" }),
                    "isReady" => json!(true),
                    "locate" => json!("el-1"),
                    "contentLength" => json!(999),
                    "isBusy" => json!(busy),
                    "resultValue" => json!("https://target.example/docs/1"),
                    _ => Value::Null,
                };
                let reply = json!({ "id": request["id"], "ok": true, "result": result });
                if write.send(Message::text(reply.to_string())).await.is_err() {
                    break;
                }
            }
        });

        let client = reqwest::Client::new();
        for _ in 0..200 {
            let health: Value = client
                .get(format!("http://{addr}/api/health"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if health["executor_connected"] == true {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("executor never registered");
    }

    async fn wait_idle(client: &reqwest::Client, addr: &str) -> Value {
        for _ in 0..500 {
            let status: Value = client
                .get(format!("http://{addr}/api/batch/status"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if status["running"] == false {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("batch never finished");
    }

    #[tokio::test]
    async fn batch_runs_through_the_bridge_and_streams_events() {
        let addr = serve().await;
        connect_executor(&addr, false).await;
        let (mut events, _) = connect_async(format!("ws://{addr}/api/batch/events"))
            .await
            .unwrap();
        // The pong proves the stream is subscribed before the batch starts.
        events.send(Message::text("ping")).await.unwrap();
        let pong = events.next().await.unwrap().unwrap();
        assert_eq!(pong.to_text().unwrap(), "pong");

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{addr}/api/batch/start"))
            .json(&json!({
                "items": [{ "id": "deck/01-intro.md", "content": "Slide 1\nWelcome to the course" }],
                "config": { "generationWaitTime": 4 }
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["accepted"], true);

        let status = wait_idle(&client, &addr).await;
        assert_eq!(status["step"], "✅ Batch complete!");
        assert_eq!(status["details"], "Success: 1, Failed: 0");
        assert_eq!(
            status["results"]["deck/01-intro.md"],
            "https://target.example/docs/1"
        );

        let mut saw_item_progress = false;
        while let Some(Ok(msg)) = events.next().await {
            let event: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
            if event["type"] != "progress" {
                continue;
            }
            let step = event["step"].as_str().unwrap_or_default();
            if step.starts_with("📄 Processing item 1/1") {
                saw_item_progress = true;
            }
            if step == "✅ Batch complete!" {
                assert_eq!(event["percent"], 100.0);
                break;
            }
        }
        assert!(saw_item_progress);
    }

    #[tokio::test]
    async fn second_start_conflicts_and_stop_ends_the_batch() {
        let addr = serve().await;
        connect_executor(&addr, true).await;
        let client = reqwest::Client::new();
        let batch = json!({
            "items": [
                { "id": "a.md", "content": "Slide 1\nfirst deck body" },
                { "id": "b.md", "content": "Slide 1\nsecond deck body" }
            ],
            "config": { "generationWaitTime": 120 }
        });

        let first = client
            .post(format!("http://{addr}/api/batch/start"))
            .json(&batch)
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), reqwest::StatusCode::OK);

        let second = client
            .post(format!("http://{addr}/api/batch/start"))
            .json(&batch)
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), reqwest::StatusCode::CONFLICT);
        let body: Value = second.json().await.unwrap();
        assert_eq!(body["accepted"], false);

        let stop: Value = client
            .post(format!("http://{addr}/api/batch/stop"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stop["accepted"], true);

        let status = wait_idle(&client, &addr).await;
        assert_eq!(status["step"], "⏹️ Automation stopped");
        assert_eq!(status["details"], "User cancelled.");
        assert!(status["results"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_ids_are_a_bad_request() {
        let addr = serve().await;
        let response = reqwest::Client::new()
            .post(format!("http://{addr}/api/batch/start"))
            .json(&json!({
                "items": [
                    { "id": "a.md", "content": "x" },
                    { "id": "a.md", "content": "y" }
                ]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}
