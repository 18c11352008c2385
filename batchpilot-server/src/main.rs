mod api;
mod app;
mod bridge;
mod types;
mod websocket;

use anyhow::Context;
use batchpilot::{JsonFileStore, StepScript, Timings};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use app::AppState;

const DEFAULT_SCRIPT: &str = include_str!("../scripts/deck.yaml");

#[derive(Parser, Debug)]
#[command(name = "batchpilot-server")]
#[command(about = "HTTP/WebSocket server driving batch automation through a browser executor")]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "BATCHPILOT_PORT", default_value = "8083")]
    port: u16,

    /// Enable CORS for all origins
    #[arg(long, env = "BATCHPILOT_CORS")]
    cors: bool,

    /// Directory holding the persisted batch state
    #[arg(long, env = "BATCHPILOT_STATE_DIR", default_value = ".batchpilot")]
    state_dir: PathBuf,

    /// Step script (YAML or JSON); the bundled deck script when omitted
    #[arg(long, env = "BATCHPILOT_SCRIPT")]
    script: Option<PathBuf>,

    /// How long to wait for the browser executor to answer one request
    #[arg(long, env = "BATCHPILOT_BRIDGE_TIMEOUT_MS", default_value = "30000")]
    bridge_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("🚀 Starting batchpilot-server v{}", env!("CARGO_PKG_VERSION"));
    info!("🔧 Port: {}", args.port);
    info!("🔧 CORS: {}", if args.cors { "enabled" } else { "disabled" });
    info!("🔧 State directory: {}", args.state_dir.display());

    let script = match &args.script {
        Some(path) => StepScript::load(path)
            .with_context(|| format!("loading step script {}", path.display()))?,
        None => StepScript::from_yaml_str(DEFAULT_SCRIPT).context("parsing bundled step script")?,
    };
    info!(script = %script.name, steps = script.steps.len(), "📜 Step script loaded");

    let store = JsonFileStore::open(&args.state_dir)
        .await
        .context("opening state directory")?;
    let state = AppState::new(
        script,
        Arc::new(store),
        Timings::default(),
        Duration::from_millis(args.bridge_timeout_ms),
    )
    .await
    .context("restoring batch state")?;
    info!("✅ Queue driver initialized");

    let app = app::router(Arc::new(state), args.cors);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("✅ Server listening on http://{}", addr);
    info!("📡 Event stream: ws://{}/api/batch/events", addr);
    info!("🔌 Executor bridge: ws://{}/api/bridge", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
