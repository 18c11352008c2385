use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use batchpilot::{BatchStatus, PilotError};
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppState;
use crate::types::{AcceptedResponse, HealthResponse, StartBatchRequest};

// ============================================================================
// Error Handling
// ============================================================================

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = AcceptedResponse {
            accepted: false,
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PilotError> for ApiError {
    fn from(err: PilotError) -> Self {
        let status = match err {
            PilotError::AlreadyRunning => StatusCode::CONFLICT,
            PilotError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

// ============================================================================
// Health Check
// ============================================================================

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        executor_connected: state.bridge.is_client_connected().await,
    })
}

// ============================================================================
// Batch Control
// ============================================================================

pub async fn start_batch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartBatchRequest>,
) -> Result<Json<AcceptedResponse>, ApiError> {
    info!("📥 POST /api/batch/start - {} items", request.items.len());

    if let Err(e) = state.queue.start(request.items, request.config).await {
        warn!(error = %e, "Batch start rejected");
        return Err(e.into());
    }
    Ok(Json(AcceptedResponse::accepted()))
}

pub async fn stop_batch(
    State(state): State<Arc<AppState>>,
) -> Result<Json<AcceptedResponse>, ApiError> {
    info!("📥 POST /api/batch/stop");
    state.queue.stop().await?;
    Ok(Json(AcceptedResponse::accepted()))
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> Result<Json<BatchStatus>, ApiError> {
    Ok(Json(state.queue.status().await?))
}
