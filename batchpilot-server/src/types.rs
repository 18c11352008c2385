use batchpilot::{BatchConfig, Item};
use serde::{Deserialize, Serialize};

// ============================================================================
// Control API
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct StartBatchRequest {
    pub items: Vec<Item>,

    #[serde(default)]
    pub config: BatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub accepted: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AcceptedResponse {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub executor_connected: bool,
}

// ============================================================================
// Browser bridge wire format
// ============================================================================

/// Request sent to the browser-side executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub id: String,
    pub action: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum BridgeIncoming {
    Reply {
        id: String,
        ok: bool,
        #[serde(default)]
        result: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<String>,
        /// Machine-readable failure class, e.g. `notFound`.
        #[serde(default)]
        code: Option<String>,
    },
    Typed(TypedIncoming),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TypedIncoming {
    Hello {
        #[serde(default)]
        from: Option<String>,
    },
    Pong,
    /// Diagnostic log line from the executor.
    Log {
        message: String,
        #[serde(default)]
        data: Option<serde_json::Value>,
        #[serde(default)]
        timestamp: Option<String>,
    },
}
