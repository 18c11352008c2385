use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, PilotError};

/// One unit of input work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub content: String,
}

impl Item {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
        }
    }

    /// Short name derived from the identifier: last path segment, cut at the
    /// first `.` and then at the first `-` (`course/07-c.md` -> `07`).
    pub fn stem(&self) -> &str {
        let base = self.id.rsplit('/').next().unwrap_or(&self.id);
        let base = base.split('.').next().unwrap_or(base);
        base.split('-').next().unwrap_or(base)
    }
}

/// Terminal recorded result of one item. Never changed once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Outcome {
    Success { value: String },
    Failure { kind: ErrorKind, reason: String },
}

impl Outcome {
    pub fn success(value: impl Into<String>) -> Self {
        Outcome::Success {
            value: value.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Rendering used by status queries: the value, or `Error: <reason>`.
    pub fn display_string(&self) -> String {
        match self {
            Outcome::Success { value } => value.clone(),
            Outcome::Failure { reason, .. } => format!("Error: {reason}"),
        }
    }
}

impl From<&PilotError> for Outcome {
    fn from(err: &PilotError) -> Self {
        Outcome::Failure {
            kind: err.kind(),
            reason: err.to_string(),
        }
    }
}
