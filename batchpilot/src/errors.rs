use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum PilotError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Automation stopped by user ({0})")]
    StoppedByUser(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Step precondition failed: {0}")]
    StepPreconditionFailed(String),

    /// The stop-signal round trip itself failed. Treated as a stop request.
    #[error("Automation stopped (communication lost): {0}")]
    CommunicationLost(String),

    #[error("Automation is already running")]
    AlreadyRunning,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Target driver error: {0}")]
    Driver(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Serialisable discriminant of [`PilotError`], kept alongside recorded failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Timeout,
    StoppedByUser,
    ElementNotFound,
    StepPreconditionFailed,
    CommunicationLost,
    AlreadyRunning,
    InvalidArgument,
    Storage,
    Serialization,
    Driver,
    Internal,
}

impl PilotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PilotError::Timeout(_) => ErrorKind::Timeout,
            PilotError::StoppedByUser(_) => ErrorKind::StoppedByUser,
            PilotError::ElementNotFound(_) => ErrorKind::ElementNotFound,
            PilotError::StepPreconditionFailed(_) => ErrorKind::StepPreconditionFailed,
            PilotError::CommunicationLost(_) => ErrorKind::CommunicationLost,
            PilotError::AlreadyRunning => ErrorKind::AlreadyRunning,
            PilotError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            PilotError::Storage(_) => ErrorKind::Storage,
            PilotError::Serialization(_) => ErrorKind::Serialization,
            PilotError::Driver(_) => ErrorKind::Driver,
            PilotError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for the errors that mean "stop now" rather than "this item failed".
    pub fn is_stop(&self) -> bool {
        matches!(
            self,
            PilotError::StoppedByUser(_) | PilotError::CommunicationLost(_)
        )
    }
}

impl From<serde_json::Error> for PilotError {
    fn from(err: serde_json::Error) -> Self {
        PilotError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for PilotError {
    fn from(err: std::io::Error) -> Self {
        PilotError::Storage(err.to_string())
    }
}
