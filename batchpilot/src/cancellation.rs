use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::PilotError;

/// Cooperative stop signal consulted by running tasks.
///
/// Readers never mutate it; only the stop request sets it.
#[async_trait]
pub trait StopSignal: Send + Sync {
    /// Whether a stop has been requested. Errors mean the answer is unknown.
    async fn is_set(&self) -> Result<bool, PilotError>;

    /// Fails with `StoppedByUser` when set, and with `CommunicationLost` when
    /// the signal cannot be read at all.
    async fn check_or_fail(&self, context: &str) -> Result<(), PilotError> {
        match self.is_set().await {
            Ok(false) => Ok(()),
            Ok(true) => {
                info!(context, "🛑 Stop signal received");
                Err(PilotError::StoppedByUser(context.to_string()))
            }
            Err(e) => {
                warn!(context, error = %e, "⚠️ Could not check stop signal, assuming stop");
                Err(PilotError::CommunicationLost(format!("{context}: {e}")))
            }
        }
    }
}

/// In-memory stop flag for callers that share memory with the task.
#[derive(Clone, Debug, Default)]
pub struct StopFlag {
    token: CancellationToken,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn set(&self) {
        self.token.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the flag is set.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

#[async_trait]
impl StopSignal for StopFlag {
    async fn is_set(&self) -> Result<bool, PilotError> {
        Ok(self.token.is_cancelled())
    }
}

/// One "is a stop requested?" round trip to whoever owns the flag.
#[derive(Debug)]
pub struct StopQuery {
    pub reply: oneshot::Sender<bool>,
}

/// Stop signal for a task that runs in a different execution context from
/// the flag's owner. Every read is a request/response message; no reply
/// within the timeout is reported as an error, which `check_or_fail`
/// turns into `CommunicationLost`.
#[derive(Clone, Debug)]
pub struct StopProbe {
    tx: mpsc::Sender<StopQuery>,
    timeout: Duration,
}

impl StopProbe {
    pub fn new(tx: mpsc::Sender<StopQuery>, timeout: Duration) -> Self {
        Self { tx, timeout }
    }
}

#[async_trait]
impl StopSignal for StopProbe {
    async fn is_set(&self) -> Result<bool, PilotError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StopQuery { reply })
            .await
            .map_err(|_| PilotError::CommunicationLost("stop owner is gone".into()))?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(stop)) => Ok(stop),
            Ok(Err(_canceled)) => Err(PilotError::CommunicationLost(
                "stop query dropped without a reply".into(),
            )),
            Err(_elapsed) => Err(PilotError::CommunicationLost(format!(
                "no reply to stop query within {:?}",
                self.timeout
            ))),
        }
    }
}
