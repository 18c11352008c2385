use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 256;

/// Latest published progress, answerable without asking the running task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub step: String,
    pub details: String,
    pub percent: f64,
    /// Publication counter; a later snapshot always has a larger value.
    #[serde(default)]
    pub seq: u64,
}

/// Unsolicited events pushed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BatchEvent {
    Progress {
        step: String,
        details: String,
        percent: f64,
    },
    /// Diagnostic only; carries no control information.
    Log {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        timestamp: String,
    },
}

/// Fire-and-forget progress publication plus a cached snapshot.
///
/// Publishing never fails: with no live subscriber the event is dropped and
/// only the cache is updated.
#[derive(Clone)]
pub struct StatusChannel {
    inner: Arc<StatusInner>,
}

struct StatusInner {
    snapshot: Mutex<ProgressSnapshot>,
    events: broadcast::Sender<BatchEvent>,
}

impl Default for StatusChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusChannel {
    pub fn new() -> Self {
        Self::with_snapshot(ProgressSnapshot::default())
    }

    /// Start from a previously persisted snapshot.
    pub fn with_snapshot(snapshot: ProgressSnapshot) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(StatusInner {
                snapshot: Mutex::new(snapshot),
                events,
            }),
        }
    }

    /// Replace the cached snapshot without notifying observers.
    pub fn restore(&self, snapshot: ProgressSnapshot) {
        *self.lock() = snapshot;
    }

    pub fn publish(
        &self,
        step: impl Into<String>,
        details: impl Into<String>,
        percent: f64,
    ) -> ProgressSnapshot {
        let snapshot = {
            let mut current = self.lock();
            current.step = step.into();
            current.details = details.into();
            current.percent = percent.clamp(0.0, 100.0);
            current.seq += 1;
            current.clone()
        };
        debug!(step = %snapshot.step, details = %snapshot.details, percent = snapshot.percent, "Status update");

        let _ = self.inner.events.send(BatchEvent::Progress {
            step: snapshot.step.clone(),
            details: snapshot.details.clone(),
            percent: snapshot.percent,
        });
        snapshot
    }

    /// Publish a new step and details, keeping the current percent.
    pub fn update(&self, step: impl Into<String>, details: impl Into<String>) -> ProgressSnapshot {
        let percent = self.lock().percent;
        self.publish(step, details, percent)
    }

    pub fn log(&self, message: impl Into<String>, data: Option<serde_json::Value>) {
        let _ = self.inner.events.send(BatchEvent::Log {
            message: message.into(),
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        });
    }

    pub fn query(&self) -> ProgressSnapshot {
        self.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.inner.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, ProgressSnapshot> {
        self.inner
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_observers_updates_cache() {
        let status = StatusChannel::new();
        status.publish("Processing item 1/2", "a.md", 0.0);
        let snap = status.publish("Processing item 2/2", "b.md", 50.0);

        assert_eq!(status.query(), snap);
        assert_eq!(snap.seq, 2);
        assert_eq!(snap.percent, 50.0);
    }

    #[tokio::test]
    async fn observers_receive_progress_in_order() {
        let status = StatusChannel::new();
        let mut rx = status.subscribe();

        status.publish("one", "", 10.0);
        status.update("two", "keeps percent");
        status.log("diagnostic", Some(serde_json::json!({"k": 1})));

        assert_eq!(
            rx.recv().await.unwrap(),
            BatchEvent::Progress { step: "one".into(), details: "".into(), percent: 10.0 }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            BatchEvent::Progress { step: "two".into(), details: "keeps percent".into(), percent: 10.0 }
        );
        assert!(matches!(rx.recv().await.unwrap(), BatchEvent::Log { message, .. } if message == "diagnostic"));
    }

    #[test]
    fn progress_event_serialises_with_type_tag() {
        let json = serde_json::to_value(BatchEvent::Progress {
            step: "s".into(),
            details: "d".into(),
            percent: 100.0,
        })
        .unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["percent"], 100.0);
    }
}
