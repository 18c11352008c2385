//! Batch queue driver.
//!
//! All batch state is owned by one actor task. `start`, `stop` and `status`
//! are messages to that actor, and the worker running the current item
//! reports back (and asks whether to stop) through messages as well, so no
//! state is ever shared between the two.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancellation::{StopProbe, StopQuery};
use crate::config::BatchConfig;
use crate::content::UnitSplitter;
use crate::errors::PilotError;
use crate::runner::TaskRunner;
use crate::script::StepScript;
use crate::status::{ProgressSnapshot, StatusChannel};
use crate::store::StateStore;
use crate::types::{Item, Outcome};

/// Key of the persisted batch record.
pub const STATE_KEY: &str = "batch_state";

const COMMAND_CAPACITY: usize = 64;

/// The persisted record. `items[cursor..]` is the pending queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchState {
    #[serde(default)]
    pub batch_id: Option<Uuid>,
    pub items: Vec<Item>,
    pub cursor: usize,
    #[serde(default)]
    pub total: usize,
    pub config: BatchConfig,
    pub results: BTreeMap<String, Outcome>,
    pub running: bool,
    pub stop_requested: bool,
    #[serde(default)]
    pub progress: ProgressSnapshot,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl BatchState {
    pub fn pending(&self) -> &[Item] {
        self.items.get(self.cursor..).unwrap_or(&[])
    }

    /// Drop every item that has not been started.
    fn clear_queue(&mut self) {
        self.items.truncate(self.cursor);
    }

    fn counts(&self) -> (usize, usize) {
        let successes = self.results.values().filter(|o| o.is_success()).count();
        (successes, self.results.len() - successes)
    }
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatus {
    pub running: bool,
    pub step: String,
    pub details: String,
    pub percent: f64,
    pub stop_requested: bool,
    pub results: BTreeMap<String, String>,
    pub cursor: usize,
    pub total: usize,
}

enum Command {
    Start {
        items: Vec<Item>,
        config: BatchConfig,
        reply: oneshot::Sender<Result<(), PilotError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<BatchStatus>,
    },
    Snapshot {
        reply: oneshot::Sender<BatchState>,
    },
    Advance {
        batch_id: Uuid,
    },
    ItemFinished {
        batch_id: Uuid,
        index: usize,
        result: Result<String, PilotError>,
    },
}

/// Handle to the driver actor. Cheap to clone.
#[derive(Clone)]
pub struct QueueDriver {
    commands: mpsc::Sender<Command>,
}

impl QueueDriver {
    /// Restore persisted state and start the actor.
    ///
    /// A persisted batch still marked running was orphaned by a restart: its
    /// in-flight item has an unknown outcome, so it is reset to idle with an
    /// empty queue instead of being resumed. Recorded results are kept.
    pub async fn spawn(
        runner: Arc<TaskRunner>,
        script: Arc<StepScript>,
        store: Arc<dyn StateStore>,
        status: StatusChannel,
    ) -> Result<Self, PilotError> {
        let state = restore_state(store.as_ref()).await?;
        status.restore(state.progress.clone());

        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (stop_tx, stop_rx) = mpsc::channel(COMMAND_CAPACITY);

        let actor = DriverActor {
            state,
            store,
            status,
            runner,
            script,
            scheduler: commands.downgrade(),
            stop_tx,
            in_flight: None,
        };
        tokio::spawn(actor.run(command_rx, stop_rx));

        Ok(Self { commands })
    }

    /// Accept a new batch. Fails with `AlreadyRunning` while a batch is running.
    /// Returns as soon as the batch is accepted; items run in the background.
    pub async fn start(&self, items: Vec<Item>, config: BatchConfig) -> Result<(), PilotError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start {
            items,
            config,
            reply,
        })
        .await?;
        rx.await.map_err(|_| driver_gone())?
    }

    /// Request a stop. A no-op when nothing is running; safe to repeat.
    pub async fn stop(&self) -> Result<(), PilotError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop { reply }).await?;
        rx.await.map_err(|_| driver_gone())
    }

    pub async fn status(&self) -> Result<BatchStatus, PilotError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        rx.await.map_err(|_| driver_gone())
    }

    /// Copy of the full batch record.
    pub async fn state(&self) -> Result<BatchState, PilotError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| driver_gone())
    }

    async fn send(&self, command: Command) -> Result<(), PilotError> {
        self.commands.send(command).await.map_err(|_| driver_gone())
    }
}

fn driver_gone() -> PilotError {
    PilotError::Internal("queue driver is not running".into())
}

async fn restore_state(store: &dyn StateStore) -> Result<BatchState, PilotError> {
    let mut rewrite = false;
    let record = match store.load(STATE_KEY).await {
        Ok(record) => record,
        Err(PilotError::Serialization(e)) => {
            warn!(error = %e, "Persisted batch state is corrupt, starting fresh");
            rewrite = true;
            None
        }
        Err(e) => return Err(e),
    };
    let mut state = match record {
        Some(value) => serde_json::from_value::<BatchState>(value).unwrap_or_else(|e| {
            warn!(error = %e, "Persisted batch state is unreadable, starting fresh");
            BatchState::default()
        }),
        None => BatchState::default(),
    };
    info!(
        running = state.running,
        cursor = state.cursor,
        results = state.results.len(),
        "🔄 Restored batch state"
    );

    if state.running || state.stop_requested {
        warn!("⚠️ Resetting running state on startup");
        state.running = false;
        state.stop_requested = false;
        state.clear_queue();
        rewrite = true;
    }
    if rewrite {
        let value = serde_json::to_value(&state)?;
        store.save(STATE_KEY, &value).await?;
    }
    Ok(state)
}

struct DriverActor {
    state: BatchState,
    store: Arc<dyn StateStore>,
    status: StatusChannel,
    runner: Arc<TaskRunner>,
    script: Arc<StepScript>,
    /// Weak so the actor exits once every external handle is dropped.
    scheduler: mpsc::WeakSender<Command>,
    stop_tx: mpsc::Sender<StopQuery>,
    in_flight: Option<usize>,
}

impl DriverActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut stop_queries: mpsc::Receiver<StopQuery>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                Some(query) = stop_queries.recv() => {
                    let _ = query.reply.send(self.state.running && self.state.stop_requested);
                }
            }
        }
        debug!("Queue driver shut down");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start {
                items,
                config,
                reply,
            } => {
                let accepted = self.start(items, config).await;
                let batch_id = self.state.batch_id;
                let ok = accepted.is_ok();
                let _ = reply.send(accepted);
                if let (true, Some(batch_id)) = (ok, batch_id) {
                    self.advance(batch_id).await;
                }
            }
            Command::Stop { reply } => {
                self.request_stop().await;
                let _ = reply.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status_snapshot());
            }
            Command::Snapshot { reply } => {
                let mut state = self.state.clone();
                state.progress = self.status.query();
                let _ = reply.send(state);
            }
            Command::Advance { batch_id } => self.advance(batch_id).await,
            Command::ItemFinished {
                batch_id,
                index,
                result,
            } => self.item_finished(batch_id, index, result).await,
        }
    }

    async fn start(&mut self, items: Vec<Item>, config: BatchConfig) -> Result<(), PilotError> {
        if self.state.running {
            warn!("Start rejected: a batch is already running");
            return Err(PilotError::AlreadyRunning);
        }
        if items.iter().any(|item| item.id.trim().is_empty()) {
            return Err(PilotError::InvalidArgument("item id must not be empty".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = items.iter().find(|item| !seen.insert(item.id.as_str())) {
            return Err(PilotError::InvalidArgument(format!(
                "duplicate item id {:?}",
                dup.id
            )));
        }
        UnitSplitter::new(config.unit_label())?;

        let batch_id = Uuid::new_v4();
        info!(%batch_id, items = items.len(), "🚀 Starting batch automation");
        self.state = BatchState {
            batch_id: Some(batch_id),
            total: items.len(),
            items,
            cursor: 0,
            config,
            results: BTreeMap::new(),
            running: true,
            stop_requested: false,
            progress: self.status.query(),
            started_at: Some(Utc::now()),
        };
        self.persist().await;
        Ok(())
    }

    async fn request_stop(&mut self) {
        if !self.state.running {
            return;
        }
        if !self.state.stop_requested {
            info!("⏹️ Stop signal received");
            self.state.stop_requested = true;
            self.status
                .update("⏹️ Stopping...", "Will stop after the current item.");
            self.persist().await;
        }
        if self.in_flight.is_none() {
            self.finish_stopped().await;
        }
    }

    /// Start the item under the cursor, or finish the batch.
    async fn advance(&mut self, batch_id: Uuid) {
        if self.state.batch_id != Some(batch_id) || !self.state.running || self.in_flight.is_some()
        {
            debug!(%batch_id, "Ignoring stale advance");
            return;
        }
        if self.state.stop_requested {
            self.finish_stopped().await;
            return;
        }
        if self.state.cursor >= self.state.items.len() {
            self.finish_complete().await;
            return;
        }

        let index = self.state.cursor;
        let total = self.state.total.max(1);
        let item = self.state.items[index].clone();
        let percent = index as f64 / total as f64 * 100.0;
        self.status.publish(
            format!("📄 Processing item {}/{}", index + 1, self.state.total),
            item.id.clone(),
            percent,
        );
        self.persist().await;

        let Some(reporter) = self.scheduler.upgrade() else {
            return;
        };
        self.in_flight = Some(index);

        let runner = self.runner.clone();
        let script = self.script.clone();
        let config = self.state.config.clone();
        let probe = StopProbe::new(self.stop_tx.clone(), runner.timings().stop_query_timeout);
        tokio::spawn(async move {
            // Run in its own task so a panicking driver plugin becomes a
            // failed item instead of a stalled batch.
            let task = tokio::spawn(async move { runner.run(&item, &config, &script, &probe).await });
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(PilotError::Internal(format!("item task aborted: {e}"))),
            };
            let _ = reporter
                .send(Command::ItemFinished {
                    batch_id,
                    index,
                    result,
                })
                .await;
        });
    }

    async fn item_finished(
        &mut self,
        batch_id: Uuid,
        index: usize,
        result: Result<String, PilotError>,
    ) {
        if self.state.batch_id != Some(batch_id) || self.in_flight != Some(index) {
            warn!(%batch_id, index, "Ignoring result for an item that is not in flight");
            return;
        }
        self.in_flight = None;

        if let Err(e) = &result {
            if e.is_stop() && self.state.stop_requested {
                info!(index, "⏹️ Item unwound after stop request");
                self.finish_stopped().await;
                return;
            }
        }

        let item_id = self.state.items[index].id.clone();
        let outcome = match &result {
            Ok(value) => {
                info!(item = %item_id, result = %value, "✅ Item succeeded");
                Outcome::success(value.clone())
            }
            Err(e) => {
                error!(item = %item_id, error = %e, "❌ Item failed");
                Outcome::from(e)
            }
        };
        if self.state.results.contains_key(&item_id) {
            warn!(item = %item_id, "Outcome already recorded, keeping the first");
        } else {
            self.state.results.insert(item_id, outcome);
        }
        self.state.cursor = index + 1;
        self.persist().await;

        if let Some(scheduler) = self.scheduler.upgrade() {
            let delay = self.runner.timings().inter_item_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = scheduler.send(Command::Advance { batch_id }).await;
            });
        }
    }

    async fn finish_stopped(&mut self) {
        info!(cursor = self.state.cursor, "⏹️ Automation loop stopped");
        self.state.running = false;
        self.state.stop_requested = false;
        self.state.clear_queue();
        self.status.update("⏹️ Automation stopped", "User cancelled.");
        self.persist().await;
    }

    async fn finish_complete(&mut self) {
        let (successes, failures) = self.state.counts();
        info!(successes, failures, "✅ Batch complete");
        self.state.running = false;
        self.state.clear_queue();
        self.status.publish(
            "✅ Batch complete!",
            format!("Success: {successes}, Failed: {failures}"),
            100.0,
        );
        self.persist().await;
    }

    fn status_snapshot(&self) -> BatchStatus {
        let progress = self.status.query();
        BatchStatus {
            running: self.state.running,
            step: progress.step,
            details: progress.details,
            percent: progress.percent,
            stop_requested: self.state.stop_requested,
            results: self
                .state
                .results
                .iter()
                .map(|(id, outcome)| (id.clone(), outcome.display_string()))
                .collect(),
            cursor: self.state.cursor,
            total: self.state.total,
        }
    }

    /// Store failures are logged; the batch keeps going on the in-memory state.
    async fn persist(&mut self) {
        self.state.progress = self.status.query();
        let value = match serde_json::to_value(&self.state) {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, "Failed to serialise batch state");
                return;
            }
        };
        if let Err(e) = self.store.save(STATE_KEY, &value).await {
            error!(error = %e, "Failed to persist batch state");
        }
    }
}
