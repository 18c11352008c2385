#![allow(dead_code)]

use async_trait::async_trait;
use batchpilot::{
    BatchStatus, Condition, ElementRef, InsertStrategy, Interaction, Item, PilotError,
    QueueDriver, SessionId, StepScript, Target, TargetDriver,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub const DECK_SCRIPT: &str = r#"
name: deck
steps:
  - kind: open
    url: https://target.example/create
  - kind: waitForReady
  - kind: interact
    target: { css: "button.create" }
    fallback: { contains: "Create new" }
    action: { type: click }
  - kind: insertContent
    target: { css: textarea }
    source: firstUnit
  - kind: waitForCompletion
    condition: { name: generation, selectors: [".spinner"] }
  - kind: forEachUnit
    steps:
      - kind: insertContent
        target: { css: "textarea.card" }
        source: currentUnit
      - kind: interact
        target: { css: "button.generate" }
        action: { type: click }
        waitEnabled: true
      - kind: waitForCompletion
        condition: { name: card, selectors: [".spinner"] }
  - kind: interact
    target: { contains: "Rename" }
    action: { type: setItemName }
    optional: true
    timeoutMs: 4000
  - kind: finalize
"#;

pub fn deck_script() -> StepScript {
    StepScript::from_yaml_str(DECK_SCRIPT).unwrap()
}

/// An item whose content holds `units` numbered slides.
pub fn deck_item(id: &str, units: usize) -> Item {
    let content = (1..=units)
        .map(|n| format!("Slide {n}\nBody of slide {n} for {id}"))
        .collect::<Vec<_>>()
        .join("\n");
    Item::new(id, content)
}

/// Polls status until the batch is no longer running.
pub async fn wait_idle(driver: &QueueDriver) -> BatchStatus {
    for _ in 0..100_000 {
        let status = driver.status().await.unwrap();
        if !status.running {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("batch never finished");
}

#[derive(Debug)]
pub struct Behaviour {
    /// Targets (by display form) that are never found.
    pub missing: HashSet<String>,
    /// Targets whose lookup fails with `ElementNotFound`.
    pub detached: HashSet<String>,
    /// Whether a `Replace` insertion is reflected in the content length.
    pub replace_sticks: bool,
    pub chunked_sticks: bool,
    /// Insertion of any text containing this marker fails.
    pub fail_on_text: Option<String>,
    /// Insertion of text containing the marker returns the paired error.
    pub error_on_text: Option<(String, PilotError)>,
    /// Insertion of text containing this marker panics inside the driver.
    pub panic_on_text: Option<String>,
    /// Busy answers given before the target reports idle.
    pub busy_checks: usize,
    pub busy_forever: bool,
    /// Busy forever once text containing this marker has been inserted.
    pub busy_when_text: Option<String>,
    /// `is_enabled` answers `false` this many times first.
    pub disabled_checks: usize,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            missing: HashSet::new(),
            detached: HashSet::new(),
            replace_sticks: true,
            chunked_sticks: true,
            fail_on_text: None,
            error_on_text: None,
            panic_on_text: None,
            busy_checks: 0,
            busy_forever: false,
            busy_when_text: None,
            disabled_checks: 0,
        }
    }
}

#[derive(Debug, Default)]
struct DriverLog {
    opened: usize,
    closed: usize,
    open_sessions: HashSet<String>,
    lengths: HashMap<String, usize>,
    busy_polls: usize,
    last_text: String,
    actions: Vec<String>,
}

/// In-memory target that follows a fixed [`Behaviour`] and records calls.
#[derive(Debug, Default)]
pub struct ScriptedDriver {
    behaviour: Mutex<Behaviour>,
    log: Mutex<DriverLog>,
}

impl ScriptedDriver {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour: Mutex::new(behaviour),
            log: Mutex::new(DriverLog::default()),
        }
    }

    pub fn opened(&self) -> usize {
        self.log().opened
    }

    pub fn closed(&self) -> usize {
        self.log().closed
    }

    pub fn open_sessions(&self) -> usize {
        self.log().open_sessions.len()
    }

    pub fn busy_polls(&self) -> usize {
        self.log().busy_polls
    }

    pub fn actions(&self) -> Vec<String> {
        self.log().actions.clone()
    }

    fn log(&self) -> MutexGuard<'_, DriverLog> {
        self.log.lock().unwrap()
    }

    fn behaviour(&self) -> MutexGuard<'_, Behaviour> {
        self.behaviour.lock().unwrap()
    }
}

#[async_trait]
impl TargetDriver for ScriptedDriver {
    async fn open_session(&self, url: &str) -> Result<SessionId, PilotError> {
        let mut log = self.log();
        log.opened += 1;
        let id = format!("session-{}", log.opened);
        log.open_sessions.insert(id.clone());
        log.actions.push(format!("open {url}"));
        Ok(SessionId(id))
    }

    async fn close_session(&self, session: &SessionId) -> Result<(), PilotError> {
        let mut log = self.log();
        log.closed += 1;
        log.open_sessions.remove(&session.0);
        Ok(())
    }

    async fn is_ready(&self, _session: &SessionId) -> Result<bool, PilotError> {
        Ok(true)
    }

    async fn locate(
        &self,
        _session: &SessionId,
        target: &Target,
    ) -> Result<Option<ElementRef>, PilotError> {
        let key = target.to_string();
        let behaviour = self.behaviour();
        if behaviour.detached.contains(&key) {
            return Err(PilotError::ElementNotFound(key));
        }
        if behaviour.missing.contains(&key) {
            return Ok(None);
        }
        Ok(Some(ElementRef(key)))
    }

    async fn is_enabled(
        &self,
        _session: &SessionId,
        _element: &ElementRef,
    ) -> Result<bool, PilotError> {
        let mut behaviour = self.behaviour();
        if behaviour.disabled_checks > 0 {
            behaviour.disabled_checks -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    async fn act(
        &self,
        _session: &SessionId,
        element: &ElementRef,
        interaction: &Interaction,
    ) -> Result<(), PilotError> {
        let entry = match interaction {
            Interaction::Click => format!("click {}", element.0),
            Interaction::SetValue(value) => format!("set {} = {value}", element.0),
            Interaction::PressKey(key) => format!("key {key} on {}", element.0),
        };
        self.log().actions.push(entry);
        Ok(())
    }

    async fn insert_content(
        &self,
        _session: &SessionId,
        element: &ElementRef,
        text: &str,
        strategy: InsertStrategy,
    ) -> Result<(), PilotError> {
        let sticks = {
            let behaviour = self.behaviour();
            if let Some(marker) = &behaviour.fail_on_text {
                if text.contains(marker.as_str()) {
                    return Err(PilotError::Driver(format!("editor rejected {marker}")));
                }
            }
            if let Some((marker, err)) = &behaviour.error_on_text {
                if text.contains(marker.as_str()) {
                    return Err(err.clone());
                }
            }
            let panics = behaviour
                .panic_on_text
                .as_ref()
                .is_some_and(|marker| text.contains(marker.as_str()));
            if panics {
                drop(behaviour);
                panic!("editor plugin crashed");
            }
            match strategy {
                InsertStrategy::Replace => behaviour.replace_sticks,
                InsertStrategy::Chunked { .. } => behaviour.chunked_sticks,
            }
        };
        let length = if sticks { text.trim().chars().count() } else { 0 };

        let mut log = self.log();
        log.lengths.insert(element.0.clone(), length);
        log.last_text = text.to_string();
        log.actions.push(format!("insert {:?} into {}", strategy, element.0));
        Ok(())
    }

    async fn content_length(
        &self,
        _session: &SessionId,
        element: &ElementRef,
    ) -> Result<usize, PilotError> {
        Ok(self.log().lengths.get(&element.0).copied().unwrap_or(0))
    }

    async fn is_busy(
        &self,
        _session: &SessionId,
        _condition: &Condition,
    ) -> Result<bool, PilotError> {
        let last_text = {
            let mut log = self.log();
            log.busy_polls += 1;
            log.last_text.clone()
        };
        let mut behaviour = self.behaviour();
        let marked = behaviour
            .busy_when_text
            .as_ref()
            .is_some_and(|marker| last_text.contains(marker.as_str()));
        if behaviour.busy_forever || marked {
            return Ok(true);
        }
        if behaviour.busy_checks > 0 {
            behaviour.busy_checks -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    async fn result_value(&self, session: &SessionId) -> Result<String, PilotError> {
        Ok(format!("https://target.example/doc/{}", session.0))
    }
}
