//! Step scripts and the target-driver capability they run against.
//!
//! A [`StepScript`] is plain data: a named, ordered list of [`Step`]s. The
//! target-specific work (finding elements, clicking, typing, reading state)
//! lives behind [`TargetDriver`], which the caller plugs in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::PilotError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepScript {
    pub name: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Step {
    /// Acquire the session resource for this item.
    Open { url: String },
    WaitForReady {
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Pause { ms: u64 },
    /// Pause for the batch's `promptWaitTime`.
    PromptPause,
    Interact {
        target: Target,
        #[serde(default)]
        fallback: Option<Target>,
        action: Action,
        /// Failures other than a stop are logged and skipped.
        #[serde(default)]
        optional: bool,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        wait_enabled: bool,
    },
    InsertContent { target: Target, source: ContentSource },
    /// Re-insert when the target's content has fallen below the sanity threshold.
    EnsureContent { target: Target, source: ContentSource },
    WaitForCompletion {
        condition: Condition,
        #[serde(default)]
        context: Option<String>,
    },
    /// Repeat `steps` once per remaining content unit.
    ForEachUnit { steps: Vec<Step> },
    Finalize,
}

impl Step {
    pub fn label(&self) -> &'static str {
        match self {
            Step::Open { .. } => "open",
            Step::WaitForReady { .. } => "waitForReady",
            Step::Pause { .. } => "pause",
            Step::PromptPause => "promptPause",
            Step::Interact { .. } => "interact",
            Step::InsertContent { .. } => "insertContent",
            Step::EnsureContent { .. } => "ensureContent",
            Step::WaitForCompletion { .. } => "waitForCompletion",
            Step::ForEachUnit { .. } => "forEachUnit",
            Step::Finalize => "finalize",
        }
    }
}

/// How to find an element on the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    Selector { css: String },
    Text { contains: String },
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Selector { css } => write!(f, "{css}"),
            Target::Text { contains } => write!(f, "text~{contains:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    Click,
    SetValue { value: String },
    /// Set the element's value to the item's stem.
    SetItemName,
    PressKey { key: String },
}

/// Action with every item-dependent value filled in, as handed to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interaction {
    Click,
    SetValue(String),
    PressKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentSource {
    FirstUnit,
    CurrentUnit,
    FullContent,
}

/// Observable "target is still working" indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    #[serde(default)]
    pub selectors: Vec<String>,
    #[serde(default)]
    pub texts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStrategy {
    /// Clear the target and write the whole blob at once.
    Replace,
    /// Append the blob piecewise.
    Chunked { chunk_size: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementRef(pub String);

/// The capabilities a step script needs from the external target.
#[async_trait]
pub trait TargetDriver: Send + Sync {
    async fn open_session(&self, url: &str) -> Result<SessionId, PilotError>;

    async fn close_session(&self, session: &SessionId) -> Result<(), PilotError>;

    async fn is_ready(&self, session: &SessionId) -> Result<bool, PilotError>;

    /// `Ok(None)` while the element is absent; waits keep polling on that.
    /// `Err(PilotError::ElementNotFound)` is for structural misses that
    /// polling cannot fix, and fails the step at once.
    async fn locate(
        &self,
        session: &SessionId,
        target: &Target,
    ) -> Result<Option<ElementRef>, PilotError>;

    async fn is_enabled(
        &self,
        session: &SessionId,
        element: &ElementRef,
    ) -> Result<bool, PilotError>;

    /// Drivers return `ElementNotFound` when `element` no longer resolves.
    async fn act(
        &self,
        session: &SessionId,
        element: &ElementRef,
        interaction: &Interaction,
    ) -> Result<(), PilotError>;

    async fn insert_content(
        &self,
        session: &SessionId,
        element: &ElementRef,
        text: &str,
        strategy: InsertStrategy,
    ) -> Result<(), PilotError>;

    async fn content_length(
        &self,
        session: &SessionId,
        element: &ElementRef,
    ) -> Result<usize, PilotError>;

    async fn is_busy(&self, session: &SessionId, condition: &Condition)
        -> Result<bool, PilotError>;

    /// Reference to what the session produced, e.g. a document URL.
    async fn result_value(&self, session: &SessionId) -> Result<String, PilotError>;
}

impl StepScript {
    /// Parse YAML (JSON is accepted as well) and validate.
    pub fn from_yaml_str(source: &str) -> Result<Self, PilotError> {
        let script: StepScript = serde_yaml::from_str(source)
            .map_err(|e| PilotError::Serialization(format!("step script: {e}")))?;
        script.validate()?;
        Ok(script)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PilotError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| PilotError::Storage(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&source)
    }

    /// Structural checks: one `open` first of all session steps, no nested
    /// `forEachUnit`, and `currentUnit` only inside `forEachUnit`.
    pub fn validate(&self) -> Result<(), PilotError> {
        let mut opened = false;
        for step in &self.steps {
            match step {
                Step::Open { .. } if opened => {
                    return Err(PilotError::InvalidArgument(
                        "step script opens more than one session".into(),
                    ))
                }
                Step::Open { .. } => opened = true,
                Step::Pause { .. } | Step::PromptPause => {}
                Step::ForEachUnit { steps } => {
                    if !opened {
                        return Err(needs_session(step));
                    }
                    for inner in steps {
                        match inner {
                            Step::ForEachUnit { .. } | Step::Open { .. } | Step::Finalize => {
                                return Err(PilotError::InvalidArgument(format!(
                                    "`{}` is not allowed inside forEachUnit",
                                    inner.label()
                                )))
                            }
                            _ => {}
                        }
                    }
                }
                other => {
                    if !opened {
                        return Err(needs_session(other));
                    }
                    if uses_current_unit(other) {
                        return Err(PilotError::InvalidArgument(
                            "currentUnit is only available inside forEachUnit".into(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

fn needs_session(step: &Step) -> PilotError {
    PilotError::InvalidArgument(format!("`{}` runs before any `open` step", step.label()))
}

fn uses_current_unit(step: &Step) -> bool {
    matches!(
        step,
        Step::InsertContent {
            source: ContentSource::CurrentUnit,
            ..
        } | Step::EnsureContent {
            source: ContentSource::CurrentUnit,
            ..
        }
    )
}
