//! Crash-tolerant batch automation for UI-only web applications
//!
//! A [`QueueDriver`] walks an ordered list of [`Item`]s, runs each one through
//! a declarative [`StepScript`] with a [`TaskRunner`], and records exactly one
//! [`Outcome`] per item. Batch state is persisted after every transition so a
//! restart never leaves a phantom "running" batch behind, and a stop request
//! is honoured at the next cooperative checkpoint inside the running item.

pub mod cancellation;
pub mod config;
pub mod content;
pub mod errors;
pub mod queue;
pub mod runner;
pub mod script;
pub mod status;
pub mod store;
pub mod types;
pub mod waiter;

pub use cancellation::{StopFlag, StopProbe, StopQuery, StopSignal};
pub use config::{BatchConfig, Timings};
pub use content::{ContentUnits, UnitSplitter};
pub use errors::{ErrorKind, PilotError};
pub use queue::{BatchState, BatchStatus, QueueDriver, STATE_KEY};
pub use runner::TaskRunner;
pub use script::{
    Action, Condition, ContentSource, ElementRef, InsertStrategy, Interaction, SessionId, Step,
    StepScript, Target, TargetDriver,
};
pub use status::{BatchEvent, ProgressSnapshot, StatusChannel};
pub use store::{JsonFileStore, MemoryStore, StateStore};
pub use types::{Item, Outcome};
