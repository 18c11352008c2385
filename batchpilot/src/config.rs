use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::content::DEFAULT_UNIT_LABEL;

pub const DEFAULT_PROMPT_WAIT_SECS: u64 = 15;
pub const DEFAULT_GENERATION_WAIT_SECS: u64 = 120;

/// Per-batch options supplied with `start`, copied into the batch state and
/// immutable for the lifetime of that batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchConfig {
    /// Seconds to wait before a dependent step becomes interactable.
    pub prompt_wait_time: u64,
    /// Total budget in seconds for one wait-for-completion step.
    pub generation_wait_time: u64,
    /// When the completion budget runs out, carry on instead of failing the item.
    pub proceed_on_generation_timeout: bool,
    /// Word that opens each unit in an item's content, e.g. `Slide 2`.
    pub unit_label: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            prompt_wait_time: DEFAULT_PROMPT_WAIT_SECS,
            generation_wait_time: DEFAULT_GENERATION_WAIT_SECS,
            proceed_on_generation_timeout: false,
            unit_label: DEFAULT_UNIT_LABEL.to_string(),
        }
    }
}

impl BatchConfig {
    /// Zero means "not set" and falls back to the default.
    pub fn prompt_wait(&self) -> Duration {
        let secs = if self.prompt_wait_time == 0 {
            DEFAULT_PROMPT_WAIT_SECS
        } else {
            self.prompt_wait_time
        };
        Duration::from_secs(secs)
    }

    /// Blank means "not set".
    pub fn unit_label(&self) -> &str {
        let label = self.unit_label.trim();
        if label.is_empty() {
            DEFAULT_UNIT_LABEL
        } else {
            label
        }
    }

    pub fn generation_budget_secs(&self) -> u64 {
        if self.generation_wait_time == 0 {
            DEFAULT_GENERATION_WAIT_SECS
        } else {
            self.generation_wait_time
        }
    }
}

/// Fixed delays and polling intervals used by the runner and the queue driver.
///
/// `Timings::default()` carries the values tuned against the live target;
/// tests shrink them.
#[derive(Debug, Clone)]
pub struct Timings {
    pub element_poll_interval: Duration,
    pub element_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub ready_timeout: Duration,
    pub ready_settle: Duration,
    pub action_settle: Duration,
    pub completion_poll_interval: Duration,
    pub completion_initial_delay: Duration,
    pub completion_settle: Duration,
    pub insert_verify_delay: Duration,
    pub insert_min_length: usize,
    pub insert_chunk_size: usize,
    pub enable_poll_interval: Duration,
    pub enable_attempts: u32,
    pub inter_item_delay: Duration,
    pub stop_query_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            element_poll_interval: Duration::from_millis(2000),
            element_timeout: Duration::from_millis(15000),
            ready_poll_interval: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(60),
            ready_settle: Duration::from_millis(2000),
            action_settle: Duration::from_millis(1500),
            completion_poll_interval: Duration::from_millis(2000),
            completion_initial_delay: Duration::from_millis(5000),
            completion_settle: Duration::from_millis(3000),
            insert_verify_delay: Duration::from_millis(2000),
            insert_min_length: 10,
            insert_chunk_size: 100,
            enable_poll_interval: Duration::from_millis(1000),
            enable_attempts: 10,
            inter_item_delay: Duration::from_millis(5000),
            stop_query_timeout: Duration::from_millis(2000),
        }
    }
}
