//! Bounded waits on external, eventually-consistent conditions.
//!
//! Every wait is polling-based and consults the stop signal on each
//! iteration, so timeout and cancellation are two independent ways out.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use crate::cancellation::StopSignal;
use crate::config::Timings;
use crate::errors::PilotError;

// Keeps a zero interval from turning the loop into a busy spin.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Poll `check` until it yields a value or `timeout` elapses.
///
/// The stop signal is read before every check. A timeout error is only
/// produced once at least `timeout` has passed since the first check.
#[instrument(level = "debug", skip(stop, check), fields(timeout = ?timeout))]
pub async fn wait_until<T, F, Fut>(
    description: &str,
    interval: Duration,
    timeout: Duration,
    stop: &dyn StopSignal,
    mut check: F,
) -> Result<T, PilotError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, PilotError>>,
{
    let interval = interval.max(MIN_POLL_INTERVAL);
    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        stop.check_or_fail(description).await?;
        attempts += 1;

        if let Some(found) = check().await? {
            debug!(attempts, elapsed = ?started.elapsed(), "Condition satisfied");
            return Ok(found);
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(PilotError::Timeout(format!(
                "{description} not satisfied within {}ms ({attempts} checks)",
                timeout.as_millis()
            )));
        }
        sleep(interval.min(timeout - elapsed)).await;
    }
}

/// How a completion wait ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The busy indicator cleared and the settle delay has passed.
    Completed,
    /// All checks were spent while the target still looked busy.
    BudgetExhausted,
}

/// Wait for a long-running external generation to finish.
///
/// Waits the initial delay, then checks `is_busy` every
/// `completion_poll_interval`, at most `floor(budget_secs / 2)` times.
#[instrument(level = "debug", skip(timings, stop, is_busy))]
pub async fn wait_for_completion<F, Fut>(
    context: &str,
    budget_secs: u64,
    timings: &Timings,
    stop: &dyn StopSignal,
    mut is_busy: F,
) -> Result<CompletionOutcome, PilotError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, PilotError>>,
{
    let max_checks = (budget_secs / 2).max(1);
    info!(context, budget_secs, max_checks, "⏳ Monitoring generation");

    let stop_context = format!("waitForCompletion [{context}]");
    sleep(timings.completion_initial_delay).await;

    for attempt in 1..=max_checks {
        stop.check_or_fail(&stop_context).await?;

        if !is_busy().await? {
            info!(context, attempt, "✅ Generation complete");
            sleep(timings.completion_settle).await;
            return Ok(CompletionOutcome::Completed);
        }

        if attempt < max_checks {
            sleep(timings.completion_poll_interval).await;
        }
    }

    warn!(context, budget_secs, "⏰ Generation wait budget exhausted");
    Ok(CompletionOutcome::BudgetExhausted)
}
