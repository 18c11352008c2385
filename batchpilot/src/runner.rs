use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::cancellation::StopSignal;
use crate::config::{BatchConfig, Timings};
use crate::content::{ContentUnits, UnitSplitter};
use crate::errors::PilotError;
use crate::script::{
    Action, Condition, ContentSource, ElementRef, InsertStrategy, Interaction, SessionId, Step,
    StepScript, Target, TargetDriver,
};
use crate::status::StatusChannel;
use crate::types::Item;
use crate::waiter::{self, CompletionOutcome};

/// Runs one item through a step script.
///
/// A run owns at most one external session and closes it on every exit
/// path. Failures abort the remaining steps of this item only and are never
/// retried here.
pub struct TaskRunner {
    driver: Arc<dyn TargetDriver>,
    status: StatusChannel,
    timings: Timings,
}

/// Closes the session exactly once: explicitly through `release`, or from
/// `Drop` if the run future is abandoned mid-flight.
struct SessionGuard {
    driver: Arc<dyn TargetDriver>,
    id: Option<SessionId>,
}

impl SessionGuard {
    async fn release(mut self) {
        if let Some(id) = self.id.take() {
            match self.driver.close_session(&id).await {
                Ok(()) => debug!(session = %id.0, "Session closed"),
                Err(e) => warn!(session = %id.0, error = %e, "Failed to close session"),
            }
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let driver = self.driver.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = driver.close_session(&id).await {
                        warn!(session = %id.0, error = %e, "Failed to close abandoned session");
                    }
                });
            }
            Err(_) => warn!(session = %id.0, "No runtime to close abandoned session"),
        }
    }
}

struct RunState<'a> {
    item: &'a Item,
    config: &'a BatchConfig,
    units: &'a ContentUnits,
    stop: &'a dyn StopSignal,
    session: Option<SessionGuard>,
    result: Option<String>,
}

impl RunState<'_> {
    fn session_id(&self) -> Result<SessionId, PilotError> {
        self.session
            .as_ref()
            .and_then(|guard| guard.id.clone())
            .ok_or_else(|| PilotError::StepPreconditionFailed("no open session".into()))
    }
}

impl TaskRunner {
    pub fn new(driver: Arc<dyn TargetDriver>, status: StatusChannel, timings: Timings) -> Self {
        Self {
            driver,
            status,
            timings,
        }
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Execute `script` for `item` and return the value produced by its
    /// `finalize` step.
    #[instrument(skip_all, fields(item = %item.id, script = %script.name))]
    pub async fn run(
        &self,
        item: &Item,
        config: &BatchConfig,
        script: &StepScript,
        stop: &dyn StopSignal,
    ) -> Result<String, PilotError> {
        info!("🚀 Starting automation");
        let units = UnitSplitter::new(config.unit_label())?.split(&item.content);
        debug!(remaining_units = units.remaining.len(), "Content partitioned");

        let mut run = RunState {
            item,
            config,
            units: &units,
            stop,
            session: None,
            result: None,
        };

        let outcome = self.execute(&mut run, &script.steps).await;

        if let Some(guard) = run.session.take() {
            guard.release().await;
        }

        let outcome = outcome.and_then(|()| {
            run.result.take().ok_or_else(|| {
                PilotError::StepPreconditionFailed("script finished without a finalize step".into())
            })
        });

        match &outcome {
            Ok(value) => info!(result = %value, "✅ Automation finished"),
            Err(e) if e.is_stop() => info!(error = %e, "⏹️ Automation stopped"),
            Err(e) => {
                warn!(error = %e, "❌ Automation failed");
                self.status.update("❌ Item failed", e.to_string());
            }
        }
        outcome
    }

    async fn execute(&self, run: &mut RunState<'_>, steps: &[Step]) -> Result<(), PilotError> {
        run.stop.check_or_fail("Start").await?;

        for step in steps {
            run.stop.check_or_fail(step.label()).await?;
            match step {
                Step::ForEachUnit { steps } => self.run_units(run, steps).await?,
                other => self.execute_step(run, other, None).await?,
            }
        }
        Ok(())
    }

    /// The repeating sub-pipeline. Any unit failing aborts the whole run.
    async fn run_units(&self, run: &mut RunState<'_>, steps: &[Step]) -> Result<(), PilotError> {
        let units = run.units;
        let total = units.remaining.len();
        if total == 0 {
            info!("ℹ️ No additional units found");
            return Ok(());
        }
        info!(total, "🔄 Processing additional units");

        for (index, unit) in units.remaining.iter().enumerate() {
            // Unit numbering continues after the first unit.
            let number = index + 2;
            run.stop
                .check_or_fail(&format!("Start of loop for unit {number}"))
                .await?;
            self.status.update(
                format!("🧩 Unit {}/{}", index + 1, total),
                format!("{} (unit {number})", run.item.id),
            );

            for step in steps {
                if let Err(e) = self.execute_step(run, step, Some((number, unit))).await {
                    if !e.is_stop() {
                        warn!(unit = number, step = step.label(), error = %e, "⚠️ Unit failed, aborting item");
                    }
                    return Err(e);
                }
            }
            info!(unit = number, "✅ Unit complete");
        }
        Ok(())
    }

    async fn execute_step(
        &self,
        run: &mut RunState<'_>,
        step: &Step,
        unit: Option<(usize, &str)>,
    ) -> Result<(), PilotError> {
        debug!(step = step.label(), "Executing step");
        match step {
            Step::Open { url } => {
                if run.session.is_some() {
                    return Err(PilotError::StepPreconditionFailed(
                        "a session is already open for this item".into(),
                    ));
                }
                self.status.update("🌐 Opening target...", url.clone());
                let id = self.driver.open_session(url).await?;
                info!(session = %id.0, "Session opened");
                run.session = Some(SessionGuard {
                    driver: self.driver.clone(),
                    id: Some(id),
                });
                Ok(())
            }
            Step::WaitForReady { timeout_ms } => {
                let session = run.session_id()?;
                let timeout = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.timings.ready_timeout);
                self.status.update("⏳ Loading page...", "Waiting for the target to load");

                let driver = self.driver.as_ref();
                let session = &session;
                waiter::wait_until(
                    "page ready",
                    self.timings.ready_poll_interval,
                    timeout,
                    run.stop,
                    move || async move { Ok::<_, PilotError>(driver.is_ready(session).await?.then_some(())) },
                )
                .await?;
                sleep(self.timings.ready_settle).await;
                Ok(())
            }
            Step::Pause { ms } => {
                sleep(Duration::from_millis(*ms)).await;
                Ok(())
            }
            Step::PromptPause => {
                let wait = run.config.prompt_wait();
                info!(seconds = wait.as_secs(), "⏳ Waiting for prompt editor");
                sleep(wait).await;
                Ok(())
            }
            Step::Interact {
                target,
                fallback,
                action,
                optional,
                timeout_ms,
                wait_enabled,
            } => {
                let timeout = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.timings.element_timeout);
                let result = self
                    .interact(run, target, fallback.as_ref(), action, timeout, *wait_enabled)
                    .await;
                match result {
                    Err(e) if *optional && !e.is_stop() => {
                        warn!(target = %target, error = %e, "⚠️ Optional step failed, proceeding");
                        Ok(())
                    }
                    other => other,
                }
            }
            Step::InsertContent { target, source } => {
                let session = run.session_id()?;
                let text = resolve_source(run.units, *source, unit)?;
                let element = self
                    .locate(run.stop, &session, target, self.timings.element_timeout)
                    .await?;
                self.insert_verified(&session, &element, text).await
            }
            Step::EnsureContent { target, source } => {
                let session = run.session_id()?;
                let text = resolve_source(run.units, *source, unit)?;
                let element = self
                    .locate(run.stop, &session, target, self.timings.element_timeout)
                    .await?;
                let present = self.driver.content_length(&session, &element).await?;
                if present < self.min_length(text) {
                    warn!(present, "🚨 Content disappeared, re-inserting");
                    self.insert_verified(&session, &element, text).await?;
                }
                Ok(())
            }
            Step::WaitForCompletion { condition, context } => {
                let session = run.session_id()?;
                let label = completion_label(condition, context.as_deref(), unit);
                self.wait_for_completion(run, &session, condition, &label).await
            }
            Step::ForEachUnit { .. } => Err(PilotError::StepPreconditionFailed(
                "forEachUnit cannot be nested".into(),
            )),
            Step::Finalize => {
                let session = run.session_id()?;
                let value = self.driver.result_value(&session).await?;
                self.status.update("✅ Item complete!", "Closing session...");
                run.result = Some(value);
                Ok(())
            }
        }
    }

    /// Wait until `target` is present. `Ok(None)` from the driver means "not yet".
    async fn locate(
        &self,
        stop: &dyn StopSignal,
        session: &SessionId,
        target: &Target,
        timeout: Duration,
    ) -> Result<ElementRef, PilotError> {
        debug!(target = %target, "🎯 Looking for element");
        let driver = self.driver.as_ref();
        waiter::wait_until(
            &format!("element {target}"),
            self.timings.element_poll_interval,
            timeout,
            stop,
            move || async move { driver.locate(session, target).await },
        )
        .await
    }

    async fn interact(
        &self,
        run: &RunState<'_>,
        target: &Target,
        fallback: Option<&Target>,
        action: &Action,
        timeout: Duration,
        wait_enabled: bool,
    ) -> Result<(), PilotError> {
        let session = run.session_id()?;

        let element = match (self.locate(run.stop, &session, target, timeout).await, fallback) {
            (Ok(element), _) => element,
            (
                Err(PilotError::Timeout(reason) | PilotError::ElementNotFound(reason)),
                Some(fallback),
            ) => {
                warn!(%reason, fallback = %fallback, "⚠️ Primary target not found, trying fallback");
                self.locate(run.stop, &session, fallback, timeout).await?
            }
            (Err(e), _) => return Err(e),
        };

        if wait_enabled {
            self.wait_enabled(run.stop, &session, &element).await?;
        }

        let interaction = match action {
            Action::Click => Interaction::Click,
            Action::SetValue { value } => Interaction::SetValue(value.clone()),
            Action::SetItemName => Interaction::SetValue(run.item.stem().to_string()),
            Action::PressKey { key } => Interaction::PressKey(key.clone()),
        };
        debug!(element = %element.0, ?interaction, "✅ Element found, acting");
        self.driver.act(&session, &element, &interaction).await?;
        sleep(self.timings.action_settle).await;
        Ok(())
    }

    /// Give a disabled element a bounded chance to enable; act on it anyway afterwards.
    async fn wait_enabled(
        &self,
        stop: &dyn StopSignal,
        session: &SessionId,
        element: &ElementRef,
    ) -> Result<(), PilotError> {
        for attempt in 1..=self.timings.enable_attempts {
            if self.driver.is_enabled(session, element).await? {
                return Ok(());
            }
            debug!(attempt, "Element disabled, waiting");
            sleep(self.timings.enable_poll_interval).await;
            let context = format!("Waiting for enabled element {attempt}");
            stop.check_or_fail(&context).await?;
        }
        warn!(element = %element.0, "Element still disabled, acting anyway");
        Ok(())
    }

    fn min_length(&self, text: &str) -> usize {
        self.timings
            .insert_min_length
            .min(text.trim().chars().count())
    }

    /// Replace the content, read it back, and fall back to chunked insertion
    /// when the target did not take it.
    async fn insert_verified(
        &self,
        session: &SessionId,
        element: &ElementRef,
        text: &str,
    ) -> Result<(), PilotError> {
        debug!(chars = text.chars().count(), "🔤 Inserting content");
        self.driver
            .insert_content(session, element, text, InsertStrategy::Replace)
            .await?;
        sleep(self.timings.insert_verify_delay).await;

        let threshold = self.min_length(text);
        let present = self.driver.content_length(session, element).await?;
        if present >= threshold {
            return Ok(());
        }

        warn!(present, threshold, "🚨 Content appears to be missing, trying chunked insertion");
        self.driver
            .insert_content(
                session,
                element,
                text,
                InsertStrategy::Chunked {
                    chunk_size: self.timings.insert_chunk_size,
                },
            )
            .await?;
        sleep(self.timings.insert_verify_delay).await;

        let present = self.driver.content_length(session, element).await?;
        if present < threshold {
            return Err(PilotError::StepPreconditionFailed(format!(
                "content insertion did not stick ({present} of at least {threshold} chars)"
            )));
        }
        Ok(())
    }

    async fn wait_for_completion(
        &self,
        run: &RunState<'_>,
        session: &SessionId,
        condition: &Condition,
        label: &str,
    ) -> Result<(), PilotError> {
        let budget = run.config.generation_budget_secs();
        self.status.update("⏳ Waiting for generation...", label.to_string());

        let driver = self.driver.as_ref();
        let outcome = waiter::wait_for_completion(
            label,
            budget,
            &self.timings,
            run.stop,
            move || async move { driver.is_busy(session, condition).await },
        )
        .await?;

        match outcome {
            CompletionOutcome::Completed => Ok(()),
            CompletionOutcome::BudgetExhausted if run.config.proceed_on_generation_timeout => {
                warn!(label, "⏰ Generation still running, proceeding anyway");
                Ok(())
            }
            CompletionOutcome::BudgetExhausted => Err(PilotError::Timeout(format!(
                "{label} still in progress after {budget}s"
            ))),
        }
    }
}

fn resolve_source<'a>(
    units: &'a ContentUnits,
    source: ContentSource,
    unit: Option<(usize, &'a str)>,
) -> Result<&'a str, PilotError> {
    match source {
        ContentSource::FirstUnit => Ok(&units.first),
        ContentSource::FullContent => Ok(&units.full),
        ContentSource::CurrentUnit => unit.map(|(_, text)| text).ok_or_else(|| {
            PilotError::StepPreconditionFailed("currentUnit used outside forEachUnit".into())
        }),
    }
}

fn completion_label(
    condition: &Condition,
    context: Option<&str>,
    unit: Option<(usize, &str)>,
) -> String {
    let base = context.unwrap_or(&condition.name);
    match unit {
        Some((number, _)) => format!("{base} [unit {number}]"),
        None => base.to_string(),
    }
}
