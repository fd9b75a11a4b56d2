use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_channel::Receiver;
use steward_protocol::AssistantEvent;
use steward_protocol::CancelledOutcome;
use steward_protocol::CompactionCompletedEvent;
use steward_protocol::CompletedOutcome;
use steward_protocol::FailedOutcome;
use steward_protocol::OperationId;
use steward_protocol::OperationOutcome;
use steward_protocol::TimedOutOutcome;
use steward_protocol::UserId;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio::time::interval;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::TimingConfig;
use crate::error::StewardErr;
use crate::extension::ExtensionAttempt;
use crate::extension::ExtensionGate;
use crate::extension::ExtensionTrigger;
use crate::policy;
use crate::policy::ExtensionVerdict;
use crate::policy::PolicyInputs;
use crate::policy::SkipReason;
use crate::registry::ControlSignal;
use crate::registry::OperationDescriptor;
use crate::registry::OperationEventKind;
use crate::registry::OperationPhase;
use crate::registry::OperationRegistry;
use crate::report::ProgressReporter;
use crate::timeout::FiredDeadline;
use crate::timeout::TimeoutScheduler;
use crate::util::MutexExt;

const PROGRESS_TAIL_BYTES: usize = 1_000;

/// Latched terminal resolution: the first writer wins, later attempts are
/// ignored. Keeps a deadline that fires mid-completion from rewriting a
/// success into a failure.
#[derive(Default)]
pub(crate) struct OutcomeCell {
    slot: StdMutex<Option<OperationOutcome>>,
}

impl OutcomeCell {
    pub(crate) fn resolve(&self, outcome: OperationOutcome) -> bool {
        let mut slot = self.slot.lock_unchecked();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        true
    }

    pub(crate) fn get(&self) -> Option<OperationOutcome> {
        self.slot.lock_unchecked().clone()
    }
}

/// Accumulation state for one in-flight operation. Owned exclusively by its
/// loop; nothing outside ever holds a reference.
struct StreamState {
    buffer: String,
    buffer_truncated: bool,
    last_event_at: Instant,
    compaction_started_at: Option<Instant>,
    auto_extension_count: u32,
    is_finished: bool,
    is_cancelled: bool,
}

impl StreamState {
    fn new(now: Instant) -> Self {
        Self {
            buffer: String::new(),
            buffer_truncated: false,
            last_event_at: now,
            compaction_started_at: None,
            auto_extension_count: 0,
            is_finished: false,
            is_cancelled: false,
        }
    }

    /// Appends a delta, trimming the front (on a char boundary) once the
    /// retention cap is exceeded.
    fn push_delta(&mut self, delta: &str, retain: usize) {
        self.buffer.push_str(delta);
        if self.buffer.len() > retain {
            let mut cut = self.buffer.len() - retain;
            while !self.buffer.is_char_boundary(cut) {
                cut += 1;
            }
            self.buffer.drain(..cut);
            self.buffer_truncated = true;
        }
    }
}

/// Drives one operation from start to its terminal outcome: consumes the
/// assistant event stream, keeps the user-visible progress fresh, runs the
/// auto-extension cadence, and latches exactly one resolution.
pub(crate) struct OperationLoop {
    user_id: UserId,
    operation_id: OperationId,
    config: TimingConfig,
    scheduler: TimeoutScheduler,
    gate: Arc<ExtensionGate>,
    registry: Arc<OperationRegistry>,
    reporter: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
    started_at: Instant,
    phase: OperationPhase,
    state: StreamState,
    outcome: OutcomeCell,
    last_progress_at: Option<Instant>,
    last_heartbeat_at: Option<Instant>,
    compaction_notice_sent: bool,
    ceiling_logged: bool,
}

impl OperationLoop {
    pub(crate) fn new(
        user_id: UserId,
        operation_id: OperationId,
        config: TimingConfig,
        scheduler: TimeoutScheduler,
        gate: Arc<ExtensionGate>,
        registry: Arc<OperationRegistry>,
        reporter: Arc<dyn ProgressReporter>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            user_id,
            operation_id,
            config,
            scheduler,
            gate,
            registry,
            reporter,
            cancel,
            started_at: now,
            phase: OperationPhase::Starting,
            state: StreamState::new(now),
            outcome: OutcomeCell::default(),
            last_progress_at: None,
            last_heartbeat_at: None,
            compaction_notice_sent: false,
            ceiling_logged: false,
        }
    }

    pub(crate) async fn run(
        mut self,
        events: Receiver<AssistantEvent>,
        mut control_rx: mpsc::UnboundedReceiver<ControlSignal>,
    ) -> OperationOutcome {
        self.phase = OperationPhase::Active;
        self.publish(OperationEventKind::Updated);

        let cancel = self.cancel.clone();
        let mut policy_tick = interval(self.config.policy_interval());
        policy_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.phase.is_terminal() {
            let heartbeat_deadline = self.next_heartbeat_deadline();
            select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(_) => self.resolve_failure(StewardErr::StreamClosed.to_string()),
                },
                signal = control_rx.recv() => match signal {
                    Some(ControlSignal::DeadlineExpired(fired)) => self.resolve_timeout(fired),
                    None => self.resolve_failure("control channel closed".to_string()),
                },
                _ = cancel.cancelled(), if !self.state.is_cancelled => self.resolve_cancelled(),
                _ = policy_tick.tick() => self.maybe_auto_extend().await,
                _ = sleep_until(heartbeat_deadline) => self.emit_heartbeat().await,
            }
        }

        self.finish()
    }

    async fn handle_event(&mut self, event: AssistantEvent) {
        self.state.last_event_at = Instant::now();
        self.last_heartbeat_at = None;
        match event {
            AssistantEvent::ContentDelta(delta) => {
                self.state
                    .push_delta(&delta.delta, self.config.buffer_retention());
                self.maybe_refresh_progress().await;
            }
            AssistantEvent::Reasoning(_) => {
                // Activity only; reasoning is never shown or buffered.
            }
            AssistantEvent::CompactionStarted => self.on_compaction_started(),
            AssistantEvent::CompactionCompleted(done) => self.on_compaction_completed(done).await,
            AssistantEvent::Idle => self.resolve_completed(),
            AssistantEvent::Error(error) => self.resolve_failure(error.message),
        }
    }

    fn on_compaction_started(&mut self) {
        if self.state.compaction_started_at.is_some() {
            debug!(user = %self.user_id, "duplicate compaction start; keeping the original mark");
            return;
        }
        self.state.compaction_started_at = Some(Instant::now());
        self.compaction_notice_sent = false;
        self.phase = OperationPhase::Compacting;
        info!(
            user = %self.user_id,
            operation = %self.operation_id,
            "context compaction started"
        );
        self.publish(OperationEventKind::Updated);
    }

    async fn on_compaction_completed(&mut self, event: CompactionCompletedEvent) {
        let Some(started_at) = self.state.compaction_started_at.take() else {
            warn!(user = %self.user_id, "compaction completion without a start; ignoring");
            return;
        };
        let duration = started_at.elapsed();
        info!(
            user = %self.user_id,
            operation = %self.operation_id,
            duration_ms = duration.as_millis() as u64,
            success = event.success,
            tokens_saved = event.tokens_saved,
            "context compaction finished"
        );
        self.phase = OperationPhase::Active;
        if duration > self.config.compaction_notice_threshold() && !self.compaction_notice_sent {
            self.compaction_notice_sent = true;
            let text = format!(
                "Context compaction took {}; the task has resumed.",
                format_duration(duration)
            );
            if let Err(err) = self.reporter.notify(self.user_id, &text).await {
                warn!(error = ?err, user = %self.user_id, "failed to send compaction notice");
            }
        }
        self.publish(OperationEventKind::Updated);
    }

    async fn maybe_refresh_progress(&mut self) {
        let now = Instant::now();
        if self
            .last_progress_at
            .is_some_and(|last| now.duration_since(last) < self.config.progress_min_interval())
        {
            return;
        }
        self.last_progress_at = Some(now);
        let text = self.progress_text();
        if let Err(err) = self.reporter.update_progress(self.user_id, &text).await {
            warn!(error = ?err, user = %self.user_id, "failed to update progress message");
        }
        self.publish(OperationEventKind::Updated);
    }

    fn progress_text(&self) -> String {
        let buffer = &self.state.buffer;
        let mut start = buffer.len().saturating_sub(PROGRESS_TAIL_BYTES);
        while !buffer.is_char_boundary(start) {
            start += 1;
        }
        let tail = &buffer[start..];
        if start > 0 || self.state.buffer_truncated {
            format!("[...] {tail}")
        } else {
            tail.to_string()
        }
    }

    async fn maybe_auto_extend(&mut self) {
        if self.state.is_finished || self.state.is_cancelled || self.phase.is_terminal() {
            return;
        }
        let (Some(elapsed), Some(original), Some(total)) = (
            self.scheduler.elapsed(self.user_id),
            self.scheduler.original_duration(self.user_id),
            self.scheduler.total_extension(self.user_id),
        ) else {
            return;
        };

        let inputs = PolicyInputs {
            elapsed,
            original_duration: original,
            total_extension: total,
            last_event_age: self.state.last_event_at.elapsed(),
            activity_window: self.config.activity_window(),
            max_total_duration: self.config.max_total_duration(),
            extension_step: self.config.extension_step(),
            is_busy: self.registry.is_busy(self.user_id),
            is_finished: self.state.is_finished,
            is_cancelled: self.state.is_cancelled,
        };
        match policy::evaluate(inputs) {
            ExtensionVerdict::Extend => self.apply_auto_extension().await,
            ExtensionVerdict::Skip(SkipReason::CeilingReached) => self.log_ceiling_once(),
            ExtensionVerdict::Skip(reason) => {
                debug!(user = %self.user_id, reason = %reason, "automatic extension skipped");
            }
        }
    }

    async fn apply_auto_extension(&mut self) {
        let attempt = self.gate.try_extend(
            &self.scheduler,
            self.user_id,
            ExtensionTrigger::Auto,
            self.config.extension_step(),
            self.config.max_total_duration(),
        );
        match attempt {
            ExtensionAttempt::Applied { added } => {
                self.state.auto_extension_count += 1;
                info!(
                    user = %self.user_id,
                    operation = %self.operation_id,
                    added_ms = added.as_millis() as u64,
                    count = self.state.auto_extension_count,
                    "budget extended automatically"
                );
                let text = format!(
                    "Added {} to the time budget; the task is still active.",
                    format_duration(added)
                );
                if let Err(err) = self.reporter.notify(self.user_id, &text).await {
                    warn!(error = ?err, user = %self.user_id, "failed to send extension notice");
                }
                self.publish(OperationEventKind::Updated);
            }
            ExtensionAttempt::Contended => {
                debug!(user = %self.user_id, "automatic extension lost the slot race; skipping");
            }
            ExtensionAttempt::CeilingReached => self.log_ceiling_once(),
            ExtensionAttempt::NothingToExtend => {
                debug!(user = %self.user_id, "no armed timeout to extend");
            }
        }
    }

    fn log_ceiling_once(&mut self) {
        if self.ceiling_logged {
            return;
        }
        self.ceiling_logged = true;
        info!(
            user = %self.user_id,
            operation = %self.operation_id,
            max_ms = self.config.max_total_duration().as_millis() as u64,
            "time budget ceiling reached; no further automatic extensions"
        );
    }

    fn next_heartbeat_deadline(&self) -> Instant {
        match self.last_heartbeat_at {
            Some(last) => last + self.config.heartbeat_repeat(),
            None => self.state.last_event_at + self.config.heartbeat_warn_after(),
        }
    }

    async fn emit_heartbeat(&mut self) {
        if self.state.is_finished || self.state.is_cancelled {
            return;
        }
        let silent_for = self.state.last_event_at.elapsed();
        self.last_heartbeat_at = Some(Instant::now());
        debug!(
            user = %self.user_id,
            silent_ms = silent_for.as_millis() as u64,
            "heartbeat warning"
        );
        let text = format!(
            "No output for {}; the task is still running.",
            format_duration(silent_for)
        );
        if let Err(err) = self.reporter.update_progress(self.user_id, &text).await {
            warn!(error = ?err, user = %self.user_id, "failed to update heartbeat message");
        }
    }

    fn resolve_completed(&mut self) {
        self.state.is_finished = true;
        let outcome = OperationOutcome::Completed(CompletedOutcome {
            output: self.state.buffer.clone(),
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            auto_extensions: self.state.auto_extension_count,
        });
        self.latch(outcome, OperationPhase::Completed);
    }

    fn resolve_timeout(&mut self, fired: FiredDeadline) {
        warn!(
            user = %self.user_id,
            operation = %self.operation_id,
            effective_ms = fired.effective_duration().as_millis() as u64,
            "operation hit its global timeout"
        );
        let outcome = OperationOutcome::TimedOut(TimedOutOutcome {
            partial_output: self.state.buffer.clone(),
            effective_duration_ms: fired.effective_duration().as_millis() as u64,
        });
        self.latch(outcome, OperationPhase::TimedOut);
    }

    fn resolve_cancelled(&mut self) {
        self.state.is_cancelled = true;
        info!(user = %self.user_id, operation = %self.operation_id, "operation cancelled");
        let outcome = OperationOutcome::Cancelled(CancelledOutcome {
            partial_output: self.state.buffer.clone(),
        });
        self.latch(outcome, OperationPhase::Cancelled);
    }

    fn resolve_failure(&mut self, message: String) {
        self.state.is_finished = true;
        warn!(user = %self.user_id, operation = %self.operation_id, message, "operation failed");
        let outcome = OperationOutcome::Failed(FailedOutcome {
            message,
            partial_output: self.state.buffer.clone(),
        });
        self.latch(outcome, OperationPhase::Failed);
    }

    fn latch(&mut self, outcome: OperationOutcome, phase: OperationPhase) {
        if self.outcome.resolve(outcome) {
            self.phase = phase;
        } else {
            debug!(user = %self.user_id, "terminal signal after resolution; ignored");
        }
    }

    fn finish(self) -> OperationOutcome {
        // Idempotent against manager-side teardown running first.
        self.scheduler.clear(self.user_id);
        let outcome = self.outcome.get().unwrap_or_else(|| {
            OperationOutcome::Failed(FailedOutcome {
                message: "operation ended without a resolution".to_string(),
                partial_output: self.state.buffer.clone(),
            })
        });
        self.registry
            .record(OperationEventKind::Terminated, self.descriptor());
        outcome
    }

    fn descriptor(&self) -> OperationDescriptor {
        OperationDescriptor {
            user_id: self.user_id,
            operation_id: self.operation_id,
            phase: self.phase,
            uptime: self.started_at.elapsed(),
            remaining_budget: self.scheduler.remaining(self.user_id),
            auto_extensions: self.state.auto_extension_count,
            buffered_bytes: self.state.buffer.len(),
            buffer_truncated: self.state.buffer_truncated,
        }
    }

    fn publish(&self, kind: OperationEventKind) {
        self.registry.record(kind, self.descriptor());
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use steward_protocol::CompletedOutcome;
    use steward_protocol::TimedOutOutcome;

    use super::*;

    #[test]
    fn outcome_cell_latches_the_first_resolution() {
        let cell = OutcomeCell::default();
        let completed = OperationOutcome::Completed(CompletedOutcome {
            output: "done".to_string(),
            duration_ms: 1_000,
            auto_extensions: 0,
        });
        let timed_out = OperationOutcome::TimedOut(TimedOutOutcome {
            partial_output: "done".to_string(),
            effective_duration_ms: 1_000,
        });

        assert!(cell.resolve(completed.clone()));
        assert!(!cell.resolve(timed_out));
        assert_eq!(cell.get(), Some(completed));
    }

    #[tokio::test(start_paused = true)]
    async fn push_delta_trims_the_front_at_the_cap() {
        let mut state = StreamState::new(Instant::now());
        state.push_delta("abcdef", 8);
        assert_eq!(state.buffer, "abcdef");
        assert!(!state.buffer_truncated);

        state.push_delta("ghij", 8);
        assert_eq!(state.buffer, "cdefghij");
        assert!(state.buffer_truncated);
    }

    #[tokio::test(start_paused = true)]
    async fn push_delta_trims_on_char_boundaries() {
        let mut state = StreamState::new(Instant::now());
        state.push_delta("héllo wörld", 6);
        assert!(state.buffer.len() <= 7);
        assert!(state.buffer.is_char_boundary(0));
        assert!(state.buffer_truncated);
        assert!("héllo wörld".ends_with(&state.buffer));
    }

    #[test]
    fn format_duration_is_compact() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(60)), "1m 00s");
        assert_eq!(format_duration(Duration::from_secs(260)), "4m 20s");
    }
}
