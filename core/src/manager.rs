use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_channel::Receiver;
use steward_protocol::AssistantEvent;
use steward_protocol::OperationId;
use steward_protocol::OperationOutcome;
use steward_protocol::UserId;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::config::TimingConfig;
use crate::error::Result;
use crate::extension::ExtensionAttempt;
use crate::extension::ExtensionGate;
use crate::extension::ExtensionTrigger;
use crate::operation::OperationLoop;
use crate::registry::ControlSignal;
use crate::registry::OperationDescriptor;
use crate::registry::OperationEvent;
use crate::registry::OperationEventKind;
use crate::registry::OperationHandle;
use crate::registry::OperationPhase;
use crate::registry::OperationRegistry;
use crate::report::ProgressReporter;
use crate::timeout::TimeoutScheduler;

/// Result of a user-confirmed manual extension request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualExtension {
    /// The budget grew by `added`; `remaining` is the budget left right
    /// after the extension landed.
    Extended {
        added: Duration,
        remaining: Option<Duration>,
    },
    /// An automatic or manual attempt already holds the slot; nothing was
    /// applied. The caller may simply retry on the next confirmation.
    AttemptInFlight,
    /// The step would push past the absolute ceiling.
    CeilingReached,
    /// No operation (or no armed timer) to extend.
    NothingToExtend,
}

/// Composition root for the engine: owns the scheduler, the extension gate,
/// and the per-user busy registry. The hosting process creates one of these
/// and hands it to both transports; there is no global state.
pub struct OperationManager {
    config: TimingConfig,
    scheduler: TimeoutScheduler,
    gate: Arc<ExtensionGate>,
    registry: Arc<OperationRegistry>,
    reporter: Arc<dyn ProgressReporter>,
}

impl OperationManager {
    pub fn new(config: TimingConfig, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            config,
            scheduler: TimeoutScheduler::new(),
            gate: Arc::new(ExtensionGate::new()),
            registry: Arc::new(OperationRegistry::new()),
            reporter,
        }
    }

    pub fn config(&self) -> &TimingConfig {
        &self.config
    }

    pub fn is_busy(&self, user_id: UserId) -> bool {
        self.registry.is_busy(user_id)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<OperationEvent> {
        self.registry.subscribe()
    }

    pub fn list_operations(&self) -> Vec<OperationDescriptor> {
        self.registry.list_descriptors()
    }

    /// Runs one operation for `user_id` to its terminal outcome, consuming
    /// `events` from the assistant transport. The transport may supply its
    /// own initial budget; the configured default applies otherwise.
    /// Returns [`crate::StewardErr::OperationInFlight`] when the user
    /// already has one running; otherwise resolves exactly once with the
    /// outcome.
    pub async fn run_operation(
        &self,
        user_id: UserId,
        initial_duration: Option<Duration>,
        events: Receiver<AssistantEvent>,
    ) -> Result<OperationOutcome> {
        let operation_id = OperationId::new();
        let cancel = CancellationToken::new();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let initial = initial_duration.unwrap_or_else(|| self.config.initial_duration());

        let descriptor = OperationDescriptor {
            user_id,
            operation_id,
            phase: OperationPhase::Starting,
            uptime: Duration::ZERO,
            remaining_budget: Some(initial),
            auto_extensions: 0,
            buffered_bytes: 0,
            buffer_truncated: false,
        };
        let handle = Arc::new(OperationHandle {
            operation_id,
            cancel: cancel.clone(),
            _control_keepalive: control_tx.clone(),
            descriptor: StdMutex::new(descriptor.clone()),
        });
        self.registry.try_insert(user_id, handle)?;

        let fire_tx = control_tx;
        self.scheduler.arm(user_id, initial, move |fired| {
            // The loop may already be tearing down; a dropped receiver is
            // fine, the latched outcome wins either way.
            let _ = fire_tx.send(ControlSignal::DeadlineExpired(fired));
        });

        info!(
            user = %user_id,
            operation = %operation_id,
            budget_ms = initial.as_millis() as u64,
            "operation started"
        );
        self.registry.record(OperationEventKind::Started, descriptor);

        let outcome = OperationLoop::new(
            user_id,
            operation_id,
            self.config.clone(),
            self.scheduler.clone(),
            Arc::clone(&self.gate),
            Arc::clone(&self.registry),
            Arc::clone(&self.reporter),
            cancel,
        )
        .run(events, control_rx)
        .await;

        // The loop already cleared the scheduler entry; both teardown paths
        // are idempotent against each other's timing.
        self.scheduler.clear(user_id);
        self.registry.remove(user_id);
        info!(
            user = %user_id,
            operation = %operation_id,
            outcome = outcome_label(&outcome),
            "operation finished"
        );
        Ok(outcome)
    }

    /// A user-confirmed manual extension, routed through the same guarded
    /// path as the automatic check: at most one attempt lands per
    /// contention window. The transport may supply its own amount; the
    /// configured step applies otherwise.
    pub fn request_manual_extension(
        &self,
        user_id: UserId,
        amount: Option<Duration>,
    ) -> ManualExtension {
        if !self.registry.is_busy(user_id) {
            debug!(user = %user_id, "manual extension with no operation in flight");
            return ManualExtension::NothingToExtend;
        }
        let step = amount.unwrap_or_else(|| self.config.extension_step());
        let attempt = self.gate.try_extend(
            &self.scheduler,
            user_id,
            ExtensionTrigger::Manual,
            step,
            self.config.max_total_duration(),
        );
        match attempt {
            ExtensionAttempt::Applied { added } => {
                info!(
                    user = %user_id,
                    added_ms = added.as_millis() as u64,
                    "budget extended manually"
                );
                ManualExtension::Extended {
                    added,
                    remaining: self.scheduler.remaining(user_id),
                }
            }
            ExtensionAttempt::Contended => {
                debug!(user = %user_id, "manual extension contended; nothing applied");
                ManualExtension::AttemptInFlight
            }
            ExtensionAttempt::CeilingReached => {
                info!(user = %user_id, "manual extension rejected at the ceiling");
                ManualExtension::CeilingReached
            }
            ExtensionAttempt::NothingToExtend => ManualExtension::NothingToExtend,
        }
    }

    /// Requests cooperative cancellation. Returns `false` when the user has
    /// nothing in flight. The operation observes the request at its next
    /// loop iteration and resolves `Cancelled`.
    pub fn request_cancel(&self, user_id: UserId) -> bool {
        match self.registry.get(user_id) {
            Some(handle) => {
                info!(user = %user_id, operation = %handle.operation_id, "cancellation requested");
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

fn outcome_label(outcome: &OperationOutcome) -> &'static str {
    match outcome {
        OperationOutcome::Completed(_) => "completed",
        OperationOutcome::Cancelled(_) => "cancelled",
        OperationOutcome::TimedOut(_) => "timed_out",
        OperationOutcome::Failed(_) => "failed",
    }
}
