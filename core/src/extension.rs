use std::fmt;
use std::time::Duration;

use steward_protocol::UserId;
use tracing::debug;

use crate::keyed_mutex::KeyedMutex;
use crate::timeout::TimeoutScheduler;

/// Which call site is attempting the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionTrigger {
    /// The operation loop's periodic activity check.
    Auto,
    /// A user-confirmed request arriving through the chat transport.
    Manual,
}

impl ExtensionTrigger {
    fn counterpart(self) -> Self {
        match self {
            ExtensionTrigger::Auto => ExtensionTrigger::Manual,
            ExtensionTrigger::Manual => ExtensionTrigger::Auto,
        }
    }
}

impl fmt::Display for ExtensionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionTrigger::Auto => f.write_str("auto"),
            ExtensionTrigger::Manual => f.write_str("manual"),
        }
    }
}

/// Lock key: one slot per user and trigger. The two triggers get distinct
/// slots so diagnostics show which side holds one, but acquisition checks
/// both slots atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtensionKey {
    pub user_id: UserId,
    pub trigger: ExtensionTrigger,
}

impl ExtensionKey {
    pub fn new(user_id: UserId, trigger: ExtensionTrigger) -> Self {
        Self { user_id, trigger }
    }

    pub fn counterpart(self) -> Self {
        Self {
            user_id: self.user_id,
            trigger: self.trigger.counterpart(),
        }
    }
}

/// Outcome of one guarded extension attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionAttempt {
    /// The budget grew by `added`.
    Applied { added: Duration },
    /// Another attempt for this user holds a slot; this one was skipped.
    Contended,
    /// Applying the step would push past the absolute ceiling.
    CeilingReached,
    /// No timer armed for this user.
    NothingToExtend,
}

/// Serializes extension attempts per user. Both call sites route through
/// [`ExtensionGate::try_extend`]; nothing else may call
/// [`TimeoutScheduler::extend`] for a user with an operation in flight.
pub struct ExtensionGate {
    locks: KeyedMutex<ExtensionKey>,
}

impl ExtensionGate {
    pub fn new() -> Self {
        Self {
            locks: KeyedMutex::new(),
        }
    }

    /// Number of slots currently held, for leak diagnostics.
    pub fn held_slots(&self) -> usize {
        self.locks.len()
    }

    /// One extension attempt under the per-user slot. Never blocks: a held
    /// slot (either trigger's) means another attempt is mid-flight and this
    /// one is dropped. The ceiling is rechecked here, inside the slot, so
    /// two attempts that both passed a stale policy check cannot stack past
    /// the maximum.
    pub fn try_extend(
        &self,
        scheduler: &TimeoutScheduler,
        user_id: UserId,
        trigger: ExtensionTrigger,
        step: Duration,
        max_total: Duration,
    ) -> ExtensionAttempt {
        let key = ExtensionKey::new(user_id, trigger);
        let Some(_slot) = self.locks.try_acquire_excluding(key, &key.counterpart()) else {
            debug!(user = %user_id, trigger = %trigger, "extension attempt contended; skipping");
            return ExtensionAttempt::Contended;
        };

        // `_slot` releases on every path out of this scope.
        let Some(elapsed) = scheduler.elapsed(user_id) else {
            return ExtensionAttempt::NothingToExtend;
        };
        if elapsed + step > max_total {
            return ExtensionAttempt::CeilingReached;
        }
        if scheduler.extend(user_id, step) {
            ExtensionAttempt::Applied { added: step }
        } else {
            ExtensionAttempt::NothingToExtend
        }
    }
}

impl Default for ExtensionGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    use super::*;

    const STEP: Duration = Duration::from_millis(1_200_000);
    const MAX_TOTAL: Duration = Duration::from_millis(7_200_000);

    #[tokio::test(start_paused = true)]
    async fn applied_attempt_grows_the_budget_by_one_step() {
        let scheduler = TimeoutScheduler::new();
        let gate = ExtensionGate::new();
        let user = UserId::new(1);
        scheduler.arm(user, Duration::from_millis(1_800_000), |_| {});

        let attempt = gate.try_extend(&scheduler, user, ExtensionTrigger::Auto, STEP, MAX_TOTAL);
        assert_eq!(attempt, ExtensionAttempt::Applied { added: STEP });
        assert_eq!(scheduler.total_extension(user), Some(STEP));
        assert_eq!(gate.held_slots(), 0);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn held_counterpart_slot_contends_the_attempt() {
        let scheduler = TimeoutScheduler::new();
        let gate = ExtensionGate::new();
        let user = UserId::new(1);
        scheduler.arm(user, Duration::from_millis(1_800_000), |_| {});

        let manual_key = ExtensionKey::new(user, ExtensionTrigger::Manual);
        let held = gate.locks.try_acquire(manual_key).expect("hold manual slot");

        for _ in 0..19 {
            let attempt =
                gate.try_extend(&scheduler, user, ExtensionTrigger::Auto, STEP, MAX_TOTAL);
            assert_eq!(attempt, ExtensionAttempt::Contended);
        }
        assert_eq!(scheduler.total_extension(user), Some(Duration::ZERO));
        assert!(logs_contain("extension attempt contended"));

        drop(held);
        let attempt = gate.try_extend(&scheduler, user, ExtensionTrigger::Auto, STEP, MAX_TOTAL);
        assert_eq!(attempt, ExtensionAttempt::Applied { added: STEP });
        assert_eq!(scheduler.total_extension(user), Some(STEP));
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_is_enforced_inside_the_slot() {
        let scheduler = TimeoutScheduler::new();
        let gate = ExtensionGate::new();
        let user = UserId::new(1);
        scheduler.arm(user, Duration::from_millis(7_000_000), |_| {});

        tokio::time::advance(Duration::from_millis(6_100_000)).await;
        let attempt = gate.try_extend(&scheduler, user, ExtensionTrigger::Manual, STEP, MAX_TOTAL);
        assert_eq!(attempt, ExtensionAttempt::CeilingReached);
        assert_eq!(scheduler.total_extension(user), Some(Duration::ZERO));
        assert_eq!(gate.held_slots(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_to_extend_without_an_armed_timer() {
        let scheduler = TimeoutScheduler::new();
        let gate = ExtensionGate::new();
        let attempt = gate.try_extend(
            &scheduler,
            UserId::new(1),
            ExtensionTrigger::Manual,
            STEP,
            MAX_TOTAL,
        );
        assert_eq!(attempt, ExtensionAttempt::NothingToExtend);
        assert_eq!(gate.held_slots(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_attempts_never_stack_extensions() {
        let scheduler = TimeoutScheduler::new();
        let gate = std::sync::Arc::new(ExtensionGate::new());
        let scheduler_handle = scheduler.clone();
        let user = UserId::new(1);
        scheduler.arm(user, Duration::from_millis(1_800_000), |_| {});

        let mut tasks = Vec::new();
        for i in 0..20 {
            let gate = std::sync::Arc::clone(&gate);
            let scheduler = scheduler_handle.clone();
            let trigger = if i % 2 == 0 {
                ExtensionTrigger::Auto
            } else {
                ExtensionTrigger::Manual
            };
            tasks.push(tokio::spawn(async move {
                gate.try_extend(&scheduler, user, trigger, STEP, MAX_TOTAL)
            }));
        }

        let mut applied = 0u32;
        for task in tasks {
            if let ExtensionAttempt::Applied { .. } = task.await.expect("join attempt") {
                applied += 1;
            }
        }

        // Attempts that overlap contend; attempts that run back-to-back may
        // each land. Whatever the interleaving, the granted total must match
        // the number of applied attempts exactly.
        assert!(applied >= 1);
        let expected = Duration::from_millis(u64::from(applied) * 1_200_000);
        assert_eq!(scheduler.total_extension(user), Some(expected));
        assert_eq!(gate.held_slots(), 0);
    }
}
