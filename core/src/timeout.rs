use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use steward_protocol::UserId;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::sleep_until;
use tracing::debug;
use tracing::warn;

use crate::util::MutexExt;

/// Snapshot handed to `on_fire` when a deadline expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredDeadline {
    pub original_duration: Duration,
    pub total_extension: Duration,
}

impl FiredDeadline {
    /// The full budget that was exhausted.
    pub fn effective_duration(&self) -> Duration {
        self.original_duration + self.total_extension
    }
}

/// Callback invoked when a user's deadline expires. Must be cheap and
/// non-blocking; the usual implementation pushes a signal onto the
/// operation's control channel.
pub type OnFire = dyn Fn(FiredDeadline) + Send + Sync;

struct UserTimeout {
    original_duration: Duration,
    total_extension: Duration,
    started_at: Instant,
    /// Bumped on every (re)schedule; a sleeper whose epoch no longer
    /// matches lost a race against extend/clear and must not fire.
    epoch: u64,
    timer: JoinHandle<()>,
    on_fire: Arc<OnFire>,
}

/// Per-user deadline registry. At most one live timer per user at any
/// instant: arming replaces, extending reschedules, clearing aborts. All
/// remaining-time arithmetic is anchored to the instant the timer was
/// first armed, never to the time of a later call.
#[derive(Clone)]
pub struct TimeoutScheduler {
    inner: Arc<TimeoutRegistry>,
}

#[derive(Default)]
struct TimeoutRegistry {
    entries: StdMutex<HashMap<UserId, UserTimeout>>,
}

impl TimeoutScheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TimeoutRegistry::default()),
        }
    }

    /// Arms the deadline for `user_id`; `on_fire` runs once after
    /// `duration` unless the entry is extended or cleared first.
    ///
    /// Callers are expected to `clear` before re-arming. If an entry is
    /// still present its timer is aborted rather than leaked.
    pub fn arm(
        &self,
        user_id: UserId,
        duration: Duration,
        on_fire: impl Fn(FiredDeadline) + Send + Sync + 'static,
    ) {
        let on_fire: Arc<OnFire> = Arc::new(on_fire);
        let mut entries = self.inner.entries.lock_unchecked();
        if let Some(previous) = entries.remove(&user_id) {
            warn!(user = %user_id, "arming over a live timeout entry; aborting the old timer");
            previous.timer.abort();
        }
        let timer = self.inner.spawn_sleeper(user_id, duration, 0);
        entries.insert(
            user_id,
            UserTimeout {
                original_duration: duration,
                total_extension: Duration::ZERO,
                started_at: Instant::now(),
                epoch: 0,
                timer,
                on_fire,
            },
        );
    }

    /// Adds `extra` to the budget and reschedules the pending fire.
    /// Returns `false` when nothing is armed for `user_id`.
    pub fn extend(&self, user_id: UserId, extra: Duration) -> bool {
        let mut entries = self.inner.entries.lock_unchecked();
        let Some(entry) = entries.get_mut(&user_id) else {
            return false;
        };
        entry.total_extension += extra;
        // Remaining time is measured from the fixed start anchor, not from
        // the time of this call. Goes to zero, never negative.
        let remaining = remaining_budget(
            entry.original_duration,
            entry.total_extension,
            entry.started_at.elapsed(),
        );
        entry.timer.abort();
        entry.epoch += 1;
        entry.timer = self.inner.spawn_sleeper(user_id, remaining, entry.epoch);
        true
    }

    /// Cancels and removes the entry. A no-op when nothing is armed.
    pub fn clear(&self, user_id: UserId) {
        let mut entries = self.inner.entries.lock_unchecked();
        if let Some(entry) = entries.remove(&user_id) {
            entry.timer.abort();
        }
    }

    pub fn is_armed(&self, user_id: UserId) -> bool {
        self.inner.entries.lock_unchecked().contains_key(&user_id)
    }

    pub fn original_duration(&self, user_id: UserId) -> Option<Duration> {
        let entries = self.inner.entries.lock_unchecked();
        entries.get(&user_id).map(|entry| entry.original_duration)
    }

    pub fn total_extension(&self, user_id: UserId) -> Option<Duration> {
        let entries = self.inner.entries.lock_unchecked();
        entries.get(&user_id).map(|entry| entry.total_extension)
    }

    pub fn elapsed(&self, user_id: UserId) -> Option<Duration> {
        let entries = self.inner.entries.lock_unchecked();
        entries.get(&user_id).map(|entry| entry.started_at.elapsed())
    }

    pub fn remaining(&self, user_id: UserId) -> Option<Duration> {
        let entries = self.inner.entries.lock_unchecked();
        entries.get(&user_id).map(|entry| {
            remaining_budget(
                entry.original_duration,
                entry.total_extension,
                entry.started_at.elapsed(),
            )
        })
    }
}

impl Default for TimeoutScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutRegistry {
    fn spawn_sleeper(self: &Arc<Self>, user_id: UserId, delay: Duration, epoch: u64) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        // Anchor the firing time to an absolute deadline computed now, while
        // the caller holds the registry lock. `sleep_until` keeps the fire at
        // `now + delay` regardless of when the spawned task is first polled,
        // matching the design's fixed-anchor invariant (startedAt + original +
        // total_extension).
        let deadline = Instant::now() + delay;
        tokio::spawn(async move {
            sleep_until(deadline).await;
            registry.fire(user_id, epoch);
        })
    }

    fn fire(&self, user_id: UserId, epoch: u64) {
        let fired = {
            let mut entries = self.entries.lock_unchecked();
            let current = entries.get(&user_id).is_some_and(|entry| entry.epoch == epoch);
            if !current {
                debug!(user = %user_id, epoch, "stale timer fire ignored");
                return;
            }
            // Consume the entry so a fired deadline can never fire twice
            // and later extends report nothing to extend.
            entries.remove(&user_id).map(|entry| {
                let snapshot = FiredDeadline {
                    original_duration: entry.original_duration,
                    total_extension: entry.total_extension,
                };
                (snapshot, entry.on_fire)
            })
        };
        if let Some((snapshot, on_fire)) = fired {
            on_fire(snapshot);
        }
    }
}

fn remaining_budget(original: Duration, total_extension: Duration, elapsed: Duration) -> Duration {
    (original + total_extension).saturating_sub(elapsed)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use pretty_assertions::assert_eq;
    use tokio::time::advance;

    use super::*;

    fn fire_counter() -> (Arc<AtomicUsize>, impl Fn(FiredDeadline) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        (count, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_at_the_armed_deadline() {
        let scheduler = TimeoutScheduler::new();
        let user = UserId::new(1);
        let (fired, on_fire) = fire_counter();
        scheduler.arm(user, Duration::from_millis(300_000), on_fire);

        advance(Duration::from_millis(299_999)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_armed(user));
    }

    #[tokio::test(start_paused = true)]
    async fn extension_reschedules_against_the_original_anchor() {
        let scheduler = TimeoutScheduler::new();
        let user = UserId::new(1);
        let (fired, on_fire) = fire_counter();
        scheduler.arm(user, Duration::from_millis(300_000), on_fire);

        advance(Duration::from_millis(240_000)).await;
        assert!(scheduler.extend(user, Duration::from_millis(300_000)));
        assert_eq!(
            scheduler.original_duration(user),
            Some(Duration::from_millis(300_000))
        );
        assert_eq!(
            scheduler.total_extension(user),
            Some(Duration::from_millis(300_000))
        );
        assert_eq!(
            scheduler.remaining(user),
            Some(Duration::from_millis(360_000))
        );

        // Due at t=600s exactly: not at 540s (recomputed from the anchor,
        // not doubled), not at 840s (elapsed time is not re-granted).
        advance(Duration::from_millis(359_999)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_extensions_accumulate() {
        let scheduler = TimeoutScheduler::new();
        let user = UserId::new(7);
        let (fired, on_fire) = fire_counter();
        scheduler.arm(user, Duration::from_millis(100_000), on_fire);

        advance(Duration::from_millis(50_000)).await;
        assert!(scheduler.extend(user, Duration::from_millis(20_000)));
        advance(Duration::from_millis(50_000)).await;
        assert!(scheduler.extend(user, Duration::from_millis(20_000)));
        assert_eq!(
            scheduler.total_extension(user),
            Some(Duration::from_millis(40_000))
        );
        assert_eq!(
            scheduler.original_duration(user),
            Some(Duration::from_millis(100_000))
        );

        // Fire due at 100s + 40s = 140s; elapsed is 100s.
        advance(Duration::from_millis(39_999)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn extend_without_an_armed_timer_returns_false() {
        let scheduler = TimeoutScheduler::new();
        assert!(!scheduler.extend(UserId::new(1), Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn extend_after_fire_reports_nothing_to_extend() {
        let scheduler = TimeoutScheduler::new();
        let user = UserId::new(1);
        let (fired, on_fire) = fire_counter();
        scheduler.arm(user, Duration::from_millis(1_000), on_fire);

        advance(Duration::from_millis(1_000)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.extend(user, Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_the_pending_fire_and_is_idempotent() {
        let scheduler = TimeoutScheduler::new();
        let user = UserId::new(1);
        let (fired, on_fire) = fire_counter();
        scheduler.arm(user, Duration::from_millis(5_000), on_fire);

        scheduler.clear(user);
        scheduler.clear(user);
        assert!(!scheduler.is_armed(user));
        assert_eq!(scheduler.elapsed(user), None);

        advance(Duration::from_millis(10_000)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_aborts_the_previous_timer() {
        let scheduler = TimeoutScheduler::new();
        let user = UserId::new(1);
        let (first_fired, first_on_fire) = fire_counter();
        let (second_fired, second_on_fire) = fire_counter();
        scheduler.arm(user, Duration::from_millis(100_000), first_on_fire);
        scheduler.arm(user, Duration::from_millis(200_000), second_on_fire);

        advance(Duration::from_millis(100_000)).await;
        settle().await;
        assert_eq!(first_fired.load(Ordering::SeqCst), 0);
        assert_eq!(second_fired.load(Ordering::SeqCst), 0);

        advance(Duration::from_millis(100_000)).await;
        settle().await;
        assert_eq!(first_fired.load(Ordering::SeqCst), 0);
        assert_eq!(second_fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fire_reports_the_exhausted_budget() {
        let scheduler = TimeoutScheduler::new();
        let user = UserId::new(9);
        let seen = Arc::new(StdMutex::new(None));
        let sink = Arc::clone(&seen);
        scheduler.arm(user, Duration::from_millis(100_000), move |fired| {
            *sink.lock_unchecked() = Some(fired);
        });
        advance(Duration::from_millis(60_000)).await;
        assert!(scheduler.extend(user, Duration::from_millis(30_000)));

        advance(Duration::from_millis(70_000)).await;
        settle().await;
        let fired = seen.lock_unchecked().take().expect("deadline fired");
        assert_eq!(fired.original_duration, Duration::from_millis(100_000));
        assert_eq!(fired.total_extension, Duration::from_millis(30_000));
        assert_eq!(fired.effective_duration(), Duration::from_millis(130_000));
    }

    #[test]
    fn remaining_budget_clamps_to_zero_when_overspent() {
        assert_eq!(
            remaining_budget(
                Duration::from_millis(300_000),
                Duration::ZERO,
                Duration::from_millis(301_000),
            ),
            Duration::ZERO
        );
        assert_eq!(
            remaining_budget(
                Duration::from_millis(300_000),
                Duration::from_millis(300_000),
                Duration::from_millis(240_000),
            ),
            Duration::from_millis(360_000)
        );
    }
}
