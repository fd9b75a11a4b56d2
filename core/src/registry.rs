use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use steward_protocol::OperationId;
use steward_protocol::UserId;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StewardErr;
use crate::timeout::FiredDeadline;
use crate::util::MutexExt;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Signals delivered to an operation loop outside its event stream.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ControlSignal {
    /// The scheduler's armed deadline expired.
    DeadlineExpired(FiredDeadline),
}

/// Lifecycle phase of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPhase {
    Starting,
    Active,
    Compacting,
    Completed,
    Cancelled,
    TimedOut,
    Failed,
}

impl OperationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationPhase::Completed
                | OperationPhase::Cancelled
                | OperationPhase::TimedOut
                | OperationPhase::Failed
        )
    }
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OperationPhase::Starting => "starting",
            OperationPhase::Active => "active",
            OperationPhase::Compacting => "compacting",
            OperationPhase::Completed => "completed",
            OperationPhase::Cancelled => "cancelled",
            OperationPhase::TimedOut => "timed_out",
            OperationPhase::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Point-in-time view of one operation, safe to hand to observers.
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    pub user_id: UserId,
    pub operation_id: OperationId,
    pub phase: OperationPhase,
    pub uptime: Duration,
    pub remaining_budget: Option<Duration>,
    pub auto_extensions: u32,
    pub buffered_bytes: usize,
    pub buffer_truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationEventKind {
    Started,
    Updated,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct OperationEvent {
    pub kind: OperationEventKind,
    pub descriptor: OperationDescriptor,
}

pub(crate) struct OperationHandle {
    pub(crate) operation_id: OperationId,
    pub(crate) cancel: CancellationToken,
    /// Keeps the loop's control channel open for the lifetime of the
    /// operation, even after a fired deadline drops the scheduler's sender.
    pub(crate) _control_keepalive: mpsc::UnboundedSender<ControlSignal>,
    pub(crate) descriptor: StdMutex<OperationDescriptor>,
}

/// Owned map of in-flight operations plus the lifecycle broadcast. One
/// entry per user; presence of an entry is the busy flag. No globals: the
/// hosting process owns this through its [`crate::OperationManager`].
pub struct OperationRegistry {
    operations: StdMutex<HashMap<UserId, Arc<OperationHandle>>>,
    events_tx: broadcast::Sender<OperationEvent>,
}

impl OperationRegistry {
    pub(crate) fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            operations: StdMutex::new(HashMap::new()),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.events_tx.subscribe()
    }

    pub fn is_busy(&self, user_id: UserId) -> bool {
        self.operations.lock_unchecked().contains_key(&user_id)
    }

    pub fn list_descriptors(&self) -> Vec<OperationDescriptor> {
        let operations = self.operations.lock_unchecked();
        let mut descriptors: Vec<OperationDescriptor> = operations
            .values()
            .map(|handle| handle.descriptor.lock_unchecked().clone())
            .collect();
        descriptors.sort_by_key(|descriptor| descriptor.user_id.0);
        descriptors
    }

    pub(crate) fn get(&self, user_id: UserId) -> Option<Arc<OperationHandle>> {
        self.operations.lock_unchecked().get(&user_id).cloned()
    }

    /// Claims the busy slot for `user_id`; the insert and the occupancy
    /// check happen under one lock.
    pub(crate) fn try_insert(
        &self,
        user_id: UserId,
        handle: Arc<OperationHandle>,
    ) -> Result<(), StewardErr> {
        let mut operations = self.operations.lock_unchecked();
        if operations.contains_key(&user_id) {
            return Err(StewardErr::OperationInFlight { user_id });
        }
        operations.insert(user_id, handle);
        Ok(())
    }

    /// Clears the busy slot. A no-op when already cleared.
    pub(crate) fn remove(&self, user_id: UserId) -> Option<Arc<OperationHandle>> {
        self.operations.lock_unchecked().remove(&user_id)
    }

    /// Caches the descriptor for queries and fans it out to subscribers.
    /// Lagging or absent subscribers are not an error.
    pub(crate) fn record(&self, kind: OperationEventKind, descriptor: OperationDescriptor) {
        if let Some(handle) = self.get(descriptor.user_id) {
            *handle.descriptor.lock_unchecked() = descriptor.clone();
        }
        let _ = self.events_tx.send(OperationEvent { kind, descriptor });
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn handle(operation_id: OperationId, user_id: UserId) -> Arc<OperationHandle> {
        let (control_tx, _control_rx) = mpsc::unbounded_channel();
        Arc::new(OperationHandle {
            operation_id,
            cancel: CancellationToken::new(),
            _control_keepalive: control_tx,
            descriptor: StdMutex::new(OperationDescriptor {
                user_id,
                operation_id,
                phase: OperationPhase::Starting,
                uptime: Duration::ZERO,
                remaining_budget: None,
                auto_extensions: 0,
                buffered_bytes: 0,
                buffer_truncated: false,
            }),
        })
    }

    #[test]
    fn second_insert_for_the_same_user_is_rejected() {
        let registry = OperationRegistry::new();
        let user = UserId::new(1);
        registry
            .try_insert(user, handle(OperationId::new(), user))
            .expect("first insert");
        let err = registry
            .try_insert(user, handle(OperationId::new(), user))
            .expect_err("second insert");
        assert!(matches!(err, StewardErr::OperationInFlight { user_id } if user_id == user));
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = OperationRegistry::new();
        let user = UserId::new(1);
        registry
            .try_insert(user, handle(OperationId::new(), user))
            .expect("insert");
        assert!(registry.remove(user).is_some());
        assert!(registry.remove(user).is_none());
        assert!(!registry.is_busy(user));
    }

    #[test]
    fn descriptors_list_in_user_order() {
        let registry = OperationRegistry::new();
        for id in [3, 1, 2] {
            let user = UserId::new(id);
            registry
                .try_insert(user, handle(OperationId::new(), user))
                .expect("insert");
        }
        let users: Vec<i64> = registry
            .list_descriptors()
            .into_iter()
            .map(|descriptor| descriptor.user_id.0)
            .collect();
        assert_eq!(users, vec![1, 2, 3]);
    }
}
