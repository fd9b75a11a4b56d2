use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// Locks a std mutex, recovering the guard when a previous holder panicked.
/// Every registry in this crate keeps its entries valid across any single
/// mutation, so a poisoned flag carries no information worth propagating.
pub(crate) trait MutexExt<T> {
    fn lock_unchecked(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_unchecked(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
