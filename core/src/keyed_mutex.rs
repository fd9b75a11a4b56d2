use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::Mutex;

use crate::util::MutexExt;

/// Non-blocking mutual exclusion keyed by an arbitrary identifier.
///
/// `try_acquire` either takes the slot immediately or reports it held;
/// nothing ever blocks or queues. Slots release through the returned guard,
/// which runs on every exit path out of the critical section, panics
/// included. The table is shared behind one mutex, so the check-and-insert
/// is atomic under a preemptive runtime.
pub struct KeyedMutex<K> {
    held: Arc<Mutex<HashSet<K>>>,
}

impl<K> KeyedMutex<K> {
    pub fn new() -> Self {
        Self {
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl<K> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    /// Takes `key` if it is free. Returns `None` immediately otherwise.
    pub fn try_acquire(&self, key: K) -> Option<KeyedGuard<K>> {
        let mut held = self.held.lock_unchecked();
        if held.insert(key.clone()) {
            Some(KeyedGuard {
                table: Arc::clone(&self.held),
                key: Some(key),
            })
        } else {
            None
        }
    }

    /// Takes `key` only if neither `key` nor `excluded` is held. The check
    /// and the insert happen under one table lock, so of any number of
    /// concurrent attempts across the two slots exactly one proceeds.
    pub fn try_acquire_excluding(&self, key: K, excluded: &K) -> Option<KeyedGuard<K>> {
        let mut held = self.held.lock_unchecked();
        if held.contains(excluded) || !held.insert(key.clone()) {
            return None;
        }
        Some(KeyedGuard {
            table: Arc::clone(&self.held),
            key: Some(key),
        })
    }

    /// Unconditional release; a no-op when the slot is already free. The
    /// guard is the normal release path, this exists for recovery callers.
    pub fn release(&self, key: &K) {
        self.held.lock_unchecked().remove(key);
    }

    pub fn is_held(&self, key: &K) -> bool {
        self.held.lock_unchecked().contains(key)
    }

    pub fn len(&self) -> usize {
        self.held.lock_unchecked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.lock_unchecked().is_empty()
    }
}

/// Holds one slot of a [`KeyedMutex`]; dropping it releases the slot.
pub struct KeyedGuard<K: Eq + Hash> {
    table: Arc<Mutex<HashSet<K>>>,
    key: Option<K>,
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.table.lock_unchecked().remove(&key);
        }
    }
}
