//! Mutual exclusion keyed by hashable values from an open domain.

use crate::queue::QueueHandle;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::Arc;

/// A mutex whose lock identity is a key rather than a memory location.
///
/// Locks for distinct keys are independent; the set of lockable keys is
/// unbounded and per-key state is dropped once a key has no holder and no
/// waiters. The zero-key case costs nothing: a fresh `KeyMutex` owns a single
/// empty map.
///
/// [`KeyMutex::lock_detached`] integrates with bounded [`Queue`]s: a handler
/// that must block on a lock held by another handler of the same queue would
/// otherwise pin its work grant while waiting, deadlocking the queue once
/// every grant is pinned this way.
///
/// [`Queue`]: crate::Queue
pub struct KeyMutex<K> {
    keys: Mutex<FxHashMap<K, Arc<KeyState>>>,
}

struct KeyState {
    inner: Mutex<KeyStateInner>,
    unlocked: Condvar,
}

struct KeyStateInner {
    locked: bool,
    // Holders plus waiters. The registry entry is removed when this drops to
    // zero, so an uncontended unlock leaves no trace of the key.
    refs: usize,
}

impl Default for KeyState {
    fn default() -> Self {
        Self {
            inner: Mutex::new(KeyStateInner {
                locked: false,
                refs: 0,
            }),
            unlocked: Condvar::new(),
        }
    }
}

impl<K: Eq + Hash> KeyMutex<K> {
    /// Create a key mutex with no locked keys.
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(FxHashMap::default()),
        }
    }

    /// Block until the lock for `key` is acquired.
    pub fn lock(&self, key: K) {
        self.lock_inner(key, None);
    }

    /// Like [`KeyMutex::lock`], for use inside a queue handler. If the lock
    /// is contended, the handler detaches from its queue for the duration of
    /// the wait and reattaches once the lock is acquired; if the lock is free
    /// the handler's attachment is untouched.
    pub fn lock_detached(&self, handle: &mut QueueHandle<'_>, key: K) {
        self.lock_inner(key, Some(handle));
    }

    /// Release the lock for `key`.
    ///
    /// # Panics
    ///
    /// Panics if `key` is not currently locked; that is a bug in the caller.
    pub fn unlock(&self, key: &K) {
        let mut keys = self.keys.lock();
        let state = keys
            .get(key)
            .cloned()
            .expect("unlock of a key that is not locked");

        let mut inner = state.inner.lock();
        assert!(inner.locked, "unlock of a key that is not locked");
        inner.locked = false;
        inner.refs -= 1;
        if inner.refs == 0 {
            keys.remove(key);
        }
        drop(inner);
        drop(keys);

        state.unlocked.notify_one();
    }

    fn lock_inner(&self, key: K, mut handle: Option<&mut QueueHandle<'_>>) {
        let state = {
            let mut keys = self.keys.lock();
            let state = Arc::clone(keys.entry(key).or_default());
            state.inner.lock().refs += 1;
            state
        };

        let mut inner = state.inner.lock();
        while inner.locked {
            // Contended. Leave the queue's concurrency cap before blocking,
            // so another handler (perhaps the lock holder) can run.
            if let Some(handle) = handle.as_deref_mut() {
                handle.detach();
            }
            state.unlocked.wait(&mut inner);
        }
        inner.locked = true;
        drop(inner);

        if let Some(handle) = handle {
            handle.reattach();
        }
    }
}

impl<K: Eq + Hash> Default for KeyMutex<K> {
    fn default() -> Self {
        Self::new()
    }
}
