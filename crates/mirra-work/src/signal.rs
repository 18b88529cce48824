//! One-shot notification between threads.

use parking_lot::{Condvar, Mutex};

/// A one-shot signal. One side calls [`Signal::notify`] exactly once; any
/// number of threads may block in [`Signal::wait`] before or after that.
///
/// Used by the queue to hand a work grant to a reattaching handler, which
/// must block until a grant holder signals the transfer.
pub(crate) struct Signal {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            fired: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Fire the signal, waking all current and future waiters.
    pub(crate) fn notify(&self) {
        let mut fired = self.fired.lock();
        *fired = true;
        drop(fired);
        self.cond.notify_all();
    }

    /// Block until the signal fires. Returns immediately if it already has.
    pub(crate) fn wait(&self) {
        let mut fired = self.fired.lock();
        while !*fired {
            self.cond.wait(&mut fired);
        }
    }
}
