//! Single-assignment result cells shared between queue workers and waiters.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// The error half of a cached queue result.
///
/// Handler errors are cached verbatim and surfaced to every waiter for the
/// key; the handler is never retried. A handler that panics completes its
/// task with [`TaskError::Panicked`] so that waiters are unblocked rather
/// than hung or poisoned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError<E> {
    /// The handler returned an error.
    #[error("{0}")]
    Handler(E),

    /// The handler panicked before returning a result.
    #[error("handler panicked before returning a result")]
    Panicked,
}

pub(crate) type Outcome<V, E> = Result<V, TaskError<E>>;

/// A single-assignment cell holding the result for one key.
///
/// Created the first time its key is submitted and kept for the lifetime of
/// the queue; the stored result is immutable once written.
pub(crate) struct Task<V, E> {
    result: Mutex<Option<Outcome<V, E>>>,
    done: Condvar,
}

impl<V: Clone, E: Clone> Task<V, E> {
    pub(crate) fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    /// Block until the task completes, then return a clone of its result.
    /// May be called any number of times from any number of threads.
    pub(crate) fn wait(&self) -> Outcome<V, E> {
        let mut result = self.result.lock();
        loop {
            if let Some(outcome) = result.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut result);
        }
    }

    /// Publish the result and unblock all waiters. Called exactly once, by
    /// the worker that ran the handler for this task's key.
    pub(crate) fn complete(&self, outcome: Outcome<V, E>) {
        let mut result = self.result.lock();
        debug_assert!(result.is_none(), "task completed more than once");
        *result = Some(outcome);
        drop(result);
        self.done.notify_all();
    }
}

/// The tasks backing one `get_all`/`collect` call, in request order.
pub(crate) struct TaskList<V, E>(pub(crate) Vec<Arc<Task<V, E>>>);

impl<V: Clone, E: Clone> TaskList<V, E> {
    /// Wait for each task in order, returning the values or the first error
    /// with respect to the request ordering. Does not wait for tasks after
    /// the first failed one.
    pub(crate) fn wait(&self) -> Result<Vec<V>, TaskError<E>> {
        let mut values = Vec::with_capacity(self.0.len());
        for task in &self.0 {
            values.push(task.wait()?);
        }
        Ok(values)
    }

    /// Wait for every task to complete, then return the values or the first
    /// error with respect to the request ordering.
    pub(crate) fn wait_all(&self) -> Result<Vec<V>, TaskError<E>> {
        let outcomes: Vec<_> = self.0.iter().map(|task| task.wait()).collect();
        outcomes.into_iter().collect()
    }
}
