//! Deduplicating, memoizing work queue with bounded concurrency.
//!
//! The queue acts like a map that computes and caches the result for each
//! unique key by running a handler on a worker thread. Concurrency is
//! optionally capped, with queued keys dispatched in submission order across
//! two priority levels. Handlers may temporarily leave the concurrency cap
//! (detach) to block on other handlers of the same queue, then rejoin ahead
//! of queued keys (reattach).

use crate::signal::Signal;
use crate::task::{Task, TaskError, TaskList};
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::trace;

/// Snapshot of queue progress counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Number of keys whose results are computed and cached.
    pub done: u64,

    /// Number of distinct keys ever submitted, including keys whose results
    /// are not yet computed.
    pub submitted: u64,
}

/// A deduplicating work queue.
///
/// Each distinct key maps to exactly one cached result, computed by calling
/// the handler on a new worker thread. Results with errors receive no special
/// treatment: they are cached as usual and their handlers are never retried.
///
/// If constructed with a nonzero concurrency, at most that many handlers run
/// at once (more if handlers detach; see [`QueueHandle::detach`]), and keys
/// beyond the cap are queued for dispatch in submission order.
///
/// `Queue` is a cheap clonable handle; clones share the same cache and
/// scheduler state.
pub struct Queue<K, V, E> {
    inner: Arc<Inner<K, V, E>>,
}

impl<K, V, E> Clone for Queue<K, V, E> {
    fn clone(&self) -> Self {
        Queue {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Clone, Copy)]
enum Urgency {
    Normal,
    Urgent,
}

impl<K, V, E> Queue<K, V, E>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create a queue that computes the result for each key with `handler`.
    ///
    /// If `concurrency` is nonzero, at most that many handlers run at once;
    /// `0` means unlimited.
    pub fn new<F>(concurrency: usize, handler: F) -> Self
    where
        F: Fn(&mut QueueHandle<'_>, &K) -> Result<V, E> + Send + Sync + 'static,
    {
        Queue {
            inner: Arc::new(Inner {
                handler: Box::new(handler),
                max_grants: concurrency,
                state: Mutex::new(WorkState::new()),
                tasks: Mutex::new(FxHashMap::default()),
                tasks_done: AtomicU64::new(0),
            }),
        }
    }

    /// Return the result for `key`, blocking if necessary until the handler
    /// for it finishes.
    pub fn get(&self, key: K) -> Result<V, TaskError<E>> {
        self.submit(vec![key], Urgency::Normal).0[0].wait()
    }

    /// Like [`Queue::get`], but a key not yet submitted is queued ahead of
    /// all waiting normal-priority keys.
    pub fn get_urgent(&self, key: K) -> Result<V, TaskError<E>> {
        self.submit(vec![key], Urgency::Urgent).0[0].wait()
    }

    /// Return the values for `keys`, or the first error among their results
    /// with respect to the order provided.
    ///
    /// On error, `get_all` does not wait for handlers of subsequent keys to
    /// finish; use [`Queue::collect`] to wait for every handler regardless.
    ///
    /// In a bounded queue, keys not yet submitted are queued in the order
    /// provided, without interleaving keys from any other call.
    pub fn get_all<I>(&self, keys: I) -> Result<Vec<V>, TaskError<E>>
    where
        I: IntoIterator<Item = K>,
    {
        self.submit(keys.into_iter().collect(), Urgency::Normal).wait()
    }

    /// Like [`Queue::get_all`], but keys not yet submitted are queued ahead
    /// of all waiting normal-priority keys. The most recent urgent batch runs
    /// first; keys within one batch keep their provided order.
    pub fn get_all_urgent<I>(&self, keys: I) -> Result<Vec<V>, TaskError<E>>
    where
        I: IntoIterator<Item = K>,
    {
        self.submit(keys.into_iter().collect(), Urgency::Urgent).wait()
    }

    /// Wait for every handler among `keys` to finish, then return the values
    /// or the first error with respect to the order provided.
    pub fn collect<I>(&self, keys: I) -> Result<Vec<V>, TaskError<E>>
    where
        I: IntoIterator<Item = K>,
    {
        self.submit(keys.into_iter().collect(), Urgency::Normal)
            .wait_all()
    }

    /// Snapshot the queue's progress counters.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            done: self.inner.tasks_done.load(Ordering::Relaxed),
            submitted: self.inner.tasks.lock().len() as u64,
        }
    }

    fn submit(&self, keys: Vec<K>, urgency: Urgency) -> TaskList<V, E> {
        let (tasks, new_keys) = self.inner.get_or_create_tasks(keys);
        Inner::schedule_new_keys(&self.inner, new_keys, urgency);
        tasks
    }
}

type BoxedHandler<K, V, E> =
    Box<dyn Fn(&mut QueueHandle<'_>, &K) -> Result<V, E> + Send + Sync>;

struct Inner<K, V, E> {
    handler: BoxedHandler<K, V, E>,

    // Unlimited concurrency queues have max_grants == 0. Otherwise this is
    // the maximum number of outstanding work grants; see WorkState.
    max_grants: usize,

    state: Mutex<WorkState<K>>,

    tasks: Mutex<FxHashMap<K, Arc<Task<V, E>>>>,
    tasks_done: AtomicU64,
}

/// Pending work in a bounded queue, along with the outstanding "work grants"
/// issued to handle it.
///
/// A work grant is an abstract token, not represented by any value. It stands
/// for both the right and the obligation to execute work on behalf of the
/// queue, and its issuance, transfer, and retirement follow a fixed protocol:
///
/// - To execute work on behalf of a bounded queue, a work grant must be held.
///
/// - To initiate new work while the number of outstanding grants is below the
///   concurrency cap, a grant is issued (incrementing `grants`) and its
///   recipient assumes all duties that come with it.
///
/// - To initiate new work while grants are at the cap, the key is held in
///   `normal` or `urgent` for later handling by an existing grant holder.
///
/// - A grant holder that finishes its current work must first offer its grant
///   to the head reattacher, then take the next held key, and only when both
///   are empty retire the grant (decrementing `grants`) and stop.
///
/// All three exit paths live in `Inner::next_queued_key_locked`; every
/// decrement of `grants` pairs with exactly one increment.
struct WorkState<K> {
    grants: usize,

    // Normal-priority keys, dispatched first-in first-out.
    normal: VecDeque<K>,

    // Urgent batches. The freshest batch is dispatched first, but keys within
    // one batch keep their submission order.
    urgent: VecDeque<VecDeque<K>>,

    // Detached handlers waiting for a grant transfer, first-come first-served.
    // Reattachers always outrank held keys.
    reattachers: VecDeque<Arc<Signal>>,
}

impl<K> WorkState<K> {
    fn new() -> Self {
        Self {
            grants: 0,
            normal: VecDeque::new(),
            urgent: VecDeque::new(),
            reattachers: VecDeque::new(),
        }
    }

    fn push_keys(&mut self, keys: VecDeque<K>, urgency: Urgency) {
        match urgency {
            Urgency::Normal => self.normal.extend(keys),
            Urgency::Urgent => self.urgent.push_front(keys),
        }
    }

    fn pop_key(&mut self) -> Option<K> {
        while let Some(batch) = self.urgent.front_mut() {
            match batch.pop_front() {
                Some(key) => {
                    if batch.is_empty() {
                        self.urgent.pop_front();
                    }
                    return Some(key);
                }
                None => {
                    self.urgent.pop_front();
                }
            }
        }
        self.normal.pop_front()
    }
}

impl<K, V, E> Inner<K, V, E>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn get_or_create_tasks(&self, keys: Vec<K>) -> (TaskList<V, E>, Vec<K>) {
        let mut tasks = Vec::with_capacity(keys.len());
        let mut new_keys = Vec::new();

        let mut map = self.tasks.lock();
        for key in keys {
            if let Some(task) = map.get(&key) {
                tasks.push(Arc::clone(task));
                continue;
            }
            let task = Arc::new(Task::new());
            map.insert(key.clone(), Arc::clone(&task));
            tasks.push(task);
            new_keys.push(key);
        }
        (TaskList(tasks), new_keys)
    }

    fn schedule_new_keys(this: &Arc<Self>, keys: Vec<K>, urgency: Urgency) {
        if keys.is_empty() {
            return;
        }

        if this.max_grants == 0 {
            // Unlimited concurrency; run everything immediately.
            for key in keys {
                Self::spawn_handler(this, key);
            }
            return;
        }

        // Issue as many new work grants as the cap allows, and hold the rest
        // of the keys for existing grant holders. The state lock is held for
        // the whole batch so no other submission can interleave its keys.
        let mut initial = Vec::new();
        {
            let mut state = this.state.lock();
            let issued = (this.max_grants - state.grants).min(keys.len());
            state.grants += issued;

            let mut keys = keys.into_iter();
            initial.extend(keys.by_ref().take(issued));
            let held: VecDeque<K> = keys.collect();
            if !held.is_empty() {
                trace!(held = held.len(), urgent = matches!(urgency, Urgency::Urgent), "queue saturated; holding keys");
                state.push_keys(held, urgency);
            }
        }

        for key in initial {
            Self::spawn_worker(this, Some(key));
        }
    }

    /// Start a worker thread that owns a work grant. With an initial key, the
    /// worker runs that key's task before looking for held work.
    fn spawn_worker(this: &Arc<Self>, initial: Option<K>) {
        let inner = Arc::clone(this);
        thread::Builder::new()
            .name("work-queue".into())
            .spawn(move || Self::work(inner, initial))
            .expect("failed to spawn queue worker thread");
    }

    /// Start a thread for one task of an unlimited queue. No grant accounting
    /// applies; the thread exits after the single task.
    fn spawn_handler(this: &Arc<Self>, key: K) {
        let inner = Arc::clone(this);
        thread::Builder::new()
            .name("work-queue".into())
            .spawn(move || {
                Self::run_task(&inner, key);
            })
            .expect("failed to spawn queue worker thread");
    }

    /// Worker loop. The thread owns a work grant on entry and discharges all
    /// duties that come with it.
    fn work(this: Arc<Self>, initial: Option<K>) {
        let mut next = initial;
        loop {
            let key = match next.take() {
                Some(key) => key,
                None => match this.next_queued_key() {
                    Some(key) => key,
                    // The grant was transferred or retired.
                    None => return,
                },
            };
            if Self::run_task(&this, key) {
                // The handler detached; its grant is already accounted for.
                return;
            }
        }
    }

    fn next_queued_key(&self) -> Option<K> {
        let state = self.state.lock();
        self.next_queued_key_locked(state)
    }

    /// Grant-holder exit protocol. Called with a work grant held; either
    /// relinquishes the grant (returning `None`) or returns a key whose work
    /// the caller must execute.
    fn next_queued_key_locked(&self, mut state: MutexGuard<'_, WorkState<K>>) -> Option<K> {
        if let Some(reattacher) = state.reattachers.pop_front() {
            drop(state);
            // The grant moves to the reattaching handler; the count is
            // conserved across the transfer.
            trace!("transferred work grant to reattaching handler");
            reattacher.notify();
            return None;
        }

        if let Some(key) = state.pop_key() {
            return Some(key);
        }

        // No reattachers and no held keys; retire the grant.
        state.grants -= 1;
        trace!(grants = state.grants, "retired work grant");
        None
    }

    /// Look up the task for `key`, run the handler, and publish the result.
    /// Returns whether the handler detached.
    fn run_task(this: &Arc<Self>, key: K) -> bool {
        let task = this
            .tasks
            .lock()
            .get(&key)
            .cloned()
            .expect("scheduled key has no task");

        let mut handle = QueueHandle::new(this);
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| {
            (this.handler)(&mut handle, &key)
        })) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(TaskError::Handler(err)),
            Err(_) => {
                trace!("handler panicked; completing task");
                Err(TaskError::Panicked)
            }
        };

        task.complete(outcome);
        this.tasks_done.fetch_add(1, Ordering::Relaxed);
        handle.detached
    }
}

/// Internal hook a [`QueueHandle`] uses to move its handler in and out of the
/// queue's concurrency cap. Erases the queue's type parameters so the handle
/// stays a plain borrowed value.
trait GrantControl: Sync {
    /// Relinquish the calling handler's work grant. Behavior is undefined if
    /// the caller does not hold one.
    fn handle_detach(&self) -> bool;

    /// Obtain a work grant for the calling handler, blocking until one is
    /// issued or transferred. Behavior is undefined if the caller already
    /// holds one.
    fn handle_reattach(&self);
}

impl<K, V, E> GrantControl for Arc<Inner<K, V, E>>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn handle_detach(&self) -> bool {
        if self.max_grants == 0 {
            return false;
        }

        // With an uncontended state lock, pass the grant on directly: to the
        // head reattacher, or to a fresh worker for the next held key, or by
        // retiring it.
        match self.state.try_lock() {
            Some(state) => {
                if let Some(key) = self.next_queued_key_locked(state) {
                    Inner::spawn_worker(self, Some(key));
                }
            }
            // The lock is contended; hand the grant to a fresh worker rather
            // than block the detaching handler.
            None => Inner::spawn_worker(self, None),
        }

        trace!("handler detached");
        true
    }

    fn handle_reattach(&self) {
        if self.max_grants == 0 {
            return;
        }

        let reattacher = {
            let mut state = self.state.lock();
            if state.grants < self.max_grants {
                // There is capacity for a new grant; issue one.
                state.grants += 1;
                trace!(grants = state.grants, "issued work grant to reattaching handler");
                return;
            }

            // At the cap; wait for a transfer from an existing grant holder.
            let reattacher = Arc::new(Signal::new());
            state.reattachers.push_back(Arc::clone(&reattacher));
            reattacher
        };
        trace!("waiting for work grant transfer");
        reattacher.wait();
    }
}

/// Lets a handler interact with the queue that invoked it.
pub struct QueueHandle<'a> {
    detached: bool,
    grants: &'a dyn GrantControl,
}

impl<'a> QueueHandle<'a> {
    fn new(grants: &'a dyn GrantControl) -> Self {
        Self {
            detached: false,
            grants,
        }
    }

    /// Unbind the calling handler from the queue's concurrency cap, allowing
    /// the queue to start handling other work. Returns `true` if this call
    /// unbound the handler, or `false` if it was already running outside the
    /// cap — because it detached earlier, or because the queue's concurrency
    /// is unlimited.
    ///
    /// The typical use is to block on the completion of another handler of
    /// the same queue, which would otherwise deadlock once every in-flight
    /// handler transitively waits on a queued key. [`KeyMutex::lock_detached`]
    /// does this while awaiting a contended lock.
    ///
    /// [`KeyMutex::lock_detached`]: crate::KeyMutex::lock_detached
    pub fn detach(&mut self) -> bool {
        if self.detached {
            return false;
        }
        self.detached = self.grants.handle_detach();
        self.detached
    }

    /// Block the calling handler until it once again runs within the queue's
    /// concurrency cap. Reattaching handlers are served ahead of all queued
    /// keys. No effect if the handler is attached or the queue is unlimited.
    pub fn reattach(&mut self) {
        if self.detached {
            self.grants.handle_reattach();
            self.detached = false;
        }
    }

    /// Whether the handler is currently detached.
    pub fn is_detached(&self) -> bool {
        self.detached
    }
}
