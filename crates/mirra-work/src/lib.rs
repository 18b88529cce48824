//! Deduplicating, memoizing, bounded-concurrency work dispatch.
//!
//! This crate is the concurrency substrate shared by every pipeline of the
//! mirroring tool: manifest caches, blob and platform copiers, and the
//! top-level driver are all instances of [`Queue`] with different key and
//! value types.
//!
//! - **[`Queue`]**: maps each distinct key to a single cached result,
//!   computed by a handler running on a worker thread. Optionally caps the
//!   number of handlers in flight, dispatching queued keys in submission
//!   order across two priority levels (normal and urgent).
//!
//! - **[`QueueHandle`]**: lets a handler cooperatively step outside the
//!   concurrency cap ([`QueueHandle::detach`]) so it can block on another
//!   handler's result without deadlocking the queue, then rejoin with
//!   priority over queued keys ([`QueueHandle::reattach`]).
//!
//! - **[`KeyMutex`]**: mutual exclusion keyed by arbitrary hashable values,
//!   with a detach-aware locking mode for use inside bounded queues.
//!
//! # Example
//!
//! ```
//! use mirra_work::Queue;
//!
//! // Compute each square at most once, two at a time.
//! let squares: Queue<u32, u64, String> =
//!     Queue::new(2, |_, &n| Ok(u64::from(n) * u64::from(n)));
//!
//! assert_eq!(squares.get_all([3, 4, 3]), Ok(vec![9, 16, 9]));
//! assert_eq!(squares.stats().submitted, 2);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod key_mutex;
mod queue;
mod signal;
mod task;

pub use key_mutex::KeyMutex;
pub use queue::{Queue, QueueHandle, QueueStats};
pub use task::TaskError;
