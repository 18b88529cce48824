//! Compact, comparable string sets.
//!
//! [`Set`] packs a set of strings into a single flat value that supports
//! `==`, hashing, and use as a map key, which plain `HashSet<String>` does
//! not. The mirroring pipelines key their queues on values that embed sets
//! of repository tags, so set-valued keys must be cheap to compare and hash.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod set;

pub use set::Set;
