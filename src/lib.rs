//! Promises/A+ style promises for single-threaded rust.
//!
//! A [`Promise`] settles exactly once, runs every reaction registered through
//! [`Promise::then`] on a [`Scheduler`] rather than inline, and unwraps any
//! [`Thenable`] it is resolved with, including foreign ones.
//!
//! # Examples
//!
//! ```
//! use thenable::{Deferred, Error, Promise, Resolution, Scheduler};
//!
//! let scheduler = Scheduler::new();
//! let deferred = Deferred::<u32>::new(&scheduler);
//! let total = Promise::all(
//!     &scheduler,
//!     vec![
//!         Resolution::Value(1),
//!         Resolution::from(deferred.promise.clone()),
//!     ],
//! )
//! .and_then(|parts| Ok(Resolution::Value(parts.iter().sum::<u32>())));
//!
//! deferred.resolve.fulfill(41);
//! assert_eq!(scheduler.block_on(total), Ok(Ok(42)));
//! ```
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

mod combinators;
pub mod deferred;
pub mod promise;
pub mod resolution;
pub mod scheduler;

pub use deferred::Deferred;
pub use promise::{Promise, PromiseState, Settled};
pub use resolution::{Outcome, Rejecter, Resolution, Resolver, Thenable};
pub use scheduler::Scheduler;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A promise was resolved with itself, directly or through a handler.
    #[error("chaining cycle detected for promise {0}")]
    ChainingCycle(PromiseId),
    /// [`Scheduler::block_on`] ran out of work before its future completed.
    #[error("scheduler stopped before the future completed")]
    Stalled,
    /// A rejection reason supplied by application code.
    #[error("{0}")]
    Rejected(String),
}

impl From<&str> for Error {
    fn from(reason: &str) -> Self {
        Error::Rejected(reason.to_owned())
    }
}

impl From<String> for Error {
    fn from(reason: String) -> Self {
        Error::Rejected(reason)
    }
}

/// Process-unique promise identity, used for cycle detection and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(u64);

impl PromiseId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
