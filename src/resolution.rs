//! Thenable resolution: deciding how a promise settles given what it was
//! resolved with.
//!
//! Anything implementing [`Thenable`] can be handed to a promise, not only
//! this crate's own [`Promise`]. The target then follows the thenable,
//! recursively, until a plain value or a rejection comes out.
//!
use crate::{promise::Promise, Error, PromiseId};
use std::{cell::Cell, fmt, rc::Rc};
use tracing::{debug, trace};

/// The two-callback subscription capability.
///
/// # Examples
///
/// A foreign promise-like value that fulfills as soon as someone subscribes:
///
/// ```
/// use thenable::{Error, Promise, Rejecter, Resolution, Resolver, Scheduler, Thenable};
///
/// struct Ready(u8);
///
/// impl Thenable<u8, Error> for Ready {
///     fn subscribe(&self, resolve: Resolver<u8>, _reject: Rejecter) -> Result<(), Error> {
///         resolve.fulfill(self.0);
///         Ok(())
///     }
/// }
///
/// let scheduler = Scheduler::new();
/// let promise = Promise::<u8>::resolve(&scheduler, Resolution::thenable(Ready(9)));
/// assert_eq!(promise.peek(), Some(Ok(9)));
/// ```
pub trait Thenable<T, E> {
    /// Registers interest in the eventual outcome. Implementations may call
    /// the callbacks now, later, never, or more than once; only the first
    /// call counts. An `Err` return rejects the subscriber unless a callback
    /// already fired.
    fn subscribe(&self, resolve: Resolver<T, E>, reject: Rejecter<E>) -> Result<(), E>;

    /// Identity of the underlying promise, if any. Used to detect a promise
    /// being resolved with itself.
    fn promise_id(&self) -> Option<PromiseId> {
        None
    }
}

/// What a promise is resolved with.
pub enum Resolution<T, E = Error> {
    Value(T),
    Thenable(Rc<dyn Thenable<T, E>>),
}

/// Result of a reaction handler. `Err` rejects the downstream promise.
pub type Outcome<T, E = Error> = Result<Resolution<T, E>, E>;

impl<T, E> Resolution<T, E> {
    pub fn thenable(thenable: impl Thenable<T, E> + 'static) -> Self {
        Resolution::Thenable(Rc::new(thenable))
    }

    pub fn is_thenable(&self) -> bool {
        matches!(self, Resolution::Thenable(_))
    }
}

impl<T: Clone + 'static, E: Clone + 'static> From<Promise<T, E>> for Resolution<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Resolution::Thenable(Rc::new(promise))
    }
}

impl<T: fmt::Debug, E> fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Thenable(thenable) => f
                .debug_tuple("Thenable")
                .field(&thenable.promise_id())
                .finish(),
        }
    }
}

/// Resolve half of a promise's settlement functions.
pub struct Resolver<T, E = Error> {
    resolve: Rc<dyn Fn(Resolution<T, E>)>,
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            resolve: Rc::clone(&self.resolve),
        }
    }
}

impl<T, E> fmt::Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

impl<T, E> Resolver<T, E> {
    pub fn new(resolve: impl Fn(Resolution<T, E>) + 'static) -> Self {
        Self {
            resolve: Rc::new(resolve),
        }
    }

    pub fn resolve(&self, resolution: Resolution<T, E>) {
        (self.resolve)(resolution)
    }

    pub fn fulfill(&self, value: T) {
        self.resolve(Resolution::Value(value))
    }
}

/// Reject half of a promise's settlement functions.
pub struct Rejecter<E = Error> {
    reject: Rc<dyn Fn(E)>,
}

impl<E> Clone for Rejecter<E> {
    fn clone(&self) -> Self {
        Self {
            reject: Rc::clone(&self.reject),
        }
    }
}

impl<E> fmt::Debug for Rejecter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejecter").finish_non_exhaustive()
    }
}

impl<E> Rejecter<E> {
    pub fn new(reject: impl Fn(E) + 'static) -> Self {
        Self {
            reject: Rc::new(reject),
        }
    }

    pub fn reject(&self, reason: E) {
        (self.reject)(reason)
    }
}

/// Settles `target` according to `resolution`.
///
/// Plain values fulfill immediately. A thenable is subscribed to with a fresh
/// pair of callbacks sharing one `called` flag, so whichever fires first wins
/// and everything after it is ignored. Resolving a promise with itself
/// rejects it with [`Error::ChainingCycle`].
pub(crate) fn resolve_with<T, E>(resolution: Resolution<T, E>, target: &Promise<T, E>)
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    let thenable = match resolution {
        Resolution::Value(value) => {
            target.settle(Ok(value));
            return;
        }
        Resolution::Thenable(thenable) => thenable,
    };

    if thenable.promise_id() == Some(target.id()) {
        debug!(promise = %target.id(), "chaining cycle detected");
        target.settle(Err(Error::ChainingCycle(target.id()).into()));
        return;
    }

    let called = Rc::new(Cell::new(false));
    let resolve = {
        let called = Rc::clone(&called);
        let target = target.clone();
        Resolver::new(move |next| {
            if called.replace(true) {
                trace!(promise = %target.id(), "ignored repeated thenable callback");
                return;
            }
            resolve_with(next, &target);
        })
    };
    let reject = {
        let called = Rc::clone(&called);
        let target = target.clone();
        Rejecter::new(move |reason| {
            if called.replace(true) {
                trace!(promise = %target.id(), "ignored repeated thenable callback");
                return;
            }
            target.settle(Err(reason));
        })
    };

    if let Err(reason) = thenable.subscribe(resolve, reject) {
        if called.replace(true) {
            trace!(promise = %target.id(), "ignored subscribe failure after settlement");
        } else {
            debug!(promise = %target.id(), "thenable subscribe failed");
            target.settle(Err(reason));
        }
    }
}
