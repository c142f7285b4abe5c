//! The promise state machine.
//!
//! A [`Promise`] is a cheap, clonable handle; every clone observes the same
//! settlement. Reactions registered with [`Promise::then`] and friends always
//! run as [`Scheduler`] tasks, never inside the call that registered them or
//! the call that settled the promise.
//!
//! Promises hold their scheduler weakly. Dropping the last [`Scheduler`]
//! handle frees every task still queued on it, and reactions registered
//! afterwards are discarded.
//!
use crate::{
    resolution::{resolve_with, Outcome, Rejecter, Resolution, Resolver, Thenable},
    scheduler::WeakScheduler,
    Error, PromiseId, Scheduler,
};
use std::{
    cell::RefCell,
    fmt,
    future::{Future, IntoFuture},
    mem,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};
use tracing::{debug, trace};

/// Observable phase of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> State<T, E> {
    fn phase(&self) -> PromiseState {
        match self {
            State::Pending => PromiseState::Pending,
            State::Fulfilled(_) => PromiseState::Fulfilled,
            State::Rejected(_) => PromiseState::Rejected,
        }
    }
}

impl<T: Clone, E: Clone> State<T, E> {
    fn settlement(&self) -> Option<Result<T, E>> {
        match self {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        }
    }
}

type Reaction<T, E> = Box<dyn FnOnce(Result<T, E>)>;

struct Inner<T, E> {
    state: State<T, E>,
    reactions: Vec<Reaction<T, E>>,
    wakers: Vec<Waker>,
}

/// A value that settles, once, to `Ok(T)` or `Err(E)`.
///
/// # Examples
///
/// ```
/// use thenable::{Error, Promise, Resolution, Scheduler};
///
/// let scheduler = Scheduler::new();
/// let promise = Promise::<&str>::new(&scheduler, |resolve, _reject| {
///     resolve.fulfill("🍓");
///     Ok(())
/// });
/// let length = promise.and_then(|fruit| Ok(Resolution::Value(fruit.len())));
///
/// // Nothing runs until the scheduler is driven.
/// assert!(length.is_pending());
/// scheduler.run_until_idle();
/// assert_eq!(length.peek(), Some(Ok(4)));
/// ```
pub struct Promise<T, E = Error> {
    id: PromiseId,
    inner: Rc<RefCell<Inner<T, E>>>,
    scheduler: WeakScheduler,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: Rc::clone(&self.inner),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl<T, E> Promise<T, E> {
    pub(crate) fn pending(scheduler: &Scheduler) -> Self {
        Self::pending_on(scheduler.downgrade())
    }

    fn pending_on(scheduler: WeakScheduler) -> Self {
        Self {
            id: PromiseId::next(),
            inner: Rc::new(RefCell::new(Inner {
                state: State::Pending,
                reactions: Vec::new(),
                wakers: Vec::new(),
            })),
            scheduler,
        }
    }

    pub fn id(&self) -> PromiseId {
        self.id
    }

    pub fn state(&self) -> PromiseState {
        self.inner.borrow().state.phase()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == PromiseState::Pending
    }

    /// The scheduler this promise and everything chained from it run on,
    /// or `None` once every handle to it has been dropped.
    pub fn scheduler(&self) -> Option<Scheduler> {
        self.scheduler.upgrade()
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Promise<T, E> {
    /// A copy of the settlement, if there is one yet.
    pub fn peek(&self) -> Option<Result<T, E>> {
        self.inner.borrow().state.settlement()
    }

    /// Moves a pending promise to its final state and schedules its queued
    /// reactions. A no-op on a promise that already settled.
    pub(crate) fn settle(&self, settlement: Result<T, E>) {
        let (reactions, wakers) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Pending) {
                trace!(promise = %self.id, "ignored settlement of settled promise");
                return;
            }
            inner.state = match &settlement {
                Ok(value) => State::Fulfilled(value.clone()),
                Err(reason) => State::Rejected(reason.clone()),
            };
            (
                mem::take(&mut inner.reactions),
                mem::take(&mut inner.wakers),
            )
        };
        trace!(
            promise = %self.id,
            fulfilled = settlement.is_ok(),
            reactions = reactions.len(),
            "settled"
        );
        for reaction in reactions {
            let settlement = settlement.clone();
            self.scheduler.defer(move || reaction(settlement));
        }
        for waker in wakers {
            waker.wake();
        }
    }

    /// Runs `reaction` with the settlement, on a later scheduler task.
    pub(crate) fn react(&self, reaction: impl FnOnce(Result<T, E>) + 'static) {
        let settlement = {
            let mut inner = self.inner.borrow_mut();
            let settled = inner.state.settlement();
            match settled {
                Some(settlement) => settlement,
                None => {
                    inner.reactions.push(Box::new(reaction));
                    trace!(promise = %self.id, queued = inner.reactions.len(), "reaction queued");
                    return;
                }
            }
        };
        self.scheduler.defer(move || reaction(settlement));
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Creates a promise and runs `executor` with its settlement functions
    /// before returning. An `Err` from the executor rejects the promise,
    /// unless it has already settled.
    pub fn new<X>(scheduler: &Scheduler, executor: X) -> Self
    where
        X: FnOnce(Resolver<T, E>, Rejecter<E>) -> Result<(), E>,
    {
        let promise = Self::pending(scheduler);
        let (resolve, reject) = promise.settlement_functions();
        if let Err(reason) = executor(resolve, reject.clone()) {
            debug!(promise = %promise.id, "executor failed");
            reject.reject(reason);
        }
        promise
    }

    /// The resolve/reject pair handed to executors and deferred handles.
    ///
    /// Both are no-ops once the promise has settled. While it is still
    /// following a thenable, either may settle it first.
    pub(crate) fn settlement_functions(&self) -> (Resolver<T, E>, Rejecter<E>) {
        let resolve = {
            let promise = self.clone();
            Resolver::new(move |resolution| {
                if !promise.is_pending() {
                    debug!(promise = %promise.id, "ignored resolve of settled promise");
                    return;
                }
                resolve_with(resolution, &promise);
            })
        };
        let reject = {
            let promise = self.clone();
            Rejecter::new(move |reason| {
                if !promise.is_pending() {
                    debug!(promise = %promise.id, "ignored reject of settled promise");
                    return;
                }
                promise.settle(Err(reason));
            })
        };
        (resolve, reject)
    }

    fn chain<U, H>(&self, handler: H) -> Promise<U, E>
    where
        U: Clone + 'static,
        H: FnOnce(Result<T, E>) -> Outcome<U, E> + 'static,
    {
        let downstream = Promise::pending_on(self.scheduler.clone());
        let target = downstream.clone();
        self.react(move |settled| match handler(settled) {
            Ok(resolution) => resolve_with(resolution, &target),
            Err(reason) => target.settle(Err(reason)),
        });
        downstream
    }

    /// Registers both handlers and returns the promise of whichever runs.
    ///
    /// The handler's `Ok` resolution is followed like any other (a returned
    /// promise or thenable is unwrapped); an `Err` rejects the returned
    /// promise.
    pub fn then<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Outcome<U, E> + 'static,
        R: FnOnce(E) -> Outcome<U, E> + 'static,
    {
        self.chain(move |settled| match settled {
            Ok(value) => on_fulfilled(value),
            Err(reason) => on_rejected(reason),
        })
    }

    /// `then` without a rejection handler: rejections pass through as is.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Outcome<U, E> + 'static,
    {
        self.then(on_fulfilled, Err)
    }

    /// `then` without a fulfillment handler: values pass through as is.
    ///
    /// # Examples
    ///
    /// ```
    /// use thenable::{Error, Promise, Resolution, Scheduler};
    ///
    /// let scheduler = Scheduler::new();
    /// let recovered = Promise::<i32>::reject(&scheduler, "💥".into())
    ///     .catch(|_| Ok(Resolution::Value(0)));
    /// scheduler.run_until_idle();
    /// assert_eq!(recovered.peek(), Some(Ok(0)));
    /// ```
    pub fn catch<R>(&self, on_rejected: R) -> Promise<T, E>
    where
        R: FnOnce(E) -> Outcome<T, E> + 'static,
    {
        self.then(|value| Ok(Resolution::Value(value)), on_rejected)
    }

    /// Runs `on_settled` whatever the outcome, then settles like this promise.
    ///
    /// What `on_settled` resolves to is waited for and discarded, unless it
    /// fails, in which case its reason replaces the original outcome.
    pub fn finally<X, F>(&self, on_settled: F) -> Promise<T, E>
    where
        X: Clone + 'static,
        F: FnOnce() -> Outcome<X, E> + 'static,
    {
        let scheduler = self.scheduler.clone();
        self.chain(move |settled| {
            let cleanup: Promise<X, E> = Promise::pending_on(scheduler);
            resolve_with(on_settled()?, &cleanup);
            let restored = cleanup.and_then(move |_| settled.map(Resolution::Value));
            Ok(restored.into())
        })
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Thenable<T, E> for Promise<T, E> {
    fn subscribe(&self, resolve: Resolver<T, E>, reject: Rejecter<E>) -> Result<(), E> {
        self.react(move |settled| match settled {
            Ok(value) => resolve.fulfill(value),
            Err(reason) => reject.reject(reason),
        });
        Ok(())
    }

    fn promise_id(&self) -> Option<PromiseId> {
        Some(self.id)
    }
}

/// Awaiting a promise yields a copy of its settlement. Any number of clones
/// may be awaited at once; all of them are woken when it settles.
impl<T: Clone, E: Clone> IntoFuture for Promise<T, E> {
    type Output = Result<T, E>;
    type IntoFuture = Settled<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        Settled { promise: self }
    }
}

/// The future of a [`Promise`]'s settlement, from [`IntoFuture`].
#[derive(Debug, Clone)]
pub struct Settled<T, E = Error> {
    promise: Promise<T, E>,
}

impl<T: Clone, E: Clone> Future for Settled<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.promise.inner.borrow_mut();
        let settled = inner.state.settlement();
        match settled {
            Some(settlement) => Poll::Ready(settlement),
            None => {
                if !inner.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Promise, PromiseState};
    use crate::{Deferred, Error, Resolution, Scheduler};
    use futures::{FutureExt, TryFutureExt};
    use std::{cell::RefCell, future::IntoFuture, rc::Rc};

    fn value<T>(value: T) -> crate::Outcome<T> {
        Ok(Resolution::Value(value))
    }

    #[test]
    fn test_executor_runs_synchronously() {
        let scheduler = Scheduler::new();
        let ran = Rc::new(RefCell::new(false));
        let flag = ran.clone();
        let promise = Promise::<i32>::new(&scheduler, move |resolve, _| {
            *flag.borrow_mut() = true;
            resolve.fulfill(1);
            Ok(())
        });
        assert!(*ran.borrow());
        assert_eq!(promise.peek(), Some(Ok(1)));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_executor_error_rejects() {
        let scheduler = Scheduler::new();
        let promise = Promise::<i32>::new(&scheduler, |_, _| Err("executor blew up".into()));
        assert_eq!(promise.state(), PromiseState::Rejected);
        assert_eq!(promise.peek(), Some(Err(Error::from("executor blew up"))));
    }

    #[test]
    fn test_executor_error_after_resolve_is_ignored() {
        let scheduler = Scheduler::new();
        let promise = Promise::<i32>::new(&scheduler, |resolve, _| {
            resolve.fulfill(2);
            Err("too late".into())
        });
        assert_eq!(promise.peek(), Some(Ok(2)));
    }

    #[test]
    fn test_settles_once() {
        let scheduler = Scheduler::new();
        let promise = Promise::<i32>::new(&scheduler, |resolve, reject| {
            resolve.fulfill(1);
            resolve.fulfill(2);
            reject.reject("nope".into());
            Ok(())
        });
        assert_eq!(promise.peek(), Some(Ok(1)));
        promise.settle(Err("direct".into()));
        assert_eq!(promise.peek(), Some(Ok(1)));
    }

    #[test]
    fn test_reject_while_following_thenable() {
        let scheduler = Scheduler::new();
        let upstream = Deferred::<i32>::new(&scheduler);
        let follower = upstream.promise.clone();
        let promise = Promise::<i32>::new(&scheduler, move |resolve, reject| {
            resolve.resolve(follower.into());
            reject.reject("explicit".into());
            Ok(())
        });
        assert_eq!(promise.peek(), Some(Err(Error::from("explicit"))));
        upstream.resolve.fulfill(9);
        scheduler.run_until_idle();
        assert_eq!(promise.peek(), Some(Err(Error::from("explicit"))));
    }

    #[test]
    fn test_executor_error_while_following_thenable_rejects() {
        let scheduler = Scheduler::new();
        let upstream = Deferred::<i32>::new(&scheduler);
        let follower = upstream.promise.clone();
        let promise = Promise::<i32>::new(&scheduler, move |resolve, _| {
            resolve.resolve(follower.into());
            Err("executor raised".into())
        });
        scheduler.run_until_idle();
        assert_eq!(promise.peek(), Some(Err(Error::from("executor raised"))));
    }

    #[test]
    fn test_resolve_while_following_thenable() {
        let scheduler = Scheduler::new();
        let upstream = Deferred::<i32>::new(&scheduler);
        let follower = upstream.promise.clone();
        let promise = Promise::<i32>::new(&scheduler, move |resolve, _| {
            resolve.resolve(follower.into());
            resolve.fulfill(5);
            Ok(())
        });
        assert_eq!(promise.peek(), Some(Ok(5)));
        upstream.resolve.fulfill(9);
        scheduler.run_until_idle();
        assert_eq!(promise.peek(), Some(Ok(5)));
    }

    #[test]
    fn test_then_on_settled_promise_is_deferred() {
        let scheduler = Scheduler::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        let promise = Promise::<i32>::fulfilled(&scheduler, 3);
        let next = promise.and_then(move |n| {
            log.borrow_mut().push(n);
            value(n + 1)
        });
        assert!(seen.borrow().is_empty());
        assert!(next.is_pending());
        assert_eq!(scheduler.pending(), 1);
        scheduler.run_until_idle();
        assert_eq!(*seen.borrow(), vec![3]);
        assert_eq!(next.peek(), Some(Ok(4)));
    }

    #[test]
    fn test_settlement_does_not_run_reactions_inline() {
        let scheduler = Scheduler::new();
        let deferred = Deferred::<i32>::new(&scheduler);
        let seen = Rc::new(RefCell::new(None));
        let log = seen.clone();
        deferred.promise.and_then(move |n| {
            *log.borrow_mut() = Some(n);
            value(())
        });
        deferred.resolve.fulfill(8);
        assert_eq!(*seen.borrow(), None);
        scheduler.run_until_idle();
        assert_eq!(*seen.borrow(), Some(8));
    }

    #[test]
    fn test_reactions_fire_in_registration_order() {
        let scheduler = Scheduler::new();
        let deferred = Deferred::<&str>::new(&scheduler);
        let order = Rc::new(RefCell::new(Vec::new()));
        for n in 0..4 {
            let order = order.clone();
            deferred.promise.then(
                move |_| {
                    order.borrow_mut().push(n);
                    value(())
                },
                |reason| Err(reason),
            );
        }
        deferred.resolve.fulfill("go");
        scheduler.run_until_idle();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_handler_error_rejects_downstream() {
        let scheduler = Scheduler::new();
        let failed = Promise::<i32>::fulfilled(&scheduler, 1)
            .and_then(|_| -> crate::Outcome<i32> { Err("handler failed".into()) });
        scheduler.run_until_idle();
        assert_eq!(failed.peek(), Some(Err(Error::from("handler failed"))));
    }

    #[test]
    fn test_rejection_skips_and_then() {
        let scheduler = Scheduler::new();
        let touched = Rc::new(RefCell::new(false));
        let flag = touched.clone();
        let chained = Promise::<i32>::reject(&scheduler, "first".into()).and_then(move |n| {
            *flag.borrow_mut() = true;
            value(n)
        });
        scheduler.run_until_idle();
        assert!(!*touched.borrow());
        assert_eq!(chained.peek(), Some(Err(Error::from("first"))));
    }

    #[test]
    fn test_catch_skipped_on_fulfillment() {
        let scheduler = Scheduler::new();
        let caught = Promise::<i32>::fulfilled(&scheduler, 10)
            .catch(|_| value(-1))
            .and_then(|n| value(n * 2));
        scheduler.run_until_idle();
        assert_eq!(caught.peek(), Some(Ok(20)));
    }

    #[test]
    fn test_catch_recovers() {
        let scheduler = Scheduler::new();
        let caught = Promise::<String>::reject(&scheduler, "lost".into())
            .catch(|reason| value(format!("recovered from {reason}")));
        scheduler.run_until_idle();
        assert_eq!(caught.peek(), Some(Ok("recovered from lost".to_owned())));
    }

    #[test]
    fn test_handler_returning_promise_is_followed() {
        let scheduler = Scheduler::new();
        let inner = Deferred::<i32>::new(&scheduler);
        let returned = inner.promise.clone();
        let outer =
            Promise::<i32>::fulfilled(&scheduler, 1).and_then(move |_| Ok(returned.into()));
        scheduler.run_until_idle();
        assert!(outer.is_pending());
        inner.resolve.fulfill(77);
        scheduler.run_until_idle();
        assert_eq!(outer.peek(), Some(Ok(77)));
    }

    #[test]
    fn test_handler_returning_its_own_promise_is_a_cycle() {
        let scheduler = Scheduler::new();
        let slot: Rc<RefCell<Option<Promise<i32>>>> = Rc::new(RefCell::new(None));
        let own = slot.clone();
        let chained = Promise::<i32>::fulfilled(&scheduler, 1).and_then(move |_| {
            let current = own.borrow().clone();
            match current {
                Some(promise) => Ok(promise.into()),
                None => Err("slot empty".into()),
            }
        });
        *slot.borrow_mut() = Some(chained.clone());
        scheduler.run_until_idle();
        assert_eq!(chained.peek(), Some(Err(Error::ChainingCycle(chained.id()))));
    }

    #[test]
    fn test_finally_keeps_value() {
        let scheduler = Scheduler::new();
        let cleaned = Rc::new(RefCell::new(false));
        let flag = cleaned.clone();
        let kept = Promise::<i32>::fulfilled(&scheduler, 5).finally(move || {
            *flag.borrow_mut() = true;
            value("unrelated")
        });
        scheduler.run_until_idle();
        assert!(*cleaned.borrow());
        assert_eq!(kept.peek(), Some(Ok(5)));
    }

    #[test]
    fn test_finally_failure_wins() {
        let scheduler = Scheduler::new();
        let failed = Promise::<i32>::fulfilled(&scheduler, 5)
            .finally(|| -> crate::Outcome<()> { Err("cleanup failed".into()) });
        scheduler.run_until_idle();
        assert_eq!(failed.peek(), Some(Err(Error::from("cleanup failed"))));
    }

    #[test]
    fn test_finally_rethrows_original_reason() {
        let scheduler = Scheduler::new();
        let failed = Promise::<i32>::reject(&scheduler, "original".into()).finally(|| value(1));
        scheduler.run_until_idle();
        assert_eq!(failed.peek(), Some(Err(Error::from("original"))));
    }

    #[test]
    fn test_finally_waits_for_its_thenable() {
        let scheduler = Scheduler::new();
        let cleanup = Deferred::<()>::new(&scheduler);
        let pending_cleanup = cleanup.promise.clone();
        let kept = Promise::<i32>::fulfilled(&scheduler, 5)
            .finally(move || Ok(pending_cleanup.into()));
        scheduler.run_until_idle();
        assert!(kept.is_pending());
        cleanup.reject.reject("cleanup rejected".into());
        scheduler.run_until_idle();
        assert_eq!(kept.peek(), Some(Err(Error::from("cleanup rejected"))));
    }

    #[test]
    fn test_await_settled_promise() {
        let scheduler = Scheduler::new();
        let promise = Promise::<i32>::fulfilled(&scheduler, 6);
        assert_eq!(promise.clone().into_future().now_or_never(), Some(Ok(6)));
        let pending = Deferred::<i32>::new(&scheduler);
        assert_eq!(pending.promise.clone().into_future().now_or_never(), None);
    }

    #[test]
    fn test_chaining_with_futures_traits_in_scope() {
        let scheduler = Scheduler::new();
        let source = Promise::<i32>::fulfilled(&scheduler, 1);
        let both = source.then(|n| value(n + 1), |reason| Err(reason));
        let next = source.and_then(|n| value(n * 10));
        let settled = next.clone().into_future().map(|settled| settled.is_ok());
        scheduler.run_until_idle();
        assert_eq!(both.peek(), Some(Ok(2)));
        assert_eq!(next.peek(), Some(Ok(10)));
        assert_eq!(settled.now_or_never(), Some(true));
        let doubled = next
            .into_future()
            .and_then(|n| futures::future::ok::<i32, Error>(n * 2));
        assert_eq!(scheduler.block_on(doubled), Ok(Ok(20)));
    }

    #[test]
    fn test_dropping_scheduler_frees_queued_reactions() {
        let scheduler = Scheduler::new();
        let promise = Promise::<i32>::fulfilled(&scheduler, 1);
        let chained = promise.and_then(|n| value(n + 1));
        assert_eq!(scheduler.pending(), 1);
        let queued = Rc::downgrade(&chained.inner);
        drop(chained);
        drop(scheduler);
        assert!(queued.upgrade().is_none());
        assert!(promise.scheduler().is_none());
        let late = promise.and_then(|n| value(n));
        assert!(late.is_pending());
    }

    #[test]
    fn test_block_on_async_block_awaiting_promises() {
        let scheduler = Scheduler::new();
        let a = Promise::<i32>::fulfilled(&scheduler, 2).and_then(|n| value(n + 1));
        let b = Promise::<i32>::fulfilled(&scheduler, 4);
        let both = scheduler.block_on(async move { (a.await, b.await) });
        assert_eq!(both, Ok((Ok(3), Ok(4))));
    }

    #[test]
    fn test_debug_shows_state() {
        let scheduler = Scheduler::new();
        let promise = Promise::<i32>::fulfilled(&scheduler, 1);
        let rendered = format!("{promise:?}");
        assert!(rendered.contains("Fulfilled"), "{rendered}");
    }
}
