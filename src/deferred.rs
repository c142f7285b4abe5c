use crate::{
    resolution::{Rejecter, Resolver},
    Error, Promise, Scheduler,
};

/// A promise together with its settlement functions, for settling it from
/// code that never saw an executor.
///
/// Clones share the same promise, so whichever holder settles it first wins.
///
/// # Examples
///
/// ```
/// use thenable::{Deferred, Error, Scheduler};
///
/// let scheduler = Scheduler::new();
/// let deferred = Deferred::<String>::new(&scheduler);
/// let waiter = deferred.promise.clone();
///
/// deferred.resolve.fulfill(String::from("🍓"));
/// deferred.reject.reject(Error::from("ignored"));
/// assert_eq!(scheduler.block_on(waiter), Ok(Ok(String::from("🍓"))));
/// ```
#[derive(Debug, Clone)]
pub struct Deferred<T, E = Error> {
    pub promise: Promise<T, E>,
    pub resolve: Resolver<T, E>,
    pub reject: Rejecter<E>,
}

impl<T, E> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    pub fn new(scheduler: &Scheduler) -> Self {
        let promise = Promise::pending(scheduler);
        let (resolve, reject) = promise.settlement_functions();
        Self {
            promise,
            resolve,
            reject,
        }
    }

    pub fn into_parts(self) -> (Promise<T, E>, Resolver<T, E>, Rejecter<E>) {
        (self.promise, self.resolve, self.reject)
    }
}
