//! Promise constructors and aggregate combinators, built only on the public
//! promise contract.
//!
use crate::{resolution::Resolution, Deferred, Error, Promise, Scheduler};
use std::{cell::RefCell, rc::Rc};
use tracing::trace;

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// A promise resolved with `resolution`. A thenable is followed to its
    /// eventual outcome rather than stored as a value.
    pub fn resolve(scheduler: &Scheduler, resolution: impl Into<Resolution<T, E>>) -> Self {
        Self::new(scheduler, |resolve, _| {
            resolve.resolve(resolution.into());
            Ok(())
        })
    }

    /// A promise already fulfilled with `value`.
    pub fn fulfilled(scheduler: &Scheduler, value: T) -> Self {
        Self::resolve(scheduler, Resolution::Value(value))
    }

    /// A promise already rejected with `reason`.
    pub fn reject(scheduler: &Scheduler, reason: E) -> Self {
        Self::new(scheduler, |_, reject| {
            reject.reject(reason);
            Ok(())
        })
    }

    /// Fulfills with every input's value, in input order, once all of them
    /// fulfilled. Rejects with the first rejection. An empty input fulfills
    /// straight away with an empty `Vec`.
    ///
    /// # Examples
    ///
    /// ```
    /// use thenable::{Deferred, Error, Promise, Resolution, Scheduler};
    ///
    /// let scheduler = Scheduler::new();
    /// let slow = Deferred::<&str>::new(&scheduler);
    /// let all = Promise::all(
    ///     &scheduler,
    ///     vec![Resolution::from(slow.promise.clone()), Resolution::Value("fast")],
    /// );
    /// scheduler.run_until_idle();
    /// assert!(all.is_pending());
    ///
    /// slow.resolve.fulfill("slow");
    /// scheduler.run_until_idle();
    /// assert_eq!(all.peek(), Some(Ok(vec!["slow", "fast"])));
    /// ```
    pub fn all<I>(scheduler: &Scheduler, inputs: I) -> Promise<Vec<T>, E>
    where
        I: IntoIterator<Item = Resolution<T, E>>,
    {
        let inputs: Vec<_> = inputs.into_iter().collect();
        let Deferred {
            promise,
            resolve,
            reject,
        } = Deferred::new(scheduler);
        if inputs.is_empty() {
            resolve.fulfill(Vec::new());
            return promise;
        }

        let slots = Rc::new(RefCell::new(Slots::new(inputs.len())));
        for (index, input) in inputs.into_iter().enumerate() {
            let slots = Rc::clone(&slots);
            let resolve = resolve.clone();
            let reject = reject.clone();
            Self::resolve(scheduler, input).react(move |settled| match settled {
                Ok(value) => {
                    let complete = slots.borrow_mut().fill(index, value);
                    if let Some(values) = complete {
                        resolve.fulfill(values);
                    }
                }
                Err(reason) => reject.reject(reason),
            });
        }
        trace!(promise = %promise.id(), "all waiting on inputs");
        promise
    }

    /// Settles like whichever input settles first. Never settles for an
    /// empty input.
    pub fn race<I>(scheduler: &Scheduler, inputs: I) -> Self
    where
        I: IntoIterator<Item = Resolution<T, E>>,
    {
        let Deferred {
            promise,
            resolve,
            reject,
        } = Deferred::new(scheduler);
        for input in inputs {
            let resolve = resolve.clone();
            let reject = reject.clone();
            Self::resolve(scheduler, input).react(move |settled| match settled {
                Ok(value) => resolve.fulfill(value),
                Err(reason) => reject.reject(reason),
            });
        }
        promise
    }
}

/// Positional results of `all`, pre-sized to the input count.
struct Slots<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

impl<T> Slots<T> {
    fn new(len: usize) -> Self {
        Self {
            values: std::iter::repeat_with(|| None).take(len).collect(),
            remaining: len,
        }
    }

    /// Stores `value` at `index`; returns every value once the last slot is
    /// filled.
    fn fill(&mut self, index: usize, value: T) -> Option<Vec<T>> {
        if self.values[index].replace(value).is_none() {
            self.remaining -= 1;
        }
        if self.remaining > 0 {
            return None;
        }
        Some(self.values.drain(..).flatten().collect())
    }
}
