//! The "run later" primitive every promise reaction goes through.
//!
//! A [`Scheduler`] is a plain FIFO task queue. Nothing runs until its owner
//! drives it with [`Scheduler::run_one`], [`Scheduler::run_until_idle`] or
//! [`Scheduler::block_on`], so the order in which reactions fire is fully
//! deterministic and never tied to a real clock.
//!
use crate::Error;
use futures::{pin_mut, task::noop_waker_ref};
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt,
    future::{Future, IntoFuture},
    rc::{Rc, Weak},
    task::{Context, Poll},
};
use tracing::{debug, trace, trace_span, Span};

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce()>;

/// Scheduler settings.
///
/// # Examples
///
/// ```
/// use thenable::scheduler::{Config, Scheduler};
///
/// let scheduler = Scheduler::with_config(Config::default().with_task_budget(64).with_label("ui"));
/// assert_eq!(scheduler.config().label(), "ui");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    task_budget: Option<usize>,
    label: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_budget: None,
            label: String::from("default"),
        }
    }
}

impl Config {
    /// Caps the number of tasks a single drive call may run. A thenable that
    /// keeps rescheduling itself would otherwise never let the queue drain.
    pub fn with_task_budget(mut self, budget: usize) -> Self {
        self.task_budget = Some(budget);
        self
    }

    /// Name recorded on the scheduler's tracing span.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn task_budget(&self) -> Option<usize> {
        self.task_budget
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn allows(&self, ran: usize) -> bool {
        self.task_budget.map_or(true, |budget| ran < budget)
    }
}

/// Shared handle to a task queue. Cloning is cheap and every clone feeds
/// the same queue.
///
/// The queue lives as long as some `Scheduler` handle does. Promises only
/// hold it weakly, so tasks still queued when the last handle is dropped
/// are freed without running.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

/// Non-owning handle to a [`Scheduler`], held by promises.
#[derive(Clone)]
pub(crate) struct WeakScheduler {
    inner: Weak<Inner>,
}

impl WeakScheduler {
    pub(crate) fn upgrade(&self) -> Option<Scheduler> {
        self.inner.upgrade().map(|inner| Scheduler { inner })
    }

    /// [`Scheduler::defer`], or drops `task` if the scheduler is gone.
    pub(crate) fn defer(&self, task: impl FnOnce() + 'static) {
        match self.upgrade() {
            Some(scheduler) => scheduler.defer(task),
            None => debug!("scheduler dropped, task discarded"),
        }
    }
}

struct Inner {
    queue: RefCell<VecDeque<Task>>,
    executed: Cell<u64>,
    config: Config,
    span: Span,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("label", &self.inner.config.label)
            .field("pending", &self.pending())
            .field("executed", &self.executed())
            .finish()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let span = trace_span!("scheduler", label = %config.label);
        Self {
            inner: Rc::new(Inner {
                queue: RefCell::new(VecDeque::new()),
                executed: Cell::new(0),
                config,
                span,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Queues `task` behind everything already waiting. It never runs inside
    /// this call.
    pub fn defer(&self, task: impl FnOnce() + 'static) {
        self.inner.queue.borrow_mut().push_back(Box::new(task));
    }

    /// Number of queued tasks.
    pub fn pending(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    /// Total number of tasks run so far.
    pub fn executed(&self) -> u64 {
        self.inner.executed.get()
    }

    /// Runs the oldest queued task. Returns `false` when the queue was empty.
    pub fn run_one(&self) -> bool {
        let _entered = self.inner.span.enter();
        self.step()
    }

    /// Runs tasks, including ones queued by the tasks themselves, until the
    /// queue is empty or the configured budget is spent. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let _entered = self.inner.span.enter();
        let mut ran = 0;
        while self.inner.config.allows(ran) && self.step() {
            ran += 1;
        }
        trace!(ran, pending = self.pending(), "scheduler drained");
        ran
    }

    /// Polls `future` to completion, running one queued task between polls.
    /// Anything awaitable works, including a [`Promise`](crate::Promise).
    ///
    /// The future is polled with a no-op waker, so it only makes progress
    /// through work queued on this scheduler. Fails with [`Error::Stalled`]
    /// if the queue empties (or the budget runs out) first.
    ///
    /// # Examples
    ///
    /// ```
    /// use thenable::{Error, Promise, Resolution, Scheduler};
    ///
    /// let scheduler = Scheduler::new();
    /// let doubled = Promise::<i32>::fulfilled(&scheduler, 21)
    ///     .and_then(|n| Ok(Resolution::Value(n * 2)));
    /// assert_eq!(scheduler.block_on(doubled), Ok(Ok(42)));
    /// ```
    pub fn block_on<F: IntoFuture>(&self, future: F) -> Result<F::Output, Error> {
        let _entered = self.inner.span.enter();
        let future = future.into_future();
        pin_mut!(future);
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut ran = 0;
        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return Ok(output);
            }
            if !self.inner.config.allows(ran) || !self.step() {
                debug!(ran, pending = self.pending(), "future stalled");
                return Err(Error::Stalled);
            }
            ran += 1;
        }
    }

    fn step(&self) -> bool {
        // The queue borrow ends before the task runs so it can defer more work.
        let task = self.inner.queue.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                self.inner.executed.set(self.inner.executed.get() + 1);
                true
            }
            None => false,
        }
    }
}
