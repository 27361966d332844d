//! Single-assignment promises with chained continuations.
//!
//! A [`Promise`] settles exactly once — to a value or to a captured
//! error — and delivers its result through continuations attached with
//! [`then`](Promise::then) and [`catch`](Promise::catch). Continuations
//! never run synchronously from the call that attached them: settling a
//! promise (or attaching to an already-settled one) enqueues it into a
//! thread-local pending-callback queue, and a permanent *microtask* on
//! the task loop drains that queue once per tick.
//!
//! # Ordering
//!
//! Continuations on a single promise fire in attachment order during the
//! drain. Continuations attached while a drain is running land in the
//! queue and fire on the next tick.
//!
//! # Adoption
//!
//! Settling a promise with another promise ([`PromiseCtx::adopt`], or a
//! `then` callback returning a promise) defers to the inner promise's
//! eventual state: a settled inner promise is copied immediately, a
//! pending one forwards its outcome when it settles.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem;
use std::rc::Rc;

use anyhow::Result;
use smallvec::SmallVec;

use crate::captured::{BadCast, CapturedError};
use crate::task_loop::TaskLoop;

/// Promise lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseStatus {
    /// Not settled yet.
    Pending,
    /// Settled with a value.
    Resolved,
    /// Settled with a captured error.
    Rejected,
}

type FulfilledWrapper<T> = Box<dyn FnOnce(&T)>;
type RejectedWrapper = Box<dyn FnOnce(&CapturedError)>;

/// Shared state of one promise.
struct PromiseData<T> {
    status: PromiseStatus,
    /// True while the promise sits in the pending-callback queue.
    pending_callback: bool,

    value: Option<T>,
    error: Option<CapturedError>,

    fulfilled_wrappers: Vec<FulfilledWrapper<T>>,
    rejected_wrappers: Vec<RejectedWrapper>,
}

type PromiseDataRef<T> = Rc<RefCell<PromiseData<T>>>;

/// Type-erased handle stored in the pending-callback queue.
trait DrainCallbacks {
    fn drain_callbacks(&self);
}

impl<T: Clone + 'static> DrainCallbacks for RefCell<PromiseData<T>> {
    fn drain_callbacks(&self) {
        // Take everything out and lower the flag before invoking any
        // callback: a callback may attach new continuations to this very
        // promise, and those must land in the queue for the next tick.
        let (status, value, error, fulfilled, rejected) = {
            let mut data = self.borrow_mut();
            data.pending_callback = false;
            (
                data.status,
                data.value.clone(),
                data.error.clone(),
                mem::take(&mut data.fulfilled_wrappers),
                mem::take(&mut data.rejected_wrappers),
            )
        };

        match status {
            PromiseStatus::Resolved => {
                let value = value.expect("resolved promise carries no value");
                for wrapper in fulfilled {
                    wrapper(&value);
                }
            }
            PromiseStatus::Rejected => {
                let error = error.expect("rejected promise carries no error");
                for wrapper in rejected {
                    wrapper(&error);
                }
            }
            PromiseStatus::Pending => {}
        }
    }
}

thread_local! {
    /// Promises whose continuations are due on the next drain.
    static PENDING_QUEUE: RefCell<Vec<Rc<dyn DrainCallbacks>>> = RefCell::new(Vec::new());

    /// Whether the microtask is registered on this thread's loop.
    static MICROTASK_INSTALLED: Cell<bool> = const { Cell::new(false) };
}

fn enqueue(data: Rc<dyn DrainCallbacks>) {
    PENDING_QUEUE.with(|queue| queue.borrow_mut().push(data));
}

/// Flushes the pending-callback queue once.
///
/// Snapshots the queue, clears it, and drains every promise in it.
/// Promises enqueued by the callbacks themselves wait for the next call.
pub(crate) fn drain_pending() {
    let batch: SmallVec<[Rc<dyn DrainCallbacks>; 16]> =
        PENDING_QUEUE.with(|queue| queue.borrow_mut().drain(..).collect());

    for data in batch {
        data.drain_callbacks();
    }
}

/// Registers the microtask drain as a permanent task on this thread's
/// loop. Idempotent.
pub(crate) fn init() {
    MICROTASK_INSTALLED.with(|installed| {
        if installed.get() {
            return;
        }
        installed.set(true);

        TaskLoop::thread_loop().add(|| {
            drain_pending();
            Ok(())
        });
    });
}

/// A value that a continuation may produce: a plain value, a promise to
/// adopt, or a `Result` whose `Err` rejects the downstream promise.
pub trait IntoPromise<T> {
    fn into_promise(self) -> Promise<T>;
}

impl<T: Clone + 'static> IntoPromise<T> for Promise<T> {
    fn into_promise(self) -> Promise<T> {
        self
    }
}

impl<T: Clone + 'static> IntoPromise<T> for T {
    fn into_promise(self) -> Promise<T> {
        Promise::resolved(self)
    }
}

impl<T: Clone + 'static, E: Into<anyhow::Error>> IntoPromise<T> for Result<T, E> {
    fn into_promise(self) -> Promise<T> {
        match self {
            Ok(value) => Promise::resolved(value),
            Err(error) => Promise::rejected(error),
        }
    }
}

/// A single-assignment value-or-error cell with chained continuations.
pub struct Promise<T> {
    data: PromiseDataRef<T>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
        }
    }
}

impl<T: Clone + 'static> Promise<T> {
    fn pending() -> Self {
        Self {
            data: Rc::new(RefCell::new(PromiseData {
                status: PromiseStatus::Pending,
                pending_callback: false,
                value: None,
                error: None,
                fulfilled_wrappers: Vec::new(),
                rejected_wrappers: Vec::new(),
            })),
        }
    }

    /// Creates a promise and runs `executor` immediately with its settle
    /// capability. An `Err` escaping the executor rejects the promise.
    pub fn new(executor: impl FnOnce(PromiseCtx<T>) -> Result<()>) -> Self {
        let promise = Self::pending();
        let ctx = PromiseCtx {
            data: promise.data.clone(),
        };

        if let Err(error) = executor(ctx) {
            Self::reject_captured_impl(&promise.data, CapturedError::from_anyhow(error));
        }

        promise
    }

    /// Creates a pending promise together with its settle capability.
    pub fn with_ctx() -> (Self, PromiseCtx<T>) {
        let promise = Self::pending();
        let ctx = PromiseCtx {
            data: promise.data.clone(),
        };
        (promise, ctx)
    }

    /// An already-resolved promise. No callbacks are enqueued.
    pub fn resolved(value: T) -> Self {
        let promise = Self::pending();
        {
            let mut data = promise.data.borrow_mut();
            data.status = PromiseStatus::Resolved;
            data.value = Some(value);
        }
        promise
    }

    /// An already-rejected promise. No callbacks are enqueued.
    pub fn rejected(error: impl Into<anyhow::Error>) -> Self {
        let promise = Self::pending();
        {
            let mut data = promise.data.borrow_mut();
            data.status = PromiseStatus::Rejected;
            data.error = Some(CapturedError::from_anyhow(error.into()));
        }
        promise
    }

    /// Current settle state.
    pub fn status(&self) -> PromiseStatus {
        self.data.borrow().status
    }

    fn resolve_impl(data: &PromiseDataRef<T>, value: T) {
        {
            let mut inner = data.borrow_mut();
            if inner.status != PromiseStatus::Pending {
                return;
            }
            inner.status = PromiseStatus::Resolved;
            inner.value = Some(value);
            inner.pending_callback = true;
        }
        enqueue(data.clone());
    }

    fn reject_captured_impl(data: &PromiseDataRef<T>, error: CapturedError) {
        {
            let mut inner = data.borrow_mut();
            if inner.status != PromiseStatus::Pending {
                return;
            }
            inner.status = PromiseStatus::Rejected;
            inner.error = Some(error);
            inner.pending_callback = true;
        }
        enqueue(data.clone());
    }

    /// Settles `outer` to `inner`'s eventual state.
    ///
    /// A settled inner promise is copied immediately; a pending one gets
    /// internal continuations that forward its outcome.
    fn associate(outer: &PromiseDataRef<T>, inner: &Promise<T>) {
        let status = inner.data.borrow().status;
        match status {
            PromiseStatus::Resolved => {
                let value = inner
                    .data
                    .borrow()
                    .value
                    .clone()
                    .expect("resolved promise carries no value");
                Self::resolve_impl(outer, value);
            }
            PromiseStatus::Rejected => {
                let error = inner
                    .data
                    .borrow()
                    .error
                    .clone()
                    .expect("rejected promise carries no error");
                Self::reject_captured_impl(outer, error);
            }
            PromiseStatus::Pending => {
                let resolve_target = outer.clone();
                let reject_target = outer.clone();
                inner.subscribe(
                    move |value: &T| Self::resolve_impl(&resolve_target, value.clone()),
                    move |error: &CapturedError| {
                        Self::reject_captured_impl(&reject_target, error.clone())
                    },
                );
            }
        }
    }

    /// Installs a raw continuation pair.
    ///
    /// On an already-settled promise this schedules a microtask so the
    /// matching callback fires on the next drain, never synchronously.
    pub(crate) fn subscribe(
        &self,
        on_fulfilled: impl FnOnce(&T) + 'static,
        on_rejected: impl FnOnce(&CapturedError) + 'static,
    ) {
        let mut data = self.data.borrow_mut();
        data.fulfilled_wrappers.push(Box::new(on_fulfilled));
        data.rejected_wrappers.push(Box::new(on_rejected));

        if data.status != PromiseStatus::Pending && !data.pending_callback {
            data.pending_callback = true;
            drop(data);
            enqueue(self.data.clone() as Rc<dyn DrainCallbacks>);
        }
    }

    /// Chains a fulfillment continuation, returning the downstream
    /// promise.
    ///
    /// The callback may return a plain `U`, a `Promise<U>` (which the
    /// downstream promise adopts), or a `Result<U, E>` (an `Err` rejects
    /// downstream). If this promise rejects, the downstream promise
    /// rejects with the same captured error.
    pub fn then<U, R, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + 'static,
        R: IntoPromise<U>,
        F: FnOnce(T) -> R + 'static,
    {
        let outer = Promise::<U>::pending();
        let fulfill_target = outer.data.clone();
        let reject_target = outer.data.clone();

        self.subscribe(
            move |value: &T| {
                let inner = on_fulfilled(value.clone()).into_promise();
                Promise::<U>::associate(&fulfill_target, &inner);
            },
            move |error: &CapturedError| {
                Promise::<U>::reject_captured_impl(&reject_target, error.clone());
            },
        );

        outer
    }

    /// Chains a typed rejection continuation, returning the downstream
    /// promise.
    ///
    /// The captured error is downcast to `E`; a mismatch rejects the
    /// downstream promise with [`BadCast`]. If this promise resolves,
    /// the value is forwarded downstream unchanged.
    pub fn catch<E, R, F>(&self, on_rejected: F) -> Promise<T>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
        R: IntoPromise<T>,
        F: FnOnce(&E) -> R + 'static,
    {
        let outer = Promise::<T>::pending();
        let fulfill_target = outer.data.clone();
        let reject_target = outer.data.clone();

        self.subscribe(
            move |value: &T| {
                Promise::<T>::resolve_impl(&fulfill_target, value.clone());
            },
            move |error: &CapturedError| match error.downcast_ref::<E>() {
                Some(concrete) => {
                    let inner = on_rejected(concrete).into_promise();
                    Promise::<T>::associate(&reject_target, &inner);
                }
                None => {
                    Promise::<T>::reject_captured_impl(&reject_target, CapturedError::new(BadCast));
                }
            },
        );

        outer
    }

    /// Like [`catch`](Self::catch), but hands the handler the opaque
    /// captured error without downcasting.
    pub fn catch_all<R, F>(&self, on_rejected: F) -> Promise<T>
    where
        R: IntoPromise<T>,
        F: FnOnce(&CapturedError) -> R + 'static,
    {
        let outer = Promise::<T>::pending();
        let fulfill_target = outer.data.clone();
        let reject_target = outer.data.clone();

        self.subscribe(
            move |value: &T| {
                Promise::<T>::resolve_impl(&fulfill_target, value.clone());
            },
            move |error: &CapturedError| {
                let inner = on_rejected(error).into_promise();
                Promise::<T>::associate(&reject_target, &inner);
            },
        );

        outer
    }

    /// Attaches both continuations at once; exactly
    /// `self.then(on_fulfilled).catch(on_rejected)`.
    pub fn then_catch<U, E, FR, RR, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U>
    where
        U: Clone + 'static,
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
        FR: IntoPromise<U>,
        RR: IntoPromise<U>,
        F: FnOnce(T) -> FR + 'static,
        R: FnOnce(&E) -> RR + 'static,
    {
        self.then(on_fulfilled).catch(on_rejected)
    }
}

/// The settle capability of one promise.
///
/// Cloneable; held by executors, write queues, and event listeners that
/// eventually settle the promise. Settling an already-settled promise is
/// a no-op.
pub struct PromiseCtx<T> {
    data: PromiseDataRef<T>,
}

impl<T> Clone for PromiseCtx<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
        }
    }
}

impl<T: Clone + 'static> PromiseCtx<T> {
    /// Resolves the promise with a value.
    pub fn resolve(&self, value: T) {
        Promise::resolve_impl(&self.data, value);
    }

    /// Settles the promise to another promise's eventual state.
    pub fn adopt(&self, promise: Promise<T>) {
        if self.data.borrow().status != PromiseStatus::Pending {
            return;
        }
        Promise::associate(&self.data, &promise);
    }

    /// Rejects the promise with an error.
    pub fn reject(&self, error: impl Into<anyhow::Error>) {
        Promise::reject_captured_impl(&self.data, CapturedError::from_anyhow(error.into()));
    }
}
