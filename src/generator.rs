//! Stackful generators.
//!
//! A [`Generator`] runs its body on a dedicated stack and switches
//! machine contexts between the caller and the body. Values travel in
//! both directions: the caller pushes the next input through
//! [`Generator::next`], the body produces outputs through
//! [`GenCtx::suspend`] and receives the input sent into the following
//! `next`. Errors can be injected into a suspended body with
//! [`Generator::throw_in`].
//!
//! # Lifecycle
//!
//! A generator starts `Pending`; the first `next` allocates the stack
//! and enters the body. Each `suspend` parks the body (`Suspended`)
//! until the caller resumes it. When the body returns (or fails), the
//! generator becomes `Done` and the stack is released.
//!
//! Exactly one flow — caller or body — executes at any instant. The
//! body holds only a weak reference to the shared state, so dropping the
//! last handle of a still-suspended generator releases the stack buffer.
//! Values resident on an abandoned stack are reclaimed as raw storage;
//! their destructors do not run.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::{Rc, Weak};

use anyhow::{anyhow, Context, Result};
use thiserror::Error;

use crate::captured::CapturedError;

/// Stack size for generator bodies.
///
/// macOS refuses context stacks smaller than 32 KiB.
#[cfg(target_os = "macos")]
pub const GEN_STACK_SIZE: usize = 32 * 1024;
#[cfg(not(target_os = "macos"))]
pub const GEN_STACK_SIZE: usize = 8 * 1024;

/// Errors raised by generator state checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GeneratorError {
    /// The generator is already running; it cannot be resumed reentrantly.
    #[error("generator is already running")]
    AlreadyRunning,

    /// `suspend` was called outside of a running body.
    #[error("generator is not running")]
    NotRunning,
}

/// Generator lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenStatus {
    /// Created; the body has not been entered yet.
    Pending,
    /// The body is executing.
    Running,
    /// The body is parked at a suspension point.
    Suspended,
    /// The body returned or failed; the stack has been released.
    Done,
}

/// What the body finds in the resume slot when it wakes up.
enum Resume<IT> {
    /// A value sent through `next`.
    Value(IT),
    /// An error injected through `throw_in`.
    Error(CapturedError),
}

/// State shared between the handle and the executing body.
struct GenData<T, IT> {
    status: Cell<GenStatus>,

    /// Saved machine context of the body.
    body_ctx: UnsafeCell<libc::ucontext_t>,
    /// Saved machine context of the caller, valid while the body runs.
    caller_ctx: UnsafeCell<libc::ucontext_t>,
    /// Owned stack buffer; present iff status is Running or Suspended.
    stack: RefCell<Option<Box<[u8]>>>,

    /// The body, taken on first entry.
    executor: RefCell<Option<Box<dyn FnOnce(GenCtx<T, IT>) -> Result<T>>>>,

    /// Last produced value (or the final return value once Done).
    out_val: RefCell<Option<T>>,
    /// Value or error delivered to the body on its next wake-up.
    resume: RefCell<Option<Resume<IT>>>,
    /// Error the body terminated with, if any.
    error: RefCell<Option<CapturedError>>,
}

thread_local! {
    /// Handoff cell for the entry wrapper.
    ///
    /// Pointers cannot portably travel through `makecontext` varargs, so
    /// the first entry reads its state from here instead of the stack
    /// switch.
    static ENTRY_STATE: Cell<*const ()> = const { Cell::new(ptr::null()) };
}

/// Entry wrapper running on the generator stack.
///
/// Recovers the shared state from the handoff cell, runs the body, and
/// records the outcome before switching back to the caller for the last
/// time. Panics are caught here: unwinding must never cross the context
/// switch.
extern "C" fn gen_entry<T: Clone + 'static, IT: 'static>() {
    let raw = ENTRY_STATE.with(|cell| cell.replace(ptr::null()));
    let weak = unsafe { Weak::from_raw(raw as *const GenData<T, IT>) };

    let executor = {
        let data = weak.upgrade().expect("generator state dropped before entry");
        let executor = data
            .executor
            .borrow_mut()
            .take()
            .expect("generator entered twice");
        executor
    };

    let body_ctx = GenCtx { data: weak.clone() };
    let outcome = panic::catch_unwind(AssertUnwindSafe(move || executor(body_ctx)));

    let data = weak
        .upgrade()
        .expect("generator state dropped while running");
    match outcome {
        Ok(Ok(value)) => *data.out_val.borrow_mut() = Some(value),
        Ok(Err(error)) => *data.error.borrow_mut() = Some(CapturedError::from_anyhow(error)),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            *data.error.borrow_mut() =
                Some(CapturedError::new(anyhow!("generator body panicked: {message}")));
        }
    }
    data.status.set(GenStatus::Done);

    let body = data.body_ctx.get();
    let caller = data.caller_ctx.get();
    drop(data);
    drop(weak);

    unsafe {
        libc::swapcontext(body, caller);
    }
    unreachable!("finished generator was resumed");
}

/// A handle to a stackful generator.
///
/// Cloning yields another handle to the same generator; the runtime's
/// await machinery stores clones inside promise continuations.
pub struct Generator<T, IT> {
    data: Rc<GenData<T, IT>>,
}

impl<T, IT> Clone for Generator<T, IT> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
        }
    }
}

impl<T, IT> Generator<T, IT>
where
    T: Clone + 'static,
    IT: 'static,
{
    /// Creates a generator over the given body.
    ///
    /// The body runs lazily: nothing executes until the first
    /// [`next`](Self::next). An `Err` return models the body terminating
    /// with an error; it surfaces to the caller on the resume that
    /// observes completion.
    pub fn new(executor: impl FnOnce(GenCtx<T, IT>) -> Result<T> + 'static) -> Self {
        Self {
            data: Rc::new(GenData {
                status: Cell::new(GenStatus::Pending),
                body_ctx: UnsafeCell::new(unsafe { mem::zeroed() }),
                caller_ctx: UnsafeCell::new(unsafe { mem::zeroed() }),
                stack: RefCell::new(None),
                executor: RefCell::new(Some(Box::new(executor))),
                out_val: RefCell::new(None),
                resume: RefCell::new(None),
                error: RefCell::new(None),
            }),
        }
    }

    /// Resumes the generator, sending `value` into the body.
    ///
    /// - `Pending`: allocates the stack and enters the body.
    /// - `Suspended`: delivers `value` as the result of the pending
    ///   suspension and resumes.
    /// - `Done`: returns the cached result (or the body's error) without
    ///   switching contexts.
    /// - `Running`: fails with [`GeneratorError::AlreadyRunning`].
    pub fn next(&self, value: IT) -> Result<T> {
        let data = &self.data;

        match data.status.get() {
            GenStatus::Pending => {
                self.prepare_stack()?;
                *data.resume.borrow_mut() = Some(Resume::Value(value));
                data.status.set(GenStatus::Running);
                self.enter();
                self.finish()
            }
            GenStatus::Suspended => {
                *data.resume.borrow_mut() = Some(Resume::Value(value));
                data.status.set(GenStatus::Running);
                self.enter();
                self.finish()
            }
            GenStatus::Done => self.finish(),
            GenStatus::Running => Err(GeneratorError::AlreadyRunning.into()),
        }
    }

    /// Injects an error into the generator.
    ///
    /// On a `Suspended` generator the error is raised at the suspension
    /// point inside the body. On a `Pending` or `Done` generator there
    /// is no body to inject into, so the error comes straight back to
    /// the caller.
    pub fn throw_in(&self, error: impl Into<anyhow::Error>) -> Result<T> {
        self.throw_in_captured(CapturedError::from_anyhow(error.into()))
    }

    pub(crate) fn throw_in_captured(&self, error: CapturedError) -> Result<T> {
        let data = &self.data;

        match data.status.get() {
            GenStatus::Pending | GenStatus::Done => Err(error.into_anyhow()),
            GenStatus::Suspended => {
                *data.resume.borrow_mut() = Some(Resume::Error(error));
                data.status.set(GenStatus::Running);
                self.enter();
                self.finish()
            }
            GenStatus::Running => Err(GeneratorError::AlreadyRunning.into()),
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> GenStatus {
        self.data.status.get()
    }

    /// Allocates the stack and builds the entry context.
    fn prepare_stack(&self) -> Result<()> {
        let data = &self.data;
        let stack = vec![0u8; GEN_STACK_SIZE].into_boxed_slice();

        unsafe {
            let ctx = data.body_ctx.get();
            if libc::getcontext(ctx) != 0 {
                return Err(io::Error::last_os_error()).context("getcontext failed");
            }
            (*ctx).uc_stack.ss_sp = stack.as_ptr() as *mut libc::c_void;
            (*ctx).uc_stack.ss_size = GEN_STACK_SIZE;
            (*ctx).uc_stack.ss_flags = 0;
            (*ctx).uc_link = ptr::null_mut();
            libc::makecontext(ctx, gen_entry::<T, IT> as extern "C" fn(), 0);
        }
        *data.stack.borrow_mut() = Some(stack);

        // The entry wrapper picks its state up from the handoff cell; it
        // must only ever hold a weak reference.
        let weak = Rc::downgrade(data);
        ENTRY_STATE.with(|cell| cell.set(Weak::into_raw(weak) as *const ()));

        Ok(())
    }

    /// Switches into the body and releases the stack once it finishes.
    fn enter(&self) {
        let data = &self.data;

        unsafe {
            let rc = libc::swapcontext(data.caller_ctx.get(), data.body_ctx.get());
            debug_assert_eq!(rc, 0);
        }

        if data.status.get() == GenStatus::Done {
            *data.stack.borrow_mut() = None;
        }
    }

    /// Reports the outcome of the last resume.
    fn finish(&self) -> Result<T> {
        let data = &self.data;

        if data.status.get() == GenStatus::Done {
            if let Some(error) = data.error.borrow().clone() {
                return Err(error.into_anyhow());
            }
        }

        let value = data.out_val.borrow().clone();
        Ok(value.expect("generator produced no value"))
    }
}

/// The body-side capability of a generator.
///
/// Handed to the executor; only valid while the body runs.
pub struct GenCtx<T, IT> {
    data: Weak<GenData<T, IT>>,
}

impl<T, IT> Clone for GenCtx<T, IT> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
        }
    }
}

impl<T, IT> GenCtx<T, IT>
where
    T: Clone + 'static,
    IT: 'static,
{
    /// Produces `value` and parks the body until the next resume.
    ///
    /// Returns the value sent into the resuming [`Generator::next`], or
    /// the error injected by [`Generator::throw_in`]. Only valid while
    /// the body is running.
    pub fn suspend(&self, value: T) -> Result<IT> {
        let data = self
            .data
            .upgrade()
            .expect("generator state dropped while running");

        if data.status.get() != GenStatus::Running {
            return Err(GeneratorError::NotRunning.into());
        }

        *data.out_val.borrow_mut() = Some(value);
        data.status.set(GenStatus::Suspended);

        let body = data.body_ctx.get();
        let caller = data.caller_ctx.get();
        // No strong reference may live across the switch, or dropping
        // the last handle of a suspended generator would leak the stack.
        drop(data);

        unsafe {
            let rc = libc::swapcontext(body, caller);
            debug_assert_eq!(rc, 0);
        }

        let data = self
            .data
            .upgrade()
            .expect("generator state dropped while suspended");
        let result = match data.resume.borrow_mut().take() {
            Some(Resume::Value(value)) => Ok(value),
            Some(Resume::Error(error)) => Err(error.into_anyhow()),
            None => unreachable!("generator resumed without a value or error"),
        };
        result
    }

    /// Delegates to another generator until it completes.
    ///
    /// Drives `other` with the most recently sent value, re-yielding
    /// every value it produces (including its final return value).
    /// Returns the value sent into the last resume.
    pub fn suspend_from(&self, other: &Generator<T, IT>, mut input: IT) -> Result<IT> {
        loop {
            if other.status() == GenStatus::Done {
                return Ok(input);
            }
            let output = other.next(input)?;
            input = self.suspend(output)?;
        }
    }

    /// A fresh handle to the generator this context belongs to.
    ///
    /// Used by the await machinery to build continuations that resume
    /// the body. The returned handle is a strong reference; keeping it
    /// alive keeps the generator alive.
    pub fn handle(&self) -> Generator<T, IT> {
        Generator {
            data: self
                .data
                .upgrade()
                .expect("generator state dropped while running"),
        }
    }
}
