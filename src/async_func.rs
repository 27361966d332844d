//! Async functions over promises and generators.
//!
//! [`async_func`] (and its arity variants) turns a linear body of the
//! shape `Fn(AsyncCtx, Args...) -> Result<R>` into a plain function
//! `Fn(Args...) -> Promise<R>`. Each invocation drives the body inside a
//! fresh [`Generator`]; every [`AsyncCtx::wait`] suspends that generator
//! until the awaited promise settles.
//!
//! `wait` never runs the body synchronously past a settled promise: the
//! continuation that resumes the generator fires from the microtask
//! drain, so user code keeps its linear causality.

use std::ptr;

use anyhow::Result;

use crate::generator::{GenCtx, Generator};
use crate::promise::{Promise, PromiseCtx};

/// The awaited-value channel: a raw pointer to the settled value, passed
/// through the generator's resume slot like the source's `void*`.
type ResumePtr = *mut ();

/// The await capability handed to an async body.
pub struct AsyncCtx {
    ctx: GenCtx<(), ResumePtr>,
}

impl AsyncCtx {
    /// Suspends the async function until `promise` settles.
    ///
    /// Returns the resolved value, or the captured rejection as an
    /// `Err` raised at this point in the body — propagate it with `?` to
    /// reject the promise returned by the async function.
    ///
    /// This always yields to the scheduler, even when `promise` is
    /// already settled.
    pub fn wait<T: Clone + 'static>(&self, promise: Promise<T>) -> Result<T> {
        let resume_generator = self.ctx.handle();
        let throw_generator = self.ctx.handle();

        promise.subscribe(
            move |value: &T| {
                let mut slot = value.clone();
                // The slot outlives the resume: the body copies the value
                // out before this frame unwinds.
                let _ = resume_generator.next(&mut slot as *mut T as ResumePtr);
            },
            move |error| {
                let _ = throw_generator.throw_in_captured(error.clone());
            },
        );

        let raw = self.ctx.suspend(())?;
        let value = unsafe { (*(raw as *mut T)).clone() };
        Ok(value)
    }
}

/// Runs an async body inside a fresh generator and returns the promise
/// settled by its outcome.
fn spawn<R>(body: impl FnOnce(AsyncCtx) -> Result<R> + 'static) -> Promise<R>
where
    R: Clone + 'static,
{
    Promise::new(move |promise_ctx: PromiseCtx<R>| {
        let generator = Generator::<(), ResumePtr>::new(move |generator_ctx| {
            let async_ctx = AsyncCtx { ctx: generator_ctx };
            match body(async_ctx) {
                Ok(value) => promise_ctx.resolve(value),
                Err(error) => promise_ctx.reject(error),
            }
            Ok(())
        });

        // Kick the body; it runs until its first await or to completion.
        generator.next(ptr::null_mut())?;
        Ok(())
    })
}

macro_rules! impl_async_func {
    ($(#[$docs:meta])* $name:ident $(, $arg:ident: $ty:ident)*) => {
        $(#[$docs])*
        pub fn $name<F, R $(, $ty)*>(body: F) -> impl Fn($($ty),*) -> Promise<R>
        where
            F: Fn(AsyncCtx $(, $ty)*) -> Result<R> + Clone + 'static,
            R: Clone + 'static,
            $($ty: Clone + 'static,)*
        {
            move |$($arg: $ty),*| {
                let body = body.clone();
                spawn(move |async_ctx| body(async_ctx $(, $arg)*))
            }
        }
    };
}

impl_async_func!(
    /// Builds a promise-returning function from a no-argument async body.
    async_func
);
impl_async_func!(
    /// Builds a promise-returning function from a one-argument async body.
    async_func1,
    a: A
);
impl_async_func!(
    /// Builds a promise-returning function from a two-argument async body.
    async_func2,
    a: A,
    b: B
);
impl_async_func!(
    /// Builds a promise-returning function from a three-argument async body.
    async_func3,
    a: A,
    b: B,
    c: C
);
