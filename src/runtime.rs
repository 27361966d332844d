//! Per-thread runtime initialization.

use anyhow::Result;

use crate::promise;
use crate::reactor;

/// Initializes the runtime for the current thread. Idempotent.
///
/// Two permanent tasks are registered on the thread's loop, in this
/// order, and the order is part of the contract:
///
/// 1. the promise microtask drain,
/// 2. the reactor tick.
///
/// Within every tick of [`TaskLoop::run_once`](crate::TaskLoop::run_once),
/// continuations of promises settled during the previous tick therefore
/// fire before new I/O events are dispatched, and oneshot tasks run
/// last.
pub fn init() -> Result<()> {
    promise::init();
    reactor::init()?;
    Ok(())
}
