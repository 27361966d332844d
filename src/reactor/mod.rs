//! The readiness reactor.
//!
//! The reactor owns the kernel multiplexer and a map from file
//! descriptor to registered [`ReactorTarget`]. Its tick — a permanent
//! task on the thread's loop — queries readiness with a zero timeout and
//! dispatches each event to the target registered for its descriptor.
//!
//! Registration is edge-triggered: targets must fully drain their
//! descriptor until `EAGAIN` on every notification. Events for unknown
//! descriptors are dropped; they are the benign race between an
//! unregister and an already-queued event.
//!
//! All reactor state is thread-local. [`init`] must run on a thread
//! (normally through [`crate::runtime::init`]) before sockets can be
//! created there.

pub(crate) mod poller;

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::Rc;

use anyhow::Result;
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, trace};

use crate::task_loop::TaskLoop;

pub use poller::{event_fd, is_readable, is_writable, Interest, RawEvent};

/// Reactor failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorErrorKind {
    /// Creating the kernel multiplexer failed.
    Init,
    /// Querying readiness failed; the multiplexer has been closed.
    Query,
    /// Registering a descriptor failed.
    Reg,
}

/// A reactor failure, carrying the OS errno.
#[derive(Debug, Clone, Error)]
#[error("reactor {kind:?} failed (os error {errno})")]
pub struct ReactorError {
    pub kind: ReactorErrorKind,
    pub errno: i32,
}

impl ReactorError {
    pub(crate) fn last(kind: ReactorErrorKind) -> Self {
        Self {
            kind,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

/// An object registered against a file descriptor.
///
/// The reactor invokes [`on_event`](Self::on_event) with the raw
/// platform event for every readiness notification of the descriptor.
/// An error aborts the current tick and escapes `run_once`.
pub trait ReactorTarget {
    fn on_event(&self, event: &RawEvent) -> Result<()>;
}

/// Per-thread reactor state.
struct Reactor {
    poller: poller::Poller,
    targets: HashMap<RawFd, Rc<dyn ReactorTarget>>,
}

thread_local! {
    static REACTOR: RefCell<Option<Reactor>> = const { RefCell::new(None) };
}

/// Initializes the reactor for the current thread and registers its tick
/// as a permanent task on the thread's loop. Idempotent.
pub fn init() -> Result<(), ReactorError> {
    let installed = REACTOR.with(|cell| cell.borrow().is_some());
    if installed {
        return Ok(());
    }

    let poller = poller::Poller::new()?;
    REACTOR.with(|cell| {
        *cell.borrow_mut() = Some(Reactor {
            poller,
            targets: HashMap::new(),
        });
    });

    TaskLoop::thread_loop().add(tick);
    Ok(())
}

type DispatchBatch = SmallVec<[(RawEvent, Rc<dyn ReactorTarget>); 8]>;

/// One reactor tick: query readiness, dispatch events to targets.
pub(crate) fn tick() -> Result<()> {
    // Pair events with their targets under the state borrow, then
    // dispatch outside it: handlers re-enter the reactor to register
    // accepted sockets or unregister closed ones.
    let batch = REACTOR.with(|cell| {
        let mut borrow = cell.borrow_mut();
        let reactor = borrow.as_mut().expect("reactor not initialized");

        let mut batch = DispatchBatch::new();
        for event in reactor.poller.poll()? {
            let fd = event_fd(event);
            match reactor.targets.get(&fd) {
                Some(target) => batch.push((*event, target.clone())),
                None => trace!(fd, "dropping event for unregistered descriptor"),
            }
        }
        Ok::<DispatchBatch, anyhow::Error>(batch)
    })?;

    for (event, target) in batch {
        target.on_event(&event)?;
    }
    Ok(())
}

/// Registers `target` for edge-triggered events on `fd`.
///
/// The reactor owns the target for the lifetime of the registration.
///
/// # Panics
///
/// Panics if the reactor is not initialized on this thread.
pub fn register(
    fd: RawFd,
    target: Rc<dyn ReactorTarget>,
    interest: Interest,
) -> Result<(), ReactorError> {
    REACTOR.with(|cell| {
        let mut borrow = cell.borrow_mut();
        let reactor = borrow
            .as_mut()
            .expect("reactor not initialized (call runtime::init first)");

        reactor.poller.register(fd, interest)?;
        reactor.targets.insert(fd, target);
        debug!(fd, "registered reactor target");
        Ok(())
    })
}

/// Removes the target registered for `fd` and drops it.
///
/// Kernel-side removal is implicit: closing the descriptor detaches it
/// from the multiplexer.
pub fn unregister(fd: RawFd) {
    REACTOR.with(|cell| {
        if let Some(reactor) = cell.borrow_mut().as_mut() {
            if reactor.targets.remove(&fd).is_some() {
                debug!(fd, "unregistered reactor target");
            }
        }
    });
}
