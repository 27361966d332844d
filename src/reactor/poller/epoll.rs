//! Linux `epoll`-based poller backend.
//!
//! Descriptors are registered edge-triggered (`EPOLLET`): the kernel
//! reports each readiness transition once, and the socket layer drains
//! the descriptor until `EAGAIN` before the next notification. Readiness
//! is queried with a zero timeout; the reactor relies on the task loop's
//! permanent re-entry instead of blocking in the kernel.

use std::cell::Cell;
use std::io;
use std::mem;
use std::os::fd::RawFd;

use super::{Interest, EVENT_BUFFER_SIZE};
use crate::reactor::{ReactorError, ReactorErrorKind};

/// The raw event handed to reactor targets on Linux.
pub type RawEvent = libc::epoll_event;

/// Descriptor carried by an event.
pub fn event_fd(event: &RawEvent) -> RawFd {
    event.u64 as RawFd
}

/// Whether the event signals read readiness.
///
/// Deliberately `EPOLLIN` only: a fresh, unconnected socket reports
/// `EPOLLHUP|EPOLLOUT` and must not enter the read path.
pub fn is_readable(event: &RawEvent) -> bool {
    event.events & (libc::EPOLLIN as u32) != 0
}

/// Whether the event signals write readiness.
pub fn is_writable(event: &RawEvent) -> bool {
    event.events & (libc::EPOLLOUT as u32) != 0
}

/// Linux `epoll` poller.
pub(crate) struct Poller {
    /// Epoll descriptor; -1 once closed.
    fd: Cell<RawFd>,

    /// Reusable buffer for readiness events.
    events: [RawEvent; EVENT_BUFFER_SIZE],
}

impl Poller {
    /// Creates the epoll instance.
    pub(crate) fn new() -> Result<Self, ReactorError> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(ReactorError::last(ReactorErrorKind::Init));
        }

        Ok(Self {
            fd: Cell::new(fd),
            events: unsafe { mem::zeroed() },
        })
    }

    /// Registers a descriptor with edge-triggered interests.
    pub(crate) fn register(&self, fd: RawFd, interest: Interest) -> Result<(), ReactorError> {
        let mut flags = libc::EPOLLET;
        if interest.read {
            flags |= libc::EPOLLIN;
        }
        if interest.write {
            flags |= libc::EPOLLOUT;
        }

        let mut event = libc::epoll_event {
            events: flags as u32,
            u64: fd as u64,
        };

        let rc = unsafe { libc::epoll_ctl(self.fd.get(), libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc < 0 {
            return Err(ReactorError::last(ReactorErrorKind::Reg));
        }
        Ok(())
    }

    /// Queries readiness without blocking.
    ///
    /// Returns the slice of pending events. On a query failure the epoll
    /// descriptor is closed and [`ReactorErrorKind::Query`] is raised;
    /// an interrupted wait counts as an empty batch.
    pub(crate) fn poll(&mut self) -> Result<&[RawEvent], ReactorError> {
        let n = unsafe {
            libc::epoll_wait(
                self.fd.get(),
                self.events.as_mut_ptr(),
                EVENT_BUFFER_SIZE as i32,
                0,
            )
        };

        if n < 0 {
            let error = io::Error::last_os_error();
            if error.kind() == io::ErrorKind::Interrupted {
                return Ok(&[]);
            }

            self.close();
            return Err(ReactorError {
                kind: ReactorErrorKind::Query,
                errno: error.raw_os_error().unwrap_or(0),
            });
        }

        Ok(&self.events[..n as usize])
    }

    fn close(&self) {
        let fd = self.fd.replace(-1);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.close();
    }
}
