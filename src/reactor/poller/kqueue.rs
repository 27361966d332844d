//! `kqueue`-based poller backend for the BSDs and macOS.
//!
//! Functionally equivalent to the Linux `epoll` backend: descriptors are
//! registered with `EV_CLEAR` for edge-triggered semantics, and
//! readiness is queried with a zero timespec. Read and write interests
//! map to separate `EVFILT_READ`/`EVFILT_WRITE` filters, so one
//! readiness transition arrives as one event per filter.

use std::cell::Cell;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;

use smallvec::SmallVec;

use super::{Interest, EVENT_BUFFER_SIZE};
use crate::reactor::{ReactorError, ReactorErrorKind};

/// The raw event handed to reactor targets on kqueue platforms.
pub type RawEvent = libc::kevent;

/// Descriptor carried by an event.
pub fn event_fd(event: &RawEvent) -> RawFd {
    event.ident as RawFd
}

/// Whether the event signals read readiness.
pub fn is_readable(event: &RawEvent) -> bool {
    event.filter == libc::EVFILT_READ
}

/// Whether the event signals write readiness.
pub fn is_writable(event: &RawEvent) -> bool {
    event.filter == libc::EVFILT_WRITE
}

const ZERO_TIMEOUT: libc::timespec = libc::timespec {
    tv_sec: 0,
    tv_nsec: 0,
};

/// `kqueue` poller.
pub(crate) struct Poller {
    /// Kqueue descriptor; -1 once closed.
    fd: Cell<RawFd>,

    /// Reusable buffer for readiness events.
    events: [RawEvent; EVENT_BUFFER_SIZE],
}

impl Poller {
    /// Creates the kqueue instance.
    pub(crate) fn new() -> Result<Self, ReactorError> {
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(ReactorError::last(ReactorErrorKind::Init));
        }

        Ok(Self {
            fd: Cell::new(fd),
            events: unsafe { mem::zeroed() },
        })
    }

    /// Registers a descriptor with edge-triggered filters.
    pub(crate) fn register(&self, fd: RawFd, interest: Interest) -> Result<(), ReactorError> {
        let mut changes: SmallVec<[libc::kevent; 2]> = SmallVec::new();

        if interest.read {
            changes.push(filter_change(fd, libc::EVFILT_READ));
        }
        if interest.write {
            changes.push(filter_change(fd, libc::EVFILT_WRITE));
        }

        let rc = unsafe {
            libc::kevent(
                self.fd.get(),
                changes.as_ptr(),
                changes.len() as i32,
                ptr::null_mut(),
                0,
                &ZERO_TIMEOUT,
            )
        };
        if rc < 0 {
            return Err(ReactorError::last(ReactorErrorKind::Reg));
        }
        Ok(())
    }

    /// Queries readiness without blocking.
    ///
    /// Returns the slice of pending events. On a query failure the
    /// kqueue descriptor is closed and [`ReactorErrorKind::Query`] is
    /// raised; an interrupted wait counts as an empty batch.
    pub(crate) fn poll(&mut self) -> Result<&[RawEvent], ReactorError> {
        let n = unsafe {
            libc::kevent(
                self.fd.get(),
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                EVENT_BUFFER_SIZE as i32,
                &ZERO_TIMEOUT,
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

fn filter_change(fd: RawFd, filter: i16) -> libc::kevent {
    let mut change: libc::kevent = unsafe { mem::zeroed() };
    change.ident = fd as libc::uintptr_t;
    change.filter = filter;
    change.flags = libc::EV_ADD | libc::EV_CLEAR;
    change
}
