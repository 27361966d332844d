//! Platform-specific readiness multiplexer backends.
//!
//! The poller wraps the kernel's edge-triggered multiplexer — `epoll` on
//! Linux, `kqueue` on the BSDs and macOS — behind one interface: create,
//! register a descriptor with read/write interests, and query readiness
//! with a zero timeout into a fixed 64-slot event buffer.
//!
//! The raw platform event struct is exposed as [`RawEvent`] and handed
//! to reactor targets unmodified; the accessors below extract the
//! descriptor and readiness flags from it.
//!
//! The concrete backend is selected at compile time.

pub(crate) mod sys;

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd"
))]
mod kqueue;

#[cfg(target_os = "linux")]
pub(crate) use epoll::Poller;
#[cfg(target_os = "linux")]
pub use epoll::{event_fd, is_readable, is_writable, RawEvent};

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd"
))]
pub(crate) use kqueue::Poller;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd"
))]
pub use kqueue::{event_fd, is_readable, is_writable, RawEvent};

/// Capacity of the per-tick readiness event buffer.
pub(crate) const EVENT_BUFFER_SIZE: usize = 64;

/// Readiness interests for a registered descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}
