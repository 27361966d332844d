//! Nonblocking IPv4 TCP sockets driven by the reactor.
//!
//! [`Socket`] and [`ServerSocket`] are thin handles over shared state;
//! the reactor holds a clone of each registered handle and drives its
//! state machine from readiness events. Lifecycle notifications are
//! delivered as [`SocketEvent`]/[`ServerEvent`] values to listeners
//! registered with `on` (removable via the returned [`EventHandle`]).

mod event;
mod server;
mod socket;

use std::io;

use thiserror::Error;

pub use event::EventHandle;
pub use server::{ServerEvent, ServerSocket, ServerStatus};
pub use socket::{Socket, SocketEvent, SocketStatus};

/// Socket failure classes, one per syscall surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketErrorKind {
    Create,
    MakeNonBlock,
    ReuseAddr,
    Bind,
    Listen,
    Connect,
    Accept,
    Read,
    Write,
    GetLocalAddr,
    Close,
}

/// A socket failure, carrying the OS errno.
#[derive(Debug, Clone, Error)]
#[error("socket {kind:?} failed (os error {errno})")]
pub struct SocketError {
    pub kind: SocketErrorKind,
    pub errno: i32,
}

impl SocketError {
    pub(crate) fn from_io(kind: SocketErrorKind, error: &io::Error) -> Self {
        Self {
            kind,
            errno: error.raw_os_error().unwrap_or(0),
        }
    }
}
