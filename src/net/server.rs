//! The listening socket.

use std::cell::Cell;
use std::io;
use std::net::SocketAddrV4;
use std::os::fd::RawFd;
use std::rc::Rc;

use anyhow::Result;
use tracing::{debug, trace};

use crate::net::event::{EventHandle, Listeners};
use crate::net::socket::Socket;
use crate::net::{SocketError, SocketErrorKind};
use crate::reactor::poller::sys;
use crate::reactor::{self, Interest, RawEvent, ReactorTarget};

/// Listening-socket lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Idle,
    Listening,
    Closed,
}

/// Notifications delivered to server-socket listeners.
#[derive(Clone)]
pub enum ServerEvent {
    /// A peer connected; the accepted socket is already registered with
    /// the reactor and in the connected state.
    Connect(Socket),
    /// The server socket was closed.
    Close,
}

struct ServerSocketData {
    /// Descriptor; -1 once closed.
    fd: Cell<RawFd>,
    status: Cell<ServerStatus>,
    local_addr: Cell<Option<SocketAddrV4>>,
    listeners: Listeners<ServerEvent>,
}

/// A nonblocking TCP listening socket.
///
/// On read readiness the reactor accepts every pending connection and
/// emits one [`ServerEvent::Connect`] per accepted peer.
#[derive(Clone)]
pub struct ServerSocket {
    data: Rc<ServerSocketData>,
}

impl ServerSocket {
    /// Creates an idle server socket: nonblocking, `SO_REUSEADDR`, and
    /// registered with the reactor for read readiness.
    pub fn new() -> Result<Self> {
        let fd = sys::sys_socket_v4()
            .map_err(|error| SocketError::from_io(SocketErrorKind::Create, &error))?;

        sys::sys_set_nonblocking(fd)
            .map_err(|error| SocketError::from_io(SocketErrorKind::MakeNonBlock, &error))?;
        sys::sys_set_reuseaddr(fd)
            .map_err(|error| SocketError::from_io(SocketErrorKind::ReuseAddr, &error))?;

        let server = Self {
            data: Rc::new(ServerSocketData {
                fd: Cell::new(fd),
                status: Cell::new(ServerStatus::Idle),
                local_addr: Cell::new(None),
                listeners: Listeners::new(),
            }),
        };

        reactor::register(
            fd,
            Rc::new(server.clone()),
            Interest {
                read: true,
                write: false,
            },
        )?;

        Ok(server)
    }

    /// Registers a listener for all server events.
    pub fn on(&self, handler: impl FnMut(&ServerEvent) + 'static) -> EventHandle {
        self.data.listeners.on(handler)
    }

    /// Removes a listener. Returns whether it was registered.
    pub fn off(&self, handle: EventHandle) -> bool {
        self.data.listeners.off(handle)
    }

    /// Listener for [`ServerEvent::Connect`].
    pub fn on_connect(&self, mut handler: impl FnMut(&Socket) + 'static) -> EventHandle {
        self.on(move |event| {
            if let ServerEvent::Connect(client) = event {
                handler(client);
            }
        })
    }

    /// Listener for [`ServerEvent::Close`].
    pub fn on_close(&self, mut handler: impl FnMut() + 'static) -> EventHandle {
        self.on(move |event| {
            if matches!(event, ServerEvent::Close) {
                handler();
            }
        })
    }

    /// Binds and listens on `addr` with the default backlog
    /// (`SOMAXCONN`).
    pub fn listen(&self, addr: SocketAddrV4) -> Result<()> {
        self.listen_backlog(addr, libc::SOMAXCONN)
    }

    /// Binds and listens on `addr` with an explicit backlog.
    ///
    /// No-op unless the socket is idle. The definite local address is
    /// read back from the kernel, so listening on port 0 yields the real
    /// ephemeral port.
    pub fn listen_backlog(&self, addr: SocketAddrV4, backlog: i32) -> Result<()> {
        let data = &self.data;
        if data.status.get() != ServerStatus::Idle {
            return Ok(());
        }
        let fd = data.fd.get();

        sys::sys_bind(fd, addr)
            .map_err(|error| SocketError::from_io(SocketErrorKind::Bind, &error))?;
        sys::sys_listen(fd, backlog)
            .map_err(|error| SocketError::from_io(SocketErrorKind::Listen, &error))?;

        let local = sys::sys_local_addr(fd)
            .map_err(|error| SocketError::from_io(SocketErrorKind::GetLocalAddr, &error))?;
        data.local_addr.set(Some(local));
        data.status.set(ServerStatus::Listening);
        debug!(fd, addr = %local, "listening");
        Ok(())
    }

    /// Stops listening: unregisters from the reactor, closes the
    /// descriptor, and emits [`ServerEvent::Close`].
    pub fn close(&self) -> Result<()> {
        let data = &self.data;
        let fd = data.fd.get();

        reactor::unregister(fd);
        sys::sys_close(fd).map_err(|error| SocketError::from_io(SocketErrorKind::Close, &error))?;
        data.fd.set(-1);

        data.status.set(ServerStatus::Closed);
        debug!(fd, "server socket closed");
        self.data.listeners.emit(&ServerEvent::Close);
        Ok(())
    }

    /// Local address, definite once listening.
    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        self.data.local_addr.get()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ServerStatus {
        self.data.status.get()
    }
}

impl ReactorTarget for ServerSocket {
    /// Accepts every pending connection until the kernel pushes back.
    fn on_event(&self, _event: &RawEvent) -> Result<()> {
        let data = &self.data;
        let fd = data.fd.get();
        if fd < 0 {
            return Ok(());
        }

        loop {
            match sys::sys_accept(fd) {
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    return Err(SocketError::from_io(SocketErrorKind::Accept, &error).into())
                }
                Ok((client_fd, peer)) => {
                    let client = Socket::from_accepted(client_fd, data.local_addr.get(), peer)?;
                    trace!(fd, client_fd, peer = %peer, "accepted connection");
                    data.listeners.emit(&ServerEvent::Connect(client));
                }
            }
        }
        Ok(())
    }
}

impl Drop for ServerSocket {
    /// The descriptor closes when the last handle drops.
    fn drop(&mut self) {
        if Rc::strong_count(&self.data) == 1 {
            let fd = self.data.fd.get();
            if fd >= 0 {
                let _ = sys::sys_close(fd);
            }
        }
    }
}
