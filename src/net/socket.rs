//! The client socket state machine.
//!
//! A [`Socket`] wraps a nonblocking IPv4 TCP descriptor registered with
//! the reactor for edge-triggered read and write readiness. Its
//! lifecycle:
//!
//! ```text
//! Idle --connect/EINPROGRESS--> Connecting --SO_ERROR==0--> Connected
//!   \--connect==0--------------------------------------------^   |
//!                                                                |
//!         local close() or peer FIN                              v
//! Closed <--second side closes-- HalfClosed <-------------- Connected
//! ```
//!
//! Writes go through a buffer: [`Socket::write`] appends and drains
//! opportunistically; whatever the kernel does not accept immediately is
//! flushed on write readiness. Each incomplete `write` records a target
//! byte count and a promise settled once `bytes_written` reaches it, so
//! write promises resolve in FIFO order.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddrV4;
use std::os::fd::RawFd;
use std::rc::Rc;

use anyhow::Result;
use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::net::event::{EventHandle, Listeners};
use crate::net::{SocketError, SocketErrorKind};
use crate::promise::{Promise, PromiseCtx};
use crate::reactor::poller::sys;
use crate::reactor::{self, Interest, RawEvent, ReactorTarget};

/// Bytes per `read` round and per readiness-drain `write` round.
const SOCK_BUFFER_SIZE: usize = 1024;

/// Bytes per opportunistic `write` round.
const N_BYTES_PER_ROUND: usize = 4096;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Idle,
    Connecting,
    Connected,
    HalfClosed,
    Closed,
}

/// Notifications delivered to socket listeners.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The connection is established.
    Connect,
    /// Bytes arrived from the peer.
    Data(Bytes),
    /// The peer closed its half of the connection.
    End,
    /// The connection is fully closed.
    Close,
    /// An asynchronous failure, currently only connect errors.
    Error(SocketError),
}

/// A pending write-completion promise.
struct WriteRecord {
    /// `bytes_written` value at which the promise resolves.
    target: usize,
    ctx: PromiseCtx<()>,
}

struct SocketData {
    /// Descriptor; -1 once closed locally.
    fd: Cell<RawFd>,
    status: Cell<SocketStatus>,

    /// Outgoing bytes not yet accepted by the kernel.
    buffer: RefCell<BytesMut>,
    bytes_read: Cell<usize>,
    bytes_written: Cell<usize>,

    /// Pending write promises, targets nondecreasing.
    write_queue: RefCell<VecDeque<WriteRecord>>,

    local_addr: Cell<Option<SocketAddrV4>>,
    remote_addr: Cell<Option<SocketAddrV4>>,

    listeners: Listeners<SocketEvent>,
}

/// A nonblocking TCP socket handle.
///
/// Cloning yields another handle to the same connection; the reactor
/// holds one clone for the lifetime of the registration.
#[derive(Clone)]
pub struct Socket {
    data: Rc<SocketData>,
}

impl Socket {
    /// Creates an idle socket, makes it nonblocking, and registers it
    /// with the reactor for read and write readiness.
    pub fn new() -> Result<Self> {
        let fd = sys::sys_socket_v4()
            .map_err(|error| SocketError::from_io(SocketErrorKind::Create, &error))?;

        let socket = Self::from_parts(fd, SocketStatus::Idle);
        socket.init()?;
        Ok(socket)
    }

    /// Wraps a descriptor accepted by a server socket.
    pub(crate) fn from_accepted(
        fd: RawFd,
        local_addr: Option<SocketAddrV4>,
        remote_addr: SocketAddrV4,
    ) -> Result<Self> {
        let socket = Self::from_parts(fd, SocketStatus::Connected);
        socket.data.local_addr.set(local_addr);
        socket.data.remote_addr.set(Some(remote_addr));
        socket.init()?;
        Ok(socket)
    }

    fn from_parts(fd: RawFd, status: SocketStatus) -> Self {
        Self {
            data: Rc::new(SocketData {
                fd: Cell::new(fd),
                status: Cell::new(status),
                buffer: RefCell::new(BytesMut::new()),
                bytes_read: Cell::new(0),
                bytes_written: Cell::new(0),
                write_queue: RefCell::new(VecDeque::new()),
                local_addr: Cell::new(None),
                remote_addr: Cell::new(None),
                listeners: Listeners::new(),
            }),
        }
    }

    /// Shared creation tail: nonblocking mode + reactor registration.
    fn init(&self) -> Result<()> {
        let fd = self.data.fd.get();

        sys::sys_set_nonblocking(fd)
            .map_err(|error| SocketError::from_io(SocketErrorKind::MakeNonBlock, &error))?;

        reactor::register(
            fd,
            Rc::new(self.clone()),
            Interest {
                read: true,
                write: true,
            },
        )?;
        Ok(())
    }

    /// Registers a listener for all socket events.
    pub fn on(&self, handler: impl FnMut(&SocketEvent) + 'static) -> EventHandle {
        self.data.listeners.on(handler)
    }

    /// Removes a listener. Returns whether it was registered.
    pub fn off(&self, handle: EventHandle) -> bool {
        self.data.listeners.off(handle)
    }

    /// Listener for [`SocketEvent::Connect`].
    pub fn on_connect(&self, mut handler: impl FnMut() + 'static) -> EventHandle {
        self.on(move |event| {
            if matches!(event, SocketEvent::Connect) {
                handler();
            }
        })
    }

    /// Listener for [`SocketEvent::Data`].
    pub fn on_data(&self, mut handler: impl FnMut(&Bytes) + 'static) -> EventHandle {
        self.on(move |event| {
            if let SocketEvent::Data(bytes) = event {
                handler(bytes);
            }
        })
    }

    /// Listener for [`SocketEvent::End`].
    pub fn on_end(&self, mut handler: impl FnMut() + 'static) -> EventHandle {
        self.on(move |event| {
            if matches!(event, SocketEvent::End) {
                handler();
            }
        })
    }

    /// Listener for [`SocketEvent::Close`].
    pub fn on_close(&self, mut handler: impl FnMut() + 'static) -> EventHandle {
        self.on(move |event| {
            if matches!(event, SocketEvent::Close) {
                handler();
            }
        })
    }

    /// Listener for [`SocketEvent::Error`].
    pub fn on_error(&self, mut handler: impl FnMut(&SocketError) + 'static) -> EventHandle {
        self.on(move |event| {
            if let SocketEvent::Error(error) = event {
                handler(error);
            }
        })
    }

    fn emit(&self, event: &SocketEvent) {
        self.data.listeners.emit(event);
    }

    /// Binds the socket to a local address.
    ///
    /// No-op unless the socket is idle and unbound. The definite local
    /// address is read back from the kernel, so binding port 0 yields
    /// the real ephemeral port.
    pub fn bind(&self, addr: SocketAddrV4) -> Result<()> {
        let data = &self.data;
        if data.status.get() != SocketStatus::Idle || data.local_addr.get().is_some() {
            return Ok(());
        }

        sys::sys_bind(data.fd.get(), addr)
            .map_err(|error| SocketError::from_io(SocketErrorKind::Bind, &error))?;

        let local = sys::sys_local_addr(data.fd.get())
            .map_err(|error| SocketError::from_io(SocketErrorKind::GetLocalAddr, &error))?;
        data.local_addr.set(Some(local));
        Ok(())
    }

    /// Connects to a remote address.
    ///
    /// The returned promise resolves once the connection is established
    /// (immediately on the fast path) and rejects with the
    /// [`SocketError`] if the connection attempt fails asynchronously.
    /// Calling `connect` on a non-idle socket returns a resolved promise
    /// and does nothing.
    pub fn connect(&self, addr: SocketAddrV4) -> Result<Promise<()>> {
        let data = &self.data;
        if data.status.get() != SocketStatus::Idle {
            return Ok(Promise::resolved(()));
        }

        match sys::sys_connect(data.fd.get(), addr) {
            Ok(()) => {
                data.status.set(SocketStatus::Connected);
                data.remote_addr.set(Some(addr));
                debug!(fd = data.fd.get(), %addr, "connected");
                self.emit(&SocketEvent::Connect);
                Ok(Promise::resolved(()))
            }
            Err(error) if error.raw_os_error() == Some(libc::EINPROGRESS) => {
                data.status.set(SocketStatus::Connecting);
                data.remote_addr.set(Some(addr));
                trace!(fd = data.fd.get(), %addr, "connect in progress");

                // The listener captures only the settle capability, so
                // no reference cycle through the socket's own state.
                let (promise, ctx) = Promise::with_ctx();
                data.listeners.on(move |event| match event {
                    SocketEvent::Connect => ctx.resolve(()),
                    SocketEvent::Error(error) => ctx.reject(error.clone()),
                    _ => {}
                });
                Ok(promise)
            }
            Err(error) => Err(SocketError::from_io(SocketErrorKind::Connect, &error).into()),
        }
    }

    /// Queues `data` for transmission.
    ///
    /// The buffer is drained opportunistically right away; if the kernel
    /// accepts everything the returned promise is already resolved.
    /// Otherwise it resolves once the reactor has flushed every byte of
    /// this write.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<Promise<()>> {
        let bytes = data.into();
        let sock = &self.data;

        sock.buffer.borrow_mut().extend_from_slice(&bytes);
        self.drain_buffer(N_BYTES_PER_ROUND)?;

        if sock.buffer.borrow().is_empty() {
            return Ok(Promise::resolved(()));
        }

        let target = sock.bytes_written.get() + sock.buffer.borrow().len();
        trace!(fd = sock.fd.get(), write_target = target, "write pending on readiness");

        let shared = self.data.clone();
        Ok(Promise::new(move |ctx| {
            shared
                .write_queue
                .borrow_mut()
                .push_back(WriteRecord { target, ctx });
            Ok(())
        }))
    }

    /// Closes this side of the connection.
    ///
    /// A connected socket becomes half-closed; a socket whose peer
    /// already left becomes closed, emits [`SocketEvent::Close`], and is
    /// unregistered from the reactor. Any other state is a no-op.
    pub fn close(&self) -> Result<()> {
        let data = &self.data;
        let status = data.status.get();
        if status != SocketStatus::Connected && status != SocketStatus::HalfClosed {
            return Ok(());
        }

        let fd = data.fd.get();
        if fd >= 0 {
            sys::sys_close(fd)
                .map_err(|error| SocketError::from_io(SocketErrorKind::Close, &error))?;
        }

        if status == SocketStatus::Connected {
            data.fd.set(-1);
            data.status.set(SocketStatus::HalfClosed);
            trace!(fd, "half-closed locally");
        } else if fd >= 0 {
            data.fd.set(-1);
            data.status.set(SocketStatus::Closed);
            debug!(fd, "closed");
            self.emit(&SocketEvent::Close);
            reactor::unregister(fd);
        }
        Ok(())
    }

    /// Current lifecycle state.
    pub fn status(&self) -> SocketStatus {
        self.data.status.get()
    }

    /// Bytes queued in the write buffer.
    pub fn buffer_size(&self) -> usize {
        self.data.buffer.borrow().len()
    }

    /// Total bytes received.
    pub fn bytes_read(&self) -> usize {
        self.data.bytes_read.get()
    }

    /// Total bytes accepted by the kernel.
    pub fn bytes_written(&self) -> usize {
        self.data.bytes_written.get()
    }

    /// Local address, if definite.
    ///
    /// Definite after a successful bind or accept; for a connected,
    /// unbound socket it is read from the kernel on first call.
    pub fn local_addr(&self) -> Result<Option<SocketAddrV4>> {
        let data = &self.data;
        if let Some(addr) = data.local_addr.get() {
            return Ok(Some(addr));
        }
        if data.status.get() != SocketStatus::Connected {
            return Ok(None);
        }

        let addr = sys::sys_local_addr(data.fd.get())
            .map_err(|error| SocketError::from_io(SocketErrorKind::GetLocalAddr, &error))?;
        data.local_addr.set(Some(addr));
        Ok(Some(addr))
    }

    /// Remote address, once known.
    pub fn remote_addr(&self) -> Option<SocketAddrV4> {
        self.data.remote_addr.get()
    }

    /// Drains the write buffer in `chunk`-byte rounds until the kernel
    /// pushes back or the buffer empties.
    fn drain_buffer(&self, chunk: usize) -> Result<()> {
        let sock = &self.data;
        let fd = sock.fd.get();

        loop {
            let len = {
                let buffer = sock.buffer.borrow();
                if buffer.is_empty() {
                    break;
                }
                chunk.min(buffer.len())
            };

            let count = {
                let buffer = sock.buffer.borrow();
                sys::sys_write(fd, &buffer[..len])
            };

            if count < 0 {
                let error = io::Error::last_os_error();
                if error.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                return Err(SocketError::from_io(SocketErrorKind::Write, &error).into());
            }
            if count == 0 {
                break;
            }

            sock.buffer.borrow_mut().advance(count as usize);
            sock.bytes_written
                .set(sock.bytes_written.get() + count as usize);
        }
        Ok(())
    }

    /// Resolves every queue head whose target has been flushed.
    fn resolve_write_promises(&self) {
        let sock = &self.data;

        loop {
            let ready = {
                let queue = sock.write_queue.borrow();
                matches!(queue.front(), Some(record) if record.target <= sock.bytes_written.get())
            };
            if !ready {
                break;
            }

            let record = sock
                .write_queue
                .borrow_mut()
                .pop_front()
                .expect("write queue emptied concurrently");
            record.ctx.resolve(());
        }
    }

    /// Read-readiness path: drain the descriptor, deliver data, and run
    /// the FIN transitions.
    fn handle_readable(&self, fd: RawFd) -> Result<()> {
        let sock = &self.data;
        let mut incoming = BytesMut::new();
        let mut scratch = [0u8; SOCK_BUFFER_SIZE];
        let mut peer_closed = false;

        loop {
            let count = sys::sys_read(fd, &mut scratch);
            if count < 0 {
                let error = io::Error::last_os_error();
                if error.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                return Err(SocketError::from_io(SocketErrorKind::Read, &error).into());
            }
            if count == 0 {
                peer_closed = true;
                break;
            }
            incoming.extend_from_slice(&scratch[..count as usize]);
        }

        if !incoming.is_empty() {
            sock.bytes_read.set(sock.bytes_read.get() + incoming.len());
            trace!(fd, bytes = incoming.len(), "data received");
            self.emit(&SocketEvent::Data(incoming.freeze()));
        }

        if peer_closed {
            if sock.status.get() == SocketStatus::HalfClosed {
                sock.status.set(SocketStatus::Closed);
                debug!(fd, "peer closed; connection fully closed");
                self.emit(&SocketEvent::Close);
                reactor::unregister(fd);
            } else {
                sock.status.set(SocketStatus::HalfClosed);
                debug!(fd, "peer closed its half");
                self.emit(&SocketEvent::End);
            }
        }
        Ok(())
    }

    /// Write-readiness path: finish an in-flight connect, or flush the
    /// buffer and settle write promises.
    fn handle_writable(&self, fd: RawFd) -> Result<()> {
        let sock = &self.data;

        if sock.status.get() == SocketStatus::Connecting {
            let verdict = sys::sys_so_error(fd);
            match verdict {
                Ok(0) => {
                    sock.status.set(SocketStatus::Connected);
                    debug!(fd, "connection established");
                    self.emit(&SocketEvent::Connect);
                }
                Ok(errno) => {
                    debug!(fd, errno, "connection failed");
                    self.emit(&SocketEvent::Error(SocketError {
                        kind: SocketErrorKind::Connect,
                        errno,
                    }));
                    self.close_after_connect_error();
                }
                Err(error) => {
                    self.emit(&SocketEvent::Error(SocketError::from_io(
                        SocketErrorKind::Connect,
                        &error,
                    )));
                    self.close_after_connect_error();
                }
            }
            return Ok(());
        }

        self.drain_buffer(SOCK_BUFFER_SIZE)?;
        self.resolve_write_promises();
        Ok(())
    }

    /// Tears the socket down after a failed connection attempt.
    fn close_after_connect_error(&self) {
        let data = &self.data;
        let fd = data.fd.get();

        if fd >= 0 {
            let _ = sys::sys_close(fd);
            reactor::unregister(fd);
            data.fd.set(-1);
        }
        data.status.set(SocketStatus::Closed);
        self.emit(&SocketEvent::Close);
    }
}

impl ReactorTarget for Socket {
    fn on_event(&self, event: &RawEvent) -> Result<()> {
        let fd = self.data.fd.get();
        if fd < 0 {
            return Ok(());
        }

        // A failed connect arrives with error flags alongside readability;
        // the SO_ERROR check must see it before the read path does.
        if self.data.status.get() == SocketStatus::Connecting {
            if reactor::is_writable(event) {
                self.handle_writable(fd)?;
            }
            if self.data.status.get() != SocketStatus::Connected {
                return Ok(());
            }
            // The connection opened on this very event; fall through so
            // data that arrived with it is not left behind the edge.
        }

        if reactor::is_readable(event) {
            self.handle_readable(fd)?;
        }
        if reactor::is_writable(event) {
            self.handle_writable(fd)?;
        }
        Ok(())
    }
}

impl Drop for Socket {
    /// The descriptor closes when the last handle drops.
    ///
    /// While registered, the reactor's clone keeps the socket alive;
    /// this fires after unregistration (or for sockets that never
    /// reached the reactor).
    fn drop(&mut self) {
        if Rc::strong_count(&self.data) == 1 {
            let fd = self.data.fd.get();
            if fd >= 0 {
                let _ = sys::sys_close(fd);
            }
        }
    }
}
