//! Thin wrappers over the BSD socket API.
//!
//! Everything the socket layer needs from the OS, errno-faithful and
//! IPv4-only. Callers translate `io::Error` into their own typed errors.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::RawFd;

/// Reads from a descriptor into the buffer.
///
/// Returns the byte count, 0 on EOF, or a negative value on error (check
/// `io::Error::last_os_error()`). The descriptor must be non-blocking.
pub(crate) fn sys_read(fd: RawFd, buffer: &mut [u8]) -> isize {
    unsafe { libc::read(fd, buffer.as_mut_ptr() as *mut _, buffer.len()) }
}

/// Writes the buffer to a descriptor.
///
/// Returns the byte count or a negative value on error. The descriptor
/// must be non-blocking.
pub(crate) fn sys_write(fd: RawFd, buffer: &[u8]) -> isize {
    unsafe { libc::write(fd, buffer.as_ptr() as *const _, buffer.len()) }
}

/// Closes a descriptor.
pub(crate) fn sys_close(fd: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::close(fd) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Creates an IPv4 TCP socket. Blocking; callers make it non-blocking.
pub(crate) fn sys_socket_v4() -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}

/// Sets a descriptor to non-blocking mode.
pub(crate) fn sys_set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Enables `SO_REUSEADDR`.
pub(crate) fn sys_set_reuseaddr(fd: RawFd) -> io::Result<()> {
    let enable: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &enable as *const _ as *const _,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Binds a socket to an IPv4 address.
pub(crate) fn sys_bind(fd: RawFd, addr: SocketAddrV4) -> io::Result<()> {
    let sockaddr = v4_to_sockaddr_in(addr);
    let rc = unsafe {
        libc::bind(
            fd,
            &sockaddr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Marks a socket as listening.
pub(crate) fn sys_listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    let rc = unsafe { libc::listen(fd, backlog) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Initiates a connection. `EINPROGRESS` surfaces as an error; the
/// caller treats it as "in flight".
pub(crate) fn sys_connect(fd: RawFd, addr: SocketAddrV4) -> io::Result<()> {
    let sockaddr = v4_to_sockaddr_in(addr);
    let rc = unsafe {
        libc::connect(
            fd,
            &sockaddr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Accepts one pending connection, returning the client descriptor and
/// peer address. The client is left blocking; socket init makes it
/// non-blocking.
pub(crate) fn sys_accept(fd: RawFd) -> io::Result<(RawFd, SocketAddrV4)> {
    let mut sockaddr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let client_fd =
        unsafe { libc::accept(fd, &mut sockaddr as *mut _ as *mut libc::sockaddr, &mut len) };
    if client_fd < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok((client_fd, sockaddr_in_to_v4(&sockaddr)))
}

/// Returns the local address of a socket.
pub(crate) fn sys_local_addr(fd: RawFd) -> io::Result<SocketAddrV4> {
    let mut sockaddr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let rc =
        unsafe { libc::getsockname(fd, &mut sockaddr as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(sockaddr_in_to_v4(&sockaddr))
    }
}

/// Reads and clears the pending `SO_ERROR` of a socket.
pub(crate) fn sys_so_error(fd: RawFd) -> io::Result<i32> {
    let mut result: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut result as *mut _ as *mut _,
            &mut len,
        )
    };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

fn v4_to_sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sockaddr: libc::sockaddr_in = unsafe { mem::zeroed() };
    sockaddr.sin_family = libc::AF_INET as libc::sa_family_t;
    sockaddr.sin_port = addr.port().to_be();
    sockaddr.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    sockaddr
}

fn sockaddr_in_to_v4(sockaddr: &libc::sockaddr_in) -> SocketAddrV4 {
    let ip = Ipv4Addr::from(u32::from_be(sockaddr.sin_addr.s_addr));
    let port = u16::from_be(sockaddr.sin_port);
    SocketAddrV4::new(ip, port)
}
