//! Thin non-blocking socket syscall layer.
//!
//! Every call here is blocking-free and reports POSIX errno semantics via
//! `io::Error`; classification of those errors happens in the callers
//! (connector retry buckets, connection read/write paths). All unsafe libc
//! plumbing for sockets lives in this module.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;

/// Create a non-blocking, close-on-exec TCP socket for `family`
/// (`libc::AF_INET` or `libc::AF_INET6`).
pub(crate) fn create_nonblocking(family: libc::c_int) -> io::Result<RawFd> {
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub(crate) fn family_of(addr: &SocketAddr) -> libc::c_int {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

/// Convert a Rust `SocketAddr` into a sockaddr_storage + length pair.
pub(crate) fn socket_addr_to_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            sa.sin6_scope_id = v6.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Convert a `sockaddr_storage` filled by the kernel to a `SocketAddr`.
pub(crate) fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            Some(SocketAddr::from((ip, u16::from_be(sa.sin_port))))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::from((ip, u16::from_be(sa.sin6_port))))
        }
        _ => None,
    }
}

pub(crate) fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = socket_addr_to_storage(addr);
    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    let ret = unsafe { libc::listen(fd, backlog) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Accept one pending connection, non-blocking and close-on-exec.
pub(crate) fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let connfd = unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if connfd < 0 {
        return Err(io::Error::last_os_error());
    }
    let peer = sockaddr_to_socket_addr(&storage)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    Ok((connfd, peer))
}

/// Issue a non-blocking connect. `Err` carries the raw errno (usually
/// `EINPROGRESS` for a connect still in flight).
pub(crate) fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = socket_addr_to_storage(addr);
    let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub(crate) fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Half-close: shut down only the write direction.
pub(crate) fn shutdown_write(fd: RawFd) -> io::Result<()> {
    let ret = unsafe { libc::shutdown(fd, libc::SHUT_WR) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Fetch and clear the pending socket error (`SO_ERROR`). Returns 0 when
/// the socket is healthy.
pub(crate) fn socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        err
    }
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret =
        unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_socket_addr(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret =
        unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_socket_addr(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))
}

/// Detect the self-connect artifact: a non-blocking connect that landed on
/// its own ephemeral port, so local and peer address are identical.
pub(crate) fn is_self_connect(fd: RawFd) -> bool {
    match (local_addr(fd), peer_addr(fd)) {
        (Ok(local), Ok(peer)) => local == peer,
        _ => false,
    }
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, on: bool) -> io::Result<()> {
    let val: libc::c_int = if on { 1 } else { 0 };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &val as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn set_tcp_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
}

pub(crate) fn set_keepalive(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
}

pub(crate) fn set_reuseaddr(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
}

pub(crate) fn set_reuseport(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_addr_round_trips_through_storage() {
        let addrs: [SocketAddr; 2] = [
            "127.0.0.1:8080".parse().unwrap(),
            "[::1]:9090".parse().unwrap(),
        ];
        for addr in addrs {
            let (storage, _) = socket_addr_to_storage(&addr);
            assert_eq!(sockaddr_to_socket_addr(&storage), Some(addr));
        }
    }

    #[test]
    fn local_addr_reports_bound_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let fd = create_nonblocking(libc::AF_INET).unwrap();
        bind(fd, &addr).unwrap();
        let bound = local_addr(fd).unwrap();
        assert_eq!(bound.ip(), addr.ip());
        assert_ne!(bound.port(), 0);
        close(fd);
    }
}
