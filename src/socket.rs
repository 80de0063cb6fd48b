//! Owning wrapper around a connected or listening socket fd.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use log::warn;

use crate::sockets;

/// Owns one socket fd and closes it on drop.
///
/// The socket never closes early: connections keep theirs alive until the
/// connection object itself is destroyed, which makes fd leaks easy to
/// attribute.
#[derive(Debug)]
pub(crate) struct Socket {
    fd: RawFd,
}

impl Socket {
    pub(crate) fn new(fd: RawFd) -> Socket {
        Socket { fd }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn bind_address(&self, addr: &SocketAddr) -> io::Result<()> {
        sockets::bind(self.fd, addr)
    }

    pub(crate) fn listen(&self, backlog: i32) -> io::Result<()> {
        sockets::listen(self.fd, backlog)
    }

    pub(crate) fn accept(&self) -> io::Result<(RawFd, SocketAddr)> {
        sockets::accept(self.fd)
    }

    pub(crate) fn shutdown_write(&self) {
        if let Err(e) = sockets::shutdown_write(self.fd) {
            warn!("shutdown_write fd={}: {}", self.fd, e);
        }
    }

    pub(crate) fn set_tcp_nodelay(&self, on: bool) {
        if let Err(e) = sockets::set_tcp_nodelay(self.fd, on) {
            warn!("TCP_NODELAY fd={}: {}", self.fd, e);
        }
    }

    pub(crate) fn set_keepalive(&self, on: bool) {
        if let Err(e) = sockets::set_keepalive(self.fd, on) {
            warn!("SO_KEEPALIVE fd={}: {}", self.fd, e);
        }
    }

    pub(crate) fn set_reuseaddr(&self, on: bool) {
        if let Err(e) = sockets::set_reuseaddr(self.fd, on) {
            warn!("SO_REUSEADDR fd={}: {}", self.fd, e);
        }
    }

    pub(crate) fn set_reuseport(&self, on: bool) {
        if let Err(e) = sockets::set_reuseport(self.fd, on) {
            warn!("SO_REUSEPORT fd={}: {}", self.fd, e);
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        sockets::close(self.fd);
    }
}
