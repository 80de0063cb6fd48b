//! Listening socket management.
//!
//! Binds at construction (so address conflicts surface as errors early),
//! listens on demand, and hands each accepted fd upward through a
//! callback. Runs entirely on its owner's base loop thread.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info, warn};

use crate::channel::Channel;
use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::metrics::CONNECTIONS_ACCEPTED;
use crate::socket::Socket;
use crate::sockets;

/// Receives each accepted connection's fd and peer address. Takes
/// ownership of the fd.
pub(crate) type NewConnectionCallback = Box<dyn FnMut(RawFd, SocketAddr) + Send>;

pub(crate) struct Acceptor {
    handle: LoopHandle,
    socket: Socket,
    channel: Arc<Channel>,
    listening: AtomicBool,
    /// Reserved fd (open on /dev/null) used to shed connections under fd
    /// exhaustion: close it, accept the pending connection, close that,
    /// reopen the reserve. Otherwise the listen fd stays level-triggered
    /// readable and the loop spins.
    idle_fd: Mutex<RawFd>,
    new_connection: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub(crate) fn new(
        handle: LoopHandle,
        listen_addr: &SocketAddr,
        reuse_port: bool,
    ) -> Result<Arc<Acceptor>, Error> {
        let fd = sockets::create_nonblocking(sockets::family_of(listen_addr))?;
        let socket = Socket::new(fd);
        socket.set_reuseaddr(true);
        socket.set_reuseport(reuse_port);
        socket.bind_address(listen_addr)?;

        let idle_fd = open_dev_null();
        if idle_fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let acceptor = Arc::new(Acceptor {
            channel: Channel::new(handle.clone(), fd),
            handle,
            socket,
            listening: AtomicBool::new(false),
            idle_fd: Mutex::new(idle_fd),
            new_connection: Mutex::new(None),
        });
        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(Box::new(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        }));
        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection.lock().unwrap() = Some(cb);
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        sockets::local_addr(self.socket.fd())
    }

    pub(crate) fn listen(&self, backlog: i32) {
        self.handle.assert_in_loop_thread();
        self.listening.store(true, Ordering::Release);
        if let Err(e) = self.socket.listen(backlog) {
            error!("Acceptor::listen fd={}: {}", self.socket.fd(), e);
            return;
        }
        self.channel.enable_reading();
        match self.local_addr() {
            Ok(addr) => info!("listening on {}", addr),
            Err(_) => info!("listening on fd={}", self.socket.fd()),
        }
    }

    fn handle_read(&self) {
        self.handle.assert_in_loop_thread();
        match self.socket.accept() {
            Ok((connfd, peer_addr)) => {
                CONNECTIONS_ACCEPTED.increment();
                let mut slot = self.new_connection.lock().unwrap();
                match slot.as_mut() {
                    Some(cb) => cb(connfd, peer_addr),
                    None => sockets::close(connfd),
                }
            }
            Err(e) => {
                if e.raw_os_error() == Some(libc::EMFILE) {
                    warn!("accept: out of file descriptors, shedding one connection");
                    self.shed_one_connection();
                } else if e.raw_os_error() != Some(libc::EAGAIN) {
                    error!("Acceptor::handle_read: {}", e);
                }
            }
        }
    }

    /// EMFILE recovery: momentarily give the reserve fd back to the
    /// kernel, accept-and-close the pending connection, then retake the
    /// reserve.
    fn shed_one_connection(&self) {
        let mut idle = self.idle_fd.lock().unwrap();
        if *idle < 0 {
            return;
        }
        sockets::close(*idle);
        let connfd = unsafe { libc::accept(self.socket.fd(), ptr::null_mut(), ptr::null_mut()) };
        if connfd >= 0 {
            sockets::close(connfd);
        }
        *idle = open_dev_null();
        if *idle < 0 {
            warn!("could not reopen idle fd: {}", io::Error::last_os_error());
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.listening() {
            self.channel.disable_all();
            self.channel.remove();
        }
        let idle = *self.idle_fd.lock().unwrap();
        if idle >= 0 {
            sockets::close(idle);
        }
    }
}

fn open_dev_null() -> RawFd {
    unsafe {
        libc::open(
            b"/dev/null\0".as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    }
}
