//! Outbound connection establishment with retry.
//!
//! Drives one non-blocking connect at a time. The in-flight socket is
//! watched for writability; on readiness the socket is checked for a
//! deferred error (`SO_ERROR`) and for the self-connect artifact before it
//! is handed upward. Failed attempts are retried with doubling delay,
//! capped at 30 seconds; [`restart`](Connector::restart) resets the delay
//! to the 500 ms floor.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::metrics::CONNECT_RETRIES;
use crate::sockets;

/// Receives the connected socket fd. Takes ownership of the fd.
pub type NewConnectionCallback = Box<dyn FnMut(RawFd) + Send>;

pub(crate) const INIT_RETRY_DELAY_MS: u64 = 500;
pub(crate) const MAX_RETRY_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

/// How a connect attempt's errno is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// In progress (or already done); watch for writability.
    Connecting,
    /// Transient failure; retry with backoff.
    Retry,
    /// Unrecoverable; close the socket and give up.
    Fatal,
}

fn classify_connect_errno(errno: i32) -> Disposition {
    match errno {
        0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => Disposition::Connecting,
        libc::EAGAIN
        | libc::EADDRINUSE
        | libc::EADDRNOTAVAIL
        | libc::ECONNREFUSED
        | libc::ENETUNREACH => Disposition::Retry,
        _ => Disposition::Fatal,
    }
}

pub struct Connector {
    self_weak: Weak<Connector>,
    handle: LoopHandle,
    server_addr: SocketAddr,
    /// Whether the user currently wants a connection. Cleared by `stop`.
    connect: AtomicBool,
    state: AtomicU8,
    retry_delay_ms: AtomicU64,
    /// Channel watching the in-flight connect, present only while
    /// `Connecting`.
    channel: Mutex<Option<Arc<Channel>>>,
    new_connection: Mutex<Option<NewConnectionCallback>>,
}

impl Connector {
    pub fn new(handle: LoopHandle, server_addr: SocketAddr) -> Arc<Connector> {
        Arc::new_cyclic(|weak| Connector {
            self_weak: weak.clone(),
            handle,
            server_addr,
            connect: AtomicBool::new(false),
            state: AtomicU8::new(State::Disconnected as u8),
            retry_delay_ms: AtomicU64::new(INIT_RETRY_DELAY_MS),
            channel: Mutex::new(None),
            new_connection: Mutex::new(None),
        })
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection.lock().unwrap() = Some(cb);
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Current retry delay; doubles after each failed attempt.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.load(Ordering::Acquire))
    }

    /// Begin connecting. Callable from any thread.
    pub fn start(&self) {
        self.connect.store(true, Ordering::Release);
        let connector = self.shared();
        self.handle.run_in_loop(move || connector.start_in_loop());
    }

    /// Abandon the current attempt and stop retrying.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        let connector = self.shared();
        self.handle.queue_in_loop(move || connector.stop_in_loop());
    }

    /// Reconnect with the backoff reset to its floor. Loop thread only.
    pub fn restart(&self) {
        self.handle.assert_in_loop_thread();
        self.set_state(State::Disconnected);
        self.retry_delay_ms
            .store(INIT_RETRY_DELAY_MS, Ordering::Release);
        self.connect.store(true, Ordering::Release);
        self.start_in_loop();
    }

    fn start_in_loop(&self) {
        self.handle.assert_in_loop_thread();
        debug_assert_eq!(self.state(), State::Disconnected);
        if self.connect.load(Ordering::Acquire) {
            self.do_connect();
        } else {
            debug!("connect aborted before first attempt");
        }
    }

    fn stop_in_loop(&self) {
        self.handle.assert_in_loop_thread();
        if self.state() == State::Connecting {
            self.set_state(State::Disconnected);
            let fd = self.remove_and_reset_channel();
            // connect flag is already down, so this just closes the fd.
            self.retry(fd);
        }
    }

    fn do_connect(&self) {
        let fd = match sockets::create_nonblocking(sockets::family_of(&self.server_addr)) {
            Ok(fd) => fd,
            Err(e) => {
                error!("Connector: socket: {}", e);
                return;
            }
        };
        let errno = match sockets::connect(fd, &self.server_addr) {
            Ok(()) => 0,
            Err(e) => e.raw_os_error().unwrap_or(libc::EBADF),
        };
        match classify_connect_errno(errno) {
            Disposition::Connecting => self.connecting(fd),
            Disposition::Retry => self.retry(fd),
            Disposition::Fatal => {
                error!(
                    "Connector: connect to {}: {}",
                    self.server_addr,
                    std::io::Error::from_raw_os_error(errno)
                );
                sockets::close(fd);
            }
        }
    }

    fn connecting(&self, fd: RawFd) {
        self.set_state(State::Connecting);
        let channel = Channel::new(self.handle.clone(), fd);
        channel.set_write_callback(Box::new({
            let weak = self.self_weak.clone();
            move || {
                if let Some(connector) = weak.upgrade() {
                    connector.handle_write();
                }
            }
        }));
        channel.set_error_callback(Box::new({
            let weak = self.self_weak.clone();
            move || {
                if let Some(connector) = weak.upgrade() {
                    connector.handle_error();
                }
            }
        }));
        *self.channel.lock().unwrap() = Some(channel.clone());
        channel.enable_writing();
    }

    /// Detach the watch channel from the loop and recover the fd.
    fn remove_and_reset_channel(&self) -> RawFd {
        let channel = self
            .channel
            .lock()
            .unwrap()
            .take()
            .expect("no channel for in-flight connect");
        channel.disable_all();
        channel.remove();
        channel.fd()
    }

    fn handle_write(&self) {
        trace!("Connector::handle_write state={:?}", self.state());
        if self.state() != State::Connecting {
            debug_assert_eq!(self.state(), State::Disconnected);
            return;
        }
        let fd = self.remove_and_reset_channel();
        let err = sockets::socket_error(fd);
        if err != 0 {
            warn!(
                "Connector: SO_ERROR={} {}",
                err,
                std::io::Error::from_raw_os_error(err)
            );
            self.retry(fd);
        } else if sockets::is_self_connect(fd) {
            warn!("Connector: self connect");
            self.retry(fd);
        } else {
            self.set_state(State::Connected);
            if self.connect.load(Ordering::Acquire) {
                let mut slot = self.new_connection.lock().unwrap();
                match slot.as_mut() {
                    Some(cb) => cb(fd),
                    None => sockets::close(fd),
                }
            } else {
                sockets::close(fd);
            }
        }
    }

    fn handle_error(&self) {
        error!("Connector::handle_error state={:?}", self.state());
        if self.state() == State::Connecting {
            let fd = self.remove_and_reset_channel();
            let err = sockets::socket_error(fd);
            trace!("SO_ERROR={}", err);
            self.retry(fd);
        }
    }

    /// Close the failed socket and schedule the next attempt. The timer
    /// holds only a weak reference, so a dropped connector cancels its own
    /// retries.
    fn retry(&self, fd: RawFd) {
        sockets::close(fd);
        self.set_state(State::Disconnected);
        if self.connect.load(Ordering::Acquire) {
            CONNECT_RETRIES.increment();
            let delay_ms = self.retry_delay_ms.load(Ordering::Acquire);
            info!(
                "Connector: retry connecting to {} in {} ms",
                self.server_addr, delay_ms
            );
            let weak = self.self_weak.clone();
            self.handle
                .run_after(Duration::from_millis(delay_ms), move || {
                    if let Some(connector) = weak.upgrade() {
                        connector.start_in_loop();
                    }
                });
            self.retry_delay_ms
                .store((delay_ms * 2).min(MAX_RETRY_DELAY_MS), Ordering::Release);
        } else {
            debug!("connect abandoned");
        }
    }

    fn shared(&self) -> Arc<Connector> {
        self.self_weak.upgrade().expect("connector destroyed")
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            1 => State::Connecting,
            2 => State::Connected,
            _ => State::Disconnected,
        }
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_classification() {
        assert_eq!(classify_connect_errno(0), Disposition::Connecting);
        assert_eq!(
            classify_connect_errno(libc::EINPROGRESS),
            Disposition::Connecting
        );
        assert_eq!(
            classify_connect_errno(libc::EISCONN),
            Disposition::Connecting
        );
        assert_eq!(
            classify_connect_errno(libc::ECONNREFUSED),
            Disposition::Retry
        );
        assert_eq!(
            classify_connect_errno(libc::EADDRINUSE),
            Disposition::Retry
        );
        assert_eq!(
            classify_connect_errno(libc::ENETUNREACH),
            Disposition::Retry
        );
        assert_eq!(classify_connect_errno(libc::EACCES), Disposition::Fatal);
        assert_eq!(classify_connect_errno(libc::EBADF), Disposition::Fatal);
        assert_eq!(classify_connect_errno(libc::ENOTSOCK), Disposition::Fatal);
    }

    #[test]
    fn retry_delay_doubles_to_cap() {
        let mut delay = INIT_RETRY_DELAY_MS;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(delay);
            delay = (delay * 2).min(MAX_RETRY_DELAY_MS);
        }
        assert_eq!(
            seen,
            vec![500, 1000, 2000, 4000, 8000, 16000, 30000, 30000]
        );
    }
}
