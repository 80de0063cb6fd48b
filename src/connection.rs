//! Established TCP connection with buffered, backpressured I/O.
//!
//! A [`TcpConnection`] is shared as `Arc<TcpConnection>` between its owner
//! (server or client), the event loop callbacks, and the user. The channel
//! holds only a weak reference, tied for the dispatch frame, so a
//! connection being torn down never dangles under its own callbacks.
//!
//! State machine: `Connecting` -> `Connected` -> `Disconnecting` (half
//! close requested, output still draining) -> `Disconnected`. All state
//! transitions and socket I/O happen on the connection's loop thread; the
//! public mutators marshal themselves there.

use std::any::Any;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, trace};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::metrics::{BYTES_RECEIVED, BYTES_SENT, CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED};
use crate::socket::Socket;
use crate::sockets;

/// Shared connection pointer handed to every user callback.
pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Invoked on connection establishment and teardown.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Invoked when bytes arrive, with the input buffer and receive timestamp.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync>;
/// Invoked when the output buffer has fully drained to the kernel.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Invoked when the output buffer crosses the high-water mark, with the
/// buffered byte count.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
/// Internal teardown hook, consumed at most once.
pub(crate) type CloseCallback = Box<dyn FnOnce(&TcpConnectionPtr) + Send>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

struct ConnCallbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

impl Default for ConnCallbacks {
    fn default() -> Self {
        ConnCallbacks {
            connection: Arc::new(|conn| default_connection_callback(conn)),
            message: Arc::new(|conn, buf, ts| default_message_callback(conn, buf, ts)),
            write_complete: None,
            high_water_mark: None,
            close: None,
        }
    }
}

/// Logs connection up/down transitions. Installed when the owner sets no
/// connection callback of its own.
pub fn default_connection_callback(conn: &TcpConnectionPtr) {
    trace!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
}

/// Discards whatever arrived, so an unconfigured connection never grows
/// its input buffer without bound.
pub fn default_message_callback(_conn: &TcpConnectionPtr, buf: &mut Buffer, _when: Instant) {
    buf.retrieve_all();
}

pub struct TcpConnection {
    self_weak: Weak<TcpConnection>,
    handle: LoopHandle,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<ConnCallbacks>,
    /// User-attached per-connection state (protocol codec, session, ...).
    context: Mutex<Option<Box<dyn Any + Send>>>,
}

impl TcpConnection {
    pub(crate) fn new(
        handle: LoopHandle,
        name: String,
        sockfd: RawFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        let conn = Arc::new_cyclic(|weak: &Weak<TcpConnection>| TcpConnection {
            self_weak: weak.clone(),
            channel: Channel::new(handle.clone(), sockfd),
            handle,
            name,
            state: AtomicU8::new(State::Connecting as u8),
            reading: AtomicBool::new(true),
            socket: Socket::new(sockfd),
            local_addr,
            peer_addr,
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            callbacks: Mutex::new(ConnCallbacks::default()),
            context: Mutex::new(None),
        });

        let weak = conn.self_weak.clone();
        conn.channel.set_read_callback(Box::new({
            let weak = weak.clone();
            move |receive_time| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(receive_time);
                }
            }
        }));
        conn.channel.set_write_callback(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            }
        }));
        conn.channel.set_close_callback(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            }
        }));
        conn.channel.set_error_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        }));

        debug!("TcpConnection::new [{}] fd={}", conn.name, sockfd);
        conn.socket.set_keepalive(true);
        conn
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    /// Bytes currently waiting in the output buffer.
    pub fn output_bytes(&self) -> usize {
        self.output.lock().unwrap().readable_bytes()
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        self.socket.set_tcp_nodelay(on);
    }

    // ── Callback wiring ──────────────────────────────────────────────

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().connection = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().unwrap().message = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().write_complete = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark.store(mark, Ordering::Release);
        self.callbacks.lock().unwrap().high_water_mark = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().unwrap().close = Some(cb);
    }

    // ── User context ─────────────────────────────────────────────────

    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        *self.context.lock().unwrap() = Some(context);
    }

    /// Borrow the context slot under its lock.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut Option<Box<dyn Any + Send>>) -> R) -> R {
        f(&mut self.context.lock().unwrap())
    }

    // ── Sending ──────────────────────────────────────────────────────

    /// Send bytes on this connection. Never blocks: whatever the kernel
    /// does not take immediately is buffered and drained on writability.
    /// Data sent past `Connected` is dropped and logged.
    pub fn send(&self, data: &[u8]) {
        if self.state() != State::Connected {
            debug!("[{}] not connected, dropping {} bytes", self.name, data.len());
            return;
        }
        if self.handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.shared();
            let data = data.to_vec();
            self.handle.run_in_loop(move || conn.send_in_loop(&data));
        }
    }

    /// Send the readable contents of `buf`, consuming them.
    pub fn send_buffer(&self, buf: &mut Buffer) {
        if self.state() != State::Connected {
            debug!(
                "[{}] not connected, dropping {} bytes",
                self.name,
                buf.readable_bytes()
            );
            return;
        }
        let data = buf.retrieve_all_as_vec();
        self.send(&data);
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.handle.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            error!("[{}] disconnected, give up writing", self.name);
            return;
        }

        let mut output = self.output.lock().unwrap();
        let mut written = 0;
        let mut fault = false;

        // Try the kernel directly only when nothing is queued ahead of us,
        // to preserve ordering.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match sockets::write(self.channel.fd(), data) {
                Ok(n) => {
                    written = n;
                    BYTES_SENT.add(n as u64);
                    if written == data.len() {
                        if let Some(cb) = self.callbacks.lock().unwrap().write_complete.clone() {
                            let conn = self.shared();
                            self.handle.queue_in_loop(move || cb(&conn));
                        }
                    }
                }
                Err(e) => {
                    if !is_transient(&e) {
                        error!("[{}] write: {}", self.name, e);
                        if matches!(
                            e.raw_os_error(),
                            Some(libc::EPIPE) | Some(libc::ECONNRESET)
                        ) {
                            fault = true;
                        }
                    }
                }
            }
        }

        let remaining = data.len() - written;
        if !fault && remaining > 0 {
            let old_len = output.readable_bytes();
            let high_water_mark = self.high_water_mark.load(Ordering::Acquire);
            // Fire only on the upward crossing, not on every send above
            // the mark.
            if old_len < high_water_mark && old_len + remaining >= high_water_mark {
                if let Some(cb) = self.callbacks.lock().unwrap().high_water_mark.clone() {
                    let conn = self.shared();
                    let queued = old_len + remaining;
                    self.handle.queue_in_loop(move || cb(&conn, queued));
                }
            }
            output.append(&data[written..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    // ── Shutdown and close ───────────────────────────────────────────

    /// Half-close the write side once the output buffer drains. Reading
    /// continues until the peer closes.
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                State::Connected as u8,
                State::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let conn = self.shared();
            self.handle.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.handle.assert_in_loop_thread();
        // Output still draining: handle_write issues the shutdown when the
        // buffer empties.
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }

    /// Close immediately, discarding any unsent output.
    pub fn force_close(&self) {
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            self.set_state(State::Disconnecting);
            let conn = self.shared();
            self.handle.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    /// Close after `delay`, unless the connection is gone by then. The
    /// timer holds only a weak reference, so it never extends the
    /// connection's lifetime.
    pub fn force_close_with_delay(&self, delay: Duration) {
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            let weak = self.self_weak.clone();
            self.handle.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    fn force_close_in_loop(&self) {
        self.handle.assert_in_loop_thread();
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            self.handle_close();
        }
    }

    // ── Read flow control ────────────────────────────────────────────

    pub fn start_read(&self) {
        let conn = self.shared();
        self.handle.run_in_loop(move || conn.start_read_in_loop());
    }

    fn start_read_in_loop(&self) {
        self.handle.assert_in_loop_thread();
        if !self.reading.load(Ordering::Acquire) || !self.channel.is_reading() {
            self.channel.enable_reading();
            self.reading.store(true, Ordering::Release);
        }
    }

    /// Stop reading from the socket, letting the kernel receive buffer
    /// (and eventually the peer) absorb the backpressure.
    pub fn stop_read(&self) {
        let conn = self.shared();
        self.handle.run_in_loop(move || conn.stop_read_in_loop());
    }

    fn stop_read_in_loop(&self) {
        self.handle.assert_in_loop_thread();
        if self.reading.load(Ordering::Acquire) || self.channel.is_reading() {
            self.channel.disable_reading();
            self.reading.store(false, Ordering::Release);
        }
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    // ── Lifecycle (owner-driven) ─────────────────────────────────────

    /// Complete establishment on the loop thread: tie the channel, enable
    /// reading, and report the connection up.
    pub(crate) fn connect_established(&self) {
        self.handle.assert_in_loop_thread();
        debug_assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);
        let owner: Weak<dyn Any + Send + Sync> = self.self_weak.clone();
        self.channel.tie(owner);
        self.channel.enable_reading();
        CONNECTIONS_ACTIVE.increment();

        let guard = self.shared();
        let cb = self.callbacks.lock().unwrap().connection.clone();
        cb(&guard);
    }

    /// Final teardown, run on the loop thread after the owner has dropped
    /// its reference. Safe to call whether or not the close path already
    /// ran.
    pub(crate) fn connect_destroyed(&self) {
        self.handle.assert_in_loop_thread();
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            CONNECTIONS_CLOSED.increment();
            CONNECTIONS_ACTIVE.decrement();
            let guard = self.shared();
            let cb = self.callbacks.lock().unwrap().connection.clone();
            cb(&guard);
        }
        self.channel.remove();
    }

    // ── Event handlers (loop thread only) ────────────────────────────

    fn handle_read(&self, receive_time: Instant) {
        self.handle.assert_in_loop_thread();
        let mut input = self.input.lock().unwrap();
        match input.read_fd(self.channel.fd()) {
            Ok(0) => {
                // Peer closed its write side.
                drop(input);
                self.handle_close();
            }
            Ok(n) => {
                BYTES_RECEIVED.add(n as u64);
                let cb = self.callbacks.lock().unwrap().message.clone();
                let conn = self.shared();
                cb(&conn, &mut input, receive_time);
            }
            Err(e) if is_transient(&e) => {}
            Err(e) => {
                error!("TcpConnection::handle_read [{}]: {}", self.name, e);
                drop(input);
                self.handle_error();
                self.handle_close();
            }
        }
    }

    fn handle_write(&self) {
        self.handle.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!("[{}] is down, no more writing", self.name);
            return;
        }
        let mut output = self.output.lock().unwrap();
        match sockets::write(self.channel.fd(), output.peek()) {
            Ok(n) => {
                BYTES_SENT.add(n as u64);
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    if let Some(cb) = self.callbacks.lock().unwrap().write_complete.clone() {
                        let conn = self.shared();
                        self.handle.queue_in_loop(move || cb(&conn));
                    }
                    if self.state() == State::Disconnecting {
                        drop(output);
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) if is_transient(&e) => {}
            Err(e) => {
                error!("TcpConnection::handle_write [{}]: {}", self.name, e);
            }
        }
    }

    /// Runs the close sequence exactly once: stops all interest, reports
    /// the connection down, then hands itself back to its owner for
    /// unregistration.
    fn handle_close(&self) {
        self.handle.assert_in_loop_thread();
        let state = self.state();
        trace!("fd={} state={:?}", self.channel.fd(), state);
        debug_assert!(state == State::Connected || state == State::Disconnecting);
        self.set_state(State::Disconnected);
        self.channel.disable_all();
        CONNECTIONS_CLOSED.increment();
        CONNECTIONS_ACTIVE.decrement();

        // Keep self alive for the rest of the sequence even if the owner's
        // close callback drops the last external reference.
        let guard = self.shared();
        let (connection_cb, close_cb) = {
            let mut cbs = self.callbacks.lock().unwrap();
            (cbs.connection.clone(), cbs.close.take())
        };
        connection_cb(&guard);
        // Must run last: detaches the connection from its owner's map.
        if let Some(cb) = close_cb {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        let err = sockets::socket_error(self.channel.fd());
        error!(
            "TcpConnection::handle_error [{}] SO_ERROR={} {}",
            self.name,
            err,
            std::io::Error::from_raw_os_error(err)
        );
    }

    // ── Internals ────────────────────────────────────────────────────

    fn shared(&self) -> TcpConnectionPtr {
        self.self_weak.upgrade().expect("connection destroyed")
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "TcpConnection::drop [{}] fd={} state={:?}",
            self.name,
            self.channel.fd(),
            self.state()
        );
    }
}

/// Errors that just mean "try again later" on a non-blocking socket.
fn is_transient(e: &std::io::Error) -> bool {
    match e.raw_os_error() {
        Some(errno) => {
            errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EINTR
        }
        None => false,
    }
}
