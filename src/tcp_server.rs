//! Accept-side orchestration.
//!
//! A [`TcpServer`] owns the acceptor, the I/O loop pool, and the map of
//! live connections. Each accepted connection is wrapped, assigned to a
//! pool loop round-robin, and tracked by name until its close callback
//! hands it back for removal. The connection map is only mutated on the
//! base loop's thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::info;

use crate::acceptor::Acceptor;
use crate::config::ServerConfig;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::event_loop_thread::{EventLoopThreadPool, ThreadInitCallback};
use crate::sockets;

struct ServerCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    thread_init: Option<ThreadInitCallback>,
}

pub struct TcpServer {
    self_weak: Weak<TcpServer>,
    handle: LoopHandle,
    name: String,
    ip_port: String,
    config: ServerConfig,
    /// `None` only once `Drop` has handed the last reference to the base
    /// loop for teardown.
    acceptor: Option<Arc<Acceptor>>,
    pool: EventLoopThreadPool,
    /// Live connections by name. Sole strong owner outside the loops'
    /// transient callback frames.
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
    callbacks: Mutex<ServerCallbacks>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
}

impl TcpServer {
    /// Create a server listening at `listen_addr` once started. Binds
    /// immediately, so address conflicts surface here.
    pub fn new(
        handle: &LoopHandle,
        listen_addr: SocketAddr,
        name: &str,
        config: ServerConfig,
    ) -> Result<Arc<TcpServer>, Error> {
        config.validate()?;
        let acceptor = Acceptor::new(handle.clone(), &listen_addr, config.reuse_port)?;
        let server = Arc::new_cyclic(|weak| TcpServer {
            self_weak: weak.clone(),
            handle: handle.clone(),
            name: name.to_string(),
            ip_port: listen_addr.to_string(),
            config,
            acceptor: Some(acceptor),
            pool: EventLoopThreadPool::new(handle.clone(), name),
            connections: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(ServerCallbacks {
                connection: None,
                message: None,
                write_complete: None,
                thread_init: None,
            }),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&server);
        server
            .acceptor()
            .set_new_connection_callback(Box::new(move |fd, peer_addr| {
                match weak.upgrade() {
                    Some(server) => server.new_connection(fd, peer_addr),
                    None => sockets::close(fd),
                }
            }));
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// The actual listening address, useful when bound to port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.acceptor().local_addr()?)
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().write_complete = Some(cb);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        self.callbacks.lock().unwrap().thread_init = Some(cb);
    }

    /// Spin up the I/O pool and start listening. Idempotent; callable from
    /// any thread.
    pub fn start(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let thread_init = self.callbacks.lock().unwrap().thread_init.clone();
        self.pool.start(self.config.io_threads, thread_init)?;

        let server = self.shared();
        self.handle.run_in_loop(move || {
            debug_assert!(!server.acceptor().listening());
            server.acceptor().listen(server.config.backlog);
        });
        Ok(())
    }

    fn new_connection(&self, sockfd: RawFd, peer_addr: SocketAddr) {
        self.handle.assert_in_loop_thread();
        let io_handle = self.pool.next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);
        info!(
            "TcpServer::new_connection [{}] - connection [{}] from {}",
            self.name, conn_name, peer_addr
        );
        let local_addr = sockets::local_addr(sockfd)
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));

        let conn = TcpConnection::new(io_handle.clone(), conn_name.clone(), sockfd, local_addr, peer_addr);
        if self.config.tcp_nodelay {
            conn.set_tcp_nodelay(true);
        }
        {
            let cbs = self.callbacks.lock().unwrap();
            if let Some(cb) = cbs.connection.clone() {
                conn.set_connection_callback(cb);
            }
            if let Some(cb) = cbs.message.clone() {
                conn.set_message_callback(cb);
            }
            if let Some(cb) = cbs.write_complete.clone() {
                conn.set_write_complete_callback(cb);
            }
        }
        let weak = self.self_weak.clone();
        conn.set_close_callback(Box::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));
        self.connections.lock().unwrap().insert(conn_name, conn.clone());

        io_handle.run_in_loop(move || conn.connect_established());
    }

    /// Runs on the connection's loop; marshals the map update back to the
    /// base loop.
    fn remove_connection(&self, conn: &TcpConnectionPtr) {
        let server = self.shared();
        let conn = conn.clone();
        self.handle
            .run_in_loop(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionPtr) {
        self.handle.assert_in_loop_thread();
        info!(
            "TcpServer::remove_connection [{}] - connection {}",
            self.name,
            conn.name()
        );
        self.connections.lock().unwrap().remove(conn.name());
        let io_handle = conn.loop_handle().clone();
        let conn = conn.clone();
        // Deferred so the channel outlives the dispatch frame that
        // triggered the close.
        io_handle.queue_in_loop(move || conn.connect_destroyed());
    }

    fn acceptor(&self) -> &Arc<Acceptor> {
        self.acceptor.as_ref().expect("acceptor already detached")
    }

    fn shared(&self) -> Arc<TcpServer> {
        self.self_weak.upgrade().expect("server destroyed")
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        info!("TcpServer::drop [{}]", self.name);
        for (_, conn) in self.connections.lock().unwrap().drain() {
            let io_handle = conn.loop_handle().clone();
            io_handle.run_in_loop(move || conn.connect_destroyed());
        }
        // The acceptor's channel must be unregistered on the base loop.
        // Move the field's reference into the task so the last one is
        // guaranteed to die on that thread.
        if let Some(acceptor) = self.acceptor.take() {
            self.handle.run_in_loop(move || drop(acceptor));
        }
    }
}
