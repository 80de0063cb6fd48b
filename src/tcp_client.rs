//! Connect-side orchestration.
//!
//! A [`TcpClient`] drives one connection to one server through a
//! [`Connector`], optionally reconnecting (with the connector's backoff
//! reset) when an established connection drops.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info};

use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::connector::Connector;
use crate::event_loop::LoopHandle;
use crate::sockets;

struct ClientCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
}

pub struct TcpClient {
    self_weak: Weak<TcpClient>,
    handle: LoopHandle,
    connector: Arc<Connector>,
    name: String,
    callbacks: Mutex<ClientCallbacks>,
    /// Reconnect automatically when an established connection drops.
    retry: AtomicBool,
    /// Whether the user currently wants a connection.
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    connection: Mutex<Option<TcpConnectionPtr>>,
}

impl TcpClient {
    pub fn new(handle: &LoopHandle, server_addr: SocketAddr, name: &str) -> Arc<TcpClient> {
        let client = Arc::new_cyclic(|weak| TcpClient {
            self_weak: weak.clone(),
            handle: handle.clone(),
            connector: Connector::new(handle.clone(), server_addr),
            name: name.to_string(),
            callbacks: Mutex::new(ClientCallbacks {
                connection: None,
                message: None,
                write_complete: None,
            }),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: AtomicU64::new(1),
            connection: Mutex::new(None),
        });
        let weak = Arc::downgrade(&client);
        client
            .connector
            .set_new_connection_callback(Box::new(move |fd| match weak.upgrade() {
                Some(client) => client.new_connection(fd),
                None => sockets::close(fd),
            }));
        debug!("TcpClient::new [{}]", client.name);
        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// The current connection, if established.
    pub fn connection(&self) -> Option<TcpConnectionPtr> {
        self.connection.lock().unwrap().clone()
    }

    pub fn retry_enabled(&self) -> bool {
        self.retry.load(Ordering::Acquire)
    }

    /// Reconnect after an established connection drops.
    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::Release);
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

    /// Begin connecting. Callable from any thread.
    pub fn connect(&self) {
        info!(
            "TcpClient::connect [{}] - connecting to {}",
            self.name,
            self.connector.server_addr()
        );
        self.connect.store(true, Ordering::Release);
        self.connector.start();
    }

    /// Gracefully close the current connection (half-close after the
    /// output drains) and stop reconnecting.
    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::Release);
        if let Some(conn) = self.connection.lock().unwrap().as_ref() {
            conn.shutdown();
        }
    }

    /// Abort the in-flight connect attempt and stop reconnecting.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        self.connector.stop();
    }

    fn new_connection(&self, sockfd: RawFd) {
        self.handle.assert_in_loop_thread();
        let peer_addr = sockets::peer_addr(sockfd)
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let local_addr = sockets::local_addr(sockfd)
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, id);

        let conn = TcpConnection::new(
            self.handle.clone(),
            conn_name,
            sockfd,
            local_addr,
            peer_addr,
        );
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
        conn.set_close_callback(Box::new(move |conn| match weak.upgrade() {
            Some(client) => client.remove_connection(conn),
            None => detach_and_destroy(conn),
        }));
        *self.connection.lock().unwrap() = Some(conn.clone());
        conn.connect_established();
    }

    fn remove_connection(&self, conn: &TcpConnectionPtr) {
        self.handle.assert_in_loop_thread();
        {
            let mut slot = self.connection.lock().unwrap();
            debug_assert!(slot
                .as_ref()
                .map(|c| Arc::ptr_eq(c, conn))
                .unwrap_or(false));
            *slot = None;
        }
        let conn_clone = conn.clone();
        self.handle
            .queue_in_loop(move || conn_clone.connect_destroyed());

        if self.retry.load(Ordering::Acquire) && self.connect.load(Ordering::Acquire) {
            info!(
                "TcpClient::connect [{}] - reconnecting to {}",
                self.name,
                self.connector.server_addr()
            );
            self.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        debug!("TcpClient::drop [{}]", self.name);
        self.connector.stop();
        let conn = self.connection.lock().unwrap().take();
        if let Some(conn) = conn {
            // The owner is going away: replace the close hook with plain
            // teardown and drop the link hard.
            conn.set_close_callback(Box::new(detach_and_destroy));
            conn.force_close();
        }
    }
}

/// Close path for a connection that has outlived its owner.
fn detach_and_destroy(conn: &TcpConnectionPtr) {
    let conn = conn.clone();
    let handle = conn.loop_handle().clone();
    handle.queue_in_loop(move || conn.connect_destroyed());
}
