//! A non-blocking TCP networking core built on the reactor pattern: one
//! event loop per thread, readiness dispatch over epoll, timers over a
//! timerfd, and callback-driven connections with buffered, backpressured
//! I/O. Linux only.
//!
//! The loop that accepts connections (the base loop) can hand each new
//! connection to a pool of I/O loops; every connection then lives its
//! whole life on a single loop thread, so user callbacks never race per
//! connection.
//!
//! # Echo server
//!
//! ```no_run
//! use eventline::{EventLoop, ServerConfig, TcpServer};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), eventline::Error> {
//!     let mut event_loop = EventLoop::new()?;
//!     let server = TcpServer::new(
//!         event_loop.handle(),
//!         "127.0.0.1:7000".parse().unwrap(),
//!         "echo",
//!         ServerConfig::default(),
//!     )?;
//!     server.set_message_callback(Arc::new(|conn, buf, _when| {
//!         let data = buf.retrieve_all_as_vec();
//!         conn.send(&data);
//!     }));
//!     server.start()?;
//!     event_loop.run();
//!     Ok(())
//! }
//! ```

mod acceptor;
mod buffer;
mod channel;
mod config;
mod connection;
mod connector;
mod error;
mod event_loop;
mod event_loop_thread;
pub mod metrics;
mod poller;
mod socket;
mod sockets;
mod tcp_client;
mod tcp_server;
mod timer_queue;

pub use buffer::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};
pub use config::ServerConfig;
pub use connection::{
    default_connection_callback, default_message_callback, ConnectionCallback,
    HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback,
};
pub use connector::{Connector, NewConnectionCallback};
pub use error::Error;
pub use event_loop::{EventLoop, LoopHandle};
pub use event_loop_thread::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use tcp_client::TcpClient;
pub use tcp_server::TcpServer;
pub use timer_queue::TimerId;
