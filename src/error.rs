use std::io;

use thiserror::Error;

/// Errors returned by eventline setup and launch paths.
///
/// Runtime I/O conditions (would-block, peer resets, connect races) never
/// surface here; they are classified and handled inside the loop. This type
/// covers the operations that can legitimately fail before a loop is
/// running: fd creation, bind/listen, thread spawn, configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying syscall failed (socket/bind/listen/epoll/timerfd/eventfd).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Event loop construction failed (e.g., second loop on one thread).
    #[error("event loop setup: {0}")]
    LoopSetup(String),
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}
