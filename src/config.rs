//! Server configuration.

use crate::error::Error;

/// Configuration for a [`TcpServer`](crate::TcpServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of I/O worker loops. 0 means all connections run on the
    /// server's base loop (single-threaded mode).
    pub io_threads: usize,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Whether to set `SO_REUSEPORT` on the listening socket.
    pub reuse_port: bool,
    /// Whether to set `TCP_NODELAY` on accepted connections.
    pub tcp_nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            io_threads: 0,
            backlog: 1024,
            reuse_port: false,
            tcp_nodelay: true,
        }
    }
}

impl ServerConfig {
    /// Validate configuration values. Returns an error if any value is out
    /// of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.backlog <= 0 {
            return Err(Error::Config("backlog must be positive".into()));
        }
        if self.io_threads > 4096 {
            return Err(Error::Config("io_threads must be <= 4096".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_backlog() {
        let config = ServerConfig {
            backlog: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
