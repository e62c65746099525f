//! Server error types.

use std::io;

use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error (socket, file, etc.).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A listener address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// `listen()` failed on a bound socket.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// No plain, secure or local listener was configured.
    #[error("no port to listen on")]
    NoListeners,

    /// The connection table cannot hold more than the reserved descriptors.
    #[error(
        "not enough descriptors: connection table holds {capacity} but {reserved} are reserved"
    )]
    InsufficientDescriptors { capacity: usize, reserved: usize },

    /// A live process already answers on the local socket path.
    #[error("Socket path already in use: {path}")]
    SocketInUse { path: String },

    /// A secure port was requested without a TLS acceptor.
    #[error("secure port {addr} requested but no TLS acceptor is configured")]
    TlsUnavailable { addr: String },

    /// Server is already running.
    #[error("Server is already running (PID file exists: {path})")]
    AlreadyRunning { path: String },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Work was submitted after shutdown began.
    #[error("Server shutdown requested")]
    Shutdown,
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a bind error.
    pub fn bind(addr: impl ToString, source: io::Error) -> Self {
        Self::Bind {
            addr: addr.to_string(),
            source,
        }
    }

    /// Creates a listen error.
    pub fn listen(addr: impl ToString, source: io::Error) -> Self {
        Self::Listen {
            addr: addr.to_string(),
            source,
        }
    }

    /// Creates a socket in use error.
    pub fn socket_in_use(path: impl Into<String>) -> Self {
        Self::SocketInUse { path: path.into() }
    }

    /// Creates an already running error.
    pub fn already_running(path: impl Into<String>) -> Self {
        Self::AlreadyRunning { path: path.into() }
    }

    /// True for errors that must stop the process before the event loop runs.
    pub fn is_startup_fatal(&self) -> bool {
        !matches!(self, Self::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_names_address() {
        let err = ServerError::bind(
            "127.0.0.1:389",
            io::Error::from(io::ErrorKind::AddrInUse),
        );
        assert!(err.to_string().starts_with("failed to bind 127.0.0.1:389"));
        assert!(err.is_startup_fatal());
    }

    #[test]
    fn shutdown_is_not_startup_fatal() {
        assert!(!ServerError::Shutdown.is_startup_fatal());
        assert!(
            ServerError::InsufficientDescriptors {
                capacity: 10,
                reserved: 10
            }
            .is_startup_fatal()
        );
    }
}
