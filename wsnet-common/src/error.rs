//! Error types for the workspace network daemon

use thiserror::Error;

/// Main error type for daemon operations
#[derive(Error, Debug)]
pub enum NetError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Joining the overlay network failed
    #[error("Network join failed: {0}")]
    Join(String),

    /// Relay service of the control plane could not be reached
    #[error("Relay unreachable at {url}: {reason}")]
    RelayUnreachable { url: String, reason: String },

    /// A mandatory forwarding header was absent
    #[error("missing metadata: {0}")]
    MissingMetadata(&'static str),

    /// Dialing a backend failed
    #[error("Dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// No online control-plane peer was discovered
    #[error("no active runner found")]
    NoRunner,

    /// HTTP exchange failed
    #[error("HTTP error: {0}")]
    Http(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Connection pool has no idle connection to hand out
    #[error("connection pool exhausted")]
    PoolExhausted,
}

impl NetError {
    /// Whether this error only signals that a listener or server was already closed.
    pub fn is_closed(&self) -> bool {
        match self {
            NetError::Io(e) | NetError::Dial { source: e, .. } => matches!(
                e.kind(),
                std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, NetError>;
