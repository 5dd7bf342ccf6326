use std::path::PathBuf;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the connection.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// More descriptors were attached to a message than the connection allows.
    #[error("too many descriptors in one message ({count}, max {max})")]
    TooManyDescriptors { count: usize, max: usize },

    /// The inherited bootstrap descriptor is not an open socket.
    #[error("descriptor {0} is not an open socket")]
    NotASocket(i32),

    /// The inherited bootstrap descriptor was already claimed in this process.
    #[error("inherited descriptor {0} already claimed")]
    AlreadyClaimed(i32),

    /// The connection has been shut down by either end.
    #[error("transport shut down")]
    Shutdown,
}

impl TransportError {
    /// Whether this error marks an orderly end of the connection.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, TransportError::Shutdown)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
