use beam_data::DataError;
use beam_transport::TransportError;

/// Errors raised by the identifier allocator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// A proposed identifier is not the next one in sequence.
    #[error("invalid stream id {got}: expected {expected}")]
    Unexpected { got: u32, expected: u32 },

    /// The 32-bit identifier space is exhausted.
    #[error("stream id space exhausted")]
    Overflow,
}

/// Errors that can occur in session and stream operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Header encoding or decoding error.
    #[error("header error: {0}")]
    Data(#[from] DataError),

    /// Identifier allocation error.
    #[error("{0}")]
    Id(#[from] IdError),

    /// The stream was already sent, or is being sent.
    #[error("stream already registered")]
    AlreadyRegistered,

    /// An identifier is already mapped to a stream in this session.
    #[error("duplicate stream id {0}")]
    DuplicateId(u32),

    /// Headers can't change once the stream has been sent.
    #[error("stream headers are locked after send")]
    HeaderLocked,

    /// The parent stream has not been registered yet.
    #[error("parent stream is not registered")]
    ParentNotRegistered,

    /// The stream was created by a different session.
    #[error("stream belongs to another session")]
    ForeignStream,

    /// The stream has no local endpoint to operate on.
    #[error("stream has no local endpoint")]
    NoEndpoint,

    /// A worker thread could not be started.
    #[error("failed to spawn thread: {0}")]
    Spawn(std::io::Error),

    /// The session was closed, locally or by the peer.
    #[error("session closed")]
    Closed,

    /// The connection failed; every later call sees the same error.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl SessionError {
    /// Whether this error marks an orderly end of the session.
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionError::Closed)
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
