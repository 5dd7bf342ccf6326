/// Errors that can occur while encoding or decoding header messages.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// The key cannot be represented on the wire.
    #[error("invalid key {0:?} (must be non-empty and contain neither '=' nor newline)")]
    InvalidKey(String),

    /// A line has neither `=` nor a binary length header.
    #[error("invalid entry at {0:?}")]
    InvalidEntry(String),

    /// Input ended before the 8-byte length of a binary entry.
    #[error("expected length of binary entry {key:?}, reached end of input")]
    MissingLength { key: String },

    /// Input ended before the declared number of value bytes.
    #[error("expected {expected}-byte value for {key:?}, got {got}")]
    Truncated {
        key: String,
        expected: u64,
        got: usize,
    },

    /// A binary value exceeds the configured maximum.
    #[error("value for {key:?} too large ({size} bytes, max {max})")]
    ValueTooLarge { key: String, size: u64, max: usize },

    /// A value was expected to be a decimal integer.
    #[error("invalid integer for {key:?}: {value:?}")]
    InvalidInt { key: String, value: String },

    /// A key or value was expected to be UTF-8.
    #[error("invalid utf-8 in {0:?}")]
    InvalidUtf8(String),

    /// An I/O error occurred while reading a message from a stream.
    #[error("message I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DataError>;
