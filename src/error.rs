//! Error types for Conduit.

use thiserror::Error;

/// Result type alias using Conduit's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Conduit operations.
///
/// The variants correspond one-to-one with the status codes exposed by the
/// C-surface API (see [`Error::code`]).
#[derive(Error, Debug)]
pub enum Error {
    /// Structurally invalid input: bad magic, unsupported version,
    /// out-of-range length or sequence.
    #[error("invalid input: {0}")]
    Invalid(&'static str),

    /// A destination buffer was too small for the requested operation.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    NoMem {
        /// Bytes the operation required.
        needed: usize,
        /// Bytes the caller provided.
        available: usize,
    },

    /// A timed acquisition or deadline expired.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// Header or payload integrity check failed.
    #[error("integrity check failed: {0}")]
    Crc(&'static str),

    /// A bounded resource is full: send window, service queue.
    #[error("capacity exhausted: {0}")]
    Overflow(&'static str),

    /// An OS primitive failed (via rustix).
    #[error("platform error: {0}")]
    Platform(#[from] rustix::io::Errno),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Status code as reported across the C surface.
    pub fn code(&self) -> i32 {
        match self {
            Error::Invalid(_) => -1,
            Error::NoMem { .. } => -2,
            Error::Timeout(_) => -3,
            Error::Crc(_) => -4,
            Error::Overflow(_) => -5,
            Error::Platform(_) | Error::Io(_) => -6,
        }
    }
}
