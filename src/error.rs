//! Error types for tabletdb.

use std::io;
use thiserror::Error;

/// Result type alias for tabletdb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for tablet and log operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error from file operations.
    #[error("I/O error: {0}")]
    Io(String),

    /// Data corruption detected.
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Operation not valid in the current state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Row or resource already exists.
    #[error("Already present: {0}")]
    AlreadyPresent(String),

    /// Generic runtime failure recorded against a single row.
    #[error("Runtime error: {0}")]
    RuntimeError(String),

    /// Caller passed an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// CRC checksum mismatch.
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// Incomplete record at the tail of a log segment.
    #[error("Incomplete log record")]
    IncompleteRecord,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Create a corruption error with the given message.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Error::Corruption(msg.into())
    }

    /// Create an illegal state error.
    pub fn illegal_state<S: Into<String>>(msg: S) -> Self {
        Error::IllegalState(msg.into())
    }

    /// Create a not-found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an already-present error.
    pub fn already_present<S: Into<String>>(msg: S) -> Self {
        Error::AlreadyPresent(msg.into())
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Prepend context to this error's message, keeping its kind.
    pub fn prepend<S: AsRef<str>>(self, msg: S) -> Self {
        let msg = msg.as_ref();
        match self {
            Error::Io(m) => Error::Io(format!("{}: {}", msg, m)),
            Error::Corruption(m) => Error::Corruption(format!("{}: {}", msg, m)),
            Error::IllegalState(m) => Error::IllegalState(format!("{}: {}", msg, m)),
            Error::NotFound(m) => Error::NotFound(format!("{}: {}", msg, m)),
            Error::AlreadyPresent(m) => Error::AlreadyPresent(format!("{}: {}", msg, m)),
            Error::RuntimeError(m) => Error::RuntimeError(format!("{}: {}", msg, m)),
            Error::InvalidArgument(m) => Error::InvalidArgument(format!("{}: {}", msg, m)),
            other => Error::Corruption(format!("{}: {}", msg, other)),
        }
    }

    /// Check if this error indicates corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corruption(_) | Error::CrcMismatch { .. } | Error::IncompleteRecord
        )
    }

    /// Check if this error indicates a missing resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check if this error indicates a duplicate row.
    pub fn is_already_present(&self) -> bool {
        matches!(self, Error::AlreadyPresent(_))
    }
}
