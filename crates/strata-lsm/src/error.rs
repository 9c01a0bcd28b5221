use std::{io::Error as IoError, result::Result as StdResult};
use std::fmt::{Display, Formatter, Result as FmtResult};

use thiserror::Error;


pub type Result<T> = StdResult<T, Error>;


/// The closed error taxonomy of the engine.
///
/// Collaborator I/O errors are surfaced unchanged as [`ErrorKind::IoError`]; corruption of
/// persistent state (a manifest record, a table footer) is fatal to the current open but
/// leaves the damaged file in place for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// A key or file was not found; recoverable.
    NotFound,
    /// Persistent state failed to decode or checksum. Fatal to the current open.
    Corruption,
    /// An environment-level failure, usually propagated from the filesystem.
    IoError,
    /// A caller-supplied value was rejected, such as a comparator mismatch on recovery.
    InvalidArgument,
    /// A background error or explicit shutdown interrupted the operation.
    ShutdownInProgress,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(match self {
            Self::NotFound           => "NotFound",
            Self::Corruption         => "Corruption",
            Self::IoError            => "IO error",
            Self::InvalidArgument    => "Invalid argument",
            Self::ShutdownInProgress => "Shutdown in progress",
        })
    }
}

#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct Error {
    kind:    ErrorKind,
    message: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    #[must_use]
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Corruption, message)
    }

    #[must_use]
    pub fn io_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IoError, message)
    }

    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    #[must_use]
    pub fn shutdown_in_progress(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ShutdownInProgress, message)
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether a failed background task may be rescheduled. Corruption is never retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::IoError | ErrorKind::NotFound)
    }
}

impl From<IoError> for Error {
    fn from(io_err: IoError) -> Self {
        if io_err.kind() == std::io::ErrorKind::NotFound {
            Self::not_found(io_err.to_string())
        } else {
            Self::io_error(io_err.to_string())
        }
    }
}
