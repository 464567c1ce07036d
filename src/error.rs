//! Error kinds surfaced by every layer of the storage stack.
//!
//! All failures are represented as a single [`Error`] enum rather than as
//! panics or process aborts; the only exceptions are invariant assertions
//! (bugs, not user error), which use `debug_assert!` and are compiled out of
//! release builds.

use std::fmt;
use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds described in the specification's error handling design.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A filesystem or `mmap`-family call failed.
    #[error("I/O error: {message}")]
    Io {
        /// Human readable description of the failing operation.
        message: String,
        /// The underlying OS error, if any.
        #[source]
        source: Option<io::Error>,
    },

    /// The allocator ran out of space and growth was disabled or refused.
    #[error("out of space: {0}")]
    OutOfSpace(String),

    /// On-disk invariants were violated (bad magic, bad block size, bad tree
    /// shape, freelist inconsistency, ...).
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A precondition on a public operation was violated by the caller.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// The requested operation is not valid in the current state.
    #[error("bad operation: {0}")]
    BadOperation(String),

    /// A cursor was used while invalid, deleted, or foreign to the
    /// container it was passed to.
    #[error("bad cursor: {0}")]
    BadCursor(String),

    /// The backend does not implement the requested primitive.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Wraps an [`io::Error`] together with a short description of the
    /// operation that failed.
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Builds an I/O error without an underlying OS cause.
    pub fn io_msg(message: impl fmt::Display) -> Self {
        Error::Io {
            message: message.to_string(),
            source: None,
        }
    }

    pub(crate) fn corruption(message: impl Into<String>) -> Self {
        Error::Corruption(message.into())
    }

    pub(crate) fn bad_argument(message: impl Into<String>) -> Self {
        Error::BadArgument(message.into())
    }

    pub(crate) fn bad_operation(message: impl Into<String>) -> Self {
        Error::BadOperation(message.into())
    }

    pub(crate) fn bad_cursor(message: impl Into<String>) -> Self {
        Error::BadCursor(message.into())
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        Error::Unsupported(message.into())
    }

    pub(crate) fn out_of_space(message: impl Into<String>) -> Self {
        Error::OutOfSpace(message.into())
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io {
            message: source.to_string(),
            source: Some(source),
        }
    }
}

/// Clones the salient information of an [`Error`] so it can be stashed away
/// and re-raised later (engine destructors cannot return errors, so the
/// first deferred error is captured and replayed on the next externally
/// initiated operation, per the error propagation policy).
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Io { message, source } => Error::Io {
                message: message.clone(),
                source: source
                    .as_ref()
                    .map(|e| io::Error::new(e.kind(), e.to_string())),
            },
            Error::OutOfSpace(m) => Error::OutOfSpace(m.clone()),
            Error::Corruption(m) => Error::Corruption(m.clone()),
            Error::BadArgument(m) => Error::BadArgument(m.clone()),
            Error::BadOperation(m) => Error::BadOperation(m.clone()),
            Error::BadCursor(m) => Error::BadCursor(m.clone()),
            Error::Unsupported(m) => Error::Unsupported(m.clone()),
        }
    }
}
