//! Error types shared by every port operation.

use std::io;

use thiserror::Error;

use crate::device::ERROR_OPERATION_ABORTED;

/// Errors reported by [`SerialPort`](crate::SerialPort) operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An offset, count or buffer was rejected before anything reached the device.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The port was in the wrong state for the request, e.g. I/O on a closed
    /// port or reconfiguring an open one.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The operating system failed the request.
    #[error("device error {code}: {message}")]
    Device {
        /// The native error code.
        code: u32,
        /// Human readable description of `code`.
        message: String,
    },

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Returns `true` for [`Error::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// The native error code carried by a device error, if any.
    pub fn native_code(&self) -> Option<u32> {
        match *self {
            Error::Device { code, .. } => Some(code),
            Error::Cancelled => Some(ERROR_OPERATION_ABORTED),
            _ => None,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::InvalidArgument(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
            Error::InvalidState(_) => io::Error::new(io::ErrorKind::NotConnected, err),
            Error::Cancelled => io::Error::new(io::ErrorKind::Interrupted, err),
            Error::Device { code, .. } => match i32::try_from(code) {
                Ok(code) => io::Error::from_raw_os_error(code),
                Err(_) => io::Error::other(err),
            },
        }
    }
}

/// Result type for port operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result of an operation that takes ownership of a buffer.
///
/// The buffer is always handed back, whatever the outcome.
pub type BufResult<T, B> = (Result<T>, B);
