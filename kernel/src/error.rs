//! Kernel-wide error type.

use kapi::{ErrorCode, HandleValue};
use snafu::Snafu;

/// Errors that can happen in the kernel.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The operation cannot complete right now, but might if retried after waiting.
    #[snafu(display("operation should wait"))]
    ShouldWait,

    /// The peer of a peered object has been destroyed.
    #[snafu(display("peer closed"))]
    PeerClosed,

    /// A wait was canceled on request.
    #[snafu(display("wait canceled"))]
    Canceled,

    /// The handle a wait was made through got closed before the wait finished.
    #[snafu(display("handle closed during wait"))]
    HandleClosed,

    /// The deadline passed first.
    #[snafu(display("timed out"))]
    TimedOut,

    #[snafu(display("invalid arguments: {reason}"))]
    InvalidArgs { reason: String },

    #[snafu(display("handle {handle} does not exist"))]
    BadHandle { handle: HandleValue },

    #[snafu(display("handle refers to an object of the wrong type"))]
    WrongType,

    #[snafu(display("handle is missing a required right"))]
    AccessDenied,

    #[snafu(display("argument out of range"))]
    OutOfRange,

    #[snafu(display("operation not supported"))]
    NotSupported,

    #[snafu(display("not found"))]
    NotFound,

    /// The object is in a state that does not permit the operation (torn down, value mismatch...)
    #[snafu(display("bad state"))]
    BadState,

    /// The next message does not fit in the buffers the reader provided.
    #[snafu(display("buffer too small, message has {bytes} bytes and {handles} handles"))]
    BufferTooSmall { bytes: usize, handles: usize },

    #[snafu(display("out of memory"))]
    NoMemory,

    /// The kernel configuration could not be loaded.
    #[snafu(display("invalid configuration: {reason}"))]
    Config { reason: String },
}

impl Error {
    /// The code reported to user space for this error.
    pub fn as_code(&self) -> ErrorCode {
        match self {
            Error::ShouldWait => ErrorCode::ShouldWait,
            Error::PeerClosed => ErrorCode::PeerClosed,
            // a closed handle is reported as a cancellation, with HANDLE_CLOSED in the observed signals
            Error::Canceled | Error::HandleClosed => ErrorCode::Canceled,
            Error::TimedOut => ErrorCode::TimedOut,
            Error::InvalidArgs { .. } | Error::Config { .. } => ErrorCode::InvalidArgs,
            Error::BadHandle { .. } => ErrorCode::BadHandle,
            Error::WrongType => ErrorCode::WrongType,
            Error::AccessDenied => ErrorCode::AccessDenied,
            Error::OutOfRange => ErrorCode::OutOfRange,
            Error::NotSupported => ErrorCode::NotSupported,
            Error::NotFound => ErrorCode::NotFound,
            Error::BadState => ErrorCode::BadState,
            Error::BufferTooSmall { .. } => ErrorCode::BufferTooSmall,
            Error::NoMemory => ErrorCode::NoMemory,
        }
    }
}

impl From<Error> for ErrorCode {
    fn from(value: Error) -> Self {
        value.as_code()
    }
}
