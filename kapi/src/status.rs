//! Status codes reported by the kernel.
use bytemuck::Contiguous;
use serde::{Deserialize, Serialize};

/// Codes representing various kinds of failures.
#[repr(u16)]
#[non_exhaustive]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Contiguous, Serialize, Deserialize)]
pub enum ErrorCode {
    /// An internal kernel error occurred, check the system log for details.
    Internal = 1,
    /// The operation is not supported on this object or with these arguments.
    NotSupported,
    /// The system ran out of memory while performing the operation.
    NoMemory,
    /// An argument was malformed.
    InvalidArgs,
    /// The handle does not exist in the calling process.
    BadHandle,
    /// The handle refers to an object of the wrong type.
    WrongType,
    /// The handle lacks a right the operation needs.
    AccessDenied,
    /// An argument was outside the permitted range.
    OutOfRange,
    /// A buffer provided was too small for the pending message.
    BufferTooSmall,
    /// The object is not in a state that permits the operation.
    BadState,
    /// The deadline passed before the wait was satisfied.
    TimedOut,
    /// The operation cannot complete now but may later; retry or wait.
    ShouldWait,
    /// The wait was canceled, either explicitly or because the handle was closed.
    Canceled,
    /// The peer of the object was destroyed.
    PeerClosed,
    /// The resource referenced could not be found.
    NotFound,
}

impl ErrorCode {
    /// The raw value of this code as it crosses the system call boundary.
    pub fn into_raw(self) -> u16 {
        self.into_integer()
    }

    /// Decode a raw code, returning `None` if it is not a known code.
    pub fn from_raw(raw: u16) -> Option<ErrorCode> {
        ErrorCode::from_integer(raw)
    }
}
