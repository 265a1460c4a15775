//! API definitions shared between the kernel IPC core and its clients.
//!
//! Everything in here is plain data: signal and rights masks, status codes, object identities,
//! deadlines and the packet formats delivered through ports.
#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

pub mod object;
pub mod port;
pub mod rights;
pub mod signals;
pub mod status;
pub mod time;
pub mod wait;

pub use object::{Koid, ObjectInfo, ObjectType, INVALID_KOID};
pub use rights::Rights;
pub use signals::Signals;
pub use status::ErrorCode;
pub use time::Deadline;

/// A process-relative reference to a kernel object.
///
/// Values are never reused within a process. Zero never refers to an object.
pub type HandleValue = u32;

/// The handle value that never refers to an object.
pub const INVALID_HANDLE: HandleValue = 0;
