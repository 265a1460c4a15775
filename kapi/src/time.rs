//! Deadlines on the kernel monotonic clock.
use serde::{Deserialize, Serialize};

/// An absolute point on the monotonic clock, in nanoseconds since boot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Deadline(pub u64);

impl Deadline {
    /// A deadline that is always already in the past. Waits poll once.
    pub const IMMEDIATE: Deadline = Deadline(0);
    /// A deadline that never passes.
    pub const INFINITE: Deadline = Deadline(u64::MAX);

    /// Returns true if this deadline never passes.
    pub fn is_infinite(&self) -> bool {
        *self == Self::INFINITE
    }

    /// Nanoseconds since boot this deadline refers to.
    pub fn as_nanos(&self) -> u64 {
        self.0
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::INFINITE
    }
}
