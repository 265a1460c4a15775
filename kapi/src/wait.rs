//! Arguments for waiting on many handles at once.
use serde::{Deserialize, Serialize};

use crate::{HandleValue, Signals};

/// The largest number of items `object_wait_many` accepts.
pub const MAX_WAIT_MANY: usize = 64;

/// One handle in a multi-object wait.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitItem {
    /// Handle to wait on.
    pub handle: HandleValue,
    /// Signals that satisfy the wait.
    pub wait_for: Signals,
    /// Set by the kernel to the signals observed on this handle when the wait ends.
    pub pending: Signals,
}

impl WaitItem {
    /// Create a wait item with no pending signals.
    pub fn new(handle: HandleValue, wait_for: Signals) -> Self {
        Self {
            handle,
            wait_for,
            pending: Signals::empty(),
        }
    }
}
