//! Object signals.
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// A set of named boolean conditions about the current state of an object.
    ///
    /// Bits 0..=21 are object specific, bits 24..=31 are free for user space to assert with
    /// `object_signal`.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Signals: u32 {
        /// The object has data available to read.
        const READABLE = 1 << 0;
        /// The object can accept a write.
        const WRITABLE = 1 << 1;
        /// The other side of a peered object has been destroyed. Never clears once set.
        const PEER_CLOSED = 1 << 2;
        /// An event has been signaled.
        const SIGNALED = 1 << 3;
        /// Exactly one handle refers to the object.
        const LAST_HANDLE = 1 << 22;
        /// The handle being waited on was closed while the wait was pending.
        ///
        /// This is only ever reported to waiters and is never part of an object's state.
        const HANDLE_CLOSED = 1 << 23;

        /// User signal 0
        const USER_0 = 1 << 24;
        /// User signal 1
        const USER_1 = 1 << 25;
        /// User signal 2
        const USER_2 = 1 << 26;
        /// User signal 3
        const USER_3 = 1 << 27;
        /// User signal 4
        const USER_4 = 1 << 28;
        /// User signal 5
        const USER_5 = 1 << 29;
        /// User signal 6
        const USER_6 = 1 << 30;
        /// User signal 7
        const USER_7 = 1 << 31;

        /// All user signals.
        const USER_SIGNALS = Self::USER_0.bits()
            | Self::USER_1.bits()
            | Self::USER_2.bits()
            | Self::USER_3.bits()
            | Self::USER_4.bits()
            | Self::USER_5.bits()
            | Self::USER_6.bits()
            | Self::USER_7.bits();
    }
}

impl Signals {
    /// Returns true if every bit in this set may be asserted by user space on an object that
    /// additionally allows `extra`.
    pub fn is_user_settable(&self, extra: Signals) -> bool {
        (Signals::USER_SIGNALS | extra).contains(*self)
    }
}
