//! Handle rights.
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Operations a handle permits on the object it refers to.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Rights: u32 {
        /// The handle may be duplicated.
        const DUPLICATE = 1 << 0;
        /// The handle may be sent through a channel.
        const TRANSFER = 1 << 1;
        /// Data may be read from the object.
        const READ = 1 << 2;
        /// Data may be written to the object.
        const WRITE = 1 << 3;
        /// User signals may be asserted on the object.
        const SIGNAL = 1 << 12;
        /// User signals may be asserted on the object's peer.
        const SIGNAL_PEER = 1 << 13;
        /// The object's signals may be waited on.
        const WAIT = 1 << 14;
        /// Information about the object may be queried.
        const INSPECT = 1 << 15;
        /// Keep the rights of the source handle.
        const SAME_RIGHTS = 1 << 31;

        /// Rights most objects start with.
        const BASIC = Self::TRANSFER.bits()
            | Self::DUPLICATE.bits()
            | Self::WAIT.bits()
            | Self::INSPECT.bits();
        /// Both IO rights.
        const IO = Self::READ.bits() | Self::WRITE.bits();

        /// Rights of a new channel endpoint. Channels cannot be duplicated.
        const CHANNEL_DEFAULT = (Self::BASIC.bits() & !Self::DUPLICATE.bits())
            | Self::IO.bits()
            | Self::SIGNAL.bits()
            | Self::SIGNAL_PEER.bits();
        /// Rights of a new event.
        const EVENT_DEFAULT = Self::BASIC.bits() | Self::SIGNAL.bits();
        /// Rights of a new port.
        const PORT_DEFAULT = Self::BASIC.bits() | Self::IO.bits();
    }
}
