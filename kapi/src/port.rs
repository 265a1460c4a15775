//! Packets delivered through ports.
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::Signals;

bitflags! {
    /// Options for `object_wait_async`.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct WaitAsyncOptions: u32 {
        /// Only deliver a packet on a transition into the trigger set, never for signals that
        /// are already asserted when the wait is registered.
        const EDGE = 1 << 0;
    }
}

/// Payload of a packet produced by a signal observer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalPacket {
    /// Signals the observer was registered for.
    pub trigger: Signals,
    /// Signals asserted on the object when the packet was produced.
    pub observed: Signals,
    /// Object specific count (pending messages for channels), at least 1.
    pub count: u64,
}

/// What a packet carries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketKind {
    /// Produced by a one-shot asynchronous wait.
    Signal(SignalPacket),
    /// Queued directly by user space.
    User([u64; 4]),
}

/// A packet read from a port.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPacket {
    /// The key supplied when the wait was registered or the packet queued.
    pub key: u64,
    /// Contents of the packet.
    pub kind: PacketKind,
}

impl PortPacket {
    /// Create a user packet.
    pub fn user(key: u64, payload: [u64; 4]) -> Self {
        Self {
            key,
            kind: PacketKind::User(payload),
        }
    }

    /// The signal payload, if this packet came from a signal observer.
    pub fn signal(&self) -> Option<&SignalPacket> {
        match &self.kind {
            PacketKind::Signal(s) => Some(s),
            PacketKind::User(_) => None,
        }
    }
}
