//! Kernel object identity and introspection.
use serde::{Deserialize, Serialize};

use crate::{Rights, Signals};

/// Kernel object id. Unique for the lifetime of the system and never reused.
pub type Koid = u64;

/// The koid that never refers to an object.
pub const INVALID_KOID: Koid = 0;

/// The kind of a kernel object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    /// One endpoint of a bidirectional message pipe.
    Channel,
    /// An object with only user-controlled signals.
    Event,
    /// A queue of packets produced by asynchronous waits and user submissions.
    Port,
}

/// A snapshot of an object as seen through one handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Id of the object.
    pub koid: Koid,
    /// Id of the peer for peered objects, [`INVALID_KOID`] otherwise.
    pub related_koid: Koid,
    /// Kind of the object.
    pub object_type: ObjectType,
    /// Rights of the handle the query was made through.
    pub rights: Rights,
    /// Number of live handles to the object.
    pub handle_count: usize,
    /// Signals asserted on the object at the time of the query.
    pub signals: Signals,
}
