//! Kernel objects and the handles that refer to them.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use derive_more::Display;
use kapi::{Koid, ObjectInfo, ObjectType, Rights, Signals, INVALID_KOID};
use snafu::ensure;

use crate::error::{AccessDeniedSnafu, Error, InvalidArgsSnafu, WrongTypeSnafu};

pub mod channel;
pub mod event;
pub mod on_signals;
pub mod port;
pub mod signals;
pub mod waiter;

use channel::ChannelDispatcher;
use event::EventDispatcher;
use port::PortDispatcher;
use signals::{ObserverId, Registration, SignalState};

/// Koids below this are reserved.
const FIRST_KOID: Koid = 1024;

static NEXT_KOID: AtomicU64 = AtomicU64::new(FIRST_KOID);

/// Allocate a new, never before used kernel object id.
pub fn next_koid() -> Koid {
    NEXT_KOID.fetch_add(1, Ordering::Relaxed)
}

/// The number of handles referring to an object.
#[derive(Default)]
pub struct HandleCount(spin::Mutex<usize>);

impl HandleCount {
    pub fn get(&self) -> usize {
        *self.0.lock()
    }
}

/// Behavior common to every kernel object.
pub trait Dispatcher: Send + Sync {
    fn koid(&self) -> Koid;

    /// Koid of the peer for peered objects.
    fn related_koid(&self) -> Koid {
        INVALID_KOID
    }

    fn object_type(&self) -> ObjectType;

    fn signal_state(&self) -> &SignalState;

    fn handle_count(&self) -> &HandleCount;

    /// Signals other than the user signals that `object_signal` may change.
    fn allowed_user_signals(&self) -> Signals {
        Signals::empty()
    }

    /// Register an observer on this object's signals.
    ///
    /// Objects that report a count to observers (like a channel's pending message count) override
    /// this to take their own lock, so the count agrees with the signals.
    fn add_observer(&self, registration: Registration) -> Result<(ObserverId, bool), Error> {
        self.signal_state().add_observer(registration, 1)
    }

    /// Change user signals on this object. Returns true if a thread was woken.
    fn user_signal(&self, clear: Signals, set: Signals) -> Result<bool, Error> {
        let allowed = self.allowed_user_signals();
        ensure!(
            clear.is_user_settable(allowed) && set.is_user_settable(allowed),
            InvalidArgsSnafu {
                reason: "signals may not be set by user space"
            }
        );
        Ok(self.signal_state().update_state(clear, set))
    }

    /// Called when the last handle to this object is dropped.
    ///
    /// Returns the handles the object was holding (such as those carried by undelivered
    /// messages). The caller releases them, so destroying nested objects never recurses.
    fn on_zero_handles(&self) -> Vec<Handle> {
        Vec::new()
    }
}

/// A reference to a kernel object of any type.
#[derive(Clone)]
pub enum KernelObjectRef {
    Channel(Arc<ChannelDispatcher>),
    Event(Arc<EventDispatcher>),
    Port(Arc<PortDispatcher>),
}

impl KernelObjectRef {
    /// The object as the operations every type shares.
    pub fn dispatcher(&self) -> &dyn Dispatcher {
        match self {
            KernelObjectRef::Channel(c) => c.as_ref(),
            KernelObjectRef::Event(e) => e.as_ref(),
            KernelObjectRef::Port(p) => p.as_ref(),
        }
    }

    pub fn as_channel(&self) -> Result<&Arc<ChannelDispatcher>, Error> {
        match self {
            KernelObjectRef::Channel(c) => Ok(c),
            _ => WrongTypeSnafu.fail(),
        }
    }

    pub fn as_event(&self) -> Result<&Arc<EventDispatcher>, Error> {
        match self {
            KernelObjectRef::Event(e) => Ok(e),
            _ => WrongTypeSnafu.fail(),
        }
    }

    pub fn as_port(&self) -> Result<&Arc<PortDispatcher>, Error> {
        match self {
            KernelObjectRef::Port(p) => Ok(p),
            _ => WrongTypeSnafu.fail(),
        }
    }
}

impl core::fmt::Debug for KernelObjectRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let d = self.dispatcher();
        write!(f, "{:?}({})", d.object_type(), d.koid())
    }
}

/// Globally unique identity of one handle. Observers are registered through a handle and are
/// canceled when it is closed.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

impl HandleId {
    fn next() -> HandleId {
        HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> HandleId {
        HandleId(id)
    }
}

/// A capability: a reference to a kernel object together with the rights it grants.
///
/// A handle lives in exactly one place, either a process handle table or a message in flight.
/// Dropping it cancels every observer registered through it, and dropping the last handle to an
/// object destroys the object.
pub struct Handle {
    id: HandleId,
    object: KernelObjectRef,
    rights: Rights,
    /// Set once the handle has given up its reference count.
    released: bool,
}

impl Handle {
    pub(crate) fn new(object: KernelObjectRef, rights: Rights) -> Handle {
        {
            let d = object.dispatcher();
            let mut count = d.handle_count().0.lock();
            *count += 1;
            d.signal_state().update_handle_count(*count);
        }
        Handle {
            id: HandleId::next(),
            object,
            rights,
            released: false,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Give this handle a new identity. Used when a handle enters a new process, so that late
    /// cancellations aimed at its previous owner's observers can't reach the new owner's.
    pub(crate) fn renew(&mut self) {
        self.id = HandleId::next();
    }

    pub fn object(&self) -> &KernelObjectRef {
        &self.object
    }

    pub fn rights(&self) -> Rights {
        self.rights
    }

    pub fn koid(&self) -> Koid {
        self.object.dispatcher().koid()
    }

    /// Fail with `AccessDenied` unless this handle has every right in `rights`.
    pub fn require(&self, rights: Rights) -> Result<(), Error> {
        ensure!(self.rights.contains(rights), AccessDeniedSnafu);
        Ok(())
    }

    /// Resolve a requested rights mask against the rights of this handle.
    pub fn derive_rights(&self, rights: Rights) -> Result<Rights, Error> {
        if rights.contains(Rights::SAME_RIGHTS) {
            return Ok(self.rights);
        }
        ensure!(
            self.rights.contains(rights),
            InvalidArgsSnafu {
                reason: "new rights must be a subset of the existing rights"
            }
        );
        Ok(rights)
    }

    /// Create a new handle to the same object.
    pub fn duplicate(&self, rights: Rights) -> Result<Handle, Error> {
        let rights = self.derive_rights(rights)?;
        Ok(Handle::new(self.object.clone(), rights))
    }

    pub fn info(&self) -> ObjectInfo {
        let d = self.object.dispatcher();
        ObjectInfo {
            koid: d.koid(),
            related_koid: d.related_koid(),
            object_type: d.object_type(),
            rights: self.rights,
            handle_count: d.handle_count().get(),
            signals: d.signal_state().signals(),
        }
    }
}

impl Handle {
    /// Cancel this handle's observers and drop its count, destroying the object if this was the
    /// last handle. Returns the handles the destroyed object held.
    fn release(&mut self) -> Vec<Handle> {
        self.released = true;
        let d = self.object.dispatcher();
        d.signal_state().cancel(self.id);
        let remaining = {
            let mut count = d.handle_count().0.lock();
            *count -= 1;
            d.signal_state().update_handle_count(*count);
            *count
        };
        if remaining == 0 {
            log::trace!("last handle to {:?} closed", self.object);
            d.on_zero_handles()
        } else {
            Vec::new()
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // channels nested in channels can go arbitrarily deep, so orphaned handles are released
        // here in a loop rather than by their own drops
        let mut orphans = self.release();
        while let Some(mut h) = orphans.pop() {
            let mut more = h.release();
            orphans.append(&mut more);
        }
    }
}

impl core::fmt::Debug for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("object", &self.object)
            .field("rights", &self.rights)
            .finish()
    }
}
