//! Per-object signal state and the registry of observers interested in it.
//!
//! Every kernel object owns one [SignalState]. Mutations come from the object itself (with its own
//! lock held, so that the signals always agree with the object's contents) and are pushed to every
//! registered [StateObserver] while the signal state's lock is held. Observers must never call
//! back into the same signal state; anything they need to do to wake a thread is lock-free.
use std::sync::Arc;

use bitflags::bitflags;
use kapi::{Koid, Signals};
use snafu::ensure;

use super::HandleId;
use crate::error::{BadStateSnafu, Error};

/// Signals that only the peer of a channel can bring about. A wait for any of them can never be
/// satisfied once the peer is gone, so it ends with `PeerClosed` instead.
pub const PEER_DRIVEN: Signals = Signals::READABLE.union(Signals::WRITABLE);

/// Identifies a registered observer so that it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

bitflags! {
    /// What an observer wants done after a callback.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObserverFlags: u8 {
        /// Remove the observer from the registry. It will receive no further callbacks.
        const REMOVE = 1 << 0;
        /// The callback woke a thread.
        const WOKE_THREAD = 1 << 1;
    }
}

/// Why an observer was canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The handle the observer was registered through was closed.
    HandleClosed,
    /// The object was destroyed.
    ObjectDestroyed,
    /// The observer was canceled by its port key.
    KeyCanceled,
}

/// A party that wants to know when an object's signals change.
///
/// Callbacks run with the signal state locked. An observer receives no callbacks once any of them
/// has returned [ObserverFlags::REMOVE], and none after `on_cancel`.
pub trait StateObserver: Send + Sync {
    /// Called once at registration with the signals at that moment and an object specific count.
    fn on_initialize(&self, initial: Signals, count: u64) -> ObserverFlags;

    /// Called after every change to the signals while registered.
    fn on_state_change(&self, new_state: Signals) -> ObserverFlags;

    /// Called when the observer is forcibly removed. The observer is removed regardless of the
    /// flags returned.
    fn on_cancel(&self, reason: CancelReason) -> ObserverFlags;
}

/// Port binding that allows an observer to be canceled by key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelKey {
    /// The port packets are delivered to.
    pub port: Koid,
    /// The key given to `object_wait_async`.
    pub key: u64,
}

/// Everything needed to register an observer.
pub struct Registration {
    /// Called back on every state change until it asks to be removed.
    pub observer: Arc<dyn StateObserver>,
    /// The handle the observer is registered through. Closing it cancels the observer.
    pub handle: HandleId,
    /// Set for port bindings, so `port_cancel` can find them.
    pub key: Option<CancelKey>,
}

struct Entry {
    id: ObserverId,
    handle: HandleId,
    key: Option<CancelKey>,
    observer: Arc<dyn StateObserver>,
}

struct Inner {
    signals: Signals,
    observers: Vec<Entry>,
    /// Set once the owning object is destroyed. No observer may be added afterwards.
    sealed: bool,
    next_id: u64,
}

/// Signals of one object plus its observer registry.
pub struct SignalState {
    inner: spin::Mutex<Inner>,
}

impl SignalState {
    /// A state asserting `initial`, with no observers.
    pub fn new(initial: Signals) -> Self {
        Self {
            inner: spin::Mutex::new(Inner {
                signals: initial,
                observers: Vec::new(),
                sealed: false,
                next_id: 0,
            }),
        }
    }

    /// A point in time snapshot of the signals.
    pub fn signals(&self) -> Signals {
        self.inner.lock().signals
    }

    /// Clear then set signals, notifying observers if the result differs from before.
    /// Returns true if an observer woke a thread.
    pub fn update_state(&self, clear: Signals, set: Signals) -> bool {
        let mut inner = self.inner.lock();
        let previous = inner.signals;
        let signals = previous.difference(clear).union(set);
        if signals == previous {
            return false;
        }
        inner.signals = signals;

        let mut woke = false;
        inner.observers.retain(|entry| {
            let flags = entry.observer.on_state_change(signals);
            woke |= flags.contains(ObserverFlags::WOKE_THREAD);
            !flags.contains(ObserverFlags::REMOVE)
        });
        woke
    }

    /// Recompute [Signals::LAST_HANDLE] from a snapshot of the object's handle count.
    pub fn update_handle_count(&self, count: usize) -> bool {
        if count == 1 {
            self.update_state(Signals::empty(), Signals::LAST_HANDLE)
        } else {
            self.update_state(Signals::LAST_HANDLE, Signals::empty())
        }
    }

    /// Register an observer, first giving it a chance to complete against the current signals.
    /// An observer that asks to be removed by `on_initialize` is never inserted.
    ///
    /// Returns the observer's id and whether `on_initialize` woke a thread.
    pub fn add_observer(
        &self,
        registration: Registration,
        initial_count: u64,
    ) -> Result<(ObserverId, bool), Error> {
        let mut inner = self.inner.lock();
        ensure!(!inner.sealed, BadStateSnafu);
        inner
            .observers
            .try_reserve(1)
            .map_err(|_| Error::NoMemory)?;

        let id = ObserverId(inner.next_id);
        inner.next_id += 1;

        let flags = registration
            .observer
            .on_initialize(inner.signals, initial_count);
        if !flags.contains(ObserverFlags::REMOVE) {
            inner.observers.push(Entry {
                id,
                handle: registration.handle,
                key: registration.key,
                observer: registration.observer,
            });
        }
        Ok((id, flags.contains(ObserverFlags::WOKE_THREAD)))
    }

    /// Remove an observer. Returns false if it had already been removed.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut inner = self.inner.lock();
        match inner.observers.iter().position(|e| e.id == id) {
            Some(ix) => {
                inner.observers.remove(ix);
                true
            }
            None => false,
        }
    }

    /// Cancel every observer registered through `handle`. Returns true if any were found.
    pub fn cancel(&self, handle: HandleId) -> bool {
        let mut inner = self.inner.lock();
        let mut found = false;
        inner.observers.retain(|entry| {
            if entry.handle == handle {
                entry.observer.on_cancel(CancelReason::HandleClosed);
                found = true;
                false
            } else {
                true
            }
        });
        found
    }

    /// Cancel every observer and seal the registry. Used when the owning object is destroyed.
    pub fn cancel_all(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.sealed = true;
        let observers = std::mem::take(&mut inner.observers);
        for entry in observers.iter() {
            entry.observer.on_cancel(CancelReason::ObjectDestroyed);
        }
        !observers.is_empty()
    }

    /// Cancel the first observer registered through `handle` with the given port binding.
    pub fn cancel_by_key(&self, handle: HandleId, port: Koid, key: u64) -> bool {
        let wanted = Some(CancelKey { port, key });
        let mut inner = self.inner.lock();
        match inner
            .observers
            .iter()
            .position(|e| e.handle == handle && e.key == wanted)
        {
            Some(ix) => {
                let entry = inner.observers.remove(ix);
                entry.observer.on_cancel(CancelReason::KeyCanceled);
                true
            }
            None => false,
        }
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }
}
