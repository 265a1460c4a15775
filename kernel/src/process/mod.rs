//! Processes and their handle tables.
//!
//! A [Process] is the unit that owns handles. Every operation user space can perform is a method
//! on it (see [syscalls]), taking handle values and resolving them through the handle table.
//!
//! # Locking
//! The handle table is the outermost lock. Waits register their observers while holding it for
//! reading, so a concurrent close (which takes it for writing) either happens entirely before the
//! registration, making the handle value bad, or entirely after it, canceling the observer.
//! Handles removed from the table are always dropped after the lock is released, since dropping a
//! handle can destroy objects.
use std::sync::Arc;

use hashbrown::HashMap;
use kapi::{HandleValue, Koid};
use snafu::OptionExt;

use crate::{
    config::KernelConfig,
    error::{BadHandleSnafu, Error, NoMemorySnafu},
    futex::FutexContext,
    object::{next_koid, Dispatcher, Handle},
};

pub mod syscalls;
pub use syscalls::{PendingWait, WaitOutcome};

struct HandleTable {
    map: HashMap<HandleValue, Handle>,
    /// The next handle value to hand out. Values are never reused.
    next_value: HandleValue,
}

impl HandleTable {
    fn get(&self, value: HandleValue) -> Result<&Handle, Error> {
        self.map
            .get(&value)
            .context(BadHandleSnafu { handle: value })
    }

    /// Fail with `NoMemory` unless `count` more handles can be inserted.
    fn check_capacity(&self, count: usize) -> Result<(), Error> {
        u32::try_from(count)
            .ok()
            .and_then(|c| self.next_value.checked_add(c))
            .context(NoMemorySnafu)?;
        Ok(())
    }

    /// Insert a handle. Callers check capacity first.
    fn insert(&mut self, handle: Handle) -> HandleValue {
        let value = self.next_value;
        self.next_value += 1;
        self.map.insert(value, handle);
        value
    }

    fn remove(&mut self, value: HandleValue) -> Result<Handle, Error> {
        self.map
            .remove(&value)
            .context(BadHandleSnafu { handle: value })
    }

    /// Remove a handle that is about to enter another process, ending every wait made through it.
    fn take_for_transfer(&mut self, value: HandleValue) -> Result<Handle, Error> {
        let mut moved = self.remove(value)?;
        moved.object().dispatcher().signal_state().cancel(moved.id());
        moved.renew();
        Ok(moved)
    }
}

/// A collection of handles and futexes, sharing one configuration.
pub struct Process {
    /// The ID of this process.
    pub koid: Koid,
    handles: spin::RwLock<HandleTable>,
    futex: FutexContext,
    config: Arc<KernelConfig>,
}

impl Process {
    /// A process with an empty handle table.
    pub fn new(config: Arc<KernelConfig>) -> Process {
        let koid = next_koid();
        log::debug!("created process {koid}");
        Process {
            koid,
            handles: spin::RwLock::new(HandleTable {
                map: HashMap::new(),
                next_value: 1,
            }),
            futex: FutexContext::default(),
            config,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Number of handles this process holds.
    pub fn handle_count(&self) -> usize {
        self.handles.read().map.len()
    }

    fn insert_handle(&self, handle: Handle) -> Result<HandleValue, Error> {
        let mut table = self.handles.write();
        table.check_capacity(1)?;
        Ok(table.insert(handle))
    }

    fn maybe_yield(&self, woke: bool) {
        if woke && self.config.yield_on_wake {
            std::thread::yield_now();
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        let handles = std::mem::take(&mut self.handles.get_mut().map);
        log::debug!(
            "process {} exiting, closing {} handles",
            self.koid,
            handles.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use kapi::{Rights, Signals};

    use super::*;
    use crate::object::{channel::ChannelDispatcher, KernelObjectRef};

    #[test]
    fn handle_values_are_never_reused() {
        let p = Process::new(Arc::default());
        let a = p.event_create().unwrap();
        p.handle_close(a).unwrap();
        let b = p.event_create().unwrap();
        assert_ne!(a, b);
        assert_ne!(b, kapi::INVALID_HANDLE);
        assert_eq!(p.handle_close(a), Err(Error::BadHandle { handle: a }));
    }

    #[test]
    fn exiting_process_closes_its_handles() {
        let (left, right) = ChannelDispatcher::create(Default::default());
        let local = Handle::new(KernelObjectRef::Channel(left), Rights::CHANNEL_DEFAULT);
        let p = Process::new(Arc::default());
        let remote = p
            .insert_handle(Handle::new(
                KernelObjectRef::Channel(right),
                Rights::CHANNEL_DEFAULT,
            ))
            .unwrap();
        assert_eq!(p.object_get_info(remote).unwrap().related_koid, local.koid());
        drop(p);
        assert!(local.info().signals.contains(Signals::PEER_CLOSED));
    }

    #[test]
    fn reads_into_a_full_table_leave_the_message_queued() {
        let p = Process::new(Arc::default());
        let (e1, e2) = p.channel_create().unwrap();
        let ev = p.event_create().unwrap();
        p.channel_write(e1, b"carrying", &[ev]).unwrap();
        p.channel_write(e1, b"empty", &[]).unwrap();

        let next = std::mem::replace(&mut p.handles.write().next_value, HandleValue::MAX);
        assert_eq!(p.channel_read(e2), Err(Error::NoMemory));
        assert!(p.object_get_info(e2).unwrap().signals.contains(Signals::READABLE));

        p.handles.write().next_value = next;
        let (bytes, handles) = p.channel_read(e2).unwrap();
        assert_eq!(bytes, b"carrying");
        assert_eq!(handles.len(), 1);

        // a message without handles needs no room
        p.handles.write().next_value = HandleValue::MAX;
        assert_eq!(p.channel_read(e2).unwrap().0, b"empty");
    }

    #[test]
    fn transfers_into_a_full_table_keep_the_handle() {
        let a = Process::new(Arc::default());
        let b = Process::new(Arc::default());
        let ev = a.event_create().unwrap();
        let pending = a.object_wait_one_cancelable(ev, Signals::SIGNALED).unwrap();

        b.handles.write().next_value = HandleValue::MAX;
        assert_eq!(a.transfer_handle(ev, &b), Err(Error::NoMemory));
        assert_eq!(b.handle_count(), 0);
        assert_eq!(a.object_get_info(ev).unwrap().handle_count, 1);

        // the handle never left, so waits through it are still registered
        a.object_signal(ev, Signals::empty(), Signals::SIGNALED)
            .unwrap();
        assert_eq!(pending.wait(kapi::Deadline::IMMEDIATE).result, Ok(()));

        b.handles.write().next_value = 1;
        let moved = b.transfer_handle(a.transfer_handle(ev, &b).unwrap(), &a).unwrap();
        assert_eq!(a.object_get_info(moved).unwrap().handle_count, 1);
        assert_eq!(b.handle_count(), 0);
    }

    #[test]
    fn transfer_to_the_same_process_renumbers_the_handle() {
        let p = Process::new(Arc::default());
        let ev = p.event_create().unwrap();
        let moved = p.transfer_handle(ev, &p).unwrap();
        assert_ne!(moved, ev);
        assert_eq!(p.handle_count(), 1);
        assert_eq!(p.object_get_info(ev), Err(Error::BadHandle { handle: ev }));
    }
}
