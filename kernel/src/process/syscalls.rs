//! System call entry points.
//!
//! Each method resolves handle values through the process's handle table, checks rights and then
//! forwards to the object. Every failure is reported synchronously to the caller.
use std::sync::{atomic::AtomicU32, Arc};

use kapi::{
    port::{PacketKind, PortPacket, WaitAsyncOptions},
    wait::{WaitItem, MAX_WAIT_MANY},
    Deadline, HandleValue, ObjectInfo, Rights, Signals, INVALID_HANDLE,
};
use smallvec::SmallVec;
use snafu::ensure;

use super::Process;
use crate::{
    error::{Error, InvalidArgsSnafu, NotFoundSnafu, NotSupportedSnafu, OutOfRangeSnafu},
    object::{
        channel::{ChannelDispatcher, Message},
        event::EventDispatcher,
        on_signals::OnSignals,
        port::{PortDispatcher, PortObserver},
        signals::{CancelKey, Registration},
        waiter::{WaitCanceler, Waiter},
        Dispatcher, Handle, HandleId, KernelObjectRef,
    },
};

/// The result of waiting on one handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOutcome {
    pub result: Result<(), Error>,
    /// Every signal seen on the object while the wait was registered.
    pub observed: Signals,
}

/// A wait on one handle that is registered but has not blocked yet.
///
/// Obtain a [WaitCanceler] before blocking to cancel the wait from another thread.
pub struct PendingWait {
    waiter: Waiter,
}

impl PendingWait {
    /// See [Waiter::canceler].
    pub fn canceler(&self) -> WaitCanceler {
        self.waiter.canceler()
    }

    /// Block until the wait completes or `deadline` passes.
    pub fn wait(mut self, deadline: Deadline) -> WaitOutcome {
        let (status, _) = self.waiter.wait(deadline);
        let observed = self
            .waiter
            .finish_wait()
            .first()
            .copied()
            .unwrap_or_default();
        WaitOutcome {
            result: status.into_result(),
            observed,
        }
    }
}

impl Process {
    /// Look up a channel handle that has `rights`.
    fn channel(&self, handle: HandleValue, rights: Rights) -> Result<Arc<ChannelDispatcher>, Error> {
        let table = self.handles.read();
        let h = table.get(handle)?;
        let channel = h.object().as_channel()?.clone();
        h.require(rights)?;
        Ok(channel)
    }

    /// Look up a port handle that has `rights`.
    fn port(&self, handle: HandleValue, rights: Rights) -> Result<Arc<PortDispatcher>, Error> {
        let table = self.handles.read();
        let h = table.get(handle)?;
        let port = h.object().as_port()?.clone();
        h.require(rights)?;
        Ok(port)
    }

    /// Create a channel, returning handles to both of its endpoints.
    pub fn channel_create(&self) -> Result<(HandleValue, HandleValue), Error> {
        let (left, right) = ChannelDispatcher::create(self.config.channel.clone());
        let left = Handle::new(KernelObjectRef::Channel(left), Rights::CHANNEL_DEFAULT);
        let right = Handle::new(KernelObjectRef::Channel(right), Rights::CHANNEL_DEFAULT);
        let mut table = self.handles.write();
        table.check_capacity(2)?;
        let values = (table.insert(left), table.insert(right));
        log::trace!("[pid {}] channel_create -> {values:?}", self.koid);
        Ok(values)
    }

    /// Write a message to a channel, moving `handles` out of this process along with it.
    ///
    /// Either the whole message is queued and every handle moved, or nothing changes.
    pub fn channel_write(
        &self,
        handle: HandleValue,
        bytes: &[u8],
        handles: &[HandleValue],
    ) -> Result<(), Error> {
        log::trace!(
            "[pid {}] channel_write h{handle}: {} bytes, handles {handles:?}",
            self.koid,
            bytes.len()
        );
        let mut payload = Vec::new();
        payload
            .try_reserve_exact(bytes.len())
            .map_err(|_| Error::NoMemory)?;
        payload.extend_from_slice(bytes);
        let mut transferred = Vec::new();
        transferred
            .try_reserve_exact(handles.len())
            .map_err(|_| Error::NoMemory)?;
        // observers registered through the moved handles, canceled once the move is final
        let mut moved: SmallVec<[(KernelObjectRef, HandleId); 4]> = SmallVec::new();

        let woke = {
            let mut table = self.handles.write();
            let h = table.get(handle)?;
            let channel = h.object().as_channel()?.clone();
            h.require(Rights::WRITE)?;

            for (i, &value) in handles.iter().enumerate() {
                ensure!(value != handle, NotSupportedSnafu);
                ensure!(
                    !handles[..i].contains(&value),
                    InvalidArgsSnafu {
                        reason: "handle transferred more than once"
                    }
                );
                table.get(value)?.require(Rights::TRANSFER)?;
            }
            for value in handles {
                if let Ok(h) = table.remove(*value) {
                    moved.push((h.object().clone(), h.id()));
                    transferred.push(h);
                }
            }

            match channel.write(Message {
                bytes: payload,
                handles: transferred,
            }) {
                Ok(woke) => woke,
                Err((e, message)) => {
                    for (value, h) in handles.iter().zip(message.handles) {
                        table.map.insert(*value, h);
                    }
                    return Err(e);
                }
            }
        };

        for (object, id) in moved {
            object.dispatcher().signal_state().cancel(id);
        }
        self.maybe_yield(woke);
        Ok(())
    }

    /// Read the next message from a channel. Handles it carries are added to this process.
    pub fn channel_read(&self, handle: HandleValue) -> Result<(Vec<u8>, Vec<HandleValue>), Error> {
        self.channel_read_bounded(handle, usize::MAX, usize::MAX, false)
    }

    /// Read the next message from a channel if it has at most `max_bytes` bytes and `max_handles`
    /// handles. A message that is too large fails with `BufferTooSmall` and is only consumed if
    /// `may_discard` is set.
    pub fn channel_read_bounded(
        &self,
        handle: HandleValue,
        max_bytes: usize,
        max_handles: usize,
        may_discard: bool,
    ) -> Result<(Vec<u8>, Vec<HandleValue>), Error> {
        let read = {
            let mut table = self.handles.write();
            let h = table.get(handle)?;
            let channel = h.object().as_channel()?.clone();
            h.require(Rights::READ)?;
            // the message stays queued unless all of its handles have room in the table
            let read = channel.read_admitted(max_bytes, max_handles, may_discard, |count| {
                table.check_capacity(count)
            });
            read.map(|Message { bytes, handles }| {
                let values: Vec<HandleValue> = handles
                    .into_iter()
                    .map(|mut h| {
                        h.renew();
                        table.insert(h)
                    })
                    .collect();
                (bytes, values)
            })
        };
        match read {
            Ok((bytes, values)) => {
                log::trace!(
                    "[pid {}] channel_read h{handle}: {} bytes, handles {values:?}",
                    self.koid,
                    bytes.len()
                );
                Ok((bytes, values))
            }
            Err((e, discarded)) => {
                drop(discarded);
                Err(e)
            }
        }
    }

    /// Register a wait for any of `signals` on `handle` without blocking yet.
    pub fn object_wait_one_cancelable(
        &self,
        handle: HandleValue,
        signals: Signals,
    ) -> Result<PendingWait, Error> {
        let mut waiter = Waiter::new();
        {
            let table = self.handles.read();
            let h = table.get(handle)?;
            h.require(Rights::WAIT)?;
            waiter.begin_wait(h, signals)?;
        }
        Ok(PendingWait { waiter })
    }

    /// Block until `handle`'s object asserts any of `signals`, or `deadline` passes.
    pub fn object_wait_one(
        &self,
        handle: HandleValue,
        signals: Signals,
        deadline: Deadline,
    ) -> WaitOutcome {
        log::trace!(
            "[pid {}] object_wait_one h{handle} for {signals:?}",
            self.koid
        );
        match self.object_wait_one_cancelable(handle, signals) {
            Ok(pending) => pending.wait(deadline),
            Err(e) => WaitOutcome {
                result: Err(e),
                observed: Signals::empty(),
            },
        }
    }

    /// Block until any item is satisfied or `deadline` passes. Returns the index of the item that
    /// completed the wait; every item's `pending` is filled in either way.
    pub fn object_wait_many(
        &self,
        items: &mut [WaitItem],
        deadline: Deadline,
    ) -> Result<usize, Error> {
        ensure!(items.len() <= MAX_WAIT_MANY, OutOfRangeSnafu);
        let mut waiter = Waiter::new();
        {
            let table = self.handles.read();
            for item in items.iter() {
                let h = table.get(item.handle)?;
                h.require(Rights::WAIT)?;
                waiter.begin_wait(h, item.wait_for)?;
            }
        }
        let (status, index) = waiter.wait(deadline);
        for (item, observed) in items.iter_mut().zip(waiter.finish_wait()) {
            item.pending = observed;
        }
        log::trace!(
            "[pid {}] object_wait_many over {} items: {status:?} at {index:?}",
            self.koid,
            items.len()
        );
        status.into_result()?;
        Ok(index.unwrap_or_default())
    }

    /// Return a future that resolves once `handle`'s object asserts any of `signals`.
    pub fn wait_signals(&self, handle: HandleValue, signals: Signals) -> Result<OnSignals, Error> {
        let table = self.handles.read();
        let h = table.get(handle)?;
        h.require(Rights::WAIT)?;
        OnSignals::new(h, signals)
    }

    /// Close a handle. Closing [INVALID_HANDLE] does nothing.
    pub fn handle_close(&self, handle: HandleValue) -> Result<(), Error> {
        if handle == INVALID_HANDLE {
            return Ok(());
        }
        let removed = self.handles.write().remove(handle)?;
        log::trace!("[pid {}] handle_close h{handle} {removed:?}", self.koid);
        drop(removed);
        Ok(())
    }

    /// Create another handle to the same object, with the same or fewer rights.
    pub fn handle_duplicate(&self, handle: HandleValue, rights: Rights) -> Result<HandleValue, Error> {
        let mut table = self.handles.write();
        table.check_capacity(1)?;
        let h = table.get(handle)?;
        h.require(Rights::DUPLICATE)?;
        let dup = h.duplicate(rights)?;
        Ok(table.insert(dup))
    }

    /// Replace a handle with a new one to the same object, with the same or fewer rights.
    pub fn handle_replace(&self, handle: HandleValue, rights: Rights) -> Result<HandleValue, Error> {
        let (old, value) = {
            let mut table = self.handles.write();
            table.check_capacity(1)?;
            let h = table.get(handle)?;
            let rights = h.derive_rights(rights)?;
            let replacement = Handle::new(h.object().clone(), rights);
            let old = table.remove(handle)?;
            (old, table.insert(replacement))
        };
        drop(old);
        Ok(value)
    }

    /// Move a handle from this process into `target`, as when handing a new process its initial
    /// handles.
    pub fn transfer_handle(&self, handle: HandleValue, target: &Process) -> Result<HandleValue, Error> {
        let value = if std::ptr::eq(self, target) {
            let mut table = self.handles.write();
            table.get(handle)?.require(Rights::TRANSFER)?;
            table.check_capacity(1)?;
            let moved = table.take_for_transfer(handle)?;
            table.insert(moved)
        } else {
            // both tables are held so the handle is always in one of them, locked in koid order
            let (mut source, mut dest) = if self.koid < target.koid {
                let source = self.handles.write();
                (source, target.handles.write())
            } else {
                let dest = target.handles.write();
                (self.handles.write(), dest)
            };
            source.get(handle)?.require(Rights::TRANSFER)?;
            dest.check_capacity(1)?;
            let moved = source.take_for_transfer(handle)?;
            dest.insert(moved)
        };
        log::trace!(
            "[pid {}] moved h{handle} to pid {} as h{value}",
            self.koid,
            target.koid
        );
        Ok(value)
    }

    /// Clear then set user signals on an object.
    pub fn object_signal(&self, handle: HandleValue, clear: Signals, set: Signals) -> Result<(), Error> {
        let woke = {
            let table = self.handles.read();
            let h = table.get(handle)?;
            h.require(Rights::SIGNAL)?;
            h.object().dispatcher().user_signal(clear, set)?
        };
        self.maybe_yield(woke);
        Ok(())
    }

    /// Clear then set user signals on the peer of a peered object.
    pub fn object_signal_peer(
        &self,
        handle: HandleValue,
        clear: Signals,
        set: Signals,
    ) -> Result<(), Error> {
        let woke = {
            let table = self.handles.read();
            let h = table.get(handle)?;
            let KernelObjectRef::Channel(channel) = h.object() else {
                return NotSupportedSnafu.fail();
            };
            h.require(Rights::SIGNAL_PEER)?;
            channel.signal_peer(clear, set)?
        };
        self.maybe_yield(woke);
        Ok(())
    }

    /// Ask for a packet on `port` with `key` once `handle`'s object asserts any of `signals`.
    pub fn object_wait_async(
        &self,
        handle: HandleValue,
        port: HandleValue,
        key: u64,
        signals: Signals,
        options: WaitAsyncOptions,
    ) -> Result<(), Error> {
        log::trace!(
            "[pid {}] object_wait_async h{handle} on port h{port} key {key} for {signals:?}",
            self.koid
        );
        let woke = {
            let table = self.handles.read();
            let port = {
                let p = table.get(port)?;
                let port = p.object().as_port()?.clone();
                p.require(Rights::WRITE)?;
                port
            };
            let h = table.get(handle)?;
            h.require(Rights::WAIT)?;
            // a port observing a port could deadlock on the two port locks
            ensure!(
                !matches!(h.object(), KernelObjectRef::Port(_)),
                NotSupportedSnafu
            );
            let (_, woke) = h.object().dispatcher().add_observer(Registration {
                observer: Arc::new(PortObserver::new(&port, key, signals, options)),
                handle: h.id(),
                key: Some(CancelKey {
                    port: port.koid(),
                    key,
                }),
            })?;
            woke
        };
        self.maybe_yield(woke);
        Ok(())
    }

    /// Create a port.
    pub fn port_create(&self) -> Result<HandleValue, Error> {
        let port = PortDispatcher::create(self.config.port.clone());
        self.insert_handle(Handle::new(
            KernelObjectRef::Port(port),
            Rights::PORT_DEFAULT,
        ))
    }

    /// Queue a user packet on a port.
    pub fn port_queue(&self, port: HandleValue, packet: PortPacket) -> Result<(), Error> {
        ensure!(
            matches!(packet.kind, PacketKind::User(_)),
            InvalidArgsSnafu {
                reason: "only user packets may be queued"
            }
        );
        let woke = self.port(port, Rights::WRITE)?.queue_user(packet)?;
        self.maybe_yield(woke);
        Ok(())
    }

    /// Take the next packet from a port, blocking until one arrives or `deadline` passes.
    pub fn port_wait(&self, port: HandleValue, deadline: Deadline) -> Result<PortPacket, Error> {
        loop {
            let mut waiter = Waiter::new();
            {
                let table = self.handles.read();
                let h = table.get(port)?;
                let port = h.object().as_port()?;
                h.require(Rights::READ)?;
                if let Some(packet) = port.dequeue() {
                    return Ok(packet);
                }
                waiter.begin_wait(h, Signals::READABLE)?;
            }
            // another thread may take the packet first, in which case wait again
            let (status, _) = waiter.wait(deadline);
            status.into_result()?;
        }
    }

    /// Cancel the pending `object_wait_async` for `handle` with `key` on `port`.
    pub fn port_cancel(&self, port: HandleValue, handle: HandleValue, key: u64) -> Result<(), Error> {
        let table = self.handles.read();
        let p = table.get(port)?;
        let port_koid = p.object().as_port()?.koid();
        p.require(Rights::WRITE)?;
        let h = table.get(handle)?;
        ensure!(
            h.object()
                .dispatcher()
                .signal_state()
                .cancel_by_key(h.id(), port_koid, key),
            NotFoundSnafu
        );
        Ok(())
    }

    /// Create an event.
    pub fn event_create(&self) -> Result<HandleValue, Error> {
        self.insert_handle(Handle::new(
            KernelObjectRef::Event(EventDispatcher::create()),
            Rights::EVENT_DEFAULT,
        ))
    }

    /// Describe the object `handle` refers to.
    pub fn object_get_info(&self, handle: HandleValue) -> Result<ObjectInfo, Error> {
        let table = self.handles.read();
        let h = table.get(handle)?;
        h.require(Rights::INSPECT)?;
        Ok(h.info())
    }

    /// Block on the futex at `word` if it still holds `expected`.
    pub fn futex_wait(&self, word: &AtomicU32, expected: u32, deadline: Deadline) -> Result<(), Error> {
        self.futex.wait(word, expected, deadline)
    }

    /// Wake up to `count` threads blocked on the futex at `word`.
    pub fn futex_wake(&self, word: &AtomicU32, count: usize) -> usize {
        self.futex.wake(word, count)
    }

    /// Wake some waiters of `word` and move others to `requeue_word`, if `word` holds `expected`.
    pub fn futex_requeue(
        &self,
        word: &AtomicU32,
        wake_count: usize,
        expected: u32,
        requeue_word: &AtomicU32,
        requeue_count: usize,
    ) -> Result<usize, Error> {
        self.futex
            .requeue(word, wake_count, expected, requeue_word, requeue_count)
    }
}
