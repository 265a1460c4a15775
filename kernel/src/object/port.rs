//! Ports: queues of packets, filled by asynchronous signal observers and by user space.
//!
//! `object_wait_async` binds a [PortObserver] to some object. When the object asserts one of the
//! trigger signals, the observer posts a single packet to the port and removes itself. Observers
//! only hold a weak reference to their port, so a port with outstanding bindings can still be
//! destroyed; bindings to a dead port are dropped the next time their object's signals change.
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Weak,
    },
};

use kapi::{
    port::{PacketKind, PortPacket, SignalPacket, WaitAsyncOptions},
    Koid, ObjectType, Signals,
};
use snafu::ensure;

use super::{
    next_koid,
    signals::{CancelReason, ObserverFlags, SignalState, StateObserver},
    Dispatcher, Handle, HandleCount,
};
use crate::{
    config::PortLimits,
    error::{BadStateSnafu, Error, ShouldWaitSnafu},
};

struct PortState {
    packets: VecDeque<PortPacket>,
    /// Set when the last handle to the port is closed. No packet is accepted afterwards.
    zero_handles: bool,
}

/// A bounded queue of packets. `READABLE` is asserted while any packet is queued.
pub struct PortDispatcher {
    koid: Koid,
    signals: SignalState,
    handles: HandleCount,
    state: spin::Mutex<PortState>,
    limits: PortLimits,
}

impl PortDispatcher {
    /// A new, empty port.
    pub fn create(limits: PortLimits) -> Arc<PortDispatcher> {
        Arc::new(PortDispatcher {
            koid: next_koid(),
            signals: SignalState::new(Signals::empty()),
            handles: HandleCount::default(),
            state: spin::Mutex::new(PortState {
                packets: VecDeque::new(),
                zero_handles: false,
            }),
            limits,
        })
    }

    fn enqueue(&self, state: &mut PortState, packet: PortPacket) -> bool {
        state.packets.push_back(packet);
        self.signals
            .update_state(Signals::empty(), Signals::READABLE)
    }

    /// Queue a packet from user space. Fails with `ShouldWait` if the port is full.
    pub fn queue_user(&self, packet: PortPacket) -> Result<bool, Error> {
        let mut state = self.state.lock();
        ensure!(!state.zero_handles, BadStateSnafu);
        ensure!(
            state.packets.len() < self.limits.max_queued_packets,
            ShouldWaitSnafu
        );
        Ok(self.enqueue(&mut state, packet))
    }

    /// Queue a packet produced by an observer. A full port drops it.
    fn queue_signal_packet(&self, packet: PortPacket) -> bool {
        let mut state = self.state.lock();
        if state.zero_handles {
            return false;
        }
        if state.packets.len() >= self.limits.max_queued_packets {
            log::warn!(
                "port {} is full, dropping packet with key {}",
                self.koid,
                packet.key
            );
            return false;
        }
        self.enqueue(&mut state, packet)
    }

    /// Take the oldest packet, if there is one.
    pub fn dequeue(&self) -> Option<PortPacket> {
        let mut state = self.state.lock();
        let packet = state.packets.pop_front();
        if state.packets.is_empty() {
            self.signals
                .update_state(Signals::READABLE, Signals::empty());
        }
        packet
    }

    pub fn queued(&self) -> usize {
        self.state.lock().packets.len()
    }
}

impl Dispatcher for PortDispatcher {
    fn koid(&self) -> Koid {
        self.koid
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::Port
    }

    fn signal_state(&self) -> &SignalState {
        &self.signals
    }

    fn handle_count(&self) -> &HandleCount {
        &self.handles
    }

    fn on_zero_handles(&self) -> Vec<Handle> {
        let dropped = {
            let mut state = self.state.lock();
            state.zero_handles = true;
            self.signals.cancel_all();
            std::mem::take(&mut state.packets)
        };
        log::debug!(
            "port {} closed with {} packets queued",
            self.koid,
            dropped.len()
        );
        Vec::new()
    }
}

/// Posts one packet to a port when an object asserts any trigger signal.
pub struct PortObserver {
    port: Weak<PortDispatcher>,
    key: u64,
    trigger: Signals,
    edge: bool,
    /// Signals as of the previous callback, to detect edges.
    last: AtomicU32,
}

impl PortObserver {
    /// A binding that queues a packet with `key` on `port` once `trigger` is asserted.
    pub fn new(
        port: &Arc<PortDispatcher>,
        key: u64,
        trigger: Signals,
        options: WaitAsyncOptions,
    ) -> PortObserver {
        PortObserver {
            port: Arc::downgrade(port),
            key,
            trigger,
            edge: options.contains(WaitAsyncOptions::EDGE),
            last: AtomicU32::new(0),
        }
    }

    fn deliver(&self, observed: Signals, count: u64) -> ObserverFlags {
        let woke = match self.port.upgrade() {
            Some(port) => port.queue_signal_packet(PortPacket {
                key: self.key,
                kind: PacketKind::Signal(SignalPacket {
                    trigger: self.trigger,
                    observed,
                    count: count.max(1),
                }),
            }),
            None => false,
        };
        if woke {
            ObserverFlags::REMOVE | ObserverFlags::WOKE_THREAD
        } else {
            ObserverFlags::REMOVE
        }
    }

    /// Keep waiting, unless the port is gone and no packet could ever be delivered.
    fn keep_waiting(&self) -> ObserverFlags {
        if self.port.strong_count() == 0 {
            ObserverFlags::REMOVE
        } else {
            ObserverFlags::empty()
        }
    }
}

impl StateObserver for PortObserver {
    fn on_initialize(&self, initial: Signals, count: u64) -> ObserverFlags {
        self.last.store(initial.bits(), Ordering::Relaxed);
        if !self.edge && initial.intersects(self.trigger) {
            self.deliver(initial, count)
        } else {
            self.keep_waiting()
        }
    }

    fn on_state_change(&self, new_state: Signals) -> ObserverFlags {
        let previous =
            Signals::from_bits_retain(self.last.swap(new_state.bits(), Ordering::Relaxed));
        let fire = new_state.intersects(self.trigger)
            && !(self.edge && previous.intersects(self.trigger));
        if fire {
            self.deliver(new_state, 1)
        } else {
            self.keep_waiting()
        }
    }

    fn on_cancel(&self, _reason: CancelReason) -> ObserverFlags {
        ObserverFlags::REMOVE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::signals::Registration;
    use crate::object::HandleId;

    fn register(source: &SignalState, port: &Arc<PortDispatcher>, options: WaitAsyncOptions) {
        source
            .add_observer(
                Registration {
                    observer: Arc::new(PortObserver::new(port, 42, Signals::USER_0, options)),
                    handle: HandleId::from_raw(1),
                    key: None,
                },
                3,
            )
            .unwrap();
    }

    #[test]
    fn level_triggered_fires_at_registration() {
        let port = PortDispatcher::create(PortLimits::default());
        let source = SignalState::new(Signals::USER_0);
        register(&source, &port, WaitAsyncOptions::empty());
        assert_eq!(source.observer_count(), 0);
        assert!(port.signal_state().signals().contains(Signals::READABLE));

        let p = port.dequeue().unwrap();
        assert_eq!(p.key, 42);
        let s = p.signal().unwrap();
        assert_eq!(s.count, 3);
        assert_eq!(s.trigger, Signals::USER_0);
        assert!(port.dequeue().is_none());
        assert!(!port.signal_state().signals().contains(Signals::READABLE));
    }

    #[test]
    fn edge_triggered_waits_for_a_transition() {
        let port = PortDispatcher::create(PortLimits::default());
        let source = SignalState::new(Signals::USER_0);
        register(&source, &port, WaitAsyncOptions::EDGE);
        assert_eq!(port.queued(), 0);
        // unrelated changes while the trigger stays asserted are not an edge
        source.update_state(Signals::empty(), Signals::USER_1);
        source.update_state(Signals::empty(), Signals::LAST_HANDLE);
        assert_eq!(port.queued(), 0);
        source.update_state(Signals::USER_0, Signals::empty());
        assert_eq!(port.queued(), 0);
        source.update_state(Signals::empty(), Signals::USER_0);
        assert_eq!(port.queued(), 1);
        // one-shot
        source.update_state(Signals::USER_0, Signals::empty());
        source.update_state(Signals::empty(), Signals::USER_0);
        assert_eq!(port.queued(), 1);
    }

    #[test]
    fn full_port_drops_observer_packets_and_refuses_user_packets() {
        let port = PortDispatcher::create(PortLimits {
            max_queued_packets: 1,
        });
        port.queue_user(PortPacket::user(1, [0; 4])).unwrap();
        assert_eq!(
            port.queue_user(PortPacket::user(2, [0; 4])),
            Err(Error::ShouldWait)
        );
        let source = SignalState::new(Signals::USER_0);
        register(&source, &port, WaitAsyncOptions::empty());
        assert_eq!(port.queued(), 1);
        assert_eq!(port.dequeue().unwrap().key, 1);
    }

    #[test]
    fn bindings_to_a_dead_port_are_dropped() {
        let port = PortDispatcher::create(PortLimits::default());
        let source = SignalState::new(Signals::empty());
        register(&source, &port, WaitAsyncOptions::empty());
        assert_eq!(source.observer_count(), 1);
        drop(port);
        source.update_state(Signals::empty(), Signals::USER_1);
        assert_eq!(source.observer_count(), 0);
    }
}
