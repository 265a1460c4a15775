//! Blocking waits on object signals.
//!
//! A [Waiter] registers one [WaitObserver] per target object, all sharing a single [WaitEvent].
//! The first party to complete the event (an observer seeing a watched signal, a canceler, a
//! closed handle or the deadline) decides the outcome of the wait; everyone after that is ignored.
//! Because observers are evaluated against the current signals when they are registered, a signal
//! asserted before the thread parks is never missed.
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use crossbeam::sync::{Parker, Unparker};
use kapi::{Deadline, Signals};
use smallvec::SmallVec;
use spin::Once;

use super::{
    signals::{
        CancelReason, ObserverFlags, ObserverId, Registration, StateObserver, PEER_DRIVEN,
    },
    Handle, KernelObjectRef,
};
use crate::{error::Error, time};

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// A watched signal was asserted.
    Satisfied,
    /// The peer went away while the wait was for signals only the peer could assert.
    PeerClosed,
    TimedOut,
    /// Canceled on request.
    Canceled,
    /// The handle waited on was closed.
    HandleClosed,
}

impl WaitStatus {
    pub fn into_result(self) -> Result<(), Error> {
        match self {
            WaitStatus::Satisfied => Ok(()),
            WaitStatus::PeerClosed => Err(Error::PeerClosed),
            WaitStatus::TimedOut => Err(Error::TimedOut),
            WaitStatus::Canceled => Err(Error::Canceled),
            WaitStatus::HandleClosed => Err(Error::HandleClosed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    status: WaitStatus,
    /// Which target completed the wait, if any.
    index: Option<usize>,
}

/// A one-shot event that a single thread blocks on.
pub(crate) struct WaitEvent {
    outcome: Once<Outcome>,
    unparker: Unparker,
}

impl WaitEvent {
    pub(crate) fn new(unparker: Unparker) -> WaitEvent {
        WaitEvent {
            outcome: Once::new(),
            unparker,
        }
    }

    /// Complete the event. Returns true if this call decided the outcome and woke the thread.
    pub(crate) fn signal(&self, status: WaitStatus, index: Option<usize>) -> bool {
        let mut won = false;
        self.outcome.call_once(|| {
            won = true;
            Outcome { status, index }
        });
        if won {
            self.unparker.unpark();
        }
        won
    }

    /// Park until the event completes or the deadline passes.
    ///
    /// `parker` must be the parker that this event's unparker belongs to.
    pub(crate) fn block(&self, parker: &Parker, deadline: Deadline) -> (WaitStatus, Option<usize>) {
        let until = time::to_instant(deadline);
        loop {
            if let Some(o) = self.outcome.get() {
                return (o.status, o.index);
            }
            match until {
                None => parker.park(),
                Some(until) if std::time::Instant::now() >= until => {
                    // racing with a signal, whoever completes the event first wins
                    self.signal(WaitStatus::TimedOut, None);
                }
                Some(until) => parker.park_deadline(until),
            }
        }
    }
}

/// Observer for one target of a blocking wait.
pub(crate) struct WaitObserver {
    watched: Signals,
    index: usize,
    /// Union of every signal state seen while registered.
    observed: AtomicU32,
    event: Arc<WaitEvent>,
}

impl WaitObserver {
    fn observed(&self) -> Signals {
        Signals::from_bits_retain(self.observed.load(Ordering::Acquire))
    }

    fn check(&self, signals: Signals) -> ObserverFlags {
        self.observed.fetch_or(signals.bits(), Ordering::AcqRel);
        let status = if signals.intersects(self.watched) {
            WaitStatus::Satisfied
        } else if signals.contains(Signals::PEER_CLOSED) && self.watched.intersects(PEER_DRIVEN) {
            WaitStatus::PeerClosed
        } else {
            return ObserverFlags::empty();
        };
        if self.event.signal(status, Some(self.index)) {
            ObserverFlags::REMOVE | ObserverFlags::WOKE_THREAD
        } else {
            ObserverFlags::REMOVE
        }
    }
}

impl StateObserver for WaitObserver {
    fn on_initialize(&self, initial: Signals, _count: u64) -> ObserverFlags {
        self.check(initial)
    }

    fn on_state_change(&self, new_state: Signals) -> ObserverFlags {
        self.check(new_state)
    }

    fn on_cancel(&self, reason: CancelReason) -> ObserverFlags {
        let status = match reason {
            CancelReason::HandleClosed | CancelReason::ObjectDestroyed => {
                self.observed
                    .fetch_or(Signals::HANDLE_CLOSED.bits(), Ordering::AcqRel);
                WaitStatus::HandleClosed
            }
            CancelReason::KeyCanceled => WaitStatus::Canceled,
        };
        self.event.signal(status, Some(self.index));
        ObserverFlags::REMOVE
    }
}

struct Target {
    object: KernelObjectRef,
    observer: Arc<WaitObserver>,
    id: ObserverId,
}

/// Cancels a wait from another thread.
#[derive(Clone)]
pub struct WaitCanceler {
    event: Arc<WaitEvent>,
}

impl WaitCanceler {
    /// Wake the waiting thread with [WaitStatus::Canceled]. Does nothing if the wait already
    /// finished. Returns true if this call canceled the wait.
    pub fn cancel(&self) -> bool {
        self.event.signal(WaitStatus::Canceled, None)
    }
}

/// A thread blocked on the signals of one or more objects.
pub struct Waiter {
    parker: Parker,
    event: Arc<WaitEvent>,
    targets: SmallVec<[Target; 1]>,
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Waiter {
    /// A waiter for the calling thread, watching nothing yet.
    pub fn new() -> Waiter {
        let parker = Parker::new();
        let event = Arc::new(WaitEvent::new(parker.unparker().clone()));
        Waiter {
            parker,
            event,
            targets: SmallVec::new(),
        }
    }

    /// Start watching `handle`'s object for any of `watched`. Returns true if the wait was
    /// already satisfied by this target.
    pub fn begin_wait(&mut self, handle: &Handle, watched: Signals) -> Result<bool, Error> {
        let observer = Arc::new(WaitObserver {
            watched,
            index: self.targets.len(),
            observed: AtomicU32::new(0),
            event: self.event.clone(),
        });
        let (id, woke) = handle.object().dispatcher().add_observer(Registration {
            observer: observer.clone(),
            handle: handle.id(),
            key: None,
        })?;
        self.targets.push(Target {
            object: handle.object().clone(),
            observer,
            id,
        });
        Ok(woke)
    }

    /// Block until the wait completes. Returns the status and the index of the target that
    /// completed it, if any.
    pub fn wait(&self, deadline: Deadline) -> (WaitStatus, Option<usize>) {
        self.event.block(&self.parker, deadline)
    }

    /// Unregister every observer and return the signals each target was seen with, in the order
    /// the targets were added.
    pub fn finish_wait(&mut self) -> SmallVec<[Signals; 1]> {
        self.targets
            .drain(..)
            .map(|t| {
                t.object
                    .dispatcher()
                    .signal_state()
                    .remove_observer(t.id);
                t.observer.observed()
            })
            .collect()
    }

    /// A handle that can end this wait from another thread.
    pub fn canceler(&self) -> WaitCanceler {
        WaitCanceler {
            event: self.event.clone(),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.finish_wait();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kapi::Rights;

    use super::*;
    use crate::object::event::EventDispatcher;

    fn event_handle() -> Handle {
        Handle::new(
            KernelObjectRef::Event(EventDispatcher::create()),
            Rights::EVENT_DEFAULT,
        )
    }

    #[test]
    fn already_satisfied_returns_without_parking() {
        let h = event_handle();
        h.object()
            .dispatcher()
            .user_signal(Signals::empty(), Signals::SIGNALED)
            .unwrap();
        let mut w = Waiter::new();
        assert!(w.begin_wait(&h, Signals::SIGNALED).unwrap());
        assert_eq!(w.wait(Deadline::INFINITE), (WaitStatus::Satisfied, Some(0)));
        assert!(w.finish_wait()[0].contains(Signals::SIGNALED));
    }

    #[test]
    fn immediate_deadline_times_out() {
        let h = event_handle();
        let mut w = Waiter::new();
        w.begin_wait(&h, Signals::SIGNALED).unwrap();
        assert_eq!(w.wait(Deadline::IMMEDIATE).0, WaitStatus::TimedOut);
        let observed = w.finish_wait();
        assert_eq!(observed[0], Signals::LAST_HANDLE);
        assert_eq!(h.object().dispatcher().signal_state().observer_count(), 0);
    }

    #[test]
    fn signal_from_another_thread_wakes() {
        crate::init_test_logging();
        let h = event_handle();
        let dup = h.duplicate(Rights::SAME_RIGHTS).unwrap();
        let mut w = Waiter::new();
        w.begin_wait(&h, Signals::USER_1).unwrap();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            dup.object()
                .dispatcher()
                .user_signal(Signals::empty(), Signals::USER_1)
                .unwrap();
        });
        assert_eq!(w.wait(Deadline::INFINITE).0, WaitStatus::Satisfied);
        t.join().unwrap();
    }

    #[test]
    fn cancel_is_idempotent() {
        let h = event_handle();
        let mut w = Waiter::new();
        w.begin_wait(&h, Signals::SIGNALED).unwrap();
        let c = w.canceler();
        assert!(c.cancel());
        assert!(!c.cancel());
        assert_eq!(w.wait(Deadline::INFINITE).0, WaitStatus::Canceled);
        // completing the event after cancellation changes nothing
        h.object()
            .dispatcher()
            .user_signal(Signals::empty(), Signals::SIGNALED)
            .unwrap();
        assert_eq!(w.wait(Deadline::INFINITE).0, WaitStatus::Canceled);
    }

    #[test]
    fn closing_the_handle_reports_handle_closed() {
        let h = event_handle();
        let keep = h.duplicate(Rights::SAME_RIGHTS).unwrap();
        let mut w = Waiter::new();
        w.begin_wait(&h, Signals::SIGNALED).unwrap();
        drop(h);
        assert_eq!(w.wait(Deadline::INFINITE), (WaitStatus::HandleClosed, Some(0)));
        assert!(w.finish_wait()[0].contains(Signals::HANDLE_CLOSED));
        drop(keep);
    }

    #[test]
    fn many_targets_report_the_first_satisfied() {
        let a = event_handle();
        let b = event_handle();
        let mut w = Waiter::new();
        w.begin_wait(&a, Signals::SIGNALED).unwrap();
        w.begin_wait(&b, Signals::USER_0).unwrap();
        b.object()
            .dispatcher()
            .user_signal(Signals::empty(), Signals::USER_0)
            .unwrap();
        assert_eq!(w.wait(Deadline::INFINITE), (WaitStatus::Satisfied, Some(1)));
        let observed = w.finish_wait();
        assert!(!observed[0].contains(Signals::USER_0));
        assert!(observed[1].contains(Signals::USER_0));
    }
}
