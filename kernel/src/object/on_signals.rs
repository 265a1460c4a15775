//! A [Future] that resolves when an object asserts some signals.
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::task::AtomicWaker;
use kapi::Signals;
use spin::Once;

use super::{
    signals::{
        CancelReason, ObserverFlags, ObserverId, Registration, StateObserver, PEER_DRIVEN,
    },
    Handle, KernelObjectRef,
};
use crate::error::Error;

struct TaskObserver {
    watched: Signals,
    outcome: Once<Result<Signals, Error>>,
    waker: AtomicWaker,
}

impl TaskObserver {
    fn complete(&self, result: Result<Signals, Error>) -> ObserverFlags {
        self.outcome.call_once(|| result);
        match self.waker.take() {
            Some(w) => {
                w.wake();
                ObserverFlags::REMOVE | ObserverFlags::WOKE_THREAD
            }
            None => ObserverFlags::REMOVE,
        }
    }

    fn check(&self, signals: Signals) -> ObserverFlags {
        if signals.intersects(self.watched) {
            self.complete(Ok(signals))
        } else if signals.contains(Signals::PEER_CLOSED) && self.watched.intersects(PEER_DRIVEN) {
            self.complete(Err(Error::PeerClosed))
        } else {
            ObserverFlags::empty()
        }
    }
}

impl StateObserver for TaskObserver {
    fn on_initialize(&self, initial: Signals, _count: u64) -> ObserverFlags {
        self.check(initial)
    }

    fn on_state_change(&self, new_state: Signals) -> ObserverFlags {
        self.check(new_state)
    }

    fn on_cancel(&self, _reason: CancelReason) -> ObserverFlags {
        self.complete(Err(Error::HandleClosed))
    }
}

/// Resolves to the signals of an object once any watched signal is asserted.
///
/// The observer is registered when the future is created, so signals asserted before the first
/// poll are not missed. Dropping the future unregisters it.
pub struct OnSignals {
    object: KernelObjectRef,
    observer: Arc<TaskObserver>,
    id: ObserverId,
}

impl OnSignals {
    pub(crate) fn new(handle: &Handle, watched: Signals) -> Result<OnSignals, Error> {
        let observer = Arc::new(TaskObserver {
            watched,
            outcome: Once::new(),
            waker: AtomicWaker::new(),
        });
        let (id, _) = handle.object().dispatcher().add_observer(Registration {
            observer: observer.clone(),
            handle: handle.id(),
            key: None,
        })?;
        Ok(OnSignals {
            object: handle.object().clone(),
            observer,
            id,
        })
    }
}

impl Future for OnSignals {
    type Output = Result<Signals, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(r) = self.observer.outcome.get() {
            return Poll::Ready(r.clone());
        }
        self.observer.waker.register(cx.waker());
        // the observer may have completed before the waker was stored
        match self.observer.outcome.get() {
            Some(r) => Poll::Ready(r.clone()),
            None => Poll::Pending,
        }
    }
}

impl Drop for OnSignals {
    fn drop(&mut self) {
        self.object
            .dispatcher()
            .signal_state()
            .remove_observer(self.id);
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use kapi::Rights;

    use super::*;
    use crate::object::event::EventDispatcher;

    #[test]
    fn resolves_when_signaled_from_another_thread() {
        let h = Handle::new(
            KernelObjectRef::Event(EventDispatcher::create()),
            Rights::EVENT_DEFAULT,
        );
        let fut = OnSignals::new(&h, Signals::SIGNALED).unwrap();
        let object = h.object().clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            object
                .dispatcher()
                .user_signal(Signals::empty(), Signals::SIGNALED)
                .unwrap();
        });
        assert!(block_on(fut).unwrap().contains(Signals::SIGNALED));
        t.join().unwrap();
    }

    #[test]
    fn dropping_unregisters() {
        let h = Handle::new(
            KernelObjectRef::Event(EventDispatcher::create()),
            Rights::EVENT_DEFAULT,
        );
        let fut = OnSignals::new(&h, Signals::SIGNALED).unwrap();
        assert_eq!(h.object().dispatcher().signal_state().observer_count(), 1);
        drop(fut);
        assert_eq!(h.object().dispatcher().signal_state().observer_count(), 0);
    }
}
