//! Events: objects whose only state is their signals.
use std::sync::Arc;

use kapi::{Koid, ObjectType, Signals};

use super::{next_koid, signals::SignalState, Dispatcher, Handle, HandleCount};

/// An object with no state besides its signals. `SIGNALED` and the user signals may be set from
/// user space.
pub struct EventDispatcher {
    koid: Koid,
    signals: SignalState,
    handles: HandleCount,
}

impl EventDispatcher {
    /// A new event with no signals asserted.
    pub fn create() -> Arc<EventDispatcher> {
        Arc::new(EventDispatcher {
            koid: next_koid(),
            signals: SignalState::new(Signals::empty()),
            handles: HandleCount::default(),
        })
    }
}

impl Dispatcher for EventDispatcher {
    fn koid(&self) -> Koid {
        self.koid
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::Event
    }

    fn signal_state(&self) -> &SignalState {
        &self.signals
    }

    fn handle_count(&self) -> &HandleCount {
        &self.handles
    }

    fn allowed_user_signals(&self) -> Signals {
        Signals::SIGNALED
    }

    fn on_zero_handles(&self) -> Vec<Handle> {
        self.signals.cancel_all();
        Vec::new()
    }
}
