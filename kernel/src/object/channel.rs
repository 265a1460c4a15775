//! Channels: bidirectional message pipes with two endpoints.
//!
//! Both endpoints share one [Pipe], which owns both message queues and both signal states. An
//! endpoint never refers to its peer directly, so there is no reference cycle and either side can
//! be destroyed independently of the other.
//!
//! # Locking
//! The pipe lock guards both queues and whether each side is open. Every change to an endpoint's
//! signals that depends on the queues is made while holding it, which makes an enqueue and the
//! `READABLE` transition that goes with it a single atomic step for every observer.
use std::{collections::VecDeque, sync::Arc};

use kapi::{Koid, ObjectType, Signals};
use snafu::ensure;

use super::{
    next_koid,
    signals::{ObserverId, Registration, SignalState},
    Dispatcher, Handle, HandleCount, KernelObjectRef,
};
use crate::{
    config::ChannelLimits,
    error::{Error, InvalidArgsSnafu, PeerClosedSnafu},
};

/// A message: opaque bytes plus the handles being transferred with them.
#[derive(Debug, Default)]
pub struct Message {
    pub bytes: Vec<u8>,
    pub handles: Vec<Handle>,
}

/// Which endpoint of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// One value for each side of a pipe.
#[derive(Debug, Default)]
struct Sided<T> {
    left: T,
    right: T,
}

impl<T> Sided<T> {
    fn side(&self, side: Side) -> &T {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }
}

struct PipeState {
    /// Messages waiting to be read by each side.
    queues: Sided<VecDeque<Message>>,
    /// Whether each side still has an endpoint.
    open: Sided<bool>,
}

/// State shared by the two endpoints of a channel.
struct Pipe {
    state: spin::Mutex<PipeState>,
    signals: Sided<SignalState>,
    koids: Sided<Koid>,
    limits: ChannelLimits,
}

/// One endpoint of a channel.
pub struct ChannelDispatcher {
    side: Side,
    pipe: Arc<Pipe>,
    handles: HandleCount,
}

impl ChannelDispatcher {
    /// Create both endpoints of a new channel. Both start out writable.
    pub fn create(limits: ChannelLimits) -> (Arc<ChannelDispatcher>, Arc<ChannelDispatcher>) {
        let pipe = Arc::new(Pipe {
            state: spin::Mutex::new(PipeState {
                queues: Sided::default(),
                open: Sided {
                    left: true,
                    right: true,
                },
            }),
            signals: Sided {
                left: SignalState::new(Signals::WRITABLE),
                right: SignalState::new(Signals::WRITABLE),
            },
            koids: Sided {
                left: next_koid(),
                right: next_koid(),
            },
            limits,
        });
        log::debug!(
            "created channel {} <-> {}",
            pipe.koids.left,
            pipe.koids.right
        );
        let endpoint = |side| {
            Arc::new(ChannelDispatcher {
                side,
                pipe: pipe.clone(),
                handles: HandleCount::default(),
            })
        };
        (endpoint(Side::Left), endpoint(Side::Right))
    }

    /// Returns true if `other` is either endpoint of this channel.
    pub fn same_pipe(&self, other: &ChannelDispatcher) -> bool {
        Arc::ptr_eq(&self.pipe, &other.pipe)
    }

    fn signals(&self) -> &SignalState {
        self.pipe.signals.side(self.side)
    }

    /// Queue a message for the peer to read. Returns true if a thread was woken.
    ///
    /// On failure the message is handed back untouched so the caller can restore any handles it
    /// carries.
    pub fn write(&self, message: Message) -> Result<bool, (Error, Message)> {
        let limits = &self.pipe.limits;
        if message.bytes.len() > limits.max_message_bytes
            || message.handles.len() > limits.max_message_handles
        {
            return Err((Error::OutOfRange, message));
        }
        let sends_own_endpoint = message.handles.iter().any(|h| match h.object() {
            KernelObjectRef::Channel(c) => self.same_pipe(c),
            _ => false,
        });
        if sends_own_endpoint {
            return Err((Error::NotSupported, message));
        }

        let peer = self.side.opposite();
        let mut state = self.pipe.state.lock();
        if !*state.open.side(peer) {
            return Err((Error::PeerClosed, message));
        }
        let queue = state.queues.side_mut(peer);
        if queue.len() >= limits.max_pending_messages {
            return Err((Error::ShouldWait, message));
        }
        log::trace!(
            "channel {} -> {}: {} bytes, {} handles",
            self.koid(),
            self.related_koid(),
            message.bytes.len(),
            message.handles.len()
        );
        queue.push_back(message);
        Ok(self
            .pipe
            .signals
            .side(peer)
            .update_state(Signals::empty(), Signals::READABLE))
    }

    /// Take the oldest message queued for this endpoint.
    pub fn read(&self) -> Result<Message, Error> {
        self.read_bounded(usize::MAX, usize::MAX, false)
    }

    /// Take the oldest message queued for this endpoint if it fits in `max_bytes` and
    /// `max_handles`.
    ///
    /// A message that doesn't fit fails with `BufferTooSmall` and stays queued, unless
    /// `may_discard` is set, in which case it is dropped.
    pub fn read_bounded(
        &self,
        max_bytes: usize,
        max_handles: usize,
        may_discard: bool,
    ) -> Result<Message, Error> {
        self.read_admitted(max_bytes, max_handles, may_discard, |_| Ok(()))
            .map_err(|(e, _)| e)
    }

    /// Like [read_bounded](Self::read_bounded), but a message that fits is only taken once
    /// `admit` accepts the number of handles it carries. If `admit` fails the message stays
    /// queued.
    ///
    /// A discarded message is handed back with the error so the caller can drop it once its own
    /// locks are released.
    pub fn read_admitted(
        &self,
        max_bytes: usize,
        max_handles: usize,
        may_discard: bool,
        admit: impl FnOnce(usize) -> Result<(), Error>,
    ) -> Result<Message, (Error, Option<Message>)> {
        let peer = self.side.opposite();
        let mut state = self.pipe.state.lock();
        let peer_open = *state.open.side(peer);
        let queue = state.queues.side_mut(self.side);

        let (bytes, handles) = match queue.front() {
            Some(m) => (m.bytes.len(), m.handles.len()),
            None if peer_open => return Err((Error::ShouldWait, None)),
            None => return Err((Error::PeerClosed, None)),
        };
        let fits = bytes <= max_bytes && handles <= max_handles;
        if fits {
            admit(handles).map_err(|e| (e, None))?;
        } else if !may_discard {
            return Err((Error::BufferTooSmall { bytes, handles }, None));
        }

        let message = queue.pop_front();
        if queue.is_empty() {
            self.signals()
                .update_state(Signals::READABLE, Signals::empty());
        }
        drop(state);

        match message {
            Some(m) if fits => Ok(m),
            // dropped outside the lock, the handles it carries may destroy other objects
            discarded => Err((Error::BufferTooSmall { bytes, handles }, discarded)),
        }
    }

    /// Change user signals on the peer endpoint.
    pub fn signal_peer(&self, clear: Signals, set: Signals) -> Result<bool, Error> {
        ensure!(
            clear.is_user_settable(Signals::empty()) && set.is_user_settable(Signals::empty()),
            InvalidArgsSnafu {
                reason: "only user signals may be set on a peer"
            }
        );
        let peer = self.side.opposite();
        let state = self.pipe.state.lock();
        ensure!(*state.open.side(peer), PeerClosedSnafu);
        Ok(self.pipe.signals.side(peer).update_state(clear, set))
    }

    /// Number of messages waiting to be read from this endpoint.
    pub fn pending(&self) -> usize {
        self.pipe.state.lock().queues.side(self.side).len()
    }
}

impl Dispatcher for ChannelDispatcher {
    fn koid(&self) -> Koid {
        *self.pipe.koids.side(self.side)
    }

    fn related_koid(&self) -> Koid {
        *self.pipe.koids.side(self.side.opposite())
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::Channel
    }

    fn signal_state(&self) -> &SignalState {
        self.signals()
    }

    fn handle_count(&self) -> &HandleCount {
        &self.handles
    }

    fn add_observer(&self, registration: Registration) -> Result<(ObserverId, bool), Error> {
        let state = self.pipe.state.lock();
        let pending = state.queues.side(self.side).len() as u64;
        self.signals().add_observer(registration, pending)
    }

    fn user_signal(&self, clear: Signals, set: Signals) -> Result<bool, Error> {
        ensure!(
            clear.is_user_settable(Signals::empty()) && set.is_user_settable(Signals::empty()),
            InvalidArgsSnafu {
                reason: "signals may not be set by user space"
            }
        );
        let _state = self.pipe.state.lock();
        Ok(self.signals().update_state(clear, set))
    }

    fn on_zero_handles(&self) -> Vec<Handle> {
        let peer = self.side.opposite();
        let undelivered = {
            let mut state = self.pipe.state.lock();
            *state.open.side_mut(self.side) = false;
            self.signals().cancel_all();
            if *state.open.side(peer) {
                self.pipe
                    .signals
                    .side(peer)
                    .update_state(Signals::WRITABLE, Signals::PEER_CLOSED);
            }
            std::mem::take(state.queues.side_mut(self.side))
        };
        log::debug!(
            "channel endpoint {} closed, dropping {} undelivered messages",
            self.koid(),
            undelivered.len()
        );
        undelivered
            .into_iter()
            .flat_map(|message| message.handles)
            .collect()
    }
}
