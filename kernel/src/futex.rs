//! Futexes: wait queues keyed by the address of a 32-bit word.
//!
//! The value check in [FutexContext::wait] and the enqueue happen under the table lock, and so
//! does every wake, so a waker that changes the word and then wakes can never slip between a
//! waiter's check and its enqueue.
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
};

use crossbeam::sync::Parker;
use hashbrown::HashMap;
use kapi::Deadline;
use snafu::ensure;

use crate::{
    error::{BadStateSnafu, Error, InvalidArgsSnafu},
    object::waiter::{WaitEvent, WaitStatus},
};

/// One thread waiting on a futex.
struct FutexNode {
    event: WaitEvent,
    /// Address of the futex this node is currently queued on. Only changed with the table locked.
    key: AtomicUsize,
}

type FutexTable = HashMap<usize, VecDeque<Arc<FutexNode>>>;

/// The futexes of one process.
#[derive(Default)]
pub struct FutexContext {
    table: spin::Mutex<FutexTable>,
}

fn address_of(word: &AtomicU32) -> usize {
    word as *const AtomicU32 as usize
}

/// Pop and wake up to `count` nodes. Returns how many were actually woken.
fn wake_from(queue: &mut VecDeque<Arc<FutexNode>>, count: usize) -> usize {
    let mut woken = 0;
    while woken < count {
        match queue.pop_front() {
            // a node that already timed out can't be woken and doesn't count
            Some(node) => {
                if node.event.signal(WaitStatus::Satisfied, None) {
                    woken += 1;
                }
            }
            None => break,
        }
    }
    woken
}

impl FutexContext {
    /// Block until woken, if `word` still holds `expected`.
    ///
    /// Fails with `BadState` if the value differs and `TimedOut` if the deadline passes first.
    pub fn wait(&self, word: &AtomicU32, expected: u32, deadline: Deadline) -> Result<(), Error> {
        let addr = address_of(word);
        let parker = Parker::new();
        let node = Arc::new(FutexNode {
            event: WaitEvent::new(parker.unparker().clone()),
            key: AtomicUsize::new(addr),
        });
        {
            let mut table = self.table.lock();
            ensure!(word.load(Ordering::SeqCst) == expected, BadStateSnafu);
            table.entry(addr).or_default().push_back(node.clone());
        }
        log::trace!("futex wait on {addr:#x}");

        let (status, _) = node.event.block(&parker, deadline);
        match status {
            WaitStatus::Satisfied => Ok(()),
            status => {
                self.unlink(&node);
                status.into_result()
            }
        }
    }

    fn unlink(&self, node: &Arc<FutexNode>) {
        let mut table = self.table.lock();
        let addr = node.key.load(Ordering::Relaxed);
        if let Some(queue) = table.get_mut(&addr) {
            queue.retain(|n| !Arc::ptr_eq(n, node));
            if queue.is_empty() {
                table.remove(&addr);
            }
        }
    }

    /// Wake up to `count` threads waiting on `word`, oldest first. Returns the number woken.
    pub fn wake(&self, word: &AtomicU32, count: usize) -> usize {
        let addr = address_of(word);
        let mut table = self.table.lock();
        let Some(queue) = table.get_mut(&addr) else {
            return 0;
        };
        let woken = wake_from(queue, count);
        if queue.is_empty() {
            table.remove(&addr);
        }
        log::trace!("futex wake on {addr:#x}: {woken} woken");
        woken
    }

    /// If `word` holds `expected`, wake up to `wake_count` of its waiters and move up to
    /// `requeue_count` of the rest onto `requeue_word`. Returns the number woken.
    pub fn requeue(
        &self,
        word: &AtomicU32,
        wake_count: usize,
        expected: u32,
        requeue_word: &AtomicU32,
        requeue_count: usize,
    ) -> Result<usize, Error> {
        let addr = address_of(word);
        let target = address_of(requeue_word);
        ensure!(
            addr != target,
            InvalidArgsSnafu {
                reason: "cannot requeue a futex onto itself"
            }
        );

        let mut table = self.table.lock();
        ensure!(word.load(Ordering::SeqCst) == expected, BadStateSnafu);
        let Some(mut queue) = table.remove(&addr) else {
            return Ok(0);
        };
        let woken = wake_from(&mut queue, wake_count);

        let moved = requeue_count.min(queue.len());
        if moved > 0 {
            let dest = table.entry(target).or_default();
            for node in queue.drain(..moved) {
                node.key.store(target, Ordering::Relaxed);
                dest.push_back(node);
            }
        }
        if !queue.is_empty() {
            table.insert(addr, queue);
        }
        log::trace!("futex requeue {addr:#x} -> {target:#x}: {woken} woken, {moved} moved");
        Ok(woken)
    }

    /// Number of threads waiting on `word`.
    pub fn waiters(&self, word: &AtomicU32) -> usize {
        self.table
            .lock()
            .get(&address_of(word))
            .map_or(0, VecDeque::len)
    }
}
