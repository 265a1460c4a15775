use std::{sync::Arc, time::Instant};

use api_tests::{after_ms, hang_deadline, let_other_threads_block, new_process, wait_for};
use futures::executor::block_on;
use kapi::{wait::WaitItem, Deadline, ErrorCode, Rights, Signals};
use kernel::Error;

#[test]
fn already_satisfied_returns_immediately() {
    let p = new_process();
    let (e1, e2) = p.channel_create().unwrap();
    p.channel_write(e1, b"ready", &[]).unwrap();

    let outcome = p.object_wait_one(e2, Signals::READABLE, Deadline::IMMEDIATE);
    assert_eq!(outcome.result, Ok(()));
    assert!(outcome.observed.contains(Signals::READABLE | Signals::WRITABLE));
}

#[test]
fn timeouts() {
    let p = new_process();
    let (_e1, e2) = p.channel_create().unwrap();

    let outcome = p.object_wait_one(e2, Signals::READABLE, Deadline::IMMEDIATE);
    assert_eq!(outcome.result, Err(Error::TimedOut));
    assert_eq!(outcome.observed, Signals::WRITABLE | Signals::LAST_HANDLE);

    let start = Instant::now();
    let outcome = p.object_wait_one(e2, Signals::READABLE, after_ms(30));
    assert_eq!(outcome.result, Err(Error::TimedOut));
    assert!(start.elapsed().as_millis() >= 25);
}

#[test]
fn writer_wakes_a_blocked_reader() {
    let p = new_process();
    let (e1, e2) = p.channel_create().unwrap();

    let reader = {
        let p = p.clone();
        std::thread::spawn(move || {
            wait_for(&p, e2, Signals::READABLE);
            p.channel_read(e2).unwrap().0
        })
    };
    let_other_threads_block();
    p.channel_write(e1, b"wake up", &[]).unwrap();
    assert_eq!(reader.join().unwrap(), b"wake up");
}

#[test]
fn peer_close_wakes_a_blocked_reader() {
    let p = new_process();
    let (e1, e2) = p.channel_create().unwrap();

    let reader = {
        let p = p.clone();
        std::thread::spawn(move || p.object_wait_one(e2, Signals::READABLE, hang_deadline()))
    };
    let_other_threads_block();
    p.handle_close(e1).unwrap();

    let outcome = reader.join().unwrap();
    assert_eq!(outcome.result, Err(Error::PeerClosed));
    assert!(outcome.observed.contains(Signals::PEER_CLOSED));
    assert!(!outcome.observed.contains(Signals::READABLE));
    assert_eq!(p.channel_read(e2), Err(Error::PeerClosed));
}

#[test]
fn observed_signals_accumulate_over_the_wait() {
    let p = new_process();
    let (e1, e2) = p.channel_create().unwrap();

    let pending = p
        .object_wait_one_cancelable(e2, Signals::PEER_CLOSED)
        .unwrap();
    p.channel_write(e1, b"data", &[]).unwrap();
    p.channel_read(e2).unwrap();
    p.handle_close(e1).unwrap();
    let outcome = pending.wait(hang_deadline());

    // readable came and went before the peer closed, and both are reported
    assert_eq!(outcome.result, Ok(()));
    assert!(outcome
        .observed
        .contains(Signals::READABLE | Signals::PEER_CLOSED));
}

#[test]
fn user_signal_waits_outlive_the_peer() {
    let p = new_process();
    let (e1, e2) = p.channel_create().unwrap();
    let pending = p.object_wait_one_cancelable(e2, Signals::USER_0).unwrap();
    let canceler = pending.canceler();
    p.handle_close(e1).unwrap();

    // the endpoint can still signal itself, so the wait is not over
    let outcome = p.object_wait_one(e2, Signals::USER_0, Deadline::IMMEDIATE);
    assert_eq!(outcome.result, Err(Error::TimedOut));
    assert!(outcome.observed.contains(Signals::PEER_CLOSED));
    assert!(canceler.cancel());
    assert_eq!(pending.wait(Deadline::IMMEDIATE).result, Err(Error::Canceled));

    p.object_signal(e2, Signals::empty(), Signals::USER_0).unwrap();
    wait_for(&p, e2, Signals::USER_0);
}

#[test]
fn cancel_from_another_thread() {
    let p = new_process();
    let ev = p.event_create().unwrap();
    let pending = p.object_wait_one_cancelable(ev, Signals::SIGNALED).unwrap();
    let canceler = pending.canceler();

    let t = std::thread::spawn(move || {
        let_other_threads_block();
        let first = canceler.cancel();
        let second = canceler.cancel();
        (first, second)
    });
    let outcome = pending.wait(Deadline::INFINITE);
    assert_eq!(outcome.result, Err(Error::Canceled));
    assert_eq!(t.join().unwrap(), (true, false));
}

#[test]
fn cancel_after_completion_does_nothing() {
    let p = new_process();
    let ev = p.event_create().unwrap();
    p.object_signal(ev, Signals::empty(), Signals::SIGNALED)
        .unwrap();
    let pending = p.object_wait_one_cancelable(ev, Signals::SIGNALED).unwrap();
    let canceler = pending.canceler();
    assert!(!canceler.cancel());
    assert_eq!(pending.wait(Deadline::INFINITE).result, Ok(()));
    assert!(!canceler.cancel());
}

#[test]
fn closing_the_waited_handle() {
    let p = new_process();
    let ev = p.event_create().unwrap();
    let other = p.handle_duplicate(ev, Rights::SAME_RIGHTS).unwrap();

    let waiter = {
        let p = p.clone();
        std::thread::spawn(move || p.object_wait_one(ev, Signals::SIGNALED, hang_deadline()))
    };
    let_other_threads_block();
    p.handle_close(ev).unwrap();

    let outcome = waiter.join().unwrap();
    match outcome.result {
        // the close beat the wait registration
        Err(Error::BadHandle { .. }) => {}
        Err(e) => {
            assert_eq!(e, Error::HandleClosed);
            assert_eq!(e.as_code(), ErrorCode::Canceled);
            assert!(outcome.observed.contains(Signals::HANDLE_CLOSED));
        }
        Ok(()) => panic!("wait was satisfied without a signal"),
    }

    // the object itself lives on through the other handle
    p.object_signal(other, Signals::empty(), Signals::SIGNALED)
        .unwrap();
    wait_for(&p, other, Signals::SIGNALED);
}

#[test]
fn closing_the_waited_handle_is_deterministic_with_a_pending_wait() {
    let p = new_process();
    let ev = p.event_create().unwrap();
    let pending = p.object_wait_one_cancelable(ev, Signals::SIGNALED).unwrap();
    p.handle_close(ev).unwrap();
    let outcome = pending.wait(Deadline::INFINITE);
    assert_eq!(outcome.result, Err(Error::HandleClosed));
    assert!(outcome.observed.contains(Signals::HANDLE_CLOSED));
}

#[test]
fn wait_many_reports_which_item() {
    let p = new_process();
    let events: Vec<_> = (0..3).map(|_| p.event_create().unwrap()).collect();
    let signaler = {
        let p = p.clone();
        let target = events[1];
        std::thread::spawn(move || {
            let_other_threads_block();
            p.object_signal(target, Signals::empty(), Signals::USER_4)
                .unwrap();
        })
    };

    let mut items: Vec<_> = events
        .iter()
        .map(|&e| WaitItem::new(e, Signals::SIGNALED | Signals::USER_4))
        .collect();
    assert_eq!(p.object_wait_many(&mut items, hang_deadline()), Ok(1));
    signaler.join().unwrap();
    assert!(items[1].pending.contains(Signals::USER_4));
    assert!(!items[0].pending.contains(Signals::USER_4));
    assert!(!items[2].pending.contains(Signals::USER_4));
}

#[test]
fn wait_many_errors() {
    let p = new_process();
    let ev = p.event_create().unwrap();

    let mut too_many = vec![WaitItem::new(ev, Signals::SIGNALED); kapi::wait::MAX_WAIT_MANY + 1];
    assert_eq!(
        p.object_wait_many(&mut too_many, Deadline::IMMEDIATE),
        Err(Error::OutOfRange)
    );

    let mut bad = [
        WaitItem::new(ev, Signals::SIGNALED),
        WaitItem::new(12345, Signals::SIGNALED),
    ];
    assert_eq!(
        p.object_wait_many(&mut bad, Deadline::IMMEDIATE),
        Err(Error::BadHandle { handle: 12345 })
    );

    let mut none = [WaitItem::new(ev, Signals::SIGNALED)];
    assert_eq!(
        p.object_wait_many(&mut none, Deadline::IMMEDIATE),
        Err(Error::TimedOut)
    );
    assert_eq!(none[0].pending, Signals::LAST_HANDLE);
}

#[test]
fn waiting_needs_the_wait_right() {
    let p = new_process();
    let ev = p.event_create().unwrap();
    let no_wait = p.handle_replace(ev, Rights::SIGNAL).unwrap();
    assert_eq!(
        p.object_wait_one(no_wait, Signals::SIGNALED, Deadline::IMMEDIATE)
            .result,
        Err(Error::AccessDenied)
    );
}

#[test]
fn events_accept_only_user_and_signaled_bits() {
    let p = new_process();
    let ev = p.event_create().unwrap();
    p.object_signal(ev, Signals::empty(), Signals::SIGNALED | Signals::USER_7)
        .unwrap();
    assert!(matches!(
        p.object_signal(ev, Signals::empty(), Signals::READABLE),
        Err(Error::InvalidArgs { .. })
    ));
    p.object_signal(ev, Signals::SIGNALED, Signals::empty())
        .unwrap();
    let observed = wait_for(&p, ev, Signals::USER_7);
    assert!(!observed.contains(Signals::SIGNALED));
}

#[test]
fn no_lost_wakeups_under_contention() {
    let p = new_process();
    let (e1, e2) = p.channel_create().unwrap();
    const ROUNDS: u32 = 500;

    let reader = {
        let p = p.clone();
        std::thread::spawn(move || {
            for i in 0..ROUNDS {
                loop {
                    match p.channel_read(e2) {
                        Ok((bytes, _)) => {
                            assert_eq!(bytes, i.to_le_bytes());
                            break;
                        }
                        Err(Error::ShouldWait) => {
                            wait_for(&p, e2, Signals::READABLE);
                        }
                        Err(e) => panic!("read failed: {e}"),
                    }
                }
            }
        })
    };
    for i in 0..ROUNDS {
        p.channel_write(e1, &i.to_le_bytes(), &[]).unwrap();
        if i % 7 == 0 {
            std::thread::yield_now();
        }
    }
    reader.join().unwrap();
}

#[test]
fn signals_future() {
    let p = new_process();
    let (e1, e2) = p.channel_create().unwrap();
    let readable = p.wait_signals(e2, Signals::READABLE).unwrap();
    let writer = {
        let p = Arc::clone(&p);
        std::thread::spawn(move || {
            let_other_threads_block();
            p.channel_write(e1, b"async", &[]).unwrap();
        })
    };
    let observed = block_on(readable).unwrap();
    assert!(observed.contains(Signals::READABLE));
    writer.join().unwrap();

    p.channel_read(e2).unwrap();
    let closed = p.wait_signals(e2, Signals::READABLE).unwrap();
    p.handle_close(e1).unwrap();
    assert_eq!(block_on(closed), Err(Error::PeerClosed));
}
