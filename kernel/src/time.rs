//! The kernel monotonic clock.
//!
//! Time is measured in nanoseconds from the first time the clock is read.
use std::time::{Duration, Instant};

use kapi::Deadline;
use spin::Once;

static BOOT: Once<Instant> = Once::new();

fn boot() -> Instant {
    *BOOT.call_once(Instant::now)
}

/// Nanoseconds elapsed on the monotonic clock.
pub fn monotonic() -> u64 {
    u64::try_from(boot().elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// The deadline `timeout` from now.
pub fn deadline_after(timeout: Duration) -> Deadline {
    let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
    Deadline(monotonic().saturating_add(nanos))
}

/// Convert a deadline to an [Instant], or `None` if it never passes.
pub fn to_instant(deadline: Deadline) -> Option<Instant> {
    if deadline.is_infinite() {
        return None;
    }
    boot().checked_add(Duration::from_nanos(deadline.as_nanos()))
}
