//! API/integration tests for the kernel, driven only through the system calls a [Process] exposes.
//!
//! This library holds the helpers shared by the test suites under `tests/`.
use std::{sync::Arc, time::Duration};

use kapi::{Deadline, HandleValue, Signals};
use kernel::{KernelConfig, Process};

/// How long a test is willing to block before it is considered hung.
pub const HANG_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A process with the default configuration.
pub fn new_process() -> Arc<Process> {
    new_process_with(KernelConfig::default())
}

pub fn new_process_with(config: KernelConfig) -> Arc<Process> {
    init_logging();
    Arc::new(Process::new(Arc::new(config)))
}

/// Two processes connected by a channel. Returns each process with its endpoint.
pub fn connected_processes() -> ((Arc<Process>, HandleValue), (Arc<Process>, HandleValue)) {
    let a = new_process();
    let b = Arc::new(Process::new(Arc::new(a.config().clone())));
    let (a_end, to_move) = a.channel_create().expect("create channel");
    let b_end = a.transfer_handle(to_move, &b).expect("hand endpoint to b");
    log::debug!(
        "connected pid {} h{a_end} <-> pid {} h{b_end}",
        a.koid,
        b.koid
    );
    ((a, a_end), (b, b_end))
}

/// The deadline `ms` milliseconds from now.
pub fn after_ms(ms: u64) -> Deadline {
    kernel::time::deadline_after(Duration::from_millis(ms))
}

/// A deadline that only passes if the test has hung.
pub fn hang_deadline() -> Deadline {
    kernel::time::deadline_after(HANG_TIMEOUT)
}

/// Wait for any of `signals` on `handle`, failing the test if that doesn't happen.
pub fn wait_for(process: &Process, handle: HandleValue, signals: Signals) -> Signals {
    let outcome = process.object_wait_one(handle, signals, hang_deadline());
    assert_eq!(
        outcome.result,
        Ok(()),
        "waiting on h{handle} for {signals:?}, observed {:?}",
        outcome.observed
    );
    outcome.observed
}

/// Current signals of the object `handle` refers to.
pub fn signals_of(process: &Process, handle: HandleValue) -> Signals {
    process
        .object_get_info(handle)
        .expect("get object info")
        .signals
}

/// Give another thread time to block. Tests never depend on this for correctness, only for
/// exercising the already-blocked path rather than the already-satisfied one.
pub fn let_other_threads_block() {
    std::thread::sleep(Duration::from_millis(50));
}
