//! The inter-process communication core of the kernel.
//!
//! Kernel objects ([channels][object::channel], [events][object::event] and
//! [ports][object::port]) expose their state as [signals][kapi::Signals]. Threads block on those
//! signals through a [Waiter][object::waiter::Waiter], asynchronous consumers register observers
//! that post packets to a port, and [processes][Process] refer to all of it through handles.

pub mod config;
pub mod error;
pub mod futex;
pub mod object;
pub mod process;
pub mod time;

pub use config::KernelConfig;
pub use error::Error;
pub use process::Process;

/// Install a logger for unit tests. Safe to call from every test.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
