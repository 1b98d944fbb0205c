//! Fork detection.
//!
//! The client's fds, event registrations, and outstanding tags are
//! meaningless in a forked child. Every public API entry compares the pid
//! recorded at first use against the current one and refuses to act after
//! a mismatch.

use std::sync::atomic::{AtomicI32, Ordering};

static RECORDED_PID: AtomicI32 = AtomicI32::new(0);

/// Record the current pid. Idempotent; only the first call stores.
pub fn init() {
    let pid = nix::unistd::getpid().as_raw();
    let _ = RECORDED_PID.compare_exchange(0, pid, Ordering::SeqCst, Ordering::SeqCst);
}

/// Whether the process has forked since [`init`].
pub fn forked() -> bool {
    let recorded = RECORDED_PID.load(Ordering::SeqCst);
    recorded != 0 && recorded != nix::unistd::getpid().as_raw()
}
