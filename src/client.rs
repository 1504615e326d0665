//! Per-open-file client context.
//!
//! One `ClientContext` exists per process that has opened the device. It
//! tracks how many commands that client still has in flight, whether it has
//! asked to tear down, and a poll-readiness counter the host's `poll`/`epoll`
//! implementation watches.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Opaque client tag; the host picks what it means (pid, fd, whatever
/// identifies one open of the device).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

pub struct ClientContext {
    pub pid: ClientId,
    outstanding_execs: AtomicU32,
    /// Monotonically incrementing poll-readiness counter, bumped once per
    /// completion notification so a host-side `poll()` can detect "ready
    /// since I last checked" without losing wakeups to a boolean flag.
    trigger: AtomicU64,
    abort: AtomicBool,
}

impl ClientContext {
    pub fn new(pid: ClientId) -> Self {
        Self {
            pid,
            outstanding_execs: AtomicU32::new(0),
            trigger: AtomicU64::new(0),
            abort: AtomicBool::new(false),
        }
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding_execs.load(Ordering::Acquire)
    }

    pub fn inc_outstanding(&self) {
        self.outstanding_execs.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements outstanding, called once per command on Completed/Error/
    /// Abort regardless of whether the host was notified.
    pub fn dec_outstanding(&self) {
        self.outstanding_execs.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_aborting(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn trigger(&self) -> u64 {
        self.trigger.load(Ordering::Acquire)
    }

    /// Called by `notify_host` on every client attached to a device.
    pub fn bump_trigger(&self) {
        self.trigger.fetch_add(1, Ordering::AcqRel);
    }
}
