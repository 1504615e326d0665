//! A condvar-backed wait queue the worker sleeps on, built the same way
//! the reference kernel's `WaitQueue` pairs a blocking primitive with a
//! predicate: block until `pred()` holds, re-checking it after every wake.
//!
//! This crate runs on a host rather than bare metal, so the primitive is
//! `std::sync::Condvar` instead of a kernel thread-block/deblock pair. The
//! producers that wake the worker (new submissions, the ISR, the poll
//! counter) flip plain atomics without taking the condvar's mutex, so a
//! wakeup can in principle be missed between a producer's atomic store and
//! the worker parking; bounding every wait with a short timeout turns a
//! missed wakeup into bounded extra latency instead of a stall.

#![cfg(feature = "std")]

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Upper bound on how long the worker can sleep before re-checking its wake
/// predicate even without an explicit notification.
const MAX_WAIT: Duration = Duration::from_millis(50);

pub struct WaitQueue {
    gate: Mutex<()>,
    condvar: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self { gate: Mutex::new(()), condvar: Condvar::new() }
    }

    /// Blocks until `pred()` returns true, polling at least every
    /// [`MAX_WAIT`] regardless of whether `notify_one`/`notify_all` fired.
    pub fn wait_until<F: FnMut() -> bool>(&self, mut pred: F) {
        if pred() {
            return;
        }
        let guard = self.gate.lock().unwrap();
        let _ = self
            .condvar
            .wait_timeout_while(guard, MAX_WAIT, |_| !pred())
            .unwrap();
    }

    pub fn notify_one(&self) {
        let _guard = self.gate.lock().unwrap();
        self.condvar.notify_one();
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
