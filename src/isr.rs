//! ISR adaptor: the handler a platform's interrupt entry point calls into
//! for one of the four completion-status IRQ lines.
//!
//! Grounded on the reference kernel's `InterruptDispatcher::dispatch`: that
//! dispatcher fans a vector number out to a list of registered handlers and
//! logs anything it has no handler for. This adaptor is the single-device
//! analogue: there is only ever one "handler" (the scheduler this device
//! belongs to), so fan-out collapses to dispatching on the mask index
//! itself, with the same "log and move on" treatment for anything out of
//! range.

use alloc::sync::Arc;

use crate::exec_core::DeviceShared;
use crate::limits::MASK_BANKS;
use crate::scheduler::Scheduler;

/// Binds a device's shared ISR flags to the scheduler that services it.
/// A platform's real interrupt entry point (outside this crate's scope)
/// calls [`IsrAdaptor::handle_irq`] once per completion IRQ it receives,
/// then sends its own EOI the way it would for any other vector.
pub struct IsrAdaptor {
    shared: Arc<DeviceShared>,
    scheduler: Arc<Scheduler>,
}

impl IsrAdaptor {
    pub fn new(shared: Arc<DeviceShared>, scheduler: Arc<Scheduler>) -> Self {
        Self { shared, scheduler }
    }

    /// `mask_idx` identifies which of the four completion-status register
    /// banks fired (`STATUS_REG`, one bit per slot, four 32-bit words).
    /// Sets that bank's `sr` flag, marks the scheduler's interrupt-pending
    /// flag, and wakes the worker. Never touches the bitmaps or queued
    /// list directly, keeping the ISR and worker cleanly separated.
    pub fn handle_irq(&self, mask_idx: usize) {
        if mask_idx >= MASK_BANKS {
            log::warn!("ISR fired for out-of-range completion bank {mask_idx}");
            return;
        }
        self.shared.set_status_register(mask_idx);
        self.scheduler.mark_interrupt_pending();
    }
}
