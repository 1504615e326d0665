//! Device-side command-queue poller, ERT-on-device only: a second thread
//! that scans the doorbell BRAM for packets firmware deposited directly,
//! rather than the host calling `submit`. Mutually exclusive with
//! CQ-interrupt mode: `cq_interrupt` selects between the two, never both.
//!
//! Grounded on the same "spawn a thread, loop until stop, yield between
//! sweeps" shape the worker thread in [`crate::scheduler`] uses, scaled down
//! to one device and one doorbell region instead of the full command
//! lifecycle.

#![cfg(feature = "std")]

use alloc::sync::Arc;
use alloc::vec::Vec;
use std::thread::JoinHandle;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::client::ClientContext;
use crate::command::{Command, PacketStorage};
use crate::exec_core::ExecCore;
use crate::limits::CQ_BASE;
use crate::mmio::Mmio;
use crate::packet::{get_packet_size, PacketHeader, PacketState, PacketView};
use crate::scheduler::Scheduler;

/// Owns the polling thread for one device's doorbell region. Every packet
/// this thread discovers is attributed to `owner`, since there is no
/// general way to map a firmware-originated packet to a client; the caller
/// designates one peer context the poller serves.
pub struct DevicePoller {
    stop: Arc<AtomicBool>,
    handle: spin::Mutex<Option<JoinHandle<()>>>,
}

impl DevicePoller {
    /// Spawns the poller thread, unless `cq_interrupt` is already enabled on
    /// `exec` (the interrupt path supersedes polling); in that case this
    /// returns a poller whose `stop()` is a harmless no-op.
    pub fn start(
        device_id: usize,
        exec: Arc<spin::Mutex<ExecCore>>,
        mmio: Arc<dyn Mmio>,
        scheduler: Arc<Scheduler>,
        owner: Arc<ClientContext>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));

        if exec.lock().cq_interrupt {
            return Self { stop, handle: spin::Mutex::new(None) };
        }

        let thread_stop = stop.clone();
        let handle = std::thread::spawn(move || {
            poll_loop(device_id, exec, mmio, scheduler, owner, thread_stop);
        });

        Self { stop, handle: spin::Mutex::new(Some(handle)) }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn poll_loop(
    device_id: usize,
    exec: Arc<spin::Mutex<ExecCore>>,
    mmio: Arc<dyn Mmio>,
    scheduler: Arc<Scheduler>,
    owner: Arc<ClientContext>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Acquire) {
        if exec.lock().cq_interrupt {
            return;
        }

        let (num_slots, slot_size) = {
            let exec = exec.lock();
            (exec.num_slots, exec.slot_size)
        };

        for slot in 0..num_slots {
            if stop.load(Ordering::Acquire) {
                return;
            }
            if let Some(cmd) = try_claim_slot(device_id, &mmio, slot, slot_size, &owner, &scheduler) {
                owner.inc_outstanding();
                scheduler.enqueue_pending_cmd(cmd);
            }
        }

        std::thread::yield_now();
    }
}

/// Inspects one doorbell slot; if firmware has deposited a fresh packet
/// there (`state == New`), atomically transitions it to `Queued` in place,
/// copies it out into an owned heap buffer sized by [`get_packet_size`], and
/// returns a [`Command`] ready for the pending queue. Firmware-deposited
/// packets name no buffer-object dependencies, so this path never blocks on
/// a dependency chain, nor does it cross-link with host-submitted commands.
fn try_claim_slot(
    device_id: usize,
    mmio: &Arc<dyn Mmio>,
    slot: usize,
    slot_size: usize,
    owner: &Arc<ClientContext>,
    scheduler: &Arc<Scheduler>,
) -> Option<Command> {
    let slot_addr = CQ_BASE + slot * slot_size;
    let header_word = unsafe { mmio.read32(slot_addr) };
    let header = PacketHeader::from_bytes(header_word.to_be_bytes());

    if PacketState::try_from(header.state()) != Ok(PacketState::New) {
        return None;
    }

    let claimed = header.with_state(PacketState::Queued as u8);
    let claimed_word = u32::from_be_bytes(claimed.into_bytes());
    unsafe { mmio.write32(slot_addr, claimed_word) };

    let view_words = [claimed_word];
    let view = PacketView::new(&view_words);
    let opcode = view.opcode().ok()?;
    let size = get_packet_size(opcode, view.count());

    let mut words = Vec::with_capacity(size);
    words.push(claimed_word);
    for i in 1..size {
        words.push(unsafe { mmio.read32(slot_addr + 4 * i) });
    }

    let id = scheduler.next_command_id();
    let mut cmd = Command::new(id, device_id, owner.pid, PacketStorage::Owned(words), Vec::new(), None);
    cmd.cq_slot_idx = Some(slot);
    Some(cmd)
}
