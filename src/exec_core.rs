//! Per-device scheduler state: CQ geometry, CU address map, slot/CU
//! bitmaps, the submitted-slot table, the installed dispatch back-end, and
//! the ISR status-register flags the worker consumes.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicBool, Ordering};
use log::{trace, warn};

use crate::bitmap::Bitmask;
use crate::client::ClientContext;
use crate::command::{Command, CommandId};
use crate::dispatch::{DispatchBackend, QueryOutcome};
use crate::error::ExecCoreError;
use crate::client::ClientId;
use crate::limits::{CQ_BASE, CQ_SIZE, DEFAULT_CQ_SLOTS, MASK_BANKS, MAX_CQ_SLOTS, MAX_CUS, STATUS_REG};
use crate::mmio::Mmio;
use crate::packet::{PacketState, PacketView};

bitflags! {
    /// `CONFIGURE` payload's feature word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        const POLLING = 1 << 0;
        const CQ_INT  = 1 << 1;
        const CU_DMA  = 1 << 2;
        const CU_ISR  = 1 << 3;
        const DSA52   = 1 << 4;
        const CDMA    = 1 << 5;
        const ERT     = 1 << 6;
    }
}

/// Facts about the device that live outside the packet ABI: whether
/// firmware/feature-ROM makes ERT available at all, and the MMIO address of
/// an optional CDMA engine. Out of scope for this crate to discover (device
/// probing is a platform concern); the host passes them into `configure`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceCaps {
    pub ert_available: bool,
    pub cdma_addr: Option<usize>,
}

pub struct ExecCore {
    pub num_slots: usize,
    pub num_cus: usize,
    pub cu_shift: u32,
    pub cu_base_addr: usize,
    pub polling_mode: bool,
    pub cq_interrupt: bool,
    pub configured: bool,
    pub num_slot_masks: usize,
    pub num_cu_masks: usize,
    pub slot_size: usize,

    pub slots: Bitmask,
    pub cus: Bitmask,
    pub submitted_cmds: Vec<Option<CommandId>>,
    pub cu_addr_map: Vec<usize>,

    /// Per-sweep scratch, reset by [`ExecCore::begin_sweep`]: caches a
    /// mask's completion bits for the rest of that sweep so that several
    /// commands sharing one status-register mask all see the same ISR
    /// event instead of only the first one to be queried.
    mask_cache: [Option<u32>; MASK_BANKS],

    pub mmio: Arc<dyn Mmio>,
    pub backend: DispatchBackend,

    clients: spin::Mutex<Vec<Arc<ClientContext>>>,

    /// `sr*`/needs-reset flags, split out of the worker-exclusive state
    /// above so the ISR can touch them without contending for whatever lock
    /// guards the rest of this `ExecCore`: the ISR never touches the
    /// bitmaps, only the sr* flags.
    pub shared: Arc<DeviceShared>,
}

/// Lock-free state shared between the worker and the ISR adaptor.
#[derive(Default)]
pub struct DeviceShared {
    sr: [AtomicBool; MASK_BANKS],
    needs_reset: AtomicBool,
}

impl DeviceShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Recorded by the ISR adaptor when completion IRQ `mask_idx`
    /// fires. Release ordering pairs with the acquire-swap in
    /// `ExecCore::ert_status_bits`.
    pub fn set_status_register(&self, mask_idx: usize) {
        if mask_idx < MASK_BANKS {
            self.sr[mask_idx].store(true, Ordering::Release);
        } else {
            warn!("ISR fired for out-of-range status register bank {mask_idx}");
        }
    }

    pub fn needs_reset(&self) -> bool {
        self.needs_reset.load(Ordering::Acquire)
    }

    pub fn mark_needs_reset(&self) {
        self.needs_reset.store(true, Ordering::Release);
    }
}

impl ExecCore {
    pub fn new(mmio: Arc<dyn Mmio>) -> Self {
        let mut core = Self {
            num_slots: 0,
            num_cus: 0,
            cu_shift: 0,
            cu_base_addr: 0,
            polling_mode: true,
            cq_interrupt: false,
            configured: false,
            num_slot_masks: 0,
            num_cu_masks: 0,
            slot_size: 0,
            slots: Bitmask::new(),
            cus: Bitmask::new(),
            submitted_cmds: Vec::new(),
            cu_addr_map: Vec::new(),
            mask_cache: [None; MASK_BANKS],
            mmio,
            backend: DispatchBackend::Software,
            clients: spin::Mutex::new(Vec::new()),
            shared: DeviceShared::new(),
        };
        core.reset();
        core
    }

    /// Default CQ geometry, zeroed bitmaps, software back-end, polling
    /// mode, not configured. Also the recovery path after a device is
    /// flagged stuck; idempotent.
    pub fn reset(&mut self) {
        self.num_slots = DEFAULT_CQ_SLOTS;
        self.num_cus = 0;
        self.cu_shift = 0;
        self.cu_base_addr = 0;
        self.polling_mode = true;
        self.cq_interrupt = false;
        self.configured = false;
        self.num_slot_masks = 1;
        self.num_cu_masks = 0;
        self.slot_size = 0;
        self.slots = Bitmask::new();
        self.cus = Bitmask::new();
        self.submitted_cmds = vec_of_none(DEFAULT_CQ_SLOTS);
        self.cu_addr_map = Vec::new();
        self.mask_cache = [None; MASK_BANKS];
        self.backend = DispatchBackend::Software;
    }

    /// `words` is the full packet (header included) so
    /// capability bits can be stamped back into the features word for
    /// firmware to read, matching the original in-place packet mutation.
    pub fn configure(&mut self, words: &mut [u32], caps: DeviceCaps) -> Result<(), ExecCoreError> {
        if self.configured {
            return Err(ExecCoreError::AlreadyConfigured);
        }

        let (count, slot_size, num_cus, cu_shift, cu_base_addr, features) = {
            let view = PacketView::new(words);
            let count = view.count();
            if count < 5 {
                return Err(ExecCoreError::BadPacket);
            }
            let payload = view.payload();
            let num_cus = payload[1] as usize;
            (
                count,
                payload[0] as usize,
                num_cus,
                payload[2],
                payload[3] as usize,
                Features::from_bits_truncate(payload[4]),
            )
        };

        if count != 5 + num_cus || num_cus > MAX_CUS || slot_size == 0 {
            return Err(ExecCoreError::BadPacket);
        }

        let num_slots = CQ_SIZE / slot_size;
        if num_slots > MAX_CQ_SLOTS {
            return Err(ExecCoreError::BadPacket);
        }

        // Payload word index `5 + i` is header-relative word `6 + i`
        // (header word 0, then the four fixed words, then `features`).
        let mut cu_addr_map: Vec<usize> = words[6..6 + num_cus].iter().map(|a| *a as usize).collect();

        let mut effective_num_cus = num_cus;
        if let Some(cdma_addr) = caps.cdma_addr {
            cu_addr_map.push(cdma_addr);
            effective_num_cus += 1;
        }

        self.num_slots = num_slots;
        self.slot_size = slot_size;
        self.num_slot_masks = div_ceil(self.num_slots, 32);
        self.num_cus = effective_num_cus;
        self.num_cu_masks = div_ceil(effective_num_cus, 32);
        self.cu_shift = cu_shift;
        self.cu_base_addr = cu_base_addr;
        self.cu_addr_map = cu_addr_map;
        self.submitted_cmds = vec_of_none(self.num_slots);

        let mut stamped = features;
        if caps.ert_available && features.contains(Features::ERT) {
            self.backend = DispatchBackend::Ert;
            self.polling_mode = features.contains(Features::POLLING);
            self.cq_interrupt = features.contains(Features::CQ_INT);
            if caps.cdma_addr.is_some() {
                stamped |= Features::CDMA;
            }
            stamped |= Features::DSA52;
        } else {
            self.backend = DispatchBackend::Software;
            self.polling_mode = true;
            self.cq_interrupt = false;
        }

        // Word index 5 (header-relative) is the features word; stamped back
        // so firmware can read the capability bits the driver decided on.
        words[5] = stamped.bits();

        self.configured = true;
        trace!(
            "device configured: {} slots, {} cus, backend={:?}",
            self.num_slots, self.num_cus, self.backend
        );
        Ok(())
    }

    /// Runs every `(addr, val)` pair in a `WRITE`
    /// packet against MMIO. The original driver's failure path is dead code
    /// (the underlying write helper always reports success); preserved as
    /// a `Result` return for the worker's uniform error handling, not
    /// because a failure can currently occur here.
    pub fn execute_write(&mut self, view: PacketView<'_>) -> Result<(), ExecCoreError> {
        for (addr, val) in view.write_pairs() {
            unsafe { self.mmio.write32(addr as usize, val) };
        }
        Ok(())
    }

    pub fn submit(&mut self, cmd: &mut Command) -> Result<(), ExecCoreError> {
        self.backend.submit(self, cmd)
    }

    pub fn query(&mut self, cmd: &mut Command) -> Result<QueryOutcome, ExecCoreError> {
        self.backend.query(self, cmd)
    }

    /// Resets per-sweep completion-register scratch; call once before
    /// iterating the queued list for a device in one worker pass.
    pub fn begin_sweep(&mut self) {
        self.mask_cache = [None; MASK_BANKS];
    }

    /// Gated, cached completion-status register read for the ERT backend.
    /// Returns `None` when neither polling mode nor a fresh ISR event
    /// justifies a read this sweep, meaning the command stays `Running`.
    pub(crate) fn ert_status_bits(&mut self, mask_idx: usize) -> Option<u32> {
        if let Some(bits) = self.mask_cache[mask_idx] {
            return Some(bits);
        }
        let should_check = self.polling_mode || self.shared.sr[mask_idx].swap(false, Ordering::AcqRel);
        if !should_check {
            return None;
        }
        let bits = unsafe { self.mmio.read32(STATUS_REG + (mask_idx << 2)) };
        self.mask_cache[mask_idx] = Some(bits);
        Some(bits)
    }

    /// Releases the slot a command held while Running. CU release (software
    /// mode) happens inside `dispatch::software::query` at the moment
    /// `AP_DONE` is observed, so it is not repeated here.
    pub fn retire(&mut self, cmd: &Command) {
        if let Some(slot) = cmd.slot {
            self.slots.release(slot);
            if slot < self.submitted_cmds.len() {
                self.submitted_cmds[slot] = None;
            }
        }
    }

    pub fn attach_client(&self, client: Arc<ClientContext>) {
        self.clients.lock().push(client);
    }

    pub fn detach_client(&self, pid: ClientId) {
        self.clients.lock().retain(|c| c.pid != pid);
    }

    pub fn find_client(&self, pid: ClientId) -> Option<Arc<ClientContext>> {
        self.clients.lock().iter().find(|c| c.pid == pid).cloned()
    }

    /// Software mode host notification: bump every attached client's
    /// poll-readiness trigger.
    pub fn notify_all_clients(&self) {
        for client in self.clients.lock().iter() {
            client.bump_trigger();
        }
    }

    /// ERT-on-device variant of host notification: the doorbell poller
    /// delivered this command from a CQ slot rather than the host
    /// writing it directly, so completion is echoed back into that same
    /// slot's state nibble instead of (only) bumping client triggers.
    pub fn echo_doorbell_complete(&self, slot: usize) {
        let addr = CQ_BASE + slot * self.slot_size;
        let header = unsafe { self.mmio.read32(addr) };
        let updated = (header & !0xF) | (PacketState::Completed as u32 & 0xF);
        unsafe { self.mmio.write32(addr, updated) };
    }
}

fn vec_of_none(n: usize) -> Vec<Option<CommandId>> {
    let mut v = Vec::with_capacity(n);
    v.resize_with(n, || None);
    v
}

fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}
