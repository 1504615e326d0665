//! The scheduler worker: the single cooperative loop that drains the
//! pending queue, admits commands, resolves dependency chains, and drives
//! every device's state machine forward one sweep at a time.
//!
//! Split the way the teacher's `process::scheduler::Scheduler` separates
//! "state mutated only by the scheduler" (`ReadyState`) from state shared
//! with producers (`sleep_list`, `join_map`): [`WorkerState`] is the
//! queued-commands list, touched only by whichever thread is currently
//! sweeping, while [`Scheduler`] itself holds the producer-visible pending
//! queue, counters and wait primitive behind their own locks.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use log::{trace, warn};

use crate::client::{ClientContext, ClientId};
use crate::command::{Command, CommandId, CommandIdGen, CommandPool, CommandState, PacketStorage};
use crate::dispatch::QueryOutcome;
use crate::error::ExecCoreError;
use crate::exec_core::{DeviceCaps, DeviceShared, ExecCore};
use crate::limits::MAX_SCHED_LOOP;
use crate::packet::Opcode;

#[cfg(feature = "std")]
use crate::sync::WaitQueue;

/// Queued-commands list plus the per-sweep yield counter, owned entirely by
/// whichever thread is currently driving the scheduler: the scheduler's
/// internal queued list is accessed only by the worker and requires no
/// lock. Ordered by [`CommandId`], which, since ids are handed out
/// monotonically, also preserves submission order, giving FIFO iteration
/// for free instead of needing a separate insertion-order index.
pub struct WorkerState {
    queued: BTreeMap<CommandId, Command>,
    loop_count: usize,
}

impl WorkerState {
    pub fn new() -> Self {
        Self { queued: BTreeMap::new(), loop_count: 0 }
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Read-only view over the commands currently queued, for hosts and
    /// integration tests driving [`Scheduler::sweep`] cooperatively that
    /// need to inspect state/slot/cu without reaching into worker-private
    /// fields.
    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.queued.values()
    }

    pub fn get(&self, id: CommandId) -> Option<&Command> {
        self.queued.get(&id)
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide scheduler singleton: one instance, one worker, serving
/// every device registered with it at construction (multi-device
/// distribution across *schedulers* is the Non-goal; one worker serving
/// several devices is not).
pub struct Scheduler {
    devices: Vec<Arc<spin::Mutex<ExecCore>>>,
    device_shared: Vec<Arc<DeviceShared>>,
    device_caps: Vec<DeviceCaps>,

    pool: CommandPool,
    id_gen: CommandIdGen,

    pending: spin::Mutex<VecDeque<Command>>,
    num_pending: AtomicUsize,
    interrupt_pending: AtomicBool,
    poll_count: AtomicUsize,
    stop: AtomicBool,
    error: AtomicBool,

    #[cfg(feature = "std")]
    wait: WaitQueue,
    #[cfg(feature = "std")]
    worker: spin::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(devices: Vec<(Arc<spin::Mutex<ExecCore>>, DeviceCaps)>) -> Arc<Self> {
        let device_shared = devices.iter().map(|(exec, _)| exec.lock().shared.clone()).collect();
        let device_caps = devices.iter().map(|(_, caps)| *caps).collect();
        let devices: Vec<_> = devices.into_iter().map(|(exec, _)| exec).collect();

        Arc::new(Self {
            devices,
            device_shared,
            device_caps,
            pool: CommandPool::new(),
            id_gen: CommandIdGen::new(),
            pending: spin::Mutex::new(VecDeque::new()),
            num_pending: AtomicUsize::new(0),
            interrupt_pending: AtomicBool::new(false),
            poll_count: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            error: AtomicBool::new(false),
            #[cfg(feature = "std")]
            wait: WaitQueue::new(),
            #[cfg(feature = "std")]
            worker: spin::Mutex::new(None),
        })
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, device_id: usize) -> Option<Arc<spin::Mutex<ExecCore>>> {
        self.devices.get(device_id).cloned()
    }

    pub fn device_shared(&self, device_id: usize) -> Option<Arc<DeviceShared>> {
        self.device_shared.get(device_id).cloned()
    }

    pub fn has_errored(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    fn fatal(&self, msg: &str) {
        warn!("scheduler fault: {msg}");
        self.error.store(true, Ordering::Release);
    }

    /// Opens a new client context on `device_id` and attaches it to that
    /// device's client list.
    pub fn open_client(&self, device_id: usize, pid: ClientId) -> Arc<ClientContext> {
        let client = Arc::new(ClientContext::new(pid));
        if let Some(exec) = self.devices.get(device_id) {
            exec.lock().attach_client(Arc::clone(&client));
        }
        client
    }

    fn find_client(&self, device_id: usize, pid: ClientId) -> Option<Arc<ClientContext>> {
        self.devices.get(device_id)?.lock().find_client(pid)
    }

    /// Fills a recycled or fresh command, attaches it to the pending list,
    /// and wakes the worker.
    pub fn submit(
        &self,
        device_id: usize,
        client: &Arc<ClientContext>,
        packet: PacketStorage,
        deps: Vec<Arc<dyn crate::command::BufferObject>>,
        output: Option<Arc<dyn crate::command::BufferObject>>,
    ) -> CommandId {
        let id = self.id_gen.next();
        let cmd = self.pool.get_free_cmd(id, device_id, client.pid, packet, deps, output);
        client.inc_outstanding();
        self.enqueue_pending_cmd(cmd);
        id
    }

    /// Used by [`crate::device_poller`] to feed in commands whose packets it
    /// pulled directly out of device BRAM, bypassing `submit`'s dependency
    /// list (the device-poller path never names buffer-object dependencies).
    pub(crate) fn enqueue_pending_cmd(&self, cmd: Command) {
        self.pending.lock().push_back(cmd);
        self.num_pending.fetch_add(1, Ordering::AcqRel);
        self.wake();
    }

    pub fn next_command_id(&self) -> CommandId {
        self.id_gen.next()
    }

    /// Recorded by the ISR adaptor.
    pub fn mark_interrupt_pending(&self) {
        self.interrupt_pending.store(true, Ordering::Release);
        self.wake();
    }

    fn wake(&self) {
        #[cfg(feature = "std")]
        self.wait.notify_one();
    }

    fn wake_predicate(&self) -> bool {
        self.num_pending.load(Ordering::Acquire) > 0
            || self.interrupt_pending.load(Ordering::Acquire)
            || self.poll_count.load(Ordering::Acquire) > 0
            || self.stop.load(Ordering::Acquire)
    }

    /// One full pass: drain pending into `state`, then advance every queued
    /// command's state machine exactly one step. Safe to call from a
    /// `no_std` host driving the scheduler cooperatively without the `std`
    /// worker thread (see the crate's `std` feature doc comment).
    pub fn sweep(&self, state: &mut WorkerState) {
        self.interrupt_pending.store(false, Ordering::Release);
        self.drain_pending(state);
        self.step_queued(state);
    }

    fn drain_pending(&self, state: &mut WorkerState) {
        let batch = {
            let mut pending = self.pending.lock();
            core::mem::take(&mut *pending)
        };
        self.num_pending.store(0, Ordering::Release);

        for cmd in batch {
            self.admit(cmd, state);
        }
    }

    /// Resolves dependencies against still-outstanding predecessors and
    /// moves the command from `New` into `Queued` (or `Error` on chain
    /// overflow). Predecessors that completed between submission and this
    /// admission are correctly *not* found (their `active` was already
    /// cleared); this race-tolerant behavior is intentional.
    fn admit(&self, mut cmd: Command, state: &mut WorkerState) {
        let deps: Vec<_> = cmd.deps().to_vec();
        let mut overflowed = false;

        for dep in &deps {
            let Some(active_id) = dep.active() else { continue };
            if let Some(pred) = state.queued.get_mut(&active_id) {
                if pred.push_chain(cmd.id) {
                    cmd.wait_count += 1;
                } else {
                    overflowed = true;
                    break;
                }
            }
        }

        if overflowed {
            cmd.state = CommandState::Error;
            warn!("cmd {} rejected: {}", cmd.id.get(), ExecCoreError::ChainOverflow);
        } else {
            cmd.state = CommandState::Queued;
        }
        if let Some(output) = cmd.output.clone() {
            output.set_active(Some(cmd.id));
        }

        trace!("cmd {} admitted as {:?}", cmd.id.get(), cmd.state);
        state.queued.insert(cmd.id, cmd);
    }

    fn step_queued(&self, state: &mut WorkerState) {
        for dev in &self.devices {
            dev.lock().begin_sweep();
        }

        let ids: Vec<CommandId> = state.queued.keys().copied().collect();
        let mut terminal: Vec<CommandId> = Vec::new();

        for id in ids {
            let Some((device_id, client_id, running)) = state
                .queued
                .get(&id)
                .map(|c| (c.device_id, c.client_id, c.state == CommandState::Running))
            else {
                continue;
            };

            if !running {
                if let Some(client) = self.find_client(device_id, client_id) {
                    if client.is_aborting() {
                        if let Some(cmd) = state.queued.get_mut(&id) {
                            cmd.state = CommandState::Abort;
                        }
                    }
                }
            }

            let cur_state = state.queued.get(&id).map(|c| c.state);
            match cur_state {
                Some(CommandState::Queued) => self.try_start(device_id, id, state),
                Some(CommandState::Running) => self.query(device_id, id, state),
                _ => {}
            }

            if state.queued.get(&id).map(|c| c.state.is_terminal()).unwrap_or(false) {
                terminal.push(id);
            }
        }

        for id in terminal {
            if let Some(cmd) = state.queued.remove(&id) {
                self.finalize(cmd, state);
            }
        }

        state.loop_count += 1;
        if state.loop_count % MAX_SCHED_LOOP == 0 {
            yield_now();
        }
    }

    /// Runs `CONFIGURE`/`WRITE` inline, then hands the command to the
    /// installed dispatch backend.
    fn try_start(&self, device_id: usize, id: CommandId, state: &mut WorkerState) {
        let wait_count = match state.queued.get(&id) {
            Some(cmd) => cmd.wait_count,
            None => return,
        };
        if wait_count > 0 {
            return;
        }

        let Some(exec_arc) = self.devices.get(device_id) else {
            self.fatal("try_start referenced an unknown device");
            return;
        };
        let mut exec = exec_arc.lock();

        let opcode = state.queued.get(&id).map(|c| c.opcode);
        if !exec.configured && opcode != Some(Opcode::Configure) {
            let err = ExecCoreError::NotConfigured;
            warn!("cmd {} rejected: {err}", id.get());
            if let Some(cmd) = state.queued.get_mut(&id) {
                cmd.state = CommandState::Error;
            }
            return;
        }
        match opcode {
            Some(Opcode::Configure) => {
                let caps = self.device_caps.get(device_id).copied().unwrap_or_default();
                let Some(cmd) = state.queued.get_mut(&id) else { return };
                if let Err(err) = exec.configure(cmd.packet.words_mut(), caps) {
                    warn!("cmd {} configure failed: {err}", id.get());
                    cmd.state = CommandState::Error;
                    return;
                }
            }
            Some(Opcode::Write) => {
                let write_result = {
                    let Some(cmd) = state.queued.get(&id) else { return };
                    exec.execute_write(cmd.view())
                };
                if let Err(err) = write_result {
                    warn!("cmd {} write failed: {err}", id.get());
                    if let Some(cmd) = state.queued.get_mut(&id) {
                        cmd.state = CommandState::Error;
                    }
                    return;
                }
            }
            _ => {}
        }

        let Some(cmd) = state.queued.get_mut(&id) else { return };
        match exec.submit(cmd) {
            Ok(()) => {
                cmd.state = CommandState::Running;
                cmd.polled = exec.polling_mode;
                if cmd.polled {
                    self.poll_count.fetch_add(1, Ordering::AcqRel);
                }
                trace!("cmd {} running (slot {:?}, cu {:?})", id.get(), cmd.slot, cmd.cu);
            }
            Err(ExecCoreError::BackendBusy) => {
                // No free slot/CU this sweep; stays Queued and is retried.
            }
            Err(err) => {
                warn!("cmd {} failed to submit: {err}", id.get());
                cmd.state = CommandState::Error;
            }
        }
    }

    /// Advances a `Running` command to `Completed` or `Error`, releasing
    /// its slot (and, in software mode, its CU) on either outcome.
    fn query(&self, device_id: usize, id: CommandId, state: &mut WorkerState) {
        let Some(exec_arc) = self.devices.get(device_id) else {
            self.fatal("query referenced an unknown device");
            return;
        };
        let mut exec = exec_arc.lock();

        let outcome = {
            let Some(cmd) = state.queued.get_mut(&id) else { return };
            exec.query(cmd)
        };

        let Some(cmd) = state.queued.get_mut(&id) else { return };
        match outcome {
            Ok(QueryOutcome::Running) => {}
            Ok(QueryOutcome::Completed) => {
                cmd.state = CommandState::Completed;
                if cmd.polled {
                    self.poll_count.fetch_sub(1, Ordering::AcqRel);
                }
                exec.retire(cmd);
            }
            Err(err) => {
                warn!("cmd {} query failed: {err}", id.get());
                cmd.state = CommandState::Error;
                if cmd.polled {
                    self.poll_count.fetch_sub(1, Ordering::AcqRel);
                }
                exec.retire(cmd);
            }
        }
    }

    /// Notifies the host, triggers the chain, and recycles a terminal
    /// command. Abort never notifies.
    fn finalize(&self, mut cmd: Command, state: &mut WorkerState) {
        let device_id = cmd.device_id;

        match cmd.state {
            CommandState::Completed | CommandState::Error => {
                if let Some(output) = &cmd.output {
                    output.set_active(None);
                }
                self.notify_host(device_id, &cmd);
                if cmd.state == CommandState::Completed {
                    let waiters = cmd.take_chain();
                    self.trigger_chain(waiters, state);
                }
            }
            CommandState::Abort => {
                if let Some(output) = &cmd.output {
                    output.set_active(None);
                }
            }
            CommandState::New | CommandState::Queued | CommandState::Running => {
                self.fatal("finalize called on a non-terminal command");
            }
        }

        if let Some(client) = self.find_client(device_id, cmd.client_id) {
            client.dec_outstanding();
        }

        self.pool.recycle(cmd);
    }

    /// Software and host-driven ERT both go through the client trigger
    /// counters; a command pulled in by the device-side
    /// CQ poller additionally gets its completion echoed back into the
    /// doorbell slot it came from, since nothing else is watching that slot.
    fn notify_host(&self, device_id: usize, cmd: &Command) {
        if let Some(exec) = self.devices.get(device_id) {
            let exec = exec.lock();
            exec.notify_all_clients();
            if cmd.state == CommandState::Completed {
                if let Some(slot) = cmd.cq_slot_idx {
                    exec.echo_doorbell_complete(slot);
                }
            }
        }
    }

    /// Decrements every waiter's `wait_count` and synchronously attempts to
    /// start any that reach zero, within the same worker iteration as the
    /// predecessor's completion.
    fn trigger_chain(&self, waiters: Vec<CommandId>, state: &mut WorkerState) {
        for waiter_id in waiters {
            let ready = if let Some(waiter) = state.queued.get_mut(&waiter_id) {
                if waiter.wait_count > 0 {
                    waiter.wait_count -= 1;
                }
                waiter.wait_count == 0
            } else {
                false
            };

            if ready {
                if let Some(device_id) = state.queued.get(&waiter_id).map(|c| c.device_id) {
                    self.try_start(device_id, waiter_id, state);
                }
            }
        }
    }
}

#[cfg(not(feature = "std"))]
fn yield_now() {}

#[cfg(feature = "std")]
fn yield_now() {
    std::thread::yield_now();
}

#[cfg(feature = "std")]
impl Scheduler {
    /// Spawns the worker thread. Idempotent only in the sense that calling
    /// it twice replaces the tracked handle; the caller is responsible for
    /// not racing two workers over the same pending queue.
    pub fn start(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let handle = std::thread::spawn(move || me.worker_loop());
        *self.worker.lock() = Some(handle);
    }

    fn worker_loop(self: Arc<Self>) {
        let mut state = WorkerState::new();
        loop {
            self.wait.wait_until(|| self.wake_predicate());

            if self.stop.load(Ordering::Acquire) {
                self.drain_and_discard(&mut state);
                return;
            }

            self.sweep(&mut state);

            if self.has_errored() {
                warn!("scheduler worker exiting after fatal error");
                return;
            }
        }
    }

    /// Process-wide stop: force-recycles everything still pending or
    /// queued without notifying clients, then joins the worker.
    fn drain_and_discard(&self, state: &mut WorkerState) {
        for cmd in core::mem::take(&mut *self.pending.lock()) {
            if let Some(client) = self.find_client(cmd.device_id, cmd.client_id) {
                client.dec_outstanding();
            }
            self.pool.recycle(cmd);
        }
        self.num_pending.store(0, Ordering::Release);

        for (_, cmd) in core::mem::take(&mut state.queued) {
            if let Some(client) = self.find_client(cmd.device_id, cmd.client_id) {
                client.dec_outstanding();
            }
            self.pool.recycle(cmd);
        }
    }

    /// Signals the worker to stop, wakes it, and joins. Pending and queued
    /// commands are force-recycled rather than drained through the normal
    /// completion path.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wait.notify_one();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    /// Per-client teardown: requests abort, then polls
    /// `outstanding_execs` every [`crate::limits::TEARDOWN_POLL_INTERVAL_MS`]
    /// until it drains, declaring the device stuck (and flagging it for
    /// reset) after [`crate::limits::TEARDOWN_STUCK_THRESHOLD`] consecutive
    /// no-progress observations.
    pub fn teardown_client(&self, device_id: usize, client: &Arc<ClientContext>) -> Result<(), crate::error::TeardownError> {
        use crate::limits::{TEARDOWN_POLL_INTERVAL_MS, TEARDOWN_STUCK_THRESHOLD};

        client.request_abort();
        self.wake();

        let mut last = client.outstanding();
        let mut stuck_polls: u32 = 0;

        while last != 0 {
            std::thread::sleep(std::time::Duration::from_millis(TEARDOWN_POLL_INTERVAL_MS));
            let now = client.outstanding();
            if now == last {
                stuck_polls += 1;
                if stuck_polls >= TEARDOWN_STUCK_THRESHOLD {
                    if let Some(shared) = self.device_shared(device_id) {
                        shared.mark_needs_reset();
                    }
                    warn!("client {:?} stuck tearing down on device {device_id}", client.pid);
                    if let Some(exec) = self.devices.get(device_id) {
                        exec.lock().detach_client(client.pid);
                    }
                    return Err(crate::error::TeardownError::DeviceStuck);
                }
            } else {
                stuck_polls = 0;
            }
            last = now;
        }

        if let Some(exec) = self.devices.get(device_id) {
            exec.lock().detach_client(client.pid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec;
    use core::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::command::{BufferObject, PacketStorage};
    use crate::exec_core::DeviceCaps;
    use crate::mmio::Mmio;
    use crate::packet::{Opcode, PacketHeader, PacketType};

    struct FakeMmio {
        words: spin::Mutex<alloc::collections::BTreeMap<usize, u32>>,
    }

    impl FakeMmio {
        fn new() -> Arc<Self> {
            Arc::new(Self { words: spin::Mutex::new(alloc::collections::BTreeMap::new()) })
        }
    }

    impl Mmio for FakeMmio {
        unsafe fn read32(&self, offset: usize) -> u32 {
            *self.words.lock().get(&offset).unwrap_or(&0)
        }

        unsafe fn write32(&self, offset: usize, value: u32) {
            self.words.lock().insert(offset, value);
        }
    }

    fn header(count: u16, opcode: Opcode, packet_type: PacketType, custom: u8) -> u32 {
        let header = PacketHeader::new()
            .with_state(0)
            .with_custom(custom)
            .with_count(count)
            .with_opcode(opcode as u8)
            .with_packet_type(packet_type as u8);
        u32::from_be_bytes(header.into_bytes())
    }

    fn configure_words(num_cus: usize, cu_addrs: &[u32]) -> Vec<u32> {
        let mut words = vec![header(5 + num_cus as u16, Opcode::Configure, PacketType::Ctx, 0)];
        words.push(4096); // slot_size
        words.push(num_cus as u32);
        words.push(16); // cu_shift
        words.push(0); // cu_base_addr
        words.push(0); // features: software mode (no ERT bit)
        words.extend_from_slice(cu_addrs);
        words
    }

    fn make_scheduler(mmio: Arc<FakeMmio>) -> Arc<Scheduler> {
        let exec = Arc::new(spin::Mutex::new(ExecCore::new(mmio)));
        Scheduler::new(vec![(exec, DeviceCaps::default())])
    }

    #[derive(Default)]
    struct FakeBuffer {
        active: spin::Mutex<Option<CommandId>>,
    }

    impl BufferObject for FakeBuffer {
        fn active(&self) -> Option<CommandId> {
            *self.active.lock()
        }

        fn set_active(&self, cmd: Option<CommandId>) {
            *self.active.lock() = cmd;
        }
    }

    #[test]
    fn configure_then_complete_one_sweep() {
        let mmio = FakeMmio::new();
        let scheduler = make_scheduler(mmio);
        let client = scheduler.open_client(0, ClientId(1));

        let words = configure_words(1, &[0x10000]);
        scheduler.submit(0, &client, PacketStorage::Owned(words), Vec::new(), None);

        let mut state = WorkerState::new();
        scheduler.sweep(&mut state);
        scheduler.sweep(&mut state);

        assert_eq!(state.queued_len(), 0);
        assert_eq!(client.outstanding(), 0);

        let exec = scheduler.device(0).unwrap();
        assert!(exec.lock().configured);
        assert_eq!(exec.lock().cu_addr_map, vec![0x10000]);
    }

    #[test]
    fn dependency_chain_starts_waiter_on_completion() {
        let mmio = FakeMmio::new();
        let scheduler = make_scheduler(mmio.clone());
        let client = scheduler.open_client(0, ClientId(1));

        let cfg = configure_words(1, &[0x10000]);
        scheduler.submit(0, &client, PacketStorage::Owned(cfg), Vec::new(), None);
        let mut state = WorkerState::new();
        scheduler.sweep(&mut state);
        scheduler.sweep(&mut state);

        let bo = Arc::new(FakeBuffer::default());
        let a_words = vec![
            header(3, Opcode::StartCu, PacketType::Cu, 0),
            0x1,   // CU mask word
            0,     // regmap[0] (AP_START placeholder)
            0xAA,  // regmap[1]
        ];
        let a_id = scheduler.submit(0, &client, PacketStorage::Owned(a_words), Vec::new(), Some(bo.clone()));
        scheduler.sweep(&mut state); // admit A

        let b_words = vec![header(3, Opcode::StartCu, PacketType::Cu, 0), 0x1, 0, 0xBB];
        scheduler.submit(0, &client, PacketStorage::Owned(b_words), vec![bo.clone()], None);
        scheduler.sweep(&mut state); // admit B, chains onto A; starts A

        assert_eq!(state.queued.get(&a_id).unwrap().state, CommandState::Running);
        let b_id = *state.queued.keys().find(|id| **id != a_id).unwrap();
        assert_eq!(state.queued.get(&b_id).unwrap().state, CommandState::Queued);
        assert_eq!(state.queued.get(&b_id).unwrap().wait_count, 1);

        // Complete A: its CU reports AP_DONE.
        let cu_addr = 0x10000usize;
        unsafe { mmio.write32(cu_addr, 0x2) };
        scheduler.sweep(&mut state);

        // A is gone (finalized) and B was started synchronously in the same sweep.
        assert!(state.queued.get(&a_id).is_none());
        assert_eq!(state.queued.get(&b_id).unwrap().state, CommandState::Running);
        assert_eq!(bo.active(), None);
    }

    #[test]
    fn chain_overflow_errors_the_ninth_waiter() {
        let mmio = FakeMmio::new();
        let scheduler = make_scheduler(mmio);
        let client = scheduler.open_client(0, ClientId(1));

        let cfg = configure_words(1, &[0x10000]);
        scheduler.submit(0, &client, PacketStorage::Owned(cfg), Vec::new(), None);
        let mut state = WorkerState::new();
        scheduler.sweep(&mut state);
        scheduler.sweep(&mut state);

        let bo = Arc::new(FakeBuffer::default());
        let a_words = vec![header(3, Opcode::StartCu, PacketType::Cu, 0), 0x1, 0, 0xAA];
        scheduler.submit(0, &client, PacketStorage::Owned(a_words), Vec::new(), Some(bo.clone()));
        scheduler.sweep(&mut state); // admit A, do not let it start yet by making CU busy elsewhere

        for i in 0..9 {
            let words = vec![header(3, Opcode::StartCu, PacketType::Cu, 0), 0x1, 0, i];
            scheduler.submit(0, &client, PacketStorage::Owned(words), vec![bo.clone()], None);
        }
        scheduler.sweep(&mut state);

        let errored = state.queued.values().filter(|c| c.state == CommandState::Error).count();
        assert_eq!(errored, 1, "exactly the 9th dependent should error on chain overflow");
    }

    #[test]
    fn abort_short_circuits_queued_commands() {
        let mmio = FakeMmio::new();
        let scheduler = make_scheduler(mmio);
        let client = scheduler.open_client(0, ClientId(7));

        // Leave the device unconfigured so START_CU cannot start: the
        // command stays Queued (bad-packet error actually -- use WRITE
        // instead, which also requires configuration but demonstrates a
        // command parked in Queued while aborted).
        let words = vec![header(2, Opcode::Write, PacketType::Ctx, 0), 0x10, 0xAA];
        scheduler.submit(0, &client, PacketStorage::Owned(words), Vec::new(), None);

        let mut state = WorkerState::new();
        // Admit without starting: abort before the first full sweep executes try_start.
        client.request_abort();
        scheduler.sweep(&mut state);

        assert_eq!(client.outstanding(), 0);
        assert_eq!(state.queued_len(), 0);
    }

    static DUMMY_COUNTER: AtomicU32 = AtomicU32::new(0);

    #[test]
    fn open_client_attaches_to_device() {
        DUMMY_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mmio = FakeMmio::new();
        let scheduler = make_scheduler(mmio);
        let client = scheduler.open_client(0, ClientId(42));
        let exec = scheduler.device(0).unwrap();
        assert!(exec.lock().find_client(ClientId(42)).is_some());
        assert_eq!(client.pid, ClientId(42));
    }
}
