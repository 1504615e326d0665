//! Commands: the unit of work the scheduler admits, runs and recycles.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::num::NonZeroU64;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::client::ClientId;
use crate::limits::{MAX_CHAIN, MAX_DEPS};
use crate::packet::{Opcode, PacketType, PacketView};

/// Opaque handle to a command, stable across the command's whole lifetime.
///
/// Chains are stored as `CommandId`s indexing into the scheduler's command
/// table rather than as raw pointers or `Arc<Command>` back-references, so a
/// predecessor and its waiters never form a reference cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId(NonZeroU64);

impl CommandId {
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// Monotonic id generator, one per [`crate::scheduler::Scheduler`].
pub struct CommandIdGen(AtomicU64);

impl CommandIdGen {
    pub const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> CommandId {
        let raw = self.0.fetch_add(1, Ordering::Relaxed);
        CommandId(NonZeroU64::new(raw).expect("command id counter wrapped to zero"))
    }
}

/// A host-supplied buffer object a command depends on. Allocation, mapping
/// and reference counting are out of scope for this crate (supplied by the
/// host's memory subsystem); the scheduler only needs the two accessors
/// below to resolve and chain dependencies at queue-admission time.
pub trait BufferObject: Send + Sync {
    /// The command currently producing this buffer, if one is still
    /// outstanding. `None` once that command has completed (or if nothing
    /// has ever written to it).
    fn active(&self) -> Option<CommandId>;

    /// Records (or clears, with `None`) the command that currently owns
    /// this buffer. Written only by the scheduler worker, when admitting a
    /// command into Queued and when that command later completes.
    fn set_active(&self, cmd: Option<CommandId>);
}

/// Where a command's packet words live.
///
/// Normally the packet is a view into buffer-object memory the host already
/// owns; the device-side CQ poller instead `memcpy`s a packet out of the
/// doorbell BRAM into its own heap copy, since nothing else is keeping that
/// BRAM region alive once the doorbell slot is reused. Either way,
/// `free_buffer` (`Drop`) is the hook that releases it on recycle.
pub enum PacketStorage {
    Buffer(Arc<dyn BufferObject>, Vec<u32>),
    Owned(Vec<u32>),
}

impl PacketStorage {
    pub fn words(&self) -> &[u32] {
        match self {
            PacketStorage::Buffer(_, words) => words,
            PacketStorage::Owned(words) => words,
        }
    }

    pub fn view(&self) -> PacketView<'_> {
        PacketView::new(self.words())
    }

    /// Mutable access to the packet's own words, used only by `CONFIGURE`
    /// handling to stamp capability bits back into the features word for
    /// firmware to read. Each command owns a private copy of its words
    /// (see the type's doc comment), so this never mutates memory a
    /// `BufferObject` still considers shared.
    pub fn words_mut(&mut self) -> &mut [u32] {
        match self {
            PacketStorage::Buffer(_, words) => words,
            PacketStorage::Owned(words) => words,
        }
    }
}

/// A command's lifecycle state. `New` only exists between `add_cmd` and the
/// worker's next drain; by the time a `Command` sits in the scheduler's
/// queued list it is always at least `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    New,
    Queued,
    Running,
    Completed,
    Error,
    Abort,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandState::Completed | CommandState::Error | CommandState::Abort)
    }
}

/// A command's dependency/chain storage is one field that means two
/// different things depending on lifecycle stage: up to [`MAX_DEPS`] buffer
/// references before admission, up to [`MAX_CHAIN`] waiter ids after. An
/// explicit tagged union keeps that discriminated instead of overloading one
/// array for both, per the design notes on cyclic chain links.
pub enum CommandPayload {
    /// Dependency buffer objects named at submission time, not yet resolved
    /// against the scheduler's active-command bookkeeping.
    Deps(Vec<Arc<dyn BufferObject>>),
    /// Commands chained onto this one's completion, appended by the worker
    /// as later commands are admitted with this command as an outstanding
    /// dependency.
    Chain(Vec<CommandId>),
}

impl CommandPayload {
    pub fn chain_len(&self) -> usize {
        match self {
            CommandPayload::Chain(waiters) => waiters.len(),
            CommandPayload::Deps(_) => 0,
        }
    }
}

pub struct Command {
    pub id: CommandId,
    pub state: CommandState,
    pub device_id: usize,
    pub client_id: ClientId,
    pub opcode: Opcode,
    pub packet_type: PacketType,
    /// `None` until the dispatch backend allocates one in `try_start`.
    pub slot: Option<usize>,
    /// `None` until allocated (software mode only; ERT never sets this).
    pub cu: Option<usize>,
    pub packet: PacketStorage,
    pub wait_count: u32,
    pub payload: CommandPayload,
    /// Set only by the device-side CQ poller: the doorbell slot this
    /// command's packet was pulled from, so completion can be reported back
    /// into the same slot.
    pub cq_slot_idx: Option<usize>,
    /// This command's own output buffer object, if the caller named one.
    /// Marked `active = Some(self.id)` on admission into `Queued` and
    /// cleared on completion, so a later command naming this buffer as a
    /// dependency can chain onto it.
    pub output: Option<Arc<dyn BufferObject>>,
    /// Whether this command was counted in the scheduler's poll counter when
    /// it started running (mirrors the device's `polling_mode` at submit
    /// time, so the counter is decremented exactly once per command that
    /// incremented it, even if `polling_mode` could somehow change mid-run).
    pub polled: bool,
}

impl Command {
    pub fn new(
        id: CommandId,
        device_id: usize,
        client_id: ClientId,
        packet: PacketStorage,
        deps: Vec<Arc<dyn BufferObject>>,
        output: Option<Arc<dyn BufferObject>>,
    ) -> Self {
        let view = packet.view();
        let opcode = view.opcode().unwrap_or(Opcode::Stop);
        let packet_type = view.packet_type().unwrap_or(PacketType::Ctx);
        Self {
            id,
            state: CommandState::New,
            device_id,
            client_id,
            opcode,
            packet_type,
            slot: None,
            cu: None,
            packet,
            wait_count: 0,
            payload: CommandPayload::Deps(deps),
            cq_slot_idx: None,
            output,
            polled: false,
        }
    }

    pub fn view(&self) -> PacketView<'_> {
        self.packet.view()
    }

    pub fn is_local(&self) -> bool {
        matches!(self.packet_type, PacketType::KdsLocal)
    }

    /// Appends `waiter` to this command's chain, converting the payload from
    /// `Deps` to `Chain` the first time a waiter is recorded (this only
    /// happens once a command has reached `Queued`, at which point its
    /// dependency list has already been resolved and is no longer needed).
    /// Returns `false` on [`MAX_CHAIN`] overflow, leaving the chain
    /// untouched.
    pub fn push_chain(&mut self, waiter: CommandId) -> bool {
        let waiters = match &mut self.payload {
            CommandPayload::Chain(waiters) => waiters,
            CommandPayload::Deps(_) => {
                self.payload = CommandPayload::Chain(Vec::new());
                match &mut self.payload {
                    CommandPayload::Chain(waiters) => waiters,
                    CommandPayload::Deps(_) => unreachable!(),
                }
            }
        };
        if waiters.len() >= MAX_CHAIN {
            return false;
        }
        waiters.push(waiter);
        true
    }

    /// Drains the chain, if any, for `trigger_chain` to notify.
    pub fn take_chain(&mut self) -> Vec<CommandId> {
        match core::mem::replace(&mut self.payload, CommandPayload::Chain(Vec::new())) {
            CommandPayload::Chain(waiters) => waiters,
            CommandPayload::Deps(_) => Vec::new(),
        }
    }

    /// Dependency buffer objects, valid only before admission (`New` state).
    pub fn deps(&self) -> &[Arc<dyn BufferObject>] {
        match &self.payload {
            CommandPayload::Deps(deps) => deps,
            CommandPayload::Chain(_) => &[],
        }
    }
}

/// Recycled command freelist, protected by its own mutex. Keeping it as an
/// optional performance affordance rather than process-wide global state:
/// callers own a `CommandPool` instance, typically one per
/// [`crate::scheduler::Scheduler`].
pub struct CommandPool {
    free: spin::Mutex<Vec<Command>>,
}

impl CommandPool {
    pub const fn new() -> Self {
        Self { free: spin::Mutex::new(Vec::new()) }
    }

    /// Pops a recycled command and re-initializes it in place, or heap
    /// allocates a fresh one if the freelist is empty.
    pub fn get_free_cmd(
        &self,
        id: CommandId,
        device_id: usize,
        client_id: ClientId,
        packet: PacketStorage,
        deps: Vec<Arc<dyn BufferObject>>,
        output: Option<Arc<dyn BufferObject>>,
    ) -> Command {
        match self.free.lock().pop() {
            Some(mut cmd) => {
                cmd.id = id;
                cmd.state = CommandState::New;
                cmd.device_id = device_id;
                cmd.client_id = client_id;
                let view = packet.view();
                cmd.opcode = view.opcode().unwrap_or(Opcode::Stop);
                cmd.packet_type = view.packet_type().unwrap_or(PacketType::Ctx);
                cmd.slot = None;
                cmd.cu = None;
                cmd.packet = packet;
                cmd.wait_count = 0;
                cmd.payload = CommandPayload::Deps(deps);
                cmd.cq_slot_idx = None;
                cmd.output = output;
                cmd.polled = false;
                cmd
            }
            None => Command::new(id, device_id, client_id, packet, deps, output),
        }
    }

    pub fn recycle(&self, cmd: Command) {
        self.free.lock().push(cmd);
    }

    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    /// Current capacity of the freelist's backing allocation. Informational
    /// only; the freelist grows and shrinks freely and this is not a bound.
    pub fn capacity_hint(&self) -> usize {
        self.free.lock().capacity()
    }
}
