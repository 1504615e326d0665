//! Scheduler-wide size limits and tunables.
//!
//! Centralized the way `consts.rs` centralizes kernel-wide constants in the
//! teacher crate, rather than scattering magic numbers across modules.

/// Maximum number of command-queue slots a device may expose.
pub const MAX_CQ_SLOTS: usize = 128;

/// Maximum number of compute units a device may expose.
pub const MAX_CUS: usize = 128;

/// Default slot count used by [`crate::exec_core::ExecCore::reset`] before a
/// `CONFIGURE` command installs the real geometry.
pub const DEFAULT_CQ_SLOTS: usize = 16;

/// Maximum number of buffer-object dependencies a single command may carry.
pub const MAX_DEPS: usize = 8;

/// Maximum number of commands that may chain off of a single predecessor.
pub const MAX_CHAIN: usize = 8;

/// Number of queued-list iterations between voluntary worker yields.
pub const MAX_SCHED_LOOP: usize = 8;

/// Number of 32-bit words making up one bitmask bank (`slot_status`,
/// `cu_status`, the `sr*` completion banks).
pub const MASK_BANKS: usize = 4;

/// Interval between `outstanding_execs` polls during client teardown.
pub const TEARDOWN_POLL_INTERVAL_MS: u64 = 500;

/// Consecutive no-progress observations during teardown before the device is
/// declared stuck and flagged for reset.
pub const TEARDOWN_STUCK_THRESHOLD: u32 = 20;

/// AP_START control bit (offset 0, write) of a compute unit's register file.
pub const AP_START: u32 = 0x1;

/// AP_DONE status bit (offset 0, read) of a compute unit's register file.
pub const AP_DONE: u32 = 0x2;

/// Total size, in bytes, of the on-device command queue region. Slot count
/// after `CONFIGURE` is `CQ_SIZE / slot_size`, not a separately configured
/// field.
pub const CQ_SIZE: usize = 128 * 1024;

/// Byte offset (from the device MMIO base) of the first CQ slot body.
pub const CQ_BASE: usize = 0x0;

/// Byte offset of the CQ-interrupt doorbell register bank (four 32-bit
/// words, one bit per slot).
pub const CQ_STATUS_REG: usize = 0x10000;

/// Byte offset of the completion-status register bank (four 32-bit words,
/// one bit per slot).
pub const STATUS_REG: usize = 0x10010;
