//! Error kinds for the scheduler engine.
//!
//! Device input (firmware packets, user-submitted commands) is untrusted, so
//! every fallible operation returns a typed `Result` instead of panicking.
//! Kept as plain enums with a hand-written `Display`, matching the teacher's
//! habit of returning `&'static str`/simple enums for hardware operations
//! rather than pulling in an error-derive crate for kernel-internal plumbing.

use core::fmt;

/// Errors raised while admitting or running a command on an [`crate::exec_core::ExecCore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecCoreError {
    /// Opcode/count combination does not match what the operation expects.
    BadPacket,
    /// No free slot or CU was available; the caller should leave the command
    /// Queued and retry on a later worker iteration.
    BackendBusy,
    /// A `WRITE` command's MMIO writes could not be completed.
    MmioFailed,
    /// A command accumulated more than [`crate::limits::MAX_CHAIN`] waiters.
    ChainOverflow,
    /// `CONFIGURE` was rejected because the device is already configured.
    AlreadyConfigured,
    /// An operation other than `CONFIGURE` was attempted before the device
    /// was configured.
    NotConfigured,
}

impl fmt::Display for ExecCoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ExecCoreError::BadPacket => "malformed or unexpected command packet",
            ExecCoreError::BackendBusy => "no free slot or compute unit available",
            ExecCoreError::MmioFailed => "MMIO register write failed",
            ExecCoreError::ChainOverflow => "dependency chain exceeds MAX_CHAIN waiters",
            ExecCoreError::AlreadyConfigured => "device is already configured",
            ExecCoreError::NotConfigured => "device has not been configured yet",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for ExecCoreError {}

/// Errors raised while tearing down a client context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownError {
    /// `outstanding_execs` did not reach zero after
    /// [`crate::limits::TEARDOWN_STUCK_THRESHOLD`] consecutive no-progress polls.
    DeviceStuck,
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownError::DeviceStuck => f.write_str("device did not drain outstanding execs; flagged for reset"),
        }
    }
}

impl core::error::Error for TeardownError {}
