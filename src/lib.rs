//! Accelerator command scheduler: admits host-submitted command packets,
//! resolves their buffer-object dependency chains, and drives them through
//! either a software (host-polled CU) or ERT (firmware-driven) dispatch
//! back-end to completion.
//!
//! `no_std` by default: the crate does not assume an allocator, a thread
//! API, or a logger are available. The `std` feature (on by default) adds
//! the condvar-backed worker thread, the per-client teardown poll loop, and
//! the device-side command-queue poller; without it, a host drives the
//! scheduler cooperatively by calling [`scheduler::Scheduler::sweep`]
//! directly from its own event loop.
//!
//! This crate never installs a logger: it only emits records through the
//! `log` facade, leaving the sink (serial port, syslog, a test subscriber)
//! to whatever embeds it.

#![no_std]

extern crate alloc;

pub mod bitmap;
pub mod client;
pub mod command;
pub mod dispatch;
pub mod error;
pub mod exec_core;
pub mod isr;
pub mod limits;
pub mod mmio;
pub mod packet;
pub mod scheduler;


#[cfg(feature = "std")]
extern crate std;

#[cfg(feature = "std")]
pub mod device_poller;
#[cfg(feature = "std")]
pub mod sync;

pub use client::{ClientContext, ClientId};
pub use command::{Command, CommandId, CommandPool, CommandState};
pub use error::{ExecCoreError, TeardownError};
pub use exec_core::{DeviceCaps, DeviceShared, ExecCore};
pub use isr::IsrAdaptor;
pub use scheduler::Scheduler;

#[cfg(feature = "std")]
pub use device_poller::DevicePoller;
