//! The device's MMIO register file, abstracted behind a trait the same way
//! the reference PCI bus hides its config-space ports behind
//! `ConfigRegionAccess`: the scheduler only ever calls `read32`/`write32`,
//! never touches a raw pointer directly, so tests can swap in an in-memory
//! fake without `unsafe`.
//!
//! All accesses are byte offsets from the device's MMIO base and operate on
//! 32-bit words, matching the packet/regmap word addressing used everywhere
//! else in this crate.

/// Word-addressed MMIO register file.
///
/// `&self` rather than `&mut self`: the device memory is genuinely shared
/// (an ISR may observe status registers concurrently), so implementations
/// are expected to use interior mutability or raw volatile access, the way
/// `ConfigurationSpace` wraps its ports in a `Mutex` despite exposing `&self`
/// methods. Callers outside the worker thread must stick to the read-only
/// status/completion registers the concurrency model designates as shared.
pub trait Mmio: Send + Sync {
    /// Reads a 32-bit word at `offset` bytes from the device base.
    ///
    /// # Safety
    /// `offset` must address a valid, mapped register for this device.
    unsafe fn read32(&self, offset: usize) -> u32;

    /// Writes a 32-bit word at `offset` bytes from the device base.
    ///
    /// # Safety
    /// `offset` must address a valid, mapped register for this device.
    unsafe fn write32(&self, offset: usize, value: u32);

    /// Copies `words` starting at `offset`, one word per 4 bytes, in order.
    /// The ERT backend uses this to MMIO-copy a packet's payload into a CQ
    /// slot body in one pass; the default implementation is just a loop of
    /// `write32`, overridable if a backing store supports bulk transfer.
    ///
    /// # Safety
    /// Same contract as `write32`, applied to the whole `offset..offset +
    /// 4*words.len()` range.
    unsafe fn write32_bulk(&self, offset: usize, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            unsafe { self.write32(offset + 4 * i, *word) };
        }
    }
}

/// The real device-backed [`Mmio`], wrapping a raw base pointer into mapped
/// device memory the same way the teacher's `mlx4` driver wraps register
/// structs in `volatile::{ReadOnly, WriteOnly}` rather than dereferencing raw
/// pointers directly. Device discovery and mapping are out of scope for this
/// crate; callers hand in an already-mapped base.
pub struct DeviceMmio {
    base: *mut u8,
}

// SAFETY: the pointee is genuinely shared device memory ("shared but
// effectively single-writer"); callers uphold the aliasing contract
// documented on `new`.
unsafe impl Send for DeviceMmio {}
unsafe impl Sync for DeviceMmio {}

impl DeviceMmio {
    /// # Safety
    /// `base` must point to a region of valid, mapped MMIO device memory
    /// that remains valid for the lifetime of this `DeviceMmio`, and no
    /// other writer may access it outside the single-writer discipline
    /// (worker owns writes; the ISR only touches its own atomic flags,
    /// never this pointer).
    pub unsafe fn new(base: *mut u8) -> Self {
        Self { base }
    }
}

impl Mmio for DeviceMmio {
    unsafe fn read32(&self, offset: usize) -> u32 {
        let ptr = unsafe { self.base.add(offset) } as *const volatile::Volatile<u32>;
        unsafe { (*ptr).read() }
    }

    unsafe fn write32(&self, offset: usize, value: u32) {
        let ptr = unsafe { self.base.add(offset) } as *mut volatile::Volatile<u32>;
        unsafe { (&mut *ptr).write(value) };
    }
}
