//! Typed view over a word-addressed command packet.
//!
//! The packet's header word layout is owned by the firmware ABI; this crate
//! only depends on the named accessors below, never on the raw bit positions.

use modular_bitfield_msb::prelude::*;

/// State nibble carried in the packet header. Distinct from
/// [`crate::command::CommandState`]: this is the wire-level field the
/// device-poller path inspects before a command has even been admitted.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    New = 0,
    Queued = 1,
    Running = 2,
    Completed = 3,
    Error = 4,
}

impl TryFrom<u8> for PacketState {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            value if value == PacketState::New as u8 => Ok(PacketState::New),
            value if value == PacketState::Queued as u8 => Ok(PacketState::Queued),
            value if value == PacketState::Running as u8 => Ok(PacketState::Running),
            value if value == PacketState::Completed as u8 => Ok(PacketState::Completed),
            value if value == PacketState::Error as u8 => Ok(PacketState::Error),
            _ => Err(()),
        }
    }
}

/// Opcode field of the packet header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    StartKernel = 0x0,
    StartCu = 0x1,
    Configure = 0x2,
    Write = 0x3,
    Stop = 0x4,
    Abort = 0x5,
}

impl TryFrom<u8> for Opcode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            value if value == Opcode::StartKernel as u8 => Ok(Opcode::StartKernel),
            value if value == Opcode::StartCu as u8 => Ok(Opcode::StartCu),
            value if value == Opcode::Configure as u8 => Ok(Opcode::Configure),
            value if value == Opcode::Write as u8 => Ok(Opcode::Write),
            value if value == Opcode::Stop as u8 => Ok(Opcode::Stop),
            value if value == Opcode::Abort as u8 => Ok(Opcode::Abort),
            _ => Err(()),
        }
    }
}

/// Type field of the packet header. Only `Local` changes scheduler behavior
/// (no device I/O is issued for it); the rest are carried through untouched.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Ctx = 0x0,
    Cu = 0x1,
    KdsLocal = 0x2,
}

impl TryFrom<u8> for PacketType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            value if value == PacketType::Ctx as u8 => Ok(PacketType::Ctx),
            value if value == PacketType::Cu as u8 => Ok(PacketType::Cu),
            value if value == PacketType::KdsLocal as u8 => Ok(PacketType::KdsLocal),
            _ => Err(()),
        }
    }
}

/// The 32-bit packet header: `{ state:4, custom:8, count:11, opcode:5, type:4 }`.
///
/// Field order follows the spec's left-to-right bit listing; the exact
/// physical bit numbering is an ABI detail this crate never inspects
/// directly, only through the named accessors `modular_bitfield` generates.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub state: B4,
    pub custom: B8,
    pub count: B11,
    pub opcode: B5,
    pub packet_type: B4,
}

/// A read-only view over a command packet's words.
///
/// `START_KERNEL` packets additionally steal two bits out of the header's
/// `custom` field to record `extra_cu_masks`; that sub-field is exposed here
/// rather than in [`PacketHeader`] because it only has meaning for one opcode.
pub struct PacketView<'a> {
    words: &'a [u32],
}

impl<'a> PacketView<'a> {
    pub fn new(words: &'a [u32]) -> Self {
        assert!(!words.is_empty(), "packet must contain at least a header word");
        Self { words }
    }

    fn header(&self) -> PacketHeader {
        PacketHeader::from_bytes(self.words[0].to_be_bytes())
    }

    pub fn state(&self) -> u8 {
        self.header().state()
    }

    pub fn opcode_raw(&self) -> u8 {
        self.header().opcode()
    }

    pub fn opcode(&self) -> Result<Opcode, ()> {
        Opcode::try_from(self.opcode_raw())
    }

    pub fn packet_type_raw(&self) -> u8 {
        self.header().packet_type()
    }

    pub fn packet_type(&self) -> Result<PacketType, ()> {
        PacketType::try_from(self.packet_type_raw())
    }

    pub fn is_local(&self) -> bool {
        matches!(self.packet_type(), Ok(PacketType::KdsLocal))
    }

    /// Number of payload words following the header.
    pub fn count(&self) -> usize {
        self.header().count() as usize
    }

    /// Total packet size in words, header included.
    pub fn packet_size(&self) -> usize {
        self.count() + 1
    }

    /// `extra_cu_masks` sub-field, meaningful only for `START_KERNEL`: the
    /// low two bits of the header's `custom` byte.
    pub fn extra_cu_masks(&self) -> usize {
        (self.header().custom() & 0x3) as usize
    }

    /// Number of CU-mask words preceding the regmap. `START_CU` always
    /// carries exactly one; `START_KERNEL` carries `1 + extra_cu_masks` (it
    /// alone supports addressing more than 32 CUs); every other opcode
    /// carries none.
    pub fn cu_masks(&self) -> usize {
        match self.opcode() {
            Ok(Opcode::StartKernel) => 1 + self.extra_cu_masks(),
            Ok(Opcode::StartCu) => 1,
            _ => 0,
        }
    }

    /// Number of register-map words following the CU-mask words.
    pub fn regmap_size(&self) -> usize {
        self.count() - self.cu_masks()
    }

    /// The CU-mask words, in order, mask 0 first.
    pub fn cu_mask_words(&self) -> &'a [u32] {
        let start = 1;
        let end = start + self.cu_masks();
        &self.words[start..end]
    }

    /// The register-map words, in order. Word 0 is reserved for `AP_START`.
    pub fn regmap(&self) -> &'a [u32] {
        let start = 1 + self.cu_masks();
        let end = start + self.regmap_size();
        &self.words[start..end]
    }

    /// The raw payload words (CU masks and regmap together), for backends
    /// that copy the whole body verbatim (e.g. the ERT slot write).
    pub fn payload(&self) -> &'a [u32] {
        &self.words[1..1 + self.count()]
    }

    /// `(addr, val)` pairs for a `WRITE` packet. Panics if `count` is odd;
    /// callers must have already validated the opcode.
    pub fn write_pairs(&self) -> impl Iterator<Item = (u32, u32)> + 'a {
        assert_eq!(self.count() % 2, 0, "WRITE packet must carry an even word count");
        self.payload().chunks_exact(2).map(|pair| (pair[0], pair[1]))
    }

    pub fn raw_words(&self) -> &'a [u32] {
        self.words
    }
}

/// Derives the packet size (header included) for the device-side
/// command-queue poller, which must know how many words to copy out of the
/// doorbell BRAM before a [`PacketView`] can even be constructed.
pub fn get_packet_size(opcode: Opcode, count: usize) -> usize {
    match opcode {
        Opcode::Configure => 1 + 5 + count,
        Opcode::StartCu | Opcode::StartKernel | Opcode::Write => 1 + count,
        Opcode::Stop | Opcode::Abort => 1,
    }
}
