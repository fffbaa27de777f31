//! # EXI Register Layout
//!
//! Each channel owns a 0x14-byte register window:
//!
//! | Offset | Register | Purpose                               |
//! |--------|----------|---------------------------------------|
//! | 0x00   | CSR      | chip select, clock, interrupt control |
//! | 0x04   | MAR      | DMA bus address                       |
//! | 0x08   | LENGTH   | DMA length                            |
//! | 0x0C   | CR       | transfer control                      |
//! | 0x10   | DATA     | immediate-mode data                   |
//!
//! CSR interrupt status bits sit directly above their mask bits and are
//! write-one-to-clear.

use bitflags::bitflags;

use crate::ChannelId;

/// Channel registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    /// Channel status / control
    Csr,
    /// DMA memory address
    Mar,
    /// DMA length
    Length,
    /// Transfer control
    Cr,
    /// Immediate data
    Data,
}

impl Register {
    /// Byte offset inside the channel window, for [`BusIo`] implementations
    pub const fn offset(self) -> usize {
        match self {
            Register::Csr => 0x00,
            Register::Mar => 0x04,
            Register::Length => 0x08,
            Register::Cr => 0x0C,
            Register::Data => 0x10,
        }
    }
}

bitflags! {
    /// Channel status / control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Csr: u32 {
        /// Device interrupt enabled
        const EXIINTMASK = 1 << 0;
        /// Device interrupt pending (W1C)
        const EXIINT = 1 << 1;
        /// Transfer-complete interrupt enabled
        const TCINTMASK = 1 << 2;
        /// Transfer complete (W1C)
        const TCINT = 1 << 3;
        /// Clock frequency index
        const CLK = 0b111 << 4;
        /// Chip-select lines
        const CS = 0b111 << 7;
        /// Insertion-change interrupt enabled
        const EXTINMASK = 1 << 10;
        /// Insertion changed (W1C)
        const EXTIN = 1 << 11;
        /// Device physically present (read-only)
        const EXT = 1 << 12;
    }
}

impl Csr {
    /// Every interrupt mask bit
    pub const MASKS: Self = Self::EXIINTMASK.union(Self::TCINTMASK).union(Self::EXTINMASK);

    /// Every write-one-to-clear status bit
    pub const STATUS: Self = Self::EXIINT.union(Self::TCINT).union(Self::EXTIN);

    /// CS and CLK field for `device` clocked at frequency index `freq`
    pub const fn select(device: u8, freq: u8) -> Self {
        Self::from_bits_retain((((1u32 << device) << 7) & Self::CS.bits()) | (((freq as u32) << 4) & Self::CLK.bits()))
    }

    /// Status bits that are both raised and enabled
    pub fn active(self) -> Self {
        let enabled = self.intersection(Self::MASKS);
        self.intersection(Self::from_bits_retain(enabled.bits() << 1))
    }

    /// Value to write back so that only `ack` status bits are cleared
    pub fn ack(self, ack: Self) -> Self {
        self.difference(Self::STATUS).union(ack.intersection(Self::STATUS))
    }
}

bitflags! {
    /// Transfer control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Cr: u32 {
        /// Start transfer; cleared by hardware on completion
        const TSTART = 1 << 0;
        /// DMA mode
        const DMA = 1 << 1;
        /// Transfer direction field
        const RW = 0b11 << 2;
        /// Immediate length field (length - 1)
        const TLEN = 0b11 << 4;
    }
}

impl Cr {
    /// RW field value for reads
    pub const READ: Self = Self::empty();
    /// RW field value for writes
    pub const WRITE: Self = Self::from_bits_retain(1 << 2);
    /// RW field value for full-duplex exchanges
    pub const READ_WRITE: Self = Self::from_bits_retain(2 << 2);

    /// TLEN field for an immediate transfer of `len` bytes (1..=4)
    pub const fn tlen(len: usize) -> Self {
        Self::from_bits_retain((((len as u32).wrapping_sub(1)) << 4) & Self::TLEN.bits())
    }

    /// Immediate length encoded in the TLEN field
    pub fn immediate_len(self) -> usize {
        ((self.bits() & Self::TLEN.bits()) >> 4) as usize + 1
    }
}

/// Bus register access, provided by the platform.
///
/// Accesses are single 32-bit loads and stores; implementations must not
/// reorder them.
pub trait BusIo: Send + Sync {
    /// Reads a channel register
    fn read(&self, channel: ChannelId, reg: Register) -> u32;

    /// Writes a channel register
    fn write(&self, channel: ChannelId, reg: Register, value: u32);
}

/// Packs up to 4 bytes most-significant first, the way DATA holds them.
pub fn pack_data(bytes: &[u8]) -> u32 {
    debug_assert!(bytes.len() <= 4);
    bytes
        .iter()
        .enumerate()
        .fold(0, |acc, (i, &b)| acc | (b as u32) << (24 - 8 * i))
}

/// Inverse of [`pack_data`]: fills `bytes` from the top of `value`.
pub fn unpack_data(value: u32, bytes: &mut [u8]) {
    debug_assert!(bytes.len() <= 4);
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = (value >> (24 - 8 * i)) as u8;
    }
}
