//! # S-EXI: Expansion Interface Bus Core
//!
//! S-EXI arbitrates the expansion interface (EXI) bus of the console-class
//! boards Splax OS runs on. The controller exposes a small fixed set of
//! channels; each channel can select one device at a time and move data in
//! either immediate mode (1-4 bytes through the DATA register) or DMA mode
//! (32-byte aligned blocks).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Peripheral drivers (SD, RTC, BBA)             │
//! ├─────────────────────────────────────────────────────────────┤
//! │                          S-EXI                              │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │ Execution engine                                      │  │
//! │  │  - select / deselect arbitration                      │  │
//! │  │  - pre / DMA / post transfer splitting                │  │
//! │  │  - start → interrupt → finish completion protocol     │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │ Event dispatch                                        │  │
//! │  │  - interrupt status folding                           │  │
//! │  │  - handlers fire only when their channels are idle    │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │ Raw primitives (CSR / CR / DATA register access)      │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────┤
//! │      Platform: BusIo, DmaMapper, deferred work, IRQ line    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Contexts
//!
//! Every entry point that may wait takes an [`ExecContext`]. Callers in
//! [`ExecContext::Blocking`] may be suspended through [`Platform::block_until`];
//! callers in [`ExecContext::Atomic`] (interrupt handlers, deferred work)
//! never suspend and busy-poll the hardware instead.
//!
//! ## Example
//!
//! ```ignore
//! let exi = Exi::new(bus, dma, platform, ExiConfig::default());
//! exi.init();
//!
//! let channel = ChannelId::new(0).ok_or(ExiError::InvalidArgument)?;
//! let rtc = Device::new(channel, 1, Frequency::new(3)?)?;
//! let mut time = [0u8; 4];
//! exi.select(&rtc, ExecContext::Blocking)?;
//! exi.write(rtc.channel(), &[0x20, 0x00, 0x00, 0x00], CommandFlags::empty(), ExecContext::Blocking)?;
//! exi.read(rtc.channel(), &mut time, CommandFlags::empty(), ExecContext::Blocking)?;
//! exi.deselect(rtc.channel(), ExecContext::Blocking)?;
//! ```

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod channel;
pub mod command;
pub mod engine;
pub mod event;
pub mod hal;
mod raw;
pub mod regs;
pub mod split;

#[cfg(test)]
mod mock;

pub use channel::{ChannelMask, ChannelStatus};
pub use command::{Command, CommandFlags, Completion, DoneFn, Opcode, Operation, Status};
pub use engine::Exi;
pub use event::{Event, EventHandler};
pub use hal::{DmaAddr, DmaDirection, DmaError, DmaMapper, Platform};
pub use regs::{BusIo, Cr, Csr, Register};

/// S-EXI version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Number of EXI channels on the controller
pub const MAX_CHANNELS: usize = 3;

/// Chip-select lines per channel
pub const DEVICES_PER_CHANNEL: u8 = 3;

/// Highest clock frequency index accepted by the CSR CLK field
pub const MAX_FREQUENCY: u8 = 7;

/// DMA address and length granularity in bytes
pub const DMA_ALIGN: usize = 32;

/// Largest unit moved through the DATA register
pub const IMMEDIATE_MAX: usize = 4;

/// Default immediate-mode burst between interrupt-driven chunks
pub const DEFAULT_IDI_BALANCE: usize = 16;

// =============================================================================
// Identity
// =============================================================================

/// Index of a physical EXI channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u8);

impl ChannelId {
    /// Returns the channel handle for `channel`, if the controller has it.
    pub const fn new(channel: u8) -> Option<Self> {
        if (channel as usize) < MAX_CHANNELS {
            Some(Self(channel))
        } else {
            None
        }
    }

    /// Channel number
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Iterates over every channel of the controller
    pub fn all() -> impl Iterator<Item = ChannelId> {
        (0..MAX_CHANNELS as u8).map(ChannelId)
    }
}

impl core::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "exi{}", self.0)
    }
}

/// Clock frequency index latched into CSR on select.
///
/// Index `n` selects 1 MHz << n on the stock controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Frequency(u8);

impl Frequency {
    pub const MHZ_1: Self = Self(0);
    pub const MHZ_2: Self = Self(1);
    pub const MHZ_4: Self = Self(2);
    pub const MHZ_8: Self = Self(3);
    pub const MHZ_16: Self = Self(4);
    pub const MHZ_32: Self = Self(5);

    pub const fn new(index: u8) -> Result<Self, ExiError> {
        if index <= MAX_FREQUENCY {
            Ok(Self(index))
        } else {
            Err(ExiError::InvalidArgument)
        }
    }

    pub const fn index(self) -> u8 {
        self.0
    }
}

/// A device reachable on one chip-select line of one channel.
///
/// Devices are owned by the peripheral drivers above this layer; the bus
/// core only needs their address and clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    channel: ChannelId,
    index: u8,
    frequency: Frequency,
}

impl Device {
    /// Describes device `index` on `channel`, clocked at `frequency`.
    pub const fn new(channel: ChannelId, index: u8, frequency: Frequency) -> Result<Self, ExiError> {
        if index >= DEVICES_PER_CHANNEL {
            return Err(ExiError::InvalidArgument);
        }
        Ok(Self {
            channel,
            index,
            frequency,
        })
    }

    pub const fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Chip-select line number
    pub const fn index(&self) -> u8 {
        self.index
    }

    pub const fn frequency(&self) -> Frequency {
        self.frequency
    }
}

// =============================================================================
// Context and configuration
// =============================================================================

/// Whether the caller may be suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecContext {
    /// Thread context: waits suspend through the platform
    Blocking,
    /// Interrupt or deferred-work context: waits busy-poll
    Atomic,
}

impl ExecContext {
    pub const fn may_block(self) -> bool {
        matches!(self, ExecContext::Blocking)
    }
}

/// Bus core configuration.
#[derive(Debug, Clone)]
pub struct ExiConfig {
    /// Bytes moved synchronously between two interrupt-driven immediate
    /// chunks (0 disables the burst)
    pub idi_balance: usize,
    /// Allow DMA transfers at all
    pub dma: bool,
    /// Interrupt masks left enabled by [`Exi::init`]
    pub init_mask: Csr,
}

impl Default for ExiConfig {
    fn default() -> Self {
        Self {
            idi_balance: DEFAULT_IDI_BALANCE,
            dma: true,
            init_mask: Csr::EXTINMASK,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// S-EXI errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExiError {
    /// Channel already selected and the caller cannot wait
    Busy,
    /// Caller broke the select/deselect/transfer contract
    ProtocolViolation,
    /// A handler is already registered for this channel and event
    AlreadyRegistered,
    /// Operation not implemented by the engine
    Unsupported,
    /// DMA buffer could not be mapped for the device
    DmaMapping,
    /// Channel, device or frequency out of range
    InvalidArgument,
}

impl core::fmt::Display for ExiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExiError::Busy => write!(f, "Channel busy"),
            ExiError::ProtocolViolation => write!(f, "Bus protocol violation"),
            ExiError::AlreadyRegistered => write!(f, "Event handler already registered"),
            ExiError::Unsupported => write!(f, "Unsupported operation"),
            ExiError::DmaMapping => write!(f, "DMA mapping failed"),
            ExiError::InvalidArgument => write!(f, "Invalid argument"),
        }
    }
}
