//! Channel registry entries.
//!
//! One [`Channel`] exists per physical EXI channel for the lifetime of the
//! bus core. Three locks guard it:
//!
//! - `state`: the main channel lock (selection record, in-flight transfer,
//!   event table, scratch buffer), shared with the interrupt handler
//! - `io_lock`: CSR read-modify-write sequences only
//! - `select_lock`: held from select until the matching deselect

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::command::{DoneFn, Opcode, RawBuf};
use crate::event::{EventSlot, EVENT_COUNT};
use crate::hal::{DmaAddr, Platform};
use crate::raw::ChannelIo;
use crate::regs::{BusIo, Csr};
use crate::{ChannelId, Device, DMA_ALIGN, MAX_CHANNELS};

bitflags! {
    /// Set of channels, used as an event handler's interest set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelMask: u32 {
        const CH0 = 1 << 0;
        const CH1 = 1 << 1;
        const CH2 = 1 << 2;
    }
}

impl ChannelMask {
    /// Mask holding just `channel`
    pub fn of(channel: ChannelId) -> Self {
        Self::from_bits_truncate(1 << channel.index())
    }

    /// Channels in the mask, lowest first
    pub fn channels(self) -> impl Iterator<Item = ChannelId> {
        ChannelId::all().filter(move |ch| self.contains(Self::of(*ch)))
    }
}

/// Observable channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Nothing selected
    Idle,
    /// A device is selected, no transfer running
    Selected,
    /// A transfer is running
    Transferring { dma: bool },
}

/// 32-byte aligned bounce buffer for coalesced pre/post transfers.
#[repr(C, align(32))]
pub(crate) struct DmaScratch(pub [u8; DMA_ALIGN]);

/// How the in-flight transfer completes.
pub(crate) enum Mode {
    /// Interrupt-driven immediate chunks
    Immediate,
    /// A DMA transfer; `bounce` is the caller's region when the DMA runs
    /// through the scratch buffer
    Dma {
        device: Device,
        addr: DmaAddr,
        len: usize,
        bounce: Option<RawBuf>,
    },
}

/// The single command a channel may have in flight.
pub(crate) struct InFlight {
    pub op: Opcode,
    pub buf: RawBuf,
    pub bytes_left: usize,
    pub mode: Mode,
    /// Trailing immediate-mode region run after the DMA completes
    pub post: Option<RawBuf>,
    pub done: Option<DoneFn>,
}

// SAFETY: the raw buffer is owned by the command until its done callback
// runs, and is only touched under the channel lock.
unsafe impl Send for InFlight {}

impl InFlight {
    pub fn is_dma(&self) -> bool {
        matches!(self.mode, Mode::Dma { .. })
    }
}

/// State guarded by the main channel lock.
pub(crate) struct ChannelState {
    pub device: Option<Device>,
    pub in_flight: Option<InFlight>,
    pub events: [EventSlot; EVENT_COUNT],
    pub scratch: Box<DmaScratch>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            device: None,
            in_flight: None,
            events: Default::default(),
            scratch: Box::new(DmaScratch([0; DMA_ALIGN])),
        }
    }
}

/// One physical EXI channel.
pub struct Channel {
    id: ChannelId,
    pub(crate) state: Mutex<ChannelState>,
    pub(crate) io_lock: Mutex<()>,
    select_lock: AtomicBool,
    /// Csr status bits seen by the interrupt handler, not yet dispatched
    pending: AtomicU32,
}

impl Channel {
    pub(crate) fn new(id: ChannelId) -> Self {
        Self {
            id,
            state: Mutex::new(ChannelState::new()),
            io_lock: Mutex::new(()),
            select_lock: AtomicBool::new(false),
            pending: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Whether a device is selected. Lock-free, so other channels' event
    /// checks can read it.
    pub fn is_selected(&self) -> bool {
        self.select_lock.load(Ordering::Acquire)
    }

    /// Takes the select lock. Caller holds the channel lock.
    pub(crate) fn try_acquire_select(&self) -> bool {
        self.select_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drops the select lock. Caller holds the channel lock.
    pub(crate) fn release_select(&self) {
        self.select_lock.store(false, Ordering::Release);
    }

    pub(crate) fn pending(&self) -> Csr {
        Csr::from_bits_retain(self.pending.load(Ordering::Acquire))
    }

    pub(crate) fn add_pending(&self, status: Csr) {
        self.pending.fetch_or(status.bits(), Ordering::AcqRel);
    }

    /// Clears `bits`, returning whether any of them were set
    pub(crate) fn take_pending(&self, bits: Csr) -> bool {
        self.pending.fetch_and(!bits.bits(), Ordering::AcqRel) & bits.bits() != 0
    }

    pub(crate) fn io<'a>(&'a self, bus: &'a dyn BusIo, platform: &'a dyn Platform) -> ChannelIo<'a> {
        ChannelIo {
            id: self.id,
            bus,
            platform,
            io_lock: &self.io_lock,
        }
    }

    /// Forgets selection, pending events and any stale in-flight record.
    pub(crate) fn reset(&self, state: &mut ChannelState) {
        state.device = None;
        state.in_flight = None;
        self.release_select();
        self.pending.store(0, Ordering::Release);
    }
}

/// The channel registry: one entry per physical channel.
pub(crate) fn registry() -> [Channel; MAX_CHANNELS] {
    core::array::from_fn(|i| Channel::new(ChannelId(i as u8)))
}
