//! Software model of the EXI controller for unit tests.
//!
//! Transfers complete the moment CR.TSTART is written: the model moves the
//! bytes, clears TSTART and raises TCINT. Each channel talks to a byte
//! stream device that records every transfer and answers reads with an
//! incrementing counter.

use std::boxed::Box;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::vec::Vec;

use crate::command::Opcode;
use crate::hal::{DmaAddr, DmaDirection, DmaError, DmaMapper, Platform};
use crate::regs::{BusIo, Cr, Csr, Register};
use crate::{ChannelId, Device, Exi, ExiConfig, DMA_ALIGN, MAX_CHANNELS};

/// 32-byte aligned test buffer.
#[repr(C, align(32))]
pub struct Aligned(pub [u8; 256]);

pub fn aligned() -> Box<Aligned> {
    Box::new(Aligned([0; 256]))
}

/// One transfer as seen by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xfer {
    pub dma: bool,
    pub op: Opcode,
    pub bytes: Vec<u8>,
}

impl Xfer {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_dma(&self) -> bool {
        self.dma
    }
}

#[derive(Default)]
struct ChannelModel {
    csr: u32,
    cr: u32,
    mar: u32,
    length: u32,
    data: u32,
    inserted: bool,
    next_read: u8,
    log: Vec<Xfer>,
    idi_starts: usize,
    /// An asynchronous start whose TCINT has not been acknowledged yet
    armed: bool,
}

impl ChannelModel {
    fn csr(&self) -> Csr {
        let ext = if self.inserted { Csr::EXT } else { Csr::empty() };
        Csr::from_bits_retain(self.csr).union(ext)
    }

    fn device_bytes(&mut self, len: usize) -> Vec<u8> {
        (0..len)
            .map(|_| {
                let byte = self.next_read;
                self.next_read = self.next_read.wrapping_add(1);
                byte
            })
            .collect()
    }
}

struct Mapping {
    channel: usize,
    bus: u32,
    ptr: usize,
    len: usize,
}

#[derive(Default)]
struct Inner {
    channels: [ChannelModel; MAX_CHANNELS],
    mappings: Vec<Mapping>,
    next_bus: u32,
    overlap: bool,
    fail_next_map: bool,
    deferred: Vec<ChannelId>,
    sleeps: usize,
}

impl Inner {
    /// Runs the transfer just started through CR.
    fn execute(&mut self, idx: usize, cr: Cr) {
        let mar = self.channels[idx].mar;
        let dma_start = cr.contains(Cr::DMA);
        let mapped = self
            .mappings
            .iter()
            .any(|m| m.channel == idx && !(dma_start && m.bus == mar));

        let ch = &mut self.channels[idx];
        if ch.armed || mapped {
            self.overlap = true;
        }
        if dma_start || Csr::from_bits_retain(ch.csr).contains(Csr::TCINTMASK) {
            ch.armed = true;
        }
        let op = if cr.intersection(Cr::RW) == Cr::WRITE {
            Opcode::Write
        } else {
            Opcode::Read
        };

        if !cr.contains(Cr::DMA) {
            let len = cr.immediate_len();
            if Csr::from_bits_retain(ch.csr).contains(Csr::TCINTMASK) {
                ch.idi_starts += 1;
            }
            let bytes = if op == Opcode::Write {
                ch.data.to_be_bytes()[..len].to_vec()
            } else {
                let bytes = ch.device_bytes(len);
                let mut word = [0xFF; 4];
                word[..len].copy_from_slice(&bytes);
                ch.data = u32::from_be_bytes(word);
                bytes
            };
            ch.log.push(Xfer { dma: false, op, bytes });
            return;
        }

        let (mar, len) = (ch.mar, ch.length as usize);
        let Some(ptr) = self
            .mappings
            .iter()
            .find(|m| m.channel == idx && m.bus <= mar && (mar - m.bus) as usize + len <= m.len)
            .map(|m| m.ptr + (mar - m.bus) as usize)
        else {
            panic!("DMA to unmapped bus address {:#x}", mar);
        };

        let ch = &mut self.channels[idx];
        let bytes = if op == Opcode::Write {
            // SAFETY: the engine keeps mapped buffers alive until unmap.
            unsafe { std::slice::from_raw_parts(ptr as *const u8, len) }.to_vec()
        } else {
            let bytes = ch.device_bytes(len);
            // SAFETY: as above, and read mappings are exclusively the device's.
            unsafe { std::slice::from_raw_parts_mut(ptr as *mut u8, len) }.copy_from_slice(&bytes);
            bytes
        };
        ch.log.push(Xfer { dma: true, op, bytes });
    }
}

/// Register file, DMA mapper and platform in one.
#[derive(Default)]
pub struct MockHw {
    inner: Mutex<Inner>,
    exi: OnceLock<Weak<Exi>>,
}

impl MockHw {
    pub fn new() -> Self {
        let hw = Self::default();
        hw.state().next_bus = 0x0100_0000;
        hw
    }

    /// A bus core wired to a fresh model, already initialized.
    pub fn exi() -> (Arc<MockHw>, Arc<Exi>) {
        Self::exi_with(ExiConfig::default())
    }

    pub fn exi_with(config: ExiConfig) -> (Arc<MockHw>, Arc<Exi>) {
        let hw = Arc::new(Self::new());
        let exi = Arc::new(Exi::new(hw.clone(), hw.clone(), hw.clone(), config));
        let _ = hw.exi.set(Arc::downgrade(&exi));
        exi.init();
        (hw, exi)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("mock state")
    }

    fn with_channel<R>(&self, channel: ChannelId, f: impl FnOnce(&mut ChannelModel) -> R) -> R {
        f(&mut self.state().channels[channel.index()])
    }

    pub fn csr(&self, channel: ChannelId) -> Csr {
        self.with_channel(channel, |ch| ch.csr())
    }

    /// Overwrites CSR, status bits included.
    pub fn set_csr(&self, channel: ChannelId, csr: Csr) {
        self.with_channel(channel, |ch| ch.csr = csr.difference(Csr::EXT).bits());
    }

    /// Raises status bits as the hardware would.
    pub fn raise(&self, channel: ChannelId, status: Csr) {
        self.with_channel(channel, |ch| ch.csr |= status.intersection(Csr::STATUS).bits());
    }

    /// Plugs or unplugs a device, raising EXTIN on change.
    pub fn set_inserted(&self, channel: ChannelId, inserted: bool) {
        self.with_channel(channel, |ch| {
            if ch.inserted != inserted {
                ch.inserted = inserted;
                ch.csr |= Csr::EXTIN.bits();
            }
        });
    }

    /// Whether any channel has an enabled status bit raised.
    pub fn irq_line(&self) -> bool {
        self.state().channels.iter().any(|ch| !ch.csr().active().is_empty())
    }

    /// Restarts the device's read counter at `seed`.
    pub fn seed_reads(&self, channel: ChannelId, seed: u8) {
        self.with_channel(channel, |ch| ch.next_read = seed);
    }

    pub fn log(&self, channel: ChannelId) -> Vec<Xfer> {
        self.with_channel(channel, |ch| ch.log.clone())
    }

    pub fn clear_log(&self, channel: ChannelId) {
        self.with_channel(channel, |ch| ch.log.clear());
    }

    /// Every byte written to the device, in order.
    pub fn written(&self, channel: ChannelId) -> Vec<u8> {
        self.with_channel(channel, |ch| {
            ch.log
                .iter()
                .filter(|x| x.op == Opcode::Write)
                .flat_map(|x| x.bytes.iter().copied())
                .collect()
        })
    }

    /// Interrupt-driven immediate chunks started so far.
    pub fn idi_starts(&self, channel: ChannelId) -> usize {
        self.with_channel(channel, |ch| ch.idi_starts)
    }

    pub fn fail_next_map(&self) {
        self.state().fail_next_map = true;
    }

    pub fn live_mappings(&self) -> usize {
        self.state().mappings.len()
    }

    /// Whether a channel ever had two transfers outstanding at once: a
    /// second DMA mapping, or a transfer started before the previous
    /// asynchronous one was acknowledged and unmapped.
    pub fn overlap_detected(&self) -> bool {
        self.state().overlap
    }

    /// Number of `block_until` calls that had to wait.
    pub fn sleeps(&self) -> usize {
        self.state().sleeps
    }

    fn take_deferred(&self) -> Vec<ChannelId> {
        core::mem::take(&mut self.state().deferred)
    }

    /// Runs queued deferred passes until none are left. Returns how many ran.
    pub fn run_deferred(&self, exi: &Exi) -> usize {
        let mut passes = 0;
        loop {
            let queued = self.take_deferred();
            if queued.is_empty() {
                return passes;
            }
            for channel in queued {
                exi.run_deferred(channel);
                passes += 1;
            }
        }
    }
}

impl BusIo for MockHw {
    fn read(&self, channel: ChannelId, reg: Register) -> u32 {
        self.with_channel(channel, |ch| match reg {
            Register::Csr => ch.csr().bits(),
            Register::Mar => ch.mar,
            Register::Length => ch.length,
            Register::Cr => ch.cr,
            Register::Data => ch.data,
        })
    }

    fn write(&self, channel: ChannelId, reg: Register, value: u32) {
        let mut inner = self.state();
        let idx = channel.index();
        let ch = &mut inner.channels[idx];
        match reg {
            Register::Csr => {
                let status = Csr::STATUS.bits();
                let writable = !(status | Csr::EXT.bits());
                if value & Csr::TCINT.bits() != 0 {
                    ch.armed = false;
                }
                ch.csr = (ch.csr & status & !value) | (value & writable);
            }
            Register::Mar => ch.mar = value,
            Register::Length => ch.length = value,
            Register::Data => ch.data = value,
            Register::Cr => {
                let cr = Cr::from_bits_retain(value);
                if cr.contains(Cr::TSTART) {
                    inner.execute(idx, cr);
                    let ch = &mut inner.channels[idx];
                    ch.cr = cr.difference(Cr::TSTART).bits();
                    ch.csr |= Csr::TCINT.bits();
                } else {
                    ch.cr = value;
                }
            }
        }
    }
}

impl DmaMapper for MockHw {
    fn map(
        &self,
        device: &Device,
        buf: NonNull<u8>,
        len: usize,
        _direction: DmaDirection,
    ) -> Result<DmaAddr, DmaError> {
        let mut inner = self.state();
        if core::mem::take(&mut inner.fail_next_map) {
            return Err(DmaError::NoSpace);
        }

        let channel = device.channel().index();
        if inner.mappings.iter().any(|m| m.channel == channel) {
            inner.overlap = true;
        }

        let bus = inner.next_bus;
        let span = len.div_ceil(DMA_ALIGN) * DMA_ALIGN;
        inner.next_bus += span as u32;
        inner.mappings.push(Mapping {
            channel,
            bus,
            ptr: buf.as_ptr() as usize,
            len,
        });
        Ok(DmaAddr(bus))
    }

    fn unmap(&self, device: &Device, addr: DmaAddr, len: usize, _direction: DmaDirection) {
        let channel = device.channel().index();
        let mut inner = self.state();
        let before = inner.mappings.len();
        inner
            .mappings
            .retain(|m| !(m.channel == channel && m.bus == addr.0 && m.len == len));
        assert_eq!(inner.mappings.len() + 1, before, "unmap of unknown mapping");
    }
}

impl Platform for MockHw {
    fn schedule_deferred(&self, channel: ChannelId) {
        let mut inner = self.state();
        if !inner.deferred.contains(&channel) {
            inner.deferred.push(channel);
        }
    }

    /// Sleeping callers service the interrupt line and deferred work, the
    /// way an idle CPU would.
    fn block_until(&self, ready: &dyn Fn() -> bool) {
        let mut counted = false;
        while !ready() {
            if !counted {
                self.state().sleeps += 1;
                counted = true;
            }
            if let Some(exi) = self.exi.get().and_then(Weak::upgrade) {
                if self.irq_line() {
                    exi.handle_interrupt();
                }
                self.run_deferred(&exi);
            }
            thread::yield_now();
        }
    }

    fn relax(&self) {
        thread::yield_now();
    }
}
