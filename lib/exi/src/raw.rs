//! Raw transfer primitives.
//!
//! These talk to the channel registers directly and never consult the
//! channel state. Every primitive is synchronous except the `start_*`
//! halves, which leave a transfer running until CR.TSTART clears.

use spin::Mutex;

use crate::command::{Opcode, RawBuf};
use crate::hal::{lock_irqsave, DmaAddr, Platform};
use crate::regs::{pack_data, unpack_data, BusIo, Cr, Csr, Register};
use crate::{ChannelId, DMA_ALIGN, IMMEDIATE_MAX};

/// Register-level view of one channel.
pub(crate) struct ChannelIo<'a> {
    pub(crate) id: ChannelId,
    pub(crate) bus: &'a dyn BusIo,
    pub(crate) platform: &'a dyn Platform,
    pub(crate) io_lock: &'a Mutex<()>,
}

impl ChannelIo<'_> {
    pub(crate) fn csr(&self) -> Csr {
        Csr::from_bits_retain(self.bus.read(self.id, Register::Csr))
    }

    /// Read-modify-write of CSR under the channel I/O lock.
    ///
    /// The closure sees the live register value, status bits included, and
    /// its result is written verbatim.
    pub(crate) fn modify_csr(&self, f: impl FnOnce(Csr) -> Csr) {
        let _io = lock_irqsave(self.io_lock, self.platform);
        let csr = self.csr();
        self.bus.write(self.id, Register::Csr, f(csr).bits());
    }

    /// Sets and clears mask bits, acknowledging only `ack` status bits
    pub(crate) fn update_csr(&self, set: Csr, clear: Csr, ack: Csr) {
        self.modify_csr(|csr| csr.difference(clear).union(set).ack(ack));
    }

    /// Asserts chip select `device` and latches clock index `freq`,
    /// preserving the interrupt masks.
    pub(crate) fn select(&self, device: u8, freq: u8) {
        self.modify_csr(|csr| csr.intersection(Csr::MASKS).union(Csr::select(device, freq)));
    }

    /// Drops every chip select line, preserving the interrupt masks.
    pub(crate) fn deselect(&self) {
        self.modify_csr(|csr| csr.intersection(Csr::MASKS));
    }

    /// Moves `buf` in immediate mode, 4 bytes at a time.
    pub(crate) fn transfer(&self, op: Opcode, buf: RawBuf) {
        let mut offset = 0;
        while buf.len - offset >= IMMEDIATE_MAX {
            self.transfer_unit(op, buf.slice(offset, IMMEDIATE_MAX));
            offset += IMMEDIATE_MAX;
        }

        match buf.len - offset {
            1 | 2 => self.transfer_unit(op, buf.slice(offset, buf.len - offset)),
            3 => {
                self.transfer_unit(op, buf.slice(offset, 2));
                self.transfer_unit(op, buf.slice(offset + 2, 1));
            }
            _ => {}
        }
    }

    /// One polled 1..=4 byte exchange through DATA.
    fn transfer_unit(&self, op: Opcode, unit: RawBuf) {
        debug_assert!((1..=IMMEDIATE_MAX).contains(&unit.len));

        if op == Opcode::Write {
            // SAFETY: unit lies inside a live command buffer.
            let bytes = unsafe { unit.as_slice() };
            self.bus.write(self.id, Register::Data, pack_data(bytes));
        }

        let cr = Cr::TSTART | Cr::tlen(unit.len) | op.cr_mode();
        self.bus.write(self.id, Register::Cr, cr.bits());
        self.spin_while_busy();

        if op.reads() {
            // SAFETY: read buffers are exclusively owned by the in-flight command.
            let bytes = unsafe { unit.as_mut_slice() };
            unpack_data(self.bus.read(self.id, Register::Data), bytes);
        }
    }

    /// Starts an interrupt-driven immediate chunk of 1..=4 bytes.
    pub(crate) fn start_idi(&self, op: Opcode, unit: RawBuf) {
        debug_assert!((1..=IMMEDIATE_MAX).contains(&unit.len));

        let mut data = !0;
        if op == Opcode::Write {
            // SAFETY: unit lies inside a live command buffer.
            data = pack_data(unsafe { unit.as_slice() });
        }
        self.bus.write(self.id, Register::Data, data);

        self.update_csr(Csr::TCINTMASK, Csr::empty(), Csr::empty());

        let cr = Cr::TSTART | Cr::tlen(unit.len) | op.cr_mode();
        self.bus.write(self.id, Register::Cr, cr.bits());
    }

    /// Collects the data of a finished interrupt-driven chunk.
    pub(crate) fn end_idi(&self, op: Opcode, unit: RawBuf) {
        debug_assert!((1..=IMMEDIATE_MAX).contains(&unit.len));

        if op.reads() {
            // SAFETY: read buffers are exclusively owned by the in-flight command.
            let bytes = unsafe { unit.as_mut_slice() };
            unpack_data(self.bus.read(self.id, Register::Data), bytes);
        }
    }

    /// Starts a DMA transfer of `len` bytes at bus address `addr`.
    pub(crate) fn start_dma(&self, op: Opcode, addr: DmaAddr, len: usize) {
        debug_assert!(addr.0 as usize % DMA_ALIGN == 0 && len % DMA_ALIGN == 0);

        // Some cards sample DATA during DMA.
        self.bus.write(self.id, Register::Data, !0);

        self.bus.write(self.id, Register::Mar, addr.0);
        self.bus.write(self.id, Register::Length, len as u32);

        self.update_csr(Csr::TCINTMASK, Csr::empty(), Csr::empty());

        let cr = Cr::TSTART | Cr::DMA | op.cr_mode();
        self.bus.write(self.id, Register::Cr, cr.bits());
    }

    /// Busy-waits for the running transfer, if any, and acknowledges it.
    ///
    /// The transfer-complete interrupt is masked first so the wait does not
    /// race the interrupt handler.
    pub(crate) fn wait_for_transfer(&self) {
        self.update_csr(Csr::empty(), Csr::TCINTMASK, Csr::empty());
        self.spin_while_busy();
        self.update_csr(Csr::empty(), Csr::empty(), Csr::TCINT);
    }

    fn spin_while_busy(&self) {
        while Cr::from_bits_retain(self.bus.read(self.id, Register::Cr)).contains(Cr::TSTART) {
            self.platform.relax();
        }
    }

    /// Whether a device is physically present on the channel
    pub(crate) fn ext_line(&self) -> bool {
        self.csr().contains(Csr::EXT)
    }

    /// Finishes any transfer, acknowledges every status bit, drops chip
    /// selects and leaves only `mask` interrupts enabled.
    pub(crate) fn quiesce(&self, mask: Csr) {
        self.wait_for_transfer();
        self.modify_csr(|_| Csr::STATUS.union(mask.intersection(Csr::MASKS)));
    }
}
