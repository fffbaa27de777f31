//! EXI commands.
//!
//! A [`Command`] is one request against one channel. It is submitted once;
//! its done callback fires after every sub-transfer it caused has finished.

use alloc::boxed::Box;
use core::ptr::NonNull;

use bitflags::bitflags;

use crate::hal::DmaDirection;
use crate::regs::Cr;
use crate::{ChannelId, Device, ExiError};

bitflags! {
    /// Per-command transfer options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommandFlags: u32 {
        /// Never use DMA for this transfer
        const NO_DMA = 1 << 0;
        /// Interrupt-driven immediate mode
        const IDI = 1 << 1;
    }
}

/// Operation kind, without its operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Nop,
    Select,
    Deselect,
    Read,
    Write,
    Exchange,
}

impl Opcode {
    /// Direction field for CR
    pub(crate) fn cr_mode(self) -> Cr {
        match self {
            Opcode::Write => Cr::WRITE,
            Opcode::Exchange => Cr::READ_WRITE,
            _ => Cr::READ,
        }
    }

    pub(crate) fn dma_direction(self) -> DmaDirection {
        match self {
            Opcode::Read => DmaDirection::FromDevice,
            _ => DmaDirection::ToDevice,
        }
    }

    /// Data flows from the device into memory
    pub(crate) fn reads(self) -> bool {
        matches!(self, Opcode::Read | Opcode::Exchange)
    }
}

/// Operation with its operand.
#[derive(Debug)]
pub enum Operation<'a> {
    /// Does nothing; still serialized behind in-flight work
    Nop,
    /// Select a device on its channel
    Select(Device),
    /// Deselect whatever is selected
    Deselect,
    /// Read into the buffer
    Read(&'a mut [u8]),
    /// Write the buffer
    Write(&'a [u8]),
    /// Full-duplex exchange; rejected with [`ExiError::Unsupported`]
    Exchange(&'a mut [u8]),
}

impl Operation<'_> {
    pub fn opcode(&self) -> Opcode {
        match self {
            Operation::Nop => Opcode::Nop,
            Operation::Select(_) => Opcode::Select,
            Operation::Deselect => Opcode::Deselect,
            Operation::Read(_) => Opcode::Read,
            Operation::Write(_) => Opcode::Write,
            Operation::Exchange(_) => Opcode::Exchange,
        }
    }

    /// Operand length in bytes
    pub fn len(&self) -> usize {
        match self {
            Operation::Read(buf) | Operation::Exchange(buf) => buf.len(),
            Operation::Write(buf) => buf.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a done callback learns about its command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub channel: ChannelId,
    pub opcode: Opcode,
    /// Operand length in bytes
    pub len: usize,
    pub result: Result<(), ExiError>,
}

/// Done callback. Runs in whatever context finished the command.
pub type DoneFn = Box<dyn FnOnce(&Completion) + Send + 'static>;

/// Outcome of submitting a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Finished; the done callback already ran
    Done,
    /// Running asynchronously; the done callback runs on completion
    Pending,
}

/// A single bus request.
pub struct Command<'a> {
    pub(crate) channel: ChannelId,
    pub(crate) op: Operation<'a>,
    pub(crate) flags: CommandFlags,
    pub(crate) done: Option<DoneFn>,
}

impl<'a> Command<'a> {
    pub fn new(channel: ChannelId, op: Operation<'a>) -> Self {
        Self {
            channel,
            op,
            flags: CommandFlags::empty(),
            done: None,
        }
    }

    pub fn nop(channel: ChannelId) -> Self {
        Self::new(channel, Operation::Nop)
    }

    pub fn select(device: Device) -> Self {
        Self::new(device.channel(), Operation::Select(device))
    }

    pub fn deselect(channel: ChannelId) -> Self {
        Self::new(channel, Operation::Deselect)
    }

    pub fn read(channel: ChannelId, buf: &'a mut [u8]) -> Self {
        Self::new(channel, Operation::Read(buf))
    }

    pub fn write(channel: ChannelId, buf: &'a [u8]) -> Self {
        Self::new(channel, Operation::Write(buf))
    }

    /// Adds transfer flags
    pub fn with_flags(mut self, flags: CommandFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Sets the done callback
    pub fn on_done(mut self, done: impl FnOnce(&Completion) + Send + 'static) -> Self {
        self.done = Some(Box::new(done));
        self
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn opcode(&self) -> Opcode {
        self.op.opcode()
    }

    pub fn flags(&self) -> CommandFlags {
        self.flags
    }

    pub(crate) fn completion(&self, result: Result<(), ExiError>) -> Completion {
        Completion {
            channel: self.channel,
            opcode: self.opcode(),
            len: self.op.len(),
            result,
        }
    }
}

/// Buffer of a transfer once it left the borrow checker's view.
///
/// Valid until the command's done callback has run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawBuf {
    pub ptr: NonNull<u8>,
    pub len: usize,
}

impl RawBuf {
    pub fn from_read(buf: &mut [u8]) -> Self {
        Self {
            ptr: NonNull::new(buf.as_mut_ptr()).unwrap_or(NonNull::dangling()),
            len: buf.len(),
        }
    }

    /// Write buffers are only ever read through the pointer.
    pub fn from_write(buf: &[u8]) -> Self {
        Self {
            ptr: NonNull::new(buf.as_ptr() as *mut u8).unwrap_or(NonNull::dangling()),
            len: buf.len(),
        }
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Sub-range `[offset, offset + len)`
    pub fn slice(&self, offset: usize, len: usize) -> RawBuf {
        debug_assert!(offset + len <= self.len);
        RawBuf {
            // SAFETY: offset stays inside the original allocation.
            ptr: unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) },
            len,
        }
    }

    /// # Safety
    ///
    /// The buffer must still be live and not aliased mutably elsewhere.
    pub unsafe fn as_slice<'b>(&self) -> &'b [u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// # Safety
    ///
    /// The buffer must still be live, come from a read operation and not be
    /// aliased elsewhere.
    pub unsafe fn as_mut_slice<'b>(&self) -> &'b mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Frequency;

    #[test]
    fn test_builders() {
        let ch = ChannelId::new(0).expect("channel 0");
        let dev = Device::new(ch, 0, Frequency::MHZ_2).expect("device");
        assert_eq!(Command::select(dev).opcode(), Opcode::Select);
        assert_eq!(Command::select(dev).channel(), ch);

        let data = [1u8, 2, 3];
        let cmd = Command::write(ch, &data).with_flags(CommandFlags::NO_DMA);
        assert_eq!(cmd.opcode(), Opcode::Write);
        assert!(cmd.flags().contains(CommandFlags::NO_DMA));
        assert_eq!(cmd.completion(Ok(())).len, 3);
    }

    #[test]
    fn test_raw_buf_slicing() {
        let mut data = [0u8; 16];
        let raw = RawBuf::from_read(&mut data);
        let tail = raw.slice(10, 6);
        assert_eq!(tail.addr(), raw.addr() + 10);
        assert_eq!(tail.len, 6);
    }

    #[test]
    fn test_directions() {
        assert_eq!(Opcode::Read.dma_direction(), DmaDirection::FromDevice);
        assert_eq!(Opcode::Write.dma_direction(), DmaDirection::ToDevice);
        assert_eq!(Opcode::Write.cr_mode(), Cr::WRITE);
        assert!(Opcode::Read.reads());
    }
}
