//! # Command Execution Engine
//!
//! Drives commands through the raw primitives, one at a time per channel.
//!
//! ## Channel states
//!
//! ```text
//!          select                 read/write (DMA or IDI)
//!   IDLE ──────────► SELECTED ─────────────────────────► TRANSFERRING
//!     ▲                 │  ▲                                  │
//!     └─────────────────┘  └──────────────────────────────────┘
//!          deselect                transfer complete
//! ```
//!
//! ## Completion protocol
//!
//! Asynchronous transfers are started with the channel lock held and leave
//! an in-flight record behind. Each transfer-complete signal, delivered
//! either through [`Exi::handle_interrupt`] or by a caller busy-polling the
//! channel, runs one finish step:
//!
//! - DMA: unmap, copy a bounced read back, run the trailing immediate
//!   region, clear the record
//! - interrupt-driven immediate: collect the chunk, run a balance burst,
//!   arm the next chunk or clear the record
//!
//! The done callback runs once the record is cleared, outside the lock.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::channel::{Channel, ChannelState, ChannelStatus, InFlight, Mode};
use crate::command::{Command, CommandFlags, Completion, DoneFn, Opcode, Operation, RawBuf, Status};
use crate::hal::{lock_irqsave, DmaMapper, IrqGuard, Platform};
use crate::raw::ChannelIo;
use crate::regs::{BusIo, Csr};
use crate::split;
use crate::{
    ChannelId, Device, ExecContext, ExiConfig, ExiError, Frequency, DEVICES_PER_CHANNEL,
    IMMEDIATE_MAX, MAX_CHANNELS,
};

/// The EXI bus core: channel registry plus the services it runs on.
pub struct Exi {
    channels: [Channel; MAX_CHANNELS],
    bus: Arc<dyn BusIo>,
    dma: Arc<dyn DmaMapper>,
    pub(crate) platform: Arc<dyn Platform>,
    config: ExiConfig,
}

impl Exi {
    /// Creates the bus core. Hardware is untouched until [`Exi::init`].
    pub fn new(
        bus: Arc<dyn BusIo>,
        dma: Arc<dyn DmaMapper>,
        platform: Arc<dyn Platform>,
        config: ExiConfig,
    ) -> Self {
        Self {
            channels: crate::channel::registry(),
            bus,
            dma,
            platform,
            config,
        }
    }

    pub fn channel(&self, id: ChannelId) -> &Channel {
        &self.channels[id.index()]
    }

    pub(crate) fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub(crate) fn io<'a>(&'a self, ch: &'a Channel) -> ChannelIo<'a> {
        ch.io(&*self.bus, &*self.platform)
    }

    /// Takes the main channel lock with interrupts masked.
    pub(crate) fn lock<'a>(&'a self, ch: &'a Channel) -> IrqGuard<'a, ChannelState> {
        lock_irqsave(&ch.state, &*self.platform)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Quiesces every channel: no selection, no pending events, only
    /// [`ExiConfig::init_mask`] interrupts enabled.
    pub fn init(&self) {
        for ch in &self.channels {
            self.quiesce_channel(ch, self.config.init_mask);
        }
        log::info!("S-EXI: {} channels initialized", MAX_CHANNELS);
    }

    /// Quiesces every channel with all interrupts masked.
    pub fn shutdown(&self) {
        for ch in &self.channels {
            self.quiesce_channel(ch, Csr::empty());
        }
        log::info!("S-EXI: shut down");
    }

    fn quiesce_channel(&self, ch: &Channel, mask: Csr) {
        self.wait_for_transfer(ch);
        let mut state = self.lock(ch);
        ch.reset(&mut state);
        state.events = Default::default();
        self.io(ch).quiesce(mask);
    }

    // =========================================================================
    // Command submission
    // =========================================================================

    /// Runs one command.
    ///
    /// Returns [`Status::Pending`] when the command continues
    /// asynchronously; its done callback then runs from whichever context
    /// finishes it. Commands refused with [`ExiError::Busy`] never run their
    /// done callback; every other outcome runs it exactly once.
    pub fn run_command(&self, cmd: Command<'static>, ctx: ExecContext) -> Result<Status, ExiError> {
        // SAFETY: 'static buffers outlive any completion.
        unsafe { self.submit(cmd, ctx) }
    }

    /// Runs one command and waits until it has completely finished.
    ///
    /// Blocking callers sleep on the completion; atomic callers busy-poll
    /// the channel.
    pub fn run_command_and_wait(&self, mut cmd: Command<'_>, ctx: ExecContext) -> Result<(), ExiError> {
        let channel = cmd.channel;
        let finished = Arc::new(AtomicBool::new(false));

        let user_done = cmd.done.take();
        let flag = finished.clone();
        let platform = self.platform.clone();
        cmd.done = Some(Box::new(move |completion: &Completion| {
            if let Some(done) = user_done {
                done(completion);
            }
            flag.store(true, Ordering::Release);
            platform.wake_all();
        }));

        // SAFETY: we do not return before the done callback ran, and no
        // buffer access happens after it.
        let status = unsafe { self.submit(cmd, ctx) }?;

        if status == Status::Pending {
            if ctx.may_block() {
                self.platform.block_until(&|| finished.load(Ordering::Acquire));
            } else {
                self.wait_for_transfer(self.channel(channel));
                // Another context may have finished it and still be running
                // the callback.
                while !finished.load(Ordering::Acquire) {
                    self.platform.relax();
                }
            }
        }
        Ok(())
    }

    /// # Safety
    ///
    /// Buffers borrowed by `cmd` must stay valid until its done callback
    /// has run.
    unsafe fn submit(&self, cmd: Command<'_>, ctx: ExecContext) -> Result<Status, ExiError> {
        let completion = cmd.completion(Ok(()));
        let Command {
            channel,
            op,
            flags,
            mut done,
        } = cmd;
        let ch = self.channel(channel);

        let mut state = self.lock(ch);

        // One command in flight per channel.
        while state.in_flight.is_some() {
            log::debug!("{}: {:?} while transfer in flight", channel, completion.opcode);
            drop(state);
            self.wait_for_transfer(ch);
            state = self.lock(ch);
        }

        let result = match op {
            Operation::Nop => Ok(Status::Done),
            Operation::Select(device) if device.channel() != channel => Err(ExiError::InvalidArgument),
            Operation::Select(device) => {
                while ch.is_selected() && ctx.may_block() {
                    drop(state);
                    log::debug!("{}: select sleeping", channel);
                    self.platform.block_until(&|| !ch.is_selected());
                    state = self.lock(ch);
                }
                self.cmd_select(ch, &mut state, device).map(|()| Status::Done)
            }
            Operation::Deselect => self.cmd_deselect(ch, &mut state).map(|()| Status::Done),
            Operation::Read(buf) => {
                let buf = RawBuf::from_read(buf);
                self.cmd_transfer(ch, &mut state, Opcode::Read, buf, flags, &mut done)
            }
            Operation::Write(buf) => {
                let buf = RawBuf::from_write(buf);
                self.cmd_transfer(ch, &mut state, Opcode::Write, buf, flags, &mut done)
            }
            Operation::Exchange(_) => Err(ExiError::Unsupported),
        };

        drop(state);

        // The channel may have become idle; look for deferred events.
        if completion.opcode == Opcode::Deselect && result.is_ok() {
            self.platform.wake_all();
            self.check_pending_work();
        }

        match result {
            Ok(Status::Pending) | Err(ExiError::Busy) => {}
            Ok(Status::Done) => command_done(done, &completion),
            Err(err) => command_done(done, &Completion { result: Err(err), ..completion }),
        }
        result
    }

    /// Caller holds the channel lock.
    fn cmd_select(&self, ch: &Channel, state: &mut ChannelState, device: Device) -> Result<(), ExiError> {
        // Atomic callers cannot wait for the current owner.
        if !ch.try_acquire_select() {
            log::debug!("{}: busy, device {} not selected", ch.id(), device.index());
            return Err(ExiError::Busy);
        }

        state.device = Some(device);
        log::debug!(
            "{}: select device {} freq {}",
            ch.id(),
            device.index(),
            device.frequency().index()
        );
        self.io(ch).select(device.index(), device.frequency().index());
        Ok(())
    }

    /// Caller holds the channel lock.
    fn cmd_deselect(&self, ch: &Channel, state: &mut ChannelState) -> Result<(), ExiError> {
        if !ch.is_selected() {
            log::warn!("{}: deselect with no device selected", ch.id());
            return Err(ExiError::ProtocolViolation);
        }

        log::debug!("{}: deselect", ch.id());
        self.io(ch).deselect();
        state.device = None;
        ch.release_select();
        Ok(())
    }

    /// Starts a read or write. Caller holds the channel lock.
    ///
    /// On [`Status::Pending`] the done callback has moved into the
    /// in-flight record.
    fn cmd_transfer(
        &self,
        ch: &Channel,
        state: &mut ChannelState,
        op: Opcode,
        buf: RawBuf,
        flags: CommandFlags,
        done: &mut Option<DoneFn>,
    ) -> Result<Status, ExiError> {
        let device = match state.device {
            Some(device) if ch.is_selected() => device,
            _ => {
                log::warn!("{}: {:?} with no device selected", ch.id(), op);
                return Err(ExiError::ProtocolViolation);
            }
        };
        if buf.len == 0 {
            return Ok(Status::Done);
        }

        let io = self.io(ch);

        if flags.contains(CommandFlags::IDI) {
            let first = buf.slice(0, buf.len.min(IMMEDIATE_MAX));
            state.in_flight = Some(InFlight {
                op,
                buf,
                bytes_left: buf.len,
                mode: Mode::Immediate,
                post: None,
                done: done.take(),
            });
            io.start_idi(op, first);
            return Ok(Status::Pending);
        }

        let plan = if flags.contains(CommandFlags::NO_DMA) || !self.config.dma {
            None
        } else {
            split::plan(buf.addr(), buf.len)
        };
        let Some(plan) = plan else {
            io.transfer(op, buf);
            return Ok(Status::Done);
        };

        log::debug!(
            "{}: {:?} {} bytes as pre {} dma {} post {}{}",
            ch.id(),
            op,
            buf.len,
            plan.pre,
            plan.dma,
            plan.post,
            if plan.bounce { " (bounced)" } else { "" }
        );

        if plan.pre > 0 {
            io.transfer(op, buf.slice(0, plan.pre));
        }

        let region = buf.slice(plan.pre, plan.dma);
        let (target, bounce) = if plan.bounce {
            let scratch = &mut state.scratch.0;
            if !op.reads() {
                // SAFETY: region lies inside the live write buffer.
                scratch.copy_from_slice(unsafe { region.as_slice() });
            }
            (RawBuf::from_read(scratch), Some(region))
        } else {
            (region, None)
        };

        let direction = op.dma_direction();
        let addr = self
            .dma
            .map(&device, target.ptr, plan.dma, direction)
            .map_err(|err| {
                log::warn!("{}: DMA mapping of {} bytes failed: {:?}", ch.id(), plan.dma, err);
                ExiError::DmaMapping
            })?;

        let post = (plan.post > 0).then(|| buf.slice(plan.pre + plan.dma, plan.post));
        state.in_flight = Some(InFlight {
            op,
            buf,
            bytes_left: plan.dma + plan.post,
            mode: Mode::Dma {
                device,
                addr,
                len: plan.dma,
                bounce,
            },
            post,
            done: done.take(),
        });
        io.start_dma(op, addr, plan.dma);
        Ok(Status::Pending)
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Finishes a DMA transfer. Caller holds the channel lock.
    fn end_dma_transfer(&self, ch: &Channel, state: &mut ChannelState) -> Option<InFlight> {
        let mut flight = state.in_flight.take()?;

        if let Mode::Dma {
            device,
            addr,
            len,
            bounce,
        } = flight.mode
        {
            self.dma.unmap(&device, addr, len, flight.op.dma_direction());
            if let Some(region) = bounce {
                if flight.op.reads() {
                    // SAFETY: the caller's region is live until done runs.
                    let out = unsafe { region.as_mut_slice() };
                    out.copy_from_slice(&state.scratch.0[..region.len]);
                }
            }
        }

        if let Some(post) = flight.post.take() {
            log::debug!("{}: post transfer of {} bytes", ch.id(), post.len);
            self.io(ch).transfer(flight.op, post);
        }
        flight.bytes_left = 0;
        Some(flight)
    }

    /// Finishes an interrupt-driven immediate chunk and arms the next one.
    /// Caller holds the channel lock.
    ///
    /// Returns true while more chunks are outstanding.
    fn end_idi_transfer(&self, ch: &Channel, state: &mut ChannelState) -> bool {
        let balance = self.config.idi_balance;
        let io = self.io(ch);
        let Some(flight) = state.in_flight.as_mut() else {
            return false;
        };

        let mut offset = flight.buf.len - flight.bytes_left;
        let mut len = flight.bytes_left.min(IMMEDIATE_MAX);
        io.end_idi(flight.op, flight.buf.slice(offset, len));
        flight.bytes_left -= len;

        if balance > 0 && flight.bytes_left > 0 {
            offset += len;
            len = flight.bytes_left.min(balance);
            io.transfer(flight.op, flight.buf.slice(offset, len));
            flight.bytes_left -= len;
        }

        if flight.bytes_left == 0 {
            return false;
        }

        offset = flight.buf.len - flight.bytes_left;
        len = flight.bytes_left.min(IMMEDIATE_MAX);
        io.start_idi(flight.op, flight.buf.slice(offset, len));
        true
    }

    /// Waits for the channel's current transfer step and finishes it.
    ///
    /// Returns true while the in-flight command needs further steps.
    pub(crate) fn wait_for_transfer_one(&self, ch: &Channel) -> bool {
        let mut state = self.lock(ch);

        self.io(ch).wait_for_transfer();

        let dma = match state.in_flight.as_ref() {
            Some(flight) => flight.is_dma(),
            None => return false,
        };
        let finished = if dma {
            self.end_dma_transfer(ch, &mut state)
        } else if self.end_idi_transfer(ch, &mut state) {
            return true;
        } else {
            state.in_flight.take()
        };
        drop(state);

        if let Some(flight) = finished {
            let completion = Completion {
                channel: ch.id(),
                opcode: flight.op,
                len: flight.buf.len,
                result: Ok(()),
            };
            command_done(flight.done, &completion);
        }
        false
    }

    /// Busy-polls until the channel has no command in flight.
    pub(crate) fn wait_for_transfer(&self, ch: &Channel) {
        while self.wait_for_transfer_one(ch) {
            self.platform.relax();
        }
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    /// Selects `device` on its channel.
    ///
    /// Blocking callers wait for the current owner to deselect; atomic
    /// callers get [`ExiError::Busy`].
    pub fn select(&self, device: &Device, ctx: ExecContext) -> Result<(), ExiError> {
        self.run_command(Command::select(*device), ctx).map(|_| ())
    }

    /// Deselects the device selected on `channel`.
    pub fn deselect(&self, channel: ChannelId, ctx: ExecContext) -> Result<(), ExiError> {
        self.run_command(Command::deselect(channel), ctx).map(|_| ())
    }

    /// Runs a read or write on `channel` and waits for it.
    pub fn transfer(
        &self,
        channel: ChannelId,
        op: Operation<'_>,
        flags: CommandFlags,
        ctx: ExecContext,
    ) -> Result<(), ExiError> {
        self.run_command_and_wait(Command::new(channel, op).with_flags(flags), ctx)
    }

    pub fn read(&self, channel: ChannelId, buf: &mut [u8], flags: CommandFlags, ctx: ExecContext) -> Result<(), ExiError> {
        self.transfer(channel, Operation::Read(buf), flags, ctx)
    }

    pub fn write(&self, channel: ChannelId, buf: &[u8], flags: CommandFlags, ctx: ExecContext) -> Result<(), ExiError> {
        self.transfer(channel, Operation::Write(buf), flags, ctx)
    }

    /// Raw chip select, bypassing channel arbitration.
    pub fn select_raw(&self, channel: ChannelId, device: u8, frequency: Frequency) -> Result<(), ExiError> {
        if device >= DEVICES_PER_CHANNEL {
            return Err(ExiError::InvalidArgument);
        }
        self.io(self.channel(channel)).select(device, frequency.index());
        Ok(())
    }

    /// Raw deselect, bypassing channel arbitration.
    pub fn deselect_raw(&self, channel: ChannelId) {
        self.io(self.channel(channel)).deselect();
    }

    /// Raw immediate-mode transfer, bypassing channel arbitration.
    pub fn transfer_raw(&self, channel: ChannelId, op: Operation<'_>) -> Result<(), ExiError> {
        let io = self.io(self.channel(channel));
        match op {
            Operation::Read(buf) => io.transfer(Opcode::Read, RawBuf::from_read(buf)),
            Operation::Write(buf) => io.transfer(Opcode::Write, RawBuf::from_write(buf)),
            Operation::Nop => {}
            _ => return Err(ExiError::Unsupported),
        }
        Ok(())
    }

    /// Raw state of the insertion line: a device is physically present.
    pub fn insertion_line(&self, channel: ChannelId) -> bool {
        self.io(self.channel(channel)).ext_line()
    }

    pub fn channel_status(&self, channel: ChannelId) -> ChannelStatus {
        let ch = self.channel(channel);
        let state = self.lock(ch);
        match state.in_flight.as_ref() {
            Some(flight) => ChannelStatus::Transferring { dma: flight.is_dma() },
            None if ch.is_selected() => ChannelStatus::Selected,
            None => ChannelStatus::Idle,
        }
    }

    pub fn selected_device(&self, channel: ChannelId) -> Option<Device> {
        self.lock(self.channel(channel)).device
    }
}

/// Runs a done callback, if any.
fn command_done(done: Option<DoneFn>, completion: &Completion) {
    if let Some(done) = done {
        done(completion);
    }
}
