//! Platform services consumed by the bus core.
//!
//! The bus core never touches the interrupt controller, the scheduler or
//! the IOMMU directly. The embedding kernel supplies them through
//! [`DmaMapper`] and [`Platform`] alongside [`crate::BusIo`].

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use spin::{Mutex, MutexGuard};

use crate::{ChannelId, Device};

/// Direction of a DMA mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Memory is read by the device
    ToDevice,
    /// Memory is written by the device
    FromDevice,
}

/// Bus address of a mapped buffer, as programmed into MAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaAddr(pub u32);

/// DMA mapping errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// No mapping space left
    NoSpace,
    /// Buffer not reachable by the device
    Unreachable,
}

/// DMA buffer mapping service.
pub trait DmaMapper: Send + Sync {
    /// Makes `len` bytes at `buf` visible to `device` and returns the bus
    /// address. `buf` is 32-byte aligned and `len` a multiple of 32.
    fn map(
        &self,
        device: &Device,
        buf: NonNull<u8>,
        len: usize,
        direction: DmaDirection,
    ) -> Result<DmaAddr, DmaError>;

    /// Releases a mapping returned by [`DmaMapper::map`]
    fn unmap(&self, device: &Device, addr: DmaAddr, len: usize, direction: DmaDirection);
}

/// Scheduling and interrupt services.
pub trait Platform: Send + Sync {
    /// Queues the deferred step for `channel`.
    ///
    /// The platform must eventually call [`crate::Exi::run_deferred`] for
    /// that channel. Requests may be coalesced.
    fn schedule_deferred(&self, channel: ChannelId);

    /// Suspends the caller until `ready` returns true.
    ///
    /// Only called from [`crate::ExecContext::Blocking`]. The condition is
    /// re-evaluated after every [`Platform::wake_all`].
    fn block_until(&self, ready: &dyn Fn() -> bool) {
        while !ready() {
            self.relax();
        }
    }

    /// Wakes every caller suspended in [`Platform::block_until`]
    fn wake_all(&self) {}

    /// Pause hint inside busy-wait loops
    fn relax(&self) {
        core::hint::spin_loop();
    }

    /// Masks local interrupts, returning the previous state
    fn irq_save(&self) -> usize {
        0
    }

    /// Restores the state returned by [`Platform::irq_save`]
    fn irq_restore(&self, _flags: usize) {}
}

/// Spin lock guard that keeps local interrupts masked while held.
pub struct IrqGuard<'a, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    platform: &'a dyn Platform,
    flags: usize,
}

/// Takes `lock` with local interrupts masked.
///
/// Channel locks are shared with the interrupt handler, so they must never
/// be held with interrupts enabled.
pub fn lock_irqsave<'a, T>(lock: &'a Mutex<T>, platform: &'a dyn Platform) -> IrqGuard<'a, T> {
    let flags = platform.irq_save();
    IrqGuard {
        guard: ManuallyDrop::new(lock.lock()),
        platform,
        flags,
    }
}

impl<T> Deref for IrqGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before unmasking.
        // SAFETY: the guard is dropped exactly once, here, and never used after.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.platform.irq_restore(self.flags);
    }
}
