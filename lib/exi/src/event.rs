//! # Event Dispatch
//!
//! Interrupt entry and deferred event handlers.
//!
//! The interrupt handler never calls event handlers. It folds the raised
//! status bits into the channel's pending set, acknowledges them, finishes
//! the transfer step on transfer-complete, and asks the platform for a
//! deferred pass:
//!
//! ```text
//!   IRQ ──► handle_interrupt ──► pending |= status ──► schedule_deferred
//!                                                           │
//!   deselect ──► check_pending_work ────────────────────────┤
//!                                                           ▼
//!                       run_deferred: TC, IRQ, INSERT ──► handler
//! ```
//!
//! A handler runs only while every channel in its interest mask is
//! unselected. Otherwise its bit stays pending until the next pass, which
//! the deselect of the busy channel triggers.

use alloc::sync::Arc;

use crate::channel::{Channel, ChannelMask};
use crate::engine::Exi;
use crate::regs::Csr;
use crate::{ChannelId, ExiError};

/// Channel event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Device asserted its interrupt line
    Irq = 0,
    /// Device inserted or removed
    Insert = 1,
    /// Transfer completed
    TransferComplete = 2,
}

pub(crate) const EVENT_COUNT: usize = 3;

impl Event {
    /// Order in which a deferred pass looks at pending events
    pub const DISPATCH_ORDER: [Event; EVENT_COUNT] =
        [Event::TransferComplete, Event::Irq, Event::Insert];

    /// CSR status bit signalling this event
    pub const fn status_bit(self) -> Csr {
        match self {
            Event::Irq => Csr::EXIINT,
            Event::Insert => Csr::EXTIN,
            Event::TransferComplete => Csr::TCINT,
        }
    }

    /// Mask bit enabled while a handler is registered. Transfer-complete
    /// masking belongs to the transfer engine.
    const fn mask_bit(self) -> Option<Csr> {
        match self {
            Event::Irq => Some(Csr::EXIINTMASK),
            Event::Insert => Some(Csr::EXTINMASK),
            Event::TransferComplete => None,
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Event handler. Runs in deferred context and may submit commands.
pub type EventHandler = Arc<dyn Fn(&Exi, ChannelId, Event) + Send + Sync>;

/// One row of a channel's event table.
#[derive(Clone, Default)]
pub(crate) struct EventSlot {
    handler: Option<EventHandler>,
    /// Channels that must all be unselected for the handler to run
    interest: ChannelMask,
}

impl Exi {
    /// Registers `handler` for `event` on `channel`.
    ///
    /// The handler only runs while every channel in `interest` is
    /// unselected. Fails with [`ExiError::AlreadyRegistered`] if the slot is
    /// taken; the existing handler stays in place.
    pub fn register_event(
        &self,
        channel: ChannelId,
        event: Event,
        interest: ChannelMask,
        handler: impl Fn(&Exi, ChannelId, Event) + Send + Sync + 'static,
    ) -> Result<(), ExiError> {
        let ch = self.channel(channel);
        let mut state = self.lock(ch);

        let slot = &mut state.events[event.index()];
        if slot.handler.is_some() {
            log::warn!("{}: {:?} handler already registered", channel, event);
            return Err(ExiError::AlreadyRegistered);
        }
        slot.handler = Some(Arc::new(handler));
        slot.interest = interest;

        if let Some(mask) = event.mask_bit() {
            self.io(ch).update_csr(mask, Csr::empty(), event.status_bit());
        }
        log::debug!("{}: {:?} handler registered, interest {:?}", channel, event, interest);
        Ok(())
    }

    /// Removes the handler for `event` on `channel` and masks the event.
    pub fn unregister_event(&self, channel: ChannelId, event: Event) {
        let ch = self.channel(channel);
        let mut state = self.lock(ch);

        if let Some(mask) = event.mask_bit() {
            self.io(ch).update_csr(Csr::empty(), mask, event.status_bit());
        }
        state.events[event.index()] = EventSlot::default();
        log::debug!("{}: {:?} handler unregistered", channel, event);
    }

    /// Events raised on `channel` and not yet dispatched.
    pub fn pending_events(&self, channel: ChannelId) -> impl Iterator<Item = Event> {
        let pending = self.channel(channel).pending();
        Event::DISPATCH_ORDER
            .into_iter()
            .filter(move |event| pending.contains(event.status_bit()))
    }

    /// Bus interrupt entry point.
    ///
    /// Returns false if no channel had an enabled status bit raised.
    pub fn handle_interrupt(&self) -> bool {
        let mut handled = false;

        for ch in self.channels() {
            let mut status = Csr::empty();
            self.io(ch).modify_csr(|csr| {
                status = csr.active();
                csr.ack(status)
            });
            if status.is_empty() {
                continue;
            }
            handled = true;

            ch.add_pending(status);
            #[cfg(feature = "debug")]
            log::trace!("{}: interrupt status {:?}", ch.id(), status);

            if status.contains(Csr::TCINT) {
                self.wait_for_transfer_one(ch);
            }
            if status.contains(Csr::EXTIN) {
                self.platform.wake_all();
            }

            if !ch.pending().is_empty() && !ch.is_selected() {
                self.platform.schedule_deferred(ch.id());
            }
        }
        handled
    }

    /// Deferred pass for `channel`, run by the platform after
    /// [`crate::Platform::schedule_deferred`].
    pub fn run_deferred(&self, channel: ChannelId) {
        let ch = self.channel(channel);

        if self.lock(ch).in_flight.is_some() {
            log::debug!("{}: deferred pass while transfer in flight", channel);
        }

        for event in Event::DISPATCH_ORDER {
            self.cond_trigger(ch, event);
        }
    }

    /// Schedules a deferred pass for every idle channel with pending events.
    pub(crate) fn check_pending_work(&self) {
        for ch in self.channels() {
            if !ch.pending().is_empty() && !ch.is_selected() {
                self.platform.schedule_deferred(ch.id());
            }
        }
    }

    fn interest_idle(&self, interest: ChannelMask) -> bool {
        interest.channels().all(|id| !self.channel(id).is_selected())
    }

    /// Fires `event` if it is pending and its interest channels are idle.
    fn cond_trigger(&self, ch: &Channel, event: Event) {
        let state = self.lock(ch);
        let slot = &state.events[event.index()];
        if !self.interest_idle(slot.interest) || !ch.take_pending(event.status_bit()) {
            return;
        }
        let handler = slot.handler.clone();
        // Released so the handler can issue commands. The interest channels
        // were idle at check time; nothing keeps them idle during the call.
        drop(state);

        if let Some(handler) = handler {
            log::debug!("{}: dispatching {:?}", ch.id(), event);
            handler(self, ch.id(), event);
        }
    }
}
