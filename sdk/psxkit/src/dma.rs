//! # DMA Completion Router
//!
//! All seven DMA channels share [`IrqChannel::Dma`]. DICR tells them apart:
//!
//! ```text
//!  31   30..24      23       22..16          15
//! [M]  [flags]  [master]  [enables]  ...  [force]
//! ```
//!
//! The router is registered on the DMA interrupt channel only while at least
//! one per-channel handler exists.

use core::cell::Cell;

use log::{debug, warn};

use crate::critical::CriticalSection;
use crate::error::Error;
use crate::hw::Hardware;
use crate::hw::regs::{DMA_CHANNELS, Dicr};
use crate::irq::{Handler, IrqChannel, Route};
use crate::Console;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DmaChannel {
    MdecIn = 0,
    MdecOut = 1,
    Gpu = 2,
    Cdrom = 3,
    Spu = 4,
    Pio = 5,
    /// Ordering table clear.
    Otc = 6,
}

impl DmaChannel {
    pub const ALL: [DmaChannel; DMA_CHANNELS] = [
        DmaChannel::MdecIn,
        DmaChannel::MdecOut,
        DmaChannel::Gpu,
        DmaChannel::Cdrom,
        DmaChannel::Spu,
        DmaChannel::Pio,
        DmaChannel::Otc,
    ];

    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for DmaChannel {
    type Error = Error;

    fn try_from(index: u8) -> Result<Self, Error> {
        DmaChannel::ALL
            .get(index as usize)
            .copied()
            .ok_or(Error::InvalidChannel(index))
    }
}

/// Upper bound on DICR re-reads per DMA interrupt.
const DISPATCH_PASSES: usize = 32;

pub(crate) struct DmaRouter {
    handlers: [Cell<Option<Handler>>; DMA_CHANNELS],
    count: Cell<usize>,
}

impl DmaRouter {
    pub(crate) const fn new() -> Self {
        Self {
            handlers: [const { Cell::new(None) }; DMA_CHANNELS],
            count: Cell::new(0),
        }
    }

    pub(crate) fn clear(&self) {
        for handler in &self.handlers {
            handler.set(None);
        }
        self.count.set(0);
    }
}

/// Decodes a DPCR nibble: bits 0..2 priority, bit 3 enable.
fn nibble_priority(nibble: u32) -> Option<u8> {
    if nibble & 0b1000 != 0 {
        Some((nibble & 0b111) as u8)
    } else {
        None
    }
}

impl<H: Hardware> Console<H> {
    /// Registers a completion handler for `channel` and returns the previous
    /// one. `None` removes it.
    pub fn register_dma(&self, channel: DmaChannel, handler: Option<Handler>) -> Option<Handler> {
        let cs = CriticalSection::enter(&self.hw);
        self.register_dma_in(&cs, channel, handler)
    }

    pub(crate) fn register_dma_in(
        &self,
        cs: &CriticalSection<'_, H>,
        channel: DmaChannel,
        handler: Option<Handler>,
    ) -> Option<Handler> {
        let previous = self.dma.handlers[channel.index()].replace(handler);
        let bit = 1u8 << channel.index();

        match (previous.is_some(), handler.is_some()) {
            (false, true) => {
                let count = self.dma.count.get() + 1;
                self.dma.count.set(count);

                self.update_dicr(|dicr| {
                    dicr.set_channel_enables(dicr.channel_enables() | bit);
                    dicr.set_master_enable(true);
                });
                if count == 1 {
                    debug!("dma router installed");
                    self.register_irq_in(cs, IrqChannel::Dma, Some(Handler::Route(Route::DmaRouter)));
                }
            }
            (true, false) => {
                let count = self.dma.count.get() - 1;
                self.dma.count.set(count);

                if count == 0 {
                    debug!("dma router removed");
                    self.update_dicr(|dicr| *dicr = Dicr(0));
                    self.register_irq_in(cs, IrqChannel::Dma, None);
                } else {
                    self.update_dicr(|dicr| {
                        dicr.set_channel_enables(dicr.channel_enables() & !bit);
                    });
                }
            }
            _ => {}
        }

        previous
    }

    pub fn dma_handler(&self, channel: DmaChannel) -> Option<Handler> {
        self.dma.handlers[channel.index()].get()
    }

    /// Number of channels with a completion handler.
    pub fn dma_handler_count(&self) -> usize {
        self.dma.count.get()
    }

    /// Read-modify-write of the DICR control bits. Pending flags are never
    /// written back. While the dispatcher is stopped the saved copy is
    /// edited instead.
    fn update_dicr(&self, edit: impl FnOnce(&mut Dicr)) {
        if self.irq.installed() {
            let mut dicr = self.hw.dma_interrupt().without_flags();
            edit(&mut dicr);
            self.hw.set_dma_interrupt(dicr.without_flags());
        } else {
            let mut saved = self.irq.saved();
            let mut dicr = saved.dma_interrupt.without_flags();
            edit(&mut dicr);
            saved.dma_interrupt = dicr.without_flags();
            self.irq.set_saved(saved);
        }
    }

    /// Demultiplexes one DMA interrupt. Every flagged, enabled channel is
    /// acknowledged with a single DICR write before handlers run in
    /// ascending channel order.
    ///
    /// The controller only interrupts when the DICR master flag rises, so
    /// DICR is read again until no flags are left. A flag set between the
    /// read and the acknowledge would otherwise never be delivered.
    pub(crate) fn dispatch_dma(&self) {
        for _ in 0..DISPATCH_PASSES {
            let dicr = self.hw.dma_interrupt();
            let pending = dicr.flags() & dicr.channel_enables();
            if pending == 0 {
                return;
            }

            let mut ack = dicr.without_flags();
            ack.set_flags(pending);
            self.hw.set_dma_interrupt(ack);

            let mut bits = pending;
            while bits != 0 {
                let index = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                if let Some(handler) = self.dma.handlers[index].get() {
                    self.invoke(handler);
                }
            }
        }
        warn!("dma flags still pending after {} passes", DISPATCH_PASSES);
    }

    /// Sets the DPCR priority of `channel` (0..7) and enables it, or disables
    /// it with `None`. Returns the previous priority, `None` if the channel
    /// was disabled.
    pub fn set_dma_priority(&self, channel: DmaChannel, priority: Option<u8>) -> Option<u8> {
        let cs = CriticalSection::enter(&self.hw);
        self.set_dma_priority_in(&cs, channel, priority)
    }

    pub(crate) fn set_dma_priority_in(
        &self,
        _cs: &CriticalSection<'_, H>,
        channel: DmaChannel,
        priority: Option<u8>,
    ) -> Option<u8> {
        let shift = channel.index() * 4;
        let mut dpcr = self.hw.dma_control();
        let previous = nibble_priority(dpcr >> shift);

        dpcr &= !(0xf << shift);
        if let Some(priority) = priority {
            dpcr |= ((priority as u32 & 0b111) | 0b1000) << shift;
        }
        self.hw.set_dma_control(dpcr);

        previous
    }

    pub fn dma_priority(&self, channel: DmaChannel) -> Option<u8> {
        nibble_priority(self.hw.dma_control() >> (channel.index() * 4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::SimBus;

    fn noop() {}

    #[test]
    fn channel_indices_are_validated() {
        assert_eq!(DmaChannel::try_from(6), Ok(DmaChannel::Otc));
        assert_eq!(DmaChannel::try_from(7), Err(Error::InvalidChannel(7)));
    }

    #[test]
    fn priority_round_trips_through_dpcr() {
        let console = Console::new(SimBus::new());
        console.reset_callback().unwrap();

        // baseline has every channel disabled
        assert_eq!(console.dma_priority(DmaChannel::Gpu), None);
        assert_eq!(console.set_dma_priority(DmaChannel::Gpu, Some(3)), None);
        assert_eq!(console.dma_priority(DmaChannel::Gpu), Some(3));
        assert_eq!(console.hardware().dma_control(), 0x0333_3b33);

        assert_eq!(console.set_dma_priority(DmaChannel::Gpu, None), Some(3));
        assert_eq!(console.hardware().dma_control(), 0x0333_3033);
    }

    #[test]
    fn enable_bits_follow_registrations() {
        let console = Console::new(SimBus::new());
        console.reset_callback().unwrap();

        console.register_dma(DmaChannel::Spu, Some(Handler::Callback(noop)));
        console.register_dma(DmaChannel::Cdrom, Some(Handler::Callback(noop)));
        let dicr = console.hardware().dma_interrupt();
        assert_eq!(dicr.channel_enables(), 0b0001_1000);
        assert!(dicr.master_enable());

        console.register_dma(DmaChannel::Spu, None);
        let dicr = console.hardware().dma_interrupt();
        assert_eq!(dicr.channel_enables(), 0b0000_1000);
        assert_eq!(console.dma_handler_count(), 1);
        assert_eq!(
            console.irq_handler(IrqChannel::Dma),
            Some(Handler::Route(Route::DmaRouter))
        );
    }
}
