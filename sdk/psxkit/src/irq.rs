//! # Interrupt Dispatcher
//!
//! The console has a single exception vector. Every interrupt source funnels
//! through [`Console::handle_exception`], which fans out to one optional
//! [`Handler`] per [`IrqChannel`].
//!
//! | Bit | Channel   | Source                                   |
//! |-----|-----------|------------------------------------------|
//! | 0   | `VBlank`  | Vertical blank                           |
//! | 1   | `Gpu`     | `GP0(1Fh)` interrupt request             |
//! | 2   | `Cdrom`   | CD-ROM controller                        |
//! | 3   | `Dma`     | Any DMA completion, see [`crate::dma`]   |
//! | 4-6 | `TimerN`  | Root counters 0, 1, 2                    |
//! | 7   | `Sio0`    | Controller and memory card port          |
//! | 8   | `Sio1`    | Serial port                              |
//! | 9   | `Spu`     | Sound processor                          |
//! | 10  | `Pio`     | Expansion port / lightpen                |
//!
//! A channel's I_MASK bit is set exactly when a handler is registered for
//! it. Handlers run with interrupts masked and never nest.

use core::cell::Cell;
use core::fmt;

use bit_field::BitField;
use log::debug;

use crate::critical::CriticalSection;
use crate::error::Error;
use crate::hw::Hardware;
use crate::hw::regs::{Dicr, DPCR_BASELINE, IRQ_ALL, IRQ_CHANNELS, gp1};
use crate::queue::CompletionKind;
use crate::Console;

/// Size of the dedicated stack handlers run on.
pub const ISR_STACK_SIZE: usize = 0x1000;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IrqChannel {
    VBlank = 0,
    Gpu = 1,
    Cdrom = 2,
    Dma = 3,
    Timer0 = 4,
    Timer1 = 5,
    Timer2 = 6,
    Sio0 = 7,
    Sio1 = 8,
    Spu = 9,
    Pio = 10,
}

impl IrqChannel {
    pub const ALL: [IrqChannel; IRQ_CHANNELS] = [
        IrqChannel::VBlank,
        IrqChannel::Gpu,
        IrqChannel::Cdrom,
        IrqChannel::Dma,
        IrqChannel::Timer0,
        IrqChannel::Timer1,
        IrqChannel::Timer2,
        IrqChannel::Sio0,
        IrqChannel::Sio1,
        IrqChannel::Spu,
        IrqChannel::Pio,
    ];

    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// This channel's bit in I_STAT and I_MASK.
    #[inline(always)]
    pub const fn bit(self) -> u16 {
        1 << self as u16
    }
}

impl TryFrom<u8> for IrqChannel {
    type Error = Error;

    fn try_from(index: u8) -> Result<Self, Error> {
        IrqChannel::ALL
            .get(index as usize)
            .copied()
            .ok_or(Error::InvalidChannel(index))
    }
}

/// Runtime consumers chained off the dispatcher.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// DMA completion demultiplexer on [`IrqChannel::Dma`].
    DmaRouter,
    /// Frame counter and vblank hook on [`IrqChannel::VBlank`].
    VBlank,
    /// Draw queue completion through the GPU DMA channel.
    GpuDma,
    /// Draw queue completion through [`IrqChannel::Gpu`].
    GpuIrq,
}

/// What runs when a channel fires.
#[derive(Copy, Clone)]
pub enum Handler {
    Callback(fn()),
    Route(Route),
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Handler::Callback(a), Handler::Callback(b)) => *a as usize == *b as usize,
            (Handler::Route(a), Handler::Route(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Handler {}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Callback(callback) => write!(f, "Callback({:#x})", *callback as usize),
            Handler::Route(route) => write!(f, "Route({:?})", route),
        }
    }
}

impl From<fn()> for Handler {
    fn from(callback: fn()) -> Self {
        Handler::Callback(callback)
    }
}

/// Controller state captured by [`Console::stop_callback`] and applied by
/// [`Console::restart_callback`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SavedState {
    pub irq_mask: u16,
    pub dma_control: u32,
    pub dma_interrupt: Dicr,
}

impl SavedState {
    /// Everything masked, every DMA channel disabled at priority 3.
    pub const BASELINE: SavedState = SavedState {
        irq_mask: 0,
        dma_control: DPCR_BASELINE,
        dma_interrupt: Dicr(0),
    };
}

pub(crate) struct Dispatcher {
    handlers: [Cell<Option<Handler>>; IRQ_CHANNELS],
    installed: Cell<bool>,
    in_exception: Cell<bool>,
    saved: Cell<SavedState>,
}

impl Dispatcher {
    pub(crate) const fn new() -> Self {
        Self {
            handlers: [const { Cell::new(None) }; IRQ_CHANNELS],
            installed: Cell::new(false),
            in_exception: Cell::new(false),
            saved: Cell::new(SavedState::BASELINE),
        }
    }

    #[inline(always)]
    pub(crate) fn installed(&self) -> bool {
        self.installed.get()
    }

    pub(crate) fn saved(&self) -> SavedState {
        self.saved.get()
    }

    pub(crate) fn set_saved(&self, saved: SavedState) {
        self.saved.set(saved);
    }
}

impl<H: Hardware> Console<H> {
    /// Registers `handler` for `channel`, or removes the current one with
    /// `None`, and returns whatever was there before.
    pub fn register_irq(&self, channel: IrqChannel, handler: Option<Handler>) -> Option<Handler> {
        let cs = CriticalSection::enter(&self.hw);
        self.register_irq_in(&cs, channel, handler)
    }

    pub(crate) fn register_irq_in(
        &self,
        cs: &CriticalSection<'_, H>,
        channel: IrqChannel,
        handler: Option<Handler>,
    ) -> Option<Handler> {
        let previous = self.irq.handlers[channel.index()].replace(handler);
        let enabled = handler.is_some();

        if self.irq.installed() {
            let mut mask = cs.mask();
            mask.set_bit(channel.index(), enabled);
            cs.set_mask(mask);
        } else {
            // applied by restart_callback
            let mut saved = self.irq.saved();
            saved.irq_mask.set_bit(channel.index(), enabled);
            self.irq.set_saved(saved);
        }

        previous
    }

    pub fn irq_handler(&self, channel: IrqChannel) -> Option<Handler> {
        self.irq.handlers[channel.index()].get()
    }

    /// Clears every handler, resets the saved state to
    /// [`SavedState::BASELINE`] and installs the dispatcher.
    pub fn reset_callback(&self) -> Result<(), Error> {
        if self.irq.installed() {
            return Err(Error::AlreadyInstalled);
        }

        self.hw.set_irq_mask(0);
        for handler in &self.irq.handlers {
            handler.set(None);
        }
        self.dma.clear();
        self.irq.set_saved(SavedState::BASELINE);

        self.hw.detach_bios();
        self.restart_callback();
        Ok(())
    }

    /// Reinstalls the dispatcher after [`Console::stop_callback`] and applies
    /// the saved controller state.
    pub fn restart_callback(&self) {
        if self.irq.installed() {
            return;
        }

        let saved = self.irq.saved();
        self.hw.acknowledge_irq(IRQ_ALL);
        self.hw.install_entry();
        self.hw.set_dma_control(saved.dma_control);
        self.hw.set_dma_interrupt(saved.dma_interrupt.without_flags());
        self.irq.installed.set(true);
        self.hw.set_irq_mask(saved.irq_mask);

        debug!("dispatcher installed, mask {:03X}", saved.irq_mask);
    }

    /// Saves the controller state, masks and acknowledges everything,
    /// disables every DMA channel and removes the exception hook.
    pub fn stop_callback(&self) {
        if !self.irq.installed() {
            return;
        }

        let saved = SavedState {
            irq_mask: self.hw.irq_mask(),
            dma_control: self.hw.dma_control(),
            dma_interrupt: self.hw.dma_interrupt().without_flags(),
        };

        self.hw.set_irq_mask(0);
        self.hw.acknowledge_irq(IRQ_ALL);
        self.hw.set_dma_control(saved.dma_control & crate::hw::regs::DPCR_DISABLE_ALL);
        self.hw.set_dma_interrupt(Dicr(0));
        self.hw.remove_entry();

        self.irq.set_saved(saved);
        self.irq.installed.set(false);

        debug!("dispatcher stopped, saved {:?}", saved);
    }

    pub fn is_installed(&self) -> bool {
        self.irq.installed()
    }

    /// The state [`Console::restart_callback`] will apply.
    pub fn saved_state(&self) -> SavedState {
        self.irq.saved()
    }

    /// Body of the exception entry point.
    ///
    /// Reads I_STAT and I_MASK once, acknowledges every enabled pending
    /// channel in one write, then runs their handlers from bit 0 upwards.
    /// Anything raised while handlers run is left for the next exception.
    pub fn handle_exception(&self) {
        self.irq.in_exception.set(true);

        let mask = self.hw.irq_mask();
        let pending = self.hw.irq_status() & mask;
        if pending != 0 {
            self.hw.acknowledge_irq(pending);
        }

        let mut bits = pending;
        while bits != 0 {
            let index = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            if let Some(handler) = self.irq.handlers[index].get() {
                self.invoke(handler);
            }
        }

        self.irq.in_exception.set(false);
    }

    /// Takes an exception the backend reports as pending. Hardware that
    /// vectors exceptions itself never has one, so this is a no-op there.
    pub fn deliver_pending(&self) {
        if !self.irq.in_exception.get() && self.hw.exception_pending() {
            self.handle_exception();
        }
    }

    /// One iteration of a foreground busy-wait.
    #[inline(always)]
    pub(crate) fn spin_once(&self) {
        self.hw.relax();
        self.deliver_pending();
    }

    pub(crate) fn invoke(&self, handler: Handler) {
        match handler {
            Handler::Callback(callback) => callback(),
            Handler::Route(Route::DmaRouter) => self.dispatch_dma(),
            Handler::Route(Route::VBlank) => self.on_vblank(),
            Handler::Route(Route::GpuDma) => self.on_draw_complete(CompletionKind::Dma),
            Handler::Route(Route::GpuIrq) => {
                self.hw.gp1(gp1::ACK_IRQ);
                self.on_draw_complete(CompletionKind::GpuIrq);
            }
        }
    }
}
