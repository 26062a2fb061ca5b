//! # Hardware Access
//!
//! Everything the runtime does to the machine goes through [`Hardware`].
//! Two backends implement it:
//!
//! - [`mmio::Mmio`], the real registers, only built for the MIPS target.
//! - [`sim::SimBus`], an in-memory register model behind the `sim` feature,
//!   used by the test suite.
//!
//! The trait is register-shaped. Dispatch, queue and frame-sync logic lives
//! in the runtime and runs unchanged on either backend.

pub mod regs;

#[cfg(target_arch = "mips")]
pub mod mmio;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

use crate::dma::DmaChannel;
use regs::{Dicr, GpuStatus};

/// Register-level access to the interrupt controller, DMA controller, GPU
/// and root counters, plus the exception entry hook.
///
/// All methods take `&self`: registers are shared with interrupt context and
/// the backends use volatile or interior-mutable storage.
pub trait Hardware {
    /// Raw I_STAT pending flags.
    fn irq_status(&self) -> u16;
    /// Acknowledges every channel set in `bits` with a single write.
    fn acknowledge_irq(&self, bits: u16);
    fn irq_mask(&self) -> u16;
    fn set_irq_mask(&self, mask: u16);

    /// DPCR.
    fn dma_control(&self) -> u32;
    fn set_dma_control(&self, dpcr: u32);
    /// DICR.
    fn dma_interrupt(&self) -> Dicr;
    /// Writes DICR. Set flag bits acknowledge those channels.
    fn set_dma_interrupt(&self, dicr: Dicr);
    fn set_dma_address(&self, channel: DmaChannel, address: usize);
    fn set_dma_block(&self, channel: DmaChannel, bcr: u32);
    fn dma_channel_control(&self, channel: DmaChannel) -> u32;
    /// Writes CHCR. Setting [`regs::chcr::START`] kicks off the transfer.
    fn set_dma_channel_control(&self, channel: DmaChannel, chcr: u32);

    fn gp0(&self, word: u32);
    fn gp1(&self, word: u32);
    fn gpu_status(&self) -> GpuStatus;

    fn timer_value(&self, timer: usize) -> u16;
    fn set_timer_mode(&self, timer: usize, mode: u16);

    /// Applies bus timings and removes the BIOS handlers that would compete
    /// with the dispatcher. Called once, on the first reset.
    fn detach_bios(&self);
    /// Hooks the dispatcher's exception entry point, running on its own
    /// stack, and stops the BIOS from acknowledging pad and vblank
    /// interrupts behind our back.
    fn install_entry(&self);
    /// Undoes [`Hardware::install_entry`].
    fn remove_entry(&self);
    /// Recovery after a vblank timeout: clears the BIOS acknowledge latches
    /// that can swallow vblank interrupts.
    fn release_kernel_acks(&self);

    /// One iteration of a busy-wait.
    #[inline(always)]
    fn relax(&self) {
        core::hint::spin_loop();
    }

    /// Whether an enabled interrupt is pending and must be delivered by the
    /// caller. Real hardware delivers exceptions itself and always answers
    /// `false`; the simulator answers `true` so spin loops can dispatch.
    #[inline(always)]
    fn exception_pending(&self) -> bool {
        false
    }
}
