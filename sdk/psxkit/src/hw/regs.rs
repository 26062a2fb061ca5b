//! # Register Layouts
//!
//! Bit definitions for the registers the runtime touches.
//!
//! | Address            | Name     | Use                                          |
//! |--------------------|----------|----------------------------------------------|
//! | `$1F801070`        | I_STAT   | Pending interrupt flags (write 0 to ack)     |
//! | `$1F801074`        | I_MASK   | Interrupt enable mask                        |
//! | `$1F801080 + 16*n` | MADR     | DMA channel base address                     |
//! | `$1F801084 + 16*n` | BCR      | DMA channel block size / count               |
//! | `$1F801088 + 16*n` | CHCR     | DMA channel control and trigger              |
//! | `$1F8010F0`        | DPCR     | DMA priority / enable, one nibble per channel|
//! | `$1F8010F4`        | DICR     | DMA completion interrupt enable and flags    |
//! | `$1F801810`        | GP0      | GPU rendering command FIFO                   |
//! | `$1F801814`        | GP1      | GPU display control (write) / GPUSTAT (read) |
//! | `$1F801100 + 16*n` | TIMERn   | Root counters                                |

use bitfield::bitfield;

/// Number of channels implemented by the interrupt controller.
pub const IRQ_CHANNELS: usize = 11;
/// Number of DMA channels.
pub const DMA_CHANNELS: usize = 7;

/// Every interrupt channel bit.
pub const IRQ_ALL: u16 = (1 << IRQ_CHANNELS) - 1;

/// DPCR value the dispatcher restores on its first install: every channel
/// disabled at priority 3.
pub const DPCR_BASELINE: u32 = 0x0333_3333;
/// Clears the enable bit of every DPCR nibble while keeping priorities.
pub const DPCR_DISABLE_ALL: u32 = 0x0777_7777;

/// Root counter 1 counts hblanks once [`TIMER_HBLANK_MODE`] is applied.
pub const HBLANK_TIMER: usize = 1;
/// Counter mode used for timers 0 and 1 after a full GPU reset.
pub const TIMER_HBLANK_MODE: u16 = 0x0500;

/// Bus timing applied to the common delay register on reset.
pub const COM_DELAY: u32 = 0x0000_1325;

bitflags::bitflags! {
    /// GPUSTAT bits consulted by the queue, the frame sync and the
    /// environment builder.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct GpuStatus: u32 {
        /// Video output is PAL (clear for NTSC).
        const PAL             = 1 << 20;
        /// Interlaced output is enabled.
        const INTERLACED      = 1 << 22;
        /// The GPU interrupt request flag (set by `GP0(1Fh)`).
        const IRQ             = 1 << 24;
        /// Ready to receive a GP0 command word.
        const READY_CMD       = 1 << 26;
        /// Ready to send VRAM contents to the CPU.
        const READY_VRAM_SEND = 1 << 27;
        /// Ready to receive a DMA block.
        const READY_DMA_BLOCK = 1 << 28;
        /// DMA direction field (0 = off, 2 = CPU to GP0, 3 = GPUREAD to CPU).
        const DMA_DIRECTION   = 0b11 << 29;
        /// Field currently being scanned out when interlaced.
        const ODD_FIELD       = 1 << 31;
    }
}

impl GpuStatus {
    /// Status of an idle GPU with nothing in flight.
    pub const IDLE: GpuStatus = GpuStatus::READY_CMD
        .union(GpuStatus::READY_VRAM_SEND)
        .union(GpuStatus::READY_DMA_BLOCK);
}

bitfield! {
    /// DMA interrupt register (DICR).
    ///
    /// Flag bits 24..30 are write-1-to-clear, so any read-modify-write must
    /// go through [`Dicr::without_flags`] first.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Dicr(u32);
    impl Debug;
    pub force_irq, set_force_irq: 15;
    pub u8, channel_enables, set_channel_enables: 22, 16;
    pub master_enable, set_master_enable: 23;
    pub u8, flags, set_flags: 30, 24;
    pub master_flag, _: 31;
}

impl Dicr {
    /// Bits 0..23, the part of the register that is plain read/write.
    pub const CONTROL_MASK: u32 = 0x00ff_ffff;

    /// Copy with every flag bit cleared, safe to write back.
    #[inline(always)]
    pub fn without_flags(self) -> Dicr {
        Dicr(self.0 & Self::CONTROL_MASK)
    }
}

/// GP1 display control commands (top byte of the word).
pub mod gp1 {
    pub const RESET: u32 = 0x0000_0000;
    pub const RESET_BUFFER: u32 = 0x0100_0000;
    pub const ACK_IRQ: u32 = 0x0200_0000;
    pub const DISPLAY_ENABLE: u32 = 0x0300_0000;
    pub const DMA_DIRECTION: u32 = 0x0400_0000;
    pub const DISPLAY_AREA: u32 = 0x0500_0000;
    pub const H_RANGE: u32 = 0x0600_0000;
    pub const V_RANGE: u32 = 0x0700_0000;
    pub const VIDEO_MODE: u32 = 0x0800_0000;

    /// `DMA_DIRECTION` arguments.
    pub const DMA_OFF: u32 = 0;
    pub const DMA_TO_GP0: u32 = 2;
    pub const DMA_FROM_GPUREAD: u32 = 3;
}

/// GP0 commands issued by the runtime itself.
pub mod gp0 {
    pub const FLUSH_CACHE: u32 = 0x0100_0000;
    pub const FILL_RECT: u32 = 0x0200_0000;
    pub const IRQ_REQUEST: u32 = 0x1f00_0000;
    pub const VRAM_LOAD: u32 = 0xa000_0000;
    pub const VRAM_STORE: u32 = 0xc000_0000;
    pub const TEXPAGE: u32 = 0xe100_0000;
    pub const TEXWINDOW: u32 = 0xe200_0000;
    pub const CLIP_TOP_LEFT: u32 = 0xe300_0000;
    pub const CLIP_BOTTOM_RIGHT: u32 = 0xe400_0000;
    pub const DRAW_OFFSET: u32 = 0xe500_0000;
}

/// CHCR bits and the control words the runtime writes.
pub mod chcr {
    /// Transfer direction is RAM to device.
    pub const FROM_RAM: u32 = 1 << 0;
    /// Walk memory downwards. Required by the OTC channel.
    pub const ADDRESS_DECREMENT: u32 = 1 << 1;
    /// Sync mode field, bits 9..10.
    pub const SYNC_MODE_SHIFT: u32 = 9;
    pub const SYNC_BLOCK: u32 = 1 << SYNC_MODE_SHIFT;
    pub const SYNC_LINKED_LIST: u32 = 2 << SYNC_MODE_SHIFT;
    /// Start / busy bit.
    pub const START: u32 = 1 << 24;
    /// Manual trigger for sync mode 0.
    pub const TRIGGER: u32 = 1 << 28;

    /// Stop the GPU channel, direction RAM to device.
    pub const GPU_STOP: u32 = SYNC_BLOCK | FROM_RAM;
    /// Stop the ordering-table clear channel.
    pub const OTC_STOP: u32 = SYNC_BLOCK;
    /// Start an ordering-table clear, newest entry first.
    pub const OTC_CLEAR: u32 = START | TRIGGER | ADDRESS_DECREMENT;
}

/// Terminator in the low 24 bits of a linked-list packet header.
pub const END_OF_LIST: u32 = 0x00ff_ffff;

/// Physical address bits kept in an ordering-table link.
pub const OT_ADDRESS_MASK: u32 = 0x007f_ffff;

/// Maximum words the GPU DMA channel moves per request in block mode.
pub const DMA_CHUNK_LENGTH: usize = 8;
