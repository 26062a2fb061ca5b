//! # Memory-Mapped Registers
//!
//! The real [`Hardware`] backend. Register blocks are overlaid on the I/O
//! area and the BIOS is reached through the SDK's syscall stubs.

use core::cell::UnsafeCell;

use volatile_register::{RO, RW, WO};

use super::Hardware;
use super::regs::{COM_DELAY, DMA_CHANNELS, Dicr, GpuStatus};
use crate::Console;
use crate::dma::DmaChannel;
use crate::irq::ISR_STACK_SIZE;

#[repr(C)]
pub struct IrqControl {
    pub stat: RW<u32>,
    pub mask: RW<u32>,
}

#[repr(C)]
pub struct DmaChannelRegs {
    pub madr: RW<u32>,
    pub bcr: RW<u32>,
    pub chcr: RW<u32>,
    _reserved: u32,
}

#[repr(C)]
pub struct DmaControl {
    pub channels: [DmaChannelRegs; DMA_CHANNELS],
    pub dpcr: RW<u32>,
    pub dicr: RW<u32>,
}

#[repr(C)]
pub struct Gpu {
    pub gp0: WO<u32>,
    /// Writes go to GP1, reads return GPUSTAT.
    pub gp1: RW<u32>,
}

#[repr(C)]
pub struct Timer {
    pub value: RO<u32>,
    pub mode: RW<u32>,
    pub target: RW<u32>,
    _reserved: u32,
}

const COM_DELAY_REG: *mut u32 = 0x1f80_1020 as *mut u32;
const IRQ_BASE: usize = 0x1f80_1070;
const DMA_BASE: usize = 0x1f80_1080;
const TIMER_BASE: usize = 0x1f80_1100;
const GPU_BASE: usize = 0x1f80_1810;

/// Register file handed to the BIOS entry hook. The BIOS restores it and
/// jumps to `ra` when an interrupt is taken.
#[repr(C)]
pub struct JumpBuffer {
    pub ra: u32,
    pub sp: u32,
    pub fp: u32,
    pub s: [u32; 8],
    pub gp: u32,
}

unsafe extern "C" {
    fn EnterCriticalSection() -> i32;
    fn ExitCriticalSection();
    fn HookEntryInt(buf: *const JumpBuffer);
    fn ResetEntryInt();
    fn ReturnFromException() -> !;
    fn ChangeClearPAD(enable: i32);
    fn ChangeClearRCnt(timer: i32, enable: i32) -> i32;
    fn _96_remove();

    static _gp: u8;
}

#[repr(C, align(8))]
struct IsrStack(UnsafeCell<[u8; ISR_STACK_SIZE]>);

// SAFETY: only the CPU uses it, as a stack, while an exception is taken.
unsafe impl Sync for IsrStack {}

static ISR_STACK: IsrStack = IsrStack(UnsafeCell::new([0; ISR_STACK_SIZE]));

/// Zero-sized handle to the I/O registers.
pub struct Mmio(());

impl Mmio {
    /// # Safety
    ///
    /// There must be only one `Mmio`, the one inside [`console`].
    pub const unsafe fn new() -> Self {
        Mmio(())
    }

    #[inline(always)]
    fn irq(&self) -> &'static IrqControl {
        unsafe { &*(IRQ_BASE as *const IrqControl) }
    }

    #[inline(always)]
    fn dma(&self) -> &'static DmaControl {
        unsafe { &*(DMA_BASE as *const DmaControl) }
    }

    #[inline(always)]
    fn dma_channel(&self, channel: DmaChannel) -> &'static DmaChannelRegs {
        &self.dma().channels[channel.index()]
    }

    #[inline(always)]
    fn gpu(&self) -> &'static Gpu {
        unsafe { &*(GPU_BASE as *const Gpu) }
    }

    #[inline(always)]
    fn timer(&self, timer: usize) -> &'static Timer {
        unsafe { &*((TIMER_BASE + timer * 16) as *const Timer) }
    }

    fn set_kernel_acks(&self, enabled: bool) {
        unsafe {
            ChangeClearPAD(enabled as i32);
            for timer in 0..4 {
                ChangeClearRCnt(timer, enabled as i32);
            }
        }
    }
}

impl Hardware for Mmio {
    #[inline(always)]
    fn irq_status(&self) -> u16 {
        self.irq().stat.read() as u16
    }

    #[inline(always)]
    fn acknowledge_irq(&self, bits: u16) {
        unsafe { self.irq().stat.write(!bits as u32) }
    }

    #[inline(always)]
    fn irq_mask(&self) -> u16 {
        self.irq().mask.read() as u16
    }

    #[inline(always)]
    fn set_irq_mask(&self, mask: u16) {
        unsafe { self.irq().mask.write(mask as u32) }
    }

    fn dma_control(&self) -> u32 {
        self.dma().dpcr.read()
    }

    fn set_dma_control(&self, dpcr: u32) {
        unsafe { self.dma().dpcr.write(dpcr) }
    }

    fn dma_interrupt(&self) -> Dicr {
        Dicr(self.dma().dicr.read())
    }

    fn set_dma_interrupt(&self, dicr: Dicr) {
        unsafe { self.dma().dicr.write(dicr.0) }
    }

    fn set_dma_address(&self, channel: DmaChannel, address: usize) {
        unsafe { self.dma_channel(channel).madr.write(address as u32) }
    }

    fn set_dma_block(&self, channel: DmaChannel, bcr: u32) {
        unsafe { self.dma_channel(channel).bcr.write(bcr) }
    }

    fn dma_channel_control(&self, channel: DmaChannel) -> u32 {
        self.dma_channel(channel).chcr.read()
    }

    fn set_dma_channel_control(&self, channel: DmaChannel, chcr: u32) {
        unsafe { self.dma_channel(channel).chcr.write(chcr) }
    }

    #[inline(always)]
    fn gp0(&self, word: u32) {
        unsafe { self.gpu().gp0.write(word) }
    }

    #[inline(always)]
    fn gp1(&self, word: u32) {
        unsafe { self.gpu().gp1.write(word) }
    }

    #[inline(always)]
    fn gpu_status(&self) -> GpuStatus {
        GpuStatus::from_bits_retain(self.gpu().gp1.read())
    }

    fn timer_value(&self, timer: usize) -> u16 {
        self.timer(timer).value.read() as u16
    }

    fn set_timer_mode(&self, timer: usize, mode: u16) {
        unsafe { self.timer(timer).mode.write(mode as u32) }
    }

    fn detach_bios(&self) {
        unsafe {
            EnterCriticalSection();
            COM_DELAY_REG.write_volatile(COM_DELAY);
            _96_remove();
        }
    }

    fn install_entry(&self) {
        let buf = JumpBuffer {
            ra: isr_entry as usize as u32,
            sp: ISR_STACK.0.get() as usize as u32 + ISR_STACK_SIZE as u32,
            fp: 0,
            s: [0; 8],
            gp: unsafe { &raw const _gp } as usize as u32,
        };

        unsafe {
            HookEntryInt(HOOK.write(buf));
        }
        self.set_kernel_acks(false);
        unsafe { ExitCriticalSection() };
    }

    fn remove_entry(&self) {
        unsafe {
            EnterCriticalSection();
            ResetEntryInt();
        }
        self.set_kernel_acks(true);
    }

    fn release_kernel_acks(&self) {
        unsafe {
            ChangeClearPAD(0);
            ChangeClearRCnt(3, 0);
        }
    }
}

/// The jump buffer must outlive the hook, so it lives in a static.
struct Hook(UnsafeCell<JumpBuffer>);

// SAFETY: written with interrupts disabled, read only by the BIOS.
unsafe impl Sync for Hook {}

impl Hook {
    /// # Safety
    ///
    /// Exceptions must be disabled.
    unsafe fn write(&self, buf: JumpBuffer) -> &JumpBuffer {
        unsafe {
            *self.0.get() = buf;
            &*self.0.get()
        }
    }
}

static HOOK: Hook = Hook(UnsafeCell::new(JumpBuffer {
    ra: 0,
    sp: 0,
    fp: 0,
    s: [0; 8],
    gp: 0,
}));

/// The one console. Everything in it is interior-mutable and the machine has
/// a single core without interrupt nesting, so sharing it is sound.
struct Global(Console<Mmio>);

// SAFETY: single core; handlers run with interrupts masked and foreground
// read-modify-writes hold a critical section.
unsafe impl Sync for Global {}

static CONSOLE: Global = Global(Console::new(unsafe { Mmio::new() }));

pub fn console() -> &'static Console<Mmio> {
    &CONSOLE.0
}

extern "C" fn isr_entry() {
    console().handle_exception();
    unsafe { ReturnFromException() }
}
