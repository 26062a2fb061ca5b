//! # Frame Synchronization
//!
//! The vblank route bumps a wrapping frame counter and runs the optional
//! user hook. [`Console::vsync`] waits on that counter by calling a
//! replaceable halt strategy until the target frame comes up, and reports
//! how many hblanks went by, measured on root counter 1.
//!
//! A halt may return early for any reason, such as another interrupt. The
//! wait gives up only after [`VSYNC_TIMEOUT`] halt calls in a row without a
//! vblank, then logs a timeout and releases the BIOS's automatic
//! pad/vblank acknowledge, which is the usual reason vblanks go missing.
//!
//! | `mode` | Behavior                                              |
//! |--------|-------------------------------------------------------|
//! | `< 0`  | Returns the frame counter                             |
//! | `0`    | Waits for the next vblank                             |
//! | `1`    | Returns hblanks since the last wait, without waiting  |
//! | `n > 1`| Waits until `n` vblanks past the last wait            |

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};

use log::warn;

use crate::critical::CriticalSection;
use crate::hw::Hardware;
use crate::hw::regs::{GpuStatus, HBLANK_TIMER};
use crate::Console;

/// Spin iterations, or halt calls without a vblank, before a wait gives up.
pub const VSYNC_TIMEOUT: u32 = 0x0010_0000;

/// One step of a vblank wait. It may return whether or not the frame
/// counter moved.
pub type HaltFn<H> = fn(&Console<H>);

pub(crate) struct FrameSync<H: Hardware> {
    counter: AtomicU32,
    last_vblank: Cell<u32>,
    last_hblank: Cell<u16>,
    callback: Cell<Option<fn()>>,
    halt: Cell<HaltFn<H>>,
}

impl<H: Hardware> FrameSync<H> {
    pub(crate) const fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
            last_vblank: Cell::new(0),
            last_hblank: Cell::new(0),
            callback: Cell::new(None),
            halt: Cell::new(default_vsync_halt::<H> as HaltFn<H>),
        }
    }

    #[inline(always)]
    fn counter(&self) -> u32 {
        self.counter.load(Ordering::Acquire)
    }

    pub(crate) fn reset(&self) {
        self.counter.store(0, Ordering::Release);
        self.last_vblank.set(0);
        self.last_hblank.set(0);
    }
}

/// One busy-wait iteration.
pub fn default_vsync_halt<H: Hardware>(console: &Console<H>) {
    console.spin_once();
}

impl<H: Hardware> Console<H> {
    pub(crate) fn on_vblank(&self) {
        let frame = &self.frame;
        frame.counter.store(frame.counter().wrapping_add(1), Ordering::Release);

        if let Some(callback) = frame.callback.get() {
            callback();
        }
    }

    /// Number of vblanks since the last full GPU reset.
    pub fn vblank_count(&self) -> u32 {
        self.frame.counter()
    }

    /// See the module table for `mode`. Blocking modes return the hblanks
    /// elapsed since the previous blocking call.
    pub fn vsync(&self, mode: i32) -> u32 {
        let frame = &self.frame;
        let delta = self
            .hw
            .timer_value(HBLANK_TIMER)
            .wrapping_sub(frame.last_hblank.get());

        if mode == 1 {
            return delta as u32;
        }
        if mode < 0 {
            return frame.counter();
        }

        let mut status = self.hw.gpu_status();
        let interlaced = status.contains(GpuStatus::INTERLACED);
        let target = frame.last_vblank.get().wrapping_add(mode.max(1) as u32);

        let mut seen = frame.counter();
        let mut idle = 0;
        // wrapping `counter < target`
        while (frame.counter().wrapping_sub(target) as i32) < 0 {
            (frame.halt.get())(self);

            let now = frame.counter();
            if now != seen {
                seen = now;
                idle = 0;
                if interlaced {
                    self.wait_field_flip(status);
                    status = self.hw.gpu_status();
                }
                continue;
            }

            idle += 1;
            if idle >= VSYNC_TIMEOUT {
                warn!("vsync timeout");
                self.hw.release_kernel_acks();
                break;
            }
        }

        frame.last_vblank.set(frame.counter());
        frame.last_hblank.set(self.hw.timer_value(HBLANK_TIMER));
        delta as u32
    }

    fn wait_field_flip(&self, status: GpuStatus) {
        for _ in 0..VSYNC_TIMEOUT {
            if (self.hw.gpu_status() ^ status).contains(GpuStatus::ODD_FIELD) {
                return;
            }
            self.spin_once();
        }
        warn!("interlaced field never flipped");
    }

    /// Replaces the strategy [`Console::vsync`] blocks with and returns the
    /// previous one.
    pub fn set_vsync_halt(&self, halt: HaltFn<H>) -> HaltFn<H> {
        self.frame.halt.replace(halt)
    }

    /// Installs a hook run on every vblank, in interrupt context.
    pub fn set_vsync_callback(&self, callback: Option<fn()>) -> Option<fn()> {
        let _cs = CriticalSection::enter(&self.hw);
        self.frame.callback.replace(callback)
    }

    /// Whether the odd field of an interlaced frame is being scanned out.
    pub fn odd_field(&self) -> bool {
        self.hw.gpu_status().contains(GpuStatus::ODD_FIELD)
    }
}
