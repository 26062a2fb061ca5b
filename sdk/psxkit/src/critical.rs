use core::cell::Cell;
use core::sync::atomic::{Ordering, compiler_fence};

use crate::hw::Hardware;

/// Interrupts masked for as long as the guard lives.
///
/// Entering saves I_MASK and writes zero. Registration code running inside
/// the section edits the saved copy through [`CriticalSection::set_mask`],
/// and dropping the guard writes it back in one store.
///
/// Sections do not nest. Internal helpers that need one take a
/// `&CriticalSection` from their caller instead of opening their own.
pub struct CriticalSection<'a, H: Hardware> {
    hw: &'a H,
    mask: Cell<u16>,
}

impl<'a, H: Hardware> CriticalSection<'a, H> {
    pub fn enter(hw: &'a H) -> Self {
        let mask = hw.irq_mask();
        hw.set_irq_mask(0);
        compiler_fence(Ordering::SeqCst);
        Self {
            hw,
            mask: Cell::new(mask),
        }
    }

    /// The mask that will be restored on exit.
    #[inline(always)]
    pub fn mask(&self) -> u16 {
        self.mask.get()
    }

    #[inline(always)]
    pub fn set_mask(&self, mask: u16) {
        self.mask.set(mask);
    }

    #[inline(always)]
    pub fn hardware(&self) -> &'a H {
        self.hw
    }
}

impl<H: Hardware> Drop for CriticalSection<'_, H> {
    fn drop(&mut self) {
        compiler_fence(Ordering::SeqCst);
        self.hw.set_irq_mask(self.mask.get());
    }
}
