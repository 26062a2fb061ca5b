use core::cell::Cell;

use crate::dma::DmaRouter;
use crate::env::EnvSlots;
use crate::gpu::VideoMode;
use crate::hw::Hardware;
use crate::irq::Dispatcher;
use crate::queue::DrawQueue;
use crate::vsync::FrameSync;

/// The runtime: interrupt dispatcher, DMA router, draw queue and frame
/// counter over one [`Hardware`] backend.
///
/// Every method takes `&self`. State shared with interrupt context is kept
/// in cells and only touched inside a critical section or from a handler,
/// so a `Console` can sit in a static and be used from both.
pub struct Console<H: Hardware> {
    pub(crate) hw: H,
    pub(crate) irq: Dispatcher,
    pub(crate) dma: DmaRouter,
    pub(crate) queue: DrawQueue<H>,
    pub(crate) frame: FrameSync<H>,
    pub(crate) env: EnvSlots,
    pub(crate) video_mode: Cell<VideoMode>,
}

impl<H: Hardware> Console<H> {
    /// A console with nothing installed. Call
    /// [`reset_graph`](Console::reset_graph) before anything else.
    pub const fn new(hw: H) -> Self {
        Self {
            hw,
            irq: Dispatcher::new(),
            dma: DmaRouter::new(),
            queue: DrawQueue::new(),
            frame: FrameSync::new(),
            env: EnvSlots::new(),
            video_mode: Cell::new(VideoMode::Ntsc),
        }
    }

    #[inline(always)]
    pub fn hardware(&self) -> &H {
        &self.hw
    }
}
