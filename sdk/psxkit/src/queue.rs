//! # Draw-Operation Queue
//!
//! GPU work is a chain of transfers, each started by the completion
//! interrupt of the one before it. The foreground only ever starts the first
//! one; from then on the queue drains itself from interrupt context.
//!
//! ```ignore
//! console.enqueue_draw_op(upload_texture, addr, rect, 0)?;
//! console.enqueue_draw_op(draw_list, ot, 0, 0)?;
//!
//! // ... CPU work runs while the GPU chews through the queue ...
//!
//! console.draw_sync(false);
//! ```
//!
//! An operation must end by starting exactly one transfer that raises a
//! completion of the active [`CompletionKind`], otherwise the queue stalls.
//! The runtime's own operations select their kind as they start, so
//! ordering tables and `GP0(1Fh)`-terminated buffers can share one queue.
//! Operations queued through [`Console::enqueue_draw_op`] run under whatever
//! kind is active at that point.

use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicUsize, Ordering};

use heapless::Deque;
use log::{debug, warn};

use crate::critical::CriticalSection;
use crate::dma::DmaChannel;
use crate::error::Error;
use crate::hw::Hardware;
use crate::hw::regs::{GpuStatus, chcr, gp1};
use crate::vsync::VSYNC_TIMEOUT;
use crate::Console;

/// Maximum number of operations in the queue, counting the one in flight.
pub const QUEUE_LENGTH: usize = 16;

/// A deferred GPU operation. It receives the hardware and the three
/// arguments given to [`Console::enqueue_draw_op`].
pub type DrawOp<H> = fn(&H, usize, usize, usize);

/// Which interrupt signals that the operation in flight has finished.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CompletionKind {
    /// GPU DMA channel completion.
    #[default]
    Dma,
    /// The GPU's own interrupt, requested with `GP0(1Fh)`.
    GpuIrq,
}

pub(crate) struct Entry<H> {
    op: DrawOp<H>,
    kind: Option<CompletionKind>,
    args: [usize; 3],
}

impl<H> Clone for Entry<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H> Copy for Entry<H> {}

pub(crate) struct DrawQueue<H> {
    entries: RefCell<Deque<Entry<H>, QUEUE_LENGTH>>,
    /// Queued entries plus the one in flight.
    length: AtomicUsize,
    kind: Cell<CompletionKind>,
    drained: Cell<Option<fn()>>,
}

impl<H> DrawQueue<H> {
    pub(crate) const fn new() -> Self {
        Self {
            entries: RefCell::new(Deque::new()),
            length: AtomicUsize::new(0),
            kind: Cell::new(CompletionKind::Dma),
            drained: Cell::new(None),
        }
    }

    #[inline(always)]
    pub(crate) fn length(&self) -> usize {
        self.length.load(Ordering::Acquire)
    }

    #[inline(always)]
    fn set_length(&self, length: usize) {
        self.length.store(length, Ordering::Release);
    }

    pub(crate) fn reset(&self) {
        self.entries.borrow_mut().clear();
        self.set_length(0);
    }
}

impl<H: Hardware> Console<H> {
    /// Runs `op` right away if the GPU is idle, otherwise appends it to the
    /// queue. Returns the queue depth seen before this call.
    pub fn enqueue_draw_op(&self, op: DrawOp<H>, arg1: usize, arg2: usize, arg3: usize) -> Result<usize, Error> {
        self.enqueue_draw_op_as(None, op, arg1, arg2, arg3)
    }

    /// [`Console::enqueue_draw_op`] for operations that complete through a
    /// fixed [`CompletionKind`], selected right before `op` runs.
    pub(crate) fn enqueue_draw_op_as(
        &self,
        kind: Option<CompletionKind>,
        op: DrawOp<H>,
        arg1: usize,
        arg2: usize,
        arg3: usize,
    ) -> Result<usize, Error> {
        let cs = CriticalSection::enter(&self.hw);
        let length = self.queue.length();

        if length == 0 {
            self.queue.set_length(1);
            if let Some(kind) = kind {
                self.queue.kind.set(kind);
            }
            drop(cs);

            op(&self.hw, arg1, arg2, arg3);
            return Ok(0);
        }

        if length >= QUEUE_LENGTH {
            drop(cs);
            warn!("draw queue overflow, dropping operation");
            return Err(Error::QueueFull);
        }

        let entry = Entry {
            op,
            kind,
            args: [arg1, arg2, arg3],
        };
        if self.queue.entries.borrow_mut().push_back(entry).is_err() {
            drop(cs);
            warn!("draw queue overflow, dropping operation");
            return Err(Error::QueueFull);
        }
        self.queue.set_length(length + 1);

        Ok(length)
    }

    /// Completion handler shared by the GPU DMA and GPU IRQ routes.
    pub(crate) fn on_draw_complete(&self, kind: CompletionKind) {
        if kind != self.queue.kind.get() {
            return;
        }

        self.wait_gpu(GpuStatus::READY_CMD);

        let length = self.queue.length();
        if length == 0 {
            debug!("spurious {:?} completion", kind);
            return;
        }

        let length = length - 1;
        self.queue.set_length(length);

        if length > 0 {
            let entry = self.queue.entries.borrow_mut().pop_front();
            match entry {
                Some(entry) => {
                    if let Some(kind) = entry.kind {
                        self.queue.kind.set(kind);
                    }
                    let [arg1, arg2, arg3] = entry.args;
                    (entry.op)(&self.hw, arg1, arg2, arg3);
                }
                None => {
                    warn!("draw queue length {} with no entries", length);
                    self.queue.set_length(0);
                }
            }
        } else {
            self.hw.gp1(gp1::DMA_DIRECTION | gp1::DMA_OFF);
            if let Some(callback) = self.queue.drained.get() {
                callback();
            }
        }
    }

    /// Waits, with interrupts left alone, for every bit in `ready` to show
    /// up in GPUSTAT. Safe to call from a handler.
    fn wait_gpu(&self, ready: GpuStatus) -> bool {
        for _ in 0..VSYNC_TIMEOUT {
            if self.hw.gpu_status().contains(ready) {
                return true;
            }
            self.hw.relax();
        }
        warn!("GPU not ready ({:?})", ready);
        false
    }

    /// Returns the number of operations left in the queue. When `non_blocking`
    /// is false it first waits for the queue to drain and for the last
    /// transfer to leave the GPU, giving up after a timeout.
    pub fn draw_sync(&self, non_blocking: bool) -> usize {
        if non_blocking {
            return self.queue.length();
        }

        for _ in 0..VSYNC_TIMEOUT {
            if self.queue.length() == 0 {
                break;
            }
            self.spin_once();
        }

        if self.queue.length() == 0 {
            if self.hw.gpu_status().intersects(GpuStatus::DMA_DIRECTION) {
                for _ in 0..VSYNC_TIMEOUT {
                    let busy = self.hw.dma_channel_control(DmaChannel::Gpu) & chcr::START != 0;
                    if !busy && self.hw.gpu_status().contains(GpuStatus::READY_DMA_BLOCK) {
                        break;
                    }
                    self.spin_once();
                }
            }
            self.wait_gpu(GpuStatus::READY_CMD);
        } else {
            warn!("draw_sync timeout, {} operations left", self.queue.length());
        }

        self.queue.length()
    }

    /// Installs the hook called each time the queue drains. Returns the
    /// previous one.
    pub fn set_draw_sync_callback(&self, callback: Option<fn()>) -> Option<fn()> {
        let _cs = CriticalSection::enter(&self.hw);
        self.queue.drained.replace(callback)
    }

    /// Selects the interrupt that advances the queue for operations queued
    /// through [`Console::enqueue_draw_op`].
    ///
    /// Should only be called with the queue drained. Switching with entries
    /// in flight is honored but the in-flight operation's completion will
    /// be ignored if it signals the other way.
    pub fn set_completion_kind(&self, kind: CompletionKind) {
        let _cs = CriticalSection::enter(&self.hw);
        let length = self.queue.length();
        if length != 0 && kind != self.queue.kind.get() {
            warn!("completion kind switched to {:?} with {} operations queued", kind, length);
        }
        self.queue.kind.set(kind);
    }

    pub fn completion_kind(&self) -> CompletionKind {
        self.queue.kind.get()
    }

    /// Forgets every queued operation.
    pub fn reset_queue(&self) {
        let _cs = CriticalSection::enter(&self.hw);
        self.queue.reset();
    }
}
