//! # GPU Setup and Queued Transfers
//!
//! [`Console::reset_graph`] is the usual first call of a program. On its
//! first run it installs the interrupt dispatcher and hooks the frame
//! counter and both draw-queue completion routes into it.
//!
//! The rest of this module is the set of operations that go through the
//! draw queue: ordering tables, raw command buffers and VRAM transfers,
//! plus the ordering-table helpers and [`Console::draw_prim`], which
//! bypass it.

use bit_field::BitField;
use log::{debug, info, warn};

use crate::critical::CriticalSection;
use crate::dma::DmaChannel;
use crate::env::Rect;
use crate::error::Error;
use crate::hw::Hardware;
use crate::hw::regs::{
    DMA_CHUNK_LENGTH, END_OF_LIST, GpuStatus, OT_ADDRESS_MASK, TIMER_HBLANK_MODE, chcr, gp0, gp1,
};
use crate::irq::{Handler, IrqChannel, Route};
use crate::queue::CompletionKind;
use crate::vsync::VSYNC_TIMEOUT;
use crate::Console;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum VideoMode {
    #[default]
    Ntsc = 0,
    Pal = 1,
}

impl VideoMode {
    pub fn from_status(status: GpuStatus) -> Self {
        if status.contains(GpuStatus::PAL) {
            VideoMode::Pal
        } else {
            VideoMode::Ntsc
        }
    }
}

/// How much of the GPU [`Console::reset_graph`] resets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResetMode {
    /// Reset the GPU, the root counters, the draw queue and the frame
    /// counter.
    Full = 0,
    /// Stop GPU and OTC DMA and flush the command buffer. Queued operations
    /// are kept.
    CancelDrawing = 1,
    /// Flush the command buffer only.
    CommandBuffer = 3,
}

/// Spins on `ready` with interrupts left alone.
fn wait_for<H: Hardware>(hw: &H, ready: impl Fn(&H) -> bool) {
    for _ in 0..VSYNC_TIMEOUT {
        if ready(hw) {
            return;
        }
        hw.relax();
    }
    warn!("GPU wait timed out");
}

fn gpu_dma_idle<H: Hardware>(hw: &H) -> bool {
    hw.dma_channel_control(DmaChannel::Gpu) & chcr::START == 0
}

/// Sends the linked list at `ot` to GP0 through DMA.
pub(crate) fn draw_otag_op<H: Hardware>(hw: &H, ot: usize, _: usize, _: usize) {
    hw.gp1(gp1::DMA_DIRECTION | gp1::DMA_TO_GP0);
    wait_for(hw, |hw| hw.gpu_status().contains(GpuStatus::READY_CMD) && gpu_dma_idle(hw));

    hw.set_dma_address(DmaChannel::Gpu, ot);
    hw.set_dma_block(DmaChannel::Gpu, 0);
    hw.set_dma_channel_control(DmaChannel::Gpu, chcr::START | chcr::SYNC_LINKED_LIST | chcr::FROM_RAM);
}

/// Sends `words` words at `buf` to GP0 through DMA, one word per block.
pub(crate) fn draw_buffer_op<H: Hardware>(hw: &H, buf: usize, words: usize, _: usize) {
    hw.gp1(gp1::DMA_DIRECTION | gp1::DMA_TO_GP0);
    wait_for(hw, gpu_dma_idle::<H>);

    hw.set_dma_address(DmaChannel::Gpu, buf);
    hw.set_dma_block(DmaChannel::Gpu, 1 | (words as u32) << 16);
    hw.set_dma_channel_control(DmaChannel::Gpu, chcr::START | chcr::SYNC_BLOCK | chcr::FROM_RAM);
}

/// Writes `words` words at `buf` to GP0 by hand and then requests a GPU
/// interrupt, which completes the operation.
pub(crate) fn draw_buffer_irq_op<H: Hardware>(hw: &H, buf: usize, words: usize, _: usize) {
    let buf = buf as *const u32;
    for i in 0..words {
        wait_for(hw, |hw| hw.gpu_status().contains(GpuStatus::READY_CMD));
        // SAFETY: only queued by `draw_buffer_irq`, whose caller keeps the
        // buffer alive until the queue has drained past it.
        let word = unsafe { buf.add(i).read_volatile() };
        hw.gp0(word);
    }
    hw.gp0(gp0::IRQ_REQUEST);
}

pub(crate) fn load_image_op<H: Hardware>(hw: &H, data: usize, position: usize, size: usize) {
    transfer_image(hw, gp0::VRAM_LOAD, gp1::DMA_TO_GP0, data, position as u32, size as u32);
}

pub(crate) fn store_image_op<H: Hardware>(hw: &H, data: usize, position: usize, size: usize) {
    transfer_image(hw, gp0::VRAM_STORE, gp1::DMA_FROM_GPUREAD, data, position as u32, size as u32);
}

/// Block-mode VRAM transfer. Transfers longer than one chunk move whole
/// chunks only, so the word count is rounded up.
fn transfer_image<H: Hardware>(hw: &H, command: u32, direction: u32, data: usize, position: u32, size: u32) {
    let words = image_words(size);

    hw.gp1(gp1::DMA_DIRECTION | gp1::DMA_OFF);
    hw.gp0(gp0::FLUSH_CACHE);
    hw.gp0(command);
    hw.gp0(position);
    hw.gp0(size);
    hw.gp1(gp1::DMA_DIRECTION | direction);

    hw.set_dma_address(DmaChannel::Gpu, data);
    hw.set_dma_block(DmaChannel::Gpu, image_block(words));

    let from_ram = (direction & 1) ^ 1;
    hw.set_dma_channel_control(DmaChannel::Gpu, chcr::START | chcr::SYNC_BLOCK | from_ram);
}

/// Words needed for a `w | h << 16` rectangle of 16-bit pixels.
fn image_words(size: u32) -> u32 {
    (size.get_bits(0..16) * size.get_bits(16..32)) / 2
}

fn image_block(words: u32) -> u32 {
    let chunk = DMA_CHUNK_LENGTH as u32;
    if words < chunk {
        0x0001_0000 | words
    } else {
        chunk | words.div_ceil(chunk) << 16
    }
}

impl<H: Hardware> Console<H> {
    /// Initializes the GPU and, the first time, the runtime.
    pub fn reset_graph(&self, mode: ResetMode) {
        if self.reset_callback().is_ok() {
            let cs = CriticalSection::enter(&self.hw);
            self.register_irq_in(&cs, IrqChannel::VBlank, Some(Handler::Route(Route::VBlank)));
            self.register_irq_in(&cs, IrqChannel::Gpu, Some(Handler::Route(Route::GpuIrq)));
            self.register_dma_in(&cs, DmaChannel::Gpu, Some(Handler::Route(Route::GpuDma)));

            let video_mode = VideoMode::from_status(self.hw.gpu_status());
            self.video_mode.set(video_mode);
            drop(cs);

            info!("setup done, default mode is {:?}", video_mode);
        }

        if mode == ResetMode::CommandBuffer {
            self.hw.gp1(gp1::RESET_BUFFER);
            return;
        }

        {
            let cs = CriticalSection::enter(&self.hw);
            self.set_dma_priority_in(&cs, DmaChannel::Gpu, Some(3));
            self.set_dma_priority_in(&cs, DmaChannel::Otc, Some(3));
        }
        self.hw.set_dma_channel_control(DmaChannel::Gpu, chcr::GPU_STOP);
        self.hw.set_dma_channel_control(DmaChannel::Otc, chcr::OTC_STOP);

        if mode == ResetMode::CancelDrawing {
            self.hw.gp1(gp1::RESET_BUFFER);
            return;
        }

        self.hw.gp1(gp1::RESET);
        self.hw.set_timer_mode(0, TIMER_HBLANK_MODE);
        self.hw.set_timer_mode(1, TIMER_HBLANK_MODE);

        self.reset_queue();
        self.frame.reset();
        debug!("GPU reset");
    }

    pub fn video_mode(&self) -> VideoMode {
        self.video_mode.get()
    }

    /// Switches between NTSC and PAL timings, keeping every other display
    /// setting as GPUSTAT reports it.
    pub fn set_video_mode(&self, mode: VideoMode) {
        self.video_mode.set(mode);

        let status = self.hw.gpu_status().bits();
        let word = (mode as u32) << 3
            | (status >> 17) & 0x37
            | (status >> 10) & 0x40
            | (status >> 7) & 0x80;
        self.hw.gp1(gp1::VIDEO_MODE | word);
    }

    /// Turns display output on or off.
    pub fn set_display_mask(&self, enabled: bool) {
        self.hw.gp1(gp1::DISPLAY_ENABLE | !enabled as u32);
    }

    /// Queues the ordering table at `ot`.
    ///
    /// # Safety
    ///
    /// `ot` must point to a terminated linked list that stays alive and
    /// unmodified until the queue has drained past it.
    pub unsafe fn draw_otag(&self, ot: *const u32) -> Result<usize, Error> {
        self.enqueue_draw_op_as(Some(CompletionKind::Dma), draw_otag_op::<H>, ot as usize, 0, 0)
    }

    /// Queues the ordering table at `ot` as an operation that completes
    /// through the GPU interrupt. The list has to end with `GP0(1Fh)`.
    ///
    /// # Safety
    ///
    /// Same as [`Console::draw_otag`].
    pub unsafe fn draw_otag_irq(&self, ot: *const u32) -> Result<usize, Error> {
        self.enqueue_draw_op_as(Some(CompletionKind::GpuIrq), draw_otag_op::<H>, ot as usize, 0, 0)
    }

    /// Queues a DMA upload of `buf` to GP0.
    ///
    /// # Safety
    ///
    /// `buf` must stay alive and unmodified until the queue has drained
    /// past it.
    pub unsafe fn draw_buffer(&self, buf: &[u32]) -> Result<usize, Error> {
        self.enqueue_draw_op_as(Some(CompletionKind::Dma), draw_buffer_op::<H>, buf.as_ptr() as usize, buf.len(), 0)
    }

    /// Queues a CPU upload of `buf` to GP0 that completes through the GPU
    /// interrupt. [`CompletionKind::GpuIrq`] is selected when it starts.
    ///
    /// # Safety
    ///
    /// Same as [`Console::draw_buffer`].
    pub unsafe fn draw_buffer_irq(&self, buf: &[u32]) -> Result<usize, Error> {
        self.enqueue_draw_op_as(Some(CompletionKind::GpuIrq), draw_buffer_irq_op::<H>, buf.as_ptr() as usize, buf.len(), 0)
    }

    /// Queues an upload of `data` to the VRAM area `rect`.
    ///
    /// # Safety
    ///
    /// `data` must cover the whole transfer, rounded up to whole chunks, and
    /// stay alive until the queue has drained past it.
    pub unsafe fn load_image(&self, rect: &Rect, data: *const u32) -> Result<usize, Error> {
        check_image(rect);
        self.enqueue_draw_op_as(
            Some(CompletionKind::Dma),
            load_image_op::<H>,
            data as usize,
            rect.position_word() as usize,
            rect.size_word() as usize,
        )
    }

    /// Queues a download of the VRAM area `rect` into `data`.
    ///
    /// # Safety
    ///
    /// Same as [`Console::load_image`], and nothing may read `data` until
    /// the transfer has completed.
    pub unsafe fn store_image(&self, rect: &Rect, data: *mut u32) -> Result<usize, Error> {
        check_image(rect);
        self.enqueue_draw_op_as(
            Some(CompletionKind::Dma),
            store_image_op::<H>,
            data as usize,
            rect.position_word() as usize,
            rect.size_word() as usize,
        )
    }

    /// Waits for the queue to drain, then sends the primitive at `prim`
    /// straight to GP0. The first word is the primitive's tag, its top byte
    /// the number of words that follow.
    ///
    /// # Safety
    ///
    /// `prim` must stay alive and unmodified until the transfer is done,
    /// which is the next [`Console::draw_sync`] returning.
    pub unsafe fn draw_prim(&self, prim: &[u32]) {
        let Some((&tag, body)) = prim.split_first() else {
            return;
        };
        let words = ((tag >> 24) as usize).min(body.len());
        if words == 0 {
            return;
        }

        self.draw_sync(false);
        self.set_completion_kind(CompletionKind::Dma);
        draw_buffer_op(&self.hw, body.as_ptr() as usize, words, 0);
    }

    /// Clears `ot` with the OTC DMA channel: every entry links to the one
    /// before it and `ot[0]` terminates the list. Primitives are then added
    /// from the end of the table, which is drawn first.
    pub fn clear_otag_r(&self, ot: &mut [u32]) {
        let length = ot.len();
        if length == 0 {
            return;
        }
        if length > 0xffff {
            warn!("ordering table of {} entries is too long to clear", length);
            return;
        }

        let last = ot.as_mut_ptr().wrapping_add(length - 1);
        self.hw.set_dma_address(DmaChannel::Otc, last as usize);
        self.hw.set_dma_block(DmaChannel::Otc, length as u32);
        self.hw.set_dma_channel_control(DmaChannel::Otc, chcr::OTC_CLEAR);

        wait_for(&self.hw, |hw| hw.dma_channel_control(DmaChannel::Otc) & chcr::START == 0);
    }
}

/// Clears `ot` in software: every entry links to the one after it and the
/// last one terminates the list. Slower than [`Console::clear_otag_r`],
/// which can only link backwards.
pub fn clear_otag(ot: &mut [u32]) {
    let Some(end) = ot.len().checked_sub(1) else {
        return;
    };
    for i in 0..end {
        let next = &ot[i + 1] as *const u32 as usize as u32;
        ot[i] = next & OT_ADDRESS_MASK;
    }
    ot[end] = END_OF_LIST;
}

fn check_image(rect: &Rect) {
    let words = image_words(rect.size_word());
    if (rect.w as i32 * rect.h as i32) % 2 != 0 {
        warn!("can't transfer an odd number of pixels ({}x{})", rect.w, rect.h);
    }
    if words >= DMA_CHUNK_LENGTH as u32 && words % DMA_CHUNK_LENGTH as u32 != 0 {
        debug!("image transfer of {} words rounded up to whole chunks", words);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::SimBus;

    #[test]
    fn short_images_use_a_single_block() {
        assert_eq!(image_block(image_words(4 | 2 << 16)), 0x0001_0004);
    }

    #[test]
    fn long_images_round_up_to_whole_chunks() {
        // 10x3 pixels = 15 words = 2 chunks
        assert_eq!(image_block(image_words(10 | 3 << 16)), 8 | 2 << 16);
        assert_eq!(image_block(image_words(16 | 2 << 16)), 8 | 2 << 16);
    }

    #[test]
    fn first_reset_wires_the_routes() {
        let console = Console::new(SimBus::new());
        console.reset_graph(ResetMode::Full);

        assert_eq!(console.irq_handler(IrqChannel::VBlank), Some(Handler::Route(Route::VBlank)));
        assert_eq!(console.irq_handler(IrqChannel::Gpu), Some(Handler::Route(Route::GpuIrq)));
        assert_eq!(console.irq_handler(IrqChannel::Dma), Some(Handler::Route(Route::DmaRouter)));
        assert_eq!(console.dma_handler(DmaChannel::Gpu), Some(Handler::Route(Route::GpuDma)));
        assert_eq!(console.dma_priority(DmaChannel::Gpu), Some(3));
        assert_eq!(console.dma_priority(DmaChannel::Otc), Some(3));
        assert_eq!(console.hardware().timer_mode(1), TIMER_HBLANK_MODE);

        let mask = console.hardware().irq_mask();
        assert_eq!(mask, IrqChannel::VBlank.bit() | IrqChannel::Gpu.bit() | IrqChannel::Dma.bit());
    }

    #[test]
    fn command_buffer_reset_only_flushes() {
        let console = Console::new(SimBus::new());
        console.reset_graph(ResetMode::Full);
        console.hardware().clear_logs();

        console.reset_graph(ResetMode::CommandBuffer);
        assert_eq!(console.hardware().gp1_log().as_slice(), &[gp1::RESET_BUFFER]);
    }

    #[test]
    fn pal_is_detected_on_first_reset() {
        let bus = SimBus::new();
        bus.set_status(GpuStatus::IDLE | GpuStatus::PAL);
        let console = Console::new(bus);
        console.reset_graph(ResetMode::Full);
        assert_eq!(console.video_mode(), VideoMode::Pal);
    }

    #[test]
    fn display_mask_is_inverted() {
        let console = Console::new(SimBus::new());
        console.set_display_mask(true);
        console.set_display_mask(false);
        assert_eq!(console.hardware().gp1_log().as_slice(), &[0x0300_0000, 0x0300_0001]);
    }

    #[test]
    fn video_mode_switch_keeps_interlace() {
        let bus = SimBus::new();
        bus.set_status(GpuStatus::IDLE | GpuStatus::INTERLACED);
        let console = Console::new(bus);

        console.set_video_mode(VideoMode::Pal);
        assert_eq!(console.video_mode(), VideoMode::Pal);

        let word = *console.hardware().gp1_log().last().unwrap();
        assert_eq!(word & 0xff00_0000, gp1::VIDEO_MODE);
        assert!(word.get_bit(3));
        assert!(word.get_bit(5));
        assert!(console.hardware().gpu_status().contains(GpuStatus::PAL | GpuStatus::INTERLACED));
    }

    #[test]
    fn software_clear_links_forwards() {
        let mut ot = [0u32; 4];
        clear_otag(&mut ot);

        assert_eq!(ot[3], END_OF_LIST);
        for i in 0..3 {
            let next = &ot[i + 1] as *const u32 as usize as u32;
            assert_eq!(ot[i], next & OT_ADDRESS_MASK);
        }

        let mut empty: [u32; 0] = [];
        clear_otag(&mut empty);
    }

    #[test]
    fn dma_clear_links_backwards() {
        let console = Console::new(SimBus::new());
        console.reset_graph(ResetMode::Full);
        unsafe { console.hardware().allow_memory_access() };

        let mut ot = [0u32; 8];
        console.clear_otag_r(&mut ot);

        let transfer = console.hardware().transfers().last().copied().unwrap();
        assert_eq!(transfer.channel, DmaChannel::Otc);
        assert_eq!(transfer.address, &ot[7] as *const u32 as usize);
        assert_eq!(transfer.block, 8);
        assert_eq!(transfer.control, chcr::OTC_CLEAR);

        assert_eq!(ot[0], END_OF_LIST);
        for i in 1..8 {
            let previous = &ot[i - 1] as *const u32 as usize as u32;
            assert_eq!(ot[i], previous & END_OF_LIST);
        }
    }

    #[test]
    fn draw_prim_skips_the_tag_and_bypasses_the_queue() {
        let console = Console::new(SimBus::new());
        console.reset_graph(ResetMode::Full);
        console.hardware().clear_logs();

        let prim = [3 << 24, 0x2000_00ff, 0x0010_0010, 0x0020_0020];
        unsafe { console.draw_prim(&prim) };

        let transfer = console.hardware().transfers()[0];
        assert_eq!(transfer.address, prim[1..].as_ptr() as usize);
        assert_eq!(transfer.block, 1 | 3 << 16);
        assert_eq!(transfer.control, 0x0100_0201);
        assert_eq!(console.draw_sync(true), 0);
    }
}
