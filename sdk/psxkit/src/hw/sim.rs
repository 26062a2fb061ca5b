//! # Simulated Bus
//!
//! An in-memory model of the registers behind [`Hardware`]. It latches
//! interrupts the way the controller does, records GP0/GP1 traffic and DMA
//! kicks, and can raise vblanks on a fixed period of spin iterations so that
//! blocking waits terminate.
//!
//! Completion of GPU transfers is manual by default: the test decides when
//! a transfer finishes with [`SimBus::complete_dma`] or
//! [`SimBus::raise`], then lets the runtime take the interrupt through
//! [`Console::deliver_pending`](crate::Console::deliver_pending).
//!
//! The bus never touches host memory unless
//! [`SimBus::allow_memory_access`] was called. Until then GPU linked-list
//! and OTC transfers are recorded but not carried out.

use core::cell::{Cell, RefCell};

use bit_field::BitField;
use log::{debug, warn};

use super::Hardware;
use super::regs::{Dicr, GpuStatus, chcr, gp0, gp1, END_OF_LIST, IRQ_ALL, DMA_CHANNELS};
use crate::dma::DmaChannel;
use crate::irq::IrqChannel;

pub const GP0_LOG_LENGTH: usize = 256;
pub const GP1_LOG_LENGTH: usize = 64;
pub const TRANSFER_LOG_LENGTH: usize = 32;

/// Scanlines per NTSC frame, added to the hblank counter on each vblank.
pub const LINES_PER_FRAME: u16 = 263;

/// A DMA transfer the runtime started.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DmaTransfer {
    pub channel: DmaChannel,
    pub address: usize,
    pub block: u32,
    pub control: u32,
}

#[derive(Debug)]
pub struct SimBus {
    irq_stat: Cell<u16>,
    irq_mask: Cell<u16>,

    dpcr: Cell<u32>,
    dicr: Cell<u32>,
    madr: [Cell<usize>; DMA_CHANNELS],
    bcr: [Cell<u32>; DMA_CHANNELS],
    chcr: [Cell<u32>; DMA_CHANNELS],

    status: Cell<u32>,
    timers: [Cell<u16>; 3],
    timer_modes: [Cell<u16>; 3],

    bios_detached: Cell<bool>,
    entry_installed: Cell<bool>,
    kernel_ack_releases: Cell<u32>,

    auto_complete: Cell<bool>,
    memory_access: Cell<bool>,
    late_completion: Cell<Option<DmaChannel>>,
    ticks: Cell<u64>,
    vblank_period: Cell<u64>,
    next_vblank: Cell<u64>,

    gp0_log: RefCell<heapless::Vec<u32, GP0_LOG_LENGTH>>,
    gp1_log: RefCell<heapless::Vec<u32, GP1_LOG_LENGTH>>,
    transfers: RefCell<heapless::Vec<DmaTransfer, TRANSFER_LOG_LENGTH>>,
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBus {
    pub const fn new() -> Self {
        Self {
            irq_stat: Cell::new(0),
            irq_mask: Cell::new(0),
            // power-on DPCR
            dpcr: Cell::new(0x0765_4321),
            dicr: Cell::new(0),
            madr: [const { Cell::new(0) }; DMA_CHANNELS],
            bcr: [const { Cell::new(0) }; DMA_CHANNELS],
            chcr: [const { Cell::new(0) }; DMA_CHANNELS],
            status: Cell::new(GpuStatus::IDLE.bits()),
            timers: [const { Cell::new(0) }; 3],
            timer_modes: [const { Cell::new(0) }; 3],
            bios_detached: Cell::new(false),
            entry_installed: Cell::new(false),
            kernel_ack_releases: Cell::new(0),
            auto_complete: Cell::new(false),
            memory_access: Cell::new(false),
            late_completion: Cell::new(None),
            ticks: Cell::new(0),
            vblank_period: Cell::new(0),
            next_vblank: Cell::new(0),
            gp0_log: RefCell::new(heapless::Vec::new()),
            gp1_log: RefCell::new(heapless::Vec::new()),
            transfers: RefCell::new(heapless::Vec::new()),
        }
    }

    /// Latches `channel` in I_STAT. Delivery still depends on the mask.
    pub fn raise(&self, channel: IrqChannel) {
        let mut stat = self.irq_stat.get();
        stat.set_bit(channel.index(), true);
        self.irq_stat.set(stat);
    }

    /// One vertical blank: raises the vblank channel, flips the field and
    /// advances the hblank counter by a frame.
    pub fn vblank(&self) {
        self.raise(IrqChannel::VBlank);
        self.status.set(self.status.get() ^ GpuStatus::ODD_FIELD.bits());
        self.advance_scanlines(LINES_PER_FRAME);
    }

    pub fn advance_scanlines(&self, lines: u16) {
        let timer = &self.timers[1];
        timer.set(timer.get().wrapping_add(lines));
    }

    /// Finishes whatever `channel` is doing: clears the busy bit and sets
    /// the channel's DICR flag if enabled. The DMA interrupt is raised only
    /// when the DICR master flag goes from 0 to 1, as on the real controller.
    pub fn complete_dma(&self, channel: DmaChannel) {
        let control = &self.chcr[channel.index()];
        control.set(control.get() & !chcr::START);

        let mut dicr = Dicr(self.dicr.get());
        let bit = 1u8 << channel.index();
        if dicr.channel_enables() & bit == 0 {
            debug!("dma{} completed with its interrupt disabled", channel.index());
            return;
        }

        let was_flagged = self.dma_interrupt_raw().master_flag();
        dicr.set_flags(dicr.flags() | bit);
        self.dicr.set(dicr.0);
        if !was_flagged && self.dma_interrupt_raw().master_flag() {
            self.raise(IrqChannel::Dma);
        }
    }

    /// Completes `channel` right after the next DICR read, before whoever
    /// read it gets to write it back.
    pub fn complete_after_next_dicr_read(&self, channel: DmaChannel) {
        self.late_completion.set(Some(channel));
    }

    /// Lets the bus carry out GPU linked-list and OTC transfers on host
    /// memory, as the real DMA controller would.
    ///
    /// # Safety
    ///
    /// From now on every linked-list transfer started on the GPU channel
    /// must point at a live packet, and every OTC transfer must cover a live
    /// `u32` buffer, for as long as the transfer runs.
    pub unsafe fn allow_memory_access(&self) {
        self.memory_access.set(true);
    }

    /// Raise a vblank every `period` calls to [`Hardware::relax`]. Zero
    /// turns the schedule off.
    pub fn schedule_vblank(&self, period: u64) {
        self.vblank_period.set(period);
        self.next_vblank.set(self.ticks.get() + period);
    }

    /// Complete GPU transfers and `GP0(1Fh)` requests as soon as they start.
    pub fn set_auto_complete(&self, enabled: bool) {
        self.auto_complete.set(enabled);
    }

    pub fn set_status(&self, status: GpuStatus) {
        self.status.set(status.bits());
    }

    pub fn set_interlaced(&self, interlaced: bool) {
        let mut status = self.status.get();
        status.set_bit(22, interlaced);
        self.status.set(status);
    }

    pub fn set_timer(&self, timer: usize, value: u16) {
        self.timers[timer].set(value);
    }

    pub fn timer_mode(&self, timer: usize) -> u16 {
        self.timer_modes[timer].get()
    }

    pub fn entry_installed(&self) -> bool {
        self.entry_installed.get()
    }

    pub fn bios_detached(&self) -> bool {
        self.bios_detached.get()
    }

    /// How many times the vblank watchdog ran its recovery.
    pub fn kernel_ack_releases(&self) -> u32 {
        self.kernel_ack_releases.get()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.get()
    }

    pub fn gp0_log(&self) -> heapless::Vec<u32, GP0_LOG_LENGTH> {
        self.gp0_log.borrow().clone()
    }

    pub fn gp1_log(&self) -> heapless::Vec<u32, GP1_LOG_LENGTH> {
        self.gp1_log.borrow().clone()
    }

    pub fn transfers(&self) -> heapless::Vec<DmaTransfer, TRANSFER_LOG_LENGTH> {
        self.transfers.borrow().clone()
    }

    pub fn clear_logs(&self) {
        self.gp0_log.borrow_mut().clear();
        self.gp1_log.borrow_mut().clear();
        self.transfers.borrow_mut().clear();
    }

    fn log_gp0(&self, word: u32) {
        if self.gp0_log.borrow_mut().push(word).is_err() {
            warn!("gp0 log full, dropping {:08X}", word);
        }
    }

    /// Feeds the first packet of a linked list to GP0.
    ///
    /// Only the head packet is walked: list links are 24-bit and cannot
    /// address host memory.
    fn walk_linked_list(&self, address: usize) {
        if address == 0 || address % 4 != 0 {
            warn!("linked-list dma from unaligned address {:#x}", address);
            return;
        }

        let head = address as *const u32;
        // SAFETY: `allow_memory_access` makes the caller vouch for every
        // linked-list address.
        let header = unsafe { head.read() };
        let words = (header >> 24) as usize;
        for i in 1..=words {
            // SAFETY: as above, the packet covers its header's word count.
            let word = unsafe { head.add(i).read() };
            self.log_gp0(word);
        }

        if header & END_OF_LIST != END_OF_LIST {
            debug!("linked-list dma: not following link {:06X}", header & END_OF_LIST);
        }
    }

    /// Writes a reverse-linked ordering table of `count` entries ending at
    /// `address`, the way the OTC channel does.
    fn fill_ordering_table(&self, address: usize, count: usize) {
        if address % 4 != 0 || address < (count - 1) * 4 {
            warn!("otc dma to bad address {:#x}", address);
            return;
        }

        let last = address as *mut u32;
        for i in 0..count {
            let entry = address - i * 4;
            let link = if i + 1 == count {
                END_OF_LIST
            } else {
                (entry - 4) as u32 & END_OF_LIST
            };
            // SAFETY: `allow_memory_access` makes the caller vouch for the
            // whole table.
            unsafe { last.sub(i).write(link) };
        }
    }

    /// DICR as software reads it, with bit 31 computed.
    fn dma_interrupt_raw(&self) -> Dicr {
        let mut dicr = self.dicr.get() & 0x7fff_ffff;
        let raw = Dicr(dicr);
        let master = raw.force_irq()
            || (raw.master_enable() && raw.flags() & raw.channel_enables() != 0);
        dicr.set_bit(31, master);
        Dicr(dicr)
    }
}

impl Hardware for SimBus {
    fn irq_status(&self) -> u16 {
        self.irq_stat.get()
    }

    fn acknowledge_irq(&self, bits: u16) {
        self.irq_stat.set(self.irq_stat.get() & !bits & IRQ_ALL);
    }

    fn irq_mask(&self) -> u16 {
        self.irq_mask.get()
    }

    fn set_irq_mask(&self, mask: u16) {
        self.irq_mask.set(mask & IRQ_ALL);
    }

    fn dma_control(&self) -> u32 {
        self.dpcr.get()
    }

    fn set_dma_control(&self, dpcr: u32) {
        self.dpcr.set(dpcr);
    }

    fn dma_interrupt(&self) -> Dicr {
        let dicr = self.dma_interrupt_raw();
        if let Some(channel) = self.late_completion.take() {
            self.complete_dma(channel);
        }
        dicr
    }

    fn set_dma_interrupt(&self, dicr: Dicr) {
        let old = Dicr(self.dicr.get());
        let mut next = dicr.without_flags();
        next.set_flags(old.flags() & !dicr.flags());
        self.dicr.set(next.0);
    }

    fn set_dma_address(&self, channel: DmaChannel, address: usize) {
        self.madr[channel.index()].set(address);
    }

    fn set_dma_block(&self, channel: DmaChannel, bcr: u32) {
        self.bcr[channel.index()].set(bcr);
    }

    fn dma_channel_control(&self, channel: DmaChannel) -> u32 {
        self.chcr[channel.index()].get()
    }

    fn set_dma_channel_control(&self, channel: DmaChannel, control: u32) {
        let index = channel.index();
        self.chcr[index].set(control);
        if control & chcr::START == 0 {
            return;
        }

        let transfer = DmaTransfer {
            channel,
            address: self.madr[index].get(),
            block: self.bcr[index].get(),
            control,
        };
        debug!("dma{} start: {:?}", index, transfer);
        if self.transfers.borrow_mut().push(transfer).is_err() {
            warn!("transfer log full");
        }

        let memory_access = self.memory_access.get();
        if channel == DmaChannel::Gpu {
            let linked = control & (0b11 << chcr::SYNC_MODE_SHIFT) == chcr::SYNC_LINKED_LIST;
            if linked && memory_access {
                self.walk_linked_list(transfer.address);
            }
            if self.auto_complete.get() {
                self.complete_dma(channel);
            }
        } else {
            if channel == DmaChannel::Otc && memory_access {
                let count = match transfer.block & 0xffff {
                    0 => 0x1_0000,
                    count => count as usize,
                };
                self.fill_ordering_table(transfer.address, count);
            }
            self.complete_dma(channel);
        }
    }

    fn gp0(&self, word: u32) {
        self.log_gp0(word);
        if word == gp0::IRQ_REQUEST {
            self.status.set(self.status.get() | GpuStatus::IRQ.bits());
            if self.auto_complete.get() {
                self.raise(IrqChannel::Gpu);
            }
        }
    }

    fn gp1(&self, word: u32) {
        if self.gp1_log.borrow_mut().push(word).is_err() {
            warn!("gp1 log full, dropping {:08X}", word);
        }

        let status = self.status.get();
        match word & 0xff00_0000 {
            gp1::RESET => self.status.set(GpuStatus::IDLE.bits() | (status & GpuStatus::PAL.bits())),
            gp1::ACK_IRQ => self.status.set(status & !GpuStatus::IRQ.bits()),
            gp1::DMA_DIRECTION => {
                let mut next = status;
                next.set_bits(29..31, word & 0b11);
                self.status.set(next);
            }
            gp1::VIDEO_MODE => {
                let mut next = status;
                next.set_bit(20, word.get_bit(3));
                next.set_bit(22, word.get_bit(5));
                self.status.set(next);
            }
            _ => {}
        }
    }

    fn gpu_status(&self) -> GpuStatus {
        GpuStatus::from_bits_retain(self.status.get())
    }

    fn timer_value(&self, timer: usize) -> u16 {
        self.timers[timer].get()
    }

    fn set_timer_mode(&self, timer: usize, mode: u16) {
        self.timer_modes[timer].set(mode);
    }

    fn detach_bios(&self) {
        self.bios_detached.set(true);
    }

    fn install_entry(&self) {
        self.entry_installed.set(true);
    }

    fn remove_entry(&self) {
        self.entry_installed.set(false);
    }

    fn release_kernel_acks(&self) {
        self.kernel_ack_releases.set(self.kernel_ack_releases.get() + 1);
    }

    fn relax(&self) {
        let ticks = self.ticks.get() + 1;
        self.ticks.set(ticks);

        let period = self.vblank_period.get();
        if period != 0 && ticks >= self.next_vblank.get() {
            self.next_vblank.set(ticks + period);
            self.vblank();
        }
    }

    fn exception_pending(&self) -> bool {
        self.entry_installed.get() && self.irq_stat.get() & self.irq_mask.get() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acknowledge_clears_only_the_given_bits() {
        let bus = SimBus::new();
        bus.raise(IrqChannel::VBlank);
        bus.raise(IrqChannel::Dma);
        bus.acknowledge_irq(IrqChannel::VBlank.bit());
        assert_eq!(bus.irq_status(), IrqChannel::Dma.bit());
    }

    #[test]
    fn dicr_flags_are_write_one_to_clear() {
        let bus = SimBus::new();
        let mut dicr = Dicr(0);
        dicr.set_channel_enables(1 << 2);
        dicr.set_master_enable(true);
        bus.set_dma_interrupt(dicr);

        bus.complete_dma(DmaChannel::Gpu);
        assert_eq!(bus.dma_interrupt().flags(), 1 << 2);
        assert!(bus.dma_interrupt().master_flag());

        // writing the control bits back leaves the flag alone
        bus.set_dma_interrupt(bus.dma_interrupt().without_flags());
        assert_eq!(bus.dma_interrupt().flags(), 1 << 2);

        let mut ack = dicr;
        ack.set_flags(1 << 2);
        bus.set_dma_interrupt(ack);
        assert_eq!(bus.dma_interrupt().flags(), 0);
        assert!(!bus.dma_interrupt().master_flag());
    }

    #[test]
    fn scheduled_vblanks_fire_on_relax() {
        let bus = SimBus::new();
        bus.schedule_vblank(3);
        bus.relax();
        bus.relax();
        assert_eq!(bus.irq_status(), 0);
        bus.relax();
        assert_eq!(bus.irq_status(), IrqChannel::VBlank.bit());
        assert_eq!(bus.timer_value(1), LINES_PER_FRAME);
    }

    #[test]
    fn linked_list_transfer_feeds_gp0() {
        let bus = SimBus::new();
        unsafe { bus.allow_memory_access() };
        let packet: [u32; 3] = [(2 << 24) | END_OF_LIST, 0xe100_0000, 0xe200_0000];
        bus.set_dma_address(DmaChannel::Gpu, packet.as_ptr() as usize);
        bus.set_dma_block(DmaChannel::Gpu, 0);
        bus.set_dma_channel_control(DmaChannel::Gpu, chcr::START | chcr::SYNC_LINKED_LIST | chcr::FROM_RAM);

        assert_eq!(bus.gp0_log().as_slice(), &[0xe100_0000, 0xe200_0000]);
        assert_ne!(bus.dma_channel_control(DmaChannel::Gpu) & chcr::START, 0);
        assert_eq!(bus.transfers().len(), 1);
    }

    #[test]
    fn transfers_leave_memory_alone_by_default() {
        let bus = SimBus::new();
        bus.set_dma_address(DmaChannel::Gpu, 0x10);
        bus.set_dma_channel_control(DmaChannel::Gpu, chcr::START | chcr::SYNC_LINKED_LIST | chcr::FROM_RAM);
        bus.set_dma_address(DmaChannel::Otc, 0x10);
        bus.set_dma_block(DmaChannel::Otc, 4);
        bus.set_dma_channel_control(DmaChannel::Otc, chcr::OTC_CLEAR);

        assert!(bus.gp0_log().is_empty());
        assert_eq!(bus.transfers().len(), 2);
        assert_eq!(bus.dma_channel_control(DmaChannel::Otc) & chcr::START, 0);
    }

    #[test]
    fn dma_interrupt_fires_on_the_rising_edge_only() {
        let bus = SimBus::new();
        let mut dicr = Dicr(0);
        dicr.set_channel_enables(0b101_0100);
        dicr.set_master_enable(true);
        bus.set_dma_interrupt(dicr);

        bus.complete_dma(DmaChannel::Gpu);
        assert_eq!(bus.irq_status(), IrqChannel::Dma.bit());

        bus.acknowledge_irq(IrqChannel::Dma.bit());
        bus.complete_dma(DmaChannel::Spu);
        assert_eq!(bus.irq_status(), 0);
        assert_eq!(bus.dma_interrupt().flags(), 0b001_0100);
    }
}
