use std::sync::atomic::{AtomicUsize, Ordering};

use psxkit::hw::regs::gp1;
use psxkit::hw::sim::SimBus;
use psxkit::{CompletionKind, Console, DmaChannel, Error, Hardware, IrqChannel, QUEUE_LENGTH, ResetMode};

/// Records its first argument on GP0 so the test can see it ran.
fn mark(hw: &SimBus, id: usize, _: usize, _: usize) {
    hw.gp0(id as u32);
}

fn ready() -> Console<SimBus> {
    let console = Console::new(SimBus::new());
    console.reset_graph(ResetMode::Full);
    console.hardware().clear_logs();
    console
}

fn complete_gpu_dma(console: &Console<SimBus>) {
    console.hardware().complete_dma(DmaChannel::Gpu);
    console.deliver_pending();
}

#[test]
fn empty_queue_runs_the_operation_inline() {
    let console = ready();
    assert_eq!(console.enqueue_draw_op(mark, 42, 0, 0), Ok(0));
    assert_eq!(console.hardware().gp0_log().as_slice(), &[42]);
    assert_eq!(console.draw_sync(true), 1);
}

#[test]
fn full_queue_rejects_without_disturbing_order() {
    let console = ready();
    for id in 0..QUEUE_LENGTH {
        assert_eq!(console.enqueue_draw_op(mark, id, 0, 0), Ok(id));
    }
    assert_eq!(console.draw_sync(true), QUEUE_LENGTH);

    assert_eq!(console.enqueue_draw_op(mark, 99, 0, 0), Err(Error::QueueFull));
    assert_eq!(console.draw_sync(true), QUEUE_LENGTH);

    for _ in 0..QUEUE_LENGTH {
        complete_gpu_dma(&console);
    }

    let expected: Vec<u32> = (0..QUEUE_LENGTH as u32).collect();
    assert_eq!(console.hardware().gp0_log().as_slice(), expected.as_slice());
    assert_eq!(console.draw_sync(true), 0);
}

static DRAINED: AtomicUsize = AtomicUsize::new(0);

fn drained() {
    DRAINED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn completions_run_entries_in_order_and_drain_once() {
    let console = ready();
    assert!(console.set_draw_sync_callback(Some(drained)).is_none());

    for id in 0..QUEUE_LENGTH {
        console.enqueue_draw_op(mark, id, 0, 0).unwrap();
    }

    for done in 1..QUEUE_LENGTH {
        complete_gpu_dma(&console);
        assert_eq!(console.hardware().gp0_log().len(), done + 1);
        assert_eq!(DRAINED.load(Ordering::SeqCst), 0);
    }

    complete_gpu_dma(&console);
    assert_eq!(console.draw_sync(true), 0);
    assert_eq!(DRAINED.load(Ordering::SeqCst), 1);
    assert_eq!(
        console.hardware().gp1_log().last(),
        Some(&(gp1::DMA_DIRECTION | gp1::DMA_OFF))
    );

    // a stray completion on an empty queue does nothing
    complete_gpu_dma(&console);
    assert_eq!(DRAINED.load(Ordering::SeqCst), 1);
}

#[test]
fn gpu_irq_completion_kind() {
    let console = ready();
    console.set_completion_kind(CompletionKind::GpuIrq);

    console.enqueue_draw_op(mark, 1, 0, 0).unwrap();
    console.enqueue_draw_op(mark, 2, 0, 0).unwrap();

    // DMA completions no longer advance the queue
    complete_gpu_dma(&console);
    assert_eq!(console.draw_sync(true), 2);

    console.hardware().raise(IrqChannel::Gpu);
    console.deliver_pending();
    assert_eq!(console.hardware().gp0_log().as_slice(), &[1, 2]);
    assert!(console.hardware().gp1_log().contains(&gp1::ACK_IRQ));
    assert_eq!(console.draw_sync(true), 1);
}

#[test]
fn draw_buffer_irq_completes_through_the_gpu_interrupt() {
    let console = ready();
    console.hardware().set_auto_complete(true);
    assert_eq!(console.completion_kind(), CompletionKind::Dma);

    let first = [0x2800_00ffu32, 0x0000_0000];
    let second = [0x0200_0000u32, 0x0000_0000, 0x0010_0010];
    unsafe {
        assert_eq!(console.draw_buffer_irq(&first), Ok(0));
        assert_eq!(console.draw_buffer_irq(&second), Ok(1));
    }

    assert_eq!(console.draw_sync(false), 0);
    assert_eq!(
        console.hardware().gp0_log().as_slice(),
        &[0x2800_00ff, 0, 0x1f00_0000, 0x0200_0000, 0, 0x0010_0010, 0x1f00_0000]
    );
    assert_eq!(console.completion_kind(), CompletionKind::GpuIrq);
}

#[test]
fn mixed_completion_kinds_share_one_queue() {
    let console = ready();
    console.hardware().set_auto_complete(true);

    let ot = [0x00ff_ffffu32];
    let buffer = [0x0200_0000u32, 0x0000_0000, 0x0010_0010];
    unsafe {
        console.draw_otag(ot.as_ptr()).unwrap();
        console.draw_buffer_irq(&buffer).unwrap();
        console.draw_otag(ot.as_ptr()).unwrap();
    }

    assert_eq!(console.draw_sync(false), 0);
    assert_eq!(console.completion_kind(), CompletionKind::Dma);
    assert_eq!(console.hardware().transfers().len(), 2);
    assert_eq!(
        console.hardware().gp0_log().as_slice(),
        &[0x0200_0000, 0, 0x0010_0010, 0x1f00_0000]
    );
}

#[test]
fn draw_otag_irq_waits_for_the_gpu_interrupt() {
    let console = ready();
    let ot = [0x00ff_ffffu32];

    unsafe { console.draw_otag_irq(ot.as_ptr()) }.unwrap();
    console.enqueue_draw_op(mark, 5, 0, 0).unwrap();
    assert_eq!(console.completion_kind(), CompletionKind::GpuIrq);

    complete_gpu_dma(&console);
    assert_eq!(console.draw_sync(true), 2);

    console.hardware().raise(IrqChannel::Gpu);
    console.deliver_pending();
    assert_eq!(console.draw_sync(true), 1);
    assert_eq!(console.hardware().gp0_log().as_slice(), &[5]);
}

/// Writes all three arguments to GP0.
fn record(hw: &SimBus, arg1: usize, arg2: usize, arg3: usize) {
    for arg in [arg1, arg2, arg3] {
        hw.gp0(arg as u32);
    }
}

static CHAIN_DRAINED: AtomicUsize = AtomicUsize::new(0);

fn chain_drained() {
    CHAIN_DRAINED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn queued_operations_keep_their_arguments() {
    let console = ready();
    console.set_draw_sync_callback(Some(chain_drained));

    assert_eq!(console.enqueue_draw_op(record, 1, 2, 3), Ok(0));
    assert_eq!(console.enqueue_draw_op(record, 4, 5, 6), Ok(1));
    assert_eq!(console.enqueue_draw_op(record, 7, 8, 9), Ok(2));

    for _ in 0..3 {
        complete_gpu_dma(&console);
    }

    assert_eq!(
        console.hardware().gp0_log().as_slice(),
        &[1, 2, 3, 4, 5, 6, 7, 8, 9]
    );
    assert_eq!(CHAIN_DRAINED.load(Ordering::SeqCst), 1);
    assert_eq!(console.draw_sync(true), 0);
}

#[test]
fn blocking_draw_sync_waits_for_the_queue() {
    let console = ready();
    console.hardware().set_auto_complete(true);

    let ot = [0x0200_0000u32 | 0x00ff_ffff, 0xe100_0000, 0xe200_0000];
    unsafe {
        console.draw_otag(ot.as_ptr()).unwrap();
        console.draw_otag(ot.as_ptr()).unwrap();
        console.draw_otag(ot.as_ptr()).unwrap();
    }

    assert_eq!(console.draw_sync(false), 0);
    let transfers = console.hardware().transfers();
    assert_eq!(transfers.len(), 3);
    assert!(transfers.iter().all(|t| t.channel == DmaChannel::Gpu && t.control == 0x0100_0401));
}

#[test]
fn blocking_draw_sync_gives_up_on_a_stalled_queue() {
    let console = ready();
    console.enqueue_draw_op(mark, 1, 0, 0).unwrap();
    assert_eq!(console.draw_sync(false), 1);
}

#[test]
fn load_image_rounds_to_whole_chunks() {
    let console = ready();
    let rect = psxkit::Rect::new(0, 0, 10, 3);
    let pixels = [0u32; 16];
    unsafe { console.load_image(&rect, pixels.as_ptr()) }.unwrap();

    let transfer = console.hardware().transfers()[0];
    assert_eq!(transfer.channel, DmaChannel::Gpu);
    assert_eq!(transfer.address, pixels.as_ptr() as usize);
    assert_eq!(transfer.block, 8 | 2 << 16);
    assert_eq!(transfer.control, 0x0100_0201);
    assert_eq!(
        console.hardware().gp0_log().as_slice(),
        &[0x0100_0000, 0xa000_0000, 0, 10 | 3 << 16]
    );
}

#[test]
fn store_image_reads_into_ram() {
    let console = ready();
    let rect = psxkit::Rect::new(64, 32, 2, 2);
    let mut pixels = [0u32; 2];
    unsafe { console.store_image(&rect, pixels.as_mut_ptr()) }.unwrap();

    let transfer = console.hardware().transfers()[0];
    assert_eq!(transfer.block, 0x0001_0002);
    assert_eq!(transfer.control, 0x0100_0200);
    assert_eq!(console.hardware().gp1_log().last(), Some(&(gp1::DMA_DIRECTION | gp1::DMA_FROM_GPUREAD)));
}

#[test]
fn cancel_drawing_keeps_queued_operations() {
    let console = ready();
    console.enqueue_draw_op(mark, 1, 0, 0).unwrap();
    console.enqueue_draw_op(mark, 2, 0, 0).unwrap();

    console.reset_graph(ResetMode::CancelDrawing);
    assert_eq!(console.draw_sync(true), 2);

    console.reset_graph(ResetMode::Full);
    assert_eq!(console.draw_sync(true), 0);
}
