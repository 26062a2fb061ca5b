//! # psxkit
//!
//! Runtime core for the PlayStation: one exception entry point fanning out
//! to per-channel handlers, a DMA completion router chained off it, a GPU
//! draw queue that advances itself from completion interrupts, and vblank
//! synchronization.
//!
//! ## Quick Start
//!
//! ```ignore
//! use psxkit::{DispEnv, DrawEnv, ResetMode, console};
//!
//! let console = console();
//! console.reset_graph(ResetMode::Full);
//!
//! let draw = DrawEnv::new(0, 0, 320, 240);
//! let disp = DispEnv::new(0, 0, 320, 240);
//! console.put_disp_env(&disp);
//!
//! loop {
//!     console.put_draw_env(&draw).ok();
//!     unsafe { console.draw_otag(ot.as_ptr()) }.ok();
//!
//!     console.draw_sync(false);
//!     console.vsync(0);
//!     console.set_display_mask(true);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`irq`] - interrupt channels and the dispatcher lifecycle
//! - [`dma`] - DMA completion handlers and channel priorities
//! - [`queue`] - the draw-operation queue
//! - [`vsync`] - frame counter and vblank waits
//! - [`env`] - drawing and display environments
//! - [`gpu`] - GPU reset and queued transfers
//! - [`hw`] - register access, real and simulated
//!
//! ## Features
//!
//! - `sim` - builds [`hw::sim::SimBus`] so programs and tests can run the
//!   runtime on the host.

#![cfg_attr(not(test), no_std)]

mod console;
mod critical;
mod error;

pub mod dma;
pub mod env;
pub mod gpu;
pub mod hw;
pub mod irq;
pub mod queue;
pub mod vsync;

pub use console::Console;
pub use critical::CriticalSection;
pub use dma::DmaChannel;
pub use env::{DispEnv, DrawEnv, Rect, Rgb};
pub use error::Error;
pub use gpu::{ResetMode, VideoMode, clear_otag};
pub use hw::Hardware;
pub use irq::{Handler, IrqChannel, Route, SavedState};
pub use queue::{CompletionKind, DrawOp, QUEUE_LENGTH};
pub use vsync::{HaltFn, VSYNC_TIMEOUT};

#[cfg(target_arch = "mips")]
pub use hw::mmio::console;
