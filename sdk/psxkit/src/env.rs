//! # Drawing and Display Environments
//!
//! [`DrawEnv`] describes where and how the GPU draws: clip rectangle,
//! drawing offset, texture page and window, and an optional background
//! fill. [`Console::put_draw_env`] turns it into one linked-list packet and
//! queues it behind whatever is already drawing.
//!
//! [`DispEnv`] describes what is scanned out. [`Console::put_disp_env`]
//! writes it to GP1 immediately.
//!
//! ```ignore
//! let draw = DrawEnv::new(0, 0, 320, 240).with_fill(Rgb::new(0, 0, 64));
//! let disp = DispEnv::new(0, 240, 320, 240);
//!
//! console.put_draw_env(&draw)?;
//! console.put_disp_env(&disp);
//! ```

use core::cell::Cell;

use crate::error::Error;
use crate::gpu::{VideoMode, draw_otag_op};
use crate::hw::Hardware;
use crate::hw::regs::{END_OF_LIST, gp0, gp1};
use crate::queue::{CompletionKind, QUEUE_LENGTH};
use crate::Console;

/// Longest packet [`DrawEnv::packet`] builds, header included.
pub const ENV_PACKET_WORDS: usize = 9;

/// One more slot than the queue can hold, so the slot being written is
/// never one a queued transfer still reads.
pub(crate) const ENV_SLOTS: usize = QUEUE_LENGTH + 1;

/// Rectangle in VRAM coordinates.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i16,
    pub y: i16,
    pub w: i16,
    pub h: i16,
}

impl Rect {
    pub const fn new(x: i16, y: i16, w: i16, h: i16) -> Self {
        Self { x, y, w, h }
    }

    /// `x | y << 16`, the layout GP0 takes positions in.
    #[inline(always)]
    pub(crate) fn position_word(&self) -> u32 {
        (self.x as u16 as u32) | ((self.y as u16 as u32) << 16)
    }

    #[inline(always)]
    pub(crate) fn size_word(&self) -> u32 {
        (self.w as u16 as u32) | ((self.h as u16 as u32) << 16)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    #[inline(always)]
    fn word(&self) -> u32 {
        self.r as u32 | (self.g as u32) << 8 | (self.b as u32) << 16
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DrawEnv {
    /// Drawing area. Nothing outside it is touched.
    pub clip: Rect,
    /// Added to every vertex, relative to the clip origin.
    pub offset: [i16; 2],
    pub texture_window: Rect,
    /// Texture page attribute bits (`E1` bits 0..8).
    pub tpage: u16,
    pub dither: bool,
    /// Allow drawing to the area being displayed.
    pub draw_on_display: bool,
    /// Clear the clip area to this color first.
    pub fill: Option<Rgb>,
}

impl DrawEnv {
    pub const fn new(x: i16, y: i16, w: i16, h: i16) -> Self {
        Self {
            clip: Rect::new(x, y, w, h),
            offset: [0, 0],
            texture_window: Rect::new(0, 0, 0, 0),
            tpage: 0x0a,
            dither: true,
            draw_on_display: false,
            fill: None,
        }
    }

    pub const fn with_fill(mut self, color: Rgb) -> Self {
        self.fill = Some(color);
        self
    }

    /// Builds the linked-list packet. `link` goes in the low 24 bits of the
    /// header; [`END_OF_LIST`] terminates the list.
    pub fn packet(&self, link: u32) -> ([u32; ENV_PACKET_WORDS], usize) {
        let clip = &self.clip;
        let x = clip.x as i32;
        let y = clip.y as i32;

        let mut words = [0u32; ENV_PACKET_WORDS];
        words[1] = gp0::CLIP_TOP_LEFT | (x as u32 & 0x3ff) | (y as u32 & 0x3ff) << 10;
        words[2] = gp0::CLIP_BOTTOM_RIGHT
            | ((x + clip.w as i32 - 1) as u32 & 0x3ff)
            | ((y + clip.h as i32 - 1) as u32 & 0x3ff) << 10;
        words[3] = gp0::DRAW_OFFSET
            | ((x + self.offset[0] as i32) as u32 & 0x7ff)
            | ((y + self.offset[1] as i32) as u32 & 0x7ff) << 11;
        words[4] = gp0::TEXPAGE
            | (self.tpage as u32 & 0x1ff)
            | (self.dither as u32) << 9
            | (self.draw_on_display as u32) << 10;
        words[5] = gp0::TEXWINDOW | self.texture_window_bits();

        let mut length = 5;
        if let Some(color) = self.fill {
            words[6] = gp0::FILL_RECT | color.word();
            words[7] = clip.position_word();
            words[8] = (clip.w as u16 as u32) | (clip.h.clamp(0, 0x1ff) as u32) << 16;
            length = 8;
        }

        words[0] = (length as u32) << 24 | (link & END_OF_LIST);
        (words, length + 1)
    }

    /// `E2` payload: mask and offset in 8-pixel units.
    fn texture_window_bits(&self) -> u32 {
        let window = &self.texture_window;
        let mask_x = ((!(window.w as i32 - 1)) as u32 & 0xff) >> 3;
        let mask_y = ((!(window.h as i32 - 1)) as u32 & 0xff) >> 3;
        let offset_x = (window.x as u32 & 0xff) >> 3;
        let offset_y = (window.y as u32 & 0xff) >> 3;
        mask_x | mask_y << 5 | offset_x << 10 | offset_y << 15
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DispEnv {
    /// Area of VRAM to display.
    pub display: Rect,
    /// Adjustment of the picture on screen. Zero width and height select
    /// the defaults for the horizontal resolution.
    pub screen: Rect,
    pub interlaced: bool,
    pub rgb24: bool,
    pub reverse: bool,
}

impl DispEnv {
    pub const fn new(x: i16, y: i16, w: i16, h: i16) -> Self {
        Self {
            display: Rect::new(x, y, w, h),
            screen: Rect::new(0, 0, 0, 0),
            interlaced: false,
            rgb24: false,
            reverse: false,
        }
    }

    /// GP1 words for horizontal range, vertical range, video mode and
    /// display origin, in the order they are written.
    pub fn registers(&self, video_mode: VideoMode) -> [u32; 4] {
        let screen = &self.screen;
        let sw = screen.w as i32;

        let mut mode = (video_mode as u32) << 3
            | (self.rgb24 as u32) << 4
            | (self.interlaced as u32) << 5
            | (self.reverse as u32) << 7;
        if self.display.h >= 256 {
            mode |= 1 << 2;
        }

        let mut default_span = 2560;
        let (mut offset, span) = match self.display.w {
            // 640
            w if w > 560 => {
                mode |= 3;
                (620, sw * 4)
            }
            // 512
            w if w > 400 => {
                mode |= 2;
                (615, sw * 5)
            }
            // 384
            w if w > 352 => {
                mode |= 1 << 6;
                default_span = 2688;
                (539, sw * 7)
            }
            // 320
            w if w > 280 => {
                mode |= 1;
                (600, sw * 8)
            }
            // 256
            _ => (590, sw * 10),
        };
        offset += screen.x as i32 * 4;
        let span = if span == 0 { default_span } else { span };

        let h_range = (offset as u32 & 0xfff) | ((offset + span) as u32 & 0xfff) << 12;

        let top = 16 + screen.y as i32;
        let lines = if screen.h == 0 { 240 } else { screen.h as i32 };
        let v_range = (top as u32 & 0x3ff) | ((top + lines) as u32 & 0x3ff) << 10;

        let origin = (self.display.x as u32 & 0x3ff) | (self.display.y as u32 & 0x1ff) << 10;

        [
            gp1::H_RANGE | h_range,
            gp1::V_RANGE | v_range,
            gp1::VIDEO_MODE | mode,
            gp1::DISPLAY_AREA | origin,
        ]
    }
}

pub(crate) struct EnvSlots {
    slots: [Cell<[u32; ENV_PACKET_WORDS]>; ENV_SLOTS],
    next: Cell<usize>,
}

impl EnvSlots {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [const { Cell::new([0; ENV_PACKET_WORDS]) }; ENV_SLOTS],
            next: Cell::new(0),
        }
    }
}

impl<H: Hardware> Console<H> {
    /// Queues `env` as a single packet. Returns the queue depth seen before
    /// the call, like [`Console::enqueue_draw_op`].
    pub fn put_draw_env(&self, env: &DrawEnv) -> Result<usize, Error> {
        self.queue_env_packet(env, END_OF_LIST)
    }

    /// Like [`Console::put_draw_env`], with the packet linked in front of
    /// the ordering table at `ot` so both go out in one transfer.
    ///
    /// # Safety
    ///
    /// `ot` must point to a valid ordering table that stays alive and
    /// unmodified until the queue has drained past it.
    pub unsafe fn draw_otag_env(&self, ot: *const u32, env: &DrawEnv) -> Result<usize, Error> {
        self.queue_env_packet(env, ot as usize as u32)
    }

    fn queue_env_packet(&self, env: &DrawEnv, link: u32) -> Result<usize, Error> {
        let slots = &self.env;
        let index = slots.next.get();
        let slot = &slots.slots[index];

        let (packet, _) = env.packet(link);
        slot.set(packet);

        let depth = self.enqueue_draw_op_as(Some(CompletionKind::Dma), draw_otag_op::<H>, slot.as_ptr() as usize, 0, 0)?;
        slots.next.set((index + 1) % ENV_SLOTS);
        Ok(depth)
    }

    /// Applies `env` to the display right away.
    pub fn put_disp_env(&self, env: &DispEnv) {
        for word in env.registers(self.video_mode()) {
            self.hw.gp1(word);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draw_packet_without_fill() {
        let env = DrawEnv::new(0, 240, 320, 240);
        let (words, length) = env.packet(END_OF_LIST);

        assert_eq!(length, 6);
        assert_eq!(words[0], 0x05ff_ffff);
        assert_eq!(words[1], 0xe300_0000 | 240 << 10);
        assert_eq!(words[2], 0xe400_0000 | 319 | 479 << 10);
        assert_eq!(words[3], 0xe500_0000 | 240 << 11);
        assert_eq!(words[4], 0xe100_020a);
        assert_eq!(words[5], 0xe200_0000);
    }

    #[test]
    fn fill_height_is_clamped() {
        let env = DrawEnv::new(0, 0, 640, 512).with_fill(Rgb::new(1, 2, 3));
        let (words, length) = env.packet(END_OF_LIST);

        assert_eq!(length, 9);
        assert_eq!(words[0] >> 24, 8);
        assert_eq!(words[6], 0x0203_0201);
        assert_eq!(words[7], 0);
        assert_eq!(words[8], 640 | 0x1ff << 16);
    }

    #[test]
    fn texture_window_uses_eight_pixel_units() {
        let mut env = DrawEnv::new(0, 0, 256, 240);
        env.texture_window = Rect::new(32, 64, 32, 32);
        let (words, _) = env.packet(END_OF_LIST);
        // mask ~(31) & 0xff >> 3 = 0x1c, offsets 4 and 8
        assert_eq!(words[5], 0xe200_0000 | 0x1c | 0x1c << 5 | 4 << 10 | 8 << 15);
    }

    #[test]
    fn display_range_for_320_ntsc() {
        let env = DispEnv::new(0, 0, 320, 240);
        let words = env.registers(VideoMode::Ntsc);

        assert_eq!(words[0], 0x0600_0000 | 600 | (600 + 2560) << 12);
        assert_eq!(words[1], 0x0700_0000 | 16 | 256 << 10);
        assert_eq!(words[2], 0x0800_0001);
        assert_eq!(words[3], 0x0500_0000);
    }

    #[test]
    fn display_mode_bits_for_640_pal_interlaced() {
        let mut env = DispEnv::new(0, 256, 640, 480);
        env.interlaced = true;
        let words = env.registers(VideoMode::Pal);

        assert_eq!(words[2], 0x0800_0000 | 3 | 1 << 2 | 1 << 3 | 1 << 5);
        assert_eq!(words[3], 0x0500_0000 | 256 << 10);
    }

    #[test]
    fn display_range_for_384_uses_its_own_default_span() {
        let env = DispEnv::new(0, 0, 368, 240);
        let words = env.registers(VideoMode::Ntsc);
        assert_eq!(words[0], 0x0600_0000 | 539 | (539 + 2688) << 12);
        assert_eq!(words[2], 0x0800_0000 | 1 << 6);
    }

    #[test]
    fn otag_env_packet_links_to_the_table() {
        use crate::hw::sim::SimBus;
        use crate::gpu::ResetMode;

        let console = Console::new(SimBus::new());
        console.reset_graph(ResetMode::Full);
        console.hardware().clear_logs();
        unsafe { console.hardware().allow_memory_access() };

        let ot = [END_OF_LIST];
        let env = DrawEnv::new(0, 0, 320, 240);
        assert_eq!(unsafe { console.draw_otag_env(ot.as_ptr(), &env) }, Ok(0));

        let transfer = console.hardware().transfers()[0];
        // SAFETY: the packet slot lives as long as the console
        let header = unsafe { (transfer.address as *const u32).read() };
        assert_eq!(header & 0x00ff_ffff, ot.as_ptr() as usize as u32 & 0x00ff_ffff);

        let (packet, length) = env.packet(END_OF_LIST);
        assert_eq!(console.hardware().gp0_log().as_slice(), &packet[1..length]);
    }
}
