//! VI (Video Interface) - scan-out timing and framebuffer capture
//!
//! The VI counts scan lines in CPU cycles, raises the VI interrupt when the
//! current half-line reaches VI_V_INTR and, at the end of every field,
//! decodes the framebuffer at VI_ORIGIN out of RDRAM into a [`Frame`].
//!
//! ## Memory Map
//!
//! VI registers are memory-mapped at 0x04400000-0x04400037:
//! - 0x04400000: VI_STATUS - pixel type (bits 0-1), gamma, dither, AA mode
//! - 0x04400004: VI_ORIGIN - framebuffer origin in RDRAM
//! - 0x04400008: VI_WIDTH - framebuffer line width in pixels
//! - 0x0440000C: VI_V_INTR - half-line that raises the VI interrupt
//! - 0x04400010: VI_V_CURRENT - current half-line (write clears the interrupt)
//! - 0x04400014: VI_BURST - color burst timing
//! - 0x04400018: VI_V_SYNC - half-lines per field
//! - 0x0440001C: VI_H_SYNC - line length
//! - 0x04400020: VI_LEAP - PAL leap pattern
//! - 0x04400024: VI_H_VIDEO - horizontal active start/end
//! - 0x04400028: VI_V_VIDEO - vertical active start/end (half-lines)
//! - 0x0440002C: VI_V_BURST - vertical burst start/end
//! - 0x04400030: VI_X_SCALE - horizontal scale (2.10)
//! - 0x04400034: VI_Y_SCALE - vertical scale (2.10)

use crate::config::Region;
use crate::mi::{Interrupt, MipsInterface};
use crate::rdram::Rdram;
use lockstep_core::clock::{Clock, Clocked};
use lockstep_core::logging::{log, LogCategory, LogLevel};
use lockstep_core::state::Serializer;
use lockstep_core::types::Frame;

/// VI register offsets (relative to 0x04400000)
const VI_STATUS: u32 = 0x00;
const VI_ORIGIN: u32 = 0x04;
const VI_WIDTH: u32 = 0x08;
const VI_V_INTR: u32 = 0x0C;
const VI_V_CURRENT: u32 = 0x10;
const VI_BURST: u32 = 0x14;
const VI_V_SYNC: u32 = 0x18;
const VI_H_SYNC: u32 = 0x1C;
const VI_LEAP: u32 = 0x20;
const VI_H_VIDEO: u32 = 0x24;
const VI_V_VIDEO: u32 = 0x28;
const VI_V_BURST: u32 = 0x2C;
const VI_X_SCALE: u32 = 0x30;
const VI_Y_SCALE: u32 = 0x34;

/// VI_STATUS pixel types
const TYPE_BLANK: u32 = 0;
const TYPE_16: u32 = 2;
const TYPE_32: u32 = 3;

/// Master ticks per VI cycle (the VI is counted in CPU cycles)
pub const VI_CLOCK_MULTIPLIER: u32 = 2;

const DEFAULT_WIDTH: u32 = 320;
const DEFAULT_HEIGHT: u32 = 240;
const MAX_WIDTH: u32 = 1024;
const MAX_HEIGHT: u32 = 576;

pub struct VideoInterface {
    clock: Clock,
    region: Region,

    status: u32,
    origin: u32,
    width: u32,
    v_intr: u32,
    burst: u32,
    v_sync: u32,
    h_sync: u32,
    leap: u32,
    h_video: u32,
    v_video: u32,
    v_burst: u32,
    x_scale: u32,
    y_scale: u32,

    /// Scan line within the current field
    line: u32,
    /// CPU cycles elapsed on the current line
    line_cycle: u32,
    fields: u64,

    frame: Frame,
    frame_ready: bool,
}

impl VideoInterface {
    pub fn new(region: Region) -> Self {
        let mut vi = Self {
            clock: Clock::new(VI_CLOCK_MULTIPLIER),
            region,
            status: 0,
            origin: 0,
            width: 0,
            v_intr: 0,
            burst: 0,
            v_sync: 0,
            h_sync: 0,
            leap: 0,
            h_video: 0,
            v_video: 0,
            v_burst: 0,
            x_scale: 0,
            y_scale: 0,
            line: 0,
            line_cycle: 0,
            fields: 0,
            frame: Frame::new(DEFAULT_WIDTH, DEFAULT_HEIGHT),
            frame_ready: false,
        };
        vi.reset();
        vi
    }

    /// Power-on register values for the configured region
    pub fn reset(&mut self) {
        self.clock.reset();
        self.status = TYPE_BLANK;
        self.origin = 0;
        self.width = DEFAULT_WIDTH;
        self.v_intr = 0x200;
        self.x_scale = 0x200;
        self.y_scale = 0x400;
        self.h_video = 0x006C_02EC;
        self.v_video = 0x0023_0203;
        match self.region {
            Region::Ntsc => {
                self.burst = 0x03E5_2239;
                self.v_sync = 0x020D;
                self.h_sync = 0x0C15;
                self.leap = 0x0C15_0C15;
                self.v_burst = 0x000E_0204;
            }
            Region::Pal => {
                self.burst = 0x0404_233A;
                self.v_sync = 0x0271;
                self.h_sync = 0x0017_0C69;
                self.leap = 0x0C6F_0C6D;
                self.v_burst = 0x0009_026B;
            }
        }
        self.line = 0;
        self.line_cycle = 0;
        self.fields = 0;
        self.frame = Frame::new(DEFAULT_WIDTH, DEFAULT_HEIGHT);
        self.frame_ready = false;
    }

    /// Current half-line as reported by VI_V_CURRENT
    pub fn current(&self) -> u32 {
        self.line << 1
    }

    /// Fields completed since power-on
    pub fn fields(&self) -> u64 {
        self.fields
    }

    fn lines_per_field(&self) -> u32 {
        if self.v_sync >= 2 {
            self.v_sync >> 1
        } else {
            self.region.lines_per_field()
        }
    }

    pub fn read_register(&self, offset: u32) -> u32 {
        match offset {
            VI_STATUS => self.status,
            VI_ORIGIN => self.origin,
            VI_WIDTH => self.width,
            VI_V_INTR => self.v_intr,
            VI_V_CURRENT => self.current(),
            VI_BURST => self.burst,
            VI_V_SYNC => self.v_sync,
            VI_H_SYNC => self.h_sync,
            VI_LEAP => self.leap,
            VI_H_VIDEO => self.h_video,
            VI_V_VIDEO => self.v_video,
            VI_V_BURST => self.v_burst,
            VI_X_SCALE => self.x_scale,
            VI_Y_SCALE => self.y_scale,
            _ => 0,
        }
    }

    pub fn write_register(&mut self, offset: u32, value: u32, mi: &mut MipsInterface) {
        if offset == VI_STATUS || offset == VI_ORIGIN || offset == VI_V_INTR {
            log(LogCategory::Video, LogLevel::Debug, || {
                format!("VI: write 0x{:02X} = 0x{:08X}", offset, value)
            });
        }

        match offset {
            VI_STATUS => self.status = value & 0xFFFF,
            VI_ORIGIN => self.origin = value & 0x00FF_FFFF,
            VI_WIDTH => self.width = value & 0xFFF,
            VI_V_INTR => self.v_intr = value & 0x3FF,
            VI_V_CURRENT => mi.lower(Interrupt::VI),
            VI_BURST => self.burst = value & 0x3FFF_FFFF,
            VI_V_SYNC => self.v_sync = value & 0x3FF,
            VI_H_SYNC => self.h_sync = value & 0x001F_0FFF,
            VI_LEAP => self.leap = value & 0x0FFF_0FFF,
            VI_H_VIDEO => self.h_video = value & 0x03FF_03FF,
            VI_V_VIDEO => self.v_video = value & 0x03FF_03FF,
            VI_V_BURST => self.v_burst = value & 0x03FF_03FF,
            VI_X_SCALE => self.x_scale = value & 0x0FFF_0FFF,
            VI_Y_SCALE => self.y_scale = value & 0x0FFF_0FFF,
            _ => {}
        }
    }

    /// Advance one CPU cycle
    pub fn step(&mut self, rdram: &Rdram, mi: &mut MipsInterface) {
        self.clock.step(1);
        self.line_cycle += 1;
        if self.line_cycle < self.region.cycles_per_line() {
            return;
        }

        self.line_cycle = 0;
        self.line += 1;
        if self.line >= self.lines_per_field() {
            self.line = 0;
            self.fields += 1;
            self.commit_frame(rdram);
        }

        if self.current() == self.v_intr {
            mi.raise(Interrupt::VI);
        }
    }

    /// Returns true once per committed field
    pub fn take_frame_ready(&mut self) -> bool {
        std::mem::replace(&mut self.frame_ready, false)
    }

    /// Most recently committed field
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    fn output_size(&self) -> (u32, u32) {
        let width = match self.width {
            0 => DEFAULT_WIDTH,
            w => w.min(MAX_WIDTH),
        };

        let start = (self.v_video >> 16) & 0x3FF;
        let end = self.v_video & 0x3FF;
        let scale = self.y_scale & 0xFFF;
        let height = ((end.saturating_sub(start) >> 1) * scale) >> 10;
        let height = match height {
            0 => DEFAULT_HEIGHT,
            h => h.min(MAX_HEIGHT),
        };

        (width, height)
    }

    fn commit_frame(&mut self, rdram: &Rdram) {
        let (width, height) = self.output_size();
        let mut frame = Frame::new(width, height);

        match self.status & 3 {
            TYPE_16 => {
                for (i, pixel) in frame.pixels.iter_mut().enumerate() {
                    let color = rdram.read_u16(self.origin + i as u32 * 2);
                    *pixel = rgba5551_to_argb(color);
                }
            }
            TYPE_32 => {
                for (i, pixel) in frame.pixels.iter_mut().enumerate() {
                    let color = rdram.read_u32(self.origin + i as u32 * 4);
                    *pixel = 0xFF00_0000 | (color >> 8);
                }
            }
            // Blank (and the reserved type 1) scan out black
            _ => {}
        }

        log(LogCategory::Video, LogLevel::Trace, || {
            format!(
                "VI: field {} committed {}x{} type {}",
                self.fields,
                width,
                height,
                self.status & 3
            )
        });

        self.frame = frame;
        self.frame_ready = true;
    }

    pub fn serialize(&mut self, s: &mut Serializer<'_>) {
        s.section("vi");
        self.clock.serialize(s);
        s.integer(&mut self.status);
        s.integer(&mut self.origin);
        s.integer(&mut self.width);
        s.integer(&mut self.v_intr);
        s.integer(&mut self.burst);
        s.integer(&mut self.v_sync);
        s.integer(&mut self.h_sync);
        s.integer(&mut self.leap);
        s.integer(&mut self.h_video);
        s.integer(&mut self.v_video);
        s.integer(&mut self.v_burst);
        s.integer(&mut self.x_scale);
        s.integer(&mut self.y_scale);
        s.integer(&mut self.line);
        s.integer(&mut self.line_cycle);
        s.integer(&mut self.fields);
        s.integer(&mut self.frame_ready);
    }
}

impl Clocked for VideoInterface {
    fn name(&self) -> &'static str {
        "vi"
    }

    fn clock(&self) -> &Clock {
        &self.clock
    }
}

fn expand5(c: u16) -> u32 {
    let c = u32::from(c & 0x1F);
    (c << 3) | (c >> 2)
}

fn rgba5551_to_argb(color: u16) -> u32 {
    let r = expand5(color >> 11);
    let g = expand5(color >> 6);
    let b = expand5(color >> 1);
    0xFF00_0000 | (r << 16) | (g << 8) | b
}
