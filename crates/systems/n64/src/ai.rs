//! AI (Audio Interface) - DMA-fed stereo DAC
//!
//! Software queues up to two RDRAM buffers through AI_DRAM_ADDR/AI_LEN. The
//! AI plays the head buffer one 32-bit stereo frame (big-endian left, right)
//! per DAC period and raises the AI interrupt whenever a buffer starts
//! playing, which is the moment the FIFO has room for another one.
//!
//! ## Memory Map
//!
//! AI registers are memory-mapped at 0x04500000-0x04500017:
//! - 0x04500000: AI_DRAM_ADDR - start of the next buffer (8-byte aligned)
//! - 0x04500004: AI_LEN - length of the next buffer; read returns bytes left
//! - 0x04500008: AI_CONTROL - bit 0 enables DMA
//! - 0x0450000C: AI_STATUS - full/busy/enabled; any write acknowledges
//! - 0x04500010: AI_DACRATE - DAC period in video clocks, minus one
//! - 0x04500014: AI_BITRATE - bits per sample, minus one

use crate::config::{Region, CPU_HZ};
use crate::mi::{Interrupt, MipsInterface};
use crate::rdram::Rdram;
use lockstep_core::clock::{Clock, Clocked};
use lockstep_core::logging::{log, LogCategory, LogLevel};
use lockstep_core::state::Serializer;

const AI_DRAM_ADDR: u32 = 0x00;
const AI_LEN: u32 = 0x04;
const AI_CONTROL: u32 = 0x08;
const AI_STATUS: u32 = 0x0C;
const AI_DACRATE: u32 = 0x10;
const AI_BITRATE: u32 = 0x14;

const STATUS_FULL: u32 = 0x8000_0001;
const STATUS_BUSY: u32 = 1 << 30;
const STATUS_ENABLED: u32 = 1 << 25;

/// Master ticks per AI cycle (counted in CPU cycles)
pub const AI_CLOCK_MULTIPLIER: u32 = 2;

const FIFO_DEPTH: usize = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Buffer {
    addr: u32,
    len: u32,
}

pub struct AudioInterface {
    clock: Clock,
    region: Region,
    dram_addr: u32,
    control: u32,
    dacrate: u32,
    bitrate: u32,
    fifo: [Buffer; FIFO_DEPTH],
    queued: u32,
    /// CPU cycles until the next sample is fetched
    countdown: u32,
    samples: Vec<i16>,
}

impl AudioInterface {
    pub fn new(region: Region) -> Self {
        Self {
            clock: Clock::new(AI_CLOCK_MULTIPLIER),
            region,
            dram_addr: 0,
            control: 0,
            dacrate: 0,
            bitrate: 0,
            fifo: [Buffer::default(); FIFO_DEPTH],
            queued: 0,
            countdown: 0,
            samples: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.region);
    }

    /// CPU cycles per stereo sample
    pub fn sample_period(&self) -> u32 {
        let cycles = (u64::from(self.dacrate) + 1) * CPU_HZ / self.region.video_clock_hz();
        cycles.max(1) as u32
    }

    /// Output rate in Hz for the current DAC setting
    pub fn sample_rate(&self) -> u32 {
        (self.region.video_clock_hz() / (u64::from(self.dacrate) + 1)) as u32
    }

    /// Drain the interleaved stereo samples produced so far
    pub fn take_samples(&mut self) -> Vec<i16> {
        std::mem::take(&mut self.samples)
    }

    pub fn read_register(&self, offset: u32) -> u32 {
        match offset {
            AI_DRAM_ADDR => self.dram_addr,
            AI_LEN => {
                if self.queued > 0 {
                    self.fifo[0].len
                } else {
                    0
                }
            }
            AI_CONTROL => self.control,
            AI_STATUS => self.status(),
            AI_DACRATE => self.dacrate,
            AI_BITRATE => self.bitrate,
            _ => 0,
        }
    }

    fn status(&self) -> u32 {
        let mut status = 0;
        if self.queued as usize == FIFO_DEPTH {
            status |= STATUS_FULL;
        }
        if self.queued > 0 {
            status |= STATUS_BUSY;
        }
        if self.control & 1 != 0 {
            status |= STATUS_ENABLED;
        }
        status
    }

    pub fn write_register(&mut self, offset: u32, value: u32, mi: &mut MipsInterface) {
        match offset {
            AI_DRAM_ADDR => self.dram_addr = value & 0x00FF_FFF8,
            AI_LEN => self.queue(value & 0x0003_FFF8, mi),
            AI_CONTROL => self.control = value & 1,
            AI_STATUS => mi.lower(Interrupt::AI),
            AI_DACRATE => self.dacrate = value & 0x3FFF,
            AI_BITRATE => self.bitrate = value & 0xF,
            _ => {}
        }
    }

    fn queue(&mut self, len: u32, mi: &mut MipsInterface) {
        if len == 0 {
            return;
        }
        if self.queued as usize == FIFO_DEPTH {
            log(LogCategory::Audio, LogLevel::Warn, || {
                format!("AI: FIFO full, dropping {} byte buffer", len)
            });
            return;
        }

        self.fifo[self.queued as usize] = Buffer {
            addr: self.dram_addr,
            len,
        };
        self.queued += 1;
        log(LogCategory::Audio, LogLevel::Debug, || {
            format!("AI: queued 0x{:06X} len {} ({} pending)", self.dram_addr, len, self.queued)
        });

        if self.queued == 1 {
            self.countdown = self.sample_period();
            mi.raise(Interrupt::AI);
        }
    }

    /// Advance one CPU cycle
    pub fn step(&mut self, rdram: &Rdram, mi: &mut MipsInterface) {
        self.clock.step(1);
        if self.queued == 0 || self.control & 1 == 0 {
            return;
        }
        if self.countdown > 1 {
            self.countdown -= 1;
            return;
        }
        self.countdown = self.sample_period();

        let head = &mut self.fifo[0];
        self.samples.push(rdram.read_u16(head.addr) as i16);
        self.samples.push(rdram.read_u16(head.addr + 2) as i16);
        head.addr = (head.addr + 4) & 0x00FF_FFFF;
        head.len = head.len.saturating_sub(4);

        if head.len == 0 {
            self.fifo[0] = self.fifo[1];
            self.fifo[1] = Buffer::default();
            self.queued -= 1;
            if self.queued > 0 {
                mi.raise(Interrupt::AI);
            }
        }
    }

    pub fn serialize(&mut self, s: &mut Serializer<'_>) {
        s.section("ai");
        self.clock.serialize(s);
        s.integer(&mut self.dram_addr);
        s.integer(&mut self.control);
        s.integer(&mut self.dacrate);
        s.integer(&mut self.bitrate);
        for buffer in self.fifo.iter_mut() {
            s.integer(&mut buffer.addr);
            s.integer(&mut buffer.len);
        }
        s.bounded("ai.queued", &mut self.queued, FIFO_DEPTH as u32);
        s.integer(&mut self.countdown);
    }
}

impl Clocked for AudioInterface {
    fn name(&self) -> &'static str {
        "ai"
    }

    fn clock(&self) -> &Clock {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_core::state::{self, Serializable, StateError};

    fn setup() -> (AudioInterface, Rdram, MipsInterface) {
        let mut rdram = Rdram::new(0x1000);
        for i in 0..16u32 {
            rdram.write_u32(0x100 + i * 4, 0x0001_FFFF + i * 0x0001_0000);
        }
        (AudioInterface::new(Region::Ntsc), rdram, MipsInterface::new())
    }

    fn run(ai: &mut AudioInterface, rdram: &Rdram, mi: &mut MipsInterface, cycles: u32) {
        for _ in 0..cycles {
            ai.step(rdram, mi);
        }
    }

    #[test]
    fn test_ai_sample_period() {
        let mut ai = AudioInterface::new(Region::Ntsc);
        let mut mi = MipsInterface::new();
        // 48681812 / 44100 - 1
        ai.write_register(AI_DACRATE, 1103, &mut mi);
        assert_eq!(ai.sample_rate(), 44095);
        assert_eq!(ai.sample_period(), 2126);
    }

    #[test]
    fn test_ai_fifo_status_and_interrupt() {
        let (mut ai, _, mut mi) = setup();
        ai.write_register(AI_CONTROL, 1, &mut mi);
        assert_eq!(ai.read_register(AI_STATUS), STATUS_ENABLED);

        ai.write_register(AI_DRAM_ADDR, 0x100, &mut mi);
        ai.write_register(AI_LEN, 16, &mut mi);
        assert_ne!(mi.interrupt_status() & Interrupt::AI.bit(), 0);
        assert_eq!(ai.read_register(AI_STATUS), STATUS_ENABLED | STATUS_BUSY);

        ai.write_register(AI_LEN, 16, &mut mi);
        assert_eq!(
            ai.read_register(AI_STATUS),
            STATUS_ENABLED | STATUS_BUSY | STATUS_FULL
        );

        // A third buffer does not fit
        ai.write_register(AI_DRAM_ADDR, 0x800, &mut mi);
        ai.write_register(AI_LEN, 16, &mut mi);
        assert_eq!(ai.queued, 2);

        ai.write_register(AI_STATUS, 0, &mut mi);
        assert_eq!(mi.interrupt_status() & Interrupt::AI.bit(), 0);
    }

    #[test]
    fn test_ai_plays_stereo_samples() {
        let (mut ai, rdram, mut mi) = setup();
        ai.write_register(AI_CONTROL, 1, &mut mi);
        ai.write_register(AI_DRAM_ADDR, 0x100, &mut mi);
        ai.write_register(AI_LEN, 16, &mut mi);

        let period = ai.sample_period();
        run(&mut ai, &rdram, &mut mi, period * 2);

        assert_eq!(ai.take_samples(), vec![1, -1, 2, -1]);
        assert_eq!(ai.read_register(AI_LEN), 8);
        assert!(ai.take_samples().is_empty());
    }

    #[test]
    fn test_ai_next_buffer_raises_interrupt() {
        let (mut ai, rdram, mut mi) = setup();
        ai.write_register(AI_CONTROL, 1, &mut mi);
        ai.write_register(AI_DRAM_ADDR, 0x100, &mut mi);
        ai.write_register(AI_LEN, 8, &mut mi);
        ai.write_register(AI_DRAM_ADDR, 0x120, &mut mi);
        ai.write_register(AI_LEN, 8, &mut mi);
        ai.write_register(AI_STATUS, 0, &mut mi);

        let period = ai.sample_period();
        run(&mut ai, &rdram, &mut mi, period);
        assert_eq!(mi.interrupt_status() & Interrupt::AI.bit(), 0);

        run(&mut ai, &rdram, &mut mi, period);
        assert_ne!(mi.interrupt_status() & Interrupt::AI.bit(), 0);
        assert_eq!(ai.read_register(AI_STATUS) & STATUS_FULL, 0);

        run(&mut ai, &rdram, &mut mi, period * 2);
        assert_eq!(ai.read_register(AI_STATUS) & STATUS_BUSY, 0);
        assert_eq!(ai.take_samples().len(), 8);
    }

    #[test]
    fn test_ai_disabled_dma_holds() {
        let (mut ai, rdram, mut mi) = setup();
        ai.write_register(AI_DRAM_ADDR, 0x100, &mut mi);
        ai.write_register(AI_LEN, 8, &mut mi);

        let period = ai.sample_period();
        run(&mut ai, &rdram, &mut mi, period * 4);
        assert!(ai.take_samples().is_empty());
        assert_eq!(ai.read_register(AI_LEN), 8);
        assert_eq!(ai.clock().cycles(), i64::from(period) * 4);
    }

    struct Snapshot<'a>(&'a mut AudioInterface);

    impl Serializable for Snapshot<'_> {
        fn serialize(&mut self, s: &mut Serializer<'_>) {
            self.0.serialize(s);
        }
    }

    #[test]
    fn test_ai_restore_rejects_overfull_fifo() {
        let (mut ai, _, mut mi) = setup();
        ai.write_register(AI_DRAM_ADDR, 0x100, &mut mi);
        ai.write_register(AI_LEN, 8, &mut mi);
        ai.queued = 3;
        let blob = state::capture(&mut Snapshot(&mut ai), 1);

        let mut target = AudioInterface::new(Region::Ntsc);
        assert_eq!(
            state::restore(&mut Snapshot(&mut target), 1, &blob),
            Err(StateError::OutOfRange { field: "ai.queued" })
        );
        assert_eq!(target.queued, 0);

        ai.queued = 2;
        let blob = state::capture(&mut Snapshot(&mut ai), 1);
        assert!(state::restore(&mut Snapshot(&mut target), 1, &blob).is_ok());
        assert_eq!(target.queued, 2);
    }
}

