//! SI (Serial Interface) - 64-byte DMA between RDRAM and PIF RAM
//!
//! ## Memory Map
//!
//! SI registers are memory-mapped at 0x04800000-0x0480001B:
//! - 0x04800000: SI_DRAM_ADDR - RDRAM side of the transfer
//! - 0x04800004: SI_PIF_AD_RD64B - start PIF RAM -> RDRAM
//! - 0x04800010: SI_PIF_AD_WR64B - start RDRAM -> PIF RAM
//! - 0x04800018: SI_STATUS - busy/interrupt bits; any write acknowledges
//!
//! A transfer completes a fixed number of cycles after it is requested: the
//! 64 bytes are copied in one go and the SI interrupt is raised. PIF -> RDRAM
//! transfers run the joybus command list first so that the CPU reads back
//! fresh controller responses.

use crate::mi::{Interrupt, MipsInterface};
use crate::pif::{Pif, PIF_RAM_SIZE};
use crate::rdram::Rdram;
use lockstep_core::clock::{Clock, Clocked};
use lockstep_core::logging::{log, LogCategory, LogLevel};
use lockstep_core::state::Serializer;

const SI_DRAM_ADDR: u32 = 0x00;
const SI_PIF_AD_RD64B: u32 = 0x04;
const SI_PIF_AD_WR64B: u32 = 0x10;
const SI_STATUS: u32 = 0x18;

const STATUS_DMA_BUSY: u32 = 1 << 0;
const STATUS_IO_BUSY: u32 = 1 << 1;
const STATUS_INTERRUPT: u32 = 1 << 12;

/// Master ticks per SI cycle (counted in CPU cycles)
pub const SI_CLOCK_MULTIPLIER: u32 = 2;

/// CPU cycles between a DMA request and its completion
pub const SI_DMA_LATENCY: u32 = 2304;

const IDLE: u8 = 0;
const TO_RDRAM: u8 = 1;
const TO_PIF: u8 = 2;

pub struct SerialInterface {
    clock: Clock,
    dram_addr: u32,
    pif_addr: u32,
    /// IDLE, TO_RDRAM or TO_PIF
    pending: u8,
    countdown: u32,
    interrupt: bool,
    pub pif: Pif,
}

impl SerialInterface {
    pub fn new() -> Self {
        Self {
            clock: Clock::new(SI_CLOCK_MULTIPLIER),
            dram_addr: 0,
            pif_addr: 0,
            pending: IDLE,
            countdown: 0,
            interrupt: false,
            pif: Pif::new(),
        }
    }

    /// Abandons any transfer in flight
    pub fn reset(&mut self) {
        self.clock.reset();
        self.dram_addr = 0;
        self.pif_addr = 0;
        self.pending = IDLE;
        self.countdown = 0;
        self.interrupt = false;
        self.pif.reset();
    }

    /// Drop the transfer in flight, if any, without completing it
    pub fn cancel_dma(&mut self) {
        self.pending = IDLE;
        self.countdown = 0;
    }

    pub fn is_busy(&self) -> bool {
        self.pending != IDLE
    }

    pub fn read_register(&self, offset: u32) -> u32 {
        match offset {
            SI_DRAM_ADDR => self.dram_addr,
            SI_PIF_AD_RD64B | SI_PIF_AD_WR64B => self.pif_addr,
            SI_STATUS => {
                let mut status = 0;
                if self.is_busy() {
                    status |= STATUS_DMA_BUSY | STATUS_IO_BUSY;
                }
                if self.interrupt {
                    status |= STATUS_INTERRUPT;
                }
                status
            }
            _ => 0,
        }
    }

    pub fn write_register(&mut self, offset: u32, value: u32, mi: &mut MipsInterface) {
        match offset {
            SI_DRAM_ADDR => self.dram_addr = value & 0x00FF_FFF8,
            SI_PIF_AD_RD64B => self.start(TO_RDRAM, value),
            SI_PIF_AD_WR64B => self.start(TO_PIF, value),
            SI_STATUS => {
                self.interrupt = false;
                mi.lower(Interrupt::SI);
            }
            _ => {}
        }
    }

    fn start(&mut self, direction: u8, pif_addr: u32) {
        if self.is_busy() {
            log(LogCategory::Stubs, LogLevel::Warn, || {
                "SI: DMA requested while busy, ignored".to_string()
            });
            return;
        }
        self.pif_addr = pif_addr & 0x7FC;
        self.pending = direction;
        self.countdown = SI_DMA_LATENCY;
    }

    /// Advance one CPU cycle
    pub fn step(&mut self, rdram: &mut Rdram, mi: &mut MipsInterface) {
        self.clock.step(1);
        if self.pending == IDLE {
            return;
        }
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown > 0 {
            return;
        }

        if self.pending == TO_RDRAM {
            self.pif.run_joybus();
            for (i, &byte) in self.pif.ram().iter().enumerate() {
                rdram.write_u8(self.dram_addr + i as u32, byte);
            }
        } else {
            for i in 0..PIF_RAM_SIZE {
                self.pif.ram_mut()[i] = rdram.read_u8(self.dram_addr + i as u32);
            }
        }

        log(LogCategory::Interrupts, LogLevel::Trace, || {
            format!(
                "SI: DMA {} RDRAM 0x{:06X} complete",
                if self.pending == TO_RDRAM { "to" } else { "from" },
                self.dram_addr
            )
        });

        self.pending = IDLE;
        self.interrupt = true;
        mi.raise(Interrupt::SI);
    }

    pub fn serialize(&mut self, s: &mut Serializer<'_>) {
        s.section("si");
        self.clock.serialize(s);
        s.integer(&mut self.dram_addr);
        s.integer(&mut self.pif_addr);
        s.integer(&mut self.pending);
        s.integer(&mut self.countdown);
        s.integer(&mut self.interrupt);
        self.pif.serialize(s);
    }
}

impl Default for SerialInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl Clocked for SerialInterface {
    fn name(&self) -> &'static str {
        "si"
    }

    fn clock(&self) -> &Clock {
        &self.clock
    }
}
