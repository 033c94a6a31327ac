//! PI (Peripheral Interface) - cartridge bus DMA
//!
//! ## Memory Map
//!
//! PI registers are memory-mapped at 0x04600000-0x04600033:
//! - 0x04600000: PI_DRAM_ADDR
//! - 0x04600004: PI_CART_ADDR
//! - 0x04600008: PI_RD_LEN - RDRAM -> cartridge, length minus one
//! - 0x0460000C: PI_WR_LEN - cartridge -> RDRAM, length minus one
//! - 0x04600010: PI_STATUS - read: busy/error/interrupt; write: bit 0 resets
//!   the controller, bit 1 acknowledges the interrupt
//! - 0x04600014-0x04600020: PI_BSD_DOM1_LAT/PWD/PGS/RLS
//! - 0x04600024-0x04600030: PI_BSD_DOM2_LAT/PWD/PGS/RLS
//!
//! A transfer takes `(LAT + 1) + words * (PWD + 1 + RLS + 1)` cycles using the
//! timing of the domain the cartridge address falls in; the copy happens at
//! the end of that window and raises the PI interrupt.

use crate::cartridge::Cartridge;
use crate::mi::{Interrupt, MipsInterface};
use crate::rdram::Rdram;
use lockstep_core::clock::{Clock, Clocked};
use lockstep_core::logging::{log, LogCategory, LogLevel};
use lockstep_core::state::Serializer;

const PI_DRAM_ADDR: u32 = 0x00;
const PI_CART_ADDR: u32 = 0x04;
const PI_RD_LEN: u32 = 0x08;
const PI_WR_LEN: u32 = 0x0C;
const PI_STATUS: u32 = 0x10;
const PI_BSD_DOM1_LAT: u32 = 0x14;
const PI_BSD_DOM2_RLS: u32 = 0x30;

const STATUS_DMA_BUSY: u32 = 1 << 0;
const STATUS_IO_BUSY: u32 = 1 << 1;
const STATUS_INTERRUPT: u32 = 1 << 3;

const WRITE_RESET: u32 = 1 << 0;
const WRITE_CLEAR_INTERRUPT: u32 = 1 << 1;

/// Start of cartridge domain 1 address 2 (the ROM)
pub const CART_ROM_BASE: u32 = 0x1000_0000;

/// Master ticks per PI cycle (counted in CPU cycles)
pub const PI_CLOCK_MULTIPLIER: u32 = 2;

const IDLE: u8 = 0;
const TO_RDRAM: u8 = 1;
const TO_CART: u8 = 2;

// Index into a domain's timing registers
const LAT: usize = 0;
const PWD: usize = 1;
const RLS: usize = 3;

pub struct PeripheralInterface {
    clock: Clock,
    dram_addr: u32,
    cart_addr: u32,
    rd_len: u32,
    wr_len: u32,
    /// LAT, PWD, PGS, RLS for domains 1 and 2
    domains: [[u32; 4]; 2],
    pending: u8,
    length: u32,
    countdown: u32,
    interrupt: bool,
}

impl PeripheralInterface {
    pub fn new() -> Self {
        let mut pi = Self {
            clock: Clock::new(PI_CLOCK_MULTIPLIER),
            dram_addr: 0,
            cart_addr: 0,
            rd_len: 0,
            wr_len: 0,
            domains: [[0; 4]; 2],
            pending: IDLE,
            length: 0,
            countdown: 0,
            interrupt: false,
        };
        pi.reset();
        pi
    }

    /// Power-on state with the domain 1 timing the boot code programs
    pub fn reset(&mut self) {
        self.clock.reset();
        self.dram_addr = 0;
        self.cart_addr = 0;
        self.rd_len = 0x7F;
        self.wr_len = 0x7F;
        self.domains = [[0x40, 0x12, 0x07, 0x03], [0; 4]];
        self.cancel_dma();
        self.interrupt = false;
    }

    /// Drop the transfer in flight, if any, without completing it
    pub fn cancel_dma(&mut self) {
        self.pending = IDLE;
        self.length = 0;
        self.countdown = 0;
    }

    pub fn is_busy(&self) -> bool {
        self.pending != IDLE
    }

    pub fn read_register(&self, offset: u32) -> u32 {
        match offset {
            PI_DRAM_ADDR => self.dram_addr,
            PI_CART_ADDR => self.cart_addr,
            PI_RD_LEN => self.rd_len,
            PI_WR_LEN => self.wr_len,
            PI_STATUS => {
                let mut status = 0;
                if self.is_busy() {
                    status |= STATUS_DMA_BUSY | STATUS_IO_BUSY;
                }
                if self.interrupt {
                    status |= STATUS_INTERRUPT;
                }
                status
            }
            PI_BSD_DOM1_LAT..=PI_BSD_DOM2_RLS => {
                let index = ((offset - PI_BSD_DOM1_LAT) >> 2) as usize;
                self.domains[index / 4][index % 4]
            }
            _ => 0,
        }
    }

    pub fn write_register(&mut self, offset: u32, value: u32, mi: &mut MipsInterface) {
        match offset {
            PI_DRAM_ADDR => self.dram_addr = value & 0x00FF_FFFE,
            PI_CART_ADDR => self.cart_addr = value & 0xFFFF_FFFE,
            PI_RD_LEN => {
                self.rd_len = value & 0x00FF_FFFF;
                self.start(TO_CART, self.rd_len + 1);
            }
            PI_WR_LEN => {
                self.wr_len = value & 0x00FF_FFFF;
                self.start(TO_RDRAM, self.wr_len + 1);
            }
            PI_STATUS => {
                if value & WRITE_RESET != 0 {
                    if self.is_busy() {
                        log(LogCategory::Stubs, LogLevel::Debug, || {
                            "PI: reset abandoned DMA in flight".to_string()
                        });
                    }
                    self.cancel_dma();
                }
                if value & WRITE_CLEAR_INTERRUPT != 0 {
                    self.interrupt = false;
                    mi.lower(Interrupt::PI);
                }
            }
            PI_BSD_DOM1_LAT..=PI_BSD_DOM2_RLS => {
                let index = ((offset - PI_BSD_DOM1_LAT) >> 2) as usize;
                self.domains[index / 4][index % 4] = value & 0xFF;
            }
            _ => {}
        }
    }

    /// Cycles a transfer of `length` bytes at the current cartridge address
    /// takes, saturating at `u32::MAX`
    pub fn transfer_cycles(&self, length: u32) -> u32 {
        let domain = if self.cart_addr >= CART_ROM_BASE {
            &self.domains[0]
        } else {
            &self.domains[1]
        };
        let words = u64::from(length.div_ceil(2));
        let per_word = u64::from(domain[PWD]) + 1 + u64::from(domain[RLS]) + 1;
        let cycles = u64::from(domain[LAT]) + 1 + words * per_word;
        u32::try_from(cycles).unwrap_or(u32::MAX)
    }

    fn start(&mut self, direction: u8, length: u32) {
        if self.is_busy() {
            log(LogCategory::Stubs, LogLevel::Warn, || {
                "PI: DMA requested while busy, ignored".to_string()
            });
            return;
        }
        self.pending = direction;
        self.length = length;
        self.countdown = self.transfer_cycles(length);
        log(LogCategory::Bus, LogLevel::Debug, || {
            format!(
                "PI: DMA cart 0x{:08X} dram 0x{:06X} len {} ({} cycles)",
                self.cart_addr, self.dram_addr, length, self.countdown
            )
        });
    }

    /// Advance one CPU cycle
    pub fn step(&mut self, rdram: &mut Rdram, cart: &Cartridge, mi: &mut MipsInterface) {
        self.clock.step(1);
        if self.pending == IDLE {
            return;
        }
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown > 0 {
            return;
        }

        if self.pending == TO_RDRAM {
            for i in 0..self.length {
                let byte = match self.cart_addr.checked_sub(CART_ROM_BASE) {
                    Some(rom_offset) => cart.read_u8(rom_offset.wrapping_add(i)),
                    None => 0,
                };
                rdram.write_u8(self.dram_addr.wrapping_add(i) & 0x00FF_FFFF, byte);
            }
        } else {
            log(LogCategory::Stubs, LogLevel::Debug, || {
                format!("PI: {} byte write to read-only cartridge dropped", self.length)
            });
        }

        self.dram_addr = (self.dram_addr + self.length + 7) & 0x00FF_FFF8;
        self.cart_addr = self.cart_addr.wrapping_add(self.length + 1) & 0xFFFF_FFFE;
        self.cancel_dma();
        self.interrupt = true;
        mi.raise(Interrupt::PI);
    }

    pub fn serialize(&mut self, s: &mut Serializer<'_>) {
        s.section("pi");
        self.clock.serialize(s);
        s.integer(&mut self.dram_addr);
        s.integer(&mut self.cart_addr);
        s.integer(&mut self.rd_len);
        s.integer(&mut self.wr_len);
        for domain in self.domains.iter_mut() {
            s.array(domain);
        }
        s.integer(&mut self.pending);
        s.integer(&mut self.length);
        s.integer(&mut self.countdown);
        s.integer(&mut self.interrupt);
    }
}

impl Default for PeripheralInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl Clocked for PeripheralInterface {
    fn name(&self) -> &'static str {
        "pi"
    }

    fn clock(&self) -> &Clock {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (PeripheralInterface, Rdram, Cartridge, MipsInterface) {
        let rom: Vec<u8> = (0..64u8).collect();
        (
            PeripheralInterface::new(),
            Rdram::new(0x1000),
            Cartridge::from_bytes(&rom),
            MipsInterface::new(),
        )
    }

    fn run(
        pi: &mut PeripheralInterface,
        rdram: &mut Rdram,
        cart: &Cartridge,
        mi: &mut MipsInterface,
        cycles: u32,
    ) {
        for _ in 0..cycles {
            pi.step(rdram, cart, mi);
        }
    }

    #[test]
    fn test_pi_domain_timing() {
        let mut pi = PeripheralInterface::new();
        let mut mi = MipsInterface::new();
        pi.write_register(PI_CART_ADDR, CART_ROM_BASE, &mut mi);
        // 0x41 + 4 * (0x13 + 0x04)
        assert_eq!(pi.transfer_cycles(8), 157);

        pi.write_register(0x24, 0x05, &mut mi); // DOM2_LAT
        pi.write_register(PI_CART_ADDR, 0x0800_0000, &mut mi);
        assert_eq!(pi.read_register(0x24), 0x05);
        assert_eq!(pi.transfer_cycles(2), 6 + 2);
    }

    #[test]
    fn test_pi_cart_to_rdram() {
        let (mut pi, mut rdram, cart, mut mi) = setup();
        pi.write_register(PI_DRAM_ADDR, 0x100, &mut mi);
        pi.write_register(PI_CART_ADDR, CART_ROM_BASE + 0x10, &mut mi);
        pi.write_register(PI_WR_LEN, 7, &mut mi);
        assert_eq!(
            pi.read_register(PI_STATUS),
            STATUS_DMA_BUSY | STATUS_IO_BUSY
        );

        let cycles = pi.transfer_cycles(8);
        run(&mut pi, &mut rdram, &cart, &mut mi, cycles - 1);
        assert_eq!(rdram.read_u32(0x100), 0);
        assert_eq!(mi.interrupt_status(), 0);

        run(&mut pi, &mut rdram, &cart, &mut mi, 1);
        assert_eq!(rdram.read_u32(0x100), 0x1011_1213);
        assert_eq!(rdram.read_u32(0x104), 0x1415_1617);
        assert_eq!(pi.read_register(PI_STATUS), STATUS_INTERRUPT);
        assert_eq!(mi.interrupt_status(), Interrupt::PI.bit());
        assert_eq!(pi.read_register(PI_DRAM_ADDR), 0x108);
        assert_eq!(pi.read_register(PI_CART_ADDR), CART_ROM_BASE + 0x18);

        pi.write_register(PI_STATUS, WRITE_CLEAR_INTERRUPT, &mut mi);
        assert_eq!(pi.read_register(PI_STATUS), 0);
        assert_eq!(mi.interrupt_status(), 0);
    }

    #[test]
    fn test_pi_reset_abandons_dma() {
        let (mut pi, mut rdram, cart, mut mi) = setup();
        pi.write_register(PI_CART_ADDR, CART_ROM_BASE, &mut mi);
        pi.write_register(PI_WR_LEN, 3, &mut mi);
        pi.write_register(PI_STATUS, WRITE_RESET, &mut mi);
        assert!(!pi.is_busy());

        run(&mut pi, &mut rdram, &cart, &mut mi, 1000);
        assert_eq!(rdram.read_u32(0), 0);
        assert_eq!(mi.interrupt_status(), 0);
    }

    #[test]
    fn test_pi_write_to_cart_completes_without_copy() {
        let (mut pi, mut rdram, cart, mut mi) = setup();
        rdram.write_u32(0, 0xAABB_CCDD);
        pi.write_register(PI_CART_ADDR, CART_ROM_BASE, &mut mi);
        pi.write_register(PI_RD_LEN, 3, &mut mi);

        run(&mut pi, &mut rdram, &cart, &mut mi, 1000);
        assert_eq!(cart.read_u8(0), 0);
        assert_eq!(mi.interrupt_status(), Interrupt::PI.bit());
    }

    #[test]
    fn test_pi_busy_ignores_second_request() {
        let (mut pi, mut rdram, cart, mut mi) = setup();
        pi.write_register(PI_CART_ADDR, CART_ROM_BASE, &mut mi);
        pi.write_register(PI_WR_LEN, 1, &mut mi);
        pi.write_register(PI_WR_LEN, 63, &mut mi);

        let cycles = pi.transfer_cycles(2);
        run(&mut pi, &mut rdram, &cart, &mut mi, cycles);
        assert!(!pi.is_busy());
        assert_eq!(rdram.read_u32(0), 0x0001_0000);
    }

    #[test]
    fn test_pi_slowest_timing_full_length() {
        let (mut pi, mut rdram, cart, mut mi) = setup();
        pi.write_register(PI_CART_ADDR, CART_ROM_BASE, &mut mi);
        pi.write_register(0x14, 0xFF, &mut mi); // DOM1_LAT
        pi.write_register(0x18, 0xFF, &mut mi); // DOM1_PWD
        pi.write_register(0x20, 0xFF, &mut mi); // DOM1_RLS
        pi.write_register(PI_WR_LEN, 0x00FF_FFFF, &mut mi);

        assert!(pi.is_busy());
        assert_eq!(pi.transfer_cycles(0x0100_0000), u32::MAX);
        assert_eq!(pi.transfer_cycles(2), 0x100 + 0x202);

        run(&mut pi, &mut rdram, &cart, &mut mi, 1000);
        assert!(pi.is_busy());
        assert_eq!(mi.interrupt_status(), 0);
    }
}
