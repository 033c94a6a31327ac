//! MI (MIPS Interface) - interrupt controller of the RCP
//!
//! Every RCP block (SP, SI, AI, VI, PI, DP) signals the CPU through one bit
//! of MI_INTR. The MI ANDs those bits with MI_INTR_MASK and drives the CPU's
//! IP2 line with the result; nothing else in the machine may reach the CPU's
//! interrupt inputs.
//!
//! ## Memory Map
//!
//! MI registers are memory-mapped at 0x04300000-0x0430000F:
//! - 0x04300000: MI_MODE - init length/mode, ebus test, RDRAM register mode
//! - 0x04300004: MI_VERSION - hardware version (read-only)
//! - 0x04300008: MI_INTR - interrupt status (read-only)
//! - 0x0430000C: MI_INTR_MASK - interrupt mask
//!
//! ## MI_INTR_MASK writes
//!
//! Each source has a clear/set bit pair: bit `2k` clears mask bit `k`, bit
//! `2k + 1` sets it (SP=0, SI=1, AI=2, VI=3, PI=4, DP=5).

use lockstep_core::logging::{log, LogCategory, LogLevel};
use lockstep_core::state::Serializer;

/// MI register offsets (relative to 0x04300000)
const MI_MODE: u32 = 0x00;
const MI_VERSION: u32 = 0x04;
const MI_INTR: u32 = 0x08;
const MI_INTR_MASK: u32 = 0x0C;

const VERSION: u32 = 0x0202_0102;

/// RCP interrupt sources, in MI_INTR bit order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    SP = 0,
    SI = 1,
    AI = 2,
    VI = 3,
    PI = 4,
    DP = 5,
}

impl Interrupt {
    pub fn bit(self) -> u32 {
        1 << self as u32
    }
}

/// MIPS Interface (MI) - Interrupt controller
#[derive(Debug, Clone, Default)]
pub struct MipsInterface {
    /// Bits 0-6 init length, bit 7 init mode, bit 8 ebus test, bit 9 RDRAM reg mode
    mode: u32,
    /// MI_INTR register - interrupt status (set by hardware)
    intr: u32,
    /// MI_INTR_MASK register - interrupt mask
    intr_mask: u32,
}

impl MipsInterface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn read_register(&self, offset: u32) -> u32 {
        match offset & 0x0F {
            MI_MODE => self.mode,
            MI_VERSION => VERSION,
            MI_INTR => self.intr,
            _ => self.intr_mask,
        }
    }

    pub fn write_register(&mut self, offset: u32, value: u32) {
        match offset & 0x0F {
            MI_MODE => {
                self.mode = (self.mode & !0x7F) | (value & 0x7F);
                // (clear bit, set bit, mode bit)
                for (clear, set, bit) in [(7, 8, 7), (9, 10, 8), (12, 13, 9)] {
                    if value & (1 << clear) != 0 {
                        self.mode &= !(1 << bit);
                    }
                    if value & (1 << set) != 0 {
                        self.mode |= 1 << bit;
                    }
                }
                if value & (1 << 11) != 0 {
                    self.lower(Interrupt::DP);
                }
            }
            MI_INTR_MASK => {
                for source in 0..6 {
                    if value & (1 << (2 * source)) != 0 {
                        self.intr_mask &= !(1 << source);
                    }
                    if value & (1 << (2 * source + 1)) != 0 {
                        self.intr_mask |= 1 << source;
                    }
                }
            }
            // MI_VERSION and MI_INTR are read-only
            _ => {}
        }
    }

    /// Set an interrupt bit (called by the RCP blocks)
    pub fn raise(&mut self, source: Interrupt) {
        if self.intr & source.bit() == 0 {
            log(LogCategory::Interrupts, LogLevel::Debug, || {
                format!("MI: {:?} raised", source)
            });
        }
        self.intr |= source.bit();
    }

    /// Clear an interrupt bit (acknowledge through the owning block)
    pub fn lower(&mut self, source: Interrupt) {
        self.intr &= !source.bit();
    }

    /// Raw interrupt status (unmasked)
    pub fn interrupt_status(&self) -> u32 {
        self.intr
    }

    pub fn interrupt_mask(&self) -> u32 {
        self.intr_mask
    }

    /// Level of the CPU's IP2 input
    pub fn irq_line(&self) -> bool {
        self.intr & self.intr_mask != 0
    }

    pub fn serialize(&mut self, s: &mut Serializer<'_>) {
        s.section("mi");
        s.integer(&mut self.mode);
        s.integer(&mut self.intr);
        s.integer(&mut self.intr_mask);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mi_creation() {
        let mi = MipsInterface::new();
        assert_eq!(mi.read_register(MI_MODE), 0);
        assert_eq!(mi.read_register(MI_VERSION), 0x02020102);
        assert_eq!(mi.read_register(MI_INTR), 0);
        assert_eq!(mi.read_register(MI_INTR_MASK), 0);
    }

    #[test]
    fn test_mi_reset() {
        let mut mi = MipsInterface::new();
        mi.raise(Interrupt::VI);
        mi.write_register(MI_INTR_MASK, 0x0080); // set VI mask

        mi.reset();

        assert_eq!(mi.read_register(MI_INTR), 0);
        assert_eq!(mi.read_register(MI_INTR_MASK), 0);
    }

    #[test]
    fn test_mi_mask_set_clear_pairs() {
        let mut mi = MipsInterface::new();

        // Set SP (bit 1) and VI (bit 7)
        mi.write_register(MI_INTR_MASK, 0x0082);
        assert_eq!(mi.interrupt_mask(), Interrupt::SP.bit() | Interrupt::VI.bit());

        // Clear SP (bit 0), set DP (bit 11)
        mi.write_register(MI_INTR_MASK, 0x0801);
        assert_eq!(mi.interrupt_mask(), Interrupt::VI.bit() | Interrupt::DP.bit());
    }

    #[test]
    fn test_mi_intr_is_read_only() {
        let mut mi = MipsInterface::new();
        mi.raise(Interrupt::SI);
        mi.write_register(MI_INTR, 0xFF);
        assert_eq!(mi.read_register(MI_INTR), Interrupt::SI.bit());
    }

    #[test]
    fn test_mi_irq_line_follows_mask() {
        let mut mi = MipsInterface::new();
        mi.raise(Interrupt::AI);
        assert!(!mi.irq_line());

        mi.write_register(MI_INTR_MASK, 0x0020); // set AI
        assert!(mi.irq_line());

        mi.lower(Interrupt::AI);
        assert!(!mi.irq_line());
    }

    #[test]
    fn test_mi_mode_register() {
        let mut mi = MipsInterface::new();

        // Init length plus set init mode
        mi.write_register(MI_MODE, (1 << 8) | 0x0F);
        assert_eq!(mi.read_register(MI_MODE), 0x8F);

        // Clear init mode, set RDRAM register mode
        mi.write_register(MI_MODE, (1 << 7) | (1 << 13) | 0x0F);
        assert_eq!(mi.read_register(MI_MODE), 0x20F);
    }

    #[test]
    fn test_mi_mode_clears_dp_interrupt() {
        let mut mi = MipsInterface::new();
        mi.raise(Interrupt::DP);
        mi.raise(Interrupt::VI);
        mi.write_register(MI_MODE, 1 << 11);
        assert_eq!(mi.interrupt_status(), Interrupt::VI.bit());
    }

    #[test]
    fn test_mi_version_readonly() {
        let mut mi = MipsInterface::new();
        mi.write_register(MI_VERSION, 0xDEADBEEF);
        assert_eq!(mi.read_register(MI_VERSION), 0x02020102);
    }
}
