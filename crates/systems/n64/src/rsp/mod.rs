//! RSP (Reality Signal Processor)
//!
//! A MIPS-subset scalar core executing out of 4 KiB of IMEM, with the vector
//! unit attached as its COP2. The core runs on its own clock (62.5 MHz, three
//! master ticks per cycle) and is synchronized to the CPU by the scheduler;
//! while halted it still advances its clock so synchronization terminates.
//!
//! # Memory Map
//!
//! - 0x04000000-0x04000FFF: DMEM
//! - 0x04001000-0x04001FFF: IMEM
//! - 0x04040000-0x0404001F: SP registers
//! - 0x04080000: SP_PC
//!
//! ## SP_STATUS
//!
//! Read: bit 0 halt, 1 broke, 2 dma busy, 3 dma full, 4 io full, 5 single
//! step, 6 interrupt on break, 7-14 signals 0-7.
//!
//! Write: bit 0/1 clear/set halt, 2 clear broke, 3/4 clear/set the SP
//! interrupt, 5/6 clear/set single step, 7/8 clear/set interrupt on break,
//! then one clear/set pair per signal starting at bit 9.
//!
//! ## DMA
//!
//! RD_LEN / WR_LEN: bits 0-11 length - 1 (rounded up to 8 bytes), bits
//! 12-19 row count - 1, bits 20-31 RDRAM skip between rows. Bit 12 of
//! MEM_ADDR selects IMEM. Transfers complete immediately.

pub mod tables;
pub mod vu;

use crate::mi::{Interrupt, MipsInterface};
use crate::rdram::{read_be, write_be, Rdram};
use lockstep_core::logging::{log, LogCategory, LogLevel};
use lockstep_core::state::Serializer;
use lockstep_core::{AccessSize, Clock, Clocked};
use vu::VectorUnit;

pub const DMEM_SIZE: usize = 0x1000;

/// Master ticks per RSP cycle (62.5 MHz)
pub const RSP_CLOCK_MULTIPLIER: u32 = 3;

/// SP register offsets (relative to 0x04040000)
const SP_MEM_ADDR: u32 = 0x00;
const SP_DRAM_ADDR: u32 = 0x04;
const SP_RD_LEN: u32 = 0x08;
const SP_WR_LEN: u32 = 0x0C;
const SP_STATUS: u32 = 0x10;
const SP_DMA_FULL: u32 = 0x14;
const SP_DMA_BUSY: u32 = 0x18;
const SP_SEMAPHORE: u32 = 0x1C;

const STATUS_HALT: u32 = 1 << 0;
const STATUS_BROKE: u32 = 1 << 1;
const STATUS_SSTEP: u32 = 1 << 5;
const STATUS_INTR_BREAK: u32 = 1 << 6;
const STATUS_SIGNAL0: u32 = 1 << 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// RDRAM to SP memory
    Read,
    /// SP memory to RDRAM
    Write,
}

pub struct Rsp {
    clock: Clock,
    dmem: Box<[u8; DMEM_SIZE]>,
    imem: Box<[u8; DMEM_SIZE]>,
    gpr: [u32; 32],
    /// Address of the next instruction
    pc: u32,
    /// Address after that (branch target once a branch has executed)
    next_pc: u32,
    status: u32,
    mem_addr: u32,
    dram_addr: u32,
    rd_len: u32,
    wr_len: u32,
    semaphore: bool,
    pub vu: VectorUnit,
}

impl Default for Rsp {
    fn default() -> Self {
        Self::new()
    }
}

impl Rsp {
    pub fn new() -> Self {
        Self {
            clock: Clock::new(RSP_CLOCK_MULTIPLIER),
            dmem: Box::new([0; DMEM_SIZE]),
            imem: Box::new([0; DMEM_SIZE]),
            gpr: [0; 32],
            pc: 0,
            next_pc: 4,
            status: STATUS_HALT,
            mem_addr: 0,
            dram_addr: 0,
            rd_len: 0,
            wr_len: 0,
            semaphore: false,
            vu: VectorUnit::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn is_halted(&self) -> bool {
        self.status & STATUS_HALT != 0
    }

    pub fn status(&self) -> u32 {
        self.status
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn gpr(&self, index: usize) -> u32 {
        self.gpr[index & 31]
    }

    pub fn dmem(&self) -> &[u8; DMEM_SIZE] {
        &self.dmem
    }

    pub fn dmem_mut(&mut self) -> &mut [u8; DMEM_SIZE] {
        &mut self.dmem
    }

    pub fn imem_mut(&mut self) -> &mut [u8; DMEM_SIZE] {
        &mut self.imem
    }

    /// DMEM/IMEM access from the CPU side (offset bit 12 selects IMEM)
    pub fn read_memory(&self, offset: u32, size: AccessSize) -> u64 {
        let bank = if offset & 0x1000 != 0 {
            &self.imem
        } else {
            &self.dmem
        };
        read_be(&bank[..], (offset & 0xFFF) as usize, size)
    }

    pub fn write_memory(&mut self, offset: u32, size: AccessSize, value: u64) {
        let bank = if offset & 0x1000 != 0 {
            &mut self.imem
        } else {
            &mut self.dmem
        };
        write_be(&mut bank[..], (offset & 0xFFF) as usize, size, value);
    }

    pub fn read_register(&mut self, offset: u32) -> u32 {
        match offset & 0x1C {
            SP_MEM_ADDR => self.mem_addr,
            SP_DRAM_ADDR => self.dram_addr,
            SP_RD_LEN => self.rd_len,
            SP_WR_LEN => self.wr_len,
            SP_STATUS => self.status,
            // DMAs never queue
            SP_DMA_FULL | SP_DMA_BUSY => 0,
            _ => {
                let value = u32::from(self.semaphore);
                self.semaphore = true;
                value
            }
        }
    }

    pub fn write_register(
        &mut self,
        offset: u32,
        value: u32,
        rdram: &mut Rdram,
        mi: &mut MipsInterface,
    ) {
        match offset & 0x1C {
            SP_MEM_ADDR => self.mem_addr = value & 0x1FF8,
            SP_DRAM_ADDR => self.dram_addr = value & 0x00FF_FFF8,
            SP_RD_LEN => {
                self.rd_len = value;
                self.dma(Direction::Read, value, rdram);
                self.rd_len = (value & 0xFFF0_0000) | 0xFF8;
            }
            SP_WR_LEN => {
                self.wr_len = value;
                self.dma(Direction::Write, value, rdram);
                self.wr_len = (value & 0xFFF0_0000) | 0xFF8;
            }
            SP_STATUS => self.write_status(value, mi),
            SP_DMA_FULL | SP_DMA_BUSY => {}
            _ => self.semaphore = false,
        }
    }

    fn write_status(&mut self, value: u32, mi: &mut MipsInterface) {
        let mut pair = |clear: u32, set: u32, bit: u32| {
            if value & (1 << clear) != 0 {
                self.status &= !bit;
            }
            if value & (1 << set) != 0 {
                self.status |= bit;
            }
        };
        pair(0, 1, STATUS_HALT);
        pair(5, 6, STATUS_SSTEP);
        pair(7, 8, STATUS_INTR_BREAK);
        for signal in 0..8 {
            pair(9 + 2 * signal, 10 + 2 * signal, STATUS_SIGNAL0 << signal);
        }
        if value & (1 << 2) != 0 {
            self.status &= !STATUS_BROKE;
        }
        if value & (1 << 3) != 0 {
            mi.lower(Interrupt::SP);
        }
        if value & (1 << 4) != 0 {
            mi.raise(Interrupt::SP);
        }
    }

    fn dma(&mut self, direction: Direction, len: u32, rdram: &mut Rdram) {
        let length = ((len & 0xFFF) | 7) + 1;
        let count = ((len >> 12) & 0xFF) + 1;
        let skip = len >> 20;
        let bank_bit = self.mem_addr & 0x1000;
        let mut mem = self.mem_addr & 0xFFF;
        let mut dram = self.dram_addr;

        log(LogCategory::RSP, LogLevel::Debug, || {
            format!(
                "SP DMA {:?}: {} x {} bytes, mem {:04X} dram {:08X} skip {}",
                direction,
                count,
                length,
                self.mem_addr,
                self.dram_addr,
                skip
            )
        });

        let bank = if bank_bit != 0 {
            &mut self.imem
        } else {
            &mut self.dmem
        };
        for _ in 0..count {
            for i in 0..length {
                let local = ((mem + i) & 0xFFF) as usize;
                match direction {
                    Direction::Read => bank[local] = rdram.read_u8(dram + i),
                    Direction::Write => rdram.write_u8(dram + i, bank[local]),
                }
            }
            mem = (mem + length) & 0xFFF;
            dram = (dram + length + skip) & 0x00FF_FFF8;
        }

        self.mem_addr = bank_bit | mem;
        self.dram_addr = dram;
    }

    /// SP_PC block (0x04080000): offset 0 is the PC, offset 4 (IBIST) is ignored
    pub fn read_pc_register(&self, offset: u32) -> u32 {
        if offset & 4 == 0 {
            self.pc
        } else {
            0
        }
    }

    pub fn write_pc_register(&mut self, offset: u32, value: u32) {
        if offset & 4 == 0 {
            self.pc = value & 0xFFC;
            self.next_pc = (self.pc + 4) & 0xFFC;
        }
    }

    /// Execute one instruction (or idle one cycle while halted)
    pub fn step(&mut self, rdram: &mut Rdram, mi: &mut MipsInterface) {
        if self.is_halted() {
            self.clock.step(1);
            return;
        }

        let pc = self.pc;
        let instr = read_be(&self.imem[..], pc as usize, AccessSize::Word) as u32;
        self.pc = self.next_pc;
        self.next_pc = (self.next_pc + 4) & 0xFFC;

        self.execute(instr, pc, rdram, mi);
        self.gpr[0] = 0;
        self.clock.step(1);

        if self.status & STATUS_SSTEP != 0 {
            self.status |= STATUS_HALT;
        }
    }

    fn branch(&mut self, taken: bool, pc: u32, instr: u32) {
        if taken {
            let offset = ((instr as i16 as i32) << 2) as u32;
            self.next_pc = pc.wrapping_add(4).wrapping_add(offset) & 0xFFC;
        }
    }

    fn load(&self, addr: u32, size: AccessSize) -> u32 {
        (0..size.bytes()).fold(0u32, |acc, i| {
            (acc << 8) | u32::from(self.dmem[(addr.wrapping_add(i) & 0xFFF) as usize])
        })
    }

    fn store(&mut self, addr: u32, size: AccessSize, value: u32) {
        let len = size.bytes();
        for i in 0..len {
            let byte = (value >> ((len - 1 - i) * 8)) as u8;
            self.dmem[(addr.wrapping_add(i) & 0xFFF) as usize] = byte;
        }
    }

    fn execute(&mut self, instr: u32, pc: u32, rdram: &mut Rdram, mi: &mut MipsInterface) {
        let opcode = instr >> 26;
        let rs = ((instr >> 21) & 0x1F) as usize;
        let rt = ((instr >> 16) & 0x1F) as usize;
        let rd = ((instr >> 11) & 0x1F) as usize;
        let sa = (instr >> 6) & 0x1F;
        let imm = instr & 0xFFFF;
        let simm = instr as i16 as i32 as u32;
        let addr = self.gpr[rs].wrapping_add(simm);

        match opcode {
            0x00 => self.execute_special(instr, pc, rs, rt, rd, sa, mi),
            0x01 => {
                let value = self.gpr[rs] as i32;
                let taken = match rt {
                    0x00 | 0x10 => value < 0,
                    0x01 | 0x11 => value >= 0,
                    _ => {
                        self.unknown(instr, pc);
                        return;
                    }
                };
                if rt & 0x10 != 0 {
                    self.gpr[31] = (pc + 8) & 0xFFC;
                }
                self.branch(taken, pc, instr);
            }
            0x02 | 0x03 => {
                if opcode == 0x03 {
                    self.gpr[31] = (pc + 8) & 0xFFC;
                }
                self.next_pc = (instr << 2) & 0xFFC;
            }
            0x04 => self.branch(self.gpr[rs] == self.gpr[rt], pc, instr),
            0x05 => self.branch(self.gpr[rs] != self.gpr[rt], pc, instr),
            0x06 => self.branch(self.gpr[rs] as i32 <= 0, pc, instr),
            0x07 => self.branch(self.gpr[rs] as i32 > 0, pc, instr),
            // ADDI behaves as ADDIU: the RSP has no overflow exception
            0x08 | 0x09 => self.gpr[rt] = self.gpr[rs].wrapping_add(simm),
            0x0A => self.gpr[rt] = u32::from((self.gpr[rs] as i32) < simm as i32),
            0x0B => self.gpr[rt] = u32::from(self.gpr[rs] < simm),
            0x0C => self.gpr[rt] = self.gpr[rs] & imm,
            0x0D => self.gpr[rt] = self.gpr[rs] | imm,
            0x0E => self.gpr[rt] = self.gpr[rs] ^ imm,
            0x0F => self.gpr[rt] = imm << 16,
            0x10 => match rs {
                0x00 => self.gpr[rt] = self.read_cop0(rd),
                0x04 => {
                    let value = self.gpr[rt];
                    self.write_cop0(rd, value, rdram, mi);
                }
                _ => self.unknown(instr, pc),
            },
            0x12 => self.execute_cop2(instr, rs, rt, rd),
            0x20 => self.gpr[rt] = self.load(addr, AccessSize::Byte) as i8 as i32 as u32,
            0x21 => self.gpr[rt] = self.load(addr, AccessSize::Half) as i16 as i32 as u32,
            0x23 => self.gpr[rt] = self.load(addr, AccessSize::Word),
            0x24 => self.gpr[rt] = self.load(addr, AccessSize::Byte),
            0x25 => self.gpr[rt] = self.load(addr, AccessSize::Half),
            0x28 => self.store(addr, AccessSize::Byte, self.gpr[rt]),
            0x29 => self.store(addr, AccessSize::Half, self.gpr[rt]),
            0x2B => self.store(addr, AccessSize::Word, self.gpr[rt]),
            0x32 => self.vu.load(instr, self.gpr[rs], &self.dmem),
            0x3A => self.vu.store(instr, self.gpr[rs], &mut self.dmem),
            _ => self.unknown(instr, pc),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_special(
        &mut self,
        instr: u32,
        pc: u32,
        rs: usize,
        rt: usize,
        rd: usize,
        sa: u32,
        mi: &mut MipsInterface,
    ) {
        let (s, t) = (self.gpr[rs], self.gpr[rt]);
        match instr & 0x3F {
            0x00 => self.gpr[rd] = t << sa,
            0x02 => self.gpr[rd] = t >> sa,
            0x03 => self.gpr[rd] = ((t as i32) >> sa) as u32,
            0x04 => self.gpr[rd] = t << (s & 31),
            0x06 => self.gpr[rd] = t >> (s & 31),
            0x07 => self.gpr[rd] = ((t as i32) >> (s & 31)) as u32,
            0x08 => self.next_pc = s & 0xFFC,
            0x09 => {
                self.gpr[rd] = (pc + 8) & 0xFFC;
                self.next_pc = s & 0xFFC;
            }
            0x0D => {
                self.status |= STATUS_HALT | STATUS_BROKE;
                log(LogCategory::RSP, LogLevel::Debug, || {
                    format!("RSP: BREAK at {:03X}", pc)
                });
                if self.status & STATUS_INTR_BREAK != 0 {
                    mi.raise(Interrupt::SP);
                }
            }
            0x20 | 0x21 => self.gpr[rd] = s.wrapping_add(t),
            0x22 | 0x23 => self.gpr[rd] = s.wrapping_sub(t),
            0x24 => self.gpr[rd] = s & t,
            0x25 => self.gpr[rd] = s | t,
            0x26 => self.gpr[rd] = s ^ t,
            0x27 => self.gpr[rd] = !(s | t),
            0x2A => self.gpr[rd] = u32::from((s as i32) < (t as i32)),
            0x2B => self.gpr[rd] = u32::from(s < t),
            _ => self.unknown(instr, pc),
        }
    }

    fn execute_cop2(&mut self, instr: u32, rs: usize, rt: usize, rd: usize) {
        if rs & 0x10 != 0 {
            self.vu.execute(instr);
            return;
        }
        let e = (instr >> 7) & 0xF;
        match rs {
            0x00 => self.gpr[rt] = self.vu.mfc2(rd, e),
            0x02 => self.gpr[rt] = self.vu.cfc2(rd),
            0x04 => self.vu.mtc2(rd, e, self.gpr[rt]),
            0x06 => self.vu.ctc2(rd, self.gpr[rt]),
            _ => log(LogCategory::RSP, LogLevel::Warn, || {
                format!("RSP: unknown COP2 move {:08X}", instr)
            }),
        }
    }

    /// COP0 registers 0-7 are the SP registers, 8-15 the RDP command registers
    fn read_cop0(&mut self, rd: usize) -> u32 {
        if rd < 8 {
            self.read_register((rd as u32) << 2)
        } else {
            log(LogCategory::Stubs, LogLevel::Debug, || {
                format!("RSP: read of DP register {}", rd - 8)
            });
            0
        }
    }

    fn write_cop0(&mut self, rd: usize, value: u32, rdram: &mut Rdram, mi: &mut MipsInterface) {
        if rd < 8 {
            self.write_register((rd as u32) << 2, value, rdram, mi);
        } else {
            log(LogCategory::Stubs, LogLevel::Debug, || {
                format!("RSP: write of DP register {} = {:08X}", rd - 8, value)
            });
        }
    }

    fn unknown(&self, instr: u32, pc: u32) {
        log(LogCategory::RSP, LogLevel::Warn, || {
            format!("RSP: unknown instruction {:08X} at {:03X}", instr, pc)
        });
    }

    pub fn serialize(&mut self, s: &mut Serializer<'_>) {
        s.section("rsp");
        self.clock.serialize(s);
        s.array(&mut self.dmem[..]);
        s.array(&mut self.imem[..]);
        s.array(&mut self.gpr);
        s.integer(&mut self.pc);
        s.integer(&mut self.next_pc);
        s.integer(&mut self.status);
        s.integer(&mut self.mem_addr);
        s.integer(&mut self.dram_addr);
        s.integer(&mut self.rd_len);
        s.integer(&mut self.wr_len);
        s.integer(&mut self.semaphore);
        self.vu.serialize(s);
    }
}

impl Clocked for Rsp {
    fn name(&self) -> &'static str {
        "rsp"
    }

    fn clock(&self) -> &Clock {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Rsp, Rdram, MipsInterface) {
        (Rsp::new(), Rdram::new(0x10000), MipsInterface::new())
    }

    fn load_program(rsp: &mut Rsp, program: &[u32]) {
        for (i, word) in program.iter().enumerate() {
            rsp.write_memory(0x1000 + i as u32 * 4, AccessSize::Word, u64::from(*word));
        }
    }

    fn run(rsp: &mut Rsp, rdram: &mut Rdram, mi: &mut MipsInterface) {
        rsp.write_register(SP_STATUS, 1, rdram, mi);
        for _ in 0..1000 {
            if rsp.is_halted() {
                return;
            }
            rsp.step(rdram, mi);
        }
        panic!("RSP did not halt");
    }

    #[test]
    fn test_rsp_creation() {
        let rsp = Rsp::new();
        assert!(rsp.is_halted());
        assert_eq!(rsp.pc(), 0);
        assert_eq!(rsp.clock().multiplier(), RSP_CLOCK_MULTIPLIER);
    }

    #[test]
    fn test_rsp_memory_banks() {
        let mut rsp = Rsp::new();
        rsp.write_memory(0x0100, AccessSize::Word, 0x1122_3344);
        rsp.write_memory(0x1100, AccessSize::Byte, 0x55);
        assert_eq!(rsp.read_memory(0x0100, AccessSize::Word), 0x1122_3344);
        assert_eq!(rsp.read_memory(0x0102, AccessSize::Half), 0x3344);
        assert_eq!(rsp.read_memory(0x1100, AccessSize::Byte), 0x55);
        assert_eq!(rsp.dmem()[0x100], 0x11);
    }

    #[test]
    fn test_rsp_dma_read_rows_with_skip() {
        let (mut rsp, mut rdram, mut mi) = setup();
        for i in 0..64u32 {
            rdram.write_u8(0x100 + i, i as u8);
        }
        rsp.write_register(SP_MEM_ADDR, 0x200, &mut rdram, &mut mi);
        rsp.write_register(SP_DRAM_ADDR, 0x100, &mut rdram, &mut mi);
        // 2 rows of 8 bytes, skipping 8 bytes of RDRAM between rows
        rsp.write_register(SP_RD_LEN, (8 << 20) | (1 << 12) | 7, &mut rdram, &mut mi);

        assert_eq!(rsp.dmem()[0x200..0x208], [0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(rsp.dmem()[0x208..0x210], [16, 17, 18, 19, 20, 21, 22, 23]);
        assert_eq!(rsp.read_register(SP_MEM_ADDR), 0x210);
        assert_eq!(rsp.read_register(SP_DRAM_ADDR), 0x100 + 32);
        assert_eq!(rsp.read_register(SP_RD_LEN), (8 << 20) | 0xFF8);
    }

    #[test]
    fn test_rsp_dma_length_rounds_to_eight() {
        let (mut rsp, mut rdram, mut mi) = setup();
        for i in 0..16u32 {
            rdram.write_u8(i, 0xA0 + i as u8);
        }
        rsp.write_register(SP_RD_LEN, 2, &mut rdram, &mut mi);
        assert_eq!(rsp.dmem()[7], 0xA7);
        assert_eq!(rsp.dmem()[8], 0);
    }

    #[test]
    fn test_rsp_dma_write_from_imem() {
        let (mut rsp, mut rdram, mut mi) = setup();
        rsp.write_memory(0x1000, AccessSize::Word, 0xDEAD_BEEF);
        rsp.write_register(SP_MEM_ADDR, 0x1000, &mut rdram, &mut mi);
        rsp.write_register(SP_DRAM_ADDR, 0x800, &mut rdram, &mut mi);
        rsp.write_register(SP_WR_LEN, 7, &mut rdram, &mut mi);
        assert_eq!(rdram.read_u32(0x800), 0xDEAD_BEEF);
        // bank bit is kept after the transfer
        assert_eq!(rsp.read_register(SP_MEM_ADDR), 0x1008);
    }

    #[test]
    fn test_rsp_dma_wraps_within_bank() {
        let (mut rsp, mut rdram, mut mi) = setup();
        rdram.write_u32(0, 0x0102_0304);
        rdram.write_u32(4, 0x0506_0708);
        rdram.write_u32(8, 0x090A_0B0C);
        rsp.write_register(SP_MEM_ADDR, 0xFF8, &mut rdram, &mut mi);
        rsp.write_register(SP_RD_LEN, 15, &mut rdram, &mut mi);
        assert_eq!(rsp.dmem()[0xFF8], 0x01);
        assert_eq!(rsp.dmem()[0x000], 0x09);
        assert_eq!(rsp.imem_mut()[0x000], 0);
    }

    #[test]
    fn test_semaphore() {
        let (mut rsp, mut rdram, mut mi) = setup();
        assert_eq!(rsp.read_register(SP_SEMAPHORE), 0);
        assert_eq!(rsp.read_register(SP_SEMAPHORE), 1);
        rsp.write_register(SP_SEMAPHORE, 0, &mut rdram, &mut mi);
        assert_eq!(rsp.read_register(SP_SEMAPHORE), 0);
    }

    #[test]
    fn test_status_pairs_and_interrupt() {
        let (mut rsp, mut rdram, mut mi) = setup();
        // clear halt, set intr break, set signal 2
        rsp.write_register(SP_STATUS, 1 | (1 << 8) | (1 << 14), &mut rdram, &mut mi);
        let status = rsp.read_register(SP_STATUS);
        assert_eq!(status & STATUS_HALT, 0);
        assert_ne!(status & STATUS_INTR_BREAK, 0);
        assert_eq!(status & (0xFF << 7), STATUS_SIGNAL0 << 2);

        rsp.write_register(SP_STATUS, 1 << 13, &mut rdram, &mut mi);
        assert_eq!(rsp.read_register(SP_STATUS) & (0xFF << 7), 0);

        rsp.write_register(SP_STATUS, 1 << 4, &mut rdram, &mut mi);
        assert_eq!(mi.interrupt_status(), Interrupt::SP.bit());
        rsp.write_register(SP_STATUS, 1 << 3, &mut rdram, &mut mi);
        assert_eq!(mi.interrupt_status(), 0);
    }

    #[test]
    fn test_halted_rsp_still_advances_clock() {
        let (mut rsp, mut rdram, mut mi) = setup();
        rsp.step(&mut rdram, &mut mi);
        rsp.step(&mut rdram, &mut mi);
        assert_eq!(rsp.timestamp(), 2 * RSP_CLOCK_MULTIPLIER as i64);
        assert_eq!(rsp.pc(), 0);
    }

    #[test]
    fn test_scalar_program_and_break_interrupt() {
        let (mut rsp, mut rdram, mut mi) = setup();
        load_program(
            &mut rsp,
            &[
                0x2001_0123, // ADDI  $1, $0, 0x123
                0x2002_0010, // ADDI  $2, $0, 0x10
                0x0022_1821, // ADDU  $3, $1, $2
                0xAC03_0040, // SW    $3, 0x40($0)
                0x8C04_0040, // LW    $4, 0x40($0)
                0x0000_000D, // BREAK
            ],
        );
        rsp.write_register(SP_STATUS, 1 << 8, &mut rdram, &mut mi);
        run(&mut rsp, &mut rdram, &mut mi);

        assert_eq!(rsp.gpr(3), 0x133);
        assert_eq!(rsp.gpr(4), 0x133);
        assert_eq!(rsp.dmem()[0x43], 0x33);
        assert_ne!(rsp.status() & STATUS_BROKE, 0);
        assert_eq!(mi.interrupt_status(), Interrupt::SP.bit());

        // clear broke
        rsp.write_register(SP_STATUS, 1 << 2, &mut rdram, &mut mi);
        assert_eq!(rsp.status() & STATUS_BROKE, 0);
    }

    #[test]
    fn test_break_without_intr_break() {
        let (mut rsp, mut rdram, mut mi) = setup();
        load_program(&mut rsp, &[0x0000_000D]);
        run(&mut rsp, &mut rdram, &mut mi);
        assert_ne!(rsp.status() & STATUS_BROKE, 0);
        assert_eq!(mi.interrupt_status(), 0);
    }

    #[test]
    fn test_branch_delay_slot() {
        let (mut rsp, mut rdram, mut mi) = setup();
        load_program(
            &mut rsp,
            &[
                0x1000_0002, // BEQ   $0, $0, +2
                0x2001_0001, // ADDI  $1, $0, 1 (delay slot, executes)
                0x2002_0002, // ADDI  $2, $0, 2 (skipped)
                0x2003_0003, // ADDI  $3, $0, 3 (target)
                0x0000_000D, // BREAK
            ],
        );
        run(&mut rsp, &mut rdram, &mut mi);
        assert_eq!(rsp.gpr(1), 1);
        assert_eq!(rsp.gpr(2), 0);
        assert_eq!(rsp.gpr(3), 3);
    }

    #[test]
    fn test_jal_links_within_imem() {
        let (mut rsp, mut rdram, mut mi) = setup();
        load_program(
            &mut rsp,
            &[
                0x0C00_0003, // JAL   0x00C
                0x0000_0000, // NOP
                0x0000_000D, // BREAK
                0x03E0_0008, // JR    $31
                0x2005_0005, // ADDI  $5, $0, 5
            ],
        );
        run(&mut rsp, &mut rdram, &mut mi);
        assert_eq!(rsp.gpr(31), 8);
        assert_eq!(rsp.gpr(5), 5);
        assert_eq!(rsp.pc(), 0xC);
    }

    #[test]
    fn test_single_step_halts_after_one_instruction() {
        let (mut rsp, mut rdram, mut mi) = setup();
        load_program(&mut rsp, &[0x2001_0001, 0x2002_0002]);
        rsp.write_register(SP_STATUS, 1 | (1 << 6), &mut rdram, &mut mi);
        rsp.step(&mut rdram, &mut mi);
        assert!(rsp.is_halted());
        assert_eq!(rsp.gpr(1), 1);
        assert_eq!(rsp.gpr(2), 0);
    }

    #[test]
    fn test_sp_pc_register() {
        let mut rsp = Rsp::new();
        rsp.write_pc_register(0, 0x1234);
        assert_eq!(rsp.read_pc_register(0), 0x234);
        rsp.write_pc_register(4, 0xFFFF);
        assert_eq!(rsp.read_pc_register(0), 0x234);
    }

    #[test]
    fn test_cop0_reaches_sp_registers() {
        let (mut rsp, mut rdram, mut mi) = setup();
        load_program(
            &mut rsp,
            &[
                0x2001_0200, // ADDI  $1, $0, 0x200
                0x4081_0000, // MTC0  $1, SP_MEM_ADDR
                0x4002_2000, // MFC0  $2, SP_STATUS
                0x4003_3800, // MFC0  $3, SP_SEMAPHORE
                0x0000_000D, // BREAK
            ],
        );
        run(&mut rsp, &mut rdram, &mut mi);
        assert_eq!(rsp.read_register(SP_MEM_ADDR), 0x200);
        assert_eq!(rsp.gpr(2), 0);
        assert_eq!(rsp.gpr(3), 0);
        assert_eq!(rsp.read_register(SP_SEMAPHORE), 1);
    }

    #[test]
    fn test_vector_program() {
        let (mut rsp, mut rdram, mut mi) = setup();
        for i in 0..8 {
            rsp.write_memory(i * 2, AccessSize::Half, 0x7FFF);
            rsp.write_memory(0x10 + i * 2, AccessSize::Half, u64::from(i));
        }
        load_program(
            &mut rsp,
            &[
                0xC801_2000, // LQV   $v1[0], 0x00($0)
                0xC802_2001, // LQV   $v2[0], 0x10($0)
                0x4A02_08D0, // VADD  $v3, $v1, $v2
                0xE803_2002, // SQV   $v3[0], 0x20($0)
                0x4803_1000, // MFC2  $3, $v2[0]
                0x4804_1380, // MFC2  $4, $v2[7] (bytes 7..8)
                0x0000_000D, // BREAK
            ],
        );
        run(&mut rsp, &mut rdram, &mut mi);

        assert_eq!(rsp.read_memory(0x20, AccessSize::Half), 0x7FFF);
        assert_eq!(rsp.read_memory(0x2E, AccessSize::Half), 0x7FFF);
        assert_eq!(rsp.gpr(3), 0);
        assert_eq!(rsp.gpr(4), 0x0300);
        assert_eq!(rsp.vu.register(3), vu::Vector([0x7FFF; 8]));
    }
}
