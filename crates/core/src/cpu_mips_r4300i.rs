//! MIPS R4300i CPU core implementation
//!
//! A cycle-counted interpreter for the VR4300 (MIPS III) used as the main CPU
//! of the N64-class machine.
//!
//! - 32 general-purpose 64-bit registers, HI/LO
//! - one branch delay slot; branch-likely nullifies the slot when not taken
//! - CP0: exceptions, Count/Compare timer, interrupt latch
//! - CP1: 32 × 64-bit floating point registers (FR=1 layout)
//! - runs at 93.75 MHz (two master ticks per cycle)
//!
//! Virtual addresses are mapped to physical by stripping the segment bits
//! (`& 0x1FFF_FFFF`); the TLB is not modeled and TLB instructions are
//! accepted as no-ops.

use crate::clock::{Clock, Clocked};
use crate::interrupt::{InterruptLatch, GENERAL_VECTOR, VR4300_VECTORS};
use crate::logging::{log, LogCategory, LogLevel};
use crate::state::Serializer;

/// Memory interface trait for the MIPS R4300i CPU
///
/// Addresses are physical. Reads take `&mut self` because reading a device
/// register can have side effects (semaphores, open-bus latch).
pub trait MemoryMips {
    /// Read a byte from memory at the given address
    fn read_byte(&mut self, addr: u32) -> u8;

    /// Read a halfword (16-bit) from memory at the given address
    fn read_halfword(&mut self, addr: u32) -> u16;

    /// Read a word (32-bit) from memory at the given address
    fn read_word(&mut self, addr: u32) -> u32;

    /// Read a doubleword (64-bit) from memory at the given address
    fn read_doubleword(&mut self, addr: u32) -> u64;

    /// Write a byte to memory at the given address
    fn write_byte(&mut self, addr: u32, val: u8);

    /// Write a halfword (16-bit) to memory at the given address
    fn write_halfword(&mut self, addr: u32, val: u16);

    /// Write a word (32-bit) to memory at the given address
    fn write_word(&mut self, addr: u32, val: u32);

    /// Write a doubleword (64-bit) to memory at the given address
    fn write_doubleword(&mut self, addr: u32, val: u64);
}

/// Master ticks per CPU cycle
pub const CPU_CLOCK_MULTIPLIER: u32 = 2;

/// Power-on program counter (PIF boot ROM)
pub const RESET_VECTOR: u32 = 0xBFC0_0000;

const BOOTSTRAP_VECTOR: u32 = 0xBFC0_0380;
const EXCEPTION_ENTRY_CYCLES: u32 = 2;

// CP0 register indices
const CP0_RANDOM: usize = 1;
const CP0_BADVADDR: usize = 8;
const CP0_COUNT: usize = 9;
const CP0_COMPARE: usize = 11;
const CP0_STATUS: usize = 12;
const CP0_CAUSE: usize = 13;
const CP0_EPC: usize = 14;
const CP0_PRID: usize = 15;
const CP0_CONFIG: usize = 16;
const CP0_LLADDR: usize = 17;
const CP0_ERROREPC: usize = 30;

const STATUS_IE: u64 = 1 << 0;
const STATUS_EXL: u64 = 1 << 1;
const STATUS_ERL: u64 = 1 << 2;
const STATUS_BEV: u64 = 1 << 22;
const STATUS_CU1: u64 = 1 << 29;
const STATUS_RESET: u64 = 0x3400_0000;

const CAUSE_BD: u64 = 1 << 31;
const CAUSE_CE: u64 = 3 << 28;
const CAUSE_EXCCODE: u64 = 0x1F << 2;

const FCR31_CONDITION: u32 = 1 << 23;

const TIMER_LINE: u8 = 7;

/// Exception codes (Cause.ExcCode)
pub mod exception {
    pub const INTERRUPT: u32 = 0;
    pub const ADDRESS_LOAD: u32 = 4;
    pub const ADDRESS_STORE: u32 = 5;
    pub const SYSCALL: u32 = 8;
    pub const BREAKPOINT: u32 = 9;
    pub const RESERVED_INSTRUCTION: u32 = 10;
    pub const COPROCESSOR_UNUSABLE: u32 = 11;
    pub const OVERFLOW: u32 = 12;
    pub const TRAP: u32 = 13;
}

// COP1 formats
const FMT_S: u32 = 16;
const FMT_D: u32 = 17;
const FMT_W: u32 = 20;
const FMT_L: u32 = 21;

fn sext32(value: u32) -> u64 {
    value as i32 as i64 as u64
}

fn physical(vaddr: u64) -> u32 {
    (vaddr as u32) & 0x1FFF_FFFF
}

/// Round `value` to an integer-valued float using an FCR31 rounding mode
fn round_with_mode(value: f64, mode: u32) -> f64 {
    match mode & 3 {
        0 => value.round_ties_even(),
        1 => value.trunc(),
        2 => value.ceil(),
        _ => value.floor(),
    }
}

/// MIPS R4300i CPU state and execution engine
#[derive(Debug)]
pub struct CpuMips<M: MemoryMips> {
    /// General-purpose registers (R0-R31)
    /// Note: R0 is always zero
    pub gpr: [u64; 32],

    /// Address of the next instruction to execute (sign-extended)
    pub pc: u64,

    /// HI register (for multiply/divide results)
    pub hi: u64,

    /// LO register (for multiply/divide results)
    pub lo: u64,

    /// Floating-point registers, raw bits
    pub fpr: [u64; 32],

    /// Floating-point control/status register
    pub fcr31: u32,

    /// CP0 registers (coprocessor 0 - system control)
    pub cp0: [u64; 32],

    /// Memory interface
    pub memory: M,

    next_pc: u64,
    /// The instruction at `pc` sits in a branch delay slot
    delay_slot: bool,
    current_pc: u64,
    current_delay: bool,
    ll_bit: bool,
    /// Count advances every other cycle
    count_phase: u32,
    /// Cycles charged to the instruction being executed
    cost: u32,
    clock: Clock,
    latch: InterruptLatch,
}

impl<M: MemoryMips> CpuMips<M> {
    /// Create a new MIPS R4300i CPU with the given memory interface
    pub fn new(memory: M) -> Self {
        let mut cpu = Self {
            gpr: [0; 32],
            pc: 0,
            hi: 0,
            lo: 0,
            fpr: [0; 32],
            fcr31: 0,
            cp0: [0; 32],
            memory,
            next_pc: 0,
            delay_slot: false,
            current_pc: 0,
            current_delay: false,
            ll_bit: false,
            count_phase: 0,
            cost: 0,
            clock: Clock::new(CPU_CLOCK_MULTIPLIER),
            latch: InterruptLatch::new(),
        };
        cpu.reset();
        cpu
    }

    /// Reset the CPU to its power-on state (memory is left alone)
    pub fn reset(&mut self) {
        self.gpr = [0; 32];
        self.hi = 0;
        self.lo = 0;
        self.fpr = [0; 32];
        self.fcr31 = 0;
        self.cp0 = [0; 32];
        self.cp0[CP0_RANDOM] = 31;
        self.cp0[CP0_PRID] = 0x0B22;
        self.cp0[CP0_STATUS] = STATUS_RESET;
        self.cp0[CP0_CONFIG] = 0x7006_E463;
        self.ll_bit = false;
        self.count_phase = 0;
        self.cost = 0;
        self.clock.reset();
        self.latch.reset();
        self.set_entry_point(RESET_VECTOR);
    }

    /// Start execution at `addr` (outside of any delay slot)
    pub fn set_entry_point(&mut self, addr: u32) {
        self.pc = sext32(addr);
        self.next_pc = self.pc.wrapping_add(4);
        self.delay_slot = false;
    }

    /// True if the next instruction executes in a branch delay slot
    pub fn in_delay_slot(&self) -> bool {
        self.delay_slot
    }

    pub fn interrupt_latch(&self) -> &InterruptLatch {
        &self.latch
    }

    /// Drive an external interrupt line (Cause.IP2..IP7).
    ///
    /// A rising edge latches the line as pending. Dropping the line clears
    /// both the Cause bit and any unserviced pending request.
    pub fn set_interrupt_line(&mut self, line: u8, asserted: bool) {
        let bit = 1u64 << (8 + line);
        let was_asserted = self.cp0[CP0_CAUSE] & bit != 0;
        if asserted {
            self.cp0[CP0_CAUSE] |= bit;
            if !was_asserted {
                self.latch.raise(line);
                log(LogCategory::Interrupts, LogLevel::Trace, || {
                    format!("IP{} asserted", line)
                });
            }
        } else {
            self.cp0[CP0_CAUSE] &= !bit;
            self.latch.clear(line);
        }
    }

    /// Execute a single instruction (or take an interrupt) and return cycles consumed
    pub fn step(&mut self) -> u32 {
        self.cost = 1;

        if !self.service_interrupt() {
            self.current_pc = self.pc;
            self.current_delay = self.delay_slot;
            self.delay_slot = false;

            if self.pc & 3 != 0 {
                self.cp0[CP0_BADVADDR] = self.pc;
                self.exception(exception::ADDRESS_LOAD, 0);
            } else {
                let instr = self.memory.read_word(physical(self.pc));
                self.pc = self.next_pc;
                self.next_pc = self.pc.wrapping_add(4);
                self.execute(instr);
            }
        }

        // R0 is always zero
        self.gpr[0] = 0;

        let cost = self.cost;
        self.clock.step(cost);
        self.advance_count(cost);
        cost
    }

    fn execute(&mut self, instr: u32) {
        // Decode opcode (bits 26-31)
        let opcode = instr >> 26;

        match opcode {
            0x00 => self.execute_special(instr),
            0x01 => self.execute_regimm(instr),
            0x02 | 0x03 => self.execute_jump(instr),
            0x04..=0x07 | 0x14..=0x17 => self.execute_branch(opcode, instr),
            0x08..=0x0F | 0x18 | 0x19 => self.execute_immediate(opcode, instr),
            0x10 => self.execute_cop0(instr),
            0x11 => self.execute_cop1(instr),
            // COP2/COP3 and their loads/stores are not wired to the main CPU
            0x12 | 0x32 | 0x36 | 0x3A | 0x3E => {
                self.exception(exception::COPROCESSOR_UNUSABLE, 2)
            }
            0x13 => self.exception(exception::COPROCESSOR_UNUSABLE, 3),
            0x1A | 0x1B | 0x20..=0x27 | 0x30 | 0x34 | 0x37 => self.execute_load(opcode, instr),
            0x28..=0x2E | 0x38 | 0x3C | 0x3F => self.execute_store(opcode, instr),
            0x31 | 0x35 | 0x39 | 0x3D => self.execute_cop1_memory(opcode, instr),
            0x2F => {
                // CACHE - no caches are modeled
            }
            _ => self.reserved_instruction(instr),
        }
    }

    /// Execute SPECIAL opcode instructions (opcode = 0x00)
    fn execute_special(&mut self, instr: u32) {
        let funct = instr & 0x3F;
        let rs = ((instr >> 21) & 0x1F) as usize;
        let rt = ((instr >> 16) & 0x1F) as usize;
        let rd = ((instr >> 11) & 0x1F) as usize;
        let sa = (instr >> 6) & 0x1F;
        let a = self.gpr[rs];
        let b = self.gpr[rt];

        match funct {
            // SLL / SRL / SRA
            0x00 => self.gpr[rd] = sext32((b as u32) << sa),
            0x02 => self.gpr[rd] = sext32((b as u32) >> sa),
            0x03 => self.gpr[rd] = ((b as i64) >> sa) as i32 as i64 as u64,
            // SLLV / SRLV / SRAV
            0x04 => self.gpr[rd] = sext32((b as u32) << (a & 31)),
            0x06 => self.gpr[rd] = sext32((b as u32) >> (a & 31)),
            0x07 => self.gpr[rd] = ((b as i64) >> (a & 31)) as i32 as i64 as u64,
            // JR
            0x08 => self.branch(true, a),
            // JALR
            0x09 => {
                self.gpr[rd] = self.pc.wrapping_add(4);
                self.branch(true, a);
            }
            0x0C => self.exception(exception::SYSCALL, 0),
            0x0D => self.exception(exception::BREAKPOINT, 0),
            0x0F => {
                // SYNC
            }
            0x10 => self.gpr[rd] = self.hi,
            0x11 => self.hi = a,
            0x12 => self.gpr[rd] = self.lo,
            0x13 => self.lo = a,
            // DSLLV / DSRLV / DSRAV
            0x14 => self.gpr[rd] = b << (a & 63),
            0x16 => self.gpr[rd] = b >> (a & 63),
            0x17 => self.gpr[rd] = ((b as i64) >> (a & 63)) as u64,
            0x18..=0x1F => self.execute_multiply_divide(funct, a, b),
            // ADD
            0x20 => match (a as i32).checked_add(b as i32) {
                Some(sum) => self.gpr[rd] = sum as i64 as u64,
                None => self.exception(exception::OVERFLOW, 0),
            },
            // ADDU
            0x21 => self.gpr[rd] = sext32((a as u32).wrapping_add(b as u32)),
            // SUB
            0x22 => match (a as i32).checked_sub(b as i32) {
                Some(diff) => self.gpr[rd] = diff as i64 as u64,
                None => self.exception(exception::OVERFLOW, 0),
            },
            // SUBU
            0x23 => self.gpr[rd] = sext32((a as u32).wrapping_sub(b as u32)),
            0x24 => self.gpr[rd] = a & b,
            0x25 => self.gpr[rd] = a | b,
            0x26 => self.gpr[rd] = a ^ b,
            0x27 => self.gpr[rd] = !(a | b),
            // SLT / SLTU
            0x2A => self.gpr[rd] = ((a as i64) < (b as i64)) as u64,
            0x2B => self.gpr[rd] = (a < b) as u64,
            // DADD
            0x2C => match (a as i64).checked_add(b as i64) {
                Some(sum) => self.gpr[rd] = sum as u64,
                None => self.exception(exception::OVERFLOW, 0),
            },
            0x2D => self.gpr[rd] = a.wrapping_add(b),
            // DSUB
            0x2E => match (a as i64).checked_sub(b as i64) {
                Some(diff) => self.gpr[rd] = diff as u64,
                None => self.exception(exception::OVERFLOW, 0),
            },
            0x2F => self.gpr[rd] = a.wrapping_sub(b),
            // TGE TGEU TLT TLTU TEQ TNE
            0x30 => self.trap_if((a as i64) >= (b as i64)),
            0x31 => self.trap_if(a >= b),
            0x32 => self.trap_if((a as i64) < (b as i64)),
            0x33 => self.trap_if(a < b),
            0x34 => self.trap_if(a == b),
            0x36 => self.trap_if(a != b),
            // DSLL / DSRL / DSRA (+32 variants)
            0x38 => self.gpr[rd] = b << sa,
            0x3A => self.gpr[rd] = b >> sa,
            0x3B => self.gpr[rd] = ((b as i64) >> sa) as u64,
            0x3C => self.gpr[rd] = b << (sa + 32),
            0x3E => self.gpr[rd] = b >> (sa + 32),
            0x3F => self.gpr[rd] = ((b as i64) >> (sa + 32)) as u64,
            _ => self.reserved_instruction(instr),
        }
    }

    /// MULT/DIV family; these set HI/LO and carry their own latency
    fn execute_multiply_divide(&mut self, funct: u32, a: u64, b: u64) {
        match funct {
            // MULT
            0x18 => {
                let product = (a as i32 as i64).wrapping_mul(b as i32 as i64);
                self.lo = sext32(product as u32);
                self.hi = sext32((product >> 32) as u32);
                self.cost = 5;
            }
            // MULTU
            0x19 => {
                let product = (a as u32 as u64) * (b as u32 as u64);
                self.lo = sext32(product as u32);
                self.hi = sext32((product >> 32) as u32);
                self.cost = 5;
            }
            // DIV
            0x1A => {
                let (n, d) = (a as i32, b as i32);
                if d == 0 {
                    self.lo = if n >= 0 { u64::MAX } else { 1 };
                    self.hi = n as i64 as u64;
                } else {
                    self.lo = n.wrapping_div(d) as i64 as u64;
                    self.hi = n.wrapping_rem(d) as i64 as u64;
                }
                self.cost = 37;
            }
            // DIVU
            0x1B => {
                let (n, d) = (a as u32, b as u32);
                if d == 0 {
                    self.lo = u64::MAX;
                    self.hi = sext32(n);
                } else {
                    self.lo = sext32(n / d);
                    self.hi = sext32(n % d);
                }
                self.cost = 37;
            }
            // DMULT
            0x1C => {
                let product = (a as i64 as i128) * (b as i64 as i128);
                self.lo = product as u64;
                self.hi = (product >> 64) as u64;
                self.cost = 8;
            }
            // DMULTU
            0x1D => {
                let product = (a as u128) * (b as u128);
                self.lo = product as u64;
                self.hi = (product >> 64) as u64;
                self.cost = 8;
            }
            // DDIV
            0x1E => {
                let (n, d) = (a as i64, b as i64);
                if d == 0 {
                    self.lo = if n >= 0 { u64::MAX } else { 1 };
                    self.hi = a;
                } else {
                    self.lo = n.wrapping_div(d) as u64;
                    self.hi = n.wrapping_rem(d) as u64;
                }
                self.cost = 69;
            }
            // DDIVU
            _ => {
                if b == 0 {
                    self.lo = u64::MAX;
                    self.hi = a;
                } else {
                    self.lo = a / b;
                    self.hi = a % b;
                }
                self.cost = 69;
            }
        }
    }

    /// Execute REGIMM instructions (opcode = 0x01)
    fn execute_regimm(&mut self, instr: u32) {
        let rs = ((instr >> 21) & 0x1F) as usize;
        let rt = (instr >> 16) & 0x1F;
        let value = self.gpr[rs] as i64;
        let imm = (instr & 0xFFFF) as i16 as i64;
        let target = self.branch_target(instr);

        match rt {
            // BLTZ / BGEZ / BLTZL / BGEZL
            0x00 => self.branch(value < 0, target),
            0x01 => self.branch(value >= 0, target),
            0x02 => self.branch_likely(value < 0, target),
            0x03 => self.branch_likely(value >= 0, target),
            // TGEI TGEIU TLTI TLTIU TEQI TNEI
            0x08 => self.trap_if(value >= imm),
            0x09 => self.trap_if(value as u64 >= imm as u64),
            0x0A => self.trap_if(value < imm),
            0x0B => self.trap_if((value as u64) < imm as u64),
            0x0C => self.trap_if(value == imm),
            0x0E => self.trap_if(value != imm),
            // BLTZAL / BGEZAL / BLTZALL / BGEZALL
            0x10..=0x13 => {
                self.gpr[31] = self.pc.wrapping_add(4);
                let taken = if rt & 1 == 0 { value < 0 } else { value >= 0 };
                if rt & 2 == 0 {
                    self.branch(taken, target);
                } else {
                    self.branch_likely(taken, target);
                }
            }
            _ => self.reserved_instruction(instr),
        }
    }

    /// J / JAL
    fn execute_jump(&mut self, instr: u32) {
        // self.pc is the delay slot; its segment supplies the top bits
        let target = (self.pc & 0xFFFF_FFFF_F000_0000) | (u64::from(instr & 0x03FF_FFFF) << 2);
        if instr >> 26 == 0x03 {
            self.gpr[31] = self.pc.wrapping_add(4);
        }
        self.branch(true, target);
    }

    /// BEQ BNE BLEZ BGTZ and their likely forms
    fn execute_branch(&mut self, opcode: u32, instr: u32) {
        let rs = ((instr >> 21) & 0x1F) as usize;
        let rt = ((instr >> 16) & 0x1F) as usize;
        let a = self.gpr[rs];
        let b = self.gpr[rt];
        let target = self.branch_target(instr);

        let taken = match opcode & 0x03 {
            0 => a == b,
            1 => a != b,
            2 => (a as i64) <= 0,
            _ => (a as i64) > 0,
        };
        if opcode & 0x10 == 0 {
            self.branch(taken, target);
        } else {
            self.branch_likely(taken, target);
        }
    }

    fn branch_target(&self, instr: u32) -> u64 {
        let offset = ((instr & 0xFFFF) as i16 as i64) << 2;
        self.pc.wrapping_add(offset as u64)
    }

    /// The following instruction runs in the delay slot either way
    fn branch(&mut self, taken: bool, target: u64) {
        if taken {
            self.next_pc = target;
        }
        self.delay_slot = true;
    }

    /// Like `branch`, but the delay slot is skipped when not taken
    fn branch_likely(&mut self, taken: bool, target: u64) {
        if taken {
            self.branch(true, target);
        } else {
            self.pc = self.next_pc;
            self.next_pc = self.pc.wrapping_add(4);
        }
    }

    /// ADDI ADDIU SLTI SLTIU ANDI ORI XORI LUI DADDI DADDIU
    fn execute_immediate(&mut self, opcode: u32, instr: u32) {
        let rs = ((instr >> 21) & 0x1F) as usize;
        let rt = ((instr >> 16) & 0x1F) as usize;
        let a = self.gpr[rs];
        let simm = (instr & 0xFFFF) as i16 as i64;
        let uimm = u64::from(instr & 0xFFFF);

        match opcode {
            // ADDI
            0x08 => match (a as i32).checked_add(simm as i32) {
                Some(sum) => self.gpr[rt] = sum as i64 as u64,
                None => self.exception(exception::OVERFLOW, 0),
            },
            // ADDIU
            0x09 => self.gpr[rt] = sext32((a as u32).wrapping_add(simm as u32)),
            0x0A => self.gpr[rt] = ((a as i64) < simm) as u64,
            0x0B => self.gpr[rt] = (a < simm as u64) as u64,
            0x0C => self.gpr[rt] = a & uimm,
            0x0D => self.gpr[rt] = a | uimm,
            0x0E => self.gpr[rt] = a ^ uimm,
            // LUI
            0x0F => self.gpr[rt] = sext32((instr & 0xFFFF) << 16),
            // DADDI
            0x18 => match (a as i64).checked_add(simm) {
                Some(sum) => self.gpr[rt] = sum as u64,
                None => self.exception(exception::OVERFLOW, 0),
            },
            // DADDIU
            _ => self.gpr[rt] = a.wrapping_add(simm as u64),
        }
    }

    fn effective_address(&self, instr: u32) -> u64 {
        let rs = ((instr >> 21) & 0x1F) as usize;
        let offset = (instr & 0xFFFF) as i16 as i64;
        self.gpr[rs].wrapping_add(offset as u64)
    }

    /// Raise an address error unless `vaddr` is aligned to `align` bytes
    fn check_alignment(&mut self, vaddr: u64, align: u64, store: bool) -> bool {
        if vaddr & (align - 1) == 0 {
            return true;
        }
        self.cp0[CP0_BADVADDR] = vaddr;
        let code = if store {
            exception::ADDRESS_STORE
        } else {
            exception::ADDRESS_LOAD
        };
        self.exception(code, 0);
        false
    }

    fn execute_load(&mut self, opcode: u32, instr: u32) {
        let rt = ((instr >> 16) & 0x1F) as usize;
        let vaddr = self.effective_address(instr);
        let addr = physical(vaddr);

        let align = match opcode {
            0x21 | 0x25 => 2,
            0x23 | 0x27 | 0x30 => 4,
            0x34 | 0x37 => 8,
            _ => 1,
        };
        if !self.check_alignment(vaddr, align, false) {
            return;
        }

        match opcode {
            // LDL
            0x1A => {
                let shift = (addr & 7) * 8;
                let data = self.memory.read_doubleword(addr & !7);
                let mask = u64::MAX << shift;
                self.gpr[rt] = (self.gpr[rt] & !mask) | (data << shift);
            }
            // LDR
            0x1B => {
                let shift = (7 - (addr & 7)) * 8;
                let data = self.memory.read_doubleword(addr & !7);
                let mask = u64::MAX >> shift;
                self.gpr[rt] = (self.gpr[rt] & !mask) | (data >> shift);
            }
            0x20 => self.gpr[rt] = self.memory.read_byte(addr) as i8 as i64 as u64,
            0x21 => self.gpr[rt] = self.memory.read_halfword(addr) as i16 as i64 as u64,
            // LWL
            0x22 => {
                let shift = (addr & 3) * 8;
                let data = self.memory.read_word(addr & !3);
                let mask = u32::MAX << shift;
                self.gpr[rt] = sext32((self.gpr[rt] as u32 & !mask) | (data << shift));
            }
            0x23 => self.gpr[rt] = sext32(self.memory.read_word(addr)),
            0x24 => self.gpr[rt] = u64::from(self.memory.read_byte(addr)),
            0x25 => self.gpr[rt] = u64::from(self.memory.read_halfword(addr)),
            // LWR
            0x26 => {
                let shift = (3 - (addr & 3)) * 8;
                let data = self.memory.read_word(addr & !3);
                let mask = u32::MAX >> shift;
                self.gpr[rt] = sext32((self.gpr[rt] as u32 & !mask) | (data >> shift));
            }
            0x27 => self.gpr[rt] = u64::from(self.memory.read_word(addr)),
            // LL
            0x30 => {
                self.gpr[rt] = sext32(self.memory.read_word(addr));
                self.link(addr);
            }
            // LLD
            0x34 => {
                self.gpr[rt] = self.memory.read_doubleword(addr);
                self.link(addr);
            }
            // LD
            _ => self.gpr[rt] = self.memory.read_doubleword(addr),
        }
    }

    fn link(&mut self, addr: u32) {
        self.ll_bit = true;
        self.cp0[CP0_LLADDR] = u64::from(addr >> 4);
    }

    fn execute_store(&mut self, opcode: u32, instr: u32) {
        let rt = ((instr >> 16) & 0x1F) as usize;
        let vaddr = self.effective_address(instr);
        let addr = physical(vaddr);
        let value = self.gpr[rt];

        let align = match opcode {
            0x29 => 2,
            0x2B | 0x38 => 4,
            0x3C | 0x3F => 8,
            _ => 1,
        };
        if !self.check_alignment(vaddr, align, true) {
            return;
        }

        match opcode {
            0x28 => self.memory.write_byte(addr, value as u8),
            0x29 => self.memory.write_halfword(addr, value as u16),
            // SWL
            0x2A => {
                let shift = (addr & 3) * 8;
                let data = self.memory.read_word(addr & !3);
                let mask = u32::MAX >> shift;
                let merged = (data & !mask) | ((value as u32) >> shift);
                self.memory.write_word(addr & !3, merged);
            }
            0x2B => self.memory.write_word(addr, value as u32),
            // SDL
            0x2C => {
                let shift = (addr & 7) * 8;
                let data = self.memory.read_doubleword(addr & !7);
                let mask = u64::MAX >> shift;
                self.memory
                    .write_doubleword(addr & !7, (data & !mask) | (value >> shift));
            }
            // SDR
            0x2D => {
                let shift = (7 - (addr & 7)) * 8;
                let data = self.memory.read_doubleword(addr & !7);
                let mask = u64::MAX << shift;
                self.memory
                    .write_doubleword(addr & !7, (data & !mask) | (value << shift));
            }
            // SWR
            0x2E => {
                let shift = (3 - (addr & 3)) * 8;
                let data = self.memory.read_word(addr & !3);
                let mask = u32::MAX << shift;
                let merged = (data & !mask) | ((value as u32) << shift);
                self.memory.write_word(addr & !3, merged);
            }
            // SC
            0x38 => {
                if self.ll_bit {
                    self.memory.write_word(addr, value as u32);
                }
                self.gpr[rt] = self.ll_bit as u64;
            }
            // SCD
            0x3C => {
                if self.ll_bit {
                    self.memory.write_doubleword(addr, value);
                }
                self.gpr[rt] = self.ll_bit as u64;
            }
            // SD
            _ => self.memory.write_doubleword(addr, value),
        }
    }

    fn trap_if(&mut self, condition: bool) {
        if condition {
            self.exception(exception::TRAP, 0);
        }
    }

    /// Execute COP0 instructions (opcode = 0x10)
    fn execute_cop0(&mut self, instr: u32) {
        let rs = (instr >> 21) & 0x1F;
        let rt = ((instr >> 16) & 0x1F) as usize;
        let rd = ((instr >> 11) & 0x1F) as usize;

        match rs {
            // MFC0 / DMFC0
            0x00 => self.gpr[rt] = sext32(self.cp0[rd] as u32),
            0x01 => self.gpr[rt] = self.cp0[rd],
            // MTC0 / DMTC0
            0x04 => self.write_cp0(rd, sext32(self.gpr[rt] as u32)),
            0x05 => self.write_cp0(rd, self.gpr[rt]),
            0x10..=0x1F => match instr & 0x3F {
                0x01 | 0x02 | 0x06 | 0x08 => {
                    log(LogCategory::Stubs, LogLevel::Debug, || {
                        format!("TLB op {:02X} at {:08X} ignored", instr & 0x3F, self.current_pc)
                    });
                }
                0x18 => self.eret(),
                _ => self.reserved_instruction(instr),
            },
            _ => self.reserved_instruction(instr),
        }
    }

    fn write_cp0(&mut self, reg: usize, value: u64) {
        match reg {
            CP0_COUNT => self.cp0[CP0_COUNT] = value & 0xFFFF_FFFF,
            CP0_COMPARE => {
                self.cp0[CP0_COMPARE] = value & 0xFFFF_FFFF;
                self.set_interrupt_line(TIMER_LINE, false);
            }
            CP0_CAUSE => {
                // Only the two software interrupt lines are writable
                for line in 0..2u8 {
                    let asserted = value & (1 << (8 + line)) != 0;
                    self.set_interrupt_line(line, asserted);
                }
            }
            CP0_STATUS => self.cp0[CP0_STATUS] = value & 0xFFFF_FFFF,
            CP0_RANDOM | CP0_PRID => {}
            _ => self.cp0[reg] = value,
        }
    }

    /// ERET: return from exception and re-arm still-asserted lines
    fn eret(&mut self) {
        let status = self.cp0[CP0_STATUS];
        let target = if status & STATUS_ERL != 0 {
            self.cp0[CP0_STATUS] = status & !STATUS_ERL;
            self.cp0[CP0_ERROREPC]
        } else {
            self.cp0[CP0_STATUS] = status & !STATUS_EXL;
            self.cp0[CP0_EPC]
        };
        self.pc = target;
        self.next_pc = target.wrapping_add(4);
        self.delay_slot = false;
        self.ll_bit = false;

        let asserted = (self.cp0[CP0_CAUSE] >> 8) & 0xFF;
        for line in 0..8u8 {
            if asserted & (1 << line) != 0 {
                self.latch.raise(line);
            }
        }
        log(LogCategory::CPU, LogLevel::Trace, || {
            format!("ERET to {:08X}", target as u32)
        });
    }

    fn cop1_usable(&mut self) -> bool {
        if self.cp0[CP0_STATUS] & STATUS_CU1 == 0 {
            self.exception(exception::COPROCESSOR_UNUSABLE, 1);
            return false;
        }
        true
    }

    /// Execute COP1 instructions (opcode = 0x11)
    fn execute_cop1(&mut self, instr: u32) {
        if !self.cop1_usable() {
            return;
        }
        let fmt = (instr >> 21) & 0x1F;
        let rt = ((instr >> 16) & 0x1F) as usize;
        let fs = ((instr >> 11) & 0x1F) as usize;

        match fmt {
            // MFC1 / DMFC1
            0x00 => self.gpr[rt] = sext32(self.fpr[fs] as u32),
            0x01 => self.gpr[rt] = self.fpr[fs],
            // CFC1
            0x02 => {
                self.gpr[rt] = match fs {
                    0 => 0x0B00,
                    31 => sext32(self.fcr31),
                    _ => 0,
                }
            }
            // MTC1 / DMTC1
            0x04 => self.fpr[fs] = (self.fpr[fs] & !0xFFFF_FFFF) | (self.gpr[rt] & 0xFFFF_FFFF),
            0x05 => self.fpr[fs] = self.gpr[rt],
            // CTC1
            0x06 => {
                if fs == 31 {
                    self.fcr31 = self.gpr[rt] as u32;
                }
            }
            // BC1F / BC1T / BC1FL / BC1TL
            0x08 => {
                let condition = self.fcr31 & FCR31_CONDITION != 0;
                let taken = if rt & 1 != 0 { condition } else { !condition };
                let target = self.branch_target(instr);
                if rt & 2 == 0 {
                    self.branch(taken, target);
                } else {
                    self.branch_likely(taken, target);
                }
            }
            FMT_S | FMT_D => self.execute_fpu(fmt, instr),
            FMT_W | FMT_L => self.execute_fpu_convert_integer(fmt, instr),
            _ => self.reserved_instruction(instr),
        }
    }

    fn fpr_value(&self, reg: usize, single: bool) -> f64 {
        if single {
            f64::from(f32::from_bits(self.fpr[reg] as u32))
        } else {
            f64::from_bits(self.fpr[reg])
        }
    }

    fn set_fpr_value(&mut self, reg: usize, single: bool, value: f64) {
        self.fpr[reg] = if single {
            u64::from((value as f32).to_bits())
        } else {
            value.to_bits()
        };
    }

    /// `.S` / `.D` arithmetic, conversions and compares.
    ///
    /// Single-precision operands are widened to f64 and the result narrowed
    /// once; for add/sub/mul/div/sqrt that gives the correctly rounded
    /// single-precision result.
    fn execute_fpu(&mut self, fmt: u32, instr: u32) {
        let funct = instr & 0x3F;
        let ft = ((instr >> 16) & 0x1F) as usize;
        let fs = ((instr >> 11) & 0x1F) as usize;
        let fd = ((instr >> 6) & 0x1F) as usize;
        let single = fmt == FMT_S;
        let a = self.fpr_value(fs, single);
        let b = self.fpr_value(ft, single);

        match funct {
            // ADD / SUB
            0x00 => {
                self.set_fpr_value(fd, single, a + b);
                self.cost = 3;
            }
            0x01 => {
                self.set_fpr_value(fd, single, a - b);
                self.cost = 3;
            }
            // MUL
            0x02 => {
                self.set_fpr_value(fd, single, a * b);
                self.cost = if single { 5 } else { 8 };
            }
            // DIV / SQRT
            0x03 => {
                self.set_fpr_value(fd, single, a / b);
                self.cost = if single { 29 } else { 58 };
            }
            0x04 => {
                self.set_fpr_value(fd, single, a.sqrt());
                self.cost = if single { 29 } else { 58 };
            }
            0x05 => self.set_fpr_value(fd, single, a.abs()),
            0x06 => self.fpr[fd] = self.fpr[fs],
            0x07 => self.set_fpr_value(fd, single, -a),
            // ROUND/TRUNC/CEIL/FLOOR .L
            0x08..=0x0B => self.fpr[fd] = round_with_mode(a, funct) as i64 as u64,
            // ROUND/TRUNC/CEIL/FLOOR .W
            0x0C..=0x0F => self.fpr[fd] = u64::from(round_with_mode(a, funct) as i32 as u32),
            // CVT.S / CVT.D
            0x20 if !single => self.set_fpr_value(fd, true, a),
            0x21 if single => self.set_fpr_value(fd, false, a),
            // CVT.W / CVT.L
            0x24 => self.fpr[fd] = u64::from(round_with_mode(a, self.fcr31) as i32 as u32),
            0x25 => self.fpr[fd] = round_with_mode(a, self.fcr31) as i64 as u64,
            // C.cond
            0x30..=0x3F => {
                let unordered = a.is_nan() || b.is_nan();
                let less = !unordered && a < b;
                let equal = !unordered && a == b;
                let condition = (funct & 4 != 0 && less)
                    || (funct & 2 != 0 && equal)
                    || (funct & 1 != 0 && unordered);
                if condition {
                    self.fcr31 |= FCR31_CONDITION;
                } else {
                    self.fcr31 &= !FCR31_CONDITION;
                }
            }
            _ => self.reserved_instruction(instr),
        }
    }

    /// CVT.S / CVT.D from `.W` / `.L`
    fn execute_fpu_convert_integer(&mut self, fmt: u32, instr: u32) {
        let funct = instr & 0x3F;
        let fs = ((instr >> 11) & 0x1F) as usize;
        let fd = ((instr >> 6) & 0x1F) as usize;
        let raw = self.fpr[fs];

        match funct {
            0x20 => {
                let value = if fmt == FMT_W {
                    raw as u32 as i32 as f32
                } else {
                    raw as i64 as f32
                };
                self.fpr[fd] = u64::from(value.to_bits());
            }
            0x21 => {
                let value = if fmt == FMT_W {
                    f64::from(raw as u32 as i32)
                } else {
                    raw as i64 as f64
                };
                self.fpr[fd] = value.to_bits();
            }
            _ => self.reserved_instruction(instr),
        }
    }

    /// LWC1 LDC1 SWC1 SDC1
    fn execute_cop1_memory(&mut self, opcode: u32, instr: u32) {
        if !self.cop1_usable() {
            return;
        }
        let ft = ((instr >> 16) & 0x1F) as usize;
        let vaddr = self.effective_address(instr);
        let addr = physical(vaddr);
        let doubleword = opcode & 0x04 != 0;
        let store = opcode & 0x08 != 0;

        if !self.check_alignment(vaddr, if doubleword { 8 } else { 4 }, store) {
            return;
        }
        match (store, doubleword) {
            (false, false) => {
                let word = u64::from(self.memory.read_word(addr));
                self.fpr[ft] = (self.fpr[ft] & !0xFFFF_FFFF) | word;
            }
            (false, true) => self.fpr[ft] = self.memory.read_doubleword(addr),
            (true, false) => self.memory.write_word(addr, self.fpr[ft] as u32),
            (true, true) => self.memory.write_doubleword(addr, self.fpr[ft]),
        }
    }

    fn reserved_instruction(&mut self, instr: u32) {
        log(LogCategory::CPU, LogLevel::Warn, || {
            format!(
                "reserved instruction {:08X} at {:08X}",
                instr, self.current_pc as u32
            )
        });
        self.exception(exception::RESERVED_INSTRUCTION, 0);
    }

    /// Synchronous exception raised by the instruction being executed
    fn exception(&mut self, code: u32, coprocessor: u32) {
        self.enter_exception(code, coprocessor, GENERAL_VECTOR);
    }

    fn enter_exception(&mut self, code: u32, coprocessor: u32, vector: u32) {
        let status = self.cp0[CP0_STATUS];
        let mut cause = self.cp0[CP0_CAUSE] & !(CAUSE_BD | CAUSE_CE | CAUSE_EXCCODE);

        // A nested exception keeps the original EPC
        if status & STATUS_EXL == 0 {
            if self.current_delay {
                self.cp0[CP0_EPC] = self.current_pc.wrapping_sub(4);
                cause |= CAUSE_BD;
            } else {
                self.cp0[CP0_EPC] = self.current_pc;
            }
        }
        cause |= u64::from(code) << 2;
        cause |= u64::from(coprocessor) << 28;
        self.cp0[CP0_CAUSE] = cause;
        self.cp0[CP0_STATUS] = status | STATUS_EXL;

        let target = if status & STATUS_BEV != 0 {
            BOOTSTRAP_VECTOR
        } else {
            vector
        };
        log(LogCategory::CPU, LogLevel::Debug, || {
            format!(
                "exception {} at {:08X} -> {:08X}",
                code, self.current_pc as u32, target
            )
        });
        self.set_entry_point(target);
        self.cost += EXCEPTION_ENTRY_CYCLES;
    }

    /// Take the highest-priority pending interrupt, if interrupts are enabled
    fn service_interrupt(&mut self) -> bool {
        let status = self.cp0[CP0_STATUS];
        if status & STATUS_IE == 0 || status & (STATUS_EXL | STATUS_ERL) != 0 {
            return false;
        }
        let enabled = ((status >> 8) & 0xFF) as u32;
        let Some(vector) = self.latch.take_highest(&VR4300_VECTORS, enabled) else {
            return false;
        };

        // The interrupted instruction has not executed; EPC points at it
        self.current_pc = self.pc;
        self.current_delay = self.delay_slot;
        self.delay_slot = false;
        log(LogCategory::Interrupts, LogLevel::Debug, || {
            format!("taking {} interrupt at {:08X}", vector.name, self.pc as u32)
        });
        self.enter_exception(exception::INTERRUPT, 0, vector.address);
        true
    }

    /// Count runs at half the pipeline clock; reaching Compare raises IP7
    fn advance_count(&mut self, cycles: u32) {
        let total = self.count_phase + cycles;
        let ticks = total / 2;
        self.count_phase = total % 2;
        if ticks == 0 {
            return;
        }
        let old = self.cp0[CP0_COUNT] as u32;
        let compare = self.cp0[CP0_COMPARE] as u32;
        self.cp0[CP0_COUNT] = u64::from(old.wrapping_add(ticks));
        if compare.wrapping_sub(old).wrapping_sub(1) < ticks {
            self.set_interrupt_line(TIMER_LINE, true);
        }
    }

    pub fn serialize(&mut self, s: &mut Serializer<'_>) {
        s.section("cpu");
        self.clock.serialize(s);
        s.array(&mut self.gpr);
        s.integer(&mut self.pc);
        s.integer(&mut self.next_pc);
        s.integer(&mut self.delay_slot);
        s.integer(&mut self.hi);
        s.integer(&mut self.lo);
        s.array(&mut self.fpr);
        s.integer(&mut self.fcr31);
        s.array(&mut self.cp0);
        s.integer(&mut self.ll_bit);
        s.integer(&mut self.count_phase);
        self.latch.serialize(s);
    }
}

impl<M: MemoryMips> Clocked for CpuMips<M> {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn clock(&self) -> &Clock {
        &self.clock
    }
}

impl<M: MemoryMips> crate::Cpu for CpuMips<M> {
    fn reset(&mut self) {
        CpuMips::reset(self);
    }

    fn step(&mut self) -> u32 {
        CpuMips::step(self)
    }
}

/// Flat 8 MiB memory for tests and benchmarks. Addresses wrap, so an access
/// straddling the end continues at offset 0.
pub struct ArrayMemory {
    data: Vec<u8>,
}

impl ArrayMemory {
    const SIZE: usize = 8 * 1024 * 1024;

    pub fn new() -> Self {
        Self {
            data: vec![0; Self::SIZE],
        }
    }

    fn index(addr: u32) -> usize {
        addr as usize & (Self::SIZE - 1)
    }

    fn load<const N: usize>(&self, addr: u32) -> [u8; N] {
        std::array::from_fn(|i| self.data[Self::index(addr.wrapping_add(i as u32))])
    }

    fn store(&mut self, addr: u32, bytes: &[u8]) {
        for (i, &byte) in bytes.iter().enumerate() {
            self.data[Self::index(addr.wrapping_add(i as u32))] = byte;
        }
    }
}

impl Default for ArrayMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMips for ArrayMemory {
    fn read_byte(&mut self, addr: u32) -> u8 {
        self.data[Self::index(addr)]
    }

    fn read_halfword(&mut self, addr: u32) -> u16 {
        u16::from_be_bytes(self.load(addr))
    }

    fn read_word(&mut self, addr: u32) -> u32 {
        u32::from_be_bytes(self.load(addr))
    }

    fn read_doubleword(&mut self, addr: u32) -> u64 {
        u64::from_be_bytes(self.load(addr))
    }

    fn write_byte(&mut self, addr: u32, val: u8) {
        self.data[Self::index(addr)] = val;
    }

    fn write_halfword(&mut self, addr: u32, val: u16) {
        self.store(addr, &val.to_be_bytes());
    }

    fn write_word(&mut self, addr: u32, val: u32) {
        self.store(addr, &val.to_be_bytes());
    }

    fn write_doubleword(&mut self, addr: u32, val: u64) {
        self.store(addr, &val.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn itype(op: u32, rs: u32, rt: u32, imm: u16) -> u32 {
        (op << 26) | (rs << 21) | (rt << 16) | u32::from(imm)
    }

    fn rtype(rs: u32, rt: u32, rd: u32, sa: u32, funct: u32) -> u32 {
        (rs << 21) | (rt << 16) | (rd << 11) | (sa << 6) | funct
    }

    const NOP: u32 = 0;
    const ERET: u32 = 0x4200_0018;

    /// CPU starting at physical 0 with `program` loaded there
    fn cpu_with(program: &[u32]) -> CpuMips<ArrayMemory> {
        let mut cpu = CpuMips::new(ArrayMemory::new());
        for (i, word) in program.iter().enumerate() {
            cpu.memory.write_word(i as u32 * 4, *word);
        }
        cpu.set_entry_point(0x8000_0000);
        cpu
    }

    #[test]
    fn test_cpu_creation() {
        let cpu = CpuMips::new(ArrayMemory::new());
        assert_eq!(cpu.pc as u32, RESET_VECTOR);
        assert_eq!(cpu.gpr[0], 0);
        assert_eq!(cpu.timestamp(), 0);
    }

    #[test]
    fn test_reset() {
        let mut cpu = cpu_with(&[NOP]);
        cpu.gpr[1] = 0x1234;
        cpu.step();
        cpu.reset();

        assert_eq!(cpu.pc as u32, RESET_VECTOR);
        assert_eq!(cpu.gpr[1], 0);
        assert_eq!(cpu.clock().cycles(), 0);
    }

    #[test]
    fn test_r0_always_zero() {
        let mut cpu = cpu_with(&[itype(0x0D, 0, 0, 0x1234)]); // ORI $0, $0, 0x1234
        cpu.step();
        assert_eq!(cpu.gpr[0], 0);
    }

    #[test]
    fn test_ori_lui_addu() {
        let mut cpu = cpu_with(&[
            itype(0x0F, 0, 1, 0x1234),      // LUI $1, 0x1234
            itype(0x0D, 1, 1, 0x5678),      // ORI $1, $1, 0x5678
            itype(0x0D, 0, 2, 0x0008),      // ORI $2, $0, 8
            rtype(1, 2, 3, 0, 0x21),        // ADDU $3, $1, $2
        ]);
        for _ in 0..4 {
            cpu.step();
        }
        assert_eq!(cpu.gpr[1], 0x1234_5678);
        assert_eq!(cpu.gpr[3], 0x1234_5680);
    }

    #[test]
    fn test_lui_sign_extends() {
        let mut cpu = cpu_with(&[itype(0x0F, 0, 1, 0x8000)]);
        cpu.step();
        assert_eq!(cpu.gpr[1], 0xFFFF_FFFF_8000_0000);
    }

    #[test]
    fn test_lw_sw() {
        let mut cpu = cpu_with(&[
            itype(0x2B, 1, 2, 0), // SW $2, 0($1)
            itype(0x23, 1, 3, 0), // LW $3, 0($1)
        ]);
        cpu.gpr[1] = 0x1000;
        cpu.gpr[2] = 0xDEADBEEF;
        cpu.step();
        cpu.step();
        assert_eq!(cpu.gpr[3], 0xFFFF_FFFF_DEAD_BEEF);
    }

    #[test]
    fn test_lwl_lwr_unaligned_word() {
        let mut cpu = cpu_with(&[
            itype(0x22, 1, 2, 1), // LWL $2, 1($1)
            itype(0x26, 1, 2, 4), // LWR $2, 4($1)
        ]);
        cpu.memory.write_word(0x1000, 0x0011_2233);
        cpu.memory.write_word(0x1004, 0x4455_6677);
        cpu.gpr[1] = 0x1000;
        cpu.step();
        cpu.step();
        assert_eq!(cpu.gpr[2] as u32, 0x1122_3344);
    }

    #[test]
    fn test_swl_swr_unaligned_word() {
        let mut cpu = cpu_with(&[
            itype(0x2A, 1, 2, 1), // SWL $2, 1($1)
            itype(0x2E, 1, 2, 4), // SWR $2, 4($1)
        ]);
        cpu.gpr[1] = 0x1000;
        cpu.gpr[2] = 0xAABB_CCDD;
        cpu.step();
        cpu.step();
        assert_eq!(cpu.memory.read_word(0x1000), 0x00AA_BBCC);
        assert_eq!(cpu.memory.read_word(0x1004), 0xDD00_0000);
    }

    #[test]
    fn test_branch_delay_slot_executes() {
        let mut cpu = cpu_with(&[
            itype(0x04, 0, 0, 2),           // BEQ $0, $0, +2
            itype(0x0D, 0, 1, 1),           // ORI $1, $0, 1 (delay slot)
            itype(0x0D, 0, 2, 2),           // skipped
            itype(0x0D, 0, 3, 3),           // target
        ]);
        cpu.step();
        assert!(cpu.in_delay_slot());
        cpu.step();
        cpu.step();
        assert_eq!(cpu.gpr[1], 1);
        assert_eq!(cpu.gpr[2], 0);
        assert_eq!(cpu.gpr[3], 3);
    }

    #[test]
    fn test_branch_likely_nullifies_delay_slot() {
        let mut cpu = cpu_with(&[
            itype(0x15, 0, 0, 4),           // BNEL $0, $0 (not taken)
            itype(0x0D, 0, 1, 1),           // nullified
            itype(0x0D, 0, 2, 2),
        ]);
        cpu.step();
        cpu.step();
        assert_eq!(cpu.gpr[1], 0);
        assert_eq!(cpu.gpr[2], 2);
    }

    #[test]
    fn test_jal_links_past_delay_slot() {
        let mut cpu = cpu_with(&[0x0C00_0010, NOP]); // JAL 0x40
        cpu.step();
        cpu.step();
        assert_eq!(cpu.gpr[31], 0xFFFF_FFFF_8000_0008);
        assert_eq!(cpu.pc, 0xFFFF_FFFF_8000_0040);
    }

    #[test]
    fn test_reserved_instruction_traps() {
        let mut cpu = cpu_with(&[0xEC00_0000]); // opcode 0x3B is undefined
        let cycles = cpu.step();

        assert_eq!(cycles, 1 + EXCEPTION_ENTRY_CYCLES);
        assert_eq!(cpu.pc as u32, 0x8000_0180);
        assert_eq!((cpu.cp0[CP0_CAUSE] >> 2) & 0x1F, u64::from(exception::RESERVED_INSTRUCTION));
        assert_eq!(cpu.cp0[CP0_EPC] as u32, 0x8000_0000);
        assert!(cpu.cp0[CP0_STATUS] & STATUS_EXL != 0);
    }

    #[test]
    fn test_cop2_on_main_cpu_is_unusable() {
        let mut cpu = cpu_with(&[0x4800_0000]); // COP2
        cpu.step();
        assert_eq!(
            (cpu.cp0[CP0_CAUSE] >> 2) & 0x1F,
            u64::from(exception::COPROCESSOR_UNUSABLE)
        );
        assert_eq!((cpu.cp0[CP0_CAUSE] >> 28) & 3, 2);
    }

    #[test]
    fn test_exception_in_delay_slot_sets_bd() {
        let mut cpu = cpu_with(&[
            itype(0x04, 0, 0, 4), // BEQ $0, $0
            0x0000_000D,          // BREAK (delay slot)
        ]);
        cpu.step();
        cpu.step();
        assert!(cpu.cp0[CP0_CAUSE] & CAUSE_BD != 0);
        assert_eq!(cpu.cp0[CP0_EPC] as u32, 0x8000_0000);
    }

    #[test]
    fn test_add_overflow_leaves_destination() {
        let mut cpu = cpu_with(&[rtype(1, 2, 3, 0, 0x20)]); // ADD $3, $1, $2
        cpu.gpr[1] = 0x7FFF_FFFF;
        cpu.gpr[2] = 1;
        cpu.gpr[3] = 0x55;
        cpu.step();
        assert_eq!(cpu.gpr[3], 0x55);
        assert_eq!((cpu.cp0[CP0_CAUSE] >> 2) & 0x1F, u64::from(exception::OVERFLOW));
    }

    #[test]
    fn test_multiply_divide_costs() {
        let mut cpu = cpu_with(&[
            rtype(1, 2, 0, 0, 0x18), // MULT
            rtype(1, 2, 0, 0, 0x1A), // DIV
            rtype(1, 2, 0, 0, 0x1C), // DMULT
            rtype(1, 2, 0, 0, 0x1E), // DDIV
        ]);
        cpu.gpr[1] = (-7i64) as u64;
        cpu.gpr[2] = 2;
        assert_eq!(cpu.step(), 5);
        assert_eq!(cpu.lo as i64, -14);
        assert_eq!(cpu.step(), 37);
        assert_eq!(cpu.lo as i64, -3);
        assert_eq!(cpu.hi as i64, -1);
        assert_eq!(cpu.step(), 8);
        assert_eq!(cpu.step(), 69);
        assert_eq!(cpu.clock().cycles(), 5 + 37 + 8 + 69);
    }

    #[test]
    fn test_divide_by_zero_is_defined() {
        let mut cpu = cpu_with(&[rtype(1, 2, 0, 0, 0x1B)]); // DIVU
        cpu.gpr[1] = 42;
        cpu.step();
        assert_eq!(cpu.lo, u64::MAX);
        assert_eq!(cpu.hi, 42);
    }

    #[test]
    fn test_fpu_add_and_compare() {
        let mut cpu = cpu_with(&[
            0x4600_1080 | (1 << 16), // ADD.S $f2, $f2, $f1
            0x4602_103C,             // C.LT.S $f2, $f2 -> false
            0x4601_0832,             // C.EQ.S $f1, $f1 -> true
        ]);
        cpu.fpr[1] = u64::from(1.5f32.to_bits());
        cpu.fpr[2] = u64::from(2.25f32.to_bits());
        assert_eq!(cpu.step(), 3);
        assert_eq!(f32::from_bits(cpu.fpr[2] as u32), 3.75);
        cpu.step();
        assert_eq!(cpu.fcr31 & FCR31_CONDITION, 0);
        cpu.step();
        assert_ne!(cpu.fcr31 & FCR31_CONDITION, 0);
    }

    #[test]
    fn test_fpu_double_costs_and_conversion() {
        let mut cpu = cpu_with(&[
            0x4620_1083 | (1 << 16), // DIV.D $f2, $f2, $f1
            0x4620_1124,             // CVT.W.D $f4, $f2
        ]);
        cpu.fpr[1] = 2.0f64.to_bits();
        cpu.fpr[2] = 7.0f64.to_bits();
        assert_eq!(cpu.step(), 58);
        assert_eq!(f64::from_bits(cpu.fpr[2]), 3.5);
        cpu.step();
        // Round to nearest even
        assert_eq!(cpu.fpr[4] as u32, 4);
    }

    /// Enable interrupts with all lines unmasked
    fn enable_interrupts(cpu: &mut CpuMips<ArrayMemory>) {
        cpu.cp0[CP0_STATUS] = STATUS_RESET | 0xFF00 | STATUS_IE;
    }

    #[test]
    fn test_interrupt_priority_and_rearm() {
        let mut cpu = cpu_with(&[NOP; 4]);
        enable_interrupts(&mut cpu);
        cpu.set_interrupt_line(2, true);
        cpu.set_interrupt_line(7, true);

        cpu.step();
        assert_eq!(cpu.pc as u32, 0x8000_0180);
        assert_eq!((cpu.cp0[CP0_CAUSE] >> 2) & 0x1F, 0);
        assert!(!cpu.interrupt_latch().is_pending(7));
        assert!(cpu.interrupt_latch().is_pending(2));

        // Acknowledge the timer (write Compare), then return
        cpu.memory.write_word(0x180, 0x4080_5800); // MTC0 $0, Compare
        cpu.memory.write_word(0x184, ERET);
        cpu.step();
        cpu.step();
        assert_eq!(cpu.pc as u32, 0x8000_0000);

        // IP2 is still pending and is taken next
        cpu.step();
        assert_eq!(cpu.pc as u32, 0x8000_0180);
        assert!(!cpu.interrupt_latch().is_pending(2));
    }

    #[test]
    fn test_masked_interrupt_not_taken() {
        let mut cpu = cpu_with(&[NOP; 2]);
        cpu.cp0[CP0_STATUS] = STATUS_RESET | (1 << 15) | STATUS_IE;
        cpu.set_interrupt_line(2, true);
        cpu.step();
        assert_eq!(cpu.pc as u32, 0x8000_0004);
        assert!(cpu.interrupt_latch().is_pending(2));
    }

    #[test]
    fn test_count_compare_timer() {
        let mut cpu = cpu_with(&[NOP; 16]);
        cpu.cp0[CP0_COMPARE] = 3;
        for _ in 0..5 {
            cpu.step();
        }
        assert_eq!(cpu.cp0[CP0_COUNT], 2);
        assert!(!cpu.interrupt_latch().is_pending(TIMER_LINE));
        cpu.step();
        assert_eq!(cpu.cp0[CP0_COUNT], 3);
        assert!(cpu.interrupt_latch().is_pending(TIMER_LINE));
        assert!(cpu.cp0[CP0_CAUSE] & (1 << 15) != 0);
    }

    #[test]
    fn test_ll_sc() {
        let mut cpu = cpu_with(&[
            itype(0x30, 1, 2, 0), // LL $2, 0($1)
            itype(0x38, 1, 3, 0), // SC $3, 0($1)
        ]);
        cpu.gpr[1] = 0x2000;
        cpu.gpr[3] = 0x77;
        cpu.step();
        cpu.step();
        assert_eq!(cpu.gpr[3], 1);
        assert_eq!(cpu.memory.read_word(0x2000), 0x77);
    }

    #[test]
    fn test_unaligned_load_raises_address_error() {
        let mut cpu = cpu_with(&[itype(0x23, 1, 2, 2)]); // LW $2, 2($1)
        cpu.gpr[1] = 0x1000;
        cpu.step();
        assert_eq!((cpu.cp0[CP0_CAUSE] >> 2) & 0x1F, u64::from(exception::ADDRESS_LOAD));
        assert_eq!(cpu.cp0[CP0_BADVADDR], 0x1002);
    }

    #[test]
    fn test_array_memory_wraps_at_end() {
        let mut memory = ArrayMemory::new();
        memory.write_doubleword(0x007F_FFFC, 0x1122_3344_5566_7788);
        assert_eq!(memory.read_doubleword(0x007F_FFFC), 0x1122_3344_5566_7788);
        assert_eq!(memory.read_word(0), 0x5566_7788);
        assert_eq!(memory.read_halfword(0x007F_FFFF), 0x4455);
        assert_eq!(memory.read_word(0xFFFF_FFFE), 0x3344_5566);
    }
}

