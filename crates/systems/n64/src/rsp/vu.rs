//! RSP vector unit (COP2).
//!
//! 32 registers of eight 16-bit lanes, a 48-bit accumulator per lane, the
//! VCO/VCC/VCE flag registers and the divide unit. Lane 0 is the most
//! significant halfword of a register; byte `n` is big-endian byte `n` of the
//! 128-bit value.
//!
//! The unit is driven synchronously by the RSP scalar core: COP2 instructions
//! go to [`VectorUnit::execute`], LWC2/SWC2 to [`VectorUnit::load`] and
//! [`VectorUnit::store`], moves to the `mfc2`/`mtc2`/`cfc2`/`ctc2` helpers.
//! Vector loads and stores only ever address DMEM and wrap at 4 KiB.

use super::tables::tables;
use super::DMEM_SIZE;
use lockstep_core::logging::{log, LogCategory, LogLevel};
use lockstep_core::state::Serializer;

/// One 128-bit vector register
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Vector(pub [u16; 8]);

impl Vector {
    pub fn element(&self, lane: usize) -> u16 {
        self.0[lane & 7]
    }

    pub fn set_element(&mut self, lane: usize, value: u16) {
        self.0[lane & 7] = value;
    }

    fn signed(&self, lane: usize) -> i16 {
        self.0[lane] as i16
    }

    pub fn byte(&self, index: usize) -> u8 {
        let lane = self.0[(index >> 1) & 7];
        if index & 1 == 0 {
            (lane >> 8) as u8
        } else {
            lane as u8
        }
    }

    pub fn set_byte(&mut self, index: usize, value: u8) {
        let lane = &mut self.0[(index >> 1) & 7];
        if index & 1 == 0 {
            *lane = (*lane & 0x00FF) | (u16::from(value) << 8);
        } else {
            *lane = (*lane & 0xFF00) | u16::from(value);
        }
    }

    /// Broadcast/shuffle by the 4-bit element field
    pub fn select(&self, e: u32) -> Vector {
        let mut out = Vector::default();
        for (i, lane) in out.0.iter_mut().enumerate() {
            let source = match e {
                0 | 1 => i,
                2 | 3 => (i & !1) | (e as usize & 1),
                4..=7 => (i & !3) | (e as usize & 3),
                _ => e as usize & 7,
            };
            *lane = self.0[source];
        }
        out
    }
}

fn flag(bits: u8, lane: usize) -> bool {
    bits & (1 << lane) != 0
}

fn set_flag(bits: &mut u8, lane: usize, value: bool) -> bool {
    if value {
        *bits |= 1 << lane;
    } else {
        *bits &= !(1 << lane);
    }
    value
}

fn clamp_i16(value: i64) -> u16 {
    value.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16 as u16
}

fn dmem_read(dmem: &[u8; DMEM_SIZE], addr: u32) -> u8 {
    dmem[addr as usize & (DMEM_SIZE - 1)]
}

fn dmem_write(dmem: &mut [u8; DMEM_SIZE], addr: u32, value: u8) {
    dmem[addr as usize & (DMEM_SIZE - 1)] = value;
}

/// Multiply flavours of VMUD*/VMAD*
#[derive(Debug, Clone, Copy)]
enum Partial {
    /// unsigned x unsigned, high half
    Low,
    /// signed x unsigned
    Mid,
    /// unsigned x signed
    Norm,
    /// signed x signed, shifted into ACCH:ACCM
    High,
}

impl Partial {
    fn product(self, s: u16, t: u16) -> i64 {
        match self {
            Partial::Low => ((u32::from(s) * u32::from(t)) >> 16) as i64,
            Partial::Mid => i64::from(s as i16) * i64::from(t),
            Partial::Norm => i64::from(s) * i64::from(t as i16),
            Partial::High => (i64::from(s as i16) * i64::from(t as i16)) << 16,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Logic {
    And,
    Nand,
    Or,
    Nor,
    Xor,
    Nxor,
}

#[derive(Debug, Clone, Copy)]
enum Compare {
    Lt,
    Eq,
    Ne,
    Ge,
}

#[derive(Debug, Clone)]
pub struct VectorUnit {
    vpr: [Vector; 32],
    acch: Vector,
    accm: Vector,
    accl: Vector,
    vcol: u8,
    vcoh: u8,
    vccl: u8,
    vcch: u8,
    vce: u8,
    divin: i16,
    divout: i16,
    divdp: bool,
}

impl Default for VectorUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorUnit {
    pub fn new() -> Self {
        Self {
            vpr: [Vector::default(); 32],
            acch: Vector::default(),
            accm: Vector::default(),
            accl: Vector::default(),
            vcol: 0,
            vcoh: 0,
            vccl: 0,
            vcch: 0,
            vce: 0,
            divin: 0,
            divout: 0,
            divdp: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn register(&self, index: usize) -> Vector {
        self.vpr[index & 31]
    }

    pub fn set_register(&mut self, index: usize, value: Vector) {
        self.vpr[index & 31] = value;
    }

    /// Sign-extended 48-bit accumulator of `lane`
    pub fn accumulator(&self, lane: usize) -> i64 {
        let raw = (u64::from(self.acch.0[lane]) << 32)
            | (u64::from(self.accm.0[lane]) << 16)
            | u64::from(self.accl.0[lane]);
        ((raw << 16) as i64) >> 16
    }

    fn set_accumulator(&mut self, lane: usize, value: i64) {
        self.acch.0[lane] = (value >> 32) as u16;
        self.accm.0[lane] = (value >> 16) as u16;
        self.accl.0[lane] = value as u16;
    }

    /// ACCH:ACCM as a signed 32-bit value
    fn accumulator_high(&self, lane: usize) -> i32 {
        ((u32::from(self.acch.0[lane]) << 16) | u32::from(self.accm.0[lane])) as i32
    }

    /// Signed clamp of ACCH:ACCM, returning ACCM when in range
    fn saturate_mid(&self, lane: usize) -> u16 {
        match self.accumulator_high(lane) {
            high if high < i32::from(i16::MIN) => 0x8000,
            high if high > i32::from(i16::MAX) => 0x7FFF,
            _ => self.accm.0[lane],
        }
    }

    /// Range check on ACCH:ACCM, returning ACCL when in range
    fn saturate_low(&self, lane: usize) -> u16 {
        match self.accumulator_high(lane) {
            high if high < i32::from(i16::MIN) => 0x0000,
            high if high > i32::from(i16::MAX) => 0xFFFF,
            _ => self.accl.0[lane],
        }
    }

    fn saturate_unsigned(&self, lane: usize) -> u16 {
        match self.accumulator_high(lane) {
            high if high < 0 => 0x0000,
            high if high > i32::from(i16::MAX) => 0xFFFF,
            _ => self.accm.0[lane],
        }
    }

    /// VCO as CFC2 presents it (VCOH in the high byte)
    pub fn vco(&self) -> u16 {
        (u16::from(self.vcoh) << 8) | u16::from(self.vcol)
    }

    pub fn vcc(&self) -> u16 {
        (u16::from(self.vcch) << 8) | u16::from(self.vccl)
    }

    pub fn vce(&self) -> u8 {
        self.vce
    }

    pub fn divout(&self) -> i16 {
        self.divout
    }

    /// Execute a COP2 computational instruction
    pub fn execute(&mut self, instr: u32) {
        let e = (instr >> 21) & 0xF;
        let vt = ((instr >> 16) & 0x1F) as usize;
        let vs = ((instr >> 11) & 0x1F) as usize;
        let vd = ((instr >> 6) & 0x1F) as usize;

        match instr & 0x3F {
            0x00 => self.vmulf(vd, vs, vt, e, false, false),
            0x01 => self.vmulf(vd, vs, vt, e, false, true),
            0x02 => self.vrnd(vd, vs, vt, e, true),
            0x03 => self.vmulq(vd, vs, vt, e),
            0x04 => self.vmud(vd, vs, vt, e, Partial::Low, false),
            0x05 => self.vmud(vd, vs, vt, e, Partial::Mid, false),
            0x06 => self.vmud(vd, vs, vt, e, Partial::Norm, false),
            0x07 => self.vmud(vd, vs, vt, e, Partial::High, false),
            0x08 => self.vmulf(vd, vs, vt, e, true, false),
            0x09 => self.vmulf(vd, vs, vt, e, true, true),
            0x0A => self.vrnd(vd, vs, vt, e, false),
            0x0B => self.vmacq(vd),
            0x0C => self.vmud(vd, vs, vt, e, Partial::Low, true),
            0x0D => self.vmud(vd, vs, vt, e, Partial::Mid, true),
            0x0E => self.vmud(vd, vs, vt, e, Partial::Norm, true),
            0x0F => self.vmud(vd, vs, vt, e, Partial::High, true),
            0x10 => self.vadd(vd, vs, vt, e),
            0x11 => self.vsub(vd, vs, vt, e),
            0x13 => self.vabs(vd, vs, vt, e),
            0x14 => self.vaddc(vd, vs, vt, e),
            0x15 => self.vsubc(vd, vs, vt, e),
            0x1D => self.vsar(vd, e),
            0x20 => self.compare(vd, vs, vt, e, Compare::Lt),
            0x21 => self.compare(vd, vs, vt, e, Compare::Eq),
            0x22 => self.compare(vd, vs, vt, e, Compare::Ne),
            0x23 => self.compare(vd, vs, vt, e, Compare::Ge),
            0x24 => self.vcl(vd, vs, vt, e),
            0x25 => self.vch(vd, vs, vt, e),
            0x26 => self.vcr(vd, vs, vt, e),
            0x27 => self.vmrg(vd, vs, vt, e),
            0x28 => self.logic(vd, vs, vt, e, Logic::And),
            0x29 => self.logic(vd, vs, vt, e, Logic::Nand),
            0x2A => self.logic(vd, vs, vt, e, Logic::Or),
            0x2B => self.logic(vd, vs, vt, e, Logic::Nor),
            0x2C => self.logic(vd, vs, vt, e, Logic::Xor),
            0x2D => self.logic(vd, vs, vt, e, Logic::Nxor),
            0x30 => self.vrcp(vd, vs, vt, e, false),
            0x31 => self.vrcp(vd, vs, vt, e, true),
            0x32 | 0x36 => self.vrcph(vd, vs, vt, e),
            0x33 => self.vmov(vd, vs, vt, e),
            0x34 => self.vrsq(vd, vs, vt, e, false),
            0x35 => self.vrsq(vd, vs, vt, e, true),
            0x37 | 0x3F => {}
            funct => {
                log(LogCategory::RSP, LogLevel::Trace, || {
                    format!("VU: undefined function {:02X} executes as VZERO", funct)
                });
                self.vzero(vd, vs, vt, e);
            }
        }
    }

    fn operands(&self, vs: usize, vt: usize, e: u32) -> (Vector, Vector) {
        (self.vpr[vs], self.vpr[vt].select(e))
    }

    fn vmulf(
        &mut self,
        vd: usize,
        vs: usize,
        vt: usize,
        e: u32,
        accumulate: bool,
        unsigned: bool,
    ) {
        let (src, vte) = self.operands(vs, vt, e);
        let mut out = Vector::default();
        for lane in 0..8 {
            let product = i64::from(src.signed(lane)) * i64::from(vte.signed(lane)) * 2;
            let acc = if accumulate {
                self.accumulator(lane) + product
            } else {
                product + 0x8000
            };
            self.set_accumulator(lane, acc);
            out.0[lane] = if unsigned {
                self.saturate_unsigned(lane)
            } else {
                self.saturate_mid(lane)
            };
        }
        self.vpr[vd] = out;
    }

    fn vmud(&mut self, vd: usize, vs: usize, vt: usize, e: u32, kind: Partial, accumulate: bool) {
        let (src, vte) = self.operands(vs, vt, e);
        let mut out = Vector::default();
        for lane in 0..8 {
            let product = kind.product(src.0[lane], vte.0[lane]);
            let acc = if accumulate {
                self.accumulator(lane) + product
            } else {
                product
            };
            self.set_accumulator(lane, acc);
            out.0[lane] = match kind {
                Partial::Low | Partial::Norm => self.saturate_low(lane),
                Partial::Mid | Partial::High => self.saturate_mid(lane),
            };
        }
        self.vpr[vd] = out;
    }

    /// VRNDP (`positive`) adds to non-negative accumulators, VRNDN to negative ones
    fn vrnd(&mut self, vd: usize, vs: usize, vt: usize, e: u32, positive: bool) {
        let vte = self.vpr[vt].select(e);
        let mut out = Vector::default();
        for lane in 0..8 {
            let mut product = i64::from(vte.signed(lane));
            if vs & 1 != 0 {
                product <<= 16;
            }
            let acc = self.accumulator(lane);
            if (acc >= 0) == positive {
                self.set_accumulator(lane, acc + product);
            }
            out.0[lane] = self.saturate_mid(lane);
        }
        self.vpr[vd] = out;
    }

    fn vmulq(&mut self, vd: usize, vs: usize, vt: usize, e: u32) {
        let (src, vte) = self.operands(vs, vt, e);
        let mut out = Vector::default();
        for lane in 0..8 {
            let mut product = i32::from(src.signed(lane)) * i32::from(vte.signed(lane));
            if product < 0 {
                product += 31;
            }
            self.acch.0[lane] = (product >> 16) as u16;
            self.accm.0[lane] = product as u16;
            self.accl.0[lane] = 0;
            out.0[lane] = clamp_i16(i64::from(product >> 1)) & !15;
        }
        self.vpr[vd] = out;
    }

    fn vmacq(&mut self, vd: usize) {
        let mut out = Vector::default();
        for lane in 0..8 {
            let mut product = self.accumulator_high(lane);
            if product & (1 << 5) == 0 {
                if product < 0 {
                    product += 32;
                } else if product >= 32 {
                    product -= 32;
                }
            }
            self.acch.0[lane] = (product >> 16) as u16;
            self.accm.0[lane] = product as u16;
            out.0[lane] = clamp_i16(i64::from(product >> 1)) & !15;
        }
        self.vpr[vd] = out;
    }

    fn vadd(&mut self, vd: usize, vs: usize, vt: usize, e: u32) {
        let (src, vte) = self.operands(vs, vt, e);
        let mut out = Vector::default();
        for lane in 0..8 {
            let result = i32::from(src.signed(lane))
                + i32::from(vte.signed(lane))
                + i32::from(flag(self.vcol, lane));
            self.accl.0[lane] = result as u16;
            out.0[lane] = clamp_i16(i64::from(result));
        }
        self.vcol = 0;
        self.vcoh = 0;
        self.vpr[vd] = out;
    }

    fn vsub(&mut self, vd: usize, vs: usize, vt: usize, e: u32) {
        let (src, vte) = self.operands(vs, vt, e);
        let mut out = Vector::default();
        for lane in 0..8 {
            let result = i32::from(src.signed(lane))
                - i32::from(vte.signed(lane))
                - i32::from(flag(self.vcol, lane));
            self.accl.0[lane] = result as u16;
            out.0[lane] = clamp_i16(i64::from(result));
        }
        self.vcol = 0;
        self.vcoh = 0;
        self.vpr[vd] = out;
    }

    fn vabs(&mut self, vd: usize, vs: usize, vt: usize, e: u32) {
        let (src, vte) = self.operands(vs, vt, e);
        let mut out = Vector::default();
        for lane in 0..8 {
            let t = vte.signed(lane);
            let (acc, result) = match src.signed(lane) {
                s if s < 0 && t == i16::MIN => (0x8000, 0x7FFF),
                s if s < 0 => {
                    let negated = t.wrapping_neg() as u16;
                    (negated, negated)
                }
                s if s > 0 => (t as u16, t as u16),
                _ => (0, 0),
            };
            self.accl.0[lane] = acc;
            out.0[lane] = result;
        }
        self.vpr[vd] = out;
    }

    fn vaddc(&mut self, vd: usize, vs: usize, vt: usize, e: u32) {
        let (src, vte) = self.operands(vs, vt, e);
        for lane in 0..8 {
            let result = u32::from(src.0[lane]) + u32::from(vte.0[lane]);
            self.accl.0[lane] = result as u16;
            set_flag(&mut self.vcol, lane, result >> 16 != 0);
        }
        self.vcoh = 0;
        self.vpr[vd] = self.accl;
    }

    fn vsubc(&mut self, vd: usize, vs: usize, vt: usize, e: u32) {
        let (src, vte) = self.operands(vs, vt, e);
        for lane in 0..8 {
            let result = u32::from(src.0[lane]).wrapping_sub(u32::from(vte.0[lane]));
            self.accl.0[lane] = result as u16;
            set_flag(&mut self.vcol, lane, result >> 16 != 0);
            set_flag(&mut self.vcoh, lane, result != 0);
        }
        self.vpr[vd] = self.accl;
    }

    fn vsar(&mut self, vd: usize, e: u32) {
        self.vpr[vd] = match e {
            8 => self.acch,
            9 => self.accm,
            10 => self.accl,
            _ => Vector::default(),
        };
    }

    fn compare(&mut self, vd: usize, vs: usize, vt: usize, e: u32, op: Compare) {
        let (src, vte) = self.operands(vs, vt, e);
        for lane in 0..8 {
            let (s, t) = (src.signed(lane), vte.signed(lane));
            let carry = flag(self.vcol, lane);
            let not_equal = flag(self.vcoh, lane);
            let take = match op {
                Compare::Lt => s < t || (s == t && carry && not_equal),
                Compare::Eq => !not_equal && s == t,
                Compare::Ne => s != t || not_equal,
                Compare::Ge => s > t || (s == t && (!carry || !not_equal)),
            };
            set_flag(&mut self.vccl, lane, take);
            self.accl.0[lane] = if take { src.0[lane] } else { vte.0[lane] };
        }
        self.vcch = 0;
        self.vcol = 0;
        self.vcoh = 0;
        self.vpr[vd] = self.accl;
    }

    /// Clip test high
    fn vch(&mut self, vd: usize, vs: usize, vt: usize, e: u32) {
        let (src, vte) = self.operands(vs, vt, e);
        for lane in 0..8 {
            let (s, t) = (src.signed(lane), vte.signed(lane));
            let not_complement = s as u16 != (t as u16 ^ 0xFFFF);
            if (s ^ t) < 0 {
                let result = s.wrapping_add(t);
                let le = result <= 0;
                self.accl.0[lane] = if le { t.wrapping_neg() as u16 } else { s as u16 };
                set_flag(&mut self.vccl, lane, le);
                set_flag(&mut self.vcch, lane, t < 0);
                set_flag(&mut self.vcol, lane, true);
                set_flag(&mut self.vcoh, lane, result != 0 && not_complement);
                set_flag(&mut self.vce, lane, result == -1);
            } else {
                let result = s.wrapping_sub(t);
                let ge = result >= 0;
                self.accl.0[lane] = if ge { t as u16 } else { s as u16 };
                set_flag(&mut self.vccl, lane, t < 0);
                set_flag(&mut self.vcch, lane, ge);
                set_flag(&mut self.vcol, lane, false);
                set_flag(&mut self.vcoh, lane, result != 0 && not_complement);
                set_flag(&mut self.vce, lane, false);
            }
        }
        self.vpr[vd] = self.accl;
    }

    /// Clip test low, continuing a VCH
    fn vcl(&mut self, vd: usize, vs: usize, vt: usize, e: u32) {
        let (src, vte) = self.operands(vs, vt, e);
        for lane in 0..8 {
            let (s, t) = (src.0[lane], vte.0[lane]);
            let negated = t.wrapping_neg();
            self.accl.0[lane] = if flag(self.vcol, lane) {
                if flag(self.vcoh, lane) {
                    if flag(self.vccl, lane) {
                        negated
                    } else {
                        s
                    }
                } else {
                    let (sum, carry) = s.overflowing_add(t);
                    let le = if flag(self.vce, lane) {
                        sum == 0 || !carry
                    } else {
                        sum == 0 && !carry
                    };
                    if set_flag(&mut self.vccl, lane, le) {
                        negated
                    } else {
                        s
                    }
                }
            } else if flag(self.vcoh, lane) {
                if flag(self.vcch, lane) {
                    t
                } else {
                    s
                }
            } else if set_flag(&mut self.vcch, lane, s >= t) {
                t
            } else {
                s
            };
        }
        self.vcol = 0;
        self.vcoh = 0;
        self.vce = 0;
        self.vpr[vd] = self.accl;
    }

    /// Clip test, one's complement
    fn vcr(&mut self, vd: usize, vs: usize, vt: usize, e: u32) {
        let (src, vte) = self.operands(vs, vt, e);
        for lane in 0..8 {
            let (s, t) = (src.signed(lane), vte.signed(lane));
            if (s ^ t) < 0 {
                set_flag(&mut self.vcch, lane, t < 0);
                let le = i32::from(s) + i32::from(t) + 1 <= 0;
                set_flag(&mut self.vccl, lane, le);
                self.accl.0[lane] = if le { !(t as u16) } else { s as u16 };
            } else {
                set_flag(&mut self.vccl, lane, t < 0);
                let ge = i32::from(s) - i32::from(t) >= 0;
                set_flag(&mut self.vcch, lane, ge);
                self.accl.0[lane] = if ge { t as u16 } else { s as u16 };
            }
        }
        self.vcol = 0;
        self.vcoh = 0;
        self.vce = 0;
        self.vpr[vd] = self.accl;
    }

    fn vmrg(&mut self, vd: usize, vs: usize, vt: usize, e: u32) {
        let (src, vte) = self.operands(vs, vt, e);
        for lane in 0..8 {
            self.accl.0[lane] = if flag(self.vccl, lane) {
                src.0[lane]
            } else {
                vte.0[lane]
            };
        }
        self.vcol = 0;
        self.vcoh = 0;
        self.vpr[vd] = self.accl;
    }

    fn logic(&mut self, vd: usize, vs: usize, vt: usize, e: u32, op: Logic) {
        let (src, vte) = self.operands(vs, vt, e);
        for lane in 0..8 {
            let (s, t) = (src.0[lane], vte.0[lane]);
            self.accl.0[lane] = match op {
                Logic::And => s & t,
                Logic::Nand => !(s & t),
                Logic::Or => s | t,
                Logic::Nor => !(s | t),
                Logic::Xor => s ^ t,
                Logic::Nxor => !(s ^ t),
            };
        }
        self.vpr[vd] = self.accl;
    }

    /// `vs` holds the destination element
    fn vmov(&mut self, vd: usize, vs: usize, vt: usize, e: u32) {
        let vte = self.vpr[vt].select(e);
        let de = vs & 7;
        self.vpr[vd].0[de] = vte.0[de];
        self.accl = vte;
    }

    fn vzero(&mut self, vd: usize, vs: usize, vt: usize, e: u32) {
        let (src, vte) = self.operands(vs, vt, e);
        for lane in 0..8 {
            self.accl.0[lane] = src.0[lane].wrapping_add(vte.0[lane]);
        }
        self.vpr[vd] = Vector::default();
    }

    /// Operand of VRCP/VRSQ, widened to 32 bits by a preceding VRCPH/VRSQH
    fn divide_input(&self, vt: usize, e: u32, low: bool) -> i32 {
        let element = self.vpr[vt].element(e as usize & 7);
        if low && self.divdp {
            ((u32::from(self.divin as u16) << 16) | u32::from(element)) as i32
        } else {
            i32::from(element as i16)
        }
    }

    /// Shared body of VRCP/VRSQ: table lookup on the normalized magnitude
    fn divide(&mut self, vd: usize, vs: usize, vt: usize, e: u32, input: i32, sqrt: bool) {
        let mask = input >> 31;
        let mut data = input ^ mask;
        if input > i32::from(i16::MIN) {
            data = data.wrapping_sub(mask);
        }

        let result: i32 = if data == 0 {
            0x7FFF_FFFF
        } else if input == i32::from(i16::MIN) {
            0xFFFF_0000_u32 as i32
        } else {
            let shift = (data as u32).leading_zeros();
            let index = (((data as u64) << shift) & 0x7FC0_0000) >> 22;
            let (entry, scale) = if sqrt {
                let index = (index as usize & 0x1FE) | (shift as usize & 1);
                (tables().inverse_sqrt[index], (31 - shift) >> 1)
            } else {
                (tables().reciprocal[index as usize], 31 - shift)
            };
            let mantissa = ((0x10000 | u32::from(entry)) << 14) as i32;
            (mantissa >> scale) ^ mask
        };

        self.divdp = false;
        self.divout = (result >> 16) as i16;
        self.accl = self.vpr[vt].select(e);
        self.vpr[vd].0[vs & 7] = result as u16;
    }

    fn vrcp(&mut self, vd: usize, vs: usize, vt: usize, e: u32, low: bool) {
        let input = self.divide_input(vt, e, low);
        self.divide(vd, vs, vt, e, input, false);
    }

    fn vrsq(&mut self, vd: usize, vs: usize, vt: usize, e: u32, low: bool) {
        let input = self.divide_input(vt, e, low);
        self.divide(vd, vs, vt, e, input, true);
    }

    /// VRCPH/VRSQH: latch the high half of a double-precision operand
    fn vrcph(&mut self, vd: usize, vs: usize, vt: usize, e: u32) {
        self.accl = self.vpr[vt].select(e);
        self.divdp = true;
        self.divin = self.vpr[vt].element(e as usize & 7) as i16;
        self.vpr[vd].0[vs & 7] = self.divout as u16;
    }

    /// MFC2: two bytes starting at byte `e`, sign-extended
    pub fn mfc2(&self, vs: usize, e: u32) -> u32 {
        let reg = &self.vpr[vs & 31];
        let e = e as usize;
        let value = (u16::from(reg.byte(e & 15)) << 8) | u16::from(reg.byte((e + 1) & 15));
        value as i16 as i32 as u32
    }

    pub fn mtc2(&mut self, vs: usize, e: u32, value: u32) {
        let reg = &mut self.vpr[vs & 31];
        let e = e as usize & 15;
        reg.set_byte(e, (value >> 8) as u8);
        if e != 15 {
            reg.set_byte(e + 1, value as u8);
        }
    }

    pub fn cfc2(&self, rd: usize) -> u32 {
        let value = match rd & 3 {
            0 => self.vco(),
            1 => self.vcc(),
            _ => u16::from(self.vce),
        };
        value as i16 as i32 as u32
    }

    pub fn ctc2(&mut self, rd: usize, value: u32) {
        match rd & 3 {
            0 => {
                self.vcoh = (value >> 8) as u8;
                self.vcol = value as u8;
            }
            1 => {
                self.vcch = (value >> 8) as u8;
                self.vccl = value as u8;
            }
            _ => self.vce = value as u8,
        }
    }

    /// LWC2 family; `base` is the scalar base register value
    pub fn load(&mut self, instr: u32, base: u32, dmem: &[u8; DMEM_SIZE]) {
        let op = (instr >> 11) & 0x1F;
        let vt = ((instr >> 16) & 0x1F) as usize;
        let e = ((instr >> 7) & 0xF) as usize;
        let offset = (((instr & 0x7F) as i32) << 25) >> 25;
        let address = |scale: i32| base.wrapping_add(offset.wrapping_mul(scale) as u32);

        match op {
            0x00 => {
                let value = dmem_read(dmem, address(1));
                self.vpr[vt].set_byte(e, value);
            }
            0x01 => self.load_bytes(vt, e, 2, address(2), dmem),
            0x02 => self.load_bytes(vt, e, 4, address(4), dmem),
            0x03 => self.load_bytes(vt, e, 8, address(8), dmem),
            0x04 => {
                // LQV: up to the end of the 16-byte line
                let addr = address(16);
                let end = (16 + e - (addr as usize & 15)).min(16);
                self.copy_in(vt, e, end, addr, dmem);
            }
            0x05 => {
                // LRV: the part of the line before the address
                let addr = address(16);
                let start = 16 - ((addr as usize & 15) as isize - e as isize);
                if start < 16 {
                    self.copy_in(vt, start as usize, 16, addr & !15, dmem);
                }
            }
            0x06 => self.load_packed(vt, e, address(8), 8, 1, dmem),
            0x07 => self.load_packed(vt, e, address(8), 7, 1, dmem),
            0x08 => self.load_packed(vt, e, address(16), 7, 2, dmem),
            0x09 => self.load_fourths(vt, e, address(16), dmem),
            0x0A => {}
            0x0B => self.load_transposed(vt, e, address(16), dmem),
            _ => {
                log(LogCategory::RSP, LogLevel::Warn, || {
                    format!("VU: unknown LWC2 op {:02X}", op)
                });
            }
        }
    }

    /// LSV/LLV/LDV: `count` bytes into byte `e` onwards, stopping at byte 15
    fn load_bytes(
        &mut self,
        vt: usize,
        e: usize,
        count: usize,
        addr: u32,
        dmem: &[u8; DMEM_SIZE],
    ) {
        let end = (e + count).min(16);
        self.copy_in(vt, e, end, addr, dmem);
    }

    fn copy_in(&mut self, vt: usize, start: usize, end: usize, addr: u32, dmem: &[u8; DMEM_SIZE]) {
        let mut addr = addr;
        for index in start..end {
            self.vpr[vt].set_byte(index & 15, dmem_read(dmem, addr));
            addr = addr.wrapping_add(1);
        }
    }

    /// LPV/LUV/LHV: one byte per lane, shifted into the upper bits
    fn load_packed(
        &mut self,
        vt: usize,
        e: usize,
        addr: u32,
        shift: u32,
        stride: u32,
        dmem: &[u8; DMEM_SIZE],
    ) {
        let index = (addr & 7).wrapping_sub(e as u32);
        let line = addr & !7;
        for lane in 0..8u32 {
            let byte = dmem_read(dmem, line.wrapping_add(index.wrapping_add(lane * stride) & 15));
            self.vpr[vt].0[lane as usize] = u16::from(byte) << shift;
        }
    }

    /// LFV: every fourth byte, unpacked into one half of the register
    fn load_fourths(&mut self, vt: usize, e: usize, addr: u32, dmem: &[u8; DMEM_SIZE]) {
        let index = (addr & 7).wrapping_sub(e as u32);
        let line = addr & !7;
        let mut tmp = Vector::default();
        for lane in 0..4u32 {
            let lo = dmem_read(dmem, line.wrapping_add(index.wrapping_add(lane * 4) & 15));
            let hi = dmem_read(dmem, line.wrapping_add(index.wrapping_add(lane * 4 + 8) & 15));
            tmp.0[lane as usize] = u16::from(lo) << 7;
            tmp.0[lane as usize + 4] = u16::from(hi) << 7;
        }
        for byte in e..(e + 8).min(16) {
            self.vpr[vt].set_byte(byte, tmp.byte(byte));
        }
    }

    /// LTV: one diagonal of an 8x8 transpose across a register group
    fn load_transposed(&mut self, vt: usize, e: usize, addr: u32, dmem: &[u8; DMEM_SIZE]) {
        let begin = addr & !7;
        let mut cursor = (e as u32 + (addr & 8)) & 15;
        let group = vt & !7;
        let mut reg = e >> 1;
        for lane in 0..8 {
            for half in 0..2 {
                let value = dmem_read(dmem, begin.wrapping_add(cursor));
                self.vpr[group + reg].set_byte(lane * 2 + half, value);
                cursor = (cursor + 1) & 15;
            }
            reg = (reg + 1) & 7;
        }
    }

    /// SWC2 family
    pub fn store(&self, instr: u32, base: u32, dmem: &mut [u8; DMEM_SIZE]) {
        let op = (instr >> 11) & 0x1F;
        let vt = ((instr >> 16) & 0x1F) as usize;
        let e = ((instr >> 7) & 0xF) as usize;
        let offset = (((instr & 0x7F) as i32) << 25) >> 25;
        let address = |scale: i32| base.wrapping_add(offset.wrapping_mul(scale) as u32);
        let reg = self.vpr[vt];

        match op {
            0x00 => dmem_write(dmem, address(1), reg.byte(e)),
            0x01 => Self::copy_out(&reg, e, e + 2, address(2), dmem),
            0x02 => Self::copy_out(&reg, e, e + 4, address(4), dmem),
            0x03 => Self::copy_out(&reg, e, e + 8, address(8), dmem),
            0x04 => {
                let addr = address(16);
                Self::copy_out(&reg, e, e + 16 - (addr as usize & 15), addr, dmem);
            }
            0x05 => {
                let addr = address(16);
                let len = addr as usize & 15;
                let base = 16 - len;
                let line = addr & !15;
                for (i, index) in (e..e + len).enumerate() {
                    dmem_write(dmem, line.wrapping_add(i as u32), reg.byte((index + base) & 15));
                }
            }
            0x06 | 0x07 => {
                let addr = address(8);
                for (i, index) in (e..e + 8).enumerate() {
                    let packed = ((index & 15) < 8) == (op == 0x06);
                    let value = if packed {
                        reg.byte((index & 7) << 1)
                    } else {
                        (reg.element(index & 7) >> 7) as u8
                    };
                    dmem_write(dmem, addr.wrapping_add(i as u32), value);
                }
            }
            0x08 => {
                let addr = address(16);
                let index = addr & 7;
                let line = addr & !7;
                for lane in 0..8u32 {
                    let byte = e + lane as usize * 2;
                    let value = (reg.byte(byte & 15) << 1) | (reg.byte((byte + 1) & 15) >> 7);
                    dmem_write(dmem, line.wrapping_add((index + lane * 2) & 15), value);
                }
            }
            0x09 => {
                let addr = address(16);
                let index = addr & 7;
                let line = addr & !7;
                let lanes: Option<[usize; 4]> = match e {
                    0 | 15 => Some([0, 1, 2, 3]),
                    1 => Some([6, 7, 4, 5]),
                    4 => Some([1, 2, 3, 0]),
                    5 => Some([7, 4, 5, 6]),
                    8 => Some([4, 5, 6, 7]),
                    11 => Some([3, 0, 1, 2]),
                    12 => Some([5, 6, 7, 4]),
                    _ => None,
                };
                for slot in 0..4u32 {
                    let value = lanes
                        .map(|lanes| (reg.element(lanes[slot as usize]) >> 7) as u8)
                        .unwrap_or(0);
                    dmem_write(dmem, line.wrapping_add((index + slot * 4) & 15), value);
                }
            }
            0x0A => {
                // SWV: the register rotated by e, wrapping within the line
                let addr = address(16);
                let line = addr & !7;
                let mut cursor = addr & 7;
                for index in e..e + 16 {
                    dmem_write(dmem, line.wrapping_add(cursor & 15), reg.byte(index & 15));
                    cursor += 1;
                }
            }
            0x0B => self.store_transposed(vt, e, address(16), dmem),
            _ => {
                log(LogCategory::RSP, LogLevel::Warn, || {
                    format!("VU: unknown SWC2 op {:02X}", op)
                });
            }
        }
    }

    fn copy_out(reg: &Vector, start: usize, end: usize, addr: u32, dmem: &mut [u8; DMEM_SIZE]) {
        for (i, index) in (start..end).enumerate() {
            dmem_write(dmem, addr.wrapping_add(i as u32), reg.byte(index & 15));
        }
    }

    /// STV: store one diagonal of a register group
    fn store_transposed(&self, vt: usize, e: usize, addr: u32, dmem: &mut [u8; DMEM_SIZE]) {
        let group = vt & !7;
        let mut element = 16 - (e & !1);
        let mut cursor = (addr & 7).wrapping_sub((e & !1) as u32);
        let line = addr & !7;
        for reg in group..group + 8 {
            for _ in 0..2 {
                let value = self.vpr[reg].byte(element & 15);
                dmem_write(dmem, line.wrapping_add(cursor & 15), value);
                element += 1;
                cursor = cursor.wrapping_add(1);
            }
        }
    }

    pub fn serialize(&mut self, s: &mut Serializer<'_>) {
        s.section("vu");
        for reg in self.vpr.iter_mut() {
            s.array(&mut reg.0);
        }
        s.array(&mut self.acch.0);
        s.array(&mut self.accm.0);
        s.array(&mut self.accl.0);
        s.integer(&mut self.vcol);
        s.integer(&mut self.vcoh);
        s.integer(&mut self.vccl);
        s.integer(&mut self.vcch);
        s.integer(&mut self.vce);
        s.integer(&mut self.divin);
        s.integer(&mut self.divout);
        s.integer(&mut self.divdp);
        s.identity("rsp_tables", tables().identity());
    }
}
