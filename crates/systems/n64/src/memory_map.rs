//! Physical memory map and the RCP address space behind it
//!
//! | Range                   | Device                  |
//! |-------------------------|-------------------------|
//! | 0x00000000-(RDRAM size) | RDRAM                   |
//! | 0x04000000-0x04001FFF   | SP DMEM / IMEM          |
//! | 0x04040000-0x0404001F   | SP registers            |
//! | 0x04080000-0x04080007   | SP_PC / SP_IBIST        |
//! | 0x04300000-0x0430000F   | MI                      |
//! | 0x04400000-0x04400037   | VI                      |
//! | 0x04500000-0x04500017   | AI                      |
//! | 0x04600000-0x04600033   | PI                      |
//! | 0x04800000-0x0480001B   | SI                      |
//! | 0x10000000-0x1FBFFFFF   | Cartridge ROM           |
//! | 0x1FC007C0-0x1FC007FF   | PIF RAM                 |
//!
//! Everything else is open bus. RCP registers are 32 bits wide; narrower
//! reads pick the addressed lane out of the register word, narrower writes
//! shift the value into its lane and write the whole register, and 64-bit
//! accesses touch two consecutive registers.

use crate::ai::AudioInterface;
use crate::cartridge::Cartridge;
use crate::config::SystemConfig;
use crate::mi::MipsInterface;
use crate::pi::PeripheralInterface;
use crate::rdram::Rdram;
use crate::rsp::Rsp;
use crate::si::SerialInterface;
use crate::vi::VideoInterface;
use lockstep_core::bus::{AccessSize, AddressSpace, Bus, BusError};
use lockstep_core::cpu_mips_r4300i::MemoryMips;
use lockstep_core::logging::{log, LogCategory, LogLevel};
use lockstep_core::state::Serializer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Rdram,
    SpMemory,
    SpRegisters,
    SpPc,
    Mi,
    Vi,
    Ai,
    Pi,
    Si,
    Cartridge,
    PifRam,
}

const FULL: u32 = 0xFFFF_FFFF;

/// Build and seal the bus for `config`
pub fn build_bus(config: &SystemConfig) -> Result<Bus<Device>, BusError> {
    let rdram_end = config.rdram_size.bytes() as u32 - 1;
    let map = [
        (0x0000_0000, rdram_end, FULL, Device::Rdram),
        (0x0400_0000, 0x0400_1FFF, 0x1FFF, Device::SpMemory),
        (0x0404_0000, 0x0404_001F, FULL, Device::SpRegisters),
        (0x0408_0000, 0x0408_0007, FULL, Device::SpPc),
        (0x0430_0000, 0x0430_000F, FULL, Device::Mi),
        (0x0440_0000, 0x0440_0037, FULL, Device::Vi),
        (0x0450_0000, 0x0450_0017, FULL, Device::Ai),
        (0x0460_0000, 0x0460_0033, FULL, Device::Pi),
        (0x0480_0000, 0x0480_001B, FULL, Device::Si),
        (0x1000_0000, 0x1FBF_FFFF, 0x0FFF_FFFF, Device::Cartridge),
        (0x1FC0_07C0, 0x1FC0_07FF, 0x3F, Device::PifRam),
    ];

    let mut bus = Bus::new(config.open_bus);
    for (start, end, mask, device) in map {
        bus.map(start, end, mask, device)?;
    }
    bus.seal();
    Ok(bus)
}

/// Every device reachable from the CPU bus
pub struct Rcp {
    pub rdram: Rdram,
    pub rsp: Rsp,
    pub mi: MipsInterface,
    pub vi: VideoInterface,
    pub ai: AudioInterface,
    pub pi: PeripheralInterface,
    pub si: SerialInterface,
    pub cartridge: Cartridge,
}

impl Rcp {
    pub fn new(config: &SystemConfig) -> Self {
        Self {
            rdram: Rdram::new(config.rdram_size.bytes()),
            rsp: Rsp::new(),
            mi: MipsInterface::new(),
            vi: VideoInterface::new(config.region),
            ai: AudioInterface::new(config.region),
            pi: PeripheralInterface::new(),
            si: SerialInterface::new(),
            cartridge: Cartridge::default(),
        }
    }

    /// Power-on reset of every device; the cartridge stays attached
    pub fn reset(&mut self) {
        self.rdram.reset();
        self.rsp.reset();
        self.mi.reset();
        self.vi.reset();
        self.ai.reset();
        self.pi.reset();
        self.si.reset();
    }

    fn read_register(&mut self, device: Device, offset: u32) -> u32 {
        match device {
            Device::SpRegisters => self.rsp.read_register(offset),
            Device::SpPc => self.rsp.read_pc_register(offset),
            Device::Mi => self.mi.read_register(offset),
            Device::Vi => self.vi.read_register(offset),
            Device::Ai => self.ai.read_register(offset),
            Device::Pi => self.pi.read_register(offset),
            Device::Si => self.si.read_register(offset),
            _ => 0,
        }
    }

    fn write_register(&mut self, device: Device, offset: u32, value: u32) {
        let Rcp {
            rdram,
            rsp,
            mi,
            vi,
            ai,
            pi,
            si,
            ..
        } = self;
        match device {
            Device::SpRegisters => rsp.write_register(offset, value, rdram, mi),
            Device::SpPc => rsp.write_pc_register(offset, value),
            Device::Mi => mi.write_register(offset, value),
            Device::Vi => vi.write_register(offset, value, mi),
            Device::Ai => ai.write_register(offset, value, mi),
            Device::Pi => pi.write_register(offset, value, mi),
            Device::Si => si.write_register(offset, value, mi),
            _ => {}
        }
    }

    pub fn serialize(&mut self, s: &mut Serializer<'_>) {
        self.rsp.serialize(s);
        self.mi.serialize(s);
        self.vi.serialize(s);
        self.ai.serialize(s);
        self.si.serialize(s);
        self.pi.serialize(s);
        self.rdram.serialize(s);
    }
}

impl AddressSpace<Device> for Rcp {
    fn read(&mut self, device: Device, offset: u32, size: AccessSize) -> u64 {
        match device {
            Device::Rdram => self.rdram.read(offset, size),
            Device::SpMemory => self.rsp.read_memory(offset, size),
            Device::Cartridge => self.cartridge.read(offset, size),
            Device::PifRam => self.si.pif.read(offset, size),
            _ => {
                let base = offset & !3;
                match size {
                    AccessSize::Byte => {
                        let word = self.read_register(device, base);
                        u64::from(word >> ((3 - (offset & 3)) * 8)) & 0xFF
                    }
                    AccessSize::Half => {
                        let word = self.read_register(device, base);
                        u64::from(word >> ((2 - (offset & 2)) * 8)) & 0xFFFF
                    }
                    AccessSize::Word => u64::from(self.read_register(device, base)),
                    AccessSize::Dword => {
                        let high = self.read_register(device, base);
                        let low = self.read_register(device, base + 4);
                        (u64::from(high) << 32) | u64::from(low)
                    }
                }
            }
        }
    }

    fn write(&mut self, device: Device, offset: u32, size: AccessSize, value: u64) {
        match device {
            Device::Rdram => self.rdram.write(offset, size, value),
            Device::SpMemory => self.rsp.write_memory(offset, size, value),
            Device::Cartridge => {
                log(LogCategory::Bus, LogLevel::Debug, || {
                    format!("write to cartridge ROM +{:07X} ignored", offset)
                });
            }
            Device::PifRam => self.si.pif.write(offset, size, value),
            _ => {
                let base = offset & !3;
                match size {
                    AccessSize::Byte => {
                        let shift = (3 - (offset & 3)) * 8;
                        self.write_register(device, base, (value as u32) << shift);
                    }
                    AccessSize::Half => {
                        let shift = (2 - (offset & 2)) * 8;
                        self.write_register(device, base, (value as u32) << shift);
                    }
                    AccessSize::Word => self.write_register(device, base, value as u32),
                    AccessSize::Dword => {
                        self.write_register(device, base, (value >> 32) as u32);
                        self.write_register(device, base + 4, value as u32);
                    }
                }
            }
        }
    }
}

/// The CPU's view of the machine: the bus plus the devices it dispatches to
pub struct Board {
    pub bus: Bus<Device>,
    pub rcp: Rcp,
}

impl Board {
    pub fn new(config: &SystemConfig) -> Result<Self, BusError> {
        Ok(Self {
            bus: build_bus(config)?,
            rcp: Rcp::new(config),
        })
    }
}

impl MemoryMips for Board {
    fn read_byte(&mut self, addr: u32) -> u8 {
        self.bus.read(&mut self.rcp, addr, AccessSize::Byte) as u8
    }

    fn read_halfword(&mut self, addr: u32) -> u16 {
        self.bus.read(&mut self.rcp, addr, AccessSize::Half) as u16
    }

    fn read_word(&mut self, addr: u32) -> u32 {
        self.bus.read(&mut self.rcp, addr, AccessSize::Word) as u32
    }

    fn read_doubleword(&mut self, addr: u32) -> u64 {
        self.bus.read(&mut self.rcp, addr, AccessSize::Dword)
    }

    fn write_byte(&mut self, addr: u32, val: u8) {
        self.bus.write(&mut self.rcp, addr, AccessSize::Byte, u64::from(val));
    }

    fn write_halfword(&mut self, addr: u32, val: u16) {
        self.bus.write(&mut self.rcp, addr, AccessSize::Half, u64::from(val));
    }

    fn write_word(&mut self, addr: u32, val: u32) {
        self.bus.write(&mut self.rcp, addr, AccessSize::Word, u64::from(val));
    }

    fn write_doubleword(&mut self, addr: u32, val: u64) {
        self.bus.write(&mut self.rcp, addr, AccessSize::Dword, val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RdramSize;
    use crate::mi::Interrupt;
    use lockstep_core::OpenBus;

    fn board() -> Board {
        Board::new(&SystemConfig::default()).unwrap()
    }

    #[test]
    fn test_map_is_sealed_and_ordered() {
        let bus = build_bus(&SystemConfig::default()).unwrap();
        assert!(bus.is_sealed());
        assert_eq!(bus.mappings().len(), 11);
        assert_eq!(bus.resolve(0x003F_FFFF), Some((Device::Rdram, 0x003F_FFFF)));
        assert_eq!(bus.resolve(0x0040_0000), None);
        assert_eq!(bus.resolve(0x0400_1004), Some((Device::SpMemory, 0x1004)));
        assert_eq!(bus.resolve(0x1000_0040), Some((Device::Cartridge, 0x40)));
        assert_eq!(bus.resolve(0x1FC0_07FF), Some((Device::PifRam, 0x3F)));
    }

    #[test]
    fn test_eight_mib_rdram() {
        let config = SystemConfig {
            rdram_size: RdramSize::EightMiB,
            ..Default::default()
        };
        let bus = build_bus(&config).unwrap();
        assert_eq!(bus.resolve(0x007F_FFFC), Some((Device::Rdram, 0x007F_FFFC)));
    }

    #[test]
    fn test_rdram_through_bus() {
        let mut board = board();
        board.write_word(0x0000_1000, 0x1234_5678);
        assert_eq!(board.read_word(0x0000_1000), 0x1234_5678);
        assert_eq!(board.read_byte(0x0000_1001), 0x34);
        assert_eq!(board.read_halfword(0x0000_1002), 0x5678);
        assert_eq!(board.rcp.rdram.read_u32(0x1000), 0x1234_5678);
    }

    #[test]
    fn test_register_lanes() {
        let mut board = board();
        // MI_VERSION
        assert_eq!(board.read_word(0x0430_0004), 0x0202_0102);
        assert_eq!(board.read_byte(0x0430_0007), 0x02);
        assert_eq!(board.read_halfword(0x0430_0006), 0x0102);
        assert_eq!(
            board.read_doubleword(0x0430_0000),
            0x0000_0000_0202_0102
        );
    }

    #[test]
    fn test_register_write_reaches_device() {
        let mut board = board();
        board.write_word(0x0430_000C, 0x0080); // MI mask: set VI
        board.rcp.mi.raise(Interrupt::VI);
        assert!(board.rcp.mi.irq_line());

        // VI_V_CURRENT write acknowledges
        board.write_word(0x0440_0010, 0);
        assert!(!board.rcp.mi.irq_line());
    }

    #[test]
    fn test_sp_memory_through_bus() {
        let mut board = board();
        board.write_word(0x0400_1000, 0xDEAD_BEEF);
        assert_eq!(board.read_word(0x0400_1000), 0xDEAD_BEEF);
        assert_eq!(board.rcp.rsp.read_memory(0x1000, AccessSize::Word), 0xDEAD_BEEF);
    }

    #[test]
    fn test_cartridge_read_only() {
        let mut board = board();
        board.rcp.cartridge = Cartridge::from_bytes(&[0xAA, 0xBB, 0xCC, 0xDD]);
        board.write_word(0x1000_0000, 0);
        assert_eq!(board.read_word(0x1000_0000), 0xAABB_CCDD);
        assert_eq!(board.read_word(0x1000_0004), 0);
    }

    #[test]
    fn test_pif_ram_through_bus() {
        let mut board = board();
        board.write_word(0x1FC0_07FC, 0x0000_0001);
        assert_eq!(board.rcp.si.pif.ram()[63], 0x01);
        assert_eq!(board.read_word(0x1FC0_07FC), 1);
    }

    #[test]
    fn test_unmapped_reads_open_bus() {
        let mut board = board();
        board.write_word(0x0000_0010, 0xCAFE_BABE);
        assert_eq!(board.read_word(0x0000_0010), 0xCAFE_BABE);
        assert_eq!(board.read_word(0x0500_0000), 0xCAFE_BABE);
        assert_eq!(board.read_byte(0x0500_0001), 0xFE);

        let config = SystemConfig {
            open_bus: OpenBus::Fixed(0x5555_AAAA),
            ..Default::default()
        };
        let mut fixed = Board::new(&config).unwrap();
        fixed.read_word(0);
        assert_eq!(fixed.read_word(0x0500_0000), 0x5555_AAAA);
    }
}
