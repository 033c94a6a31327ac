//! Cartridge ROM (PI domain 1, 0x10000000-0x1FBFFFFF)
//!
//! The image is taken byte-for-byte as big-endian. It is host-provided media
//! and is not part of a snapshot.

use crate::rdram::read_be;
use lockstep_core::AccessSize;

#[derive(Debug, Clone, Default)]
pub struct Cartridge {
    rom: Vec<u8>,
}

impl Cartridge {
    pub fn from_bytes(data: &[u8]) -> Self {
        Self { rom: data.to_vec() }
    }

    pub fn is_empty(&self) -> bool {
        self.rom.is_empty()
    }

    /// ROM size in bytes
    pub fn size(&self) -> usize {
        self.rom.len()
    }

    /// Past the end of the image reads 0
    pub fn read(&self, offset: u32, size: AccessSize) -> u64 {
        read_be(&self.rom, offset as usize, size)
    }

    pub fn read_u8(&self, offset: u32) -> u8 {
        self.rom.get(offset as usize).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_rom() {
        let cart = Cartridge::from_bytes(&[0x80, 0x37, 0x12, 0x40, 0x42]);
        assert_eq!(cart.size(), 5);
        assert_eq!(cart.read(0, AccessSize::Word), 0x8037_1240);
        assert_eq!(cart.read_u8(4), 0x42);
    }

    #[test]
    fn test_read_out_of_bounds() {
        let cart = Cartridge::from_bytes(&[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(cart.read_u8(0x10000), 0);
        assert_eq!(cart.read(2, AccessSize::Word), 0x3344_0000);
        assert!(Cartridge::default().is_empty());
    }
}
