//! RDRAM and the big-endian access helpers shared by every memory-backed
//! device (RDRAM, SP DMEM/IMEM, cartridge ROM, PIF RAM).

use lockstep_core::state::Serializer;
use lockstep_core::AccessSize;

/// Read `size` bytes at `offset` as a big-endian value.
///
/// Bytes past the end of `mem` read as zero.
pub fn read_be(mem: &[u8], offset: usize, size: AccessSize) -> u64 {
    (0..size.bytes() as usize).fold(0u64, |acc, i| {
        (acc << 8) | u64::from(mem.get(offset + i).copied().unwrap_or(0))
    })
}

/// Write the low `size` bytes of `value` big-endian at `offset`.
///
/// Bytes past the end of `mem` are dropped.
pub fn write_be(mem: &mut [u8], offset: usize, size: AccessSize, value: u64) {
    let len = size.bytes() as usize;
    for i in 0..len {
        if let Some(byte) = mem.get_mut(offset + i) {
            *byte = (value >> ((len - 1 - i) * 8)) as u8;
        }
    }
}

/// Main memory
#[derive(Debug, Clone)]
pub struct Rdram {
    data: Vec<u8>,
}

impl Rdram {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn reset(&mut self) {
        self.data.fill(0);
    }

    pub fn read(&self, offset: u32, size: AccessSize) -> u64 {
        read_be(&self.data, offset as usize, size)
    }

    pub fn write(&mut self, offset: u32, size: AccessSize, value: u64) {
        write_be(&mut self.data, offset as usize, size, value);
    }

    pub fn read_u8(&self, addr: u32) -> u8 {
        self.data.get(addr as usize).copied().unwrap_or(0)
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) {
        if let Some(byte) = self.data.get_mut(addr as usize) {
            *byte = value;
        }
    }

    pub fn read_u16(&self, addr: u32) -> u16 {
        read_be(&self.data, addr as usize, AccessSize::Half) as u16
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        read_be(&self.data, addr as usize, AccessSize::Word) as u32
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) {
        write_be(&mut self.data, addr as usize, AccessSize::Word, u64::from(value));
    }

    pub fn serialize(&mut self, s: &mut Serializer<'_>) {
        s.section("rdram");
        s.array(&mut self.data);
    }
}
