//! Address-range bus dispatch.
//!
//! A [`Bus`] owns nothing but its mapping table and the open-bus latch. The
//! devices themselves live in an [`AddressSpace`] owned by the machine, which
//! the bus forwards each access to after resolving the owning device and
//! masking the address down to the device's local offset.

use crate::logging::{log, LogCategory, LogLevel};
use crate::state::Serializer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("mapping {start:08X}-{end:08X} overlaps an existing mapping")]
    Overlap { start: u32, end: u32 },
    #[error("mapping {start:08X}-{end:08X} is empty or reversed")]
    InvalidRange { start: u32, end: u32 },
    #[error("bus is sealed; mappings can only be added before power-on")]
    Sealed,
}

/// Width of a single bus access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSize {
    Byte,
    Half,
    Word,
    Dword,
}

impl AccessSize {
    pub fn bytes(self) -> u32 {
        match self {
            AccessSize::Byte => 1,
            AccessSize::Half => 2,
            AccessSize::Word => 4,
            AccessSize::Dword => 8,
        }
    }

    /// Mask selecting the low `bytes()` bytes of a value
    pub fn mask(self) -> u64 {
        match self {
            AccessSize::Byte => 0xFF,
            AccessSize::Half => 0xFFFF,
            AccessSize::Word => 0xFFFF_FFFF,
            AccessSize::Dword => u64::MAX,
        }
    }
}

/// What an unmapped read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenBus {
    /// The last word driven by a mapped access (`initial` before any access)
    LastDriven { initial: u32 },
    /// Always the same pattern
    Fixed(u32),
}

impl Default for OpenBus {
    fn default() -> Self {
        OpenBus::LastDriven { initial: 0 }
    }
}

/// The devices behind a bus.
///
/// `offset` is already local to the device. Data is big-endian and
/// right-aligned in the returned/passed `u64`.
pub trait AddressSpace<D> {
    fn read(&mut self, device: D, offset: u32, size: AccessSize) -> u64;
    fn write(&mut self, device: D, offset: u32, size: AccessSize, value: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping<D> {
    pub start: u32,
    /// Inclusive
    pub end: u32,
    /// Applied to `addr - start` to form the device offset
    pub mask: u32,
    pub device: D,
}

impl<D> Mapping<D> {
    fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr <= self.end
    }
}

#[derive(Debug, Clone)]
pub struct Bus<D> {
    mappings: Vec<Mapping<D>>,
    sealed: bool,
    open_bus: OpenBus,
    last_driven: u32,
}

impl<D: Copy + std::fmt::Debug> Bus<D> {
    pub fn new(open_bus: OpenBus) -> Self {
        let last_driven = match open_bus {
            OpenBus::LastDriven { initial } => initial,
            OpenBus::Fixed(pattern) => pattern,
        };
        Self {
            mappings: Vec::new(),
            sealed: false,
            open_bus,
            last_driven,
        }
    }

    /// Register `start..=end` for `device`
    pub fn map(&mut self, start: u32, end: u32, mask: u32, device: D) -> Result<(), BusError> {
        if self.sealed {
            return Err(BusError::Sealed);
        }
        if end < start {
            return Err(BusError::InvalidRange { start, end });
        }
        if self
            .mappings
            .iter()
            .any(|m| start <= m.end && end >= m.start)
        {
            return Err(BusError::Overlap { start, end });
        }

        let index = self.mappings.partition_point(|m| m.start < start);
        self.mappings.insert(
            index,
            Mapping {
                start,
                end,
                mask,
                device,
            },
        );
        Ok(())
    }

    /// Freeze the mapping table
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn mappings(&self) -> &[Mapping<D>] {
        &self.mappings
    }

    /// Owning device and local offset of `addr`
    pub fn resolve(&self, addr: u32) -> Option<(D, u32)> {
        let index = self.mappings.partition_point(|m| m.end < addr);
        self.mappings
            .get(index)
            .filter(|m| m.contains(addr))
            .map(|m| (m.device, addr.wrapping_sub(m.start) & m.mask))
    }

    pub fn read<S: AddressSpace<D>>(&mut self, space: &mut S, addr: u32, size: AccessSize) -> u64 {
        match self.resolve(addr) {
            Some((device, offset)) => {
                let value = space.read(device, offset, size) & size.mask();
                self.drive(addr, size, value);
                value
            }
            None => {
                let value = self.open_bus_value(addr, size);
                log(LogCategory::Bus, LogLevel::Debug, || {
                    format!("open-bus read {:?} at {:08X} -> {:X}", size, addr, value)
                });
                value
            }
        }
    }

    pub fn write<S: AddressSpace<D>>(
        &mut self,
        space: &mut S,
        addr: u32,
        size: AccessSize,
        value: u64,
    ) {
        let value = value & size.mask();
        match self.resolve(addr) {
            Some((device, offset)) => {
                space.write(device, offset, size, value);
                self.drive(addr, size, value);
            }
            None => {
                log(LogCategory::Bus, LogLevel::Debug, || {
                    format!("dropped write {:?} at {:08X} = {:X}", size, addr, value)
                });
            }
        }
    }

    /// The value an unmapped read of `size` at `addr` returns
    pub fn open_bus_value(&self, addr: u32, size: AccessSize) -> u64 {
        let word = match self.open_bus {
            OpenBus::LastDriven { .. } => self.last_driven,
            OpenBus::Fixed(pattern) => pattern,
        };
        match size {
            AccessSize::Byte => u64::from(word >> ((3 - (addr & 3)) * 8)) & 0xFF,
            AccessSize::Half => u64::from(word >> ((2 - (addr & 2)) * 8)) & 0xFFFF,
            AccessSize::Word => u64::from(word),
            AccessSize::Dword => (u64::from(word) << 32) | u64::from(word),
        }
    }

    pub fn last_driven(&self) -> u32 {
        self.last_driven
    }

    /// Back to the power-on latch value
    pub fn reset(&mut self) {
        self.last_driven = match self.open_bus {
            OpenBus::LastDriven { initial } => initial,
            OpenBus::Fixed(pattern) => pattern,
        };
    }

    /// Latch the word lane(s) a mapped access drove
    fn drive(&mut self, addr: u32, size: AccessSize, value: u64) {
        self.last_driven = match size {
            AccessSize::Byte => (value as u32) << ((3 - (addr & 3)) * 8),
            AccessSize::Half => (value as u32) << ((2 - (addr & 2)) * 8),
            AccessSize::Word | AccessSize::Dword => value as u32,
        };
    }

    pub fn serialize(&mut self, s: &mut Serializer<'_>) {
        s.section("bus");
        s.integer(&mut self.last_driven);
    }
}
