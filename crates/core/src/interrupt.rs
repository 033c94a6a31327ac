//! Interrupt latch and priority resolution.
//!
//! Peripherals set bits in the [`InterruptLatch`]; the CPU's acknowledge path
//! takes the highest-priority enabled bit (clearing it) and jumps to the
//! address listed for it in the [`VectorTable`].

use crate::state::Serializer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptVector {
    /// Interrupt line (bit index in the latch)
    pub line: u8,
    pub name: &'static str,
    /// Service address
    pub address: u32,
}

/// Fixed, priority-ordered vector list (highest first)
#[derive(Debug, Clone, Copy)]
pub struct VectorTable {
    entries: &'static [InterruptVector],
}

/// General exception vector (Status.BEV clear)
pub const GENERAL_VECTOR: u32 = 0x8000_0180;

const fn general(line: u8, name: &'static str) -> InterruptVector {
    InterruptVector {
        line,
        name,
        address: GENERAL_VECTOR,
    }
}

/// VR4300 Cause.IP lines. All of them share the general exception vector;
/// the table only fixes the order in which simultaneous lines are taken.
pub const VR4300_VECTORS: VectorTable = VectorTable {
    entries: &[
        general(7, "timer"),
        general(6, "ip6"),
        general(5, "ip5"),
        general(4, "pre-nmi"),
        general(3, "cartridge"),
        general(2, "rcp"),
        general(1, "software1"),
        general(0, "software0"),
    ],
};

impl VectorTable {
    pub const fn new(entries: &'static [InterruptVector]) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &'static [InterruptVector] {
        self.entries
    }

    /// Highest-priority vector whose line is set in `lines`
    pub fn highest(&self, lines: u32) -> Option<InterruptVector> {
        self.entries
            .iter()
            .find(|v| lines & (1 << v.line) != 0)
            .copied()
    }
}

/// Pending, not yet serviced interrupt lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptLatch {
    pending: u32,
}

impl InterruptLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&mut self, line: u8) {
        self.pending |= 1 << line;
    }

    pub fn clear(&mut self, line: u8) {
        self.pending &= !(1 << line);
    }

    pub fn is_pending(&self, line: u8) -> bool {
        self.pending & (1 << line) != 0
    }

    pub fn pending(&self) -> u32 {
        self.pending
    }

    /// Acknowledge the highest-priority line that is pending and enabled.
    ///
    /// The taken line is cleared; every other pending line stays latched for
    /// the next check.
    pub fn take_highest(&mut self, table: &VectorTable, enabled: u32) -> Option<InterruptVector> {
        let vector = table.highest(self.pending & enabled)?;
        self.clear(vector.line);
        Some(vector)
    }

    pub fn reset(&mut self) {
        self.pending = 0;
    }

    pub fn serialize(&mut self, s: &mut Serializer<'_>) {
        s.integer(&mut self.pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let mut latch = InterruptLatch::new();
        latch.raise(2);
        latch.raise(7);

        let first = latch.take_highest(&VR4300_VECTORS, 0xFF).unwrap();
        assert_eq!(first.line, 7);
        assert_eq!(first.address, 0x8000_0180);
        assert!(latch.is_pending(2));

        let second = latch.take_highest(&VR4300_VECTORS, 0xFF).unwrap();
        assert_eq!(second.line, 2);
        assert_eq!(latch.take_highest(&VR4300_VECTORS, 0xFF), None);
    }

    #[test]
    fn test_masked_lines_stay_pending() {
        let mut latch = InterruptLatch::new();
        latch.raise(7);
        latch.raise(3);

        let taken = latch.take_highest(&VR4300_VECTORS, 1 << 3).unwrap();
        assert_eq!(taken.name, "cartridge");
        assert!(latch.is_pending(7));
        assert!(!latch.is_pending(3));
    }

    #[test]
    fn test_custom_table() {
        static ENTRIES: [InterruptVector; 2] = [
            InterruptVector { line: 0, name: "nmi", address: 0x100 },
            InterruptVector { line: 5, name: "irq", address: 0x200 },
        ];
        let table = VectorTable::new(&ENTRIES);
        assert_eq!(table.highest(0b10_0001).map(|v| v.address), Some(0x100));
        assert_eq!(table.highest(0b10_0000).map(|v| v.address), Some(0x200));
        assert_eq!(table.highest(0b00_0010), None);
    }
}
