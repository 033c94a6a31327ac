//! Clocked components.
//!
//! Every unit that participates in synchronization owns a [`Clock`]: a
//! monotonically increasing cycle counter in the unit's own clock domain plus
//! a fixed multiplier converting those cycles into master ticks. Comparing
//! timestamps (cycles × multiplier) is how the scheduler orders components
//! that run at different rates.

use crate::state::Serializer;

/// Cycle counter of one clock domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clock {
    cycles: i64,
    multiplier: u32,
}

impl Clock {
    /// Create a clock whose cycles are `multiplier` master ticks long
    pub const fn new(multiplier: u32) -> Self {
        Self {
            cycles: 0,
            multiplier,
        }
    }

    /// Cycles elapsed in this clock domain since power-on
    pub fn cycles(&self) -> i64 {
        self.cycles
    }

    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }

    /// Elapsed time in master ticks
    pub fn timestamp(&self) -> i64 {
        self.cycles * i64::from(self.multiplier)
    }

    /// Advance by `cycles` cycles of this domain
    pub fn step(&mut self, cycles: u32) {
        self.cycles += i64::from(cycles);
    }

    /// Back to cycle 0 (power-on)
    pub fn reset(&mut self) {
        self.cycles = 0;
    }

    /// Only the counter is persisted; the multiplier is fixed per component.
    pub fn serialize(&mut self, s: &mut Serializer<'_>) {
        s.integer(&mut self.cycles);
    }
}

/// A unit with its own clock that the scheduler can synchronize.
pub trait Clocked {
    /// Stable component name, used in scheduling faults and state sections
    fn name(&self) -> &'static str;

    fn clock(&self) -> &Clock;

    /// Master-tick timestamp of this component
    fn timestamp(&self) -> i64 {
        self.clock().timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_timestamp_uses_multiplier() {
        let mut cpu = Clock::new(2);
        let mut rsp = Clock::new(3);
        cpu.step(3);
        rsp.step(2);
        assert_eq!(cpu.timestamp(), 6);
        assert_eq!(rsp.timestamp(), 6);
        assert_eq!(cpu.cycles(), 3);
    }

    #[test]
    fn test_clock_reset() {
        let mut clock = Clock::new(2);
        clock.step(100);
        clock.reset();
        assert_eq!(clock.cycles(), 0);
        assert_eq!(clock.multiplier(), 2);
    }
}
