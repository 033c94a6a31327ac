//! Lock-step scheduler.
//!
//! One component (the CPU) is the *driver*: it executes one instruction at a
//! time and its timestamp becomes the frontier. After every driver step each
//! other component is synchronized, i.e. stepped until its own timestamp has
//! reached the frontier. No component ever runs on a separate thread, so a
//! run is a pure function of the initial state and the inputs.

use crate::clock::Clocked;
use crate::logging::{log, LogCategory, LogLevel};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// A component stepped without advancing its clock; continuing would spin
    #[error("{component} stalled at timestamp {timestamp}")]
    Stalled {
        component: &'static str,
        timestamp: i64,
    },
}

/// A machine the scheduler can run.
///
/// The scheduler and the machine are kept as separate values so that
/// `synchronize_all` can borrow the scheduler while stepping the machine's
/// components.
pub trait Lockstep {
    /// Name of the driving component
    fn driver_name(&self) -> &'static str;

    /// Current timestamp of the driver
    fn frontier(&self) -> i64;

    /// Execute one driver step (one CPU instruction)
    fn step_driver(&mut self);

    /// Bring every other component up to `frontier`
    fn synchronize_all(
        &mut self,
        scheduler: &mut Scheduler,
        frontier: i64,
    ) -> Result<(), SchedulerError>;

    /// True once (and consumed) when a video frame has been committed
    fn frame_complete(&mut self) -> bool;
}

#[derive(Debug, Default, Clone)]
pub struct Scheduler {
    steps: u64,
    syncs: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver steps executed since construction
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Component synchronizations performed since construction
    pub fn syncs(&self) -> u64 {
        self.syncs
    }

    /// Step `component` until its timestamp reaches `frontier`.
    ///
    /// Returns the number of steps taken. A component already at or past the
    /// frontier is left alone.
    pub fn synchronize<C, F>(
        &mut self,
        component: &mut C,
        frontier: i64,
        mut step: F,
    ) -> Result<u32, SchedulerError>
    where
        C: Clocked,
        F: FnMut(&mut C),
    {
        let mut count = 0;
        while component.timestamp() < frontier {
            let before = component.timestamp();
            step(component);
            let after = component.timestamp();
            if after <= before {
                log(LogCategory::Scheduler, LogLevel::Error, || {
                    format!("{} did not advance past {}", component.name(), before)
                });
                return Err(SchedulerError::Stalled {
                    component: component.name(),
                    timestamp: after,
                });
            }
            count += 1;
        }
        self.syncs += 1;
        Ok(count)
    }

    /// Run `machine` until it commits a frame
    pub fn run_frame<M: Lockstep>(&mut self, machine: &mut M) -> Result<(), SchedulerError> {
        loop {
            let before = machine.frontier();
            machine.step_driver();
            let frontier = machine.frontier();
            if frontier <= before {
                return Err(SchedulerError::Stalled {
                    component: machine.driver_name(),
                    timestamp: frontier,
                });
            }
            self.steps += 1;

            machine.synchronize_all(self, frontier)?;

            if machine.frame_complete() {
                log(LogCategory::Scheduler, LogLevel::Trace, || {
                    format!("frame complete at {} after {} steps", frontier, self.steps)
                });
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;

    struct Ticker {
        clock: Clock,
        per_step: u32,
        ticks: u32,
    }

    impl Ticker {
        fn new(multiplier: u32, per_step: u32) -> Self {
            Self {
                clock: Clock::new(multiplier),
                per_step,
                ticks: 0,
            }
        }

        fn step(&mut self) {
            self.clock.step(self.per_step);
            self.ticks += 1;
        }
    }

    impl Clocked for Ticker {
        fn name(&self) -> &'static str {
            "ticker"
        }

        fn clock(&self) -> &Clock {
            &self.clock
        }
    }

    struct Board {
        cpu: Ticker,
        rsp: Ticker,
        video: Ticker,
        frame_at: i64,
        frame_done: bool,
    }

    impl Lockstep for Board {
        fn driver_name(&self) -> &'static str {
            "cpu"
        }

        fn frontier(&self) -> i64 {
            self.cpu.timestamp()
        }

        fn step_driver(&mut self) {
            self.cpu.step();
        }

        fn synchronize_all(
            &mut self,
            scheduler: &mut Scheduler,
            frontier: i64,
        ) -> Result<(), SchedulerError> {
            scheduler.synchronize(&mut self.rsp, frontier, Ticker::step)?;
            let frame_at = self.frame_at;
            let frame_done = &mut self.frame_done;
            scheduler.synchronize(&mut self.video, frontier, |video| {
                video.step();
                if video.timestamp() >= frame_at {
                    *frame_done = true;
                }
            })?;
            Ok(())
        }

        fn frame_complete(&mut self) -> bool {
            std::mem::take(&mut self.frame_done)
        }
    }

    #[test]
    fn test_synchronize_reaches_frontier() {
        let mut scheduler = Scheduler::new();
        let mut rsp = Ticker::new(3, 1);

        let steps = scheduler.synchronize(&mut rsp, 10, Ticker::step).unwrap();
        assert_eq!(steps, 4);
        assert_eq!(rsp.timestamp(), 12);

        // Already past the frontier: nothing to do
        let steps = scheduler.synchronize(&mut rsp, 11, Ticker::step).unwrap();
        assert_eq!(steps, 0);
        assert_eq!(scheduler.syncs(), 2);
    }

    #[test]
    fn test_synchronize_detects_stall() {
        let mut scheduler = Scheduler::new();
        let mut stuck = Ticker::new(2, 0);
        let err = scheduler
            .synchronize(&mut stuck, 4, Ticker::step)
            .unwrap_err();
        assert_eq!(
            err,
            SchedulerError::Stalled {
                component: "ticker",
                timestamp: 0
            }
        );
        assert_eq!(stuck.ticks, 1);
    }

    #[test]
    fn test_run_frame_keeps_components_in_lockstep() {
        let mut scheduler = Scheduler::new();
        let mut board = Board {
            cpu: Ticker::new(2, 1),
            rsp: Ticker::new(3, 1),
            video: Ticker::new(2, 1),
            frame_at: 100,
            frame_done: false,
        };

        scheduler.run_frame(&mut board).unwrap();

        assert_eq!(board.cpu.timestamp(), 100);
        assert!(board.rsp.timestamp() >= 100 && board.rsp.timestamp() < 103);
        assert_eq!(board.video.timestamp(), 100);
        assert_eq!(scheduler.steps(), 50);
    }

    #[test]
    fn test_run_frame_detects_stalled_driver() {
        let mut scheduler = Scheduler::new();
        let mut board = Board {
            cpu: Ticker::new(2, 0),
            rsp: Ticker::new(3, 1),
            video: Ticker::new(2, 1),
            frame_at: 100,
            frame_done: false,
        };
        assert!(matches!(
            scheduler.run_frame(&mut board),
            Err(SchedulerError::Stalled { component: "cpu", .. })
        ));
    }
}
