//! Core engine primitives and traits.
//!
//! Machine-independent pieces shared by every system crate: clocked
//! components and the lock-step scheduler, the address-range bus, the
//! interrupt latch, the snapshot serializer, the VR4300 interpreter and
//! logging.

pub mod bus;
pub mod clock;
pub mod cpu_mips_r4300i;
pub mod interrupt;
pub mod logging;
pub mod scheduler;
pub mod state;

pub use bus::{AccessSize, AddressSpace, Bus, BusError, OpenBus};
pub use clock::{Clock, Clocked};
pub use interrupt::{InterruptLatch, InterruptVector, VectorTable};
pub use scheduler::{Lockstep, Scheduler, SchedulerError};
pub use state::{Serializable, Serializer, StateError};

pub mod types {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Frame {
        pub width: u32,
        pub height: u32,
        /// 0xAARRGGBB
        pub pixels: Vec<u32>,
    }

    impl Frame {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                pixels: vec![0; (width * height) as usize],
            }
        }
    }

    /// Interleaved stereo (left, right, left, ...)
    pub type AudioSample = i16;
}

/// A CPU-like component that can be stepped; returns cycles consumed.
pub trait Cpu {
    fn reset(&mut self);
    fn step(&mut self) -> u32;
}

/// A high-level System trait tying components together.
pub trait System {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Reset to initial power-on state
    fn reset(&mut self);

    /// Emulate until a frame is produced and return a framebuffer.
    fn step_frame(&mut self) -> Result<types::Frame, Self::Error>;

    /// Capture a binary snapshot of all emulated state.
    /// Note: snapshots do not include ROM/cartridge data.
    fn save_state(&mut self) -> Vec<u8>;

    /// Restore a snapshot produced by `save_state`.
    /// On error the running system is left untouched.
    fn load_state(&mut self, blob: &[u8]) -> Result<(), Self::Error>;

    /// Check if this system supports save/load state functionality
    fn supports_save_states(&self) -> bool {
        false // Default: no save state support
    }

    /// Drain audio produced since the last call
    fn take_audio_samples(&mut self) -> Vec<types::AudioSample> {
        Vec::new()
    }
}
