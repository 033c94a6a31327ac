//! N64-class machine built on the `lockstep_core` engine.
//!
//! - **CPU**: VR4300 (`lockstep_core::cpu_mips_r4300i`), the scheduler's driver
//! - **RSP**: scalar core + vector unit, 4 KiB DMEM / IMEM, SP DMA
//! - **RCP interfaces**: MI, VI, AI, PI, SI (+ PIF joybus)
//! - **Memory**: 4 or 8 MiB RDRAM, cartridge ROM on PI domain 1
//!
//! The CPU executes one instruction at a time; after each one every other
//! component is stepped up to the CPU's timestamp, so all of them observe the
//! same elapsed time. The MI output is fed to the CPU's IP2 input at every
//! synchronization point.

#![allow(clippy::upper_case_acronyms)]

pub mod ai;
pub mod cartridge;
pub mod config;
pub mod memory_map;
pub mod mi;
pub mod pi;
pub mod pif;
pub mod rdram;
pub mod rsp;
pub mod si;
pub mod vi;

pub use config::{ConfigError, RdramSize, Region, SystemConfig};
pub use pif::{ControllerButtons, ControllerState};

use cartridge::Cartridge;
use lockstep_core::bus::{AccessSize, AddressSpace, BusError};
use lockstep_core::clock::Clocked;
use lockstep_core::cpu_mips_r4300i::CpuMips;
use lockstep_core::logging::{log, LogCategory, LogLevel};
use lockstep_core::scheduler::{Lockstep, Scheduler, SchedulerError};
use lockstep_core::state::{self, Serializable, Serializer, StateError};
use lockstep_core::{types::AudioSample, types::Frame, System};
use memory_map::{Board, Rcp};
use pif::PORTS;
use thiserror::Error;

/// Snapshot schema version; bump whenever the traversal changes
pub const STATE_VERSION: u32 = 1;

/// MI drives the CPU's IP2 input
const RCP_INTERRUPT_LINE: u8 = 2;

#[derive(Error, Debug)]
pub enum N64Error {
    #[error("scheduler fault: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("memory map: {0}")]
    Bus(#[from] BusError),
    #[error("state rejected: {0}")]
    State(#[from] StateError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("system is powered off")]
    PoweredOff,
}

/// The CPU and everything on its bus, as the scheduler sees it
pub struct Machine {
    pub cpu: CpuMips<Board>,
}

impl Lockstep for Machine {
    fn driver_name(&self) -> &'static str {
        self.cpu.name()
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
        let Rcp {
            rdram,
            rsp,
            mi,
            vi,
            ai,
            pi,
            si,
            cartridge,
        } = &mut self.cpu.memory.rcp;

        scheduler.synchronize(rsp, frontier, |rsp| rsp.step(rdram, mi))?;
        scheduler.synchronize(vi, frontier, |vi| vi.step(rdram, mi))?;
        scheduler.synchronize(ai, frontier, |ai| ai.step(rdram, mi))?;
        scheduler.synchronize(si, frontier, |si| si.step(rdram, mi))?;
        scheduler.synchronize(pi, frontier, |pi| pi.step(rdram, cartridge, mi))?;

        let line = mi.irq_line();
        self.cpu.set_interrupt_line(RCP_INTERRUPT_LINE, line);
        Ok(())
    }

    fn frame_complete(&mut self) -> bool {
        self.cpu.memory.rcp.vi.take_frame_ready()
    }
}

/// N64 system implementation
pub struct N64System {
    config: SystemConfig,
    scheduler: Scheduler,
    machine: Machine,
    powered: bool,
    frames: u64,
    /// Controller snapshots applied at the next frame boundary
    pending_input: [Option<ControllerState>; PORTS],
}

impl N64System {
    /// Build a powered-off machine for `config`
    pub fn new(config: SystemConfig) -> Result<Self, N64Error> {
        config.apply_logging()?;
        let board = Board::new(&config)?;
        Ok(Self {
            config,
            scheduler: Scheduler::new(),
            machine: Machine {
                cpu: CpuMips::new(board),
            },
            powered: false,
            frames: 0,
            pending_input: [None; PORTS],
        })
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    /// Frames committed since power-on
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Reset every component (RDRAM included) and start the clocks at 0.
    /// An attached cartridge stays attached.
    pub fn power_on(&mut self) {
        let board = &mut self.machine.cpu.memory;
        board.bus.reset();
        board.rcp.reset();
        self.machine.cpu.reset();
        self.scheduler = Scheduler::new();
        self.frames = 0;
        self.powered = true;
        log(LogCategory::Scheduler, LogLevel::Info, || {
            format!("power on ({:?}, {:?})", self.config.region, self.config.rdram_size)
        });
    }

    /// Stop the machine. DMAs in flight are dropped; everything else keeps its
    /// last value until the next `power_on`.
    pub fn power_off(&mut self) {
        let rcp = &mut self.machine.cpu.memory.rcp;
        rcp.pi.cancel_dma();
        rcp.si.cancel_dma();
        self.powered = false;
    }

    pub fn attach_rom(&mut self, rom: &[u8]) {
        self.machine.cpu.memory.rcp.cartridge = Cartridge::from_bytes(rom);
        log(LogCategory::Bus, LogLevel::Info, || {
            format!("cartridge attached ({} bytes)", rom.len())
        });
    }

    /// Controller snapshot for `port` (0-3), picked up at the next frame
    pub fn set_controller(&mut self, port: usize, state: ControllerState) {
        if let Some(slot) = self.pending_input.get_mut(port) {
            *slot = Some(state);
        }
    }

    /// Start CPU execution at `pc` (virtual address)
    pub fn set_entry_point(&mut self, pc: u32) {
        self.machine.cpu.set_entry_point(pc);
    }

    /// Debug write through the memory map. Segment bits are stripped;
    /// unmapped bytes are skipped and the open-bus latch is not touched.
    pub fn write_memory(&mut self, addr: u32, bytes: &[u8]) {
        let board = &mut self.machine.cpu.memory;
        for (i, &byte) in bytes.iter().enumerate() {
            let addr = addr.wrapping_add(i as u32) & 0x1FFF_FFFF;
            if let Some((device, offset)) = board.bus.resolve(addr) {
                board
                    .rcp
                    .write(device, offset, AccessSize::Byte, u64::from(byte));
            }
        }
    }

    /// Debug read through the memory map; unmapped bytes read as open bus
    pub fn read_memory(&mut self, addr: u32, len: usize) -> Vec<u8> {
        let board = &mut self.machine.cpu.memory;
        (0..len)
            .map(|i| {
                let addr = addr.wrapping_add(i as u32) & 0x1FFF_FFFF;
                match board.bus.resolve(addr) {
                    Some((device, offset)) => {
                        board.rcp.read(device, offset, AccessSize::Byte) as u8
                    }
                    None => board.bus.open_bus_value(addr, AccessSize::Byte) as u8,
                }
            })
            .collect()
    }

    /// Run until the VI commits the next field
    pub fn run_frame(&mut self) -> Result<Frame, N64Error> {
        if !self.powered {
            return Err(N64Error::PoweredOff);
        }

        let pif = &mut self.machine.cpu.memory.rcp.si.pif;
        for (port, input) in self.pending_input.iter_mut().enumerate() {
            if let Some(state) = input.take() {
                pif.set_controller(port, state);
            }
        }

        self.scheduler.run_frame(&mut self.machine)?;
        self.frames += 1;

        if self.frames % 60 == 0 {
            log(LogCategory::Video, LogLevel::Info, || {
                format!("frame {} complete", self.frames)
            });
        }

        Ok(self.machine.cpu.memory.rcp.vi.frame().clone())
    }
}

impl Serializable for N64System {
    fn serialize(&mut self, s: &mut Serializer<'_>) {
        self.machine.cpu.memory.bus.serialize(s);
        self.machine.cpu.serialize(s);
        self.machine.cpu.memory.rcp.serialize(s);
        s.section("system");
        s.integer(&mut self.frames);
        s.integer(&mut self.powered);
    }
}

impl System for N64System {
    type Error = N64Error;

    fn reset(&mut self) {
        self.power_on();
    }

    fn step_frame(&mut self) -> Result<Frame, Self::Error> {
        self.run_frame()
    }

    fn save_state(&mut self) -> Vec<u8> {
        state::capture(self, STATE_VERSION)
    }

    fn load_state(&mut self, blob: &[u8]) -> Result<(), Self::Error> {
        state::restore(self, STATE_VERSION, blob).map_err(|e| {
            log(LogCategory::State, LogLevel::Warn, || {
                format!("restore rejected: {}", e)
            });
            N64Error::from(e)
        })
    }

    fn supports_save_states(&self) -> bool {
        true
    }

    fn take_audio_samples(&mut self) -> Vec<AudioSample> {
        self.machine.cpu.memory.rcp.ai.take_samples()
    }
}
