//! PIF (Peripheral Interface) - joybus controller ports
//!
//! The CPU talks to controllers through 64 bytes of PIF RAM, mapped at
//! 0x1FC007C0-0x1FC007FF and transferred in bulk by the SI. Software fills
//! the RAM with one command block per channel; running the joybus walks
//! those blocks and writes each device's response in place.
//!
//! ## Command blocks
//!
//! Each block is `[tx_len, rx_len, command, tx args..., rx bytes...]`,
//! walked in channel order starting at channel 0:
//! - `0x00`: skip this channel
//! - `0xFD`/`0xFF`: padding, ignored
//! - `0xFE`: end of the command list
//!
//! When no device answers, bit 7 of the block's rx_len byte is set.
//!
//! Supported controller commands:
//! - **0x00 / 0xFF**: info (device type 0x0500, pak status)
//! - **0x01**: read state (buttons, stick X, stick Y)
//!
//! ## Button State Convention
//!
//! Buttons are active-high (1 = pressed). Layout of the 16-bit word:
//! - Bits 15-12: A, B, Z, Start
//! - Bits 11-8: D-Up, D-Down, D-Left, D-Right
//! - Bits 7-6: Reserved
//! - Bits 5-4: L, R
//! - Bits 3-0: C-Up, C-Down, C-Left, C-Right

use crate::rdram::{read_be, write_be};
use lockstep_core::logging::{log, LogCategory, LogLevel};
use lockstep_core::state::Serializer;
use lockstep_core::AccessSize;

pub const PIF_RAM_SIZE: usize = 64;
pub const PORTS: usize = 4;

/// Last byte of PIF RAM; bit 0 requests a joybus run
const CONTROL: usize = PIF_RAM_SIZE - 1;

/// Bit positions in the same order as [`ControllerButtons::pressed`]
const BUTTON_BITS: [u32; 14] = [15, 14, 13, 12, 11, 10, 9, 8, 5, 4, 3, 2, 1, 0];

/// N64 controller button flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerButtons {
    pub a: bool,
    pub b: bool,
    /// Z trigger
    pub z: bool,
    pub start: bool,
    pub d_up: bool,
    pub d_down: bool,
    pub d_left: bool,
    pub d_right: bool,
    /// L trigger
    pub l: bool,
    /// R trigger
    pub r: bool,
    pub c_up: bool,
    pub c_down: bool,
    pub c_left: bool,
    pub c_right: bool,
}

impl ControllerButtons {
    fn pressed(&self) -> [bool; 14] {
        [
            self.a,
            self.b,
            self.z,
            self.start,
            self.d_up,
            self.d_down,
            self.d_left,
            self.d_right,
            self.l,
            self.r,
            self.c_up,
            self.c_down,
            self.c_left,
            self.c_right,
        ]
    }

    /// Pack into the 16-bit word of a read-state response
    pub fn to_u16(&self) -> u16 {
        self.pressed()
            .iter()
            .zip(BUTTON_BITS)
            .filter(|(pressed, _)| **pressed)
            .fold(0, |acc, (_, bit)| acc | (1 << bit))
    }

    pub fn from_u16(bits: u16) -> Self {
        let held = |bit: u32| bits & (1 << bit) != 0;
        Self {
            a: held(15),
            b: held(14),
            z: held(13),
            start: held(12),
            d_up: held(11),
            d_down: held(10),
            d_left: held(9),
            d_right: held(8),
            l: held(5),
            r: held(4),
            c_up: held(3),
            c_down: held(2),
            c_left: held(1),
            c_right: held(0),
        }
    }
}

/// Controller state (buttons + analog stick)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerState {
    pub buttons: ControllerButtons,
    /// Analog stick X (-128 to 127, left to right)
    pub stick_x: i8,
    /// Analog stick Y (-128 to 127, down to up)
    pub stick_y: i8,
}

pub struct Pif {
    ram: [u8; PIF_RAM_SIZE],
    connected: [bool; PORTS],
    controllers: [ControllerState; PORTS],
}

impl Pif {
    /// A PIF with one controller plugged into port 1
    pub fn new() -> Self {
        Self {
            ram: [0; PIF_RAM_SIZE],
            connected: [true, false, false, false],
            controllers: [ControllerState::default(); PORTS],
        }
    }

    /// Clear PIF RAM; plugged-in controllers stay plugged in
    pub fn reset(&mut self) {
        self.ram = [0; PIF_RAM_SIZE];
    }

    pub fn ram(&self) -> &[u8; PIF_RAM_SIZE] {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut [u8; PIF_RAM_SIZE] {
        &mut self.ram
    }

    pub fn read(&self, offset: u32, size: AccessSize) -> u64 {
        read_be(&self.ram, (offset as usize) % PIF_RAM_SIZE, size)
    }

    pub fn write(&mut self, offset: u32, size: AccessSize, value: u64) {
        write_be(&mut self.ram, (offset as usize) % PIF_RAM_SIZE, size, value);
    }

    /// Plug in (or update) the controller on `port` (0-3)
    pub fn set_controller(&mut self, port: usize, state: ControllerState) {
        if port < PORTS {
            self.connected[port] = true;
            self.controllers[port] = state;
        }
    }

    pub fn disconnect(&mut self, port: usize) {
        if port < PORTS {
            self.connected[port] = false;
            self.controllers[port] = ControllerState::default();
        }
    }

    pub fn controller(&self, port: usize) -> Option<&ControllerState> {
        match self.connected.get(port) {
            Some(true) => self.controllers.get(port),
            _ => None,
        }
    }

    /// Execute the command blocks currently in PIF RAM
    pub fn run_joybus(&mut self) {
        let mut channel = 0;
        let mut i = 0;

        while i < CONTROL {
            let tx = self.ram[i];
            match tx {
                0x00 => {
                    channel += 1;
                    i += 1;
                    continue;
                }
                0xFE => break,
                0xFD | 0xFF => {
                    i += 1;
                    continue;
                }
                _ => {}
            }

            let rx_at = i + 1;
            if rx_at >= CONTROL {
                break;
            }
            let tx_len = usize::from(tx & 0x3F);
            let rx_len = usize::from(self.ram[rx_at] & 0x3F);
            let command_at = rx_at + 1;
            let response_at = command_at + tx_len;
            if tx_len == 0 || response_at + rx_len > CONTROL {
                log(LogCategory::Stubs, LogLevel::Debug, || {
                    format!("PIF: malformed block at {} on channel {}", i, channel)
                });
                break;
            }

            let command = self.ram[command_at];
            if !self.respond(channel, command, response_at, rx_len) {
                self.ram[rx_at] |= 0x80;
            }

            channel += 1;
            i = response_at + rx_len;
        }

        self.ram[CONTROL] &= !1;
    }

    /// Returns false when no device answers on `channel`
    fn respond(&mut self, channel: usize, command: u8, at: usize, rx_len: usize) -> bool {
        let state = match self.controller(channel) {
            Some(state) => *state,
            None => return false,
        };

        let (response, len) = match command {
            // Standard controller, no pak
            0x00 | 0xFF => ([0x05, 0x00, 0x02, 0x00], 3),
            0x01 => {
                let [hi, lo] = state.buttons.to_u16().to_be_bytes();
                ([hi, lo, state.stick_x as u8, state.stick_y as u8], 4)
            }
            _ => {
                log(LogCategory::Stubs, LogLevel::Debug, || {
                    format!("PIF: unsupported joybus command 0x{:02X}", command)
                });
                return false;
            }
        };

        let n = rx_len.min(len);
        self.ram[at..at + n].copy_from_slice(&response[..n]);
        true
    }

    pub fn serialize(&mut self, s: &mut Serializer<'_>) {
        s.section("pif");
        s.array(&mut self.ram);
        s.array(&mut self.connected);
        for controller in self.controllers.iter_mut() {
            let mut bits = controller.buttons.to_u16();
            s.integer(&mut bits);
            s.integer(&mut controller.stick_x);
            s.integer(&mut controller.stick_y);
            if s.is_loading() {
                controller.buttons = ControllerButtons::from_u16(bits);
            }
        }
    }
}

impl Default for Pif {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pressed_state() -> ControllerState {
        let mut state = ControllerState::default();
        state.buttons.a = true;
        state.buttons.start = true;
        state.stick_x = 64;
        state.stick_y = -32;
        state
    }

    #[test]
    fn test_pif_creation() {
        let pif = Pif::new();
        assert!(pif.controller(0).is_some());
        assert!(pif.controller(1).is_none());
        assert_eq!(pif.ram()[0], 0);
    }

    #[test]
    fn test_controller_buttons_packing() {
        let mut buttons = ControllerButtons::default();
        assert_eq!(buttons.to_u16(), 0);

        buttons.a = true;
        assert_eq!(buttons.to_u16(), 1 << 15);

        buttons.start = true;
        assert_eq!(buttons.to_u16(), (1 << 15) | (1 << 12));

        buttons.c_right = true;
        assert_eq!(buttons.to_u16(), (1 << 15) | (1 << 12) | 1);

        buttons.l = true;
        buttons.d_left = true;
        assert_eq!(ControllerButtons::from_u16(buttons.to_u16()), buttons);
    }

    #[test]
    fn test_ram_access_wraps() {
        let mut pif = Pif::new();
        pif.write(0x3C, AccessSize::Word, 0x1122_3344);
        assert_eq!(pif.read(0x3C, AccessSize::Word), 0x1122_3344);
        assert_eq!(pif.read(0x7C, AccessSize::Byte), 0x11);
    }

    #[test]
    fn test_joybus_read_state() {
        let mut pif = Pif::new();
        pif.set_controller(0, pressed_state());

        pif.ram_mut()[..8].copy_from_slice(&[0x01, 0x04, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE]);
        pif.ram_mut()[CONTROL] = 0x01;
        pif.run_joybus();

        assert_eq!(&pif.ram()[..8], &[0x01, 0x04, 0x01, 0x90, 0x00, 0x40, 0xE0, 0xFE]);
        assert_eq!(pif.ram()[CONTROL], 0);
    }

    #[test]
    fn test_joybus_info() {
        let mut pif = Pif::new();
        pif.ram_mut()[..6].copy_from_slice(&[0x01, 0x03, 0x00, 0xFF, 0xFF, 0xFF]);
        pif.ram_mut()[6] = 0xFE;
        pif.run_joybus();

        assert_eq!(&pif.ram()[3..6], &[0x05, 0x00, 0x02]);
    }

    #[test]
    fn test_joybus_skipped_channel_and_absent_device() {
        let mut pif = Pif::new();
        let mut state = ControllerState::default();
        state.buttons.b = true;
        pif.set_controller(0, state);

        // Channel 0 skipped, channel 1 has nothing plugged in
        let block = [0x00, 0x01, 0x04, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE];
        pif.ram_mut()[..block.len()].copy_from_slice(&block);
        pif.run_joybus();

        assert_eq!(pif.ram()[2], 0x84);
        assert_eq!(&pif.ram()[4..8], &[0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_joybus_multiple_controllers() {
        let mut pif = Pif::new();
        let mut one = ControllerState::default();
        one.buttons.a = true;
        let mut two = ControllerState::default();
        two.buttons.b = true;
        pif.set_controller(0, one);
        pif.set_controller(1, two);

        let block = [
            0xFF, 0x01, 0x04, 0x01, 0, 0, 0, 0, // channel 0, padded
            0x01, 0x04, 0x01, 0, 0, 0, 0, // channel 1
            0xFE,
        ];
        pif.ram_mut()[..block.len()].copy_from_slice(&block);
        pif.run_joybus();

        assert_eq!(u16::from_be_bytes([pif.ram()[4], pif.ram()[5]]), 1 << 15);
        assert_eq!(u16::from_be_bytes([pif.ram()[11], pif.ram()[12]]), 1 << 14);
    }

    #[test]
    fn test_disconnect() {
        let mut pif = Pif::new();
        pif.disconnect(0);
        pif.ram_mut()[..8].copy_from_slice(&[0x01, 0x04, 0x01, 0, 0, 0, 0, 0xFE]);
        pif.run_joybus();
        assert_eq!(pif.ram()[1], 0x84);
        assert!(pif.controller(0).is_none());
    }
}
