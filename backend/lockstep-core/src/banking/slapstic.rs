//! Slapstic-style protection banking
//!
//! The chip watches the addresses the CPU reads inside its window. Touching the reset address
//! arms it; after that, a read of one of the four bank addresses switches banks directly, and an
//! alternate four-step address sequence switches to a bank encoded in the address of the final
//! step. Any other access while armed disarms the chip again.

use crate::banking::WindowId;
use crate::board::Board;
use crate::bus::handler::BusHandler;
use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use lockstep_common::macros;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct MaskValue {
    pub mask: u16,
    pub value: u16,
}

impl MaskValue {
    #[must_use]
    pub const fn new(mask: u16, value: u16) -> Self {
        Self { mask, value }
    }

    #[inline]
    #[must_use]
    pub fn matches(self, offset: u16) -> bool {
        offset & self.mask == self.value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlternateSequence {
    pub steps: [MaskValue; 4],
    /// Bank number is `(offset >> bank_shift) & 3` of the final step's offset
    pub bank_shift: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlapsticConfig {
    pub reset: u16,
    pub banks: [u16; 4],
    pub alternate: Option<AlternateSequence>,
    pub initial_bank: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub enum SlapsticState {
    #[default]
    Disabled,
    Enabled,
    Alternate1,
    Alternate2,
    Alternate3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
struct SlapsticRegisters {
    state: SlapsticState,
    current_bank: u8,
}

#[derive(Debug, Clone)]
pub struct Slapstic {
    config: SlapsticConfig,
    registers: SlapsticRegisters,
}

impl Slapstic {
    #[must_use]
    pub fn new(config: SlapsticConfig) -> Self {
        Self {
            config,
            registers: SlapsticRegisters {
                state: SlapsticState::Disabled,
                current_bank: config.initial_bank & 3,
            },
        }
    }

    pub fn reset(&mut self) {
        self.registers = SlapsticRegisters {
            state: SlapsticState::Disabled,
            current_bank: self.config.initial_bank & 3,
        };
    }

    #[must_use]
    pub fn state(&self) -> SlapsticState {
        self.registers.state
    }

    #[must_use]
    pub fn current_bank(&self) -> u8 {
        self.registers.current_bank
    }

    fn alternate_step(&self, step: usize, offset: u16) -> bool {
        self.config.alternate.is_some_and(|alternate| alternate.steps[step].matches(offset))
    }

    /// Feed one accessed offset through the state machine and return the active bank.
    pub fn tweak(&mut self, offset: u16) -> u8 {
        if offset == self.config.reset {
            self.registers.state = SlapsticState::Enabled;
            return self.registers.current_bank;
        }

        let next_state = match self.registers.state {
            SlapsticState::Disabled => SlapsticState::Disabled,
            SlapsticState::Enabled => {
                if let Some(bank) = self.config.banks.iter().position(|&address| address == offset) {
                    self.registers.current_bank = bank as u8;
                    SlapsticState::Disabled
                } else if self.alternate_step(0, offset) {
                    SlapsticState::Alternate1
                } else {
                    SlapsticState::Disabled
                }
            }
            SlapsticState::Alternate1 => {
                if self.alternate_step(1, offset) {
                    SlapsticState::Alternate2
                } else {
                    SlapsticState::Disabled
                }
            }
            SlapsticState::Alternate2 => {
                if self.alternate_step(2, offset) {
                    SlapsticState::Alternate3
                } else {
                    SlapsticState::Disabled
                }
            }
            SlapsticState::Alternate3 => {
                if let Some(alternate) = self.config.alternate
                    && alternate.steps[3].matches(offset)
                {
                    self.registers.current_bank = ((offset >> alternate.bank_shift) & 3) as u8;
                }
                SlapsticState::Disabled
            }
        };

        self.registers.state = next_state;
        self.registers.current_bank
    }
}

/// Bus handler that puts a [`Slapstic`] in front of a bank window.
///
/// A read returns the window byte at `read_base + offset` from the bank that was active *before*
/// the access, then lets the chip switch banks.
#[derive(Debug, Clone)]
pub struct SlapsticHandler {
    chip: Slapstic,
    window: WindowId,
    read_base: u32,
    bank_mask: u8,
}

impl SlapsticHandler {
    #[must_use]
    pub fn new(chip: Slapstic, window: WindowId, read_base: u32, bank_mask: u8) -> Self {
        Self { chip, window, read_base, bank_mask }
    }

    #[must_use]
    pub fn chip(&self) -> &Slapstic {
        &self.chip
    }

    fn access(&mut self, board: &mut Board, offset: u32) {
        let bank = self.chip.tweak(offset as u16) & self.bank_mask;
        board.select_bank(self.window, bank.into());
    }
}

impl BusHandler for SlapsticHandler {
    fn read(&mut self, board: &mut Board, offset: u32, _mask: u32) -> u32 {
        let value = board.read_bank_byte(self.window, self.read_base + offset).unwrap_or(0xff);
        self.access(board, offset);
        value.into()
    }

    fn write(&mut self, board: &mut Board, offset: u32, _value: u32, _mask: u32) {
        self.access(board, offset);
    }

    fn reset(&mut self, board: &mut Board) {
        self.chip.reset();
        let bank = self.chip.current_bank() & self.bank_mask;
        board.select_bank(self.window, bank.into());
    }

    fn save_state(&self) -> Result<Vec<u8>, EncodeError> {
        macros::encode_to_vec(&self.chip.registers)
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        self.chip.registers = macros::decode_from_slice(bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::region::RegionKind;
    use crate::bus::space::SpaceConfig;
    use crate::machine::MachineBuilder;
    use crate::{BankMode, BusWidth, CoreConfig, Endianness};
    use test_log::test;

    const CONFIG: SlapsticConfig = SlapsticConfig {
        reset: 0x0000,
        banks: [0x0080, 0x0090, 0x00a0, 0x00b0],
        alternate: Some(AlternateSequence {
            steps: [
                MaskValue::new(0x1fff, 0x1f00),
                MaskValue::new(0x1ff0, 0x1ff0),
                MaskValue::new(0x1fff, 0x1f00),
                MaskValue::new(0x1fcf, 0x1f40),
            ],
            bank_shift: 4,
        }),
        initial_bank: 3,
    };

    #[test]
    fn direct_bank_select() {
        let mut chip = Slapstic::new(CONFIG);
        assert_eq!(chip.current_bank(), 3);

        // Bank addresses are ignored until the chip is armed
        assert_eq!(chip.tweak(0x0090), 3);

        assert_eq!(chip.tweak(0x0000), 3);
        assert_eq!(chip.state(), SlapsticState::Enabled);
        assert_eq!(chip.tweak(0x0090), 1);
        assert_eq!(chip.state(), SlapsticState::Disabled);

        // Disarmed again: another bank address does nothing
        assert_eq!(chip.tweak(0x00a0), 1);
    }

    #[test]
    fn unrelated_access_disarms() {
        let mut chip = Slapstic::new(CONFIG);
        chip.tweak(0x0000);
        chip.tweak(0x1234);
        assert_eq!(chip.state(), SlapsticState::Disabled);
        assert_eq!(chip.tweak(0x00b0), 3);
    }

    #[test]
    fn alternate_sequence() {
        let mut chip = Slapstic::new(CONFIG);
        chip.tweak(0x0000);
        chip.tweak(0x1f00);
        assert_eq!(chip.state(), SlapsticState::Alternate1);
        chip.tweak(0x1ff5);
        chip.tweak(0x1f00);
        assert_eq!(chip.state(), SlapsticState::Alternate3);

        // Bank 2 encoded in bits 4-5
        assert_eq!(chip.tweak(0x1f60), 2);
        assert_eq!(chip.state(), SlapsticState::Disabled);
    }

    #[test]
    fn handler_switches_bank_after_read() {
        // Two 0x4000-byte banks copied into a staging window, like a protected program ROM
        let mut rom = vec![0xaa; 0x8000];
        rom[0x4000..].fill(0xbb);

        let mut builder = MachineBuilder::new(CoreConfig::default());
        let rom = builder.add_region("slapstic_rom", RegionKind::Rom, rom);
        let staging = builder.add_region("window", RegionKind::Staging, vec![0; 0x4000]);
        let window = builder.add_bank_window("slapstic", rom, 0, 0x4000, 2, BankMode::Copy { staging });
        let chip = Slapstic::new(SlapsticConfig { initial_bank: 0, ..CONFIG });
        let handler = builder.add_handler("slapstic", SlapsticHandler::new(chip, window, 0x2000, 1));
        let space = builder.add_space(SpaceConfig::new("main", 16, BusWidth::Bits8, Endianness::Little));
        builder.map(space, 0x4000, 0x5fff).rom_at(staging, 0);
        builder.map(space, 0x6000, 0x7fff).read(handler);
        let mut machine = builder.build().unwrap();
        machine.reset();
        let board = machine.board_mut();

        assert_eq!(board.read(space, 0x4000, BusWidth::Bits8), 0xaa);
        assert_eq!(board.read(space, 0x6000, BusWidth::Bits8), 0xaa);
        // This read still sees bank 0, then switches to bank 1
        assert_eq!(board.read(space, 0x6090, BusWidth::Bits8), 0xaa);
        assert_eq!(board.read(space, 0x4000, BusWidth::Bits8), 0xbb);
        assert_eq!(board.read(space, 0x6001, BusWidth::Bits8), 0xbb);

        let state = board.handler::<SlapsticHandler>(handler).unwrap().chip().state();
        assert_eq!(state, SlapsticState::Disabled);
    }
}
