//! Sprite/tilemap co-processor DMA block
//!
//! The CPU programs per-channel source, size and destination registers, picks a channel, and
//! writes the trigger register. The transfer then runs to completion before the triggering write
//! returns, holding the host bus for its whole duration. A second trigger starts a key-indexed
//! table sort.
//!
//! Register map, in 16-bit words from the mapped base:
//!
//! | Word | Register |
//! |---|---|
//! | 0 | Channel select |
//! | 1 | Source (`<< 6`) of the selected channel |
//! | 2 | Size (`<< 5`) of the selected channel |
//! | 3 | Destination (`<< 6`) of the selected channel |
//! | 4 | Fade target offset (`* 0x400`) |
//! | 5 | Brightness value |
//! | 6 | Brightness mode |
//! | 7 / 8 | Fill pattern low / high word |
//! | 9 / 10 | Sort table address high / low |
//! | 11 / 12 | Sort key base high / low |
//! | 13 | Sort order |
//! | 14 | Sort trigger (written value is the entry count) |
//! | 15 | DMA trigger |

mod dma;

#[cfg(test)]
mod tests;

pub use dma::{
    BrightnessMode, DmaDescriptor, DmaTransform, SortOrder, brightness_length, fade_table,
};

use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use lockstep_common::macros;
use lockstep_core::{Board, BusHandler, SpaceId};

pub const TILEMAP_WORDS: usize = 0x1400;
pub const PALETTE_WORDS: usize = 0x800;

const CHANNELS: usize = 0x200;

/// Receives the private-buffer transfers (tilemap and palette channels).
pub trait CopSink: 'static {
    fn tilemap_word(&mut self, index: usize, value: u16);

    fn palette_word(&mut self, index: usize, value: u16);

    fn reset(&mut self) {}

    /// # Errors
    ///
    /// Returns an error if the sink state cannot be encoded.
    fn save_state(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(Vec::new())
    }

    /// # Errors
    ///
    /// Returns an error if `bytes` is not a valid sink state.
    fn load_state(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        let _ = bytes;
        Ok(())
    }
}

/// Sink that keeps the tilemap and palette buffers in memory.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct BufferSink {
    tilemap: Vec<u16>,
    palette: Vec<u16>,
}

impl BufferSink {
    #[must_use]
    pub fn new() -> Self {
        Self { tilemap: vec![0; TILEMAP_WORDS], palette: vec![0; PALETTE_WORDS] }
    }

    #[must_use]
    pub fn tilemap(&self) -> &[u16] {
        &self.tilemap
    }

    #[must_use]
    pub fn palette(&self) -> &[u16] {
        &self.palette
    }
}

impl Default for BufferSink {
    fn default() -> Self {
        Self::new()
    }
}

impl CopSink for BufferSink {
    fn tilemap_word(&mut self, index: usize, value: u16) {
        if let Some(word) = self.tilemap.get_mut(index) {
            *word = value;
        }
    }

    fn palette_word(&mut self, index: usize, value: u16) {
        if let Some(word) = self.palette.get_mut(index) {
            *word = value;
        }
    }

    fn reset(&mut self) {
        self.tilemap.fill(0);
        self.palette.fill(0);
    }

    fn save_state(&self) -> Result<Vec<u8>, EncodeError> {
        macros::encode_to_vec(self)
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        let loaded: Self = macros::decode_from_slice(bytes)?;
        if loaded.tilemap.len() != TILEMAP_WORDS || loaded.palette.len() != PALETTE_WORDS {
            return Err(DecodeError::OtherString("COP buffer sizes do not match".into()));
        }

        *self = loaded;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct CopRegisters {
    pub channel: u16,
    sources: [u16; CHANNELS],
    sizes: [u16; CHANNELS],
    destinations: [u16; CHANNELS],
    pub fade_target: u16,
    pub brightness_value: u16,
    pub brightness_mode: u16,
    pub fill_low: u16,
    pub fill_high: u16,
    pub sort_lookup: u32,
    pub sort_keys: u32,
    pub sort_order: u16,
}

impl CopRegisters {
    fn new() -> Self {
        Self {
            channel: 0,
            sources: [0; CHANNELS],
            sizes: [0; CHANNELS],
            destinations: [0; CHANNELS],
            fade_target: 0,
            brightness_value: 0,
            brightness_mode: 0,
            fill_low: 0,
            fill_high: 0,
            sort_lookup: 0,
            sort_keys: 0,
            sort_order: 0,
        }
    }

    /// Source, size and destination registers of `channel`.
    #[must_use]
    pub fn channel_registers(&self, channel: u16) -> (u16, u16, u16) {
        let i = usize::from(channel) % CHANNELS;
        (self.sources[i], self.sizes[i], self.destinations[i])
    }

    fn selected(&self) -> usize {
        usize::from(self.channel) % CHANNELS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub enum CopState {
    #[default]
    Idle,
    Armed,
    Executing,
}

#[derive(Debug, Clone, Encode, Decode)]
struct CopSnapshot {
    registers: CopRegisters,
    sink: Vec<u8>,
}

pub struct CopDma<S> {
    host: SpaceId,
    registers: CopRegisters,
    state: CopState,
    sink: S,
}

impl<S: CopSink> CopDma<S> {
    /// `host` is the space that transfers read from and write to.
    #[must_use]
    pub fn new(host: SpaceId, sink: S) -> Self {
        Self { host, registers: CopRegisters::new(), state: CopState::Idle, sink }
    }

    #[must_use]
    pub fn registers(&self) -> &CopRegisters {
        &self.registers
    }

    #[must_use]
    pub fn state(&self) -> CopState {
        self.state
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    fn run(&mut self, board: &mut Board, descriptor: Option<DmaDescriptor>) {
        self.state = CopState::Armed;

        if let Some(descriptor) = descriptor {
            self.state = CopState::Executing;
            descriptor.execute(board, self.host, &mut self.sink);
        }

        self.state = CopState::Idle;
    }

    fn read_register(&self, register: u32) -> u16 {
        let registers = &self.registers;
        match register {
            0 => registers.channel,
            1 => registers.sources[registers.selected()],
            2 => registers.sizes[registers.selected()],
            3 => registers.destinations[registers.selected()],
            4 => registers.fade_target,
            5 => registers.brightness_value,
            6 => registers.brightness_mode,
            7 => registers.fill_low,
            8 => registers.fill_high,
            9 => (registers.sort_lookup >> 16) as u16,
            10 => registers.sort_lookup as u16,
            11 => (registers.sort_keys >> 16) as u16,
            12 => registers.sort_keys as u16,
            13 => registers.sort_order,
            _ => 0,
        }
    }

    fn write_register(&mut self, board: &mut Board, register: u32, value: u16) {
        log::trace!("COP register write: {register} {value:04X}");

        let registers = &mut self.registers;
        match register {
            0 => registers.channel = value,
            1 => {
                let i = registers.selected();
                registers.sources[i] = value;
            }
            2 => {
                let i = registers.selected();
                registers.sizes[i] = value;
            }
            3 => {
                let i = registers.selected();
                registers.destinations[i] = value;
            }
            4 => registers.fade_target = value,
            5 => registers.brightness_value = value,
            6 => registers.brightness_mode = value,
            7 => registers.fill_low = value,
            8 => registers.fill_high = value,
            9 => registers.sort_lookup = (registers.sort_lookup & 0xFFFF) | (u32::from(value) << 16),
            10 => registers.sort_lookup = (registers.sort_lookup & !0xFFFF) | u32::from(value),
            11 => registers.sort_keys = (registers.sort_keys & 0xFFFF) | (u32::from(value) << 16),
            12 => registers.sort_keys = (registers.sort_keys & !0xFFFF) | u32::from(value),
            13 => registers.sort_order = value,
            14 => {
                let descriptor = DmaDescriptor::sort(registers, value);
                self.run(board, Some(descriptor));
            }
            15 => {
                let descriptor = DmaDescriptor::for_channel(registers);
                self.run(board, descriptor);
            }
            _ => log::debug!("COP write to unused register {register}: {value:04X}"),
        }
    }
}

impl<S: CopSink> BusHandler for CopDma<S> {
    fn read(&mut self, _board: &mut Board, offset: u32, mask: u32) -> u32 {
        u32::from(self.read_register(offset & 0xF)) & mask
    }

    fn write(&mut self, board: &mut Board, offset: u32, value: u32, mask: u32) {
        let register = offset & 0xF;
        let current = u32::from(self.read_register(register));
        let merged = ((current & !mask) | (value & mask)) as u16;
        self.write_register(board, register, merged);
    }

    fn reset(&mut self, _board: &mut Board) {
        self.registers = CopRegisters::new();
        self.state = CopState::Idle;
        self.sink.reset();
    }

    fn save_state(&self) -> Result<Vec<u8>, EncodeError> {
        let snapshot =
            CopSnapshot { registers: self.registers.clone(), sink: self.sink.save_state()? };
        macros::encode_to_vec(&snapshot)
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        let snapshot: CopSnapshot = macros::decode_from_slice(bytes)?;
        self.sink.load_state(&snapshot.sink)?;
        self.registers = snapshot.registers;
        self.state = CopState::Idle;
        Ok(())
    }
}
