//! COP DMA transfers
//!
//! A [`DmaDescriptor`] is built from the register file when a trigger register is written, runs
//! to completion against the host bus, and is discarded.

use crate::cop::{CopRegisters, CopSink, PALETTE_WORDS, TILEMAP_WORDS};
use lockstep_common::num::BitField;
use lockstep_config::BusWidth;
use lockstep_core::{Board, SpaceId};

// Games that point the tilemap channel here actually want the buffer one page later
const TILEMAP_QUIRK_SOURCE: u32 = 0xCFC0;
const TILEMAP_QUIRK_REPLACEMENT: u32 = 0xD000;

const FILL_CHANNELS: [u16; 4] = [0x009, 0x00E, 0x116, 0x118];

/// Blend a 5-bit intensity (bits 5-9 of `v`) by a 5-bit weight (bits 0-4).
#[inline]
#[must_use]
pub fn fade_table(v: u32) -> u32 {
    let low = v & 0x001F;
    let high = v & 0x03E0;
    (low * (high | (high >> 5)) + 0x210) >> 10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrightnessMode {
    /// Channels read from bits 10-14 / 5-9 / 0-4, weights taken from the value register directly;
    /// colors with bit 15 set are left alone
    Five,
    /// Channels used as raw 5-bit values, weights are twice the value register
    Four,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Descending,
    Ascending,
    Unchanged,
}

impl SortOrder {
    fn from_register(value: u16) -> Self {
        match value {
            1 => Self::Descending,
            2 => Self::Ascending,
            _ => Self::Unchanged,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaTransform {
    /// Host words to the sink's tilemap buffer
    TilemapUnpack,
    /// Host words to the sink's palette buffer
    PaletteCopy,
    /// Blend each source color toward the color `target_offset` bytes further on, writing the
    /// result back to the host bus
    PaletteBrightness { mode: BrightnessMode, value: u16, target_offset: u32 },
    /// Brightness channel with an unsupported mode: colors are copied unchanged
    RawCopy,
    /// Repeat a 32-bit pattern
    Fill { pattern: u32 },
    /// Reorder a table of 16-bit values by the keys they point at
    Sort { order: SortOrder, key_base: u32 },
}

/// One transfer. `length` counts 16-bit words, except for fills (32-bit units) and sorts (table
/// entries).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaDescriptor {
    pub source: u32,
    pub destination: u32,
    pub length: u32,
    pub transform: DmaTransform,
}

/// Word count of a brightness transfer, or `None` if the size and destination registers
/// disagree so badly that the count would be negative.
#[must_use]
pub fn brightness_length(size: u16, destination: u16) -> Option<u32> {
    let words = ((i64::from(size) << 5) - (i64::from(destination) << 6) + 0x20) / 2;
    u32::try_from(words).ok()
}

impl DmaDescriptor {
    /// Descriptor for the currently selected DMA channel, or `None` if the channel is unknown or
    /// its registers fail the channel's sanity check.
    #[must_use]
    pub fn for_channel(registers: &CopRegisters) -> Option<Self> {
        let channel = registers.channel;
        let (source_reg, size_reg, destination_reg) = registers.channel_registers(channel);
        let source = u32::from(source_reg) << 6;
        let destination = u32::from(destination_reg) << 6;

        match channel {
            0x014 => {
                let source =
                    if source == TILEMAP_QUIRK_SOURCE { TILEMAP_QUIRK_REPLACEMENT } else { source };
                Some(Self {
                    source,
                    destination: 0,
                    length: TILEMAP_WORDS as u32,
                    transform: DmaTransform::TilemapUnpack,
                })
            }
            0x015 => Some(Self {
                source,
                destination: 0,
                length: PALETTE_WORDS as u32,
                transform: DmaTransform::PaletteCopy,
            }),
            0x080..=0x087 => {
                let Some(length) = brightness_length(size_reg, destination_reg) else {
                    log::debug!(
                        "COP brightness DMA skipped: size {size_reg:04X} / destination {destination_reg:04X} give a negative count"
                    );
                    return None;
                };

                let transform = match registers.brightness_mode {
                    5 => DmaTransform::PaletteBrightness {
                        mode: BrightnessMode::Five,
                        value: registers.brightness_value,
                        target_offset: u32::from(registers.fade_target) * 0x400,
                    },
                    4 => DmaTransform::PaletteBrightness {
                        mode: BrightnessMode::Four,
                        value: registers.brightness_value,
                        target_offset: u32::from(registers.fade_target) * 0x400,
                    },
                    mode => {
                        log::warn!("COP palette brightness DMA used with mode {mode:02X}; copying raw");
                        DmaTransform::RawCopy
                    }
                };

                Some(Self { source, destination, length, transform })
            }
            channel if FILL_CHANNELS.contains(&channel) => {
                if destination_reg != 0 {
                    log::debug!("COP fill DMA skipped: destination register is {destination_reg:04X}");
                    return None;
                }

                let pattern =
                    u32::from(registers.fill_low) | (u32::from(registers.fill_high) << 16);
                Some(Self {
                    source,
                    destination: source,
                    length: (u32::from(size_reg) + 1) << 3,
                    transform: DmaTransform::Fill { pattern },
                })
            }
            _ => {
                log::warn!("COP DMA triggered on unsupported channel {channel:03X}");
                None
            }
        }
    }

    #[must_use]
    pub fn sort(registers: &CopRegisters, count: u16) -> Self {
        Self {
            source: registers.sort_lookup,
            destination: registers.sort_lookup,
            length: count.into(),
            transform: DmaTransform::Sort {
                order: SortOrder::from_register(registers.sort_order),
                key_base: registers.sort_keys,
            },
        }
    }

    pub fn execute<S: CopSink>(&self, board: &mut Board, host: SpaceId, sink: &mut S) {
        log::trace!("COP DMA: {self:X?}");

        match self.transform {
            DmaTransform::TilemapUnpack => {
                for i in 0..self.length {
                    let value = read_word(board, host, self.source.wrapping_add(2 * i));
                    sink.tilemap_word(i as usize, value);
                }
            }
            DmaTransform::PaletteCopy => {
                for i in 0..self.length {
                    let value = read_word(board, host, self.source.wrapping_add(2 * i));
                    sink.palette_word(i as usize, value);
                }
            }
            DmaTransform::PaletteBrightness { mode, value, target_offset } => {
                for i in 0..self.length {
                    let source = self.source.wrapping_add(2 * i);
                    let target = source.wrapping_add(target_offset);
                    let color = match mode {
                        BrightnessMode::Five => brightness_mode_5(board, host, source, target, value),
                        BrightnessMode::Four => brightness_mode_4(board, host, source, target, value),
                    };
                    write_word(board, host, self.destination.wrapping_add(2 * i), color);
                }
            }
            DmaTransform::RawCopy => {
                for i in 0..self.length {
                    let color = read_word(board, host, self.source.wrapping_add(2 * i));
                    write_word(board, host, self.destination.wrapping_add(2 * i), color);
                }
            }
            DmaTransform::Fill { pattern } => {
                for i in 0..self.length {
                    board.write(host, self.destination.wrapping_add(4 * i), BusWidth::Bits32, pattern);
                }
            }
            DmaTransform::Sort { order, key_base } => self.sort_table(board, host, order, key_base),
        }
    }

    fn sort_table(&self, board: &mut Board, host: SpaceId, order: SortOrder, key_base: u32) {
        let mut entries: Vec<(u16, u16)> = (0..self.length)
            .map(|i| {
                let value = read_word(board, host, self.source.wrapping_add(2 * i));
                let key = read_word(board, host, key_base.wrapping_add(value.into()));
                (key, value)
            })
            .collect();

        // Stable, so equal keys keep their table order
        match order {
            SortOrder::Descending => entries.sort_by(|a, b| b.0.cmp(&a.0)),
            SortOrder::Ascending => entries.sort_by(|a, b| a.0.cmp(&b.0)),
            SortOrder::Unchanged => {}
        }

        for (i, &(_, value)) in (0..self.length).zip(&entries) {
            write_word(board, host, self.destination.wrapping_add(2 * i), value);
        }
    }
}

fn read_word(board: &mut Board, host: SpaceId, address: u32) -> u16 {
    board.read(host, address, BusWidth::Bits16) as u16
}

fn write_word(board: &mut Board, host: SpaceId, address: u32, value: u16) {
    board.write(host, address, BusWidth::Bits16, value.into());
}

fn blend(color: u32, target: u32, weight: u32) -> u32 {
    (fade_table(color | (weight ^ 0x1F)) + fade_table(target | weight)) & 0x1F
}

fn brightness_mode_5(board: &mut Board, host: SpaceId, source: u32, target: u32, value: u16) -> u16 {
    let color = read_word(board, host, source);
    if color.bit(15) {
        return color;
    }

    let target = u32::from(read_word(board, host, target));
    let color = u32::from(color);
    let weight = u32::from(value);

    let b = blend((color & 0x7C00) >> 5, (target & 0x7C00) >> 5, weight);
    let g = blend(color & 0x03E0, target & 0x03E0, weight);
    let r = blend((color & 0x001F) << 5, (target & 0x001F) << 5, weight);

    ((b << 10) | (g << 5) | r) as u16
}

fn brightness_mode_4(board: &mut Board, host: SpaceId, source: u32, target: u32, value: u16) -> u16 {
    let channels = |c: u16| {
        (u32::from(c.field(10..=14)), u32::from(c.field(5..=9)), u32::from(c.field(0..=4)))
    };
    let (bt, gt, rt) = channels(read_word(board, host, target));
    let (b, g, r) = channels(read_word(board, host, source));

    if value == 0x10 || value == 0xFFFF {
        return ((bt << 10) | (gt << 5) | rt) as u16;
    }

    let weight = u32::from(value) * 2;
    let b = blend(b << 5, bt << 5, weight);
    let g = blend(g << 5, gt << 5, weight);
    let r = blend(r << 5, rt << 5, weight);

    ((b << 10) | (g << 5) | r) as u16
}
