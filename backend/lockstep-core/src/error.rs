use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("space '{space}': address width must be between 1 and 32 bits, was {bits}")]
    InvalidAddressBits { space: String, bits: u8 },
    #[error("space '{space}': invalid range {start:#X}-{end:#X}")]
    InvalidRange { space: String, start: u32, end: u32 },
    #[error(
        "space '{space}': range {start:#X}-{end:#X} is not aligned to the {unit_bytes}-byte bus width"
    )]
    MisalignedRange { space: String, start: u32, end: u32, unit_bytes: u32 },
    #[error("space '{space}': range {start:#X}-{end:#X} exceeds global mask {global_mask:#X}")]
    RangeOutOfBounds { space: String, start: u32, end: u32, global_mask: u32 },
    #[error(
        "space '{space}': mirror {mirror:#X} overlaps the varying address bits of range {start:#X}-{end:#X}"
    )]
    MirrorOverlapsRange { space: String, start: u32, end: u32, mirror: u32 },
    #[error("space '{space}': mirror {mirror:#X} expands to more than 65536 copies")]
    MirrorTooWide { space: String, mirror: u32 },
    #[error(
        "space '{space}': range {first_start:#X}-{first_end:#X} overlaps range {second_start:#X}-{second_end:#X}"
    )]
    OverlappingRanges {
        space: String,
        first_start: u32,
        first_end: u32,
        second_start: u32,
        second_end: u32,
    },
    #[error("space '{space}': unit mask {unit_mask:#X} is not a nonzero byte-lane mask")]
    InvalidUnitMask { space: String, unit_mask: u32 },
    #[error(
        "space '{space}': sub-space '{target}' has a different bus width than the space it is mapped into"
    )]
    SubSpaceWidthMismatch { space: String, target: String },
    #[error(
        "region '{region}' is {len:#X} bytes but range {start:#X}-{end:#X} needs {needed:#X} bytes"
    )]
    RegionTooSmall { region: String, len: usize, start: u32, end: u32, needed: usize },
    #[error("unit '{unit}': clock ratio {multiplier}/{divider} must have nonzero terms")]
    InvalidClockRatio { unit: String, multiplier: u64, divider: u64 },
    #[error("bank window '{window}': {reason}")]
    InvalidBankWindow { window: String, reason: String },
    #[error(
        "screen timing {mclk_per_scanline} ticks x {scanlines_per_frame} scanlines must have nonzero terms"
    )]
    InvalidScreenTiming { mclk_per_scanline: u64, scanlines_per_frame: u16 },
    #[error("scanline interrupt step {step} and wrap {wrap} must be nonzero")]
    InvalidScanlineStep { step: u16, wrap: u16 },
    #[error("unknown {kind} id {id}")]
    UnknownId { kind: &'static str, id: u32 },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
