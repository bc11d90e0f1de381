//! TOML machine descriptions
//!
//! A description lists regions, address spaces, bank windows, scripted units, bus handlers and
//! address ranges by name; [`MachineDescription::build`] resolves the names and feeds everything
//! through [`MachineBuilder`].


use crc::Crc;
use lockstep_config::{AccessKind, BusWidth, CoreConfig, Endianness};
use lockstep_coprocessors::cop::{BufferSink, CopDma};
use lockstep_core::banking::slapstic::{
    AlternateSequence, MaskValue, Slapstic, SlapsticConfig, SlapsticHandler,
};
use lockstep_core::screen::{ScanlineInterrupt, ScreenTiming};
use lockstep_core::trace::{
    DEFAULT_RECORD_LIMIT, InterruptAck, TraceDevice, TraceInterrupt, TraceOp,
};
use lockstep_core::watchdog::Watchdog;
use lockstep_core::{
    BankMode, ClockRatio, ConfigError, FnHandler, HandlerId, Machine, MachineBuilder, RegionId,
    RegionKind, SpaceConfig, SpaceId, UnitId, WindowId,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::{fs, io};
use thiserror::Error;

const CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

#[derive(Debug, Error)]
pub enum DescriptionError {
    #[error("Error reading '{path}': {source}")]
    Io { path: String, source: io::Error },
    #[error("Error parsing machine description: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("{kind} '{name}' is declared more than once")]
    Duplicate { kind: &'static str, name: String },
    #[error("unknown {kind} '{name}'")]
    Unknown { kind: &'static str, name: String },
    #[error("region '{region}': file is {file_len:#X} bytes but the region is only {size:#X}")]
    FileTooLarge { region: String, file_len: usize, size: u32 },
    #[error("Invalid machine configuration: {0}")]
    Config(#[from] ConfigError),
}

pub type DescriptionResult<T> = Result<T, DescriptionError>;

fn one() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionDescription {
    pub name: String,
    pub kind: RegionKind,
    pub size: u32,
    #[serde(default)]
    pub fill: u8,
    /// Loaded at offset 0, relative to the description file
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpaceDescription {
    pub name: String,
    pub addr_bits: u8,
    #[serde(default)]
    pub bus_width: BusWidth,
    #[serde(default)]
    pub endianness: Endianness,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BankDescription {
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub offset: u32,
    pub bank_size: u32,
    pub bank_count: u32,
    /// Copy the selected bank into this region instead of reading the source in place
    pub staging: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase", deny_unknown_fields)]
pub enum OpDescription {
    Read {
        space: String,
        address: u32,
        #[serde(default)]
        width: BusWidth,
        cycles: u64,
    },
    Write {
        space: String,
        address: u32,
        #[serde(default)]
        width: BusWidth,
        value: u32,
        cycles: u64,
    },
    Idle {
        cycles: u64,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AckDescription {
    pub space: String,
    pub address: u32,
    #[serde(default)]
    pub width: BusWidth,
    #[serde(default)]
    pub value: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterruptDescription {
    pub line: u8,
    #[serde(default = "one")]
    pub cycles: u64,
    pub ack: Option<AckDescription>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitDescription {
    pub name: String,
    #[serde(default = "one")]
    pub multiplier: u64,
    #[serde(default = "one")]
    pub divider: u64,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub ops: Vec<OpDescription>,
    pub interrupt: Option<InterruptDescription>,
    /// Most recent trace records to keep
    #[serde(default = "default_record_limit")]
    pub record_limit: usize,
}

fn default_record_limit() -> usize {
    DEFAULT_RECORD_LIMIT
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlternateDescription {
    /// `[mask, value]` pairs
    pub steps: [[u16; 2]; 4],
    pub bank_shift: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum HandlerKind {
    /// Any write clears an interrupt line
    IrqAck { unit: String, line: u8 },
    /// Writes select bank `(value >> shift) & mask`
    BankSelect {
        window: String,
        #[serde(default)]
        shift: u32,
        #[serde(default = "all_ones")]
        mask: u32,
    },
    Watchdog { limit_frames: u32, frame_mclk: u64 },
    Slapstic {
        window: String,
        read_base: u32,
        #[serde(default = "default_bank_mask")]
        bank_mask: u8,
        reset: u16,
        banks: [u16; 4],
        alternate: Option<AlternateDescription>,
        #[serde(default)]
        initial_bank: u8,
    },
    Cop { host: String },
}

fn default_bank_mask() -> u8 {
    3
}

fn all_ones() -> u32 {
    u32::MAX
}

#[derive(Debug, Clone, Deserialize)]
pub struct HandlerDescription {
    pub name: String,
    #[serde(flatten)]
    pub kind: HandlerKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "target", rename_all = "kebab-case")]
pub enum RangeTarget {
    Ram {
        region: String,
        #[serde(default)]
        offset: u32,
    },
    Rom {
        region: String,
        #[serde(default)]
        offset: u32,
    },
    Bank {
        window: String,
    },
    Handler {
        handler: String,
    },
    Space {
        to: String,
        #[serde(default)]
        base: u32,
    },
    Nop,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RangeDescription {
    pub space: String,
    pub start: u32,
    pub end: u32,
    #[serde(default)]
    pub mirror: u32,
    pub unit_mask: Option<u32>,
    pub access: Option<AccessKind>,
    #[serde(flatten)]
    pub target: RangeTarget,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanlineInterruptDescription {
    pub unit: String,
    pub line: u8,
    pub timing: ScreenTiming,
    #[serde(default)]
    pub first_scanline: u16,
    pub step: u16,
    pub wrap: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineDescription {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub regions: Vec<RegionDescription>,
    pub spaces: Vec<SpaceDescription>,
    #[serde(default)]
    pub banks: Vec<BankDescription>,
    #[serde(default)]
    pub units: Vec<UnitDescription>,
    #[serde(default)]
    pub handlers: Vec<HandlerDescription>,
    #[serde(default)]
    pub ranges: Vec<RangeDescription>,
    #[serde(default)]
    pub scanline_interrupts: Vec<ScanlineInterruptDescription>,
}

struct Names<T> {
    kind: &'static str,
    ids: HashMap<String, T>,
}

impl<T: Copy> Names<T> {
    fn new(kind: &'static str) -> Self {
        Self { kind, ids: HashMap::new() }
    }

    fn insert(&mut self, name: &str, id: T) -> DescriptionResult<()> {
        if self.ids.insert(name.into(), id).is_some() {
            return Err(DescriptionError::Duplicate { kind: self.kind, name: name.into() });
        }
        Ok(())
    }

    fn get(&self, name: &str) -> DescriptionResult<T> {
        self.ids
            .get(name)
            .copied()
            .ok_or_else(|| DescriptionError::Unknown { kind: self.kind, name: name.into() })
    }
}

struct Resolver {
    regions: Names<RegionId>,
    spaces: Names<SpaceId>,
    windows: Names<WindowId>,
    units: Names<UnitId>,
    handlers: Names<HandlerId>,
}

impl MachineDescription {
    /// # Errors
    ///
    /// Returns an error if `s` is not a valid description.
    pub fn parse(s: &str) -> DescriptionResult<Self> {
        Ok(toml::from_str(s)?)
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid description.
    pub fn load(path: &Path) -> DescriptionResult<Self> {
        let s = fs::read_to_string(path)
            .map_err(|source| DescriptionError::Io { path: path.display().to_string(), source })?;
        Self::parse(&s)
    }

    /// Build the described machine. Region files are resolved relative to `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if a name is unknown or declared twice, a region file cannot be loaded,
    /// or the resulting machine configuration is invalid.
    pub fn build(&self, base_dir: &Path) -> DescriptionResult<Machine> {
        let mut builder = MachineBuilder::new(self.core);
        let mut names = Resolver {
            regions: Names::new("region"),
            spaces: Names::new("space"),
            windows: Names::new("bank window"),
            units: Names::new("unit"),
            handlers: Names::new("handler"),
        };

        for region in &self.regions {
            let data = load_region(region, base_dir)?;
            let id = builder.add_region(&region.name, region.kind, data);
            names.regions.insert(&region.name, id)?;
        }

        for space in &self.spaces {
            let config =
                SpaceConfig::new(&space.name, space.addr_bits, space.bus_width, space.endianness);
            let id = builder.add_space(config);
            names.spaces.insert(&space.name, id)?;
        }

        for bank in &self.banks {
            let source = names.regions.get(&bank.source)?;
            let mode = match &bank.staging {
                Some(staging) => BankMode::Copy { staging: names.regions.get(staging)? },
                None => BankMode::Indirect,
            };
            let id = builder.add_bank_window(
                &bank.name,
                source,
                bank.offset,
                bank.bank_size,
                bank.bank_count,
                mode,
            );
            names.windows.insert(&bank.name, id)?;
        }

        for unit in &self.units {
            let device = trace_device(unit, &names)?;
            let clock = ClockRatio::new(unit.multiplier, unit.divider);
            let id = builder.add_device(&unit.name, device, clock);
            if unit.suspended {
                builder.start_suspended(id);
            }
            names.units.insert(&unit.name, id)?;
        }

        for handler in &self.handlers {
            let id = add_handler(&mut builder, handler, &names)?;
            names.handlers.insert(&handler.name, id)?;
        }

        for range in &self.ranges {
            map_range(&mut builder, range, &names)?;
        }

        for interrupt in &self.scanline_interrupts {
            ScanlineInterrupt {
                timing: interrupt.timing,
                unit: names.units.get(&interrupt.unit)?,
                line: interrupt.line,
                first_scanline: interrupt.first_scanline,
                step: interrupt.step,
                wrap: interrupt.wrap,
            }
            .install(&mut builder);
        }

        Ok(builder.build()?)
    }
}

fn load_region(region: &RegionDescription, base_dir: &Path) -> DescriptionResult<Vec<u8>> {
    let mut data = vec![region.fill; region.size as usize];

    if let Some(file) = &region.file {
        let path = base_dir.join(file);
        let contents = fs::read(&path)
            .map_err(|source| DescriptionError::Io { path: path.display().to_string(), source })?;
        if contents.len() > data.len() {
            return Err(DescriptionError::FileTooLarge {
                region: region.name.clone(),
                file_len: contents.len(),
                size: region.size,
            });
        }

        data[..contents.len()].copy_from_slice(&contents);
        log::info!(
            "Loaded '{}' into region '{}' (CRC32 {:08X})",
            path.display(),
            region.name,
            CRC.checksum(&contents)
        );
    }

    Ok(data)
}

fn trace_device(unit: &UnitDescription, names: &Resolver) -> DescriptionResult<TraceDevice> {
    let ops = unit
        .ops
        .iter()
        .map(|op| -> DescriptionResult<TraceOp> {
            Ok(match *op {
                OpDescription::Read { ref space, address, width, cycles } => {
                    TraceOp::Read { space: names.spaces.get(space)?, address, width, cycles }
                }
                OpDescription::Write { ref space, address, width, value, cycles } => {
                    TraceOp::Write { space: names.spaces.get(space)?, address, width, value, cycles }
                }
                OpDescription::Idle { cycles } => TraceOp::Idle { cycles },
            })
        })
        .collect::<DescriptionResult<Vec<_>>>()?;

    let interrupt = match &unit.interrupt {
        Some(interrupt) => {
            let ack = match &interrupt.ack {
                Some(ack) => Some(InterruptAck {
                    space: names.spaces.get(&ack.space)?,
                    address: ack.address,
                    width: ack.width,
                    value: ack.value,
                }),
                None => None,
            };
            Some(TraceInterrupt { line: interrupt.line, ack, cycles: interrupt.cycles })
        }
        None => None,
    };

    Ok(TraceDevice::new(ops, interrupt).with_record_limit(unit.record_limit))
}

fn add_handler(
    builder: &mut MachineBuilder,
    handler: &HandlerDescription,
    names: &Resolver,
) -> DescriptionResult<HandlerId> {
    let name = handler.name.as_str();
    let id = match &handler.kind {
        HandlerKind::IrqAck { unit, line } => {
            builder.add_handler(name, FnHandler::irq_ack(names.units.get(unit)?, *line))
        }
        HandlerKind::BankSelect { window, shift, mask } => {
            let window = names.windows.get(window)?;
            let (shift, mask) = (*shift, *mask);
            builder.add_handler(
                name,
                FnHandler::writer(move |board, _, value, _| {
                    board.select_bank(window, (value >> shift) & mask);
                }),
            )
        }
        HandlerKind::Watchdog { limit_frames, frame_mclk } => {
            Watchdog::new(*limit_frames).install(builder, name, *frame_mclk)
        }
        HandlerKind::Slapstic { window, read_base, bank_mask, reset, banks, alternate, initial_bank } => {
            let config = SlapsticConfig {
                reset: *reset,
                banks: *banks,
                alternate: alternate.as_ref().map(|alternate| AlternateSequence {
                    steps: alternate.steps.map(|[mask, value]| MaskValue::new(mask, value)),
                    bank_shift: alternate.bank_shift,
                }),
                initial_bank: *initial_bank,
            };
            let window = names.windows.get(window)?;
            builder.add_handler(
                name,
                SlapsticHandler::new(Slapstic::new(config), window, *read_base, *bank_mask),
            )
        }
        HandlerKind::Cop { host } => {
            builder.add_handler(name, CopDma::new(names.spaces.get(host)?, BufferSink::new()))
        }
    };

    Ok(id)
}

fn map_range(
    builder: &mut MachineBuilder,
    range: &RangeDescription,
    names: &Resolver,
) -> DescriptionResult<()> {
    let space = names.spaces.get(&range.space)?;
    let mut mapping = builder.map(space, range.start, range.end).mirror(range.mirror);
    if let Some(unit_mask) = range.unit_mask {
        mapping = mapping.unit_mask(unit_mask);
    }
    if let Some(access) = range.access {
        mapping = mapping.access(access);
    }

    match &range.target {
        RangeTarget::Ram { region, offset } => mapping.ram_at(names.regions.get(region)?, *offset),
        RangeTarget::Rom { region, offset } => mapping.rom_at(names.regions.get(region)?, *offset),
        RangeTarget::Bank { window } => mapping.bank(names.windows.get(window)?),
        RangeTarget::Handler { handler } => mapping.read_write(names.handlers.get(handler)?),
        RangeTarget::Space { to, base } => mapping.space(names.spaces.get(to)?, *base),
        RangeTarget::Nop => mapping.nop(),
    }

    Ok(())
}
