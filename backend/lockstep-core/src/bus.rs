//! Bus dispatch
//!
//! Every access is first reduced by the space's global mask, then split into native bus units.
//! Within a unit, each decode entry serves only the byte lanes in its unit mask; lanes that no
//! entry serves read open bus.

pub mod handler;
pub mod region;
pub mod space;


use crate::banking::BankWindow;
use crate::board::Board;
use crate::bus::handler::BusHandler;
use crate::bus::region::{MemoryRegion, RegionId};
use crate::bus::space::{AddressSpace, RangeEntry, SpaceId, Target};
use bincode::{Decode, Encode};
use lockstep_config::{BusWidth, CoreConfig, Endianness, OpenBusPolicy};
use std::fmt::{Display, Formatter};

const MAX_SPACE_DEPTH: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct HandlerId(pub(crate) u32);

impl HandlerId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for HandlerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

pub(crate) struct HandlerSlot {
    pub name: String,
    // Taken out while the handler runs
    pub handler: Option<Box<dyn BusHandler>>,
}

pub struct Bus {
    pub(crate) config: CoreConfig,
    pub(crate) spaces: Vec<AddressSpace>,
    pub(crate) regions: Vec<MemoryRegion>,
    pub(crate) windows: Vec<BankWindow>,
    pub(crate) handlers: Vec<HandlerSlot>,
    depth: u8,
}

impl Bus {
    pub(crate) fn new(
        config: CoreConfig,
        spaces: Vec<AddressSpace>,
        regions: Vec<MemoryRegion>,
        windows: Vec<BankWindow>,
        handlers: Vec<HandlerSlot>,
    ) -> Self {
        Self { config, spaces, regions, windows, handlers, depth: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Bit position of byte `byte` of a native unit.
#[inline]
fn byte_lane_shift(endianness: Endianness, unit_bytes: u32, byte: u32) -> u32 {
    match endianness {
        Endianness::Little => 8 * byte,
        Endianness::Big => 8 * (unit_bytes - 1 - byte),
    }
}

/// Bit position of an `access_bytes`-wide value at byte `offset` of a native unit.
#[inline]
fn access_lane_shift(endianness: Endianness, unit_bytes: u32, offset: u32, access_bytes: u32) -> u32 {
    match endianness {
        Endianness::Little => 8 * offset,
        Endianness::Big => 8 * (unit_bytes - offset - access_bytes),
    }
}

impl Board {
    #[must_use]
    pub fn space(&self, space: SpaceId) -> Option<&AddressSpace> {
        self.bus.spaces.get(space.index())
    }

    #[must_use]
    pub fn space_by_name(&self, name: &str) -> Option<SpaceId> {
        self.bus.spaces.iter().position(|space| space.name == name).map(|i| SpaceId(i as u32))
    }

    /// Read a `width`-wide value. Never fails: unmapped lanes read open bus.
    pub fn read(&mut self, space: SpaceId, address: u32, width: BusWidth) -> u32 {
        let Some(sp) = self.bus.spaces.get(space.index()) else {
            log::warn!("Read from nonexistent {space} at {address:08X}");
            return width.value_mask();
        };

        let address = address & sp.global_mask;
        let unit_width = sp.bus_width;
        let unit_bytes = unit_width.bytes();
        let endianness = sp.endianness;
        let access_bytes = width.bytes();

        if access_bytes > unit_bytes {
            let unit_bits = unit_width.bits();
            let mut value = 0_u32;
            for i in 0..access_bytes / unit_bytes {
                let part = self.read(space, address.wrapping_add(i * unit_bytes), unit_width);
                value = match endianness {
                    Endianness::Little => value | (part << (i * unit_bits)),
                    Endianness::Big => (value << unit_bits) | part,
                };
            }
            return value;
        }

        // Misaligned accesses are aligned down to the access width
        let offset = address & (unit_bytes - 1) & !(access_bytes - 1);
        let shift = access_lane_shift(endianness, unit_bytes, offset, access_bytes);
        let mem_mask = width.value_mask() << shift;
        let value = self.read_unit(space, address & !(unit_bytes - 1), mem_mask);

        (value & mem_mask) >> shift
    }

    /// Write a `width`-wide value. Never fails: writes to unmapped lanes are dropped.
    pub fn write(&mut self, space: SpaceId, address: u32, width: BusWidth, value: u32) {
        let Some(sp) = self.bus.spaces.get(space.index()) else {
            log::warn!("Write to nonexistent {space} at {address:08X}");
            return;
        };

        let address = address & sp.global_mask;
        let unit_width = sp.bus_width;
        let unit_bytes = unit_width.bytes();
        let endianness = sp.endianness;
        let access_bytes = width.bytes();
        let value = value & width.value_mask();

        if access_bytes > unit_bytes {
            let unit_bits = unit_width.bits();
            let count = access_bytes / unit_bytes;
            for i in 0..count {
                let part_shift = match endianness {
                    Endianness::Little => i * unit_bits,
                    Endianness::Big => (count - 1 - i) * unit_bits,
                };
                let part = (value >> part_shift) & unit_width.value_mask();
                self.write(space, address.wrapping_add(i * unit_bytes), unit_width, part);
            }
            return;
        }

        let offset = address & (unit_bytes - 1) & !(access_bytes - 1);
        let shift = access_lane_shift(endianness, unit_bytes, offset, access_bytes);
        let mem_mask = width.value_mask() << shift;
        self.write_unit(space, address & !(unit_bytes - 1), value << shift, mem_mask);
    }

    /// Read one native unit; `mem_mask` selects the lanes being read.
    pub fn read_unit(&mut self, space: SpaceId, unit_address: u32, mem_mask: u32) -> u32 {
        let s = space.index();
        let mut remaining = mem_mask;
        let mut value = 0;

        let count = self.bus.spaces[s].candidate_count(unit_address);
        for i in 0..count {
            let entry = self.bus.spaces[s].candidate(unit_address, i);
            if !entry.access.allows_read() || !entry.matches(unit_address) {
                continue;
            }

            let lanes = remaining & entry.unit_mask;
            if lanes == 0 {
                continue;
            }

            value |= self.read_entry(space, &entry, unit_address, lanes) & lanes;
            remaining &= !entry.unit_mask;
            if remaining == 0 {
                break;
            }
        }

        if remaining != 0 {
            self.log_unmapped(space, Direction::Read, unit_address, remaining);
            value |= self.open_bus(space) & remaining;
        }

        let sp = &mut self.bus.spaces[s];
        sp.last_value = (sp.last_value & !mem_mask) | (value & mem_mask);

        value
    }

    /// Write one native unit; lanes outside `mem_mask` are left untouched.
    pub fn write_unit(&mut self, space: SpaceId, unit_address: u32, value: u32, mem_mask: u32) {
        let s = space.index();
        let mut remaining = mem_mask;

        {
            let sp = &mut self.bus.spaces[s];
            sp.last_value = (sp.last_value & !mem_mask) | (value & mem_mask);
        }

        let count = self.bus.spaces[s].candidate_count(unit_address);
        for i in 0..count {
            let entry = self.bus.spaces[s].candidate(unit_address, i);
            if !entry.access.allows_write() || !entry.matches(unit_address) {
                continue;
            }

            let lanes = remaining & entry.unit_mask;
            if lanes == 0 {
                continue;
            }

            self.write_entry(space, &entry, unit_address, value, lanes);
            remaining &= !entry.unit_mask;
            if remaining == 0 {
                break;
            }
        }

        if remaining != 0 {
            self.log_unmapped(space, Direction::Write, unit_address, remaining);
        }
    }

    fn read_entry(&mut self, space: SpaceId, entry: &RangeEntry, unit_address: u32, lanes: u32) -> u32 {
        let offset = entry.offset(unit_address);
        match entry.target {
            Target::Memory { region, offset: base } => {
                self.read_memory(space, region, base as usize + offset as usize, lanes)
            }
            Target::Bank { window } => match self.bus.windows.get(window.index()) {
                Some(window) if offset < window.bank_size => {
                    let (region, base) = window.active_slice();
                    self.read_memory(space, region, base + offset as usize, lanes)
                }
                _ => self.open_bus(space),
            },
            Target::Handler { handler } => {
                let shift = entry.unit_mask.trailing_zeros();
                let unit_offset = offset / self.bus.spaces[space.index()].bus_width.bytes();
                match self.with_handler(handler, |h, board| h.read(board, unit_offset, lanes >> shift)) {
                    Some(value) => value << shift,
                    None => self.open_bus(space),
                }
            }
            Target::Space { space: target, base } => {
                if self.bus.depth >= MAX_SPACE_DEPTH {
                    log::warn!("Sub-space nesting too deep reading {space} at {unit_address:08X}");
                    return self.open_bus(space);
                }

                let target_address = base.wrapping_add(offset) & self.bus.spaces[target.index()].global_mask;
                self.bus.depth += 1;
                let value = self.read_unit(target, target_address, lanes);
                self.bus.depth -= 1;
                value
            }
            Target::Nop => self.open_bus(space),
        }
    }

    fn write_entry(
        &mut self,
        space: SpaceId,
        entry: &RangeEntry,
        unit_address: u32,
        value: u32,
        lanes: u32,
    ) {
        let offset = entry.offset(unit_address);
        match entry.target {
            Target::Memory { region, offset: base } => {
                self.write_memory(space, region, base as usize + offset as usize, value, lanes);
            }
            Target::Bank { window } => {
                if let Some(window) = self.bus.windows.get(window.index())
                    && offset < window.bank_size
                {
                    let (region, base) = window.active_slice();
                    self.write_memory(space, region, base + offset as usize, value, lanes);
                }
            }
            Target::Handler { handler } => {
                let shift = entry.unit_mask.trailing_zeros();
                let unit_offset = offset / self.bus.spaces[space.index()].bus_width.bytes();
                let value = (value & lanes) >> shift;
                self.with_handler(handler, |h, board| {
                    h.write(board, unit_offset, value, lanes >> shift);
                });
            }
            Target::Space { space: target, base } => {
                if self.bus.depth >= MAX_SPACE_DEPTH {
                    log::warn!("Sub-space nesting too deep writing {space} at {unit_address:08X}");
                    return;
                }

                let target_address = base.wrapping_add(offset) & self.bus.spaces[target.index()].global_mask;
                self.bus.depth += 1;
                self.write_unit(target, target_address, value, lanes);
                self.bus.depth -= 1;
            }
            Target::Nop => {}
        }
    }

    fn read_memory(&self, space: SpaceId, region: RegionId, base: usize, lanes: u32) -> u32 {
        let sp = &self.bus.spaces[space.index()];
        let unit_bytes = sp.bus_width.bytes();
        let region = &self.bus.regions[region.index()];

        let mut value = 0;
        for byte in 0..unit_bytes {
            let shift = byte_lane_shift(sp.endianness, unit_bytes, byte);
            if lanes & (0xff << shift) == 0 {
                continue;
            }

            let data = region.read_byte(base + byte as usize).unwrap_or(0xff);
            value |= u32::from(data) << shift;
        }

        value
    }

    fn write_memory(&mut self, space: SpaceId, region: RegionId, base: usize, value: u32, lanes: u32) {
        let sp = &self.bus.spaces[space.index()];
        let unit_bytes = sp.bus_width.bytes();
        let endianness = sp.endianness;
        let region = &mut self.bus.regions[region.index()];

        for byte in 0..unit_bytes {
            let shift = byte_lane_shift(endianness, unit_bytes, byte);
            if lanes & (0xff << shift) != 0 {
                region.write_byte(base + byte as usize, (value >> shift) as u8);
            }
        }
    }

    fn open_bus(&self, space: SpaceId) -> u32 {
        match self.bus.config.open_bus {
            OpenBusPolicy::AllOnes => u32::MAX,
            OpenBusPolicy::Zero => 0,
            OpenBusPolicy::LastValue => self.bus.spaces[space.index()].last_value,
        }
    }

    fn log_unmapped(&self, space: SpaceId, direction: Direction, unit_address: u32, lanes: u32) {
        let name = &self.bus.spaces[space.index()].name;
        if self.bus.config.log_unmapped {
            log::warn!("Unmapped {direction} in space '{name}' at {unit_address:08X} (lanes {lanes:08X})");
        } else {
            log::debug!("Unmapped {direction} in space '{name}' at {unit_address:08X} (lanes {lanes:08X})");
        }
    }

    /// Run `f` with a handler temporarily removed from the bus. Returns `None` if the handler is
    /// already running further up the call stack.
    pub fn with_handler<R>(
        &mut self,
        handler: HandlerId,
        f: impl FnOnce(&mut dyn BusHandler, &mut Self) -> R,
    ) -> Option<R> {
        let slot = self.bus.handlers.get_mut(handler.index())?;
        let Some(mut taken) = slot.handler.take() else {
            log::warn!("Re-entrant access to bus handler '{}'", slot.name);
            return None;
        };

        let result = f(taken.as_mut(), self);
        self.bus.handlers[handler.index()].handler = Some(taken);

        Some(result)
    }

    #[must_use]
    pub fn handler_by_name(&self, name: &str) -> Option<HandlerId> {
        self.bus.handlers.iter().position(|slot| slot.name == name).map(|i| HandlerId(i as u32))
    }

    /// Downcast a handler to its concrete type.
    #[must_use]
    pub fn handler<T: BusHandler>(&self, handler: HandlerId) -> Option<&T> {
        let handler = self.bus.handlers.get(handler.index())?.handler.as_deref()?;
        (handler as &dyn std::any::Any).downcast_ref::<T>()
    }

    pub fn handler_mut<T: BusHandler>(&mut self, handler: HandlerId) -> Option<&mut T> {
        let handler = self.bus.handlers.get_mut(handler.index())?.handler.as_deref_mut()?;
        (handler as &mut dyn std::any::Any).downcast_mut::<T>()
    }
}
