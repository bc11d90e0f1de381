//! Machine construction
//!
//! Everything about a machine is declared up front through [`MachineBuilder`]: memory regions,
//! address spaces and their ranges, bank windows, bus handlers, execution units, timer callbacks
//! and hooks. [`MachineBuilder::build`] validates the whole description and produces a
//! [`Machine`] whose decode tables never change afterwards.

use crate::banking::{BankMode, BankWindow, WindowId};
use crate::board::Board;
use crate::bus::handler::{BusHandler, FnHandler};
use crate::bus::region::{MemoryRegion, RegionId, RegionKind};
use crate::bus::space::{AddressSpace, RangeEntry, SpaceConfig, SpaceId, Target};
use crate::bus::{Bus, HandlerId, HandlerSlot};
use crate::device::{ClockRatio, Device, UnitId};
use crate::error::{ConfigError, ConfigResult};
use crate::scheduler::ExecutionUnit;
use crate::timer::{CallbackId, TimerHandle, TimerQueue, TimerTarget};
use lockstep_config::{AccessKind, BusWidth, CoreConfig};
use std::any::Any;

pub type TimerCallback = Box<dyn FnMut(&mut Board, TimerHandle, u64)>;
pub type Hook = Box<dyn FnMut(&mut Board)>;

pub struct MachineBuilder {
    config: CoreConfig,
    regions: Vec<MemoryRegion>,
    spaces: Vec<(SpaceConfig, Vec<RangeEntry>)>,
    windows: Vec<BankWindow>,
    handlers: Vec<HandlerSlot>,
    units: Vec<ExecutionUnit>,
    callbacks: Vec<TimerCallback>,
    timers: TimerQueue,
    post_load_hooks: Vec<Hook>,
    reset_hooks: Vec<Hook>,
    errors: Vec<ConfigError>,
}

impl MachineBuilder {
    #[must_use]
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            regions: Vec::new(),
            spaces: Vec::new(),
            windows: Vec::new(),
            handlers: Vec::new(),
            units: Vec::new(),
            callbacks: Vec::new(),
            timers: TimerQueue::new(),
            post_load_hooks: Vec::new(),
            reset_hooks: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn add_region(&mut self, name: impl Into<String>, kind: RegionKind, data: Vec<u8>) -> RegionId {
        self.regions.push(MemoryRegion::new(name.into(), kind, data));
        RegionId((self.regions.len() - 1) as u32)
    }

    pub fn add_space(&mut self, config: SpaceConfig) -> SpaceId {
        self.spaces.push((config, Vec::new()));
        SpaceId((self.spaces.len() - 1) as u32)
    }

    pub fn add_bank_window(
        &mut self,
        name: impl Into<String>,
        source: RegionId,
        source_offset: u32,
        bank_size: u32,
        bank_count: u32,
        mode: BankMode,
    ) -> WindowId {
        self.windows.push(BankWindow {
            name: name.into(),
            source,
            source_offset,
            bank_size,
            bank_count,
            selected: 0,
            mode,
        });
        WindowId((self.windows.len() - 1) as u32)
    }

    pub fn add_handler(&mut self, name: impl Into<String>, handler: impl BusHandler) -> HandlerId {
        self.add_boxed_handler(name, Box::new(handler))
    }

    pub fn add_boxed_handler(
        &mut self,
        name: impl Into<String>,
        handler: Box<dyn BusHandler>,
    ) -> HandlerId {
        self.handlers.push(HandlerSlot { name: name.into(), handler: Some(handler) });
        HandlerId((self.handlers.len() - 1) as u32)
    }

    /// Register an execution unit. Its local clock runs at `clock` relative to the master clock.
    pub fn add_device(
        &mut self,
        name: impl Into<String>,
        device: impl Device,
        clock: ClockRatio,
    ) -> UnitId {
        self.add_boxed_device(name, Box::new(device), clock)
    }

    pub fn add_boxed_device(
        &mut self,
        name: impl Into<String>,
        device: Box<dyn Device>,
        clock: ClockRatio,
    ) -> UnitId {
        self.units.push(ExecutionUnit::new(name.into(), device, clock));
        UnitId((self.units.len() - 1) as u32)
    }

    /// Keep a unit halted from power-on until something resumes it.
    pub fn start_suspended(&mut self, unit: UnitId) {
        match self.units.get_mut(unit.index()) {
            Some(unit) => unit.set_start_suspended(),
            None => self.errors.push(ConfigError::UnknownId { kind: "unit", id: unit.0 }),
        }
    }

    /// Record a configuration problem found while declaring a component; `build` reports it.
    pub fn reject(&mut self, error: ConfigError) {
        self.errors.push(error);
    }

    pub fn add_timer_callback(
        &mut self,
        callback: impl FnMut(&mut Board, TimerHandle, u64) + 'static,
    ) -> CallbackId {
        self.callbacks.push(Box::new(callback));
        CallbackId((self.callbacks.len() - 1) as u32)
    }

    /// Arm a timer at power-on, `delay` master ticks after time 0.
    pub fn add_timer(
        &mut self,
        target: TimerTarget,
        delay: u64,
        interval: u64,
        param: u64,
    ) -> TimerHandle {
        self.timers.schedule(target, delay, interval, param)
    }

    /// Allocate a persistent timer that starts disarmed.
    pub fn allocate_timer(&mut self, target: TimerTarget, param: u64) -> TimerHandle {
        self.timers.allocate(target, param)
    }

    /// Run after a save state has been applied, once bank selections have been replayed.
    pub fn add_post_load_hook(&mut self, hook: impl FnMut(&mut Board) + 'static) {
        self.post_load_hooks.push(Box::new(hook));
    }

    /// Run at the end of every soft reset.
    pub fn add_reset_hook(&mut self, hook: impl FnMut(&mut Board) + 'static) {
        self.reset_hooks.push(Box::new(hook));
    }

    /// Start declaring a range `[start, end]` in `space`.
    pub fn map(&mut self, space: SpaceId, start: u32, end: u32) -> RangeBuilder<'_> {
        RangeBuilder { builder: self, space, start, end, mirror: 0, unit_mask: None, access: None }
    }

    fn push_entry(&mut self, space: SpaceId, entry: RangeEntry) {
        match self.spaces.get_mut(space.index()) {
            Some((_, entries)) => entries.push(entry),
            None => self.errors.push(ConfigError::UnknownId { kind: "space", id: space.0 }),
        }
    }

    fn space_width(&self, space: SpaceId) -> BusWidth {
        self.spaces.get(space.index()).map_or(BusWidth::Bits32, |(config, _)| config.bus_width)
    }

    fn validate_window(&self, window: &BankWindow) -> ConfigResult<()> {
        let invalid = |reason: String| ConfigError::InvalidBankWindow {
            window: window.name.clone(),
            reason,
        };

        if window.bank_size == 0 || window.bank_count == 0 {
            return Err(invalid("bank size and count must be nonzero".into()));
        }

        let Some(source) = self.regions.get(window.source.index()) else {
            return Err(ConfigError::UnknownId { kind: "region", id: window.source.0 });
        };

        let needed = window.source_offset as usize
            + window.bank_size as usize * window.bank_count as usize;
        if source.len() < needed {
            return Err(invalid(format!(
                "source region '{}' is {:#X} bytes, banks need {needed:#X}",
                source.name(),
                source.len()
            )));
        }

        if let BankMode::Copy { staging } = window.mode {
            if staging == window.source {
                return Err(invalid("staging region cannot be the source region".into()));
            }

            let Some(staging) = self.regions.get(staging.index()) else {
                return Err(ConfigError::UnknownId { kind: "region", id: staging.0 });
            };

            if staging.len() < window.bank_size as usize {
                return Err(invalid(format!(
                    "staging region '{}' is smaller than the bank size {:#X}",
                    staging.name(),
                    window.bank_size
                )));
            }
        }

        Ok(())
    }

    fn validate_entry(&self, config: &SpaceConfig, entry: &RangeEntry) -> ConfigResult<()> {
        match entry.target {
            Target::Memory { region, offset } => {
                let Some(memory) = self.regions.get(region.index()) else {
                    return Err(ConfigError::UnknownId { kind: "region", id: region.0 });
                };

                let (start, end) = (entry.start & !entry.mirror, entry.end & !entry.mirror);
                let Some(span) = end.checked_sub(start) else {
                    return Err(ConfigError::InvalidRange { space: config.name.clone(), start, end });
                };
                let len = span as usize + 1;
                let needed = offset as usize + len;
                if memory.len() < needed {
                    return Err(ConfigError::RegionTooSmall {
                        region: memory.name().into(),
                        len: memory.len(),
                        start: entry.start,
                        end: entry.end,
                        needed,
                    });
                }
            }
            Target::Bank { window } => {
                if window.index() >= self.windows.len() {
                    return Err(ConfigError::UnknownId { kind: "bank window", id: window.0 });
                }
            }
            Target::Handler { handler } => {
                if handler.index() >= self.handlers.len() {
                    return Err(ConfigError::UnknownId { kind: "handler", id: handler.0 });
                }
            }
            Target::Space { space, .. } => {
                let Some((target, _)) = self.spaces.get(space.index()) else {
                    return Err(ConfigError::UnknownId { kind: "space", id: space.0 });
                };

                if target.bus_width != config.bus_width {
                    return Err(ConfigError::SubSpaceWidthMismatch {
                        space: config.name.clone(),
                        target: target.name.clone(),
                    });
                }
            }
            Target::Nop => {}
        }

        Ok(())
    }

    /// Validate the description and build the machine.
    ///
    /// # Errors
    ///
    /// Returns the first configuration problem found: malformed or overlapping ranges, regions
    /// too small for their mappings, inconsistent bank windows, zero clock ratios, or references
    /// to ids that were never registered.
    pub fn build(mut self) -> ConfigResult<Machine> {
        if let Some(err) = self.errors.drain(..).next() {
            return Err(err);
        }

        for unit in &self.units {
            if !unit.clock.is_valid() {
                return Err(ConfigError::InvalidClockRatio {
                    unit: unit.name.clone(),
                    multiplier: unit.clock.multiplier,
                    divider: unit.clock.divider,
                });
            }
        }

        for window in &self.windows {
            self.validate_window(window)?;
        }

        for (config, entries) in &self.spaces {
            for entry in entries {
                self.validate_entry(config, entry)?;
            }
        }

        let overlap_policy = self.config.overlap_policy;
        let spaces = std::mem::take(&mut self.spaces)
            .into_iter()
            .map(|(config, entries)| AddressSpace::new(&config, entries, overlap_policy))
            .collect::<ConfigResult<Vec<_>>>()?;

        let window_count = self.windows.len();
        let bus = Bus::new(self.config, spaces, self.regions, self.windows, self.handlers);
        let mut board = Board::new(bus, self.units.len());
        board.timers = self.timers;

        for window in 0..window_count {
            board.reapply_bank(WindowId(window as u32), 0);
        }

        let mut units = self.units;
        for unit in &mut units {
            unit.power_on();
        }

        log::info!(
            "Built machine: {} units, {} spaces, {} regions, {} bank windows, {} handlers",
            units.len(),
            board.bus.spaces.len(),
            board.bus.regions.len(),
            window_count,
            board.bus.handlers.len()
        );

        Ok(Machine {
            board,
            units,
            callbacks: self.callbacks,
            post_load_hooks: self.post_load_hooks,
            reset_hooks: self.reset_hooks,
            sync_time: 0,
        })
    }
}

/// Declares one range; finish with one of the target methods.
#[must_use]
pub struct RangeBuilder<'a> {
    builder: &'a mut MachineBuilder,
    space: SpaceId,
    start: u32,
    end: u32,
    mirror: u32,
    unit_mask: Option<u32>,
    access: Option<AccessKind>,
}

impl RangeBuilder<'_> {
    /// Address bits that are ignored when matching this range.
    pub fn mirror(mut self, mirror: u32) -> Self {
        self.mirror = mirror;
        self
    }

    /// Byte lanes of the native bus unit that this range drives.
    pub fn unit_mask(mut self, unit_mask: u32) -> Self {
        self.unit_mask = Some(unit_mask);
        self
    }

    /// Override the access kind the target method would otherwise use.
    pub fn access(mut self, access: AccessKind) -> Self {
        self.access = Some(access);
        self
    }

    fn finish(self, default_access: AccessKind, target: Target) {
        let unit_mask =
            self.unit_mask.unwrap_or_else(|| self.builder.space_width(self.space).value_mask());
        let entry = RangeEntry {
            start: self.start,
            end: self.end,
            mirror: self.mirror,
            unit_mask,
            access: self.access.unwrap_or(default_access),
            target,
        };
        self.builder.push_entry(self.space, entry);
    }

    pub fn ram(self, region: RegionId) {
        self.ram_at(region, 0);
    }

    pub fn ram_at(self, region: RegionId, offset: u32) {
        self.finish(AccessKind::ReadWrite, Target::Memory { region, offset });
    }

    pub fn rom(self, region: RegionId) {
        self.rom_at(region, 0);
    }

    pub fn rom_at(self, region: RegionId, offset: u32) {
        self.finish(AccessKind::Read, Target::Memory { region, offset });
    }

    pub fn bank(self, window: WindowId) {
        self.finish(AccessKind::ReadWrite, Target::Bank { window });
    }

    pub fn read(self, handler: HandlerId) {
        self.finish(AccessKind::Read, Target::Handler { handler });
    }

    pub fn write(self, handler: HandlerId) {
        self.finish(AccessKind::Write, Target::Handler { handler });
    }

    pub fn read_write(self, handler: HandlerId) {
        self.finish(AccessKind::ReadWrite, Target::Handler { handler });
    }

    pub fn read_fn(self, read: impl FnMut(&mut Board, u32, u32) -> u32 + 'static) -> HandlerId {
        let name = format!("read@{}:{:X}", self.space, self.start);
        let handler = self.builder.add_handler(name, FnHandler::reader(read));
        self.read(handler);
        handler
    }

    pub fn write_fn(self, write: impl FnMut(&mut Board, u32, u32, u32) + 'static) -> HandlerId {
        let name = format!("write@{}:{:X}", self.space, self.start);
        let handler = self.builder.add_handler(name, FnHandler::writer(write));
        self.write(handler);
        handler
    }

    /// Forward accesses to another space; `base` is the address that `start` maps to.
    pub fn space(self, space: SpaceId, base: u32) {
        self.finish(AccessKind::ReadWrite, Target::Space { space, base });
    }

    pub fn nop(self) {
        self.finish(AccessKind::ReadWrite, Target::Nop);
    }
}

pub struct Machine {
    pub(crate) board: Board,
    pub(crate) units: Vec<ExecutionUnit>,
    pub(crate) callbacks: Vec<TimerCallback>,
    pub(crate) post_load_hooks: Vec<Hook>,
    pub(crate) reset_hooks: Vec<Hook>,
    // Master time that every unit has reached
    pub(crate) sync_time: u64,
}

impl Machine {
    #[must_use]
    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut Board {
        &mut self.board
    }

    /// Master time that every execution unit has reached.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.sync_time
    }

    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn unit_by_name(&self, name: &str) -> Option<UnitId> {
        self.units.iter().position(|unit| unit.name == name).map(|i| UnitId(i as u32))
    }

    #[must_use]
    pub fn unit_name(&self, unit: UnitId) -> Option<&str> {
        self.units.get(unit.index()).map(|unit| unit.name.as_str())
    }

    /// Local cycle count of a unit.
    #[must_use]
    pub fn unit_cycles(&self, unit: UnitId) -> Option<u64> {
        self.units.get(unit.index()).map(|unit| unit.cycles)
    }

    /// Master time a unit has reached.
    #[must_use]
    pub fn unit_time(&self, unit: UnitId) -> Option<u64> {
        self.units.get(unit.index()).map(ExecutionUnit::master_time)
    }

    #[must_use]
    pub fn is_suspended(&self, unit: UnitId) -> bool {
        self.units.get(unit.index()).is_some_and(|unit| unit.suspended)
    }

    /// Downcast a unit's device to its concrete type.
    #[must_use]
    pub fn device<T: Device>(&self, unit: UnitId) -> Option<&T> {
        let device = self.units.get(unit.index())?.device.as_ref();
        (device as &dyn Any).downcast_ref::<T>()
    }

    pub fn device_mut<T: Device>(&mut self, unit: UnitId) -> Option<&mut T> {
        let device = self.units.get_mut(unit.index())?.device.as_mut();
        (device as &mut dyn Any).downcast_mut::<T>()
    }

    pub fn set_interrupt_line(&mut self, unit: UnitId, line: u8, asserted: bool) {
        self.board.set_interrupt_line(unit, line, asserted);
    }

    pub fn read(&mut self, space: SpaceId, address: u32, width: BusWidth) -> u32 {
        self.board.read(space, address, width)
    }

    pub fn write(&mut self, space: SpaceId, address: u32, width: BusWidth, value: u32) {
        self.board.write(space, address, width, value);
    }

    pub fn select_bank(&mut self, window: WindowId, index: u32) -> bool {
        self.board.select_bank(window, index)
    }

    /// Arm a timer `delay` master ticks after the current sync point.
    pub fn schedule_timer(
        &mut self,
        target: TimerTarget,
        delay: u64,
        interval: u64,
        param: u64,
    ) -> TimerHandle {
        self.board.now = self.sync_time;
        self.board.schedule_timer(target, delay, interval, param)
    }

    pub fn adjust_timer(&mut self, timer: TimerHandle, delay: u64, param: Option<u64>) -> bool {
        self.board.now = self.sync_time;
        self.board.adjust_timer(timer, delay, param)
    }

    pub fn cancel_timer(&mut self, timer: TimerHandle) -> bool {
        self.board.cancel_timer(timer)
    }

    /// Soft reset: reset every device and handler, clear interrupt lines and suspensions,
    /// reselect bank 0 in every window, then run the reset hooks. Time keeps running.
    pub fn reset(&mut self) {
        log::info!("Soft reset at master time {}", self.sync_time);

        let board = &mut self.board;
        board.now = self.sync_time;
        board.signals.reset_requested = false;
        board.signals.suspend_requests.clear();
        board.lines.fill(0);

        for unit in &mut self.units {
            unit.power_on();
            unit.device.reset(board);
        }

        for window in 0..board.bus.windows.len() {
            board.reapply_bank(WindowId(window as u32), 0);
        }

        for handler in 0..board.bus.handlers.len() {
            board.with_handler(HandlerId(handler as u32), |handler, board| handler.reset(board));
        }

        for hook in &mut self.reset_hooks {
            hook(board);
        }
    }
}
