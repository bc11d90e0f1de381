//! Save states
//!
//! A state is a short header (magic bytes plus a little-endian format version) followed by a
//! bincode-encoded machine snapshot. Bank windows are stored as selection indices only; on
//! load the selections are replayed through the normal bank-select path so that staging copies
//! are re-derived from the source regions.

use crate::banking::WindowId;
use crate::board::Signals;
use crate::bus::HandlerId;
use crate::machine::Machine;
use crate::timer::{TimerQueue, TimerTarget};
use bincode::{Decode, Encode};
use lockstep_common::macros;
use std::fmt::{Display, Formatter};
use thiserror::Error;

pub const SAVE_STATE_MAGIC: &[u8; 8] = b"LOCKSTEP";
pub const SAVE_STATE_VERSION: u16 = 2;

#[derive(Debug, Error)]
pub enum SaveStateError {
    #[error("Error encoding save state: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("Error decoding save state: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("Save state does not start with the expected header")]
    PrefixMismatch,
    #[error("Save state version {actual} does not match expected version {expected}")]
    VersionMismatch { expected: u16, actual: u16 },
}

#[derive(Debug, Clone, Encode, Decode)]
struct UnitSnapshot {
    name: String,
    cycles: u64,
    suspended: bool,
    device: Vec<u8>,
}

#[derive(Debug, Clone, Encode, Decode)]
struct RegionSnapshot {
    name: String,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Encode, Decode)]
struct HandlerSnapshot {
    name: String,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Encode, Decode)]
struct MachineSnapshot {
    sync_time: u64,
    units: Vec<UnitSnapshot>,
    lines: Vec<u32>,
    timers: TimerQueue,
    bank_selections: Vec<u32>,
    regions: Vec<RegionSnapshot>,
    handlers: Vec<HandlerSnapshot>,
    open_bus_values: Vec<u32>,
}

/// Subsystems that could not be restored from a state and were reset to defaults instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub reset: Vec<String>,
}

impl LoadReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.reset.is_empty()
    }

    fn record(&mut self, subsystem: String) {
        log::warn!("Save state mismatch: {subsystem} reset to default state");
        self.reset.push(subsystem);
    }
}

impl Display for LoadReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.reset.is_empty() {
            return write!(f, "all subsystems restored");
        }

        write!(f, "reset to defaults: {}", self.reset.join(", "))
    }
}

impl Machine {
    /// Serialize unit times, device states, interrupt lines, the timer queue, bank selections,
    /// RAM regions and handler states.
    ///
    /// # Errors
    ///
    /// Returns an error if any component fails to encode.
    pub fn save_state(&self) -> Result<Vec<u8>, SaveStateError> {
        let units = self
            .units
            .iter()
            .map(|unit| {
                Ok(UnitSnapshot {
                    name: unit.name.clone(),
                    cycles: unit.cycles,
                    suspended: unit.suspended,
                    device: unit.device.save_state()?,
                })
            })
            .collect::<Result<Vec<_>, SaveStateError>>()?;

        let bus = &self.board.bus;
        let regions = bus
            .regions
            .iter()
            .filter(|region| region.kind().is_persisted())
            .map(|region| RegionSnapshot { name: region.name.clone(), data: region.data.clone() })
            .collect();

        let handlers = bus
            .handlers
            .iter()
            .map(|slot| {
                let data = match &slot.handler {
                    Some(handler) => handler.save_state()?,
                    None => Vec::new(),
                };
                Ok(HandlerSnapshot { name: slot.name.clone(), data })
            })
            .collect::<Result<Vec<_>, SaveStateError>>()?;

        let snapshot = MachineSnapshot {
            sync_time: self.sync_time,
            units,
            lines: self.board.lines.clone(),
            timers: self.board.timers.clone(),
            bank_selections: bus.windows.iter().map(|window| window.selected).collect(),
            regions,
            handlers,
            open_bus_values: bus.spaces.iter().map(|space| space.last_value).collect(),
        };

        let body = macros::encode_to_vec(&snapshot)?;
        let mut bytes = Vec::with_capacity(SAVE_STATE_MAGIC.len() + 2 + body.len());
        bytes.extend_from_slice(SAVE_STATE_MAGIC);
        bytes.extend_from_slice(&SAVE_STATE_VERSION.to_le_bytes());
        bytes.extend_from_slice(&body);

        Ok(bytes)
    }

    /// Restore a state produced by [`save_state`](Self::save_state).
    ///
    /// Header and decoding problems leave the machine untouched. Once the state has decoded,
    /// each subsystem that does not fit this machine (unit list, device or handler blobs, timer
    /// targets, bank indices, RAM sizes) is reset to its default state and listed in the report.
    ///
    /// # Errors
    ///
    /// Returns an error if the header does not match or the snapshot cannot be decoded.
    pub fn load_state(&mut self, bytes: &[u8]) -> Result<LoadReport, SaveStateError> {
        let header_len = SAVE_STATE_MAGIC.len() + 2;
        if bytes.len() < header_len || &bytes[..SAVE_STATE_MAGIC.len()] != SAVE_STATE_MAGIC {
            return Err(SaveStateError::PrefixMismatch);
        }

        let version = u16::from_le_bytes([bytes[header_len - 2], bytes[header_len - 1]]);
        if version != SAVE_STATE_VERSION {
            return Err(SaveStateError::VersionMismatch { expected: SAVE_STATE_VERSION, actual: version });
        }

        let snapshot: MachineSnapshot = macros::decode_from_slice(&bytes[header_len..])?;
        let report = self.apply_snapshot(snapshot);

        log::info!("Loaded save state at master time {}: {report}", self.sync_time);

        Ok(report)
    }

    fn apply_snapshot(&mut self, snapshot: MachineSnapshot) -> LoadReport {
        let mut report = LoadReport::default();

        self.sync_time = snapshot.sync_time;
        self.board.now = snapshot.sync_time;
        self.board.signals = Signals::default();

        self.apply_units(&snapshot.units, &mut report);

        if snapshot.lines.len() == self.board.lines.len() {
            self.board.lines.copy_from_slice(&snapshot.lines);
        } else {
            self.board.lines.fill(0);
            report.record("interrupt lines".into());
        }

        self.apply_timers(snapshot.timers, &mut report);
        self.apply_regions(&snapshot.regions, &mut report);
        self.apply_banks(&snapshot.bank_selections, &mut report);
        self.apply_handlers(&snapshot.handlers, &mut report);

        for (space, &value) in self.board.bus.spaces.iter_mut().zip(&snapshot.open_bus_values) {
            space.last_value = value;
        }

        for hook in &mut self.post_load_hooks {
            hook(&mut self.board);
        }

        report
    }

    fn apply_units(&mut self, snapshots: &[UnitSnapshot], report: &mut LoadReport) {
        if snapshots.len() != self.units.len() {
            report.record(format!(
                "unit list ({} units in state, {} in machine)",
                snapshots.len(),
                self.units.len()
            ));
        }

        let sync_time = self.sync_time;
        for (index, unit) in self.units.iter_mut().enumerate() {
            let restored = snapshots.get(index).filter(|snapshot| snapshot.name == unit.name).and_then(
                |snapshot| match unit.device.load_state(&snapshot.device) {
                    Ok(()) => Some(snapshot),
                    Err(err) => {
                        log::error!("Error loading state for unit '{}': {err}", unit.name);
                        None
                    }
                },
            );

            match restored {
                Some(snapshot) => {
                    unit.cycles = snapshot.cycles;
                    unit.suspended = snapshot.suspended;
                }
                None => {
                    unit.device.reset(&mut self.board);
                    unit.cycles = unit.clock.master_to_local_ceil(sync_time);
                    unit.power_on();
                    report.record(format!("unit '{}'", unit.name));
                }
            }
        }
    }

    fn apply_timers(&mut self, mut timers: TimerQueue, report: &mut LoadReport) {
        let unit_count = self.units.len();
        let handler_count = self.board.bus.handlers.len();
        let callback_count = self.callbacks.len();

        let dropped = timers.retain_targets(|target| match target {
            TimerTarget::Unit(unit) => unit.index() < unit_count,
            TimerTarget::Handler(handler) => handler.index() < handler_count,
            TimerTarget::Callback(callback) => callback.index() < callback_count,
        });
        if dropped != 0 {
            report.record(format!("{dropped} timers with unknown targets"));
        }

        self.board.timers = timers;
    }

    fn apply_regions(&mut self, snapshots: &[RegionSnapshot], report: &mut LoadReport) {
        for region in &mut self.board.bus.regions {
            if !region.kind().is_persisted() {
                continue;
            }

            match snapshots.iter().find(|snapshot| snapshot.name == region.name) {
                Some(snapshot) if snapshot.data.len() == region.data.len() => {
                    region.data.copy_from_slice(&snapshot.data);
                }
                _ => {
                    region.data.fill(0);
                    report.record(format!("region '{}'", region.name));
                }
            }
        }
    }

    fn apply_banks(&mut self, selections: &[u32], report: &mut LoadReport) {
        for index in 0..self.board.bus.windows.len() {
            let window = &self.board.bus.windows[index];
            let selected = match selections.get(index) {
                Some(&selected) if selected < window.bank_count => selected,
                _ => {
                    report.record(format!("bank window '{}'", window.name));
                    0
                }
            };

            self.board.reapply_bank(WindowId(index as u32), selected);
        }
    }

    fn apply_handlers(&mut self, snapshots: &[HandlerSnapshot], report: &mut LoadReport) {
        for index in 0..self.board.bus.handlers.len() {
            let slot = &self.board.bus.handlers[index];
            let snapshot = snapshots.get(index).filter(|snapshot| snapshot.name == slot.name);
            let name = slot.name.clone();

            let restored = self
                .board
                .with_handler(HandlerId(index as u32), |handler, board| match snapshot {
                    Some(snapshot) => match handler.load_state(&snapshot.data) {
                        Ok(()) => true,
                        Err(err) => {
                            log::error!("Error loading state for handler '{name}': {err}");
                            handler.reset(board);
                            false
                        }
                    },
                    None => {
                        handler.reset(board);
                        false
                    }
                })
                .unwrap_or(false);

            if !restored {
                report.record(format!("handler '{}'", self.board.bus.handlers[index].name));
            }
        }
    }
}
