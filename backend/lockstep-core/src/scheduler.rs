//! Lockstep scheduler
//!
//! `run_until` repeatedly picks the non-suspended unit that is furthest behind and lets it run up
//! to the current slice end, which is the earliest of the target time, the next timer, and the
//! quantum boundary. Once every unit has caught up, due timers fire and the sync point advances.
//! Ties between units go to the unit registered first, so a given configuration always
//! interleaves the same way.

#[cfg(test)]
mod tests;

use crate::device::{ClockRatio, Device, DeviceContext, UnitId};
use crate::machine::Machine;
use crate::timer::TimerTarget;
use std::mem;

pub struct ExecutionUnit {
    pub(crate) name: String,
    pub(crate) device: Box<dyn Device>,
    pub(crate) clock: ClockRatio,
    pub(crate) cycles: u64,
    pub(crate) suspended: bool,
    start_suspended: bool,
    stall_warned: bool,
}

impl ExecutionUnit {
    pub(crate) fn new(name: String, device: Box<dyn Device>, clock: ClockRatio) -> Self {
        Self {
            name,
            device,
            clock,
            cycles: 0,
            suspended: false,
            start_suspended: false,
            stall_warned: false,
        }
    }

    pub(crate) fn set_start_suspended(&mut self) {
        self.start_suspended = true;
        self.suspended = true;
    }

    pub(crate) fn power_on(&mut self) {
        self.suspended = self.start_suspended;
    }

    #[inline]
    pub(crate) fn master_time(&self) -> u64 {
        self.clock.local_to_master(self.cycles)
    }

    /// Move a unit that was not running up to `time` without executing anything.
    fn skip_to(&mut self, time: u64) {
        self.cycles = self.cycles.max(self.clock.master_to_local_ceil(time));
    }
}

impl Machine {
    /// Advance every unit to at least `target` master ticks, firing timers along the way.
    pub fn run_until(&mut self, target: u64) {
        loop {
            self.apply_signals();

            let mut slice_end = target;
            if let Some(next_timer) = self.board.timers.next_fire_time() {
                slice_end = slice_end.min(next_timer.max(self.sync_time));
            }
            if let Some(quantum) = self.board.bus.config.quantum {
                slice_end = slice_end.min(self.sync_time.saturating_add(quantum.get()));
            }

            if let Some(index) = self.next_unit(slice_end) {
                self.execute_unit(index, slice_end);
                continue;
            }

            // Every runnable unit has reached the slice end
            self.sync_time = self.sync_time.max(slice_end);
            for unit in self.units.iter_mut().filter(|unit| unit.suspended) {
                unit.skip_to(self.sync_time);
            }

            let fired = self.fire_due_timers();
            if !fired && self.sync_time >= target {
                break;
            }
        }

        self.board.now = self.sync_time;
    }

    /// Advance by `ticks` master ticks past the current sync point.
    pub fn run_for(&mut self, ticks: u64) {
        self.run_until(self.sync_time.saturating_add(ticks));
    }

    /// Halt a unit immediately. Only call this between `run_until` calls; devices, handlers and
    /// timer callbacks should use [`Board::suspend`](crate::Board::suspend).
    pub fn suspend(&mut self, unit: UnitId) {
        if let Some(unit) = self.units.get_mut(unit.index()) {
            unit.suspended = true;
        }
    }

    pub fn resume(&mut self, unit: UnitId) {
        let sync_time = self.sync_time;
        if let Some(unit) = self.units.get_mut(unit.index())
            && unit.suspended
        {
            unit.suspended = false;
            unit.skip_to(sync_time);
        }
    }

    fn apply_signals(&mut self) {
        if self.board.signals.reset_requested {
            self.reset();
        }

        for (unit, suspend) in mem::take(&mut self.board.signals.suspend_requests) {
            if suspend {
                log::debug!("Suspending {unit} at {}", self.sync_time);
                self.suspend(unit);
            } else {
                log::debug!("Resuming {unit} at {}", self.sync_time);
                self.resume(unit);
            }
        }
    }

    fn next_unit(&self, slice_end: u64) -> Option<usize> {
        self.units
            .iter()
            .enumerate()
            .filter(|(_, unit)| !unit.suspended)
            .map(|(index, unit)| (unit.master_time(), index))
            .filter(|&(time, _)| time < slice_end)
            .min()
            .map(|(_, index)| index)
    }

    fn execute_unit(&mut self, index: usize, slice_end: u64) {
        let unit_id = UnitId(index as u32);
        let unit = &mut self.units[index];
        let budget = unit.clock.master_to_local_ceil(slice_end) - unit.cycles;

        let signals = &mut self.board.signals;
        signals.running = Some(unit_id);
        signals.slice_end = slice_end;
        signals.abort_slice = false;

        let mut ctx = DeviceContext::new(&mut self.board, unit_id, unit.clock, unit.cycles, budget);
        unit.device.execute(&mut ctx);
        let (cycles, consumed) = (ctx.cycles(), ctx.consumed());
        unit.cycles = cycles;

        if consumed == 0 && !self.board.signals.abort_slice {
            if !unit.stall_warned {
                log::warn!("Unit '{}' returned without consuming cycles; charging 1 cycle", unit.name);
                unit.stall_warned = true;
            }
            unit.cycles += 1;
        }

        let signals = &mut self.board.signals;
        signals.running = None;
        signals.abort_slice = false;
    }

    fn fire_due_timers(&mut self) -> bool {
        let mut fired_any = false;

        while let Some(fired) = self.board.timers.pop_due(self.sync_time) {
            fired_any = true;
            self.board.now = fired.fire_time;
            log::trace!("Timer {:?} fired at {} for {:?}", fired.handle, fired.fire_time, fired.target);

            match fired.target {
                TimerTarget::Unit(unit_id) => {
                    if let Some(unit) = self.units.get_mut(unit_id.index()) {
                        let mut ctx =
                            DeviceContext::new(&mut self.board, unit_id, unit.clock, unit.cycles, 0);
                        unit.device.timer_expired(&mut ctx, fired.handle, fired.param);
                        unit.cycles = ctx.cycles();
                    }
                }
                TimerTarget::Handler(handler) => {
                    self.board.with_handler(handler, |handler, board| {
                        handler.timer_expired(board, fired.handle, fired.param);
                    });
                }
                TimerTarget::Callback(callback) => {
                    if let Some(callback) = self.callbacks.get_mut(callback.index()) {
                        callback(&mut self.board, fired.handle, fired.param);
                    }
                }
            }

            self.board.timers.finish_fire(fired.handle);
        }

        self.board.now = self.sync_time;
        fired_any
    }
}
