use crate::bus::Bus;
use crate::bus::region::{MemoryRegion, RegionId};
use crate::device::{ClockRatio, UnitId};
use crate::timer::{TimerHandle, TimerQueue, TimerTarget};
use lockstep_config::CoreConfig;

/// Requests raised during a slice that the scheduler applies at the next unit boundary.
#[derive(Debug, Clone, Default)]
pub(crate) struct Signals {
    pub running: Option<UnitId>,
    pub slice_end: u64,
    pub abort_slice: bool,
    pub suspend_requests: Vec<(UnitId, bool)>,
    pub reset_requested: bool,
}

/// Everything the execution units share: the bus, interrupt lines and the timer queue.
///
/// Devices see the board through [`DeviceContext`](crate::DeviceContext); bus handlers and timer
/// callbacks receive it directly.
pub struct Board {
    pub(crate) bus: Bus,
    pub(crate) lines: Vec<u32>,
    pub(crate) timers: TimerQueue,
    pub(crate) signals: Signals,
    pub(crate) now: u64,
}

impl Board {
    pub(crate) fn new(bus: Bus, unit_count: usize) -> Self {
        Self {
            bus,
            lines: vec![0; unit_count],
            timers: TimerQueue::new(),
            signals: Signals::default(),
            now: 0,
        }
    }

    /// Current master clock time. While a unit runs this is the unit's own position.
    #[inline]
    #[must_use]
    pub fn now(&self) -> u64 {
        self.now
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.bus.config
    }

    /// Unit whose slice is currently executing, if any.
    #[inline]
    #[must_use]
    pub fn running_unit(&self) -> Option<UnitId> {
        self.signals.running
    }

    /// Drive an interrupt line of a unit. The unit observes the change at its next instruction
    /// boundary.
    pub fn set_interrupt_line(&mut self, unit: UnitId, line: u8, asserted: bool) {
        let Some(lines) = self.lines.get_mut(unit.index()) else {
            log::warn!("Interrupt line {line} set on nonexistent {unit}");
            return;
        };

        if line >= 32 {
            log::warn!("Interrupt line {line} out of range for {unit}");
            return;
        }

        if asserted {
            *lines |= 1 << line;
        } else {
            *lines &= !(1 << line);
        }

        log::trace!("{unit} line {line} -> {asserted}");
    }

    #[inline]
    #[must_use]
    pub fn interrupt_lines(&self, unit: UnitId) -> u32 {
        self.lines.get(unit.index()).copied().unwrap_or(0)
    }

    #[inline]
    #[must_use]
    pub fn line_asserted(&self, unit: UnitId, line: u8) -> bool {
        line < 32 && self.interrupt_lines(unit) & (1 << line) != 0
    }

    fn end_slice_if_running(&mut self, unit: UnitId) {
        if self.signals.running == Some(unit) {
            self.signals.abort_slice = true;
        }
    }

    /// Halt a unit. Takes effect at the unit's next instruction boundary.
    pub fn suspend(&mut self, unit: UnitId) {
        self.signals.suspend_requests.push((unit, true));
        self.end_slice_if_running(unit);
    }

    pub fn resume(&mut self, unit: UnitId) {
        self.signals.suspend_requests.push((unit, false));
        self.end_slice_if_running(unit);
    }

    /// Ask the scheduler for a soft reset before the next unit runs.
    pub fn request_reset(&mut self) {
        self.signals.reset_requested = true;
        self.signals.abort_slice = true;
    }

    fn note_timer_armed(&mut self, fire_time: u64) {
        // A running unit must stop so the timer is not delivered late
        if self.signals.running.is_some() && fire_time < self.signals.slice_end {
            self.signals.abort_slice = true;
        }
    }

    /// Arm a timer `delay` master ticks from now; a nonzero `interval` makes it periodic.
    pub fn schedule_timer(
        &mut self,
        target: TimerTarget,
        delay: u64,
        interval: u64,
        param: u64,
    ) -> TimerHandle {
        let fire_time = self.now.saturating_add(delay);
        self.note_timer_armed(fire_time);
        self.timers.schedule(target, fire_time, interval, param)
    }

    pub(crate) fn schedule_local_timer(
        &mut self,
        target: TimerTarget,
        clock: ClockRatio,
        fire_cycles: u64,
        interval_cycles: u64,
        param: u64,
    ) -> TimerHandle {
        self.note_timer_armed(clock.local_to_master(fire_cycles));
        self.timers.schedule_local(target, clock, fire_cycles, interval_cycles, param)
    }

    pub(crate) fn adjust_local_timer(
        &mut self,
        timer: TimerHandle,
        clock: ClockRatio,
        fire_cycles: u64,
        param: Option<u64>,
    ) -> bool {
        let adjusted = self.timers.adjust_local(timer, clock, fire_cycles, param);
        if adjusted {
            self.note_timer_armed(clock.local_to_master(fire_cycles));
        }
        adjusted
    }

    /// Allocate a disarmed timer whose handle stays valid for the life of the machine.
    pub fn allocate_timer(&mut self, target: TimerTarget, param: u64) -> TimerHandle {
        self.timers.allocate(target, param)
    }

    /// Re-arm `timer` to fire `delay` master ticks from now, keeping its handle.
    pub fn adjust_timer(&mut self, timer: TimerHandle, delay: u64, param: Option<u64>) -> bool {
        let fire_time = self.now.saturating_add(delay);
        let adjusted = self.timers.adjust(timer, fire_time, param);
        if adjusted {
            self.note_timer_armed(fire_time);
        }
        adjusted
    }

    pub fn set_timer_interval(&mut self, timer: TimerHandle, interval: u64) -> bool {
        self.timers.set_interval(timer, interval)
    }

    pub fn cancel_timer(&mut self, timer: TimerHandle) -> bool {
        self.timers.cancel(timer)
    }

    #[must_use]
    pub fn timer_fire_time(&self, timer: TimerHandle) -> Option<u64> {
        self.timers.fire_time(timer)
    }

    #[must_use]
    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    #[must_use]
    pub fn region(&self, region: RegionId) -> Option<&MemoryRegion> {
        self.bus.regions.get(region.index())
    }

    pub fn region_mut(&mut self, region: RegionId) -> Option<&mut MemoryRegion> {
        self.bus.regions.get_mut(region.index())
    }

    #[must_use]
    pub fn region_by_name(&self, name: &str) -> Option<RegionId> {
        self.bus.regions.iter().position(|region| region.name == name).map(|i| RegionId(i as u32))
    }
}
