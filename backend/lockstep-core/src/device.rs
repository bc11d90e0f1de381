use crate::board::Board;
use crate::bus::space::SpaceId;
use crate::timer::{TimerHandle, TimerTarget};
use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use lockstep_config::BusWidth;
use std::any::Any;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct UnitId(pub(crate) u32);

impl UnitId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for UnitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// Local clock of an execution unit relative to the master clock.
///
/// A unit advances `multiplier` local cycles for every `divider` master clock ticks, so a CPU
/// running at master/8 has `multiplier = 1, divider = 8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct ClockRatio {
    pub multiplier: u64,
    pub divider: u64,
}

impl ClockRatio {
    pub const UNITY: Self = Self { multiplier: 1, divider: 1 };

    #[must_use]
    pub const fn new(multiplier: u64, divider: u64) -> Self {
        Self { multiplier, divider }
    }

    #[must_use]
    pub const fn divider(divider: u64) -> Self {
        Self { multiplier: 1, divider }
    }

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.multiplier != 0 && self.divider != 0
    }

    /// Master clock time at which local cycle `cycles` begins (rounded down).
    #[inline]
    #[must_use]
    pub fn local_to_master(self, cycles: u64) -> u64 {
        (u128::from(cycles) * u128::from(self.divider) / u128::from(self.multiplier)) as u64
    }

    /// Smallest local cycle count whose master time is at or after `master`.
    #[inline]
    #[must_use]
    pub fn master_to_local_ceil(self, master: u64) -> u64 {
        let numerator = u128::from(master) * u128::from(self.multiplier);
        numerator.div_ceil(u128::from(self.divider)) as u64
    }
}

impl Default for ClockRatio {
    fn default() -> Self {
        Self::UNITY
    }
}

/// An execution unit: a CPU core, a custom processor, or anything else that consumes cycles.
pub trait Device: Any {
    /// Run instructions while [`DeviceContext::should_continue`] returns true, calling
    /// [`DeviceContext::consume`] after each one.
    fn execute(&mut self, ctx: &mut DeviceContext<'_>);

    fn reset(&mut self, board: &mut Board);

    fn timer_expired(&mut self, ctx: &mut DeviceContext<'_>, timer: TimerHandle, param: u64) {
        let _ = (ctx, param);
        log::debug!("Unhandled device timer {timer:?}");
    }

    /// # Errors
    ///
    /// Returns an error if the device state cannot be encoded.
    fn save_state(&self) -> Result<Vec<u8>, EncodeError>;

    /// # Errors
    ///
    /// Returns an error if `bytes` is not a valid state for this device; the device is left
    /// unchanged in that case.
    fn load_state(&mut self, bytes: &[u8]) -> Result<(), DecodeError>;
}

/// The view of the machine a device gets while it runs.
pub struct DeviceContext<'a> {
    board: &'a mut Board,
    unit: UnitId,
    clock: ClockRatio,
    cycles: u64,
    consumed: u64,
    budget: u64,
}

impl<'a> DeviceContext<'a> {
    pub(crate) fn new(
        board: &'a mut Board,
        unit: UnitId,
        clock: ClockRatio,
        cycles: u64,
        budget: u64,
    ) -> Self {
        board.now = clock.local_to_master(cycles);
        Self { board, unit, clock, cycles, consumed: 0, budget }
    }

    #[inline]
    #[must_use]
    pub fn unit(&self) -> UnitId {
        self.unit
    }

    /// Local cycle count, including cycles consumed during this slice.
    #[inline]
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    #[inline]
    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    #[inline]
    #[must_use]
    pub fn budget(&self) -> u64 {
        self.budget
    }

    #[inline]
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.budget.saturating_sub(self.consumed)
    }

    /// Master clock time of the current instruction boundary.
    #[inline]
    #[must_use]
    pub fn now(&self) -> u64 {
        self.board.now
    }

    #[inline]
    pub fn consume(&mut self, cycles: u64) {
        self.cycles += cycles;
        self.consumed += cycles;
        self.board.now = self.clock.local_to_master(self.cycles);
    }

    /// Whether another instruction may start: the slice has budget left and nothing (a timer
    /// armed before the slice end, a suspend or reset request) asked the slice to end early.
    #[inline]
    #[must_use]
    pub fn should_continue(&self) -> bool {
        self.consumed < self.budget && !self.board.signals.abort_slice
    }

    #[inline]
    #[must_use]
    pub fn interrupt_lines(&self) -> u32 {
        self.board.interrupt_lines(self.unit)
    }

    #[inline]
    #[must_use]
    pub fn line_asserted(&self, line: u8) -> bool {
        self.board.line_asserted(self.unit, line)
    }

    pub fn read(&mut self, space: SpaceId, address: u32, width: BusWidth) -> u32 {
        self.board.read(space, address, width)
    }

    pub fn write(&mut self, space: SpaceId, address: u32, width: BusWidth, value: u32) {
        self.board.write(space, address, width, value);
    }

    /// Arm a one-shot or periodic timer targeting this unit. Delay and interval are in local
    /// cycles, measured from the current cycle count; every firing lands on the master time of
    /// an exact local cycle.
    pub fn schedule_timer(&mut self, delay: u64, interval: u64, param: u64) -> TimerHandle {
        let target = TimerTarget::Unit(self.unit);
        self.board.schedule_local_timer(target, self.clock, self.cycles + delay, interval, param)
    }

    /// Re-arm a timer `delay` local cycles from now, keeping its local period.
    pub fn adjust_timer(&mut self, timer: TimerHandle, delay: u64, param: Option<u64>) -> bool {
        self.board.adjust_local_timer(timer, self.clock, self.cycles + delay, param)
    }

    pub fn cancel_timer(&mut self, timer: TimerHandle) -> bool {
        self.board.cancel_timer(timer)
    }

    #[inline]
    #[must_use]
    pub fn board(&self) -> &Board {
        self.board
    }

    #[inline]
    pub fn board_mut(&mut self) -> &mut Board {
        self.board
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn clock_conversions() {
        let half = ClockRatio::divider(2);
        assert_eq!(half.local_to_master(100), 200);
        assert_eq!(half.master_to_local_ceil(250), 125);
        assert_eq!(half.master_to_local_ceil(251), 126);

        let three_halves = ClockRatio::new(3, 2);
        assert_eq!(three_halves.local_to_master(3), 2);
        assert_eq!(three_halves.local_to_master(4), 2);
        assert_eq!(three_halves.master_to_local_ceil(3), 5);

        // Rounding up then back down never lands before the requested master time
        for ratio in [ClockRatio::new(7, 3), ClockRatio::divider(20), ClockRatio::new(5, 1)] {
            for master in 0..200 {
                let local = ratio.master_to_local_ceil(master);
                assert!(ratio.local_to_master(local) >= master);
                if local > 0 {
                    assert!(ratio.local_to_master(local - 1) < master);
                }
            }
        }
    }

    #[test]
    fn zero_terms_are_invalid() {
        assert!(!ClockRatio::new(0, 1).is_valid());
        assert!(!ClockRatio::new(1, 0).is_valid());
        assert!(ClockRatio::divider(8).is_valid());
    }
}
