//! Raster timing in master clock ticks, and a scanline interrupt generator built on it

use crate::board::Board;
use crate::device::UnitId;
use crate::error::ConfigError;
use crate::machine::MachineBuilder;
use crate::timer::{TimerHandle, TimerTarget};
use bincode::{Decode, Encode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScreenTiming {
    pub mclk_per_scanline: u64,
    pub scanlines_per_frame: u16,
}

impl ScreenTiming {
    #[must_use]
    pub const fn new(mclk_per_scanline: u64, scanlines_per_frame: u16) -> Self {
        Self { mclk_per_scanline, scanlines_per_frame }
    }

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.mclk_per_scanline != 0 && self.scanlines_per_frame != 0
    }

    #[inline]
    #[must_use]
    pub fn frame_mclk(self) -> u64 {
        self.mclk_per_scanline * u64::from(self.scanlines_per_frame)
    }

    #[inline]
    #[must_use]
    pub fn frame_number(self, now: u64) -> u64 {
        now / self.frame_mclk()
    }

    #[inline]
    #[must_use]
    pub fn scanline_at(self, now: u64) -> u16 {
        ((now % self.frame_mclk()) / self.mclk_per_scanline) as u16
    }

    /// Ticks from `now` until the start of `scanline`, always strictly in the future. A scanline
    /// that has already started this frame is reached in the next frame.
    #[must_use]
    pub fn time_until_pos(self, now: u64, scanline: u16) -> u64 {
        let frame_mclk = self.frame_mclk();
        let frame_start = now - now % frame_mclk;
        let mut target = frame_start + u64::from(scanline % self.scanlines_per_frame) * self.mclk_per_scanline;
        if target <= now {
            target += frame_mclk;
        }

        target - now
    }
}

/// Drives an interrupt line from the raster position: every `step` scanlines, starting at
/// `first_scanline`, the line is asserted if `scanline & step` is nonzero and cleared otherwise.
/// The scanline counter wraps at `wrap`.
///
/// The next scanline travels in the timer payload, so the generator carries no state of its own
/// and survives save states unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanlineInterrupt {
    pub timing: ScreenTiming,
    pub unit: UnitId,
    pub line: u8,
    pub first_scanline: u16,
    pub step: u16,
    pub wrap: u16,
}

impl ScanlineInterrupt {
    fn fire(self, board: &mut Board, timer: TimerHandle, scanline: u64) {
        let scanline = scanline as u16;
        board.set_interrupt_line(self.unit, self.line, scanline & self.step != 0);

        let next = ((u32::from(scanline) + u32::from(self.step)) % u32::from(self.wrap)) as u16;
        let delay = self.timing.time_until_pos(board.now(), next);
        board.adjust_timer(timer, delay, Some(next.into()));
    }

    /// Register the generator's callback and arm its first timer at power-on.
    ///
    /// Zero timing terms, a zero step or a zero wrap make [`MachineBuilder::build`] fail.
    pub fn install(self, builder: &mut MachineBuilder) -> TimerHandle {
        if !self.timing.is_valid() {
            builder.reject(ConfigError::InvalidScreenTiming {
                mclk_per_scanline: self.timing.mclk_per_scanline,
                scanlines_per_frame: self.timing.scanlines_per_frame,
            });
        }
        if self.step == 0 || self.wrap == 0 {
            builder.reject(ConfigError::InvalidScanlineStep { step: self.step, wrap: self.wrap });
        }

        let first = self.first_scanline % self.wrap.max(1);
        let callback = builder.add_timer_callback(move |board, timer, scanline| {
            self.fire(board, timer, scanline);
        });

        let delay = u64::from(first) * self.timing.mclk_per_scanline;
        builder.add_timer(TimerTarget::Callback(callback), delay, 0, first.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CoreConfig;
    use crate::machine::Machine;
    use crate::device::{ClockRatio, Device, DeviceContext};
    use bincode::error::{DecodeError, EncodeError};
    use test_log::test;

    const TIMING: ScreenTiming = ScreenTiming::new(100, 262);

    #[test]
    fn scanline_and_frame_positions() {
        assert_eq!(TIMING.frame_mclk(), 26_200);
        assert_eq!(TIMING.scanline_at(0), 0);
        assert_eq!(TIMING.scanline_at(99), 0);
        assert_eq!(TIMING.scanline_at(100), 1);
        assert_eq!(TIMING.scanline_at(26_199), 261);
        assert_eq!(TIMING.scanline_at(26_200), 0);
        assert_eq!(TIMING.frame_number(26_200 * 3 + 5), 3);
    }

    #[test]
    fn time_until_pos_is_strictly_future() {
        assert_eq!(TIMING.time_until_pos(0, 48), 4_800);
        assert_eq!(TIMING.time_until_pos(4_750, 48), 50);
        // Already at the start of scanline 48: wait a whole frame
        assert_eq!(TIMING.time_until_pos(4_800, 48), 26_200);
        assert_eq!(TIMING.time_until_pos(4_801, 48), 26_199);
        assert_eq!(TIMING.time_until_pos(26_100, 0), 100);
    }

    struct Sampler {
        samples: Vec<(u64, bool)>,
    }

    impl Device for Sampler {
        fn execute(&mut self, ctx: &mut DeviceContext<'_>) {
            while ctx.should_continue() {
                let asserted = ctx.line_asserted(0);
                if self.samples.last().is_none_or(|&(_, last)| last != asserted) {
                    self.samples.push((ctx.now(), asserted));
                }
                ctx.consume(1);
            }
        }

        fn reset(&mut self, _board: &mut Board) {}

        fn save_state(&self) -> Result<Vec<u8>, EncodeError> {
            Ok(Vec::new())
        }

        fn load_state(&mut self, _bytes: &[u8]) -> Result<(), DecodeError> {
            Ok(())
        }
    }

    #[test]
    fn every_32_lines_pattern() {
        let mut builder = MachineBuilder::new(CoreConfig::default());
        let cpu = builder.add_device("cpu", Sampler { samples: Vec::new() }, ClockRatio::UNITY);
        let irq = ScanlineInterrupt { timing: TIMING, unit: cpu, line: 0, first_scanline: 0, step: 32, wrap: 256 };
        let timer = irq.install(&mut builder);
        let mut machine = builder.build().unwrap();

        // Two full frames
        machine.run_until(2 * TIMING.frame_mclk() + 1);

        let samples = &machine.device::<Sampler>(cpu).unwrap().samples;
        let frame = TIMING.frame_mclk();

        // Asserted on scanlines 32, 96, 160 and 224, cleared 32 lines later; the counter wraps at
        // 256 so the last clear waits for the next frame
        let first_frame: Vec<(u64, bool)> =
            (1..8).map(|i| (i * 3_200, i % 2 == 1)).chain([(frame, false)]).collect();
        assert_eq!(samples[0], (0, false));
        assert_eq!(&samples[1..9], first_frame.as_slice());
        assert_eq!(samples[9], (frame + 3_200, true));

        // The handle stays valid and the payload holds the next scanline
        assert!(machine.board().timers().is_armed(timer));
        assert_eq!(machine.board().timers().param(timer), Some(32));
        assert_eq!(machine.board().timer_fire_time(timer), Some(2 * frame + 3_200));
    }

    fn build_with(timing: ScreenTiming, step: u16, wrap: u16) -> Result<Machine, ConfigError> {
        let mut builder = MachineBuilder::new(CoreConfig::default());
        let cpu = builder.add_device("cpu", Sampler { samples: Vec::new() }, ClockRatio::UNITY);
        ScanlineInterrupt { timing, unit: cpu, line: 0, first_scanline: 0, step, wrap }
            .install(&mut builder);
        builder.build()
    }

    #[test]
    fn degenerate_timing_rejected() {
        assert!(matches!(
            build_with(ScreenTiming::new(0, 262), 32, 256),
            Err(ConfigError::InvalidScreenTiming { mclk_per_scanline: 0, .. })
        ));
        assert!(matches!(
            build_with(ScreenTiming::new(100, 0), 32, 256),
            Err(ConfigError::InvalidScreenTiming { scanlines_per_frame: 0, .. })
        ));
        assert!(matches!(
            build_with(TIMING, 0, 256),
            Err(ConfigError::InvalidScanlineStep { step: 0, .. })
        ));
        assert!(matches!(
            build_with(TIMING, 32, 0),
            Err(ConfigError::InvalidScanlineStep { wrap: 0, .. })
        ));
    }

    #[test]
    fn large_step_does_not_overflow() {
        let timing = ScreenTiming::new(10, u16::MAX);
        let mut builder = MachineBuilder::new(CoreConfig::default());
        let cpu = builder.add_device("cpu", Sampler { samples: Vec::new() }, ClockRatio::UNITY);
        let irq = ScanlineInterrupt { timing, unit: cpu, line: 0, first_scanline: 0, step: 0xf000, wrap: u16::MAX };
        let timer = irq.install(&mut builder);
        let mut machine = builder.build().unwrap();

        // Fires at scanlines 0, 0xF000 and 0xE001 (next frame); the counter wraps at 0xFFFF
        machine.run_until(1_228_800);
        assert_eq!(machine.board().timers().param(timer), Some(0xd002));
        assert!(machine.board().timers().is_armed(timer));
    }
}
