use crate::board::Board;
use crate::bus::HandlerId;
use crate::bus::handler::BusHandler;
use crate::machine::MachineBuilder;
use crate::timer::{TimerHandle, TimerTarget};
use bincode::error::{DecodeError, EncodeError};
use lockstep_common::macros;

/// Resets the machine if software stops writing to it for `limit_frames` frames.
#[derive(Debug, Clone)]
pub struct Watchdog {
    limit_frames: u32,
    frames: u32,
}

impl Watchdog {
    #[must_use]
    pub fn new(limit_frames: u32) -> Self {
        Self { limit_frames: limit_frames.max(1), frames: 0 }
    }

    /// Register the watchdog along with the once-per-frame timer that advances it.
    pub fn install(
        self,
        builder: &mut MachineBuilder,
        name: impl Into<String>,
        frame_mclk: u64,
    ) -> HandlerId {
        let handler = builder.add_handler(name, self);
        builder.add_timer(TimerTarget::Handler(handler), frame_mclk, frame_mclk, 0);
        handler
    }

    #[must_use]
    pub fn frames_since_kick(&self) -> u32 {
        self.frames
    }
}

impl BusHandler for Watchdog {
    fn write(&mut self, _board: &mut Board, _offset: u32, _value: u32, _mask: u32) {
        self.frames = 0;
    }

    fn timer_expired(&mut self, board: &mut Board, _timer: TimerHandle, _param: u64) {
        self.frames += 1;
        if self.frames >= self.limit_frames {
            log::warn!("Watchdog not kicked for {} frames; resetting machine", self.frames);
            self.frames = 0;
            board.request_reset();
        }
    }

    fn reset(&mut self, _board: &mut Board) {
        self.frames = 0;
    }

    fn save_state(&self) -> Result<Vec<u8>, EncodeError> {
        macros::encode_to_vec(&self.frames)
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        self.frames = macros::decode_from_slice(bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::space::SpaceConfig;
    use crate::device::{ClockRatio, Device, DeviceContext};
    use crate::{BusWidth, CoreConfig, Endianness};
    use test_log::test;

    #[derive(Default)]
    struct ResetCounter {
        resets: Vec<u64>,
    }

    impl Device for ResetCounter {
        fn execute(&mut self, ctx: &mut DeviceContext<'_>) {
            while ctx.should_continue() {
                ctx.consume(10);
            }
        }

        fn reset(&mut self, board: &mut Board) {
            self.resets.push(board.now());
        }

        fn save_state(&self) -> Result<Vec<u8>, EncodeError> {
            Ok(Vec::new())
        }

        fn load_state(&mut self, _bytes: &[u8]) -> Result<(), DecodeError> {
            Ok(())
        }
    }

    fn resets(kick_interval: Option<u64>) -> Vec<u64> {
        let mut builder = MachineBuilder::new(CoreConfig::default());
        let space = builder.add_space(SpaceConfig::new("main", 16, BusWidth::Bits8, Endianness::Little));
        let cpu = builder.add_device("cpu", ResetCounter::default(), ClockRatio::UNITY);
        let watchdog = Watchdog::new(3).install(&mut builder, "watchdog", 1000);
        builder.map(space, 0x3000, 0x3000).mirror(0x03ff).write(watchdog);

        if let Some(interval) = kick_interval {
            let kick = builder.add_timer_callback(move |board, _, _| {
                board.write(space, 0x3123, BusWidth::Bits8, 0);
            });
            builder.add_timer(TimerTarget::Callback(kick), interval, interval, 0);
        }

        let mut machine = builder.build().unwrap();
        machine.run_until(7500);
        machine.device::<ResetCounter>(cpu).unwrap().resets.clone()
    }

    #[test]
    fn starved_watchdog_resets_machine() {
        assert_eq!(resets(None), vec![3000, 6000]);
    }

    #[test]
    fn kicked_watchdog_stays_quiet() {
        assert_eq!(resets(Some(1500)), Vec::<u64>::new());
    }
}
