//! Scripted execution unit
//!
//! [`TraceDevice`] stands in for a CPU core: it loops over a fixed list of bus operations, each
//! costing a number of local cycles, and records what it observed. Two machines built from the
//! same description produce identical logs, which makes it the reference workload for checking
//! scheduling determinism and save state round trips.

use crate::board::Board;
use crate::bus::space::SpaceId;
use crate::device::{Device, DeviceContext};
use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use lockstep_common::macros;
use lockstep_config::BusWidth;
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};

/// Number of records a trace device keeps unless told otherwise.
pub const DEFAULT_RECORD_LIMIT: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOp {
    Read { space: SpaceId, address: u32, width: BusWidth, cycles: u64 },
    Write { space: SpaceId, address: u32, width: BusWidth, value: u32, cycles: u64 },
    Idle { cycles: u64 },
}

impl TraceOp {
    fn cycles(self) -> u64 {
        let cycles = match self {
            Self::Read { cycles, .. } | Self::Write { cycles, .. } | Self::Idle { cycles } => cycles,
        };
        cycles.max(1)
    }
}

/// Acknowledge write performed when an interrupt is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptAck {
    pub space: SpaceId,
    pub address: u32,
    pub width: BusWidth,
    pub value: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceInterrupt {
    pub line: u8,
    pub ack: Option<InterruptAck>,
    /// Cost of taking the interrupt
    pub cycles: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum TraceRecord {
    Read { time: u64, address: u32, value: u32 },
    Interrupt { time: u64, line: u8 },
    Reset { time: u64 },
}

impl Display for TraceRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Read { time, address, value } => write!(f, "{time:>12} read  {address:08X} = {value:08X}"),
            Self::Interrupt { time, line } => write!(f, "{time:>12} irq   line {line}"),
            Self::Reset { time } => write!(f, "{time:>12} reset"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
struct TraceState {
    position: u32,
    line_was_asserted: bool,
    // Most recent records only; older ones are counted in `dropped`
    records: VecDeque<TraceRecord>,
    dropped: u64,
}

#[derive(Debug, Clone)]
pub struct TraceDevice {
    ops: Vec<TraceOp>,
    interrupt: Option<TraceInterrupt>,
    record_limit: usize,
    state: TraceState,
}

impl TraceDevice {
    #[must_use]
    pub fn new(ops: Vec<TraceOp>, interrupt: Option<TraceInterrupt>) -> Self {
        Self { ops, interrupt, record_limit: DEFAULT_RECORD_LIMIT, state: TraceState::default() }
    }

    /// Keep at most `limit` records, discarding the oldest. A limit of 0 disables recording.
    #[must_use]
    pub fn with_record_limit(mut self, limit: usize) -> Self {
        self.record_limit = limit;
        self
    }

    /// The retained records, oldest first.
    #[must_use]
    pub fn records(&self) -> &VecDeque<TraceRecord> {
        &self.state.records
    }

    /// Number of records discarded to stay within the record limit.
    #[must_use]
    pub fn dropped_records(&self) -> u64 {
        self.state.dropped
    }

    fn record(&mut self, record: TraceRecord) {
        if self.record_limit == 0 {
            self.state.dropped += 1;
            return;
        }

        while self.state.records.len() >= self.record_limit {
            self.state.records.pop_front();
            self.state.dropped += 1;
        }
        self.state.records.push_back(record);
    }

    // Rising edge on the interrupt line, sampled at an instruction boundary
    fn take_interrupt(&mut self, ctx: &mut DeviceContext<'_>) -> bool {
        let Some(interrupt) = self.interrupt else { return false };

        let asserted = ctx.line_asserted(interrupt.line);
        let rising = asserted && !self.state.line_was_asserted;
        self.state.line_was_asserted = asserted;
        if !rising {
            return false;
        }

        self.record(TraceRecord::Interrupt { time: ctx.now(), line: interrupt.line });
        if let Some(ack) = interrupt.ack {
            ctx.write(ack.space, ack.address, ack.width, ack.value);
        }
        ctx.consume(interrupt.cycles.max(1));

        true
    }
}

impl Device for TraceDevice {
    fn execute(&mut self, ctx: &mut DeviceContext<'_>) {
        while ctx.should_continue() {
            if self.take_interrupt(ctx) {
                continue;
            }

            let Some(&op) = self.ops.get(self.state.position as usize) else {
                // Nothing to replay
                ctx.consume(ctx.remaining().max(1));
                return;
            };
            self.state.position = (self.state.position + 1) % self.ops.len() as u32;

            match op {
                TraceOp::Read { space, address, width, .. } => {
                    let time = ctx.now();
                    let value = ctx.read(space, address, width);
                    self.record(TraceRecord::Read { time, address, value });
                }
                TraceOp::Write { space, address, width, value, .. } => {
                    ctx.write(space, address, width, value);
                }
                TraceOp::Idle { .. } => {}
            }

            ctx.consume(op.cycles());
        }
    }

    fn reset(&mut self, board: &mut Board) {
        self.state.position = 0;
        self.state.line_was_asserted = false;
        self.record(TraceRecord::Reset { time: board.now() });
    }

    fn save_state(&self) -> Result<Vec<u8>, EncodeError> {
        macros::encode_to_vec(&self.state)
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        let mut state: TraceState = macros::decode_from_slice(bytes)?;
        if !self.ops.is_empty() && state.position as usize >= self.ops.len() {
            return Err(DecodeError::OtherString(format!(
                "trace position {} out of range for {} ops",
                state.position,
                self.ops.len()
            )));
        }

        while state.records.len() > self.record_limit {
            state.records.pop_front();
            state.dropped += 1;
        }

        self.state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler::FnHandler;
    use crate::bus::region::RegionKind;
    use crate::bus::space::SpaceConfig;
    use crate::device::{ClockRatio, UnitId};
    use crate::machine::{Machine, MachineBuilder};
    use crate::screen::{ScanlineInterrupt, ScreenTiming};
    use crate::{CoreConfig, Endianness};
    use test_log::test;

    struct TwoCpus {
        machine: Machine,
        main: UnitId,
        sound: UnitId,
    }

    /// A main CPU and a half-speed sound CPU passing values through shared RAM, with a scanline
    /// interrupt on the main CPU.
    fn two_cpus() -> TwoCpus {
        let mut builder = MachineBuilder::new(CoreConfig::default());
        let space = builder.add_space(SpaceConfig::new("main", 16, BusWidth::Bits8, Endianness::Little));
        let ram = builder.add_region("shared", RegionKind::Ram, vec![0; 0x80]);
        builder.map(space, 0x0000, 0x007f).ram(ram);

        let main = builder.add_device(
            "main",
            TraceDevice::new(
                vec![
                    TraceOp::Write { space, address: 0x10, width: BusWidth::Bits8, value: 0x5a, cycles: 7 },
                    TraceOp::Read { space, address: 0x20, width: BusWidth::Bits8, cycles: 5 },
                    TraceOp::Idle { cycles: 11 },
                    TraceOp::Write { space, address: 0x10, width: BusWidth::Bits8, value: 0xa5, cycles: 3 },
                ],
                Some(TraceInterrupt {
                    line: 0,
                    ack: Some(InterruptAck { space, address: 0x80, width: BusWidth::Bits8, value: 0 }),
                    cycles: 20,
                }),
            ),
            ClockRatio::UNITY,
        );
        let sound = builder.add_device(
            "sound",
            TraceDevice::new(
                vec![
                    TraceOp::Read { space, address: 0x10, width: BusWidth::Bits8, cycles: 4 },
                    TraceOp::Write { space, address: 0x20, width: BusWidth::Bits8, value: 0x33, cycles: 9 },
                    TraceOp::Read { space, address: 0x10, width: BusWidth::Bits8, cycles: 2 },
                ],
                None,
            ),
            ClockRatio::divider(2),
        );

        let ack = builder.add_handler("irq_ack", FnHandler::irq_ack(main, 0));
        builder.map(space, 0x0080, 0x0080).write(ack);

        ScanlineInterrupt {
            timing: ScreenTiming::new(64, 32),
            unit: main,
            line: 0,
            first_scanline: 0,
            step: 8,
            wrap: 32,
        }
        .install(&mut builder);

        TwoCpus { machine: builder.build().unwrap(), main, sound }
    }

    fn records(t: &TwoCpus, unit: UnitId) -> Vec<TraceRecord> {
        t.machine.device::<TraceDevice>(unit).unwrap().records().iter().copied().collect()
    }

    #[test]
    fn identical_runs_produce_identical_logs() {
        let mut first = two_cpus();
        let mut second = two_cpus();
        for target in (1_000..=10_000).step_by(1_000) {
            first.machine.run_until(target);
            second.machine.run_until(target);
        }

        assert_eq!(records(&first, first.main), records(&second, second.main));
        assert_eq!(records(&first, first.sound), records(&second, second.sound));

        let interrupts = records(&first, first.main)
            .iter()
            .filter(|record| matches!(record, TraceRecord::Interrupt { .. }))
            .count();
        // Rising edge every 16 scanlines of 64 ticks
        assert_eq!(interrupts, 10);
    }

    #[test]
    fn save_state_mid_run_resumes_identically() {
        let mut t = two_cpus();
        t.machine.run_until(3_333);
        let state = t.machine.save_state().unwrap();
        t.machine.run_until(8_000);
        let expected = (records(&t, t.main), records(&t, t.sound));

        let mut fresh = two_cpus();
        let report = fresh.machine.load_state(&state).unwrap();
        assert!(report.is_clean(), "{report}");
        fresh.machine.run_until(8_000);

        assert_eq!((records(&fresh, fresh.main), records(&fresh, fresh.sound)), expected);
    }

    #[test]
    fn reset_is_logged_and_restarts_script() {
        let mut t = two_cpus();
        t.machine.run_until(100);
        t.machine.reset();

        let sound = records(&t, t.sound);
        assert_eq!(sound.last(), Some(&TraceRecord::Reset { time: 100 }));
        let device = t.machine.device::<TraceDevice>(t.sound).unwrap();
        assert_eq!(device.state.position, 0);
    }

    fn rom_reader(record_limit: usize) -> (Machine, UnitId) {
        let mut builder = MachineBuilder::new(CoreConfig::default());
        let space = builder.add_space(SpaceConfig::new("main", 8, BusWidth::Bits8, Endianness::Little));
        let rom = builder.add_region("rom", RegionKind::Rom, (0..=0xff).collect());
        builder.map(space, 0x00, 0xff).rom(rom);

        let ops = (0..8)
            .map(|address| TraceOp::Read { space, address, width: BusWidth::Bits8, cycles: 1 })
            .collect();
        let cpu = builder.add_device(
            "cpu",
            TraceDevice::new(ops, None).with_record_limit(record_limit),
            ClockRatio::UNITY,
        );
        (builder.build().unwrap(), cpu)
    }

    #[test]
    fn record_limit_keeps_most_recent() {
        let (mut machine, cpu) = rom_reader(3);
        machine.run_until(8);

        let device = machine.device::<TraceDevice>(cpu).unwrap();
        let values: Vec<_> = device
            .records()
            .iter()
            .map(|record| match *record {
                TraceRecord::Read { value, .. } => value,
                _ => panic!("unexpected record {record}"),
            })
            .collect();
        assert_eq!(values, vec![5, 6, 7]);
        assert_eq!(device.dropped_records(), 5);

        // A smaller limit also trims a loaded state
        let state = machine.save_state().unwrap();
        let (mut smaller, cpu) = rom_reader(1);
        smaller.load_state(&state).unwrap();
        let device = smaller.device::<TraceDevice>(cpu).unwrap();
        assert_eq!(device.records().len(), 1);
        assert_eq!(device.dropped_records(), 7);
    }
}
