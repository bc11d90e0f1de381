use crate::board::Board;
use crate::device::{ClockRatio, Device, DeviceContext, UnitId};
use crate::machine::{Machine, MachineBuilder};
use crate::timer::{TimerHandle, TimerTarget};
use bincode::error::{DecodeError, EncodeError};
use lockstep_common::macros;
use lockstep_config::CoreConfig;
use std::cell::RefCell;
use std::num::NonZeroU64;
use std::rc::Rc;
use test_log::test;

/// Executes one instruction of `instruction_cycles` cycles at a time and records what it saw.
#[derive(Debug, Default)]
struct Counter {
    instruction_cycles: u64,
    executed: u64,
    slice_starts: Vec<u64>,
    timer_fires: Vec<(u64, u64, u64)>,
    irq_seen_at: Option<u64>,
    timer_on_first_slice: Option<u64>,
    timer_interval: u64,
    started: bool,
}

impl Counter {
    fn new(instruction_cycles: u64) -> Self {
        Self { instruction_cycles, ..Self::default() }
    }
}

impl Device for Counter {
    fn execute(&mut self, ctx: &mut DeviceContext<'_>) {
        self.slice_starts.push(ctx.now());

        if !self.started {
            self.started = true;
            if let Some(delay) = self.timer_on_first_slice {
                ctx.schedule_timer(delay, self.timer_interval, 7);
            }
        }

        while ctx.should_continue() {
            if self.irq_seen_at.is_none() && ctx.line_asserted(0) {
                self.irq_seen_at = Some(ctx.now());
            }

            self.executed += 1;
            ctx.consume(self.instruction_cycles);
        }
    }

    fn reset(&mut self, _board: &mut Board) {}

    fn timer_expired(&mut self, ctx: &mut DeviceContext<'_>, _timer: TimerHandle, param: u64) {
        self.timer_fires.push((ctx.now(), ctx.cycles(), param));
    }

    fn save_state(&self) -> Result<Vec<u8>, EncodeError> {
        macros::encode_to_vec(&self.executed)
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        self.executed = macros::decode_from_slice(bytes)?;
        Ok(())
    }
}

fn counter(machine: &Machine, unit: UnitId) -> &Counter {
    machine.device::<Counter>(unit).unwrap()
}

#[test]
fn fast_clock_periodic_timer_keeps_local_period() {
    let mut builder = MachineBuilder::new(CoreConfig::default());
    let cpu = builder.add_device(
        "cpu",
        Counter { timer_on_first_slice: Some(3), timer_interval: 3, ..Counter::new(1) },
        ClockRatio::new(2, 1),
    );
    let mut machine = builder.build().unwrap();

    machine.run_until(12);

    // Every 3 local cycles is every 1.5 master ticks: local 3, 6, .. 24 round down to these
    let fire_times: Vec<_> = counter(&machine, cpu).timer_fires.iter().map(|&(now, _, _)| now).collect();
    assert_eq!(fire_times, vec![1, 3, 4, 6, 7, 9, 10, 12]);
}

#[test]
fn divided_clock_timer_fires_at_converted_time() {
    let mut builder = MachineBuilder::new(CoreConfig::default());
    let a = builder.add_device(
        "a",
        Counter { timer_on_first_slice: Some(100), ..Counter::new(1) },
        ClockRatio::divider(2),
    );
    let b = builder.add_device("b", Counter::new(1), ClockRatio::UNITY);
    let mut machine = builder.build().unwrap();

    machine.run_until(250);

    // Local cycle 100 of a half-speed unit is master time 200
    assert_eq!(counter(&machine, a).timer_fires, vec![(200, 100, 7)]);
    assert_eq!(machine.unit_cycles(a), Some(125));
    assert_eq!(machine.unit_cycles(b), Some(250));
    assert_eq!(machine.now(), 250);
}

#[test]
fn interrupt_seen_at_next_instruction_boundary() {
    let mut builder = MachineBuilder::new(CoreConfig::default());
    let cpu = builder.add_device("cpu", Counter::new(1), ClockRatio::UNITY);
    let raise = builder.add_timer_callback(move |board, _, _| board.set_interrupt_line(cpu, 0, true));
    builder.add_timer(TimerTarget::Callback(raise), 50, 0, 0);
    let mut machine = builder.build().unwrap();

    machine.run_until(100);

    assert_eq!(counter(&machine, cpu).irq_seen_at, Some(50));
    assert!(machine.board().line_asserted(cpu, 0));
}

#[test]
fn quantum_bounds_run_ahead() {
    let config = CoreConfig { quantum: NonZeroU64::new(10), ..CoreConfig::default() };
    let mut builder = MachineBuilder::new(config);
    let a = builder.add_device("a", Counter::new(1), ClockRatio::UNITY);
    let b = builder.add_device("b", Counter::new(1), ClockRatio::UNITY);
    let mut machine = builder.build().unwrap();

    machine.run_until(40);

    assert_eq!(counter(&machine, a).slice_starts, vec![0, 10, 20, 30]);
    assert_eq!(counter(&machine, b).slice_starts, vec![0, 10, 20, 30]);

    let mut builder = MachineBuilder::new(CoreConfig::default());
    let a = builder.add_device("a", Counter::new(1), ClockRatio::UNITY);
    let mut machine = builder.build().unwrap();
    machine.run_until(40);
    assert_eq!(counter(&machine, a).slice_starts, vec![0]);
}

#[test]
fn suspend_and_resume_from_timer_callbacks() {
    let mut builder = MachineBuilder::new(CoreConfig::default());
    let a = builder.add_device("a", Counter::new(1), ClockRatio::UNITY);
    let b = builder.add_device("b", Counter::new(1), ClockRatio::UNITY);
    let toggle = builder.add_timer_callback(move |board, _, param| {
        if param == 0 {
            board.suspend(b);
        } else {
            board.resume(b);
        }
    });
    builder.add_timer(TimerTarget::Callback(toggle), 30, 0, 0);
    builder.add_timer(TimerTarget::Callback(toggle), 60, 0, 1);
    let mut machine = builder.build().unwrap();

    machine.run_until(45);
    assert!(machine.is_suspended(b));
    assert_eq!(counter(&machine, b).executed, 30);

    machine.run_until(100);
    assert!(!machine.is_suspended(b));
    assert_eq!(counter(&machine, a).executed, 100);
    assert_eq!(counter(&machine, b).executed, 70);
    assert_eq!(machine.unit_cycles(b), Some(100));
}

#[test]
fn start_suspended_unit_follows_sync_point() {
    let mut builder = MachineBuilder::new(CoreConfig::default());
    builder.add_device("main", Counter::new(1), ClockRatio::UNITY);
    let sub = builder.add_device("sub", Counter::new(1), ClockRatio::divider(4));
    builder.start_suspended(sub);
    let mut machine = builder.build().unwrap();

    machine.run_until(400);
    assert_eq!(counter(&machine, sub).executed, 0);
    assert_eq!(machine.unit_time(sub), Some(400));

    machine.resume(sub);
    machine.run_until(800);
    assert_eq!(counter(&machine, sub).executed, 100);
}

#[test]
fn stalled_device_is_charged_a_cycle() {
    struct Stalled;

    impl Device for Stalled {
        fn execute(&mut self, _ctx: &mut DeviceContext<'_>) {}

        fn reset(&mut self, _board: &mut Board) {}

        fn save_state(&self) -> Result<Vec<u8>, EncodeError> {
            Ok(Vec::new())
        }

        fn load_state(&mut self, _bytes: &[u8]) -> Result<(), DecodeError> {
            Ok(())
        }
    }

    let mut builder = MachineBuilder::new(CoreConfig::default());
    let unit = builder.add_device("stalled", Stalled, ClockRatio::UNITY);
    let mut machine = builder.build().unwrap();

    machine.run_until(5);
    assert_eq!(machine.unit_cycles(unit), Some(5));
}

#[test]
fn periodic_timer_ignores_instruction_overshoot() {
    let fires = Rc::new(RefCell::new(Vec::new()));

    let mut builder = MachineBuilder::new(CoreConfig::default());
    // 3-cycle instructions never land exactly on the timer period
    builder.add_device("cpu", Counter::new(3), ClockRatio::UNITY);
    let record = {
        let fires = Rc::clone(&fires);
        builder.add_timer_callback(move |board, _, _| fires.borrow_mut().push(board.now()))
    };
    builder.add_timer(TimerTarget::Callback(record), 3, 7, 0);
    let mut machine = builder.build().unwrap();

    for target in [50, 51, 130, 700] {
        machine.run_until(target);
    }

    let fires = fires.borrow();
    assert_eq!(fires.len(), 100);
    for (k, &time) in fires.iter().enumerate() {
        assert_eq!(time, 3 + 7 * k as u64);
    }
}

#[test]
fn device_timer_cancelled_before_firing() {
    #[derive(Default)]
    struct Canceller {
        handle: Option<TimerHandle>,
        fired: bool,
    }

    impl Device for Canceller {
        fn execute(&mut self, ctx: &mut DeviceContext<'_>) {
            match self.handle {
                None => self.handle = Some(ctx.schedule_timer(50, 0, 0)),
                Some(handle) if ctx.cycles() >= 20 => {
                    ctx.cancel_timer(handle);
                }
                Some(_) => {}
            }

            while ctx.should_continue() {
                ctx.consume(1);
            }
        }

        fn reset(&mut self, _board: &mut Board) {}

        fn timer_expired(&mut self, _ctx: &mut DeviceContext<'_>, _timer: TimerHandle, _param: u64) {
            self.fired = true;
        }

        fn save_state(&self) -> Result<Vec<u8>, EncodeError> {
            Ok(Vec::new())
        }

        fn load_state(&mut self, _bytes: &[u8]) -> Result<(), DecodeError> {
            Ok(())
        }
    }

    let mut builder = MachineBuilder::new(CoreConfig::default());
    let unit = builder.add_device("cpu", Canceller::default(), ClockRatio::UNITY);
    let mut machine = builder.build().unwrap();

    machine.run_until(30);
    machine.run_until(100);

    assert!(!machine.device::<Canceller>(unit).unwrap().fired);
    assert_eq!(machine.board().timers().armed_len(), 0);
}
