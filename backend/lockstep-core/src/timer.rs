//! Timer queue ordered by absolute master-clock fire time
//!
//! Timers live in generation-checked slots so that handles stay valid across re-arms and become
//! stale once a one-shot timer is freed. The heap holds `(fire_time, sequence, slot)` triples and
//! is cleaned lazily: cancelling or adjusting a timer never searches the heap, it just bumps the
//! slot's sequence number so that the old heap entry no longer matches.

use crate::bus::HandlerId;
use crate::device::{ClockRatio, UnitId};
use bincode::de::{BorrowDecoder, Decoder};
use bincode::enc::Encoder;
use bincode::error::{DecodeError, EncodeError};
use bincode::{BorrowDecode, Decode, Encode};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct CallbackId(pub(crate) u32);

impl CallbackId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Who gets notified when a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum TimerTarget {
    Unit(UnitId),
    Handler(HandlerId),
    Callback(CallbackId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct TimerHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
enum SlotState {
    Free,
    Idle,
    Armed { seq: u64 },
    Firing,
}

/// Schedule of a timer armed in a unit's local cycles. Each firing is converted to master time
/// separately so that periods that are not a whole number of master ticks do not accumulate
/// rounding error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
struct LocalSchedule {
    clock: ClockRatio,
    fire_cycles: u64,
    interval_cycles: u64,
}

#[derive(Debug, Clone, Encode, Decode)]
struct TimerSlot {
    generation: u32,
    state: SlotState,
    target: TimerTarget,
    param: u64,
    fire_time: u64,
    interval: u64,
    local: Option<LocalSchedule>,
    // Persistent slots go back to Idle instead of being freed
    persistent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredTimer {
    pub handle: TimerHandle,
    pub target: TimerTarget,
    pub param: u64,
    pub fire_time: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TimerQueue {
    slots: Vec<TimerSlot>,
    free: Vec<u32>,
    heap: BinaryHeap<Reverse<(u64, u64, u32)>>,
    next_seq: u64,
}

impl TimerQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn from_parts(slots: Vec<TimerSlot>, next_seq: u64) -> Self {
        let mut queue = Self { slots, free: Vec::new(), heap: BinaryHeap::new(), next_seq };
        queue.rebuild_indices();
        queue
    }

    fn rebuild_indices(&mut self) {
        self.free.clear();
        self.heap.clear();
        for (index, slot) in self.slots.iter().enumerate() {
            match slot.state {
                SlotState::Free => self.free.push(index as u32),
                SlotState::Armed { seq } => {
                    self.heap.push(Reverse((slot.fire_time, seq, index as u32)));
                }
                SlotState::Idle | SlotState::Firing => {}
            }
        }

        // Pop from the end so that the lowest free index is reused first
        self.free.reverse();
    }

    fn insert(&mut self, target: TimerTarget, param: u64, persistent: bool) -> TimerHandle {
        let slot = TimerSlot {
            generation: 0,
            state: SlotState::Idle,
            target,
            param,
            fire_time: 0,
            interval: 0,
            local: None,
            persistent,
        };

        let index = match self.free.pop() {
            Some(index) => {
                let generation = self.slots[index as usize].generation;
                self.slots[index as usize] = TimerSlot { generation, ..slot };
                index
            }
            None => {
                self.slots.push(slot);
                (self.slots.len() - 1) as u32
            }
        };

        TimerHandle { index, generation: self.slots[index as usize].generation }
    }

    fn slot_index(&self, handle: TimerHandle) -> Option<usize> {
        let index = handle.index as usize;
        let slot = self.slots.get(index)?;
        (slot.generation == handle.generation && slot.state != SlotState::Free).then_some(index)
    }

    fn arm(&mut self, index: usize, fire_time: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let slot = &mut self.slots[index];
        slot.fire_time = fire_time;
        slot.state = SlotState::Armed { seq };
        self.heap.push(Reverse((fire_time, seq, index as u32)));
    }

    fn release(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        if slot.persistent {
            slot.state = SlotState::Idle;
        } else {
            slot.state = SlotState::Free;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index as u32);
        }
    }

    /// Allocate a persistent, disarmed timer. The handle stays valid until the queue is dropped.
    pub fn allocate(&mut self, target: TimerTarget, param: u64) -> TimerHandle {
        self.insert(target, param, true)
    }

    /// Arm a new timer at an absolute fire time. A zero interval makes it a one-shot timer whose
    /// handle becomes stale after it fires.
    pub fn schedule(
        &mut self,
        target: TimerTarget,
        fire_time: u64,
        interval: u64,
        param: u64,
    ) -> TimerHandle {
        let handle = self.insert(target, param, false);
        let index = handle.index as usize;
        self.slots[index].interval = interval;
        self.arm(index, fire_time);
        handle
    }

    /// Arm a new timer at local cycle `fire_cycles` of a unit clocked at `clock`. A nonzero
    /// `interval_cycles` repeats it every that many local cycles.
    pub fn schedule_local(
        &mut self,
        target: TimerTarget,
        clock: ClockRatio,
        fire_cycles: u64,
        interval_cycles: u64,
        param: u64,
    ) -> TimerHandle {
        let handle = self.insert(target, param, false);
        let index = handle.index as usize;
        self.slots[index].local = Some(LocalSchedule { clock, fire_cycles, interval_cycles });
        self.arm(index, clock.local_to_master(fire_cycles));
        handle
    }

    /// Re-arm an existing timer at a new absolute fire time, keeping its handle, interval and
    /// (unless replaced) its payload.
    pub fn adjust(&mut self, handle: TimerHandle, fire_time: u64, param: Option<u64>) -> bool {
        let Some(index) = self.slot_index(handle) else {
            log::debug!("Ignoring adjust of stale timer handle {handle:?}");
            return false;
        };

        let slot = &mut self.slots[index];
        if let Some(param) = param {
            slot.param = param;
        }
        if let Some(local) = &mut slot.local {
            local.fire_cycles = local.clock.master_to_local_ceil(fire_time);
        }
        self.arm(index, fire_time);

        true
    }

    /// Re-arm an existing timer at local cycle `fire_cycles`, keeping its handle and period.
    pub fn adjust_local(
        &mut self,
        handle: TimerHandle,
        clock: ClockRatio,
        fire_cycles: u64,
        param: Option<u64>,
    ) -> bool {
        let Some(index) = self.slot_index(handle) else {
            log::debug!("Ignoring adjust of stale timer handle {handle:?}");
            return false;
        };

        let slot = &mut self.slots[index];
        if let Some(param) = param {
            slot.param = param;
        }
        let interval_cycles = slot.local.map_or(0, |local| local.interval_cycles);
        slot.local = Some(LocalSchedule { clock, fire_cycles, interval_cycles });
        self.arm(index, clock.local_to_master(fire_cycles));

        true
    }

    /// Set the period in master ticks. A timer armed in local cycles switches to master timing.
    pub fn set_interval(&mut self, handle: TimerHandle, interval: u64) -> bool {
        let Some(index) = self.slot_index(handle) else { return false };
        let slot = &mut self.slots[index];
        slot.interval = interval;
        slot.local = None;
        true
    }

    /// Disarm a timer. Safe to call from within the timer's own callback.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let Some(index) = self.slot_index(handle) else {
            log::debug!("Ignoring cancel of stale timer handle {handle:?}");
            return false;
        };

        self.release(index);
        true
    }

    #[must_use]
    pub fn is_valid(&self, handle: TimerHandle) -> bool {
        self.slot_index(handle).is_some()
    }

    #[must_use]
    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.slot_index(handle)
            .is_some_and(|index| matches!(self.slots[index].state, SlotState::Armed { .. }))
    }

    /// Absolute fire time of an armed timer.
    #[must_use]
    pub fn fire_time(&self, handle: TimerHandle) -> Option<u64> {
        let index = self.slot_index(handle)?;
        let slot = &self.slots[index];
        matches!(slot.state, SlotState::Armed { .. }).then_some(slot.fire_time)
    }

    #[must_use]
    pub fn param(&self, handle: TimerHandle) -> Option<u64> {
        self.slot_index(handle).map(|index| self.slots[index].param)
    }

    fn is_live(&self, seq: u64, index: u32) -> bool {
        self.slots
            .get(index as usize)
            .is_some_and(|slot| slot.state == SlotState::Armed { seq })
    }

    fn drop_stale_heads(&mut self) {
        while let Some(&Reverse((_, seq, index))) = self.heap.peek() {
            if self.is_live(seq, index) {
                return;
            }
            self.heap.pop();
        }
    }

    /// Fire time of the earliest armed timer.
    pub fn next_fire_time(&mut self) -> Option<u64> {
        self.drop_stale_heads();
        self.heap.peek().map(|&Reverse((fire_time, _, _))| fire_time)
    }

    /// Remove the earliest timer if it is due at or before `now`.
    ///
    /// Periodic timers are re-armed at `fire_time + interval` before this returns, so the callback
    /// may cancel or adjust them. One-shot timers stay in the firing state until
    /// [`finish_fire`](Self::finish_fire) is called.
    pub fn pop_due(&mut self, now: u64) -> Option<FiredTimer> {
        self.drop_stale_heads();

        let &Reverse((fire_time, _, index)) = self.heap.peek()?;
        if fire_time > now {
            return None;
        }
        self.heap.pop();

        let index = index as usize;
        let slot = &mut self.slots[index];
        let fired = FiredTimer {
            handle: TimerHandle { index: index as u32, generation: slot.generation },
            target: slot.target,
            param: slot.param,
            fire_time,
        };

        let next_fire = match &mut slot.local {
            Some(local) if local.interval_cycles != 0 => {
                local.fire_cycles = local.fire_cycles.saturating_add(local.interval_cycles);
                Some(local.clock.local_to_master(local.fire_cycles))
            }
            Some(_) => None,
            None => (slot.interval != 0).then(|| fire_time.saturating_add(slot.interval)),
        };

        match next_fire {
            Some(next_fire) => self.arm(index, next_fire),
            None => slot.state = SlotState::Firing,
        }

        Some(fired)
    }

    /// Release a one-shot timer after its callback returned, unless the callback re-armed it.
    pub fn finish_fire(&mut self, handle: TimerHandle) {
        if let Some(index) = self.slot_index(handle)
            && self.slots[index].state == SlotState::Firing
        {
            self.release(index);
        }
    }

    /// Free every timer whose target fails the predicate, returning how many were dropped.
    pub fn retain_targets(&mut self, mut valid: impl FnMut(TimerTarget) -> bool) -> usize {
        let mut dropped = 0;
        for slot in &mut self.slots {
            if slot.state != SlotState::Free && !valid(slot.target) {
                slot.state = SlotState::Free;
                slot.generation = slot.generation.wrapping_add(1);
                slot.persistent = false;
                dropped += 1;
            }
        }

        if dropped != 0 {
            self.rebuild_indices();
        }

        dropped
    }

    /// Number of armed timers.
    #[must_use]
    pub fn armed_len(&self) -> usize {
        self.slots.iter().filter(|slot| matches!(slot.state, SlotState::Armed { .. })).count()
    }
}

impl Encode for TimerQueue {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        self.slots.encode(encoder)?;
        self.next_seq.encode(encoder)
    }
}

impl<Context> Decode<Context> for TimerQueue {
    fn decode<D: Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let slots: Vec<TimerSlot> = Vec::decode(decoder)?;
        let next_seq = u64::decode(decoder)?;
        Ok(Self::from_parts(slots, next_seq))
    }
}

impl<'de, Context> BorrowDecode<'de, Context> for TimerQueue {
    fn borrow_decode<D: BorrowDecoder<'de, Context = Context>>(
        decoder: &mut D,
    ) -> Result<Self, DecodeError> {
        Self::decode(decoder)
    }
}
