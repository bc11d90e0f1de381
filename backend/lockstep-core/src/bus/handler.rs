use crate::board::Board;
use crate::device::UnitId;
use crate::timer::TimerHandle;
use bincode::error::{DecodeError, EncodeError};
use std::any::Any;

/// A memory-mapped device port.
///
/// `offset` is measured in native bus units from the start of the mapped range (mirror bits
/// removed). `mask` selects the lanes being accessed; for entries with a unit mask, both the mask
/// and the data are shifted down so that the entry's lowest lane is bit 0.
///
/// Handlers run synchronously inside bus dispatch and must not call back into the scheduler.
/// Accessing the bus from a handler is allowed; accessing the same handler again from within
/// itself reads open bus.
pub trait BusHandler: Any {
    fn read(&mut self, board: &mut Board, offset: u32, mask: u32) -> u32 {
        let _ = (board, offset);
        mask
    }

    fn write(&mut self, board: &mut Board, offset: u32, value: u32, mask: u32) {
        let _ = (board, offset, value, mask);
    }

    fn timer_expired(&mut self, board: &mut Board, timer: TimerHandle, param: u64) {
        let _ = (board, param);
        log::debug!("Unhandled bus handler timer {timer:?}");
    }

    fn reset(&mut self, board: &mut Board) {
        let _ = board;
    }

    /// # Errors
    ///
    /// Returns an error if the handler state cannot be encoded.
    fn save_state(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(Vec::new())
    }

    /// # Errors
    ///
    /// Returns an error if `bytes` is not a valid state for this handler.
    fn load_state(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        let _ = bytes;
        Ok(())
    }
}

pub type ReadFn = Box<dyn FnMut(&mut Board, u32, u32) -> u32>;
pub type WriteFn = Box<dyn FnMut(&mut Board, u32, u32, u32)>;

/// Stateless handler built from closures, for side-effecting ports such as coin counters and
/// interrupt acknowledge latches.
pub struct FnHandler {
    read: Option<ReadFn>,
    write: Option<WriteFn>,
}

impl FnHandler {
    #[must_use]
    pub fn new(read: Option<ReadFn>, write: Option<WriteFn>) -> Self {
        Self { read, write }
    }

    pub fn reader(read: impl FnMut(&mut Board, u32, u32) -> u32 + 'static) -> Self {
        Self { read: Some(Box::new(read)), write: None }
    }

    pub fn writer(write: impl FnMut(&mut Board, u32, u32, u32) + 'static) -> Self {
        Self { read: None, write: Some(Box::new(write)) }
    }

    /// Any write clears `line` on `unit`.
    #[must_use]
    pub fn irq_ack(unit: UnitId, line: u8) -> Self {
        Self::writer(move |board, _, _, _| board.set_interrupt_line(unit, line, false))
    }
}

impl BusHandler for FnHandler {
    fn read(&mut self, board: &mut Board, offset: u32, mask: u32) -> u32 {
        match &mut self.read {
            Some(read) => read(board, offset, mask),
            None => mask,
        }
    }

    fn write(&mut self, board: &mut Board, offset: u32, value: u32, mask: u32) {
        if let Some(write) = &mut self.write {
            write(board, offset, value, mask);
        }
    }
}
