//! Cycle-counted scheduling and memory-mapped bus core for multi-processor arcade boards.
//!
//! A [`Machine`] owns a set of execution units and a [`Board`]. The board holds everything the
//! units share: address spaces, memory regions, bank windows, bus handlers, interrupt lines and
//! the timer queue. Units, handlers and timer callbacks all receive the board explicitly; there is
//! no global state.

pub mod banking;
pub mod board;
pub mod bus;
pub mod device;
pub mod error;
pub mod machine;
pub mod savestate;
pub mod scheduler;
pub mod screen;
pub mod timer;
pub mod trace;
pub mod watchdog;

pub use board::Board;
pub use bus::handler::{BusHandler, FnHandler};
pub use bus::region::{RegionId, RegionKind};
pub use bus::space::{SpaceConfig, SpaceId};
pub use bus::HandlerId;
pub use banking::{BankMode, WindowId};
pub use device::{ClockRatio, Device, DeviceContext, UnitId};
pub use error::{ConfigError, ConfigResult};
pub use lockstep_config::{
    AccessKind, BusWidth, CoreConfig, Endianness, OpenBusPolicy, OverlapPolicy,
};
pub use machine::{Machine, MachineBuilder};
pub use savestate::{LoadReport, SaveStateError};
pub use timer::{CallbackId, TimerHandle, TimerTarget};
