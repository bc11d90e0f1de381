//! Bank windows
//!
//! A window maps one of `bank_count` equally sized slices of a source region into the address
//! space. Indirect windows read the selected slice in place; copy windows physically copy it into
//! a staging region for consumers that need contiguous decoded memory. Either way the selected
//! index is the only state, and save states persist nothing else.

pub mod slapstic;

use crate::board::Board;
use crate::bus::region::{self, RegionId};
use bincode::{Decode, Encode};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct WindowId(pub(crate) u32);

impl WindowId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for WindowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "window#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankMode {
    Indirect,
    Copy { staging: RegionId },
}

#[derive(Debug, Clone)]
pub struct BankWindow {
    pub(crate) name: String,
    pub(crate) source: RegionId,
    pub(crate) source_offset: u32,
    pub(crate) bank_size: u32,
    pub(crate) bank_count: u32,
    pub(crate) selected: u32,
    pub(crate) mode: BankMode,
}

impl BankWindow {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn selected(&self) -> u32 {
        self.selected
    }

    #[must_use]
    pub fn bank_count(&self) -> u32 {
        self.bank_count
    }

    #[must_use]
    pub fn bank_size(&self) -> u32 {
        self.bank_size
    }

    fn bank_offset(&self, index: u32) -> usize {
        self.source_offset as usize + index as usize * self.bank_size as usize
    }

    /// Region and byte offset that window offset 0 currently resolves to.
    pub(crate) fn active_slice(&self) -> (RegionId, usize) {
        match self.mode {
            BankMode::Indirect => (self.source, self.bank_offset(self.selected)),
            BankMode::Copy { staging } => (staging, 0),
        }
    }
}

impl Board {
    /// Select bank `index` of `window`. Reselecting the active bank is a no-op; out-of-range
    /// indices are ignored. Returns whether `index` is now the active bank.
    pub fn select_bank(&mut self, window: WindowId, index: u32) -> bool {
        self.apply_bank(window, index, false)
    }

    /// Select a bank even if it is already active, redoing the staging copy.
    pub(crate) fn reapply_bank(&mut self, window: WindowId, index: u32) -> bool {
        self.apply_bank(window, index, true)
    }

    fn apply_bank(&mut self, window_id: WindowId, index: u32, force: bool) -> bool {
        let Some(window) = self.bus.windows.get_mut(window_id.index()) else {
            log::warn!("Bank select on nonexistent {window_id}");
            return false;
        };

        if index >= window.bank_count {
            log::warn!(
                "Bank window '{}': ignoring select of bank {index}, only {} banks",
                window.name,
                window.bank_count
            );
            return false;
        }

        if index == window.selected && !force {
            return true;
        }

        window.selected = index;
        log::trace!("Bank window '{}' -> bank {index}", window.name);

        if let BankMode::Copy { staging } = window.mode {
            let start = window.bank_offset(index);
            let len = window.bank_size as usize;
            let source = window.source;
            if let Some((src, dst)) = region::split_pair(&mut self.bus.regions, source, staging) {
                dst.data[..len].copy_from_slice(&src.data[start..start + len]);
            }
        }

        true
    }

    #[must_use]
    pub fn selected_bank(&self, window: WindowId) -> Option<u32> {
        self.bus.windows.get(window.index()).map(|window| window.selected)
    }

    #[must_use]
    pub fn bank_window(&self, window: WindowId) -> Option<&BankWindow> {
        self.bus.windows.get(window.index())
    }

    /// Byte at `offset` within the currently selected bank of `window`.
    #[must_use]
    pub fn read_bank_byte(&self, window: WindowId, offset: u32) -> Option<u8> {
        let window = self.bus.windows.get(window.index())?;
        if offset >= window.bank_size {
            return None;
        }

        let (region, base) = window.active_slice();
        self.bus.regions.get(region.index())?.read_byte(base + offset as usize)
    }
}
