//! Address spaces and their decode tables
//!
//! Ranges are declared with an optional mirror mask. Mirror bits are "don't care" bits: an entry
//! matches address `a` when `a & !mirror` falls inside `[start, end]`. At build time every entry is
//! expanded over all subsets of its mirror bits into a page table, so a lookup is one page index
//! plus a scan of the (usually one or two) entries that touch that page.

use crate::banking::WindowId;
use crate::bus::HandlerId;
use crate::bus::region::RegionId;
use crate::error::{ConfigError, ConfigResult};
use bincode::{Decode, Encode};
use lockstep_common::num;
use lockstep_config::{AccessKind, BusWidth, Endianness, OverlapPolicy};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

const MAX_PAGES_LOG2: u8 = 16;
const MAX_MIRROR_BITS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct SpaceId(pub(crate) u32);

impl SpaceId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for SpaceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "space#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpaceConfig {
    pub name: String,
    pub addr_bits: u8,
    pub bus_width: BusWidth,
    pub endianness: Endianness,
}

impl SpaceConfig {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        addr_bits: u8,
        bus_width: BusWidth,
        endianness: Endianness,
    ) -> Self {
        Self { name: name.into(), addr_bits, bus_width, endianness }
    }
}

/// What a matched range dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Flat buffer; `offset` is the region byte offset that `start` maps to
    Memory { region: RegionId, offset: u32 },
    /// Whichever bank of the window is currently selected
    Bank { window: WindowId },
    Handler { handler: HandlerId },
    /// Recursive dispatch into another space; `base` is the address `start` maps to
    Space { space: SpaceId, base: u32 },
    /// Reads return open bus and writes are dropped, without the unmapped-access log
    Nop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeEntry {
    pub start: u32,
    pub end: u32,
    pub mirror: u32,
    /// Byte lanes of the native unit that this entry drives
    pub unit_mask: u32,
    pub access: AccessKind,
    pub target: Target,
}

impl RangeEntry {
    #[inline]
    #[must_use]
    pub fn matches(&self, address: u32) -> bool {
        let address = address & !self.mirror;
        (self.start..=self.end).contains(&address)
    }

    /// Byte offset of `address` from the start of the entry, with mirror bits removed.
    #[inline]
    #[must_use]
    pub fn offset(&self, address: u32) -> u32 {
        (address & !self.mirror) - self.start
    }

    fn expansions(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        num::submasks(self.mirror).map(|bits| (self.start | bits, self.end | bits))
    }
}

#[derive(Debug, Clone)]
struct DecodeTable {
    page_shift: u32,
    page_start: Vec<u32>,
    candidates: Vec<u32>,
}

impl DecodeTable {
    #[inline]
    fn candidates(&self, address: u32) -> &[u32] {
        let page = (address >> self.page_shift) as usize;
        let start = self.page_start[page] as usize;
        let end = self.page_start[page + 1] as usize;
        &self.candidates[start..end]
    }
}

#[derive(Debug, Clone)]
pub struct AddressSpace {
    pub(crate) name: String,
    pub(crate) global_mask: u32,
    pub(crate) bus_width: BusWidth,
    pub(crate) endianness: Endianness,
    pub(crate) entries: Vec<RangeEntry>,
    decode: DecodeTable,
    pub(crate) last_value: u32,
}

impl AddressSpace {
    /// Validate the entries and build the decode table.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed ranges and, under [`OverlapPolicy::Reject`], for ranges
    /// that claim the same address and byte lane in the same access direction.
    pub fn new(
        config: &SpaceConfig,
        entries: Vec<RangeEntry>,
        overlap_policy: OverlapPolicy,
    ) -> ConfigResult<Self> {
        if !(1..=32).contains(&config.addr_bits) {
            return Err(ConfigError::InvalidAddressBits {
                space: config.name.clone(),
                bits: config.addr_bits,
            });
        }

        let global_mask = num::low_mask_u32(config.addr_bits.into());
        let entries = entries
            .into_iter()
            .map(|entry| normalize_entry(config, global_mask, entry))
            .collect::<ConfigResult<Vec<_>>>()?;

        let page_shift = u32::from(config.addr_bits.saturating_sub(MAX_PAGES_LOG2));
        let page_count = 1_usize << (u32::from(config.addr_bits) - page_shift);

        let mut pages: Vec<Vec<u32>> = vec![Vec::new(); page_count];
        let mut expansions: Vec<Vec<(u32, u32)>> = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let intervals: Vec<_> = entry.expansions().collect();
            for &(lo, hi) in &intervals {
                for page in (lo >> page_shift)..=(hi >> page_shift) {
                    let list = &mut pages[page as usize];
                    if list.last() != Some(&(index as u32)) {
                        list.push(index as u32);
                    }
                }
            }
            expansions.push(intervals);
        }

        check_overlaps(config, &entries, &pages, &expansions, overlap_policy)?;

        let mut page_start = Vec::with_capacity(page_count + 1);
        let mut candidates = Vec::new();
        for list in &pages {
            page_start.push(candidates.len() as u32);
            candidates.extend_from_slice(list);
        }
        page_start.push(candidates.len() as u32);

        log::debug!(
            "Built space '{}': {} entries, {page_count} pages, {} decode candidates",
            config.name,
            entries.len(),
            candidates.len()
        );

        Ok(Self {
            name: config.name.clone(),
            global_mask,
            bus_width: config.bus_width,
            endianness: config.endianness,
            entries,
            decode: DecodeTable { page_shift, page_start, candidates },
            last_value: 0,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn global_mask(&self) -> u32 {
        self.global_mask
    }

    #[must_use]
    pub fn bus_width(&self) -> BusWidth {
        self.bus_width
    }

    #[must_use]
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    #[must_use]
    pub fn entries(&self) -> &[RangeEntry] {
        &self.entries
    }

    #[inline]
    pub(crate) fn candidate_count(&self, address: u32) -> usize {
        self.decode.candidates(address).len()
    }

    #[inline]
    pub(crate) fn candidate(&self, address: u32, i: usize) -> RangeEntry {
        self.entries[self.decode.candidates(address)[i] as usize]
    }

    /// First entry that serves `address` in the given direction, in declaration order.
    #[must_use]
    pub fn lookup(&self, address: u32, write: bool) -> Option<&RangeEntry> {
        let address = address & self.global_mask;
        self.decode
            .candidates(address)
            .iter()
            .map(|&i| &self.entries[i as usize])
            .find(|entry| {
                let allowed =
                    if write { entry.access.allows_write() } else { entry.access.allows_read() };
                allowed && entry.matches(address)
            })
    }
}

fn normalize_entry(
    config: &SpaceConfig,
    global_mask: u32,
    mut entry: RangeEntry,
) -> ConfigResult<RangeEntry> {
    let space = || config.name.clone();

    if entry.start > entry.end {
        return Err(ConfigError::InvalidRange { space: space(), start: entry.start, end: entry.end });
    }

    if entry.end > global_mask {
        return Err(ConfigError::RangeOutOfBounds {
            space: space(),
            start: entry.start,
            end: entry.end,
            global_mask,
        });
    }

    entry.mirror &= global_mask;
    entry.start &= !entry.mirror;
    entry.end &= !entry.mirror;
    if entry.start > entry.end {
        return Err(ConfigError::InvalidRange { space: space(), start: entry.start, end: entry.end });
    }

    let varying_bits = 32 - (entry.start ^ entry.end).leading_zeros();
    if entry.mirror & num::low_mask_u32(varying_bits) != 0 {
        return Err(ConfigError::MirrorOverlapsRange {
            space: space(),
            start: entry.start,
            end: entry.end,
            mirror: entry.mirror,
        });
    }

    if entry.mirror.count_ones() > MAX_MIRROR_BITS {
        return Err(ConfigError::MirrorTooWide { space: space(), mirror: entry.mirror });
    }

    let unit_bytes = config.bus_width.bytes();
    if entry.start & (unit_bytes - 1) != 0 || entry.end & (unit_bytes - 1) != unit_bytes - 1 {
        return Err(ConfigError::MisalignedRange {
            space: space(),
            start: entry.start,
            end: entry.end,
            unit_bytes,
        });
    }

    let width_mask = config.bus_width.value_mask();
    let lanes_whole =
        (0..unit_bytes).all(|lane| matches!((entry.unit_mask >> (8 * lane)) & 0xff, 0 | 0xff));
    if entry.unit_mask == 0 || entry.unit_mask & !width_mask != 0 || !lanes_whole {
        return Err(ConfigError::InvalidUnitMask { space: space(), unit_mask: entry.unit_mask });
    }

    Ok(entry)
}

fn intervals_intersect(a: &[(u32, u32)], b: &[(u32, u32)]) -> bool {
    // Both lists are sorted and disjoint because mirror bits sit above the range bits
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let (a_lo, a_hi) = a[i];
        let (b_lo, b_hi) = b[j];
        if a_lo <= b_hi && b_lo <= a_hi {
            return true;
        }

        if a_hi < b_hi {
            i += 1;
        } else {
            j += 1;
        }
    }

    false
}

fn check_overlaps(
    config: &SpaceConfig,
    entries: &[RangeEntry],
    pages: &[Vec<u32>],
    expansions: &[Vec<(u32, u32)>],
    overlap_policy: OverlapPolicy,
) -> ConfigResult<()> {
    let mut pairs = BTreeSet::new();
    for list in pages.iter().filter(|list| list.len() > 1) {
        for (k, &first) in list.iter().enumerate() {
            for &second in &list[k + 1..] {
                let (a, b) = (&entries[first as usize], &entries[second as usize]);
                if a.access.overlaps(b.access) && a.unit_mask & b.unit_mask != 0 {
                    pairs.insert((first, second));
                }
            }
        }
    }

    for (first, second) in pairs {
        if !intervals_intersect(&expansions[first as usize], &expansions[second as usize]) {
            continue;
        }

        let (a, b) = (&entries[first as usize], &entries[second as usize]);
        match overlap_policy {
            OverlapPolicy::Reject => {
                return Err(ConfigError::OverlappingRanges {
                    space: config.name.clone(),
                    first_start: a.start,
                    first_end: a.end,
                    second_start: b.start,
                    second_end: b.end,
                });
            }
            OverlapPolicy::FirstMatch => {
                log::warn!(
                    "Space '{}': range {:#X}-{:#X} shadows part of range {:#X}-{:#X}; the earlier declaration wins",
                    config.name,
                    a.start,
                    a.end,
                    b.start,
                    b.end
                );
            }
        }
    }

    Ok(())
}
