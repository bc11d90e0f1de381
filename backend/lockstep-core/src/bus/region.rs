use bincode::{Decode, Encode};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct RegionId(pub(crate) u32);

impl RegionId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for RegionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RegionKind {
    /// Writable memory; contents are persisted in save states
    Ram,
    /// Contents are supplied by the ROM loader and never persisted
    Rom,
    /// Copy target of a bank window; contents are re-derived from the bank selection
    Staging,
}

impl RegionKind {
    #[inline]
    #[must_use]
    pub fn is_persisted(self) -> bool {
        self == Self::Ram
    }
}

#[derive(Debug, Clone)]
pub struct MemoryRegion {
    pub(crate) name: String,
    pub(crate) kind: RegionKind,
    pub(crate) data: Vec<u8>,
}

impl MemoryRegion {
    pub(crate) fn new(name: String, kind: RegionKind, data: Vec<u8>) -> Self {
        Self { name, kind, data }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    pub(crate) fn read_byte(&self, offset: usize) -> Option<u8> {
        self.data.get(offset).copied()
    }

    #[inline]
    pub(crate) fn write_byte(&mut self, offset: usize, value: u8) {
        if let Some(byte) = self.data.get_mut(offset) {
            *byte = value;
        }
    }
}

/// Borrow one region immutably and a different region mutably.
pub(crate) fn split_pair(
    regions: &mut [MemoryRegion],
    src: RegionId,
    dst: RegionId,
) -> Option<(&MemoryRegion, &mut MemoryRegion)> {
    let (src, dst) = (src.index(), dst.index());
    if src == dst || src >= regions.len() || dst >= regions.len() {
        return None;
    }

    if src < dst {
        let (left, right) = regions.split_at_mut(dst);
        Some((&left[src], &mut right[0]))
    } else {
        let (left, right) = regions.split_at_mut(src);
        Some((&right[0], &mut left[dst]))
    }
}
