use bincode::{Decode, Encode};
use std::fmt::{Display, Formatter};
use std::num::NonZeroU64;

macro_rules! impl_display {
    ($name:ident { $($variant:ident => $s:literal),* $(,)? }) => {
        impl $name {
            #[must_use]
            pub fn to_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)*
                }
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.to_str())
            }
        }
    };
}

/// Byte order of multi-byte values on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl_display!(Endianness { Little => "Little", Big => "Big" });

/// Native data width of an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum BusWidth {
    #[default]
    Bits8,
    Bits16,
    Bits32,
}

impl_display!(BusWidth { Bits8 => "Bits8", Bits16 => "Bits16", Bits32 => "Bits32" });

impl BusWidth {
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u32 {
        match self {
            Self::Bits8 => 1,
            Self::Bits16 => 2,
            Self::Bits32 => 4,
        }
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.bytes() * 8
    }

    /// All-ones mask for a value of this width.
    #[inline]
    #[must_use]
    pub const fn value_mask(self) -> u32 {
        match self {
            Self::Bits8 => 0xff,
            Self::Bits16 => 0xffff,
            Self::Bits32 => 0xffff_ffff,
        }
    }

    #[must_use]
    pub const fn from_bytes(bytes: u32) -> Option<Self> {
        match bytes {
            1 => Some(Self::Bits8),
            2 => Some(Self::Bits16),
            4 => Some(Self::Bits32),
            _ => None,
        }
    }
}

/// Value returned by reads that do not hit any mapped range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum OpenBusPolicy {
    #[default]
    AllOnes,
    Zero,
    LastValue,
}

impl_display!(OpenBusPolicy { AllOnes => "AllOnes", Zero => "Zero", LastValue => "LastValue" });

/// How the decoder treats two ranges that claim the same address for the same access direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum OverlapPolicy {
    /// Overlaps are a configuration error.
    #[default]
    Reject,
    /// The range declared first wins; overlaps are logged when the machine is built.
    FirstMatch,
}

impl_display!(OverlapPolicy { Reject => "Reject", FirstMatch => "FirstMatch" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum AccessKind {
    Read,
    Write,
    #[default]
    ReadWrite,
}

impl_display!(AccessKind { Read => "Read", Write => "Write", ReadWrite => "ReadWrite" });

impl AccessKind {
    #[inline]
    #[must_use]
    pub fn allows_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    #[inline]
    #[must_use]
    pub fn allows_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }

    #[inline]
    #[must_use]
    pub fn overlaps(self, other: Self) -> bool {
        (self.allows_read() && other.allows_read()) || (self.allows_write() && other.allows_write())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CoreConfig {
    pub open_bus: OpenBusPolicy,
    pub overlap_policy: OverlapPolicy,
    /// Log unmapped accesses at warn level instead of debug
    pub log_unmapped: bool,
    /// Maximum number of master clock ticks any unit may run ahead of the others
    pub quantum: Option<NonZeroU64>,
}

impl Display for CoreConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "open_bus: {}", self.open_bus)?;
        writeln!(f, "overlap_policy: {}", self.overlap_policy)?;
        writeln!(f, "log_unmapped: {}", self.log_unmapped)?;
        match self.quantum {
            Some(quantum) => write!(f, "quantum: {quantum}"),
            None => write!(f, "quantum: none"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn access_kind_overlap() {
        assert!(AccessKind::Read.overlaps(AccessKind::ReadWrite));
        assert!(AccessKind::Write.overlaps(AccessKind::Write));
        assert!(!AccessKind::Read.overlaps(AccessKind::Write));
    }

    #[test]
    fn bus_width_masks() {
        assert_eq!(BusWidth::Bits16.value_mask(), 0xffff);
        assert_eq!(BusWidth::from_bytes(4), Some(BusWidth::Bits32));
        assert_eq!(BusWidth::from_bytes(3), None);
    }
}
