use std::ops::RangeInclusive;

/// Bit and bit-field access for register and color words.
pub trait BitField: Copy {
    #[must_use]
    fn bit(self, i: u8) -> bool;

    /// Bits `range` shifted down to bit 0.
    #[must_use]
    fn field(self, range: RangeInclusive<u8>) -> Self;

    /// `self` with bits `range` replaced by the low bits of `value`.
    #[must_use]
    fn with_field(self, range: RangeInclusive<u8>, value: Self) -> Self;
}

fn field_mask(range: &RangeInclusive<u8>, bits: u32) -> u32 {
    let (start, end) = (u32::from(*range.start()), u32::from(*range.end()));
    debug_assert!(start <= end && end < bits);
    low_mask_u32(end - start + 1) << start
}

impl BitField for u16 {
    #[inline]
    fn bit(self, i: u8) -> bool {
        u32::from(self).bit(i)
    }

    #[inline]
    fn field(self, range: RangeInclusive<u8>) -> Self {
        let mask = field_mask(&range, Self::BITS);
        ((u32::from(self) & mask) >> range.start()) as Self
    }

    #[inline]
    fn with_field(self, range: RangeInclusive<u8>, value: Self) -> Self {
        u32::from(self).with_field(range, value.into()) as Self
    }
}

impl BitField for u32 {
    #[inline]
    fn bit(self, i: u8) -> bool {
        debug_assert!(u32::from(i) < Self::BITS);
        self & (1 << i) != 0
    }

    #[inline]
    fn field(self, range: RangeInclusive<u8>) -> Self {
        (self & field_mask(&range, Self::BITS)) >> range.start()
    }

    #[inline]
    fn with_field(self, range: RangeInclusive<u8>, value: Self) -> Self {
        let mask = field_mask(&range, Self::BITS);
        (self & !mask) | ((value << range.start()) & mask)
    }
}

/// Mask with the lowest `bits` bits set; `bits` may be 0..=32.
#[inline]
#[must_use]
pub fn low_mask_u32(bits: u32) -> u32 {
    match bits {
        0 => 0,
        32.. => u32::MAX,
        _ => (1 << bits) - 1,
    }
}

/// Iterate over every subset of the set bits of `mask`, starting with 0 and ending with `mask`.
pub fn submasks(mask: u32) -> impl Iterator<Item = u32> {
    let mut next = Some(0_u32);
    std::iter::from_fn(move || {
        let current = next?;
        next = (current != mask).then(|| (current.wrapping_sub(mask)) & mask);
        Some(current)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn bit_fields() {
        assert!(0x8000_u16.bit(15));
        assert!(!0x8000_u16.bit(14));
        assert_eq!(0x7c00_u16.field(10..=14), 0x1f);
        assert_eq!(0xdead_beef_u32.field(0..=31), 0xdead_beef);
        assert_eq!(0x1234_u16.with_field(4..=7, 0xf), 0x12f4);
        assert_eq!(0xffff_ffff_u32.with_field(8..=15, 0x1_00), 0xffff_00ff);
    }

    #[test]
    fn low_masks() {
        assert_eq!(low_mask_u32(0), 0);
        assert_eq!(low_mask_u32(14), 0x3fff);
        assert_eq!(low_mask_u32(32), u32::MAX);
    }

    #[test]
    fn submask_enumeration() {
        let mut all: Vec<_> = submasks(0x0c00).collect();
        all.sort_unstable();
        assert_eq!(all, vec![0x0000, 0x0400, 0x0800, 0x0c00]);

        assert_eq!(submasks(0).collect::<Vec<_>>(), vec![0]);
        assert_eq!(submasks(0b1011).count(), 8);
    }
}
