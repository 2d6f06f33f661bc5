//! Boundary markers.
//!
//! Every block in the payload region is flanked by one marker byte on each
//! side, and neighbouring blocks share the marker between them. The high
//! nibble describes the block to the left of the marker, the low nibble the
//! block to the right:
//!
//! ```text
//! Nibble   Meaning
//! ------   -------
//!   0      edge of the payload region
//!   1      free block of zero bytes
//!   2      free block of one byte
//!  3..=8   free block with a (n - 2)-byte length at both ends
//!  9..=13  allocated block with a (n - 9)-byte length prefix
//! ```
//!
//! Knowing the neighbour's state and length width from one byte is enough to
//! recover its extent, which makes coalescing O(1).

/// Largest length-field width of a free block.
pub const MAX_FREE_WIDTH: usize = 6;

/// Largest length-prefix width of an allocated block.
pub const MAX_PREFIX_WIDTH: usize = 4;

const EDGE: u8 = 0;
const GAP: u8 = 1;
const SINGLE: u8 = 2;
const FREE_BASE: u8 = 2;
const ALLOCATED_BASE: u8 = 9;

/// State of the block on one side of a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Start or end of the payload region.
    Edge,
    /// Free block of zero bytes (two markers side by side).
    Gap,
    /// Free block of one byte.
    Single,
    /// Free block whose length is stored at both ends in this many bytes.
    Free(usize),
    /// Allocated block with a length prefix of this many bytes.
    Allocated(usize),
}

impl Side {
    /// State of a free block of `size` bytes.
    #[must_use]
    pub fn free(size: u64) -> Self {
        match size {
            0 => Self::Gap,
            1 => Self::Single,
            _ => Self::Free(length_width(size)),
        }
    }

    /// Returns true for the three free states.
    #[inline]
    #[must_use]
    pub const fn is_free(self) -> bool {
        matches!(self, Self::Gap | Self::Single | Self::Free(_))
    }

    /// Encodes the state as a nibble.
    #[must_use]
    pub const fn nibble(self) -> u8 {
        match self {
            Self::Edge => EDGE,
            Self::Gap => GAP,
            Self::Single => SINGLE,
            Self::Free(width) => FREE_BASE + width as u8,
            Self::Allocated(width) => ALLOCATED_BASE + width as u8,
        }
    }

    /// Decodes a nibble, returning `None` for unused values.
    #[must_use]
    pub const fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            EDGE => Some(Self::Edge),
            GAP => Some(Self::Gap),
            SINGLE => Some(Self::Single),
            3..=8 => Some(Self::Free((nibble - FREE_BASE) as usize)),
            9..=13 => Some(Self::Allocated((nibble - ALLOCATED_BASE) as usize)),
            _ => None,
        }
    }
}

/// Smallest number of bytes (1..=6) able to hold `size`.
#[must_use]
pub fn length_width(size: u64) -> usize {
    let bits = 64 - size.leading_zeros() as usize;
    bits.div_ceil(8).clamp(1, MAX_FREE_WIDTH)
}

/// Packs the states of the left and right block into a marker byte.
#[inline]
#[must_use]
pub const fn encode(left: Side, right: Side) -> u8 {
    (left.nibble() << 4) | right.nibble()
}

/// Unpacks a marker byte, returning `None` if either nibble is invalid.
#[inline]
#[must_use]
pub const fn decode(marker: u8) -> Option<(Side, Side)> {
    match (Side::from_nibble(marker >> 4), Side::from_nibble(marker & 0x0F)) {
        (Some(left), Some(right)) => Some((left, right)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nibbles_roundtrip() {
        let mut states = vec![Side::Edge, Side::Gap, Side::Single];
        states.extend((1..=MAX_FREE_WIDTH).map(Side::Free));
        states.extend((0..=MAX_PREFIX_WIDTH).map(Side::Allocated));

        for left in &states {
            for right in &states {
                assert_eq!(decode(encode(*left, *right)), Some((*left, *right)));
            }
        }
    }

    #[test]
    fn test_invalid_nibbles() {
        assert_eq!(Side::from_nibble(14), None);
        assert_eq!(Side::from_nibble(15), None);
        assert_eq!(decode(0xF0), None);
        assert_eq!(decode(0x0E), None);
    }

    #[test]
    fn test_free_states() {
        assert_eq!(Side::free(0), Side::Gap);
        assert_eq!(Side::free(1), Side::Single);
        assert_eq!(Side::free(2), Side::Free(1));
        assert_eq!(Side::free(255), Side::Free(1));
        assert_eq!(Side::free(256), Side::Free(2));
        assert!(Side::free(10).is_free());
        assert!(!Side::Allocated(0).is_free());
        assert!(!Side::Edge.is_free());
    }

    #[test]
    fn test_length_width() {
        assert_eq!(length_width(0), 1);
        assert_eq!(length_width(0xFF), 1);
        assert_eq!(length_width(0x100), 2);
        assert_eq!(length_width(0xFFFF_FFFF), 4);
        assert_eq!(length_width(1 << 40), 6);
    }
}
