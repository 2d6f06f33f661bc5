//! Packed 64-bit index entries.
//!
//! An [`Entry`] describes one heap block: where its payload starts, how long
//! it is, and the per-record lock and protection state. Translation-table
//! slots store entries verbatim, so every field lives in one CAS-able word.
//!
//! # Bit Layout
//!
//! ```text
//! Bits    Width  Field
//! ------  -----  -----
//!  0..43    43   payload address
//! 43..53    10   length field (biased by -1)
//! 53         1   length continues in a heap prefix
//! 54..61     7   read-lock count
//! 61         1   write-lock flag
//! 62         1   not movable
//! 63         1   not removable
//! ```
//!
//! Payloads of 1..=1024 bytes keep their whole length in the entry. Longer
//! payloads use a prefix of `w` bytes (1..=4) stored immediately before the
//! payload: the top two bits of the length field hold `w - 1`, the low eight
//! bits hold the high byte of `size - 1`, and the prefix holds the remaining
//! `8 * w` low bits.
//!
//! The all-zero word is [`Entry::FREE`] and the all-ones word is
//! [`Entry::ZOMBIE`]. Neither is ever produced for a real block: payload
//! addresses are never zero and always fit in fewer than 43 bits.

use std::fmt;

use chunkstore_common::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};

use crate::arena::Address;

const ADDRESS_BITS: u32 = 43;
const ADDRESS_MASK: u64 = (1 << ADDRESS_BITS) - 1;

const LENGTH_SHIFT: u32 = 43;
const LENGTH_BITS: u32 = 10;
const LENGTH_MASK: u64 = ((1 << LENGTH_BITS) - 1) << LENGTH_SHIFT;

const SPLIT_BIT: u64 = 1 << 53;

const READ_SHIFT: u32 = 54;
const READ_BITS: u32 = 7;
const READ_MASK: u64 = ((1 << READ_BITS) - 1) << READ_SHIFT;

const WRITE_BIT: u64 = 1 << 61;
const NOT_MOVABLE_BIT: u64 = 1 << 62;
const NOT_REMOVABLE_BIT: u64 = 1 << 63;

/// Lock and protection bits, carried across relocations.
const CONTROL_MASK: u64 = READ_MASK | WRITE_BIT | NOT_MOVABLE_BIT | NOT_REMOVABLE_BIT;

/// Largest payload whose length fits in the entry alone.
pub const MAX_EMBEDDED_SIZE: u64 = 1 << LENGTH_BITS;

/// Largest payload any entry can describe.
pub const MAX_ENCODABLE_SIZE: u64 = 1 << 40;

/// Highest read-lock count the entry can hold.
pub const MAX_READ_COUNT: u64 = (1 << READ_BITS) - 1;

/// How a payload length is split between the entry and the heap prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthLayout {
    prefix_width: usize,
    field: u64,
    prefix: u64,
}

impl LengthLayout {
    /// Computes the layout for a payload of `size` bytes.
    ///
    /// Returns `None` for zero and for sizes above [`MAX_ENCODABLE_SIZE`].
    #[must_use]
    pub fn for_size(size: u64) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let biased = size - 1;
        if biased < MAX_EMBEDDED_SIZE {
            return Some(Self {
                prefix_width: 0,
                field: biased,
                prefix: 0,
            });
        }
        (1..=4usize).find_map(|width| {
            let low_bits = 8 * width as u32;
            let high = biased >> low_bits;
            (high < 256).then(|| Self {
                prefix_width: width,
                field: ((width as u64 - 1) << 8) | high,
                prefix: biased & ((1u64 << low_bits) - 1),
            })
        })
    }

    /// Number of prefix bytes stored before the payload.
    #[inline]
    #[must_use]
    pub fn prefix_width(&self) -> usize {
        self.prefix_width
    }

    /// Whether part of the length lives in the heap prefix.
    #[inline]
    #[must_use]
    pub fn is_split(&self) -> bool {
        self.prefix_width > 0
    }

    /// The 10-bit value stored in the entry.
    #[inline]
    #[must_use]
    pub fn field(&self) -> u64 {
        self.field
    }

    /// The value stored in the heap prefix.
    #[inline]
    #[must_use]
    pub fn prefix(&self) -> u64 {
        self.prefix
    }
}

/// A packed index entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Entry(u64);

impl Entry {
    /// Unused slot.
    pub const FREE: Entry = Entry(0);

    /// Deleted record whose slot has not been recycled yet.
    pub const ZOMBIE: Entry = Entry(u64::MAX);

    /// Builds an unlocked, unprotected entry for a payload at `address`.
    #[must_use]
    pub fn new(address: Address, layout: &LengthLayout) -> Self {
        let mut raw = (address.as_u64() & ADDRESS_MASK) | (layout.field << LENGTH_SHIFT);
        if layout.is_split() {
            raw |= SPLIT_BIT;
        }
        Self(raw)
    }

    /// Wraps a raw word.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw word.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns true for [`Entry::FREE`].
    #[inline]
    #[must_use]
    pub const fn is_free(self) -> bool {
        self.0 == Self::FREE.0
    }

    /// Returns true for [`Entry::ZOMBIE`].
    #[inline]
    #[must_use]
    pub const fn is_zombie(self) -> bool {
        self.0 == Self::ZOMBIE.0
    }

    /// Returns true unless the entry is one of the two sentinels.
    #[inline]
    #[must_use]
    pub const fn is_live(self) -> bool {
        !self.is_free() && !self.is_zombie()
    }

    // =========================================================================
    // Address and length
    // =========================================================================

    /// Payload address.
    #[inline]
    #[must_use]
    pub const fn address(self) -> Address {
        Address::new(self.0 & ADDRESS_MASK)
    }

    /// Returns a copy pointing at a different payload address.
    #[inline]
    #[must_use]
    pub const fn with_address(self, address: Address) -> Self {
        Self((self.0 & !ADDRESS_MASK) | (address.as_u64() & ADDRESS_MASK))
    }

    /// Raw 10-bit length field.
    #[inline]
    #[must_use]
    pub const fn length_field(self) -> u64 {
        (self.0 & LENGTH_MASK) >> LENGTH_SHIFT
    }

    /// Whether the length continues in a heap prefix.
    #[inline]
    #[must_use]
    pub const fn is_split(self) -> bool {
        self.0 & SPLIT_BIT != 0
    }

    /// Width of the heap prefix in bytes (0 for embedded lengths).
    #[inline]
    #[must_use]
    pub const fn prefix_width(self) -> usize {
        if self.is_split() {
            (self.length_field() >> 8) as usize + 1
        } else {
            0
        }
    }

    /// Length if it is fully embedded in the entry.
    #[inline]
    #[must_use]
    pub const fn embedded_length(self) -> Option<u64> {
        if self.is_split() {
            None
        } else {
            Some(self.length_field() + 1)
        }
    }

    /// Decodes the payload length.
    ///
    /// `read_prefix(address, width)` is called at most once, only for split
    /// lengths, to fetch the prefix stored before the payload.
    pub fn length<F>(self, read_prefix: F) -> StoreResult<u64>
    where
        F: FnOnce(Address, usize) -> StoreResult<u64>,
    {
        match self.embedded_length() {
            Some(len) => Ok(len),
            None => {
                let width = self.prefix_width();
                let prefix_at = self
                    .address()
                    .as_u64()
                    .checked_sub(width as u64)
                    .ok_or_else(|| {
                        StoreError::corruption(self.address().as_u64(), "length prefix before arena start")
                    })?;
                let low = read_prefix(Address::new(prefix_at), width)?;
                let high = self.length_field() & 0xFF;
                Ok(((high << (8 * width)) | low) + 1)
            }
        }
    }

    /// Returns true if both entries describe the same block with the same
    /// encoded length, ignoring lock and protection bits.
    #[inline]
    #[must_use]
    pub const fn same_block(self, other: Entry) -> bool {
        self.0 & !CONTROL_MASK == other.0 & !CONTROL_MASK
    }

    /// Returns a copy whose lock and protection bits are taken from `other`.
    #[inline]
    #[must_use]
    pub const fn with_control_bits_of(self, other: Entry) -> Self {
        Self((self.0 & !CONTROL_MASK) | (other.0 & CONTROL_MASK))
    }

    // =========================================================================
    // Lock bits
    // =========================================================================

    /// Number of read locks held.
    #[inline]
    #[must_use]
    pub const fn read_count(self) -> u64 {
        (self.0 & READ_MASK) >> READ_SHIFT
    }

    /// Returns a copy with the read count replaced (saturating at 127).
    #[inline]
    #[must_use]
    pub const fn with_read_count(self, count: u64) -> Self {
        let count = if count > MAX_READ_COUNT { MAX_READ_COUNT } else { count };
        Self((self.0 & !READ_MASK) | (count << READ_SHIFT))
    }

    /// Whether the write lock is held.
    #[inline]
    #[must_use]
    pub const fn is_write_locked(self) -> bool {
        self.0 & WRITE_BIT != 0
    }

    /// Returns a copy with the write flag set or cleared.
    #[inline]
    #[must_use]
    pub const fn with_write_lock(self, locked: bool) -> Self {
        if locked {
            Self(self.0 | WRITE_BIT)
        } else {
            Self(self.0 & !WRITE_BIT)
        }
    }

    /// Whether any lock is held.
    #[inline]
    #[must_use]
    pub const fn is_locked(self) -> bool {
        self.is_write_locked() || self.read_count() > 0
    }

    /// Returns a copy with all lock state cleared.
    #[inline]
    #[must_use]
    pub const fn unlocked(self) -> Self {
        Self(self.0 & !(READ_MASK | WRITE_BIT))
    }

    // =========================================================================
    // Protection flags
    // =========================================================================

    /// Whether the block must stay at its address.
    #[inline]
    #[must_use]
    pub const fn is_not_movable(self) -> bool {
        self.0 & NOT_MOVABLE_BIT != 0
    }

    /// Returns a copy with the not-movable flag set or cleared.
    #[inline]
    #[must_use]
    pub const fn with_not_movable(self, flag: bool) -> Self {
        if flag {
            Self(self.0 | NOT_MOVABLE_BIT)
        } else {
            Self(self.0 & !NOT_MOVABLE_BIT)
        }
    }

    /// Whether the record refuses removal.
    #[inline]
    #[must_use]
    pub const fn is_not_removable(self) -> bool {
        self.0 & NOT_REMOVABLE_BIT != 0
    }

    /// Returns a copy with the not-removable flag set or cleared.
    #[inline]
    #[must_use]
    pub const fn with_not_removable(self, flag: bool) -> Self {
        if flag {
            Self(self.0 | NOT_REMOVABLE_BIT)
        } else {
            Self(self.0 & !NOT_REMOVABLE_BIT)
        }
    }

    /// On a table entry, both protection flags mark a subtree without
    /// zombies.
    #[inline]
    #[must_use]
    pub const fn is_subtree_full(self) -> bool {
        self.0 & (NOT_MOVABLE_BIT | NOT_REMOVABLE_BIT) == NOT_MOVABLE_BIT | NOT_REMOVABLE_BIT
    }

    /// Returns a copy with the subtree-full marker set or cleared.
    #[inline]
    #[must_use]
    pub const fn with_subtree_full(self, full: bool) -> Self {
        self.with_not_movable(full).with_not_removable(full)
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_free() {
            return f.write_str("Entry(FREE)");
        }
        if self.is_zombie() {
            return f.write_str("Entry(ZOMBIE)");
        }
        f.debug_struct("Entry")
            .field("address", &self.address())
            .field("length_field", &self.length_field())
            .field("split", &self.is_split())
            .field("readers", &self.read_count())
            .field("writer", &self.is_write_locked())
            .field("not_movable", &self.is_not_movable())
            .field("not_removable", &self.is_not_removable())
            .finish()
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}
