//! Heap geometry and counters.

use chunkstore_common::constants::{MAX_ARENA_SIZE, MAX_BLOCK_SIZE_LIMIT};
use chunkstore_common::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};

use super::marker::length_width;
use crate::arena::Address;

/// Lower bounds of the fixed small size classes. Class 0 catches everything
/// below 16 bytes.
const FIXED_CLASS_BOUNDS: [u64; 6] = [0, 16, 24, 32, 48, 64];

/// Smallest payload region the heap accepts.
const MIN_PAYLOAD_REGION: u64 = 64;

/// Static geometry of a heap, fixed when the arena is formatted.
///
/// ```text
/// 0                                base_free_list          arena_size
/// | M | block | M | block | ... | M | list heads (ptr width each) |
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapLayout {
    /// Total arena size in bytes.
    pub arena_size: u64,
    /// Largest payload a single allocation may request.
    pub max_block_size: u64,
    /// Start of the free-list head array; end of the payload region.
    pub base_free_list: u64,
    /// Bytes per free-list pointer.
    pub pointer_width: usize,
    /// Lower bound of every size class, ascending. The last class is
    /// unbounded.
    pub class_bounds: Vec<u64>,
}

impl HeapLayout {
    /// Computes the layout for an arena of `arena_size` bytes.
    pub fn new(arena_size: u64, max_block_size: u64) -> StoreResult<Self> {
        if arena_size >= MAX_ARENA_SIZE {
            return Err(StoreError::config(format!(
                "arena of {arena_size} bytes exceeds the addressable {MAX_ARENA_SIZE} bytes"
            )));
        }
        if max_block_size == 0 || max_block_size > MAX_BLOCK_SIZE_LIMIT {
            return Err(StoreError::config(format!(
                "max block size {max_block_size} not in [1, {MAX_BLOCK_SIZE_LIMIT}]"
            )));
        }

        let class_bounds = class_bounds(max_block_size);
        let pointer_width = pointer_width(arena_size);
        let heads = (class_bounds.len() * pointer_width) as u64;
        let base_free_list = arena_size.saturating_sub(heads);

        if base_free_list < MIN_PAYLOAD_REGION {
            return Err(StoreError::config(format!(
                "arena of {arena_size} bytes is too small for a heap"
            )));
        }
        if max_block_size >= base_free_list {
            return Err(StoreError::config(format!(
                "max block size {max_block_size} must be below the payload region of {base_free_list} bytes"
            )));
        }

        Ok(Self {
            arena_size,
            max_block_size,
            base_free_list,
            pointer_width,
            class_bounds,
        })
    }

    /// Checks a layout read back from a dump against the rules of [`new`].
    ///
    /// [`new`]: HeapLayout::new
    pub fn validate(&self) -> StoreResult<()> {
        let expected = Self::new(self.arena_size, self.max_block_size)?;
        if expected == *self {
            Ok(())
        } else {
            Err(StoreError::dump_corrupted(format!(
                "heap layout {self:?} does not match derived layout {expected:?}"
            )))
        }
    }

    /// Number of size classes.
    #[inline]
    #[must_use]
    pub fn list_count(&self) -> usize {
        self.class_bounds.len()
    }

    /// Size class of a block of `size` bytes.
    #[inline]
    #[must_use]
    pub fn class_of(&self, size: u64) -> usize {
        self.class_bounds.partition_point(|&bound| bound <= size) - 1
    }

    /// Address of the head pointer of list `class`.
    #[inline]
    #[must_use]
    pub fn head_address(&self, class: usize) -> Address {
        Address::new(self.base_free_list + (class * self.pointer_width) as u64)
    }

    /// Whether a free block of `size` bytes can hold two length fields and
    /// the two list pointers.
    #[inline]
    #[must_use]
    pub fn is_listable(&self, size: u64) -> bool {
        size >= 2 && size >= 2 * (length_width(size) + self.pointer_width) as u64
    }
}

/// Class bounds: the fixed small classes, then powers of two until the
/// first bound above `max_block_size`.
fn class_bounds(max_block_size: u64) -> Vec<u64> {
    let mut bounds = FIXED_CLASS_BOUNDS.to_vec();
    let mut bound = FIXED_CLASS_BOUNDS[FIXED_CLASS_BOUNDS.len() - 1];
    while bound <= max_block_size {
        bound *= 2;
        bounds.push(bound);
    }
    bounds
}

/// Bytes needed to address any offset in the arena.
fn pointer_width(arena_size: u64) -> usize {
    let bits = 64 - arena_size.saturating_sub(1).leading_zeros() as usize;
    bits.div_ceil(8).max(1)
}

/// Allocator counters.
///
/// Every byte of the payload region is either free, part of an allocated
/// block (length prefix included) or a marker, so
/// `free_bytes + allocated_bytes + marker_bytes == payload_region`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapStatus {
    /// Total arena size.
    pub arena_size: u64,
    /// Size of the payload region (`base_free_list`).
    pub payload_region: u64,
    /// Bytes in free blocks.
    pub free_bytes: u64,
    /// Number of free blocks, zero-byte gaps included.
    pub free_blocks: u64,
    /// Number of allocated blocks.
    pub allocated_blocks: u64,
    /// Bytes in allocated blocks, length prefixes included.
    pub allocated_bytes: u64,
    /// Payload bytes of allocated blocks.
    pub payload_bytes: u64,
    /// Number of marker bytes.
    pub marker_bytes: u64,
}

impl HeapStatus {
    /// Returns true if the counters account for every payload byte.
    #[must_use]
    pub fn is_conserved(&self) -> bool {
        self.free_bytes + self.allocated_bytes + self.marker_bytes == self.payload_region
    }

    /// Bytes spent on markers and length prefixes.
    #[must_use]
    pub fn overhead_bytes(&self) -> u64 {
        self.marker_bytes + (self.allocated_bytes - self.payload_bytes)
    }

    /// Fraction of the payload region holding payload.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.payload_region == 0 {
            0.0
        } else {
            self.payload_bytes as f64 / self.payload_region as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_bounds() {
        let layout = HeapLayout::new(4 * 1024 * 1024, 1000).unwrap();
        assert_eq!(layout.class_bounds, vec![0, 16, 24, 32, 48, 64, 128, 256, 512, 1024]);
        assert_eq!(layout.class_of(1), 0);
        assert_eq!(layout.class_of(15), 0);
        assert_eq!(layout.class_of(16), 1);
        assert_eq!(layout.class_of(47), 3);
        assert_eq!(layout.class_of(100), 5);
        assert_eq!(layout.class_of(1024), 9);
        assert_eq!(layout.class_of(1 << 30), 9);
    }

    #[test]
    fn test_pointer_width() {
        assert_eq!(pointer_width(4 * 1024 * 1024), 3);
        assert_eq!(pointer_width(16 * 1024 * 1024), 3);
        assert_eq!(pointer_width(16 * 1024 * 1024 + 1), 4);
        assert_eq!(pointer_width(1 << 32), 4);
        assert_eq!(pointer_width((1 << 32) + 1), 5);
    }

    #[test]
    fn test_base_free_list() {
        let layout = HeapLayout::new(4 * 1024 * 1024, 64 * 1024).unwrap();
        let lists = layout.list_count() as u64;
        assert_eq!(layout.base_free_list, 4 * 1024 * 1024 - lists * 3);
        assert_eq!(layout.head_address(1).as_u64(), layout.base_free_list + 3);
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn test_listable_sizes() {
        let layout = HeapLayout::new(4 * 1024 * 1024, 64 * 1024).unwrap();
        assert!(!layout.is_listable(0));
        assert!(!layout.is_listable(7));
        assert!(layout.is_listable(8));
        assert!(layout.is_listable(10));
    }

    #[test]
    fn test_invalid_layouts() {
        assert!(HeapLayout::new(1 << 20, 0).is_err());
        assert!(HeapLayout::new(1 << 20, 1 << 20).is_err());
        assert!(HeapLayout::new(32, 8).is_err());
        assert!(HeapLayout::new(MAX_ARENA_SIZE, 1024).is_err());
    }

    #[test]
    fn test_status_conservation() {
        let status = HeapStatus {
            arena_size: 1000,
            payload_region: 970,
            free_bytes: 900,
            free_blocks: 2,
            allocated_blocks: 3,
            allocated_bytes: 64,
            payload_bytes: 60,
            marker_bytes: 6,
        };
        assert!(status.is_conserved());
        assert_eq!(status.overhead_bytes(), 10);
    }
}
