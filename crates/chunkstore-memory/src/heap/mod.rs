//! Segregated free-list allocator with boundary-tag coalescing.
//!
//! The heap formats the arena as a payload region followed by an array of
//! free-list heads, one per size class:
//!
//! - Blocks are separated by one-byte markers (see [`marker`]) that encode
//!   the state and length width of the blocks on both sides.
//! - A free block stores its length at both ends and, when large enough,
//!   the previous/next pointers of its size-class list right after the
//!   leading length field.
//! - An allocated block is `[length prefix][payload]`; the returned
//!   [`Entry`] addresses the payload and carries (part of) the length.
//!
//! The heap is not internally synchronized. The record store serializes
//! every call behind its structural lock; payload bytes and translation
//! table slots are then accessed concurrently through the arena's atomic
//! primitives.

pub mod marker;
mod status;

use std::fmt;
use std::sync::Arc;

use chunkstore_common::error::{StoreError, StoreResult};
use tracing::{debug, trace};

pub use status::{HeapLayout, HeapStatus};

use crate::arena::{Address, Arena, HeapArena};
use crate::entry::{Entry, LengthLayout, MAX_ENCODABLE_SIZE};
use marker::Side;

/// List terminator. Address 0 is always the leading marker, never a block.
const NULL: u64 = 0;

/// A free block `[start, start + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    start: u64,
    size: u64,
}

/// The allocator over one arena.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use chunkstore_memory::{Heap, HeapArena};
///
/// let mut heap = Heap::new(Arc::new(HeapArena::new(1 << 20)), 4096).unwrap();
/// let a = heap.malloc(10).unwrap();
/// let b = heap.malloc(20).unwrap();
/// heap.free(a).unwrap();
/// assert_eq!(heap.malloc(10).unwrap().address(), a.address());
/// # heap.free(b).unwrap();
/// ```
pub struct Heap<A: Arena = HeapArena> {
    arena: Arc<A>,
    layout: HeapLayout,
    status: HeapStatus,
    /// Bit `i` is set while list `i` is non-empty.
    nonempty: u64,
}

impl<A: Arena> Heap<A> {
    /// Formats `arena` as an empty heap.
    pub fn new(arena: Arc<A>, max_block_size: u64) -> StoreResult<Self> {
        let layout = HeapLayout::new(arena.size(), max_block_size)?;
        let base = layout.base_free_list;
        let status = HeapStatus {
            arena_size: layout.arena_size,
            payload_region: base,
            marker_bytes: 2,
            ..HeapStatus::default()
        };

        let mut heap = Self {
            arena,
            layout,
            status,
            nonempty: 0,
        };
        for class in 0..heap.layout.list_count() {
            heap.write_pointer(heap.layout.head_address(class), NULL)?;
        }
        heap.write_marker(0, Side::Edge, Side::Edge)?;
        heap.write_marker(base - 1, Side::Edge, Side::Edge)?;
        heap.release(1, base - 2)?;

        debug!(
            arena_size = heap.layout.arena_size,
            payload_region = base,
            lists = heap.layout.list_count(),
            pointer_width = heap.layout.pointer_width,
            "formatted heap"
        );
        Ok(heap)
    }

    /// Reopens a heap whose arena was formatted earlier, e.g. a loaded dump.
    pub fn attach(arena: Arc<A>, layout: HeapLayout, status: HeapStatus) -> StoreResult<Self> {
        layout.validate()?;
        if arena.size() != layout.arena_size {
            return Err(StoreError::dump_corrupted(format!(
                "arena of {} bytes does not match heap layout of {} bytes",
                arena.size(),
                layout.arena_size
            )));
        }
        if !status.is_conserved() || status.payload_region != layout.base_free_list {
            return Err(StoreError::dump_corrupted(format!(
                "heap counters are inconsistent: {status:?}"
            )));
        }

        let mut heap = Self {
            arena,
            layout,
            status,
            nonempty: 0,
        };
        for class in 0..heap.layout.list_count() {
            if heap.read_pointer(heap.layout.head_address(class))? != NULL {
                heap.nonempty |= 1 << class;
            }
        }
        Ok(heap)
    }

    /// The backing arena.
    #[inline]
    pub fn arena(&self) -> &Arc<A> {
        &self.arena
    }

    /// Static geometry.
    #[inline]
    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    /// Snapshot of the counters.
    #[inline]
    pub fn status(&self) -> HeapStatus {
        self.status
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocates a block with a payload of `size` bytes.
    ///
    /// Returns `InvalidSize` for zero or oversized requests and `NoSpace`
    /// when no free block fits.
    pub fn malloc(&mut self, size: u64) -> StoreResult<Entry> {
        let layout = self.length_layout(size)?;
        self.allocate(size, &layout)
    }

    /// Allocates a zero-filled block for allocator-internal structures such
    /// as translation tables. Only bounded by what an entry can encode, not
    /// by the maximum block size.
    pub fn malloc_metadata(&mut self, size: u64) -> StoreResult<Entry> {
        let layout = LengthLayout::for_size(size).ok_or(StoreError::InvalidSize {
            size,
            max: MAX_ENCODABLE_SIZE,
        })?;
        let entry = self.allocate(size, &layout)?;
        self.arena.fill(entry.address(), size, 0)?;
        Ok(entry)
    }

    fn allocate(&mut self, size: u64, layout: &LengthLayout) -> StoreResult<Entry> {
        let width = layout.prefix_width();
        let needed = width as u64 + size;

        let block = self
            .find_fit(needed)?
            .ok_or(StoreError::NoSpace { requested: size })?;
        self.carve(block, needed, Side::Allocated(width), Side::Allocated(width))?;
        let entry = self.install(block.start, size, layout)?;

        trace!(size, address = %entry.address(), "malloc");
        Ok(entry)
    }

    /// Allocates a block and zero-fills its payload.
    pub fn malloc_zeroed(&mut self, size: u64) -> StoreResult<Entry> {
        let entry = self.malloc(size)?;
        self.arena.fill(entry.address(), size, 0)?;
        Ok(entry)
    }

    /// Allocates one block per size, carved from a single contiguous region
    /// when one is available.
    ///
    /// Falls back to independent allocations otherwise; if any of those
    /// fails, the blocks allocated so far are released again.
    pub fn multi_malloc(&mut self, sizes: &[u64]) -> StoreResult<Vec<Entry>> {
        let Some(&first) = sizes.first() else {
            return Ok(Vec::new());
        };
        let layouts = sizes
            .iter()
            .map(|&size| self.length_layout(size))
            .collect::<StoreResult<Vec<_>>>()?;

        let blocks: u64 = sizes
            .iter()
            .zip(&layouts)
            .map(|(size, layout)| size + layout.prefix_width() as u64)
            .sum();
        let total = blocks + (sizes.len() as u64 - 1);

        let Some(region) = self.find_fit(total)? else {
            debug!(
                count = sizes.len(),
                total, "no contiguous region, allocating individually"
            );
            return self.malloc_each(sizes);
        };

        let first_side = Side::Allocated(layouts[0].prefix_width());
        let last_side = Side::Allocated(layouts[layouts.len() - 1].prefix_width());
        self.carve(region, total, first_side, last_side)?;

        let mut entries = Vec::with_capacity(sizes.len());
        let mut cursor = region.start;
        let mut previous = first_side;
        for (&size, layout) in sizes.iter().zip(&layouts) {
            let side = Side::Allocated(layout.prefix_width());
            if cursor != region.start {
                self.write_marker(cursor, previous, side)?;
                self.status.marker_bytes += 1;
                cursor += 1;
            }
            entries.push(self.install(cursor, size, layout)?);
            cursor += layout.prefix_width() as u64 + size;
            previous = side;
        }

        trace!(count = sizes.len(), first, total, "multi_malloc");
        Ok(entries)
    }

    fn malloc_each(&mut self, sizes: &[u64]) -> StoreResult<Vec<Entry>> {
        let mut entries = Vec::with_capacity(sizes.len());
        for &size in sizes {
            match self.malloc(size) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    for entry in entries {
                        self.free(entry)?;
                    }
                    return Err(err);
                }
            }
        }
        Ok(entries)
    }

    /// Releases the block described by `entry`, merging it with free
    /// neighbours.
    pub fn free(&mut self, entry: Entry) -> StoreResult<()> {
        let (start, end) = self.block_range(entry)?;
        let (start, end) = (start.as_u64(), end.as_u64());
        let block_size = end - start;

        self.status.allocated_blocks -= 1;
        self.status.allocated_bytes -= block_size;
        self.status.payload_bytes -= block_size - entry.prefix_width() as u64;

        let (left, _) = self.read_marker(start - 1)?;
        let (_, right) = self.read_marker(end)?;

        let mut merged_start = start;
        let mut merged_end = end;
        if left.is_free() {
            let neighbour = self.free_block_ending_at(start - 1, left)?;
            self.take_free(neighbour)?;
            self.status.marker_bytes -= 1;
            merged_start = neighbour.start;
        }
        if right.is_free() {
            let neighbour = self.free_block_starting_at(end + 1, right)?;
            self.take_free(neighbour)?;
            self.status.marker_bytes -= 1;
            merged_end = neighbour.start + neighbour.size;
        }

        self.release(merged_start, merged_end - merged_start)?;
        trace!(address = %entry.address(), block_size, "free");
        Ok(())
    }

    /// Changes the payload size of a block.
    ///
    /// Returns `entry` itself when the size is unchanged. Otherwise the
    /// payload moves to a new block (common bytes copied, growth
    /// zero-filled) and the old block is freed; lock and protection bits
    /// carry over. On `NoSpace` the original block is left untouched.
    pub fn resize(&mut self, entry: Entry, size: u64) -> StoreResult<Entry> {
        self.length_layout(size)?;
        let current = self.payload_len(entry)?;
        if current == size {
            return Ok(entry);
        }

        let fresh = self.malloc(size)?;
        let common = current.min(size);
        self.arena.copy(entry.address(), fresh.address(), common)?;
        if size > common {
            self.arena.fill(fresh.address().offset(common), size - common, 0)?;
        }
        self.free(entry)?;
        Ok(fresh.with_control_bits_of(entry))
    }

    // =========================================================================
    // Entry inspection
    // =========================================================================

    /// Decoded payload length of a live entry.
    pub fn payload_len(&self, entry: Entry) -> StoreResult<u64> {
        if !entry.is_live() {
            return Err(StoreError::invalid_argument(format!(
                "{entry:?} does not describe a block"
            )));
        }
        entry.length(|address, width| self.arena.read(address, width))
    }

    /// Byte range `[start, end)` of the block behind `entry`, prefix
    /// included, after checking both markers agree with the entry.
    pub fn block_range(&self, entry: Entry) -> StoreResult<(Address, Address)> {
        let payload = self.payload_len(entry)?;
        let width = entry.prefix_width();
        let address = entry.address().as_u64();

        let start = address - width as u64;
        let end = address + payload;
        if start == 0 || end >= self.layout.base_free_list {
            return Err(StoreError::corruption(
                address,
                format!("block [{start:#x}, {end:#x}) outside the payload region"),
            ));
        }

        let expected = Side::Allocated(width);
        let (_, right_of_left) = self.read_marker(start - 1)?;
        let (left_of_right, _) = self.read_marker(end)?;
        if right_of_left != expected || left_of_right != expected {
            return Err(StoreError::corruption(
                address,
                format!(
                    "markers {right_of_left:?}/{left_of_right:?} do not match allocated block with {width}-byte prefix"
                ),
            ));
        }
        Ok((Address::new(start), Address::new(end)))
    }

    /// Blocks currently threaded on list `class` as `(start, size)` pairs.
    pub fn list_blocks(&self, class: usize) -> StoreResult<Vec<(Address, u64)>> {
        let mut blocks = Vec::new();
        let mut cursor = self.read_pointer(self.layout.head_address(class))?;
        while cursor != NULL {
            if blocks.len() as u64 > self.status.free_blocks {
                return Err(StoreError::corruption(cursor, format!("cycle in free list {class}")));
            }
            blocks.push((Address::new(cursor), self.listed_size(cursor)?));
            cursor = self.next_of(cursor)?;
        }
        Ok(blocks)
    }

    // =========================================================================
    // Block search and carving
    // =========================================================================

    fn length_layout(&self, size: u64) -> StoreResult<LengthLayout> {
        let invalid = StoreError::InvalidSize {
            size,
            max: self.layout.max_block_size,
        };
        if size == 0 || size > self.layout.max_block_size {
            return Err(invalid);
        }
        LengthLayout::for_size(size).ok_or(invalid)
    }

    /// Scans the request's own class when it has blocks, then falls back to
    /// the head of the smallest non-empty larger class.
    fn find_fit(&self, needed: u64) -> StoreResult<Option<FreeBlock>> {
        let class = self.layout.class_of(needed);

        if self.nonempty & (1 << class) != 0 {
            let mut cursor = self.read_pointer(self.layout.head_address(class))?;
            let mut steps = 0u64;
            while cursor != NULL {
                let size = self.listed_size(cursor)?;
                if size >= needed {
                    return Ok(Some(FreeBlock {
                        start: cursor,
                        size,
                    }));
                }
                steps += 1;
                if steps > self.status.free_blocks {
                    return Err(StoreError::corruption(cursor, format!("cycle in free list {class}")));
                }
                cursor = self.next_of(cursor)?;
            }
        }

        let larger = self.nonempty & !((2u64 << class) - 1);
        if larger == 0 {
            return Ok(None);
        }
        let class = larger.trailing_zeros() as usize;
        let start = self.read_pointer(self.layout.head_address(class))?;
        let size = self.listed_size(start)?;
        if size < needed {
            return Err(StoreError::corruption(
                start,
                format!("block of {size} bytes on list {class} cannot hold {needed} bytes"),
            ));
        }
        Ok(Some(FreeBlock { start, size }))
    }

    /// Takes `needed` bytes from the low end of `block`. `first` and `last`
    /// are the states recorded for the allocated region in its outer
    /// markers. Any remainder becomes a new free block behind a new marker;
    /// a slack of one byte leaves a zero-byte gap between two markers.
    fn carve(&mut self, block: FreeBlock, needed: u64, first: Side, last: Side) -> StoreResult<()> {
        self.take_free(block)?;
        self.set_right_of(block.start - 1, first)?;

        if block.size == needed {
            return self.set_left_of(block.start + block.size, last);
        }

        let split_at = block.start + needed;
        let rest = block.size - needed - 1;
        self.write_marker(split_at, last, Side::free(rest))?;
        self.status.marker_bytes += 1;
        self.release(split_at + 1, rest)
    }

    /// Writes the prefix of a freshly carved block and books it.
    fn install(&mut self, start: u64, size: u64, layout: &LengthLayout) -> StoreResult<Entry> {
        let width = layout.prefix_width();
        if layout.is_split() {
            self.arena.write(Address::new(start), width, layout.prefix())?;
        }
        self.status.allocated_blocks += 1;
        self.status.allocated_bytes += width as u64 + size;
        self.status.payload_bytes += size;
        Ok(Entry::new(Address::new(start + width as u64), layout))
    }

    // =========================================================================
    // Free blocks
    // =========================================================================

    /// Turns `[start, start + size)` into a free block: length fields,
    /// neighbouring marker nibbles, list membership and counters.
    fn release(&mut self, start: u64, size: u64) -> StoreResult<()> {
        let side = Side::free(size);
        if let Side::Free(width) = side {
            self.arena.write(Address::new(start), width, size)?;
            self.arena
                .write(Address::new(start + size - width as u64), width, size)?;
        }
        self.set_right_of(start - 1, side)?;
        self.set_left_of(start + size, side)?;
        if self.layout.is_listable(size) {
            self.push_list(start, size)?;
        }
        self.status.free_bytes += size;
        self.status.free_blocks += 1;
        Ok(())
    }

    /// Removes a free block from its list and from the counters.
    fn take_free(&mut self, block: FreeBlock) -> StoreResult<()> {
        if self.layout.is_listable(block.size) {
            self.unlink(block.start, block.size)?;
        }
        self.status.free_bytes -= block.size;
        self.status.free_blocks -= 1;
        Ok(())
    }

    /// The free block left of the marker at `marker_at`.
    fn free_block_ending_at(&self, marker_at: u64, side: Side) -> StoreResult<FreeBlock> {
        let size = match side {
            Side::Gap => 0,
            Side::Single => 1,
            Side::Free(width) => self.arena.read(Address::new(marker_at - width as u64), width)?,
            other => {
                return Err(StoreError::corruption(
                    marker_at,
                    format!("expected a free block, found {other:?}"),
                ))
            }
        };
        if size >= marker_at || Side::free(size) != side {
            return Err(StoreError::corruption(
                marker_at,
                format!("free block length {size} disagrees with marker state {side:?}"),
            ));
        }
        Ok(FreeBlock {
            start: marker_at - size,
            size,
        })
    }

    /// The free block starting at `start`, right of a marker.
    fn free_block_starting_at(&self, start: u64, side: Side) -> StoreResult<FreeBlock> {
        let size = match side {
            Side::Gap => 0,
            Side::Single => 1,
            Side::Free(width) => self.arena.read(Address::new(start), width)?,
            other => {
                return Err(StoreError::corruption(
                    start,
                    format!("expected a free block, found {other:?}"),
                ))
            }
        };
        if start + size >= self.layout.base_free_list || Side::free(size) != side {
            return Err(StoreError::corruption(
                start,
                format!("free block length {size} disagrees with marker state {side:?}"),
            ));
        }
        Ok(FreeBlock { start, size })
    }

    // =========================================================================
    // Size-class lists
    // =========================================================================

    /// Address of the prev/next pointer pair of a listed block.
    fn link_address(&self, start: u64) -> StoreResult<Address> {
        match self.read_marker(start - 1)? {
            (_, Side::Free(width)) => Ok(Address::new(start + width as u64)),
            (_, other) => Err(StoreError::corruption(
                start,
                format!("listed block has marker state {other:?}"),
            )),
        }
    }

    fn listed_size(&self, start: u64) -> StoreResult<u64> {
        match self.read_marker(start - 1)? {
            (_, Side::Free(width)) => self.arena.read(Address::new(start), width),
            (_, other) => Err(StoreError::corruption(
                start,
                format!("listed block has marker state {other:?}"),
            )),
        }
    }

    fn next_of(&self, start: u64) -> StoreResult<u64> {
        let link = self.link_address(start)?;
        self.read_pointer(link.offset(self.layout.pointer_width as u64))
    }

    fn push_list(&mut self, start: u64, size: u64) -> StoreResult<()> {
        let class = self.layout.class_of(size);
        let head_at = self.layout.head_address(class);
        let head = self.read_pointer(head_at)?;
        let ptr = self.layout.pointer_width as u64;

        let link = self.link_address(start)?;
        self.write_pointer(link, NULL)?;
        self.write_pointer(link.offset(ptr), head)?;
        if head != NULL {
            let head_link = self.link_address(head)?;
            self.write_pointer(head_link, start)?;
        }
        self.write_pointer(head_at, start)?;
        self.nonempty |= 1 << class;
        Ok(())
    }

    fn unlink(&mut self, start: u64, size: u64) -> StoreResult<()> {
        let class = self.layout.class_of(size);
        let ptr = self.layout.pointer_width as u64;
        let link = self.link_address(start)?;
        let prev = self.read_pointer(link)?;
        let next = self.read_pointer(link.offset(ptr))?;

        if prev == NULL {
            let head_at = self.layout.head_address(class);
            if self.read_pointer(head_at)? != start {
                return Err(StoreError::corruption(
                    start,
                    format!("block without predecessor is not the head of list {class}"),
                ));
            }
            self.write_pointer(head_at, next)?;
            if next == NULL {
                self.nonempty &= !(1 << class);
            }
        } else {
            let prev_link = self.link_address(prev)?;
            self.write_pointer(prev_link.offset(ptr), next)?;
        }
        if next != NULL {
            let next_link = self.link_address(next)?;
            self.write_pointer(next_link, prev)?;
        }
        Ok(())
    }

    // =========================================================================
    // Raw metadata access
    // =========================================================================

    fn read_pointer(&self, at: Address) -> StoreResult<u64> {
        self.arena.read(at, self.layout.pointer_width)
    }

    fn write_pointer(&self, at: Address, value: u64) -> StoreResult<()> {
        self.arena.write(at, self.layout.pointer_width, value)
    }

    fn read_marker(&self, at: u64) -> StoreResult<(Side, Side)> {
        let byte = self.arena.read(Address::new(at), 1)? as u8;
        marker::decode(byte)
            .ok_or_else(|| StoreError::corruption(at, format!("invalid marker byte {byte:#04x}")))
    }

    fn write_marker(&self, at: u64, left: Side, right: Side) -> StoreResult<()> {
        self.arena
            .write(Address::new(at), 1, u64::from(marker::encode(left, right)))
    }

    /// Updates the state of the block right of the marker at `at`.
    fn set_right_of(&self, at: u64, side: Side) -> StoreResult<()> {
        let (left, _) = self.read_marker(at)?;
        self.write_marker(at, left, side)
    }

    /// Updates the state of the block left of the marker at `at`.
    fn set_left_of(&self, at: u64, side: Side) -> StoreResult<()> {
        let (_, right) = self.read_marker(at)?;
        self.write_marker(at, side, right)
    }
}

impl<A: Arena> fmt::Debug for Heap<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("layout", &self.layout)
            .field("status", &self.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const ARENA: u64 = 4 * 1024 * 1024;

    fn test_heap() -> Heap {
        Heap::new(Arc::new(HeapArena::new(ARENA)), 256 * 1024).unwrap()
    }

    fn assert_conserved(heap: &Heap) {
        let status = heap.status();
        assert!(status.is_conserved(), "counters not conserved: {status:?}");
    }

    #[test]
    fn test_fresh_heap() {
        let heap = test_heap();
        let status = heap.status();
        let base = heap.layout().base_free_list;

        assert_eq!(status.free_blocks, 1);
        assert_eq!(status.free_bytes, base - 2);
        assert_eq!(status.marker_bytes, 2);
        assert_eq!(status.allocated_blocks, 0);
        assert_conserved(&heap);

        let last = heap.layout().list_count() - 1;
        assert_eq!(heap.list_blocks(last).unwrap(), vec![(Address::new(1), base - 2)]);
    }

    #[test]
    fn test_freed_block_is_reused() {
        let mut heap = test_heap();
        let first = heap.malloc(10).unwrap();
        let _second = heap.malloc(20).unwrap();
        heap.free(first).unwrap();

        let again = heap.malloc(10).unwrap();
        assert_eq!(again.address(), first.address());
        assert_conserved(&heap);
    }

    #[test]
    fn test_adjacent_frees_merge() {
        let mut heap = test_heap();
        let a = heap.malloc(10).unwrap();
        let b = heap.malloc(20).unwrap();
        let _guard = heap.malloc(30).unwrap();

        heap.free(a).unwrap();
        heap.free(b).unwrap();

        let merged = 10 + 20 + 1;
        let class = heap.layout().class_of(merged);
        assert!(heap
            .list_blocks(class)
            .unwrap()
            .contains(&(Address::new(1), merged)));
        assert_conserved(&heap);
    }

    #[test]
    fn test_one_byte_slack_leaves_gap() {
        let mut heap = test_heap();
        let _a = heap.malloc(10).unwrap();
        let b = heap.malloc(10).unwrap();
        let _c = heap.malloc(10).unwrap();
        heap.free(b).unwrap();

        let before = heap.status();
        let tight = heap.malloc(9).unwrap();
        assert_eq!(tight.address(), b.address());

        let after = heap.status();
        assert_eq!(after.free_blocks, before.free_blocks);
        assert_eq!(after.marker_bytes, before.marker_bytes + 1);
        assert_eq!(after.free_bytes, before.free_bytes - 10);
        assert_conserved(&heap);

        heap.free(tight).unwrap();
        assert_eq!(heap.status(), before);
    }

    #[test]
    fn test_free_everything_restores_single_block() {
        let mut heap = test_heap();
        let initial = heap.status();
        let mut entries: Vec<_> = (1..=50).map(|i| heap.malloc(i * 7).unwrap()).collect();

        let odd: Vec<_> = entries.iter().copied().skip(1).step_by(2).collect();
        entries.retain(|e| !odd.contains(e));
        for entry in odd {
            heap.free(entry).unwrap();
        }
        assert_conserved(&heap);
        for entry in entries.into_iter().rev() {
            heap.free(entry).unwrap();
        }

        assert_eq!(heap.status(), initial);
    }

    #[test]
    fn test_split_length_payload() {
        let mut heap = test_heap();
        let entry = heap.malloc(5000).unwrap();
        assert!(entry.is_split());
        assert_eq!(entry.prefix_width(), 1);
        assert_eq!(heap.payload_len(entry).unwrap(), 5000);

        let (start, end) = heap.block_range(entry).unwrap();
        assert_eq!(entry.address().as_u64() - start.as_u64(), 1);
        assert_eq!(end.as_u64() - start.as_u64(), 5001);

        let status = heap.status();
        assert_eq!(status.allocated_bytes, 5001);
        assert_eq!(status.payload_bytes, 5000);
        heap.free(entry).unwrap();
        assert_conserved(&heap);
    }

    #[test]
    fn test_invalid_sizes() {
        let mut heap = test_heap();
        assert!(matches!(heap.malloc(0), Err(StoreError::InvalidSize { .. })));
        assert!(matches!(
            heap.malloc(256 * 1024 + 1),
            Err(StoreError::InvalidSize { .. })
        ));
        assert!(heap.malloc(256 * 1024).is_ok());
    }

    #[test]
    fn test_exhaustion_returns_no_space() {
        let mut heap = test_heap();
        let mut entries = Vec::new();
        let err = loop {
            match heap.malloc(200 * 1024) {
                Ok(entry) => entries.push(entry),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, StoreError::NoSpace { .. }));
        assert!(err.is_retryable());
        assert!(!entries.is_empty());
        assert_conserved(&heap);
    }

    #[test]
    fn test_malloc_zeroed() {
        let mut heap = test_heap();
        let dirty = heap.malloc(64).unwrap();
        heap.arena().fill(dirty.address(), 64, 0xAA).unwrap();
        heap.free(dirty).unwrap();

        let clean = heap.malloc_zeroed(64).unwrap();
        let mut buf = [0xFFu8; 64];
        heap.arena().read_bytes(clean.address(), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_metadata_ignores_max_block_size() {
        let mut heap = test_heap();
        let size = 512 * 1024 + 7;
        assert!(heap.malloc(size).is_err());

        let table = heap.malloc_metadata(size).unwrap();
        assert_eq!(heap.payload_len(table).unwrap(), size);
        let mut tail = [0xFFu8; 16];
        heap.arena()
            .read_bytes(table.address().offset(size - 16), &mut tail)
            .unwrap();
        assert_eq!(tail, [0u8; 16]);
        assert_conserved(&heap);
    }

    #[test]
    fn test_multi_malloc_contiguous() {
        let mut heap = test_heap();
        let entries = heap.multi_malloc(&[64; 8]).unwrap();
        assert_eq!(entries.len(), 8);

        for pair in entries.windows(2) {
            assert_eq!(pair[1].address().as_u64(), pair[0].address().as_u64() + 65);
        }
        for entry in &entries {
            assert_eq!(heap.payload_len(*entry).unwrap(), 64);
            heap.block_range(*entry).unwrap();
        }
        let status = heap.status();
        assert_eq!(status.allocated_blocks, 8);
        assert_conserved(&heap);

        for entry in entries {
            heap.free(entry).unwrap();
        }
        assert_eq!(heap.status().free_blocks, 1);
    }

    #[test]
    fn test_multi_malloc_mixed_prefixes() {
        let mut heap = test_heap();
        let sizes = [10, 2000, 70_000, 1];
        let entries = heap.multi_malloc(&sizes).unwrap();
        for (entry, size) in entries.iter().zip(sizes) {
            assert_eq!(heap.payload_len(*entry).unwrap(), size);
            heap.block_range(*entry).unwrap();
        }
        for entry in entries {
            heap.free(entry).unwrap();
        }
        assert_eq!(heap.status().free_blocks, 1);
        assert_conserved(&heap);
    }

    #[test]
    fn test_multi_malloc_rolls_back() {
        let mut heap = test_heap();
        let initial = heap.status();
        let err = heap.multi_malloc(&[250 * 1024; 20]).unwrap_err();
        assert!(matches!(err, StoreError::NoSpace { .. }));
        assert_eq!(heap.status(), initial);
    }

    #[test]
    fn test_resize_moves_and_keeps_bytes() {
        let mut heap = test_heap();
        let entry = heap.malloc(16).unwrap().with_not_removable(true);
        heap.arena().write_bytes(entry.address(), b"0123456789abcdef").unwrap();

        assert_eq!(heap.resize(entry, 16).unwrap(), entry);

        let grown = heap.resize(entry, 2000).unwrap();
        assert!(grown.is_not_removable());
        assert_eq!(heap.payload_len(grown).unwrap(), 2000);
        let mut buf = [0u8; 20];
        heap.arena().read_bytes(grown.address(), &mut buf).unwrap();
        assert_eq!(&buf[..16], b"0123456789abcdef");
        assert_eq!(&buf[16..], &[0, 0, 0, 0]);

        let shrunk = heap.resize(grown, 4).unwrap();
        let mut buf = [0u8; 4];
        heap.arena().read_bytes(shrunk.address(), &mut buf).unwrap();
        assert_eq!(&buf, b"0123");
        assert_eq!(heap.status().allocated_blocks, 1);
        assert_conserved(&heap);
    }

    #[test]
    fn test_double_free_is_corruption() {
        let mut heap = test_heap();
        let a = heap.malloc(40).unwrap();
        let _b = heap.malloc(40).unwrap();
        heap.free(a).unwrap();
        let err = heap.free(a).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_attach_resumes() {
        let arena = Arc::new(HeapArena::new(ARENA));
        let mut heap = Heap::new(Arc::clone(&arena), 4096).unwrap();
        let a = heap.malloc(100).unwrap();
        let b = heap.malloc(200).unwrap();
        heap.free(a).unwrap();

        let mut reopened = Heap::attach(arena, heap.layout().clone(), heap.status()).unwrap();
        assert_eq!(reopened.malloc(100).unwrap().address(), a.address());
        reopened.free(b).unwrap();
        assert_conserved(&reopened);
    }

    #[test]
    fn test_random_workload_conserves() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut heap = test_heap();
        let mut live: Vec<(Entry, u64)> = Vec::new();

        for _ in 0..5000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = if rng.gen_bool(0.9) {
                    rng.gen_range(1..=300)
                } else {
                    rng.gen_range(1..=40_000)
                };
                match heap.malloc(size) {
                    Ok(entry) => live.push((entry, size)),
                    Err(StoreError::NoSpace { .. }) => {}
                    Err(err) => panic!("unexpected error: {err}"),
                }
            } else {
                let index = rng.gen_range(0..live.len());
                let (entry, _) = live.swap_remove(index);
                heap.free(entry).unwrap();
            }
            assert_conserved(&heap);
        }

        let mut ranges: Vec<(u64, u64)> = live
            .iter()
            .map(|(entry, size)| {
                assert_eq!(heap.payload_len(*entry).unwrap(), *size);
                let (start, end) = heap.block_range(*entry).unwrap();
                (start.as_u64(), end.as_u64())
            })
            .collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 < pair[1].0, "blocks overlap: {pair:?}");
        }

        for (entry, _) in live {
            heap.free(entry).unwrap();
        }
        let status = heap.status();
        assert_eq!(status.free_blocks, 1);
        assert_eq!(status.free_bytes, heap.layout().base_free_list - 2);
    }
}
