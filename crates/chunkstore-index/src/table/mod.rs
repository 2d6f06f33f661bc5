//! Multi-level translation table.
//!
//! Record ids are translated to entry slots through a fixed-depth radix
//! trie stored in the arena itself:
//!
//! ```text
//! id = | owner (16) | lid slice 0 | lid slice 1 | ... | lid slice n-1 |
//!
//! root[owner] -> table[slice 0] -> ... -> leaf[slice n-1] = record entry
//! ```
//!
//! The root table has one slot per owner. The 48-bit local id is split
//! into `lid_levels` equal slices, one per level below the root. Every slot
//! holds an [`Entry`]: non-leaf slots address the next table, leaf slots
//! describe a record or hold `FREE`/`ZOMBIE`.
//!
//! Tables are heap blocks allocated zero-filled on first use. Their slot
//! arrays start at the next 8-byte boundary inside the block so every slot
//! supports a 64-bit compare-and-swap. Tables are never freed or moved.
//!
//! Reads (`translate`, `entry`) are lock-free. Anything that allocates
//! tables or rewrites non-leaf slots must be serialized by the caller.

mod cache;
mod walk;

use std::sync::Arc;

use chunkstore_common::constants::{
    LOCAL_ID_BITS, OWNER_TABLE_ENTRIES, SUPPORTED_LID_LEVELS,
};
use chunkstore_common::error::{StoreError, StoreResult};
use chunkstore_common::types::ChunkId;
use chunkstore_memory::{Address, Arena, Entry, Heap, HeapArena};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use walk::{Ownership, TableScan};

/// Bytes per slot.
const SLOT_BYTES: u64 = 8;

/// Padding that lets the slot array start 8-byte aligned anywhere in the
/// block.
const ALIGN_PADDING: u64 = SLOT_BYTES - 1;

/// Persistent description of a table, enough to reattach to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLayout {
    /// Entry of the root table block.
    pub root: Entry,
    /// Levels below the root.
    pub lid_levels: u32,
}

/// The translation table over one arena.
pub struct TranslationTable<A: Arena = HeapArena> {
    arena: Arc<A>,
    layout: TableLayout,
    root_slots: Address,
    level_bits: u32,
    uid: u64,
    leaf_cache: bool,
}

/// Block size of a table with `slots` slots.
#[inline]
fn table_block_size(slots: u64) -> u64 {
    slots * SLOT_BYTES + ALIGN_PADDING
}

/// First slot of the table held by `entry`.
#[inline]
fn slot_base(entry: Entry) -> Address {
    entry.address().align_up(SLOT_BYTES)
}

impl<A: Arena> TranslationTable<A> {
    /// Allocates an empty root table.
    pub fn create(heap: &mut Heap<A>, lid_levels: u32, leaf_cache: bool) -> StoreResult<Self> {
        check_levels(lid_levels)?;
        let root = heap.malloc_metadata(table_block_size(OWNER_TABLE_ENTRIES))?;
        debug!(lid_levels, root = %root.address(), "created translation table");
        Ok(Self::with_layout(
            Arc::clone(heap.arena()),
            TableLayout { root, lid_levels },
            leaf_cache,
        ))
    }

    /// Reattaches to a table described by `layout`.
    pub fn attach(arena: Arc<A>, layout: TableLayout, leaf_cache: bool) -> StoreResult<Self> {
        check_levels(layout.lid_levels)?;
        if !layout.root.is_live() {
            return Err(StoreError::dump_corrupted("table root entry is not live"));
        }
        let end = slot_base(layout.root).as_u64() + OWNER_TABLE_ENTRIES * SLOT_BYTES;
        arena.check_range(layout.root.address(), end - layout.root.address().as_u64())?;
        Ok(Self::with_layout(arena, layout, leaf_cache))
    }

    fn with_layout(arena: Arc<A>, layout: TableLayout, leaf_cache: bool) -> Self {
        Self {
            arena,
            root_slots: slot_base(layout.root),
            level_bits: LOCAL_ID_BITS / layout.lid_levels,
            uid: cache::next_table_uid(),
            leaf_cache,
            layout,
        }
    }

    /// Persistent layout.
    #[inline]
    pub fn layout(&self) -> TableLayout {
        self.layout
    }

    /// The backing arena.
    #[inline]
    pub fn arena(&self) -> &Arc<A> {
        &self.arena
    }

    /// Number of slots in the tables below the root.
    #[inline]
    pub fn slots_per_table(&self) -> u64 {
        1 << self.level_bits
    }

    /// Block size of the tables below the root.
    #[inline]
    pub fn table_block_size(&self) -> u64 {
        table_block_size(self.slots_per_table())
    }

    // =========================================================================
    // Id decomposition
    // =========================================================================

    /// Slot index at `level` (1-based below the root).
    #[inline]
    fn level_index(&self, id: ChunkId, level: u32) -> u64 {
        (id.local_id() >> self.level_shift(level)) & (self.slots_per_table() - 1)
    }

    /// Bit position of the slice indexed at `level`; the root is level 0.
    #[inline]
    fn level_shift(&self, level: u32) -> u32 {
        LOCAL_ID_BITS - level * self.level_bits
    }

    #[inline]
    fn leaf_prefix(&self, id: ChunkId) -> u64 {
        id.as_u64() >> self.level_bits
    }

    #[inline]
    fn slot(table: Address, index: u64) -> Address {
        table.offset(index * SLOT_BYTES)
    }

    // =========================================================================
    // Translation
    // =========================================================================

    /// Returns the leaf slot of `id`, or `None` if a table on its path has
    /// not been created.
    pub fn translate(&self, id: ChunkId) -> StoreResult<Option<Address>> {
        let leaf_index = self.level_index(id, self.layout.lid_levels);
        if let Some(leaf) = self.cached_leaf(id) {
            return Ok(Some(Self::slot(leaf, leaf_index)));
        }

        let mut table = self.root_slots;
        let mut index = u64::from(id.owner().as_u16());
        for level in 1..=self.layout.lid_levels {
            let entry = self.entry(Self::slot(table, index))?;
            if !entry.is_live() {
                return Ok(None);
            }
            table = slot_base(entry);
            index = self.level_index(id, level);
        }

        self.remember_leaf(id, table);
        Ok(Some(Self::slot(table, index)))
    }

    /// Returns the leaf slot of `id`, creating missing tables on its path.
    ///
    /// Must be called under the structural lock that also guards `heap`.
    pub fn translate_or_create(&self, id: ChunkId, heap: &mut Heap<A>) -> StoreResult<Address> {
        let leaf_index = self.level_index(id, self.layout.lid_levels);
        if let Some(leaf) = self.cached_leaf(id) {
            return Ok(Self::slot(leaf, leaf_index));
        }

        let mut table = self.root_slots;
        let mut index = u64::from(id.owner().as_u16());
        for level in 1..=self.layout.lid_levels {
            let slot = Self::slot(table, index);
            let mut entry = self.entry(slot)?;
            if !entry.is_live() {
                // A new table holds no zombies yet.
                entry = heap
                    .malloc_metadata(self.table_block_size())?
                    .with_subtree_full(true);
                self.store_entry(slot, entry)?;
                debug!(%id, level, table = %entry.address(), "created table");
            }
            table = slot_base(entry);
            index = self.level_index(id, level);
        }

        self.remember_leaf(id, table);
        Ok(Self::slot(table, index))
    }

    /// Returns the non-leaf slots on the path of `id` and its leaf slot.
    fn path(&self, id: ChunkId) -> StoreResult<Option<(Vec<Address>, Address)>> {
        let mut parents = Vec::with_capacity(self.layout.lid_levels as usize);
        let mut table = self.root_slots;
        let mut index = u64::from(id.owner().as_u16());
        for level in 1..=self.layout.lid_levels {
            let slot = Self::slot(table, index);
            let entry = self.entry(slot)?;
            if !entry.is_live() {
                return Ok(None);
            }
            parents.push(slot);
            table = slot_base(entry);
            index = self.level_index(id, level);
        }
        Ok(Some((parents, Self::slot(table, index))))
    }

    fn cached_leaf(&self, id: ChunkId) -> Option<Address> {
        if self.leaf_cache {
            cache::lookup(self.uid, self.leaf_prefix(id))
        } else {
            None
        }
    }

    fn remember_leaf(&self, id: ChunkId, leaf: Address) {
        if self.leaf_cache {
            cache::remember(self.uid, self.leaf_prefix(id), leaf);
        }
    }

    // =========================================================================
    // Slot access
    // =========================================================================

    /// Reads the entry in `slot`.
    #[inline]
    pub fn entry(&self, slot: Address) -> StoreResult<Entry> {
        Ok(Entry::from_raw(self.arena.read(slot, 8)?))
    }

    /// Overwrites the entry in `slot`.
    #[inline]
    pub fn store_entry(&self, slot: Address, entry: Entry) -> StoreResult<()> {
        self.arena.write(slot, 8, entry.raw())
    }

    /// Atomically replaces `current` with `new` in `slot`.
    #[inline]
    pub fn compare_exchange_entry(
        &self,
        slot: Address,
        current: Entry,
        new: Entry,
    ) -> StoreResult<Result<Entry, Entry>> {
        Ok(self
            .arena
            .compare_exchange(slot, 8, current.raw(), new.raw())?
            .map(Entry::from_raw)
            .map_err(Entry::from_raw))
    }

    /// Reads the entry of `id`, `FREE` if its path does not exist.
    pub fn lookup(&self, id: ChunkId) -> StoreResult<Entry> {
        match self.translate(id)? {
            Some(slot) => self.entry(slot),
            None => Ok(Entry::FREE),
        }
    }

    /// Clears the slot of `id` and returns the entry it held.
    ///
    /// With `keep_zombie` the slot becomes `ZOMBIE` so the id stays reserved
    /// until a recycler sweep, and the subtree markers on its path are
    /// cleared. Otherwise it becomes `FREE` at once. Must be called under the
    /// structural lock.
    pub fn delete(&self, id: ChunkId, keep_zombie: bool) -> StoreResult<Entry> {
        let Some((parents, slot)) = self.path(id)? else {
            return Ok(Entry::FREE);
        };
        let replacement = if keep_zombie { Entry::ZOMBIE } else { Entry::FREE };

        let mut current = self.entry(slot)?;
        let previous = loop {
            match self.compare_exchange_entry(slot, current, replacement)? {
                Ok(previous) => break previous,
                Err(actual) => current = actual,
            }
        };

        if keep_zombie {
            for parent in parents {
                let entry = self.entry(parent)?;
                if entry.is_subtree_full() {
                    self.store_entry(parent, entry.with_subtree_full(false))?;
                }
            }
        }
        Ok(previous)
    }
}

fn check_levels(lid_levels: u32) -> StoreResult<()> {
    if SUPPORTED_LID_LEVELS.contains(&lid_levels) {
        Ok(())
    } else {
        Err(StoreError::config(format!(
            "lid_levels {lid_levels} not one of {SUPPORTED_LID_LEVELS:?}"
        )))
    }
}

impl<A: Arena> std::fmt::Debug for TranslationTable<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationTable")
            .field("layout", &self.layout)
            .field("level_bits", &self.level_bits)
            .field("leaf_cache", &self.leaf_cache)
            .finish()
    }
}
