//! Depth-first walks over the table.
//!
//! All walks use an explicit stack of frames, one per table on the current
//! path; the trie depth is fixed so the stack never grows past
//! `lid_levels + 1` frames.

use std::ops::ControlFlow;

use chunkstore_common::constants::{LOCAL_ID_MASK, OWNER_TABLE_ENTRIES};
use chunkstore_common::error::{StoreError, StoreResult};
use chunkstore_common::types::{ChunkId, ChunkIdRange, NodeId};
use chunkstore_memory::{Address, Arena, Entry};
use tracing::debug;

use super::{slot_base, TranslationTable, SLOT_BYTES};

/// Which records a range enumeration reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Records created by the local owner.
    Local,
    /// Records owned by other nodes and migrated here.
    Migrated,
    /// Every record.
    All,
}

impl Ownership {
    fn admits(self, id: ChunkId, local: NodeId) -> bool {
        match self {
            Self::Local => id.is_owned_by(local),
            Self::Migrated => !id.is_owned_by(local),
            Self::All => true,
        }
    }
}

/// Result of [`TranslationTable::scan`].
#[derive(Debug, Clone, Default)]
pub struct TableScan {
    /// Entries of every reachable table block, the root first.
    pub tables: Vec<Entry>,
    /// Non-leaf slots, with their entries, whose table does not fit in the
    /// arena. Their subtrees were skipped.
    pub stray: Vec<(Address, Entry)>,
    /// Live records in ascending id order.
    pub live: Vec<(ChunkId, Entry)>,
    /// Zombie slots of every owner.
    pub zombies: u64,
}

/// Fails the walk on a table that does not fit in the arena.
fn require_fit(_level: u32, slot: Address, entry: Entry, fits: bool) -> StoreResult<()> {
    if fits {
        return Ok(());
    }
    Err(StoreError::corruption(
        slot.as_u64(),
        format!("table at {} does not fit in the arena", entry.address()),
    ))
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    /// First slot of the table.
    table: Address,
    /// 0 for the root.
    level: u32,
    /// Id bits fixed by the levels above.
    prefix: u64,
    /// Next slot to visit.
    next: u64,
    /// Slot in the parent table that points here.
    parent: Option<Address>,
}

impl<A: Arena> TranslationTable<A> {
    fn slots_at(&self, level: u32) -> u64 {
        if level == 0 {
            OWNER_TABLE_ENTRIES
        } else {
            self.slots_per_table()
        }
    }

    fn root_frame(&self) -> Frame {
        Frame {
            table: self.root_slots,
            level: 0,
            prefix: 0,
            next: 0,
            parent: None,
        }
    }

    /// Visits every leaf slot below `start` in ascending id order.
    ///
    /// `on_table` sees the slot and entry of each non-leaf slot before its
    /// subtree is entered, along with whether the table it points at fits in
    /// the arena. Tables that do not fit are never entered.
    fn walk_from<T, L>(&self, start: Frame, mut on_table: T, mut on_leaf: L) -> StoreResult<()>
    where
        T: FnMut(u32, Address, Entry, bool) -> StoreResult<()>,
        L: FnMut(ChunkId, Address, Entry) -> StoreResult<ControlFlow<()>>,
    {
        let leaf_level = self.layout.lid_levels;
        let mut stack = vec![start];

        while let Some(frame) = stack.last_mut() {
            if frame.next == self.slots_at(frame.level) {
                stack.pop();
                continue;
            }
            let index = frame.next;
            frame.next += 1;
            let frame = *frame;

            let slot = Self::slot(frame.table, index);
            let entry = self.entry(slot)?;
            let bits = frame.prefix | (index << self.level_shift(frame.level));

            if frame.level == leaf_level {
                if on_leaf(ChunkId::from_raw(bits), slot, entry)?.is_break() {
                    return Ok(());
                }
            } else if entry.is_live() {
                let level = frame.level + 1;
                let child = slot_base(entry);
                let fits = self
                    .arena
                    .check_range(child, self.slots_at(level) * SLOT_BYTES)
                    .is_ok();
                on_table(level, slot, entry, fits)?;
                if fits {
                    stack.push(Frame {
                        table: child,
                        level,
                        prefix: bits,
                        next: 0,
                        parent: Some(slot),
                    });
                }
            }
        }
        Ok(())
    }

    /// Live ids as coalesced inclusive ranges, in ascending order.
    ///
    /// `local` decides which ids count as [`Ownership::Local`].
    pub fn ranges(&self, local: NodeId, ownership: Ownership) -> StoreResult<Vec<ChunkIdRange>> {
        let mut ranges: Vec<ChunkIdRange> = Vec::new();
        self.walk_from(
            self.root_frame(),
            require_fit,
            |id, _, entry| {
                if entry.is_live() && ownership.admits(id, local) {
                    let extended = ranges.last_mut().is_some_and(|last| last.try_extend(id));
                    if !extended {
                        ranges.push(ChunkIdRange::single(id));
                    }
                }
                Ok(ControlFlow::Continue(()))
            },
        )?;
        Ok(ranges)
    }

    /// Finds the record whose payload starts at `address`.
    ///
    /// Scans every leaf, so this is meant for rare bookkeeping only.
    pub fn reverse_lookup(&self, address: Address) -> StoreResult<Option<ChunkId>> {
        let mut found = None;
        self.walk_from(
            self.root_frame(),
            require_fit,
            |id, _, entry| {
                if entry.is_live() && entry.address() == address {
                    found = Some(id);
                    return Ok(ControlFlow::Break(()));
                }
                Ok(ControlFlow::Continue(()))
            },
        )?;
        Ok(found)
    }

    /// Calls `f` for every live record.
    pub fn for_each_live<F>(&self, mut f: F) -> StoreResult<()>
    where
        F: FnMut(ChunkId, Entry) -> StoreResult<()>,
    {
        self.walk_from(
            self.root_frame(),
            require_fit,
            |id, _, entry| {
                if entry.is_live() {
                    f(id, entry)?;
                }
                Ok(ControlFlow::Continue(()))
            },
        )
    }

    /// Collects every table block and leaf in one pass, without stopping at
    /// tables that point outside the arena.
    pub fn scan(&self) -> StoreResult<TableScan> {
        let mut scan = TableScan {
            tables: vec![self.layout.root],
            ..TableScan::default()
        };
        self.walk_from(
            self.root_frame(),
            |_, slot, entry, fits| {
                if fits {
                    scan.tables.push(entry);
                } else {
                    scan.stray.push((slot, entry));
                }
                Ok(())
            },
            |id, _, entry| {
                if entry.is_live() {
                    scan.live.push((id, entry));
                } else if entry.is_zombie() {
                    scan.zombies += 1;
                }
                Ok(ControlFlow::Continue(()))
            },
        )?;
        Ok(scan)
    }

    /// Turns up to `limit` zombie slots of `owner` back into `FREE` and
    /// hands their local ids to `sink`. Returns how many were converted.
    ///
    /// Subtrees marked as zombie-free are skipped; a subtree scanned to the
    /// end is marked zombie-free afterwards. Must be called under the
    /// structural lock.
    pub fn sweep_zombies<F>(&self, owner: NodeId, limit: usize, mut sink: F) -> StoreResult<usize>
    where
        F: FnMut(u64),
    {
        if limit == 0 {
            return Ok(0);
        }
        let owner_slot = Self::slot(self.root_slots, u64::from(owner.as_u16()));
        let top = self.entry(owner_slot)?;
        if !top.is_live() || top.is_subtree_full() {
            return Ok(0);
        }

        let leaf_level = self.layout.lid_levels;
        let mut converted = 0usize;
        let mut stack = vec![Frame {
            table: slot_base(top),
            level: 1,
            prefix: u64::from(owner.as_u16()) << self.level_shift(0),
            next: 0,
            parent: Some(owner_slot),
        }];

        while let Some(frame) = stack.last_mut() {
            if frame.next == self.slots_per_table() {
                let done = *frame;
                stack.pop();
                if let Some(parent) = done.parent {
                    let entry = self.entry(parent)?;
                    self.store_entry(parent, entry.with_subtree_full(true))?;
                }
                continue;
            }
            let index = frame.next;
            frame.next += 1;
            let frame = *frame;

            let slot = Self::slot(frame.table, index);
            let entry = self.entry(slot)?;
            let bits = frame.prefix | (index << self.level_shift(frame.level));

            if frame.level == leaf_level {
                if entry.is_zombie() && self.compare_exchange_entry(slot, entry, Entry::FREE)?.is_ok() {
                    sink(bits & LOCAL_ID_MASK);
                    converted += 1;
                    if converted == limit {
                        break;
                    }
                }
            } else if entry.is_live() && !entry.is_subtree_full() {
                stack.push(Frame {
                    table: slot_base(entry),
                    level: frame.level + 1,
                    prefix: bits,
                    next: 0,
                    parent: Some(slot),
                });
            }
        }

        debug!(%owner, converted, limit, "swept zombie slots");
        Ok(converted)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{record, setup};
    use super::*;

    fn id(owner: u16, lid: u64) -> ChunkId {
        ChunkId::new(NodeId::new(owner), lid)
    }

    #[test]
    fn test_ranges_coalesce() {
        let (mut heap, table) = setup(4, true);
        for lid in [1u64, 2, 3, 7, 4095, 4096, 4097] {
            let slot = table.translate_or_create(id(1, lid), &mut heap).unwrap();
            table.store_entry(slot, record(64 + lid)).unwrap();
        }
        let zombie = table.translate_or_create(id(1, 8), &mut heap).unwrap();
        table.store_entry(zombie, Entry::ZOMBIE).unwrap();

        let ranges = table.ranges(NodeId::new(1), Ownership::Local).unwrap();
        let spans: Vec<_> = ranges
            .iter()
            .map(|r| (r.start.local_id(), r.end.local_id()))
            .collect();
        assert_eq!(spans, vec![(1, 3), (7, 7), (4095, 4097)]);
    }

    #[test]
    fn test_ranges_partition_by_owner() {
        let (mut heap, table) = setup(4, true);
        for (owner, lid) in [(1u16, 10u64), (1, 11), (2, 10), (7, 3)] {
            let slot = table.translate_or_create(id(owner, lid), &mut heap).unwrap();
            table.store_entry(slot, record(64)).unwrap();
        }

        let local = table.ranges(NodeId::new(1), Ownership::Local).unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].len(), 2);

        let migrated = table.ranges(NodeId::new(1), Ownership::Migrated).unwrap();
        assert_eq!(migrated.len(), 2);
        assert_eq!(migrated[0].start, id(2, 10));
        assert_eq!(migrated[1].start, id(7, 3));

        let all = table.ranges(NodeId::new(1), Ownership::All).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_reverse_lookup() {
        let (mut heap, table) = setup(6, true);
        let slot = table.translate_or_create(id(3, 99), &mut heap).unwrap();
        table.store_entry(slot, record(1234)).unwrap();

        assert_eq!(table.reverse_lookup(Address::new(1234)).unwrap(), Some(id(3, 99)));
        assert_eq!(table.reverse_lookup(Address::new(1235)).unwrap(), None);
    }

    #[test]
    fn test_tables_and_live_records() {
        let (mut heap, table) = setup(4, true);
        let slot = table.translate_or_create(id(1, 1), &mut heap).unwrap();
        table.store_entry(slot, record(64)).unwrap();

        // root + one table per level below it
        assert_eq!(table.scan().unwrap().tables.len(), 5);

        let mut seen = Vec::new();
        table
            .for_each_live(|id, entry| {
                seen.push((id, entry));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![(id(1, 1), record(64))]);
    }

    #[test]
    fn test_scan_skips_table_outside_arena() {
        let (mut heap, table) = setup(4, true);
        for (owner, lid) in [(1u16, 1u64), (2, 1)] {
            let slot = table.translate_or_create(id(owner, lid), &mut heap).unwrap();
            table.store_entry(slot, record(64)).unwrap();
        }
        let owner_slot = TranslationTable::<chunkstore_memory::HeapArena>::slot(table.root_slots, 1);
        let top = table.entry(owner_slot).unwrap();
        let beyond = Address::new(table.arena().size() - 16);
        table.store_entry(owner_slot, top.with_address(beyond)).unwrap();

        let scan = table.scan().unwrap();
        assert_eq!(scan.stray.len(), 1);
        assert_eq!(scan.stray[0].0, owner_slot);
        assert_eq!(scan.live, vec![(id(2, 1), record(64))]);
        // root + owner 2's chain
        assert_eq!(scan.tables.len(), 5);

        let err = table.ranges(NodeId::new(1), Ownership::All).unwrap_err();
        assert!(matches!(err, StoreError::Corruption { .. }));
    }

    #[test]
    fn test_sweep_converts_zombies() {
        let (mut heap, table) = setup(4, true);
        for lid in [5u64, 6, 9000] {
            let slot = table.translate_or_create(id(1, lid), &mut heap).unwrap();
            table.store_entry(slot, record(64)).unwrap();
            table.delete(id(1, lid), true).unwrap();
        }
        assert_eq!(table.scan().unwrap().zombies, 3);

        let mut ids = Vec::new();
        assert_eq!(table.sweep_zombies(NodeId::new(1), 2, |lid| ids.push(lid)).unwrap(), 2);
        assert_eq!(ids, vec![5, 6]);
        assert_eq!(table.scan().unwrap().zombies, 1);

        assert_eq!(table.sweep_zombies(NodeId::new(1), 10, |lid| ids.push(lid)).unwrap(), 1);
        assert_eq!(ids, vec![5, 6, 9000]);
        assert!(table.lookup(id(1, 9000)).unwrap().is_free());

        // Fully swept subtrees are skipped from now on.
        let owner_slot = TranslationTable::<chunkstore_memory::HeapArena>::slot(table.root_slots, 1);
        assert!(table.entry(owner_slot).unwrap().is_subtree_full());
        assert_eq!(table.sweep_zombies(NodeId::new(1), 10, |_| {}).unwrap(), 0);
    }

    #[test]
    fn test_sweep_ignores_other_owners() {
        let (mut heap, table) = setup(4, true);
        let slot = table.translate_or_create(id(2, 5), &mut heap).unwrap();
        table.store_entry(slot, record(64)).unwrap();
        table.delete(id(2, 5), true).unwrap();

        assert_eq!(table.sweep_zombies(NodeId::new(1), 10, |_| {}).unwrap(), 0);
        assert_eq!(table.scan().unwrap().zombies, 1);
    }
}
