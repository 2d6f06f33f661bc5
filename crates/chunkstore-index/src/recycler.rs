//! Local id recycling.
//!
//! Removed records give their local id back to an [`IdRecycler`]. Up to
//! `capacity` ids wait in a ring and are reused immediately. Ids that do not
//! fit stay in the table as `ZOMBIE` slots and are only counted; when the
//! ring runs dry, a bounded sweep of the table turns zombies back into free
//! slots and refills the ring.
//!
//! The recycler never mints ids. When it has nothing to hand out, the
//! caller takes the next fresh id from its own counter.

use std::collections::VecDeque;

use chunkstore_common::error::StoreResult;
use chunkstore_common::types::NodeId;
use chunkstore_memory::Arena;
use tracing::{debug, trace};

use crate::table::TranslationTable;

/// Pool of reusable local ids for one owner.
#[derive(Debug, Clone)]
pub struct IdRecycler {
    owner: NodeId,
    capacity: usize,
    ring: VecDeque<u64>,
    /// Ids in the ring plus zombies not swept yet.
    available: u64,
}

impl IdRecycler {
    /// Creates an empty recycler.
    pub fn new(owner: NodeId, capacity: usize) -> Self {
        Self {
            owner,
            capacity: capacity.max(1),
            ring: VecDeque::with_capacity(capacity.max(1)),
            available: 0,
        }
    }

    /// Rebuilds a recycler from saved state.
    pub fn restore(owner: NodeId, capacity: usize, ring: Vec<u64>, available: u64) -> Self {
        let capacity = capacity.max(ring.len()).max(1);
        let available = available.max(ring.len() as u64);
        Self {
            owner,
            capacity,
            ring: ring.into(),
            available,
        }
    }

    /// Owner whose ids are recycled.
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// Ring capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ids waiting in the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns true if the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Ids in the ring plus zombies believed to be in the table.
    pub fn available(&self) -> u64 {
        self.available
    }

    /// Ring contents in hand-out order.
    pub fn ring_ids(&self) -> Vec<u64> {
        self.ring.iter().copied().collect()
    }

    /// Offers a freed local id.
    ///
    /// Returns true if the id went into the ring, in which case the caller
    /// frees the slot. Otherwise the caller leaves a zombie behind. The id
    /// is counted as available either way.
    pub fn put(&mut self, lid: u64) -> bool {
        self.available += 1;
        if self.ring.len() < self.capacity {
            self.ring.push_back(lid);
            trace!(lid, "recycled id into ring");
            true
        } else {
            false
        }
    }

    /// Takes a reusable id, sweeping zombies out of `table` if the ring is
    /// empty. `None` means the caller must mint a fresh id.
    pub fn get<A: Arena>(&mut self, table: &TranslationTable<A>) -> StoreResult<Option<u64>> {
        if self.ring.is_empty() && self.available > 0 {
            self.refill(table)?;
        }
        let lid = self.ring.pop_front();
        if lid.is_some() {
            self.available = self.available.saturating_sub(1);
        }
        Ok(lid)
    }

    /// Takes `n` numerically consecutive ids if the ring currently holds
    /// such a run in consecutive positions. Leaves the ring untouched
    /// otherwise.
    pub fn get_consecutive(&mut self, n: usize) -> Option<Vec<u64>> {
        if n == 0 {
            return Some(Vec::new());
        }
        let mut run_start = 0;
        let mut run_len = 0;
        let mut previous: Option<u64> = None;
        let mut found = None;
        for (index, &lid) in self.ring.iter().enumerate() {
            if previous.and_then(|p| p.checked_add(1)) == Some(lid) {
                run_len += 1;
            } else {
                run_start = index;
                run_len = 1;
            }
            previous = Some(lid);
            if run_len == n {
                found = Some(run_start);
                break;
            }
        }

        let start = found?;
        let ids: Vec<u64> = self.ring.drain(start..start + n).collect();
        self.available = self.available.saturating_sub(n as u64);
        Some(ids)
    }

    /// Sweeps zombies of this owner out of `table` into the ring until it
    /// is full. Returns the number of ids added.
    pub fn refill<A: Arena>(&mut self, table: &TranslationTable<A>) -> StoreResult<usize> {
        let room = self.capacity - self.ring.len();
        if room == 0 {
            return Ok(0);
        }
        let ring = &mut self.ring;
        let found = table.sweep_zombies(self.owner, room, |lid| ring.push_back(lid))?;
        if found < room {
            // The sweep saw every zombie, so nothing beyond the ring is left.
            self.available = self.ring.len() as u64;
        }
        debug!(found, ring = self.ring.len(), available = self.available, "refilled id recycler");
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::tests::{record, setup};
    use chunkstore_common::types::ChunkId;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    fn owner() -> NodeId {
        NodeId::new(1)
    }

    #[test]
    fn test_put_respects_capacity() {
        let mut recycler = IdRecycler::new(owner(), 2);
        assert!(recycler.put(1));
        assert!(recycler.put(2));
        assert!(!recycler.put(3));
        assert_eq!(recycler.len(), 2);
        assert_eq!(recycler.available(), 3);
    }

    #[test]
    fn test_zombie_is_recovered_by_refill() {
        let (mut heap, table) = setup(4, true);
        let mut recycler = IdRecycler::new(owner(), 1);

        for lid in [5u64, 9] {
            let slot = table
                .translate_or_create(ChunkId::new(owner(), lid), &mut heap)
                .unwrap();
            table.store_entry(slot, record(64 + lid)).unwrap();
        }

        let accepted = recycler.put(9);
        assert!(accepted);
        table.delete(ChunkId::new(owner(), 9), !accepted).unwrap();

        let accepted = recycler.put(5);
        assert!(!accepted);
        table.delete(ChunkId::new(owner(), 5), !accepted).unwrap();
        assert!(table.lookup(ChunkId::from_raw(0x0001_0000_0000_0005)).unwrap().is_zombie());

        assert_eq!(recycler.get(&table).unwrap(), Some(9));
        assert_eq!(recycler.get(&table).unwrap(), Some(5));
        assert!(table.lookup(ChunkId::new(owner(), 5)).unwrap().is_free());
        assert_eq!(recycler.get(&table).unwrap(), None);
        assert_eq!(recycler.available(), 0);
    }

    #[test]
    fn test_stale_count_is_reset() {
        let (_heap, table) = setup(4, true);
        let mut recycler = IdRecycler::restore(owner(), 4, Vec::new(), 10);
        assert_eq!(recycler.get(&table).unwrap(), None);
        assert_eq!(recycler.available(), 0);
    }

    #[test]
    fn test_get_consecutive() {
        let mut recycler = IdRecycler::new(owner(), 16);
        for lid in [4u64, 10, 11, 13, 14, 15, 16, 20] {
            recycler.put(lid);
        }

        assert_eq!(recycler.get_consecutive(3), Some(vec![13, 14, 15]));
        assert_eq!(recycler.ring_ids(), vec![4, 10, 11, 16, 20]);
        assert_eq!(recycler.available(), 5);

        assert_eq!(recycler.get_consecutive(3), None);
        assert_eq!(recycler.ring_ids(), vec![4, 10, 11, 16, 20]);

        assert_eq!(recycler.get_consecutive(2), Some(vec![10, 11]));
        assert_eq!(recycler.get_consecutive(1), Some(vec![4]));
    }

    #[test]
    fn test_restore_keeps_ring_order() {
        let recycler = IdRecycler::restore(owner(), 8, vec![3, 1, 2], 5);
        assert_eq!(recycler.ring_ids(), vec![3, 1, 2]);
        assert_eq!(recycler.available(), 5);
        assert_eq!(recycler.capacity(), 8);
    }

    #[test]
    fn test_random_churn_never_reuses_live_ids() {
        let (mut heap, table) = setup(4, true);
        let mut recycler = IdRecycler::new(owner(), 4);
        let mut rng = StdRng::seed_from_u64(17);

        let mut live: Vec<u64> = Vec::new();
        let mut released: HashSet<u64> = HashSet::new();
        let mut next_fresh = 0u64;

        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let lid = match recycler.get(&table).unwrap() {
                    Some(lid) => {
                        assert!(released.remove(&lid), "id {lid} was never released");
                        lid
                    }
                    None => {
                        next_fresh += 1;
                        next_fresh - 1
                    }
                };
                assert!(!live.contains(&lid));
                let id = ChunkId::new(owner(), lid);
                let slot = table.translate_or_create(id, &mut heap).unwrap();
                assert!(table.entry(slot).unwrap().is_free());
                table.store_entry(slot, record(64 + lid)).unwrap();
                live.push(lid);
            } else {
                let lid = live.swap_remove(rng.gen_range(0..live.len()));
                let accepted = recycler.put(lid);
                table.delete(ChunkId::new(owner(), lid), !accepted).unwrap();
                released.insert(lid);
            }
        }

        // Every released id is either queued or still a zombie.
        let queued = recycler.ring_ids();
        assert!(queued.iter().all(|lid| released.contains(lid)));
        assert_eq!(queued.len() as u64 + table.scan().unwrap().zombies, released.len() as u64);
        assert_eq!(table.scan().unwrap().live.len(), live.len());
    }
}
