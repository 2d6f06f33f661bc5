//! Record store statistics for monitoring and debugging.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters updated by [`ChunkStore`](crate::ChunkStore) operations.
#[derive(Debug, Default)]
pub struct StoreStats {
    /// Records created (fresh, recycled and migrated ids).
    creates: AtomicU64,
    /// Records removed.
    removes: AtomicU64,
    /// Payload reads.
    gets: AtomicU64,
    /// Payload writes.
    puts: AtomicU64,
    /// Blocks moved by a resize.
    relocations: AtomicU64,
    /// Lock acquisitions that timed out.
    lock_timeouts: AtomicU64,
    /// Local ids taken from the recycler.
    recycled_ids: AtomicU64,
    /// Local ids minted from the counter.
    fresh_ids: AtomicU64,
}

impl StoreStats {
    /// Creates new statistics.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Records `n` created records.
    #[inline]
    pub fn record_creates(&self, n: u64) {
        Self::bump(&self.creates, n);
    }

    /// Records a removal.
    #[inline]
    pub fn record_remove(&self) {
        Self::bump(&self.removes, 1);
    }

    /// Records a read.
    #[inline]
    pub fn record_get(&self) {
        Self::bump(&self.gets, 1);
    }

    /// Records a write.
    #[inline]
    pub fn record_put(&self) {
        Self::bump(&self.puts, 1);
    }

    /// Records a block relocation.
    #[inline]
    pub fn record_relocation(&self) {
        Self::bump(&self.relocations, 1);
    }

    /// Records a lock timeout.
    #[inline]
    pub fn record_lock_timeout(&self) {
        Self::bump(&self.lock_timeouts, 1);
    }

    /// Records `n` ids taken from the recycler.
    #[inline]
    pub fn record_recycled_ids(&self, n: u64) {
        Self::bump(&self.recycled_ids, n);
    }

    /// Records `n` freshly minted ids.
    #[inline]
    pub fn record_fresh_ids(&self, n: u64) {
        Self::bump(&self.fresh_ids, n);
    }

    /// Returns created records.
    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::Relaxed)
    }

    /// Returns removed records.
    pub fn removes(&self) -> u64 {
        self.removes.load(Ordering::Relaxed)
    }

    /// Returns reads.
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Returns writes.
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Returns relocations.
    pub fn relocations(&self) -> u64 {
        self.relocations.load(Ordering::Relaxed)
    }

    /// Returns lock timeouts.
    pub fn lock_timeouts(&self) -> u64 {
        self.lock_timeouts.load(Ordering::Relaxed)
    }

    /// Returns recycled ids handed out.
    pub fn recycled_ids(&self) -> u64 {
        self.recycled_ids.load(Ordering::Relaxed)
    }

    /// Returns fresh ids handed out.
    pub fn fresh_ids(&self) -> u64 {
        self.fresh_ids.load(Ordering::Relaxed)
    }

    /// Returns the share of ids that came from the recycler (0.0 to 1.0).
    pub fn recycle_ratio(&self) -> f64 {
        let total = self.recycled_ids() + self.fresh_ids();
        if total == 0 {
            0.0
        } else {
            self.recycled_ids() as f64 / total as f64
        }
    }

    /// Copies the counters into a plain value.
    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            creates: self.creates(),
            removes: self.removes(),
            gets: self.gets(),
            puts: self.puts(),
            relocations: self.relocations(),
            lock_timeouts: self.lock_timeouts(),
            recycled_ids: self.recycled_ids(),
            fresh_ids: self.fresh_ids(),
        }
    }

    /// Resets all statistics.
    pub fn reset(&self) {
        for counter in [
            &self.creates,
            &self.removes,
            &self.gets,
            &self.puts,
            &self.relocations,
            &self.lock_timeouts,
            &self.recycled_ids,
            &self.fresh_ids,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoreStats {{ creates: {}, removes: {}, gets: {}, puts: {}, lock_timeouts: {}, recycle_ratio: {:.2}% }}",
            self.creates(),
            self.removes(),
            self.gets(),
            self.puts(),
            self.lock_timeouts(),
            self.recycle_ratio() * 100.0
        )
    }
}

/// Point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatsSnapshot {
    /// Records created.
    pub creates: u64,
    /// Records removed.
    pub removes: u64,
    /// Payload reads.
    pub gets: u64,
    /// Payload writes.
    pub puts: u64,
    /// Blocks moved by a resize.
    pub relocations: u64,
    /// Lock acquisitions that timed out.
    pub lock_timeouts: u64,
    /// Ids taken from the recycler.
    pub recycled_ids: u64,
    /// Ids minted from the counter.
    pub fresh_ids: u64,
}
