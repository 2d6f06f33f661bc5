//! The record store.
//!
//! [`ChunkStore`] owns one arena and everything layered on it:
//!
//! ```text
//!                   ChunkStore
//!   +---------------------------------------------+
//!   | structure: Mutex<heap, recycler, next lid>  |   create / remove / resize
//!   | table: TranslationTable (lock-free reads)   |   id -> slot
//!   | locks: LockProtocol (CAS on slot entries)   |   get / put / lock / pin
//!   +---------------------------------------------+
//!                        |
//!                      Arena
//! ```
//!
//! Structural changes (allocation, table growth, id assignment, removal)
//! run under one coarse mutex. Payload access runs under per-record locks
//! kept in the entry bits. Lock order is always record lock, then the
//! structural mutex.

mod records;
mod view;

pub use view::{RecordMut, RecordRef};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chunkstore_common::config::StoreConfig;
use chunkstore_common::error::{StoreError, StoreResult};
use chunkstore_common::sync::LockTimeout;
use chunkstore_common::types::{ChunkId, ChunkIdRange, NodeId};
use chunkstore_index::{IdRecycler, LockProtocol, LockResult, LockStats, Ownership, TranslationTable};
use chunkstore_memory::{Address, Arena, Entry, Heap, HeapArena, HeapStatus};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::analyzer::{self, AnalysisReport};
use crate::dump::{self, Dump, DumpHeader};
use crate::stats::StoreStats;

/// State guarded by the structural lock.
struct Structure<A: Arena> {
    heap: Heap<A>,
    recycler: IdRecycler,
    next_local_id: u64,
}

/// A store of variable-sized records in one arena.
///
/// # Example
///
/// ```rust
/// use chunkstore_common::config::StoreConfig;
/// use chunkstore_common::sync::LockTimeout;
/// use chunkstore_engine::ChunkStore;
///
/// let store = ChunkStore::open(StoreConfig::for_testing()).unwrap();
/// let id = store.create(8).unwrap();
///
/// store.lock_write(id, LockTimeout::TryOnce).unwrap();
/// assert!(store.lock_read(id, LockTimeout::TryOnce).unwrap_err().is_retryable());
/// store.unlock_write(id).unwrap();
/// ```
pub struct ChunkStore<A: Arena = HeapArena> {
    config: StoreConfig,
    arena: Arc<A>,
    table: TranslationTable<A>,
    structure: Mutex<Structure<A>>,
    locks: LockProtocol,
    stats: StoreStats,
}

// =============================================================================
// Construction
// =============================================================================

impl ChunkStore<HeapArena> {
    /// Creates an empty store over a fresh in-process arena.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let arena = Arc::new(HeapArena::new(config.arena_size));
        Self::with_arena(arena, config)
    }

    /// Rebuilds a store from a dump.
    ///
    /// Geometry (owner, arena size, maximum block size, table depth,
    /// recycler capacity) comes from the dump; `config` supplies the
    /// runtime settings. Locks held at dump time are dropped.
    pub fn restore(dump: &Dump, config: StoreConfig) -> StoreResult<Self> {
        let header = dump.header();
        let config = StoreConfig {
            owner: header.owner,
            arena_size: header.heap.arena_size,
            max_block_size: header.heap.max_block_size,
            lid_levels: header.table.lid_levels,
            recycler_capacity: header.recycler_capacity,
            ..config
        };
        config.validate()?;

        let arena = Arc::new(dump.to_arena());
        let heap = Heap::attach(Arc::clone(&arena), header.heap.clone(), header.status)?;
        let table = TranslationTable::attach(Arc::clone(&arena), header.table, config.leaf_cache)?;
        let recycler = IdRecycler::restore(
            header.owner,
            header.recycler_capacity,
            header.recycler_ring.clone(),
            header.recycler_available,
        );

        let store = Self::assemble(config, arena, heap, table, recycler, header.next_local_id);
        let cleared = store.clear_stale_locks()?;
        info!(
            owner = %store.config.owner,
            next_local_id = header.next_local_id,
            cleared,
            "restored store from dump"
        );
        Ok(store)
    }

    /// Reads a dump file and rebuilds the store from it.
    pub fn load(path: &Path, config: StoreConfig) -> StoreResult<Self> {
        Self::restore(&Dump::read_from(path)?, config)
    }
}

impl<A: Arena> ChunkStore<A> {
    /// Creates an empty store over `arena`, formatting it.
    pub fn with_arena(arena: Arc<A>, config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        if arena.size() != config.arena_size {
            return Err(StoreError::config(format!(
                "arena of {} bytes does not match arena_size {}",
                arena.size(),
                config.arena_size
            )));
        }

        let mut heap = Heap::new(Arc::clone(&arena), config.max_block_size)?;
        let table = TranslationTable::create(&mut heap, config.lid_levels, config.leaf_cache)?;
        let recycler = IdRecycler::new(config.owner, config.recycler_capacity);

        info!(
            owner = %config.owner,
            arena_size = config.arena_size,
            max_block_size = config.max_block_size,
            lid_levels = config.lid_levels,
            "opened store"
        );
        Ok(Self::assemble(config, arena, heap, table, recycler, 0))
    }

    fn assemble(
        config: StoreConfig,
        arena: Arc<A>,
        heap: Heap<A>,
        table: TranslationTable<A>,
        recycler: IdRecycler,
        next_local_id: u64,
    ) -> Self {
        Self {
            locks: LockProtocol::new(config.backoff),
            config,
            arena,
            table,
            structure: Mutex::new(Structure {
                heap,
                recycler,
                next_local_id,
            }),
            stats: StoreStats::new(),
        }
    }

    /// Strips lock bits that outlived the threads holding them.
    fn clear_stale_locks(&self) -> StoreResult<usize> {
        let mut locked = Vec::new();
        self.table.for_each_live(|id, entry| {
            if entry.is_locked() {
                locked.push(id);
            }
            Ok(())
        })?;
        for &id in &locked {
            if let Some(slot) = self.table.translate(id)? {
                let entry = self.table.entry(slot)?;
                self.table.store_entry(slot, entry.unlocked())?;
            }
        }
        Ok(locked.len())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The configuration in effect.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The node that owns the ids this store mints.
    pub fn owner(&self) -> NodeId {
        self.config.owner
    }

    /// The backing arena.
    pub fn arena(&self) -> &Arc<A> {
        &self.arena
    }

    /// Record operation counters.
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Lock protocol counters.
    pub fn lock_stats(&self) -> &LockStats {
        self.locks.stats()
    }

    /// Heap counters.
    pub fn status(&self) -> HeapStatus {
        self.structure.lock().heap.status()
    }

    // =========================================================================
    // Explicit locks
    // =========================================================================

    /// Takes a read lock on `id`, waiting at most `timeout`.
    pub fn lock_read(&self, id: ChunkId, timeout: LockTimeout) -> StoreResult<()> {
        let slot = self.slot(id)?;
        self.acquire(id, slot, false, timeout)
    }

    /// Takes the write lock on `id`, waiting at most `timeout`.
    pub fn lock_write(&self, id: ChunkId, timeout: LockTimeout) -> StoreResult<()> {
        let slot = self.slot(id)?;
        self.acquire(id, slot, true, timeout)
    }

    /// Releases one read lock on `id`.
    pub fn unlock_read(&self, id: ChunkId) -> StoreResult<()> {
        let slot = self.slot(id)?;
        self.release(id, slot, false)
    }

    /// Releases the write lock on `id`.
    pub fn unlock_write(&self, id: ChunkId) -> StoreResult<()> {
        let slot = self.slot(id)?;
        self.release(id, slot, true)
    }

    // =========================================================================
    // Ranges and diagnostics
    // =========================================================================

    /// Live ids minted by this store's owner, as inclusive ranges.
    pub fn local_ranges(&self) -> StoreResult<Vec<ChunkIdRange>> {
        let result = self.table.ranges(self.config.owner, Ownership::Local);
        self.check(result)
    }

    /// Live ids of other owners held here, as inclusive ranges.
    pub fn migrated_ranges(&self) -> StoreResult<Vec<ChunkIdRange>> {
        let result = self.table.ranges(self.config.owner, Ownership::Migrated);
        self.check(result)
    }

    /// Runs the consistency analyzer over the live arena.
    ///
    /// Blocks structural changes for the duration of the walk.
    pub fn analyze(&self) -> StoreResult<AnalysisReport> {
        let structure = self.structure.lock();
        analyzer::analyze(&structure.heap, &self.table)
    }

    /// Captures the arena and its metadata.
    pub fn snapshot(&self) -> StoreResult<Dump> {
        let structure = self.structure.lock();
        self.capture(&structure)
    }

    /// Writes a dump of the store to `path`.
    pub fn dump(&self, path: &Path) -> StoreResult<()> {
        self.snapshot()?.write_to(path)
    }

    fn capture(&self, structure: &Structure<A>) -> StoreResult<Dump> {
        dump::capture(&structure.heap, &self.table, |heap, status, table| DumpHeader {
            heap,
            status,
            table,
            owner: self.config.owner,
            next_local_id: structure.next_local_id,
            recycler_capacity: structure.recycler.capacity(),
            recycler_ring: structure.recycler.ring_ids(),
            recycler_available: structure.recycler.available(),
        })
    }

    // =========================================================================
    // Internals shared by record operations
    // =========================================================================

    fn structure(&self) -> MutexGuard<'_, Structure<A>> {
        self.structure.lock()
    }

    /// Leaf slot of `id`; `NotFound` if no table on its path exists.
    fn slot(&self, id: ChunkId) -> StoreResult<Address> {
        let result = self.table.translate(id);
        self.check(result)?.ok_or(StoreError::NotFound { id })
    }

    /// Payload length of `entry`, read without the structural lock.
    fn payload_len(&self, entry: Entry) -> StoreResult<u64> {
        entry.length(|address, width| self.arena.read(address, width))
    }

    fn acquire(&self, id: ChunkId, slot: Address, write: bool, timeout: LockTimeout) -> StoreResult<()> {
        let deadline = timeout.start();
        let result = if write {
            self.locks.acquire_write(self.arena.as_ref(), slot, timeout)
        } else {
            self.locks.acquire_read(self.arena.as_ref(), slot, timeout)
        };
        match self.check(result)? {
            LockResult::Granted => Ok(()),
            LockResult::NotFound => Err(StoreError::NotFound { id }),
            LockResult::Timeout => {
                self.stats.record_lock_timeout();
                Err(StoreError::LockTimeout {
                    id,
                    waited_ms: deadline.elapsed_ms(),
                })
            }
            other => Err(StoreError::internal(format!(
                "lock acquisition on {id} returned {other}"
            ))),
        }
    }

    fn release(&self, id: ChunkId, slot: Address, write: bool) -> StoreResult<()> {
        let result = if write {
            self.locks.release_write(self.arena.as_ref(), slot)
        } else {
            self.locks.release_read(self.arena.as_ref(), slot)
        };
        match self.check(result)? {
            LockResult::Released => Ok(()),
            LockResult::NotFound => Err(StoreError::NotFound { id }),
            LockResult::NotHeld => Err(StoreError::LockNotHeld { id }),
            other => Err(StoreError::internal(format!(
                "lock release on {id} returned {other}"
            ))),
        }
    }

    /// Runs `f` on the entry of `id` under a read lock.
    fn with_read_lock<T>(
        &self,
        id: ChunkId,
        f: impl FnOnce(Address, Entry) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let slot = self.slot(id)?;
        self.acquire(id, slot, false, self.config.lock_timeout())?;
        let result = self.table.entry(slot).and_then(|entry| f(slot, entry));
        let released = self.release(id, slot, false);
        let value = self.check(result)?;
        released?;
        Ok(value)
    }

    /// Runs `f` on the entry of `id` under the write lock.
    fn with_write_lock<T>(
        &self,
        id: ChunkId,
        f: impl FnOnce(Address, Entry) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let slot = self.slot(id)?;
        self.acquire(id, slot, true, self.config.lock_timeout())?;
        let result = self.table.entry(slot).and_then(|entry| f(slot, entry));
        let released = self.release(id, slot, true);
        let value = self.check(result)?;
        released?;
        Ok(value)
    }

    // =========================================================================
    // Fault handling
    // =========================================================================

    /// Reports a failure raised without the structural lock held.
    fn check<T>(&self, result: StoreResult<T>) -> StoreResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                let structure = self.structure();
                self.on_fatal(&structure, err);
            }
        }
        result
    }

    /// Reports a failure raised while `structure` is locked by the caller.
    fn check_locked<T>(&self, structure: &Structure<A>, result: StoreResult<T>) -> StoreResult<T> {
        match &result {
            Err(StoreError::NoSpace { requested }) => {
                let status = structure.heap.status();
                warn!(
                    requested,
                    free_bytes = status.free_bytes,
                    free_blocks = status.free_blocks,
                    "no free block fits the request"
                );
            }
            Err(err) if err.is_fatal() => self.on_fatal(structure, err),
            _ => {}
        }
        result
    }

    fn on_fatal(&self, structure: &Structure<A>, err: &StoreError) {
        error!(%err, code = %err.code(), "fatal store error");
        let Some(dir) = &self.config.dump_dir else {
            return;
        };
        let path = post_mortem_path(dir, self.config.owner);
        match self.capture(structure).and_then(|dump| dump.write_to(&path)) {
            Ok(()) => error!(path = %path.display(), "wrote post-mortem dump"),
            Err(dump_err) => error!(%dump_err, "could not write post-mortem dump"),
        }
    }
}

fn post_mortem_path(dir: &Path, owner: NodeId) -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    dir.join(format!("chunkstore-{}-{millis}.dump", owner.as_u16()))
}

impl<A: Arena> std::fmt::Debug for ChunkStore<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let structure = self.structure.lock();
        f.debug_struct("ChunkStore")
            .field("owner", &self.config.owner)
            .field("heap", &structure.heap)
            .field("table", &self.table)
            .field("next_local_id", &structure.next_local_id)
            .field("recycled", &structure.recycler.len())
            .finish()
    }
}

impl<A: Arena> Drop for ChunkStore<A> {
    fn drop(&mut self) {
        debug!(owner = %self.config.owner, stats = %self.stats, "closing store");
    }
}
