//! Record operations of [`ChunkStore`].

use bytes::Bytes;
use chunkstore_common::constants::MAX_LOCAL_ID;
use chunkstore_common::error::{StoreError, StoreResult};
use chunkstore_common::types::ChunkId;
use chunkstore_memory::{Address, Arena, Entry};
use tracing::{debug, trace, warn};

use super::{ChunkStore, RecordMut, RecordRef, Structure};
use crate::serializer::{Decode, Encode, RecordReader, RecordWriter};

/// Attempts a weak read makes before reporting the record as gone.
const WEAK_READ_ATTEMPTS: usize = 3;

/// Where the local ids of a create came from, for rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdSource {
    Recycled,
    Fresh,
}

impl<A: Arena> ChunkStore<A> {
    // =========================================================================
    // Creation
    // =========================================================================

    /// Creates a zero-filled record of `size` bytes and returns its id.
    pub fn create(&self, size: u64) -> StoreResult<ChunkId> {
        let mut structure = self.structure();
        let result = self.create_locked(&mut structure, size);
        let (id, source) = self.check_locked(&structure, result)?;
        drop(structure);

        self.stats.record_creates(1);
        match source {
            IdSource::Recycled => self.stats.record_recycled_ids(1),
            IdSource::Fresh => self.stats.record_fresh_ids(1),
        }
        trace!(%id, size, "created record");
        Ok(id)
    }

    fn create_locked(&self, s: &mut Structure<A>, size: u64) -> StoreResult<(ChunkId, IdSource)> {
        let (lid, source) = match s.recycler.get(&self.table)? {
            Some(lid) => (lid, IdSource::Recycled),
            None => (self.mint(s, 1)?, IdSource::Fresh),
        };
        let id = ChunkId::new(self.config.owner, lid);

        let placed = self.table.translate_or_create(id, &mut s.heap).and_then(|slot| {
            let entry = s.heap.malloc_zeroed(size)?;
            Ok((slot, entry))
        });
        let (slot, entry) = match placed {
            Ok(placed) => placed,
            Err(err) => {
                Self::give_back(s, &[lid], source);
                return Err(err);
            }
        };

        self.publish(s, id, slot, entry)?;
        Ok((id, source))
    }

    /// Creates one zero-filled record per size.
    ///
    /// The blocks come from one contiguous region when possible and the ids
    /// form a consecutive run, recycled if the recycler holds one, freshly
    /// minted otherwise.
    pub fn create_multi(&self, sizes: &[u64]) -> StoreResult<Vec<ChunkId>> {
        if sizes.is_empty() {
            return Ok(Vec::new());
        }
        let mut structure = self.structure();
        let result = self.create_multi_locked(&mut structure, sizes);
        let (ids, source) = self.check_locked(&structure, result)?;
        drop(structure);

        let count = ids.len() as u64;
        self.stats.record_creates(count);
        match source {
            IdSource::Recycled => self.stats.record_recycled_ids(count),
            IdSource::Fresh => self.stats.record_fresh_ids(count),
        }
        debug!(count, first = %ids[0], "created records");
        Ok(ids)
    }

    fn create_multi_locked(
        &self,
        s: &mut Structure<A>,
        sizes: &[u64],
    ) -> StoreResult<(Vec<ChunkId>, IdSource)> {
        let n = sizes.len();
        // Only ids already in the ring count; zombies are left for `create`.
        let (lids, source) = match s.recycler.get_consecutive(n) {
            Some(lids) => (lids, IdSource::Recycled),
            None => {
                let first = self.mint(s, n as u64)?;
                ((first..first + n as u64).collect::<Vec<_>>(), IdSource::Fresh)
            }
        };
        let ids: Vec<ChunkId> = lids
            .iter()
            .map(|&lid| ChunkId::new(self.config.owner, lid))
            .collect();

        let placed = ids
            .iter()
            .map(|&id| self.table.translate_or_create(id, &mut s.heap))
            .collect::<StoreResult<Vec<_>>>()
            .and_then(|slots| Ok((slots, s.heap.multi_malloc(sizes)?)));
        let (slots, entries) = match placed {
            Ok(placed) => placed,
            Err(err) => {
                Self::give_back(s, &lids, source);
                return Err(err);
            }
        };

        for (&size, entry) in sizes.iter().zip(&entries) {
            self.arena.fill(entry.address(), size, 0)?;
        }
        for ((&id, &slot), &entry) in ids.iter().zip(&slots).zip(&entries) {
            self.publish(s, id, slot, entry)?;
        }
        Ok((ids, source))
    }

    /// Inserts a record owned by another node, e.g. one migrated here.
    ///
    /// Fails with `AlreadyExists` if `id` is live. Ids of this store's own
    /// owner are only ever minted by `create`.
    pub fn insert_migrated(&self, id: ChunkId, data: &[u8]) -> StoreResult<()> {
        if id.is_owned_by(self.config.owner) || !id.is_valid() {
            return Err(StoreError::invalid_argument(format!(
                "{id} is not a foreign record id"
            )));
        }
        let mut structure = self.structure();
        let result = self.insert_migrated_locked(&mut structure, id, data);
        self.check_locked(&structure, result)?;
        drop(structure);

        self.stats.record_creates(1);
        debug!(%id, len = data.len(), "inserted migrated record");
        Ok(())
    }

    fn insert_migrated_locked(&self, s: &mut Structure<A>, id: ChunkId, data: &[u8]) -> StoreResult<()> {
        let slot = self.table.translate_or_create(id, &mut s.heap)?;
        if self.table.entry(slot)?.is_live() {
            return Err(StoreError::AlreadyExists { id });
        }
        let entry = s.heap.malloc(data.len() as u64)?;
        self.arena.write_bytes(entry.address(), data)?;
        self.publish(s, id, slot, entry)
    }

    /// Mints `n` consecutive fresh local ids and returns the first.
    fn mint(&self, s: &mut Structure<A>, n: u64) -> StoreResult<u64> {
        let first = s.next_local_id;
        // The all-ones local id is never minted: with owner 0xFFFF it would
        // be `ChunkId::INVALID`.
        match first.checked_add(n) {
            Some(end) if end <= MAX_LOCAL_ID => {
                s.next_local_id = end;
                Ok(first)
            }
            _ => Err(StoreError::IdSpaceExhausted),
        }
    }

    /// Returns ids taken for a create that failed before publishing.
    fn give_back(s: &mut Structure<A>, lids: &[u64], source: IdSource) {
        match source {
            IdSource::Recycled => {
                for &lid in lids {
                    s.recycler.put(lid);
                }
            }
            IdSource::Fresh => s.next_local_id -= lids.len() as u64,
        }
    }

    /// Stores `entry` into the empty slot of a new record.
    fn publish(&self, s: &mut Structure<A>, id: ChunkId, slot: Address, entry: Entry) -> StoreResult<()> {
        let current = self.table.entry(slot)?;
        if current.is_live() {
            s.heap.free(entry)?;
            return Err(StoreError::AlreadyExists { id });
        }
        if let Err(actual) = self.table.compare_exchange_entry(slot, current, entry)? {
            s.heap.free(entry)?;
            return Err(StoreError::corruption(
                slot.as_u64(),
                format!("slot of new record {id} changed to {actual:?}"),
            ));
        }
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Copies the payload of `id`.
    pub fn get(&self, id: ChunkId) -> StoreResult<Bytes> {
        let data = self.with_read_lock(id, |_, entry| {
            let len = self.payload_len(entry)?;
            RecordRef::new(self.arena.as_ref(), entry.address(), len).to_bytes()
        })?;
        self.stats.record_get();
        Ok(data)
    }

    /// Copies the payload of `id` into the front of `buf` and returns its
    /// length. `buf` must be large enough for the whole payload.
    pub fn get_into(&self, id: ChunkId, buf: &mut [u8]) -> StoreResult<usize> {
        let len = self.with_read_lock(id, |_, entry| {
            let len = self.payload_len(entry)?;
            if len > buf.len() as u64 {
                return Err(StoreError::invalid_argument(format!(
                    "buffer of {} bytes cannot hold record {id} of {len} bytes",
                    buf.len()
                )));
            }
            let len = len as usize;
            self.arena.read_bytes(entry.address(), &mut buf[..len])?;
            Ok(len)
        })?;
        self.stats.record_get();
        Ok(len)
    }

    /// Runs `f` over the payload of `id` under a read lock.
    pub fn read_with<R>(
        &self,
        id: ChunkId,
        f: impl FnOnce(RecordRef<'_>) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let value = self.with_read_lock(id, |_, entry| {
            let len = self.payload_len(entry)?;
            f(RecordRef::new(self.arena.as_ref(), entry.address(), len))
        })?;
        self.stats.record_get();
        Ok(value)
    }

    /// Decodes the payload of `id` as a `T`.
    pub fn get_object<T: Decode>(&self, id: ChunkId) -> StoreResult<T> {
        self.read_with(id, |view| T::decode(&mut RecordReader::new(view)))
    }

    /// Copies the payload of `id` without taking a lock.
    ///
    /// Only available with `allow_weak_reads`. The copy may mix bytes from
    /// before and after a concurrent write; a record that moves or goes
    /// away during the read is retried, then reported as `NotFound`.
    pub fn get_weak(&self, id: ChunkId) -> StoreResult<Bytes> {
        if !self.config.allow_weak_reads {
            return Err(StoreError::not_supported(
                "weak reads are disabled (allow_weak_reads = false)",
            ));
        }
        for _ in 0..WEAK_READ_ATTEMPTS {
            let entry = self.check(self.table.lookup(id))?;
            if !entry.is_live() {
                return Err(StoreError::NotFound { id });
            }
            let Ok(len) = self.payload_len(entry) else {
                continue;
            };
            let plausible = len <= self.config.max_block_size
                && entry
                    .address()
                    .as_u64()
                    .checked_add(len)
                    .is_some_and(|end| end <= self.arena.size());
            if !plausible {
                continue;
            }
            let data = RecordRef::new(self.arena.as_ref(), entry.address(), len).to_bytes()?;
            if self.check(self.table.lookup(id))?.same_block(entry) {
                self.stats.record_get();
                return Ok(data);
            }
        }
        Err(StoreError::NotFound { id })
    }

    /// Payload length of `id`.
    pub fn size_of(&self, id: ChunkId) -> StoreResult<u64> {
        self.with_read_lock(id, |_, entry| self.payload_len(entry))
    }

    /// Returns true if `id` is a live record.
    pub fn exists(&self, id: ChunkId) -> StoreResult<bool> {
        Ok(self.check(self.table.lookup(id))?.is_live())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Replaces the payload of `id`, resizing the record when the length
    /// differs.
    pub fn put(&self, id: ChunkId, data: &[u8]) -> StoreResult<()> {
        self.with_write_lock(id, |slot, entry| {
            let entry = self.fit(id, slot, entry, data.len() as u64)?;
            self.arena.write_bytes(entry.address(), data)
        })?;
        self.stats.record_put();
        trace!(%id, len = data.len(), "put record");
        Ok(())
    }

    /// Runs `f` over the payload of `id` under the write lock.
    pub fn write_with<R>(
        &self,
        id: ChunkId,
        f: impl FnOnce(&mut RecordMut<'_>) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let value = self.with_write_lock(id, |_, entry| {
            let len = self.payload_len(entry)?;
            f(&mut RecordMut::new(self.arena.as_ref(), entry.address(), len))
        })?;
        self.stats.record_put();
        Ok(value)
    }

    /// Encodes `value` into the payload of `id`, resizing it to fit.
    pub fn put_object<T: Encode>(&self, id: ChunkId, value: &T) -> StoreResult<()> {
        let len = value.encoded_len();
        self.with_write_lock(id, |slot, entry| {
            let entry = self.fit(id, slot, entry, len)?;
            let mut writer =
                RecordWriter::new(RecordMut::new(self.arena.as_ref(), entry.address(), len));
            value.encode(&mut writer)?;
            if writer.position() != len {
                return Err(StoreError::encoding(format!(
                    "encoder wrote {} of {len} announced bytes",
                    writer.position()
                )));
            }
            Ok(())
        })?;
        self.stats.record_put();
        Ok(())
    }

    /// Creates a record holding `value`.
    pub fn create_object<T: Encode>(&self, value: &T) -> StoreResult<ChunkId> {
        let id = self.create(value.encoded_len())?;
        self.put_object(id, value)?;
        Ok(id)
    }

    /// Changes the payload size of `id`. Common bytes are kept, growth is
    /// zero-filled.
    pub fn resize(&self, id: ChunkId, size: u64) -> StoreResult<()> {
        self.with_write_lock(id, |slot, entry| self.fit(id, slot, entry, size).map(|_| ()))
    }

    /// Returns an entry whose payload is `size` bytes, moving the block if
    /// needed. The caller holds the write lock.
    fn fit(&self, id: ChunkId, slot: Address, entry: Entry, size: u64) -> StoreResult<Entry> {
        if self.payload_len(entry)? == size {
            return Ok(entry);
        }
        if entry.is_not_movable() {
            return Err(StoreError::Pinned { id });
        }

        let mut structure = self.structure();
        let result = structure.heap.resize(entry, size);
        let moved = self.check_locked(&structure, result)?;
        self.table.store_entry(slot, moved)?;
        drop(structure);

        self.stats.record_relocation();
        trace!(%id, size, from = %entry.address(), to = %moved.address(), "relocated record");
        Ok(moved)
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Removes `id`, waiting for its lock holders first.
    ///
    /// Own ids go to the recycler, or stay behind as zombies when its ring
    /// is full. Foreign ids are freed at once.
    pub fn remove(&self, id: ChunkId) -> StoreResult<()> {
        let slot = self.slot(id)?;
        self.acquire(id, slot, true, self.config.lock_timeout())?;

        let entry = self.check(self.table.entry(slot))?;
        if entry.is_not_removable() {
            self.release(id, slot, true)?;
            return Err(StoreError::NotRemovable { id });
        }

        let mut structure = self.structure();
        let result = self.remove_locked(&mut structure, id, entry);
        if let Err(err) = self.check_locked(&structure, result) {
            drop(structure);
            if self.table.entry(slot).is_ok_and(|entry| entry.is_write_locked()) {
                if let Err(release_err) = self.release(id, slot, true) {
                    warn!(%id, error = %release_err, "failed to unlock record after aborted remove");
                }
            }
            return Err(err);
        }
        drop(structure);

        self.stats.record_remove();
        trace!(%id, "removed record");
        Ok(())
    }

    /// Frees the block before touching the slot, so a heap fault leaves the
    /// record in place and still write-locked.
    fn remove_locked(&self, s: &mut Structure<A>, id: ChunkId, entry: Entry) -> StoreResult<()> {
        s.heap.free(entry.unlocked())?;
        let keep_zombie = id.is_owned_by(self.config.owner) && !s.recycler.put(id.local_id());
        self.table.delete(id, keep_zombie)?;
        Ok(())
    }

    // =========================================================================
    // Protection
    // =========================================================================

    /// Pins `id` so its block never moves and returns the payload address.
    pub fn pin(&self, id: ChunkId) -> StoreResult<Address> {
        self.with_write_lock(id, |slot, entry| {
            self.table.store_entry(slot, entry.with_not_movable(true))?;
            Ok(entry.address())
        })
    }

    /// Unpins the record whose payload starts at `address`.
    pub fn unpin(&self, address: Address) -> StoreResult<ChunkId> {
        let id = self
            .check(self.table.reverse_lookup(address))?
            .ok_or_else(|| StoreError::invalid_argument(format!("no record at {address}")))?;
        self.with_write_lock(id, |slot, entry| {
            self.table.store_entry(slot, entry.with_not_movable(false))
        })?;
        Ok(id)
    }

    /// Sets both protection flags of `id`.
    pub fn set_protection(&self, id: ChunkId, not_movable: bool, not_removable: bool) -> StoreResult<()> {
        self.with_write_lock(id, |slot, entry| {
            let protected = entry
                .with_not_movable(not_movable)
                .with_not_removable(not_removable);
            self.table.store_entry(slot, protected)
        })
    }
}
