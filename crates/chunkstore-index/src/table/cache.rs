//! Per-thread leaf table cache.
//!
//! Resolving an id walks one slot per level. Ids that share everything but
//! their lowest level live in the same leaf table, so each thread remembers
//! the last leaf tables it resolved in a small direct-mapped cache keyed by
//! `(table instance, id >> leaf bits)`.
//!
//! Leaf tables are never freed or moved once created, so a cached address
//! can never point at the wrong table. Only the slot contents change, and
//! callers always read the slot itself afterwards.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use chunkstore_common::constants::LEAF_CACHE_SLOTS;
use chunkstore_memory::Address;

static NEXT_TABLE_UID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy)]
struct CachedLeaf {
    table_uid: u64,
    prefix: u64,
    leaf: Address,
}

thread_local! {
    static LEAF_CACHE: RefCell<[Option<CachedLeaf>; LEAF_CACHE_SLOTS]> =
        const { RefCell::new([None; LEAF_CACHE_SLOTS]) };
}

/// Returns a process-unique id for a table instance.
pub(crate) fn next_table_uid() -> u64 {
    NEXT_TABLE_UID.fetch_add(1, Ordering::Relaxed)
}

#[inline]
fn slot_of(table_uid: u64, prefix: u64) -> usize {
    (prefix ^ table_uid.rotate_left(17)) as usize % LEAF_CACHE_SLOTS
}

/// Looks up the leaf table for `prefix` in the calling thread's cache.
pub(crate) fn lookup(table_uid: u64, prefix: u64) -> Option<Address> {
    LEAF_CACHE.with(|cache| {
        let cache = cache.borrow();
        match cache[slot_of(table_uid, prefix)] {
            Some(hit) if hit.table_uid == table_uid && hit.prefix == prefix => Some(hit.leaf),
            _ => None,
        }
    })
}

/// Records the leaf table for `prefix`, evicting whatever shared its slot.
pub(crate) fn remember(table_uid: u64, prefix: u64, leaf: Address) {
    LEAF_CACHE.with(|cache| {
        cache.borrow_mut()[slot_of(table_uid, prefix)] = Some(CachedLeaf {
            table_uid,
            prefix,
            leaf,
        });
    });
}
