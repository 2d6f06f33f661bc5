//! Store-level scenarios for the allocator, the recycler and the lock
//! protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use chunkstore_common::config::StoreConfig;
use chunkstore_common::sync::LockTimeout;
use chunkstore_common::types::{ChunkId, NodeId};
use chunkstore_engine::ChunkStore;

fn open(owner: u16) -> ChunkStore {
    let config = StoreConfig::for_testing().with_owner(NodeId::new(owner));
    ChunkStore::open(config).expect("failed to open store")
}

/// Returns the payload address of `id` without leaving it pinned.
fn address_of(store: &ChunkStore, id: ChunkId) -> u64 {
    let address = store.pin(id).expect("pin failed");
    store.unpin(address).expect("unpin failed");
    address.as_u64()
}

/// A freed block is handed out again to the next request of its size.
#[test]
fn test_freed_block_is_reused() {
    let store = open(1);
    let first = store.create(10).unwrap();
    let _second = store.create(20).unwrap();
    let freed_at = address_of(&store, first);

    store.remove(first).unwrap();
    let third = store.create(10).unwrap();
    assert_eq!(address_of(&store, third), freed_at);
}

/// Removing neighbouring records merges their blocks back completely.
#[test]
fn test_adjacent_removals_coalesce() {
    let store = open(1);
    // The first create also builds the table path for the owner.
    let _warm = store.create(8).unwrap();
    let before = store.status();

    let a = store.create(100).unwrap();
    let b = store.create(300).unwrap();
    assert_eq!(store.status().allocated_blocks, before.allocated_blocks + 2);

    store.remove(a).unwrap();
    store.remove(b).unwrap();
    assert_eq!(store.status(), before);
    assert!(store.analyze().unwrap().is_clean());
}

/// A zombie left behind by a full recycler ring becomes obtainable again.
#[test]
fn test_zombie_id_is_recycled() {
    let config = StoreConfig::for_testing()
        .with_owner(NodeId::new(1))
        .with_recycler_capacity(1);
    let store = ChunkStore::open(config).unwrap();
    let ids: Vec<_> = (0..6).map(|_| store.create(16).unwrap()).collect();
    let target = ChunkId::from_raw(0x0001_0000_0000_0005);
    assert_eq!(ids[5], target);

    store.remove(ids[0]).unwrap();
    store.remove(target).unwrap();
    assert_eq!(store.analyze().unwrap().zombies, 1);

    assert_eq!(store.create(16).unwrap(), ids[0]);
    assert_eq!(store.create(16).unwrap(), target);
    assert_eq!(store.analyze().unwrap().zombies, 0);
}

/// A second writer blocks until the first one unlocks.
#[test]
fn test_writer_blocks_until_unlock() {
    let store = Arc::new(open(1));
    let id = store.create(8).unwrap();
    let barrier = Arc::new(Barrier::new(2));
    let acquired = Arc::new(AtomicBool::new(false));

    store.lock_write(id, LockTimeout::TryOnce).unwrap();

    let waiter = {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        let acquired = Arc::clone(&acquired);
        thread::spawn(move || {
            barrier.wait();
            store.lock_write(id, LockTimeout::Infinite).unwrap();
            acquired.store(true, Ordering::SeqCst);
            store.unlock_write(id).unwrap();
        })
    };

    barrier.wait();
    thread::sleep(Duration::from_millis(50));
    assert!(!acquired.load(Ordering::SeqCst));

    store.unlock_write(id).unwrap();
    waiter.join().expect("waiter panicked");
    assert!(acquired.load(Ordering::SeqCst));
    store.put(id, b"thread A").unwrap();
    assert_eq!(&store.get(id).unwrap()[..], b"thread A");
}

/// Records created together resolve to disjoint blocks of the right size.
#[test]
fn test_create_multi_blocks_are_disjoint() {
    let store = open(1);
    let ids = store.create_multi(&[64; 8]).unwrap();
    assert_eq!(ids.len(), 8);

    let mut addresses: Vec<u64> = ids.iter().map(|&id| address_of(&store, id)).collect();
    addresses.sort_unstable();
    for pair in addresses.windows(2) {
        assert!(pair[0] + 64 <= pair[1], "blocks overlap: {pair:?}");
    }

    for (i, &id) in ids.iter().enumerate() {
        assert_eq!(store.size_of(id).unwrap(), 64);
        store.put(id, &[i as u8; 64]).unwrap();
    }
    for (i, &id) in ids.iter().enumerate() {
        assert_eq!(&store.get(id).unwrap()[..], &[i as u8; 64][..]);
    }
    assert!(store.analyze().unwrap().is_clean());
}

/// Protection flags survive a relocation of the payload.
#[test]
fn test_protection_survives_resize() {
    let store = open(1);
    let id = store.create(16).unwrap();
    store.set_protection(id, false, true).unwrap();

    store.resize(id, 4096).unwrap();
    assert!(store.remove(id).is_err());

    store.set_protection(id, false, false).unwrap();
    store.remove(id).unwrap();
}
