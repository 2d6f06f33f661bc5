//! Per-record reader/writer locks.
//!
//! Lock state lives in the record's entry, so there is no lock table and
//! nothing to clean up when a record goes away:
//!
//! - **Read**: while no writer holds the record and fewer than 127 readers
//!   do, CAS the read count up by one.
//! - **Write**: CAS the write bit on (new readers are refused from then
//!   on), then wait for in-flight readers to drain.
//! - **Unlock**: CAS the count down or the bit off.
//!
//! Every wait is a spin loop paced by a [`Backoff`] and bounded by a
//! [`LockTimeout`]. A `FREE` or `ZOMBIE` entry means the record is gone and
//! is reported as [`LockResult::NotFound`], distinct from a timeout.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chunkstore_common::error::StoreResult;
use chunkstore_common::sync::{Backoff, Deadline, LockTimeout};
use chunkstore_memory::entry::MAX_READ_COUNT;
use chunkstore_memory::{Address, Arena, Entry};
use tracing::{trace, warn};

/// Outcome of a lock operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    /// Lock acquired.
    Granted,
    /// Lock released.
    Released,
    /// The timeout elapsed before the lock could be acquired.
    Timeout,
    /// The slot holds no record.
    NotFound,
    /// Release of a lock that is not held.
    NotHeld,
}

impl LockResult {
    /// Returns true if the operation took effect.
    pub fn is_success(&self) -> bool {
        matches!(self, LockResult::Granted | LockResult::Released)
    }
}

impl fmt::Display for LockResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockResult::Granted => write!(f, "granted"),
            LockResult::Released => write!(f, "released"),
            LockResult::Timeout => write!(f, "timeout"),
            LockResult::NotFound => write!(f, "not found"),
            LockResult::NotHeld => write!(f, "not held"),
        }
    }
}

/// Statistics about record locking.
#[derive(Debug, Default)]
pub struct LockStats {
    /// Read locks granted.
    pub read_acquisitions: AtomicU64,
    /// Write locks granted.
    pub write_acquisitions: AtomicU64,
    /// Locks released.
    pub releases: AtomicU64,
    /// Backoff pauses taken while waiting.
    pub waits: AtomicU64,
    /// Acquisitions that timed out.
    pub timeouts: AtomicU64,
}

impl LockStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Total timeouts.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Total backoff pauses.
    pub fn waits(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }
}

/// The lock protocol with a fixed backoff strategy.
#[derive(Debug, Default)]
pub struct LockProtocol {
    backoff: Backoff,
    stats: LockStats,
}

impl LockProtocol {
    /// Creates a protocol that pauses with `backoff`.
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            stats: LockStats::new(),
        }
    }

    /// The backoff strategy.
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Lock statistics.
    pub fn stats(&self) -> &LockStats {
        &self.stats
    }

    fn load<A: Arena>(arena: &A, slot: Address) -> StoreResult<Entry> {
        Ok(Entry::from_raw(arena.read(slot, 8)?))
    }

    fn swap<A: Arena>(arena: &A, slot: Address, current: Entry, new: Entry) -> StoreResult<bool> {
        Ok(arena
            .compare_exchange(slot, 8, current.raw(), new.raw())?
            .is_ok())
    }

    fn pause(&self, attempt: &mut u32) {
        LockStats::record(&self.stats.waits);
        self.backoff.snooze(*attempt);
        *attempt = attempt.saturating_add(1);
    }

    fn timed_out(&self, slot: Address, deadline: &Deadline, kind: &str) -> LockResult {
        LockStats::record(&self.stats.timeouts);
        warn!(%slot, waited_ms = deadline.elapsed_ms(), kind, "record lock timed out");
        LockResult::Timeout
    }

    /// Acquires a read lock on the record in `slot`.
    pub fn acquire_read<A: Arena>(
        &self,
        arena: &A,
        slot: Address,
        timeout: LockTimeout,
    ) -> StoreResult<LockResult> {
        let deadline = timeout.start();
        let mut attempt = 0;
        loop {
            let current = Self::load(arena, slot)?;
            if !current.is_live() {
                return Ok(LockResult::NotFound);
            }
            if !current.is_write_locked() && current.read_count() < MAX_READ_COUNT {
                let next = current.with_read_count(current.read_count() + 1);
                if Self::swap(arena, slot, current, next)? {
                    LockStats::record(&self.stats.read_acquisitions);
                    trace!(%slot, readers = next.read_count(), "read lock granted");
                    return Ok(LockResult::Granted);
                }
                // Another thread changed the entry; retry without pausing.
                continue;
            }
            if deadline.expired() {
                return Ok(self.timed_out(slot, &deadline, "read"));
            }
            self.pause(&mut attempt);
        }
    }

    /// Acquires the write lock on the record in `slot`.
    ///
    /// Sets the write bit first, then waits for existing readers. If the
    /// timeout elapses while readers drain, the bit is cleared again.
    pub fn acquire_write<A: Arena>(
        &self,
        arena: &A,
        slot: Address,
        timeout: LockTimeout,
    ) -> StoreResult<LockResult> {
        let deadline = timeout.start();
        let mut attempt = 0;
        loop {
            let current = Self::load(arena, slot)?;
            if !current.is_live() {
                return Ok(LockResult::NotFound);
            }
            if !current.is_write_locked() {
                if Self::swap(arena, slot, current, current.with_write_lock(true))? {
                    break;
                }
                continue;
            }
            if deadline.expired() {
                return Ok(self.timed_out(slot, &deadline, "write"));
            }
            self.pause(&mut attempt);
        }

        loop {
            let current = Self::load(arena, slot)?;
            if !current.is_live() {
                return Ok(LockResult::NotFound);
            }
            if current.read_count() == 0 {
                LockStats::record(&self.stats.write_acquisitions);
                trace!(%slot, "write lock granted");
                return Ok(LockResult::Granted);
            }
            if deadline.expired() {
                self.clear_write_bit(arena, slot)?;
                return Ok(self.timed_out(slot, &deadline, "write drain"));
            }
            self.pause(&mut attempt);
        }
    }

    fn clear_write_bit<A: Arena>(&self, arena: &A, slot: Address) -> StoreResult<()> {
        loop {
            let current = Self::load(arena, slot)?;
            if !current.is_live() || !current.is_write_locked() {
                return Ok(());
            }
            if Self::swap(arena, slot, current, current.with_write_lock(false))? {
                return Ok(());
            }
        }
    }

    /// Releases one read lock on the record in `slot`.
    pub fn release_read<A: Arena>(&self, arena: &A, slot: Address) -> StoreResult<LockResult> {
        loop {
            let current = Self::load(arena, slot)?;
            if !current.is_live() {
                return Ok(LockResult::NotFound);
            }
            if current.read_count() == 0 {
                return Ok(LockResult::NotHeld);
            }
            let next = current.with_read_count(current.read_count() - 1);
            if Self::swap(arena, slot, current, next)? {
                LockStats::record(&self.stats.releases);
                return Ok(LockResult::Released);
            }
        }
    }

    /// Releases the write lock on the record in `slot`.
    pub fn release_write<A: Arena>(&self, arena: &A, slot: Address) -> StoreResult<LockResult> {
        loop {
            let current = Self::load(arena, slot)?;
            if !current.is_live() {
                return Ok(LockResult::NotFound);
            }
            if !current.is_write_locked() {
                return Ok(LockResult::NotHeld);
            }
            if Self::swap(arena, slot, current, current.with_write_lock(false))? {
                LockStats::record(&self.stats.releases);
                return Ok(LockResult::Released);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use chunkstore_memory::{HeapArena, LengthLayout};

    const SLOT: Address = Address::new(64);

    fn arena_with_record() -> Arc<HeapArena> {
        let arena = Arc::new(HeapArena::new(4096));
        let entry = Entry::new(Address::new(256), &LengthLayout::for_size(16).unwrap());
        arena.write(SLOT, 8, entry.raw()).unwrap();
        arena
    }

    fn entry(arena: &HeapArena) -> Entry {
        Entry::from_raw(arena.read(SLOT, 8).unwrap())
    }

    #[test]
    fn test_readers_share() {
        let arena = arena_with_record();
        let locks = LockProtocol::default();
        for _ in 0..3 {
            assert_eq!(
                locks.acquire_read(&*arena, SLOT, LockTimeout::TryOnce).unwrap(),
                LockResult::Granted
            );
        }
        assert_eq!(entry(&arena).read_count(), 3);
        for _ in 0..3 {
            assert_eq!(locks.release_read(&*arena, SLOT).unwrap(), LockResult::Released);
        }
        assert_eq!(locks.release_read(&*arena, SLOT).unwrap(), LockResult::NotHeld);
        assert!(!entry(&arena).is_locked());
    }

    #[test]
    fn test_writer_excludes_readers() {
        let arena = arena_with_record();
        let locks = LockProtocol::default();
        assert_eq!(
            locks.acquire_write(&*arena, SLOT, LockTimeout::TryOnce).unwrap(),
            LockResult::Granted
        );
        assert_eq!(
            locks.acquire_read(&*arena, SLOT, LockTimeout::TryOnce).unwrap(),
            LockResult::Timeout
        );
        assert_eq!(
            locks.acquire_write(&*arena, SLOT, LockTimeout::from_millis(5)).unwrap(),
            LockResult::Timeout
        );
        assert_eq!(locks.release_write(&*arena, SLOT).unwrap(), LockResult::Released);
        assert_eq!(locks.release_write(&*arena, SLOT).unwrap(), LockResult::NotHeld);
        assert_eq!(locks.stats().timeouts(), 2);
    }

    #[test]
    fn test_write_timeout_while_draining_clears_bit() {
        let arena = arena_with_record();
        let locks = LockProtocol::new(Backoff::Yield);
        locks.acquire_read(&*arena, SLOT, LockTimeout::TryOnce).unwrap();

        assert_eq!(
            locks.acquire_write(&*arena, SLOT, LockTimeout::from_millis(5)).unwrap(),
            LockResult::Timeout
        );
        let after = entry(&arena);
        assert!(!after.is_write_locked());
        assert_eq!(after.read_count(), 1);
    }

    #[test]
    fn test_reader_limit() {
        let arena = arena_with_record();
        let locks = LockProtocol::default();
        for _ in 0..MAX_READ_COUNT {
            assert!(locks
                .acquire_read(&*arena, SLOT, LockTimeout::TryOnce)
                .unwrap()
                .is_success());
        }
        assert_eq!(
            locks.acquire_read(&*arena, SLOT, LockTimeout::TryOnce).unwrap(),
            LockResult::Timeout
        );
    }

    #[test]
    fn test_dead_records_are_not_found() {
        let arena = arena_with_record();
        let locks = LockProtocol::default();
        for dead in [Entry::FREE, Entry::ZOMBIE] {
            arena.write(SLOT, 8, dead.raw()).unwrap();
            assert_eq!(
                locks.acquire_read(&*arena, SLOT, LockTimeout::Infinite).unwrap(),
                LockResult::NotFound
            );
            assert_eq!(
                locks.acquire_write(&*arena, SLOT, LockTimeout::Infinite).unwrap(),
                LockResult::NotFound
            );
            assert_eq!(locks.release_read(&*arena, SLOT).unwrap(), LockResult::NotFound);
            assert_eq!(locks.release_write(&*arena, SLOT).unwrap(), LockResult::NotFound);
        }
    }

    #[test]
    fn test_second_writer_waits_for_first() {
        let arena = arena_with_record();
        let locks = Arc::new(LockProtocol::new(Backoff::Yield));
        let released = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(2));

        assert_eq!(
            locks.acquire_write(&*arena, SLOT, LockTimeout::TryOnce).unwrap(),
            LockResult::Granted
        );

        let waiter = {
            let arena = Arc::clone(&arena);
            let locks = Arc::clone(&locks);
            let released = Arc::clone(&released);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let result = locks
                    .acquire_write(&*arena, SLOT, LockTimeout::Infinite)
                    .unwrap();
                assert!(released.load(Ordering::SeqCst), "acquired before release");
                assert_eq!(result, LockResult::Granted);
                locks.release_write(&*arena, SLOT).unwrap()
            })
        };

        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        released.store(true, Ordering::SeqCst);
        assert_eq!(locks.release_write(&*arena, SLOT).unwrap(), LockResult::Released);

        assert_eq!(waiter.join().unwrap(), LockResult::Released);
        assert!(!entry(&arena).is_locked());
    }

    #[test]
    fn test_writer_waits_for_reader_drain() {
        let arena = arena_with_record();
        let locks = Arc::new(LockProtocol::new(Backoff::Yield));
        locks.acquire_read(&*arena, SLOT, LockTimeout::TryOnce).unwrap();

        let writer = {
            let arena = Arc::clone(&arena);
            let locks = Arc::clone(&locks);
            thread::spawn(move || locks.acquire_write(&*arena, SLOT, LockTimeout::Infinite).unwrap())
        };

        // The pending writer blocks new readers while the old one drains.
        while !entry(&arena).is_write_locked() {
            thread::yield_now();
        }
        assert_eq!(
            locks.acquire_read(&*arena, SLOT, LockTimeout::TryOnce).unwrap(),
            LockResult::Timeout
        );

        locks.release_read(&*arena, SLOT).unwrap();
        assert_eq!(writer.join().unwrap(), LockResult::Granted);
        let held = entry(&arena);
        assert!(held.is_write_locked());
        assert_eq!(held.read_count(), 0);
    }
}
