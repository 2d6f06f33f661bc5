//! Byte-addressable backing storage.
//!
//! The arena is one large pre-reserved buffer holding every record, every
//! translation table and all allocator metadata. Components never hold
//! native pointers into it; they address it with [`Address`], an offset
//! that is bounds-checked on every access.
//!
//! [`HeapArena`] stores the bytes as a slice of `AtomicU64` words. Writes of
//! fewer than eight bytes are word-level atomic read-modify-writes, so two
//! threads writing neighbouring records that share a word never tear each
//! other's bytes, and 8-byte aligned slots support compare-and-swap.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chunkstore_common::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};

/// Chunk size used by the default `fill` and `copy` implementations.
const COPY_CHUNK: usize = 4096;

/// An offset into the arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Address(u64);

impl Address {
    /// Creates an address from a raw offset.
    #[inline]
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Returns the raw offset.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the address `bytes` further into the arena.
    #[inline]
    #[must_use]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// Returns the address `bytes` before this one.
    #[inline]
    #[must_use]
    pub const fn back(self, bytes: u64) -> Self {
        Self(self.0 - bytes)
    }

    /// Rounds up to the next multiple of `align` (a power of two).
    #[inline]
    #[must_use]
    pub const fn align_up(self, align: u64) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Byte-addressable storage backing the heap.
///
/// Integer accessors use little-endian byte order and widths of 1 to 8
/// bytes. `compare_exchange` additionally requires the accessed bytes to lie
/// within one naturally aligned 8-byte word.
pub trait Arena: Send + Sync {
    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Reads an unsigned integer of `width` bytes.
    fn read(&self, address: Address, width: usize) -> StoreResult<u64>;

    /// Writes the low `width` bytes of `value`.
    fn write(&self, address: Address, width: usize, value: u64) -> StoreResult<()>;

    /// Atomically replaces `current` with `new`.
    ///
    /// Returns `Ok(Ok(current))` on success and `Ok(Err(actual))` if the
    /// stored value differed.
    fn compare_exchange(
        &self,
        address: Address,
        width: usize,
        current: u64,
        new: u64,
    ) -> StoreResult<Result<u64, u64>>;

    /// Copies bytes out of the arena.
    fn read_bytes(&self, address: Address, buf: &mut [u8]) -> StoreResult<()>;

    /// Copies bytes into the arena.
    fn write_bytes(&self, address: Address, data: &[u8]) -> StoreResult<()>;

    /// Sets `len` bytes starting at `address` to `value`.
    fn fill(&self, address: Address, len: u64, value: u8) -> StoreResult<()> {
        self.check_range(address, len)?;
        let chunk = [value; COPY_CHUNK];
        let mut done = 0u64;
        while done < len {
            let take = (len - done).min(COPY_CHUNK as u64) as usize;
            self.write_bytes(address.offset(done), &chunk[..take])?;
            done += take as u64;
        }
        Ok(())
    }

    /// Copies `len` bytes from `src` to `dst`; the ranges may overlap.
    fn copy(&self, src: Address, dst: Address, len: u64) -> StoreResult<()> {
        self.check_range(src, len)?;
        self.check_range(dst, len)?;
        let mut buf = [0u8; COPY_CHUNK];
        if dst <= src {
            let mut done = 0u64;
            while done < len {
                let take = (len - done).min(COPY_CHUNK as u64) as usize;
                self.read_bytes(src.offset(done), &mut buf[..take])?;
                self.write_bytes(dst.offset(done), &buf[..take])?;
                done += take as u64;
            }
        } else {
            let mut remaining = len;
            while remaining > 0 {
                let take = remaining.min(COPY_CHUNK as u64);
                remaining -= take;
                let take = take as usize;
                self.read_bytes(src.offset(remaining), &mut buf[..take])?;
                self.write_bytes(dst.offset(remaining), &buf[..take])?;
            }
        }
        Ok(())
    }

    /// Copies the whole arena into a vector.
    fn snapshot(&self) -> StoreResult<Vec<u8>> {
        let mut image = vec![0u8; self.size() as usize];
        self.read_bytes(Address::new(0), &mut image)?;
        Ok(image)
    }

    /// Fails with `OutOfBounds` unless `[address, address + len)` lies in
    /// the arena.
    fn check_range(&self, address: Address, len: u64) -> StoreResult<()> {
        let end = address.as_u64().checked_add(len);
        match end {
            Some(end) if end <= self.size() => Ok(()),
            _ => Err(StoreError::OutOfBounds {
                address: address.as_u64(),
                len,
                arena_size: self.size(),
            }),
        }
    }
}

/// In-process arena backed by a heap-allocated slice of atomic words.
pub struct HeapArena {
    words: Box<[AtomicU64]>,
    size: u64,
}

#[inline]
fn width_mask(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

fn check_width(width: usize) -> StoreResult<()> {
    if (1..=8).contains(&width) {
        Ok(())
    } else {
        Err(StoreError::invalid_argument(format!(
            "access width {width} not in 1..=8"
        )))
    }
}

impl HeapArena {
    /// Creates a zero-filled arena of `size` bytes.
    #[must_use]
    pub fn new(size: u64) -> Self {
        let word_count = size.div_ceil(8) as usize;
        let words: Box<[AtomicU64]> = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        Self { words, size }
    }

    /// Creates an arena holding a copy of `bytes`.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let words: Box<[AtomicU64]> = bytes
            .chunks(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word[..chunk.len()].copy_from_slice(chunk);
                AtomicU64::new(u64::from_le_bytes(word))
            })
            .collect();
        Self {
            words,
            size: bytes.len() as u64,
        }
    }

    /// Replaces the bits selected by `mask` in word `index`.
    #[inline]
    fn store_bits(&self, index: usize, mask: u64, bits: u64) {
        let word = &self.words[index];
        if mask == u64::MAX {
            word.store(bits, Ordering::Release);
        } else {
            // The closure always returns Some, so fetch_update cannot fail.
            let _ = word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                Some((old & !mask) | (bits & mask))
            });
        }
    }

    /// Applies `f(word index, byte offset, byte count, consumed)` to each
    /// word touched by `[address, address + len)`.
    fn for_each_word(&self, address: Address, len: usize, mut f: impl FnMut(usize, usize, usize, usize)) {
        let mut pos = address.as_u64();
        let mut done = 0usize;
        while done < len {
            let index = (pos / 8) as usize;
            let offset = (pos % 8) as usize;
            let take = (8 - offset).min(len - done);
            f(index, offset, take, done);
            pos += take as u64;
            done += take;
        }
    }
}

impl Arena for HeapArena {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&self, address: Address, width: usize) -> StoreResult<u64> {
        check_width(width)?;
        self.check_range(address, width as u64)?;

        let index = (address.as_u64() / 8) as usize;
        let offset = (address.as_u64() % 8) as usize;
        let shift = offset * 8;

        let mut value = self.words[index].load(Ordering::Acquire) >> shift;
        if offset + width > 8 {
            value |= self.words[index + 1].load(Ordering::Acquire) << (64 - shift);
        }
        Ok(value & width_mask(width))
    }

    fn write(&self, address: Address, width: usize, value: u64) -> StoreResult<()> {
        check_width(width)?;
        self.check_range(address, width as u64)?;

        let index = (address.as_u64() / 8) as usize;
        let offset = (address.as_u64() % 8) as usize;
        let shift = offset * 8;
        let mask = width_mask(width);
        let value = value & mask;

        self.store_bits(index, mask << shift, value << shift);
        if offset + width > 8 {
            let spill = 64 - shift;
            self.store_bits(index + 1, mask >> spill, value >> spill);
        }
        Ok(())
    }

    fn compare_exchange(
        &self,
        address: Address,
        width: usize,
        current: u64,
        new: u64,
    ) -> StoreResult<Result<u64, u64>> {
        check_width(width)?;
        self.check_range(address, width as u64)?;

        let index = (address.as_u64() / 8) as usize;
        let offset = (address.as_u64() % 8) as usize;
        if offset + width > 8 {
            return Err(StoreError::invalid_argument(format!(
                "compare_exchange of {width} bytes at {address} straddles a word"
            )));
        }

        let shift = offset * 8;
        let mask = width_mask(width);
        let current = current & mask;
        let new = new & mask;
        let word = &self.words[index];

        let mut old = word.load(Ordering::Acquire);
        loop {
            let field = (old >> shift) & mask;
            if field != current {
                return Ok(Err(field));
            }
            let replaced = (old & !(mask << shift)) | (new << shift);
            match word.compare_exchange_weak(old, replaced, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(Ok(field)),
                Err(actual) => old = actual,
            }
        }
    }

    fn read_bytes(&self, address: Address, buf: &mut [u8]) -> StoreResult<()> {
        self.check_range(address, buf.len() as u64)?;
        self.for_each_word(address, buf.len(), |index, offset, take, done| {
            let word = self.words[index].load(Ordering::Acquire).to_le_bytes();
            buf[done..done + take].copy_from_slice(&word[offset..offset + take]);
        });
        Ok(())
    }

    fn write_bytes(&self, address: Address, data: &[u8]) -> StoreResult<()> {
        self.check_range(address, data.len() as u64)?;
        self.for_each_word(address, data.len(), |index, offset, take, done| {
            let mut bits = [0u8; 8];
            let mut mask = [0u8; 8];
            bits[offset..offset + take].copy_from_slice(&data[done..done + take]);
            mask[offset..offset + take].fill(0xFF);
            self.store_bits(index, u64::from_le_bytes(mask), u64::from_le_bytes(bits));
        });
        Ok(())
    }

    fn fill(&self, address: Address, len: u64, value: u8) -> StoreResult<()> {
        self.check_range(address, len)?;
        let pattern = u64::from_le_bytes([value; 8]);
        self.for_each_word(address, len as usize, |index, offset, take, _| {
            let mut mask = [0u8; 8];
            mask[offset..offset + take].fill(0xFF);
            self.store_bits(index, u64::from_le_bytes(mask), pattern);
        });
        Ok(())
    }
}

impl fmt::Debug for HeapArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapArena").field("size", &self.size).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_address_arithmetic() {
        let addr = Address::new(13);
        assert_eq!(addr.offset(3), Address::new(16));
        assert_eq!(addr.back(5), Address::new(8));
        assert_eq!(addr.align_up(8), Address::new(16));
        assert_eq!(Address::new(16).align_up(8), Address::new(16));
    }

    #[test]
    fn test_read_write_within_word() {
        let arena = HeapArena::new(64);
        arena.write(Address::new(1), 2, 0xBEEF).unwrap();
        assert_eq!(arena.read(Address::new(1), 2).unwrap(), 0xBEEF);
        assert_eq!(arena.read(Address::new(0), 1).unwrap(), 0);
        assert_eq!(arena.read(Address::new(3), 1).unwrap(), 0);
    }

    #[test]
    fn test_read_write_across_words() {
        let arena = HeapArena::new(64);
        arena
            .write(Address::new(5), 8, 0x0102_0304_0506_0708)
            .unwrap();
        assert_eq!(arena.read(Address::new(5), 8).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(arena.read(Address::new(5), 1).unwrap(), 0x08);
        assert_eq!(arena.read(Address::new(12), 1).unwrap(), 0x01);
        assert_eq!(arena.read(Address::new(4), 1).unwrap(), 0);
        assert_eq!(arena.read(Address::new(13), 1).unwrap(), 0);
    }

    #[test]
    fn test_write_truncates_value() {
        let arena = HeapArena::new(16);
        arena.write(Address::new(0), 8, u64::MAX).unwrap();
        arena.write(Address::new(2), 1, 0x1234).unwrap();
        assert_eq!(arena.read(Address::new(2), 1).unwrap(), 0x34);
        assert_eq!(arena.read(Address::new(3), 1).unwrap(), 0xFF);
    }

    #[test]
    fn test_out_of_bounds() {
        let arena = HeapArena::new(16);
        let err = arena.read(Address::new(12), 8).unwrap_err();
        assert!(err.is_fatal());
        assert!(arena.write(Address::new(16), 1, 0).is_err());
        assert!(arena.read(Address::new(0), 9).is_err());
    }

    #[test]
    fn test_compare_exchange() {
        let arena = HeapArena::new(16);
        arena.write(Address::new(8), 8, 10).unwrap();

        assert_eq!(arena.compare_exchange(Address::new(8), 8, 10, 11).unwrap(), Ok(10));
        assert_eq!(arena.compare_exchange(Address::new(8), 8, 10, 12).unwrap(), Err(11));
        assert_eq!(arena.read(Address::new(8), 8).unwrap(), 11);

        // Narrow CAS leaves neighbouring bytes alone.
        arena.write(Address::new(0), 8, 0xAABB_CCDD).unwrap();
        assert_eq!(arena.compare_exchange(Address::new(1), 1, 0xCC, 0x11).unwrap(), Ok(0xCC));
        assert_eq!(arena.read(Address::new(0), 4).unwrap(), 0xAABB_11DD);

        assert!(arena.compare_exchange(Address::new(4), 8, 0, 1).is_err());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let arena = HeapArena::new(100);
        let data: Vec<u8> = (0..37).collect();
        arena.write_bytes(Address::new(3), &data).unwrap();

        let mut out = vec![0u8; 37];
        arena.read_bytes(Address::new(3), &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(arena.read(Address::new(2), 1).unwrap(), 0);
        assert_eq!(arena.read(Address::new(40), 1).unwrap(), 0);
    }

    #[test]
    fn test_fill_and_copy() {
        let arena = HeapArena::new(64);
        arena.fill(Address::new(1), 10, 0x5A).unwrap();
        assert_eq!(arena.read(Address::new(0), 1).unwrap(), 0);
        assert_eq!(arena.read(Address::new(10), 1).unwrap(), 0x5A);
        assert_eq!(arena.read(Address::new(11), 1).unwrap(), 0);

        arena.write_bytes(Address::new(20), b"hello world").unwrap();
        arena.copy(Address::new(20), Address::new(23), 11).unwrap();
        let mut out = [0u8; 11];
        arena.read_bytes(Address::new(23), &mut out).unwrap();
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn test_from_bytes_and_snapshot() {
        let bytes: Vec<u8> = (0..=20).collect();
        let arena = HeapArena::from_bytes(&bytes);
        assert_eq!(arena.size(), 21);
        assert_eq!(arena.snapshot().unwrap(), bytes);
    }

    #[test]
    fn test_concurrent_neighbouring_writes() {
        let arena = Arc::new(HeapArena::new(64));
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let arena = Arc::clone(&arena);
                thread::spawn(move || {
                    for round in 0..1000u64 {
                        arena.write(Address::new(i), 1, (round + i) & 0xFF).unwrap();
                    }
                    arena.write(Address::new(i), 1, i + 1).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for i in 0..8u64 {
            assert_eq!(arena.read(Address::new(i), 1).unwrap(), i + 1);
        }
    }
}
