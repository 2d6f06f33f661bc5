//! Bounded windows over a record's payload.
//!
//! A view is handed to closures while the store holds the record's lock.
//! Offsets are relative to the payload start and checked against the
//! payload length, so a closure can never touch a neighbouring block.

use bytes::Bytes;
use chunkstore_common::error::{StoreError, StoreResult};
use chunkstore_memory::{Address, Arena};

/// Read-only window over a record payload.
#[derive(Clone, Copy)]
pub struct RecordRef<'a> {
    arena: &'a dyn Arena,
    address: Address,
    len: u64,
}

impl<'a> RecordRef<'a> {
    pub(crate) fn new(arena: &'a dyn Arena, address: Address, len: u64) -> Self {
        Self {
            arena,
            address,
            len,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true for an empty window.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Arena address of the first payload byte.
    pub fn address(&self) -> Address {
        self.address
    }

    fn check(&self, offset: u64, len: u64) -> StoreResult<Address> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(self.address.offset(offset)),
            _ => Err(StoreError::invalid_argument(format!(
                "{len} bytes at offset {offset} exceed record of {} bytes",
                self.len
            ))),
        }
    }

    /// Copies `buf.len()` bytes starting at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        let address = self.check(offset, buf.len() as u64)?;
        self.arena.read_bytes(address, buf)
    }

    /// Reads a little-endian integer of `width` bytes (1..=8) at `offset`.
    pub fn read_uint(&self, offset: u64, width: usize) -> StoreResult<u64> {
        if !(1..=8).contains(&width) {
            return Err(StoreError::invalid_argument(format!(
                "integer width {width} not in 1..=8"
            )));
        }
        let mut bytes = [0u8; 8];
        self.read_at(offset, &mut bytes[..width])?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Copies the whole payload.
    pub fn to_vec(&self) -> StoreResult<Vec<u8>> {
        let len = usize::try_from(self.len)
            .map_err(|_| StoreError::invalid_argument("record larger than address space"))?;
        let mut buf = vec![0u8; len];
        self.arena.read_bytes(self.address, &mut buf)?;
        Ok(buf)
    }

    /// Copies the whole payload into a `Bytes` buffer.
    pub fn to_bytes(&self) -> StoreResult<Bytes> {
        self.to_vec().map(Bytes::from)
    }
}

impl std::fmt::Debug for RecordRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordRef")
            .field("address", &self.address)
            .field("len", &self.len)
            .finish()
    }
}

/// Writable window over a record payload.
///
/// Only created while the store holds the record's write lock.
#[derive(Debug)]
pub struct RecordMut<'a> {
    inner: RecordRef<'a>,
}

impl<'a> RecordMut<'a> {
    pub(crate) fn new(arena: &'a dyn Arena, address: Address, len: u64) -> Self {
        Self {
            inner: RecordRef::new(arena, address, len),
        }
    }

    /// Read-only view of the same window.
    pub fn view(&self) -> RecordRef<'a> {
        self.inner
    }

    /// Payload length in bytes.
    pub fn len(&self) -> u64 {
        self.inner.len
    }

    /// Returns true for an empty window.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Copies `buf.len()` bytes starting at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        self.inner.read_at(offset, buf)
    }

    /// Overwrites bytes starting at `offset`.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
        let address = self.inner.check(offset, data.len() as u64)?;
        self.inner.arena.write_bytes(address, data)
    }

    /// Writes the low `width` bytes (1..=8) of `value` little-endian.
    pub fn write_uint(&mut self, offset: u64, width: usize, value: u64) -> StoreResult<()> {
        if !(1..=8).contains(&width) {
            return Err(StoreError::invalid_argument(format!(
                "integer width {width} not in 1..=8"
            )));
        }
        self.write_at(offset, &value.to_le_bytes()[..width])
    }

    /// Sets every payload byte to `value`.
    pub fn fill(&mut self, value: u8) -> StoreResult<()> {
        self.inner
            .arena
            .fill(self.inner.address, self.inner.len, value)
    }
}
