//! Typed record encoding.
//!
//! The store never interprets payload bytes. It resolves a record to a
//! bounded `(address, length)` window and hands a cursor over that window to
//! an [`Encode`] or [`Decode`] implementation.
//!
//! Built-in implementations use little-endian integers and length-prefixed
//! (`u32`) byte strings:
//!
//! ```text
//! +--------+------------------+
//! | u32 n  | n bytes          |   String, Vec<u8>
//! +--------+------------------+
//! ```

use chunkstore_common::error::{StoreError, StoreResult};

use crate::store::{RecordMut, RecordRef};

/// Types that can be written into a record.
pub trait Encode {
    /// Exact number of bytes `encode` writes.
    fn encoded_len(&self) -> u64;

    /// Writes the value at the writer's position.
    fn encode(&self, writer: &mut RecordWriter<'_>) -> StoreResult<()>;
}

/// Types that can be read back from a record.
pub trait Decode: Sized {
    /// Reads a value at the reader's position.
    fn decode(reader: &mut RecordReader<'_>) -> StoreResult<Self>;
}

/// Sequential reader over a record window.
#[derive(Debug)]
pub struct RecordReader<'a> {
    view: RecordRef<'a>,
    position: u64,
}

impl<'a> RecordReader<'a> {
    /// Starts reading at the beginning of `view`.
    pub fn new(view: RecordRef<'a>) -> Self {
        Self { view, position: 0 }
    }

    /// Current offset into the record.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> u64 {
        self.view.len() - self.position
    }

    /// Fills `buf` and advances.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> StoreResult<()> {
        self.view.read_at(self.position, buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn read_array<const N: usize>(&mut self) -> StoreResult<[u8; N]> {
        let mut bytes = [0u8; N];
        self.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Reads a byte.
    pub fn read_u8(&mut self) -> StoreResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&mut self) -> StoreResult<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64(&mut self) -> StoreResult<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    /// Reads a little-endian `i64`.
    pub fn read_i64(&mut self) -> StoreResult<i64> {
        self.read_array().map(i64::from_le_bytes)
    }

    /// Reads a `u32` length followed by that many bytes.
    pub fn read_len_prefixed(&mut self) -> StoreResult<Vec<u8>> {
        let len = u64::from(self.read_u32()?);
        if len > self.remaining() {
            return Err(StoreError::encoding(format!(
                "length prefix {len} exceeds the {} remaining bytes",
                self.remaining()
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Sequential writer over a record window.
#[derive(Debug)]
pub struct RecordWriter<'a> {
    record: RecordMut<'a>,
    position: u64,
}

impl<'a> RecordWriter<'a> {
    /// Starts writing at the beginning of `record`.
    pub fn new(record: RecordMut<'a>) -> Self {
        Self {
            record,
            position: 0,
        }
    }

    /// Current offset into the record.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Writes `data` and advances.
    pub fn write_all(&mut self, data: &[u8]) -> StoreResult<()> {
        self.record.write_at(self.position, data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    /// Writes a byte.
    pub fn write_u8(&mut self, value: u8) -> StoreResult<()> {
        self.write_all(&[value])
    }

    /// Writes a little-endian `u32`.
    pub fn write_u32(&mut self, value: u32) -> StoreResult<()> {
        self.write_all(&value.to_le_bytes())
    }

    /// Writes a little-endian `u64`.
    pub fn write_u64(&mut self, value: u64) -> StoreResult<()> {
        self.write_all(&value.to_le_bytes())
    }

    /// Writes a little-endian `i64`.
    pub fn write_i64(&mut self, value: i64) -> StoreResult<()> {
        self.write_all(&value.to_le_bytes())
    }

    /// Writes a `u32` length followed by `data`.
    pub fn write_len_prefixed(&mut self, data: &[u8]) -> StoreResult<()> {
        let len = u32::try_from(data.len()).map_err(|_| {
            StoreError::encoding(format!("{} bytes exceed a u32 length prefix", data.len()))
        })?;
        self.write_u32(len)?;
        self.write_all(data)
    }
}

// =============================================================================
// Built-in implementations
// =============================================================================

impl Encode for u8 {
    fn encoded_len(&self) -> u64 {
        1
    }

    fn encode(&self, writer: &mut RecordWriter<'_>) -> StoreResult<()> {
        writer.write_u8(*self)
    }
}

impl Decode for u8 {
    fn decode(reader: &mut RecordReader<'_>) -> StoreResult<Self> {
        reader.read_u8()
    }
}

impl Encode for u32 {
    fn encoded_len(&self) -> u64 {
        4
    }

    fn encode(&self, writer: &mut RecordWriter<'_>) -> StoreResult<()> {
        writer.write_u32(*self)
    }
}

impl Decode for u32 {
    fn decode(reader: &mut RecordReader<'_>) -> StoreResult<Self> {
        reader.read_u32()
    }
}

impl Encode for u64 {
    fn encoded_len(&self) -> u64 {
        8
    }

    fn encode(&self, writer: &mut RecordWriter<'_>) -> StoreResult<()> {
        writer.write_u64(*self)
    }
}

impl Decode for u64 {
    fn decode(reader: &mut RecordReader<'_>) -> StoreResult<Self> {
        reader.read_u64()
    }
}

impl Encode for i64 {
    fn encoded_len(&self) -> u64 {
        8
    }

    fn encode(&self, writer: &mut RecordWriter<'_>) -> StoreResult<()> {
        writer.write_i64(*self)
    }
}

impl Decode for i64 {
    fn decode(reader: &mut RecordReader<'_>) -> StoreResult<Self> {
        reader.read_i64()
    }
}

impl Encode for Vec<u8> {
    fn encoded_len(&self) -> u64 {
        4 + self.len() as u64
    }

    fn encode(&self, writer: &mut RecordWriter<'_>) -> StoreResult<()> {
        writer.write_len_prefixed(self)
    }
}

impl Decode for Vec<u8> {
    fn decode(reader: &mut RecordReader<'_>) -> StoreResult<Self> {
        reader.read_len_prefixed()
    }
}

impl Encode for String {
    fn encoded_len(&self) -> u64 {
        4 + self.len() as u64
    }

    fn encode(&self, writer: &mut RecordWriter<'_>) -> StoreResult<()> {
        writer.write_len_prefixed(self.as_bytes())
    }
}

impl Decode for String {
    fn decode(reader: &mut RecordReader<'_>) -> StoreResult<Self> {
        String::from_utf8(reader.read_len_prefixed()?)
            .map_err(|e| StoreError::encoding(e.to_string()))
    }
}

impl<A: Encode, B: Encode> Encode for (A, B) {
    fn encoded_len(&self) -> u64 {
        self.0.encoded_len() + self.1.encoded_len()
    }

    fn encode(&self, writer: &mut RecordWriter<'_>) -> StoreResult<()> {
        self.0.encode(writer)?;
        self.1.encode(writer)
    }
}

impl<A: Decode, B: Decode> Decode for (A, B) {
    fn decode(reader: &mut RecordReader<'_>) -> StoreResult<Self> {
        let a = A::decode(reader)?;
        let b = B::decode(reader)?;
        Ok((a, b))
    }
}
