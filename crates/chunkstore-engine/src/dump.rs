//! Arena dump file format.
//!
//! A dump is a linear image of the arena plus the metadata needed to
//! reattach a heap and a translation table to it. Dumps are written on
//! request or after a fatal fault, and read back by the offline analyzer.
//!
//! ```text
//! +-------+---------+------------+-------------------+-----------+-------------+-------+
//! | magic | version | header len | header (bincode)  | image len | arena image | crc32 |
//! |  u32  |   u32   |    u32     |                   |    u64    |             |  u32  |
//! +-------+---------+------------+-------------------+-----------+-------------+-------+
//! ```
//!
//! All integers are little-endian. The CRC covers every byte before it.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use chunkstore_common::error::{StoreError, StoreResult};
use chunkstore_common::types::NodeId;
use chunkstore_index::{TableLayout, TranslationTable};
use chunkstore_memory::{Arena, Heap, HeapArena, HeapLayout, HeapStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Magic number for dump files.
const DUMP_MAGIC: u32 = 0x5044_5343; // "CSDP"

/// Version of the dump format.
const DUMP_VERSION: u32 = 1;

/// magic + version + header length
const PREAMBLE_SIZE: usize = 4 + 4 + 4;

/// image length + checksum
const TRAILER_SIZE: usize = 8 + 4;

/// Metadata stored in front of the arena image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpHeader {
    /// Heap geometry, including size classes and pointer width.
    pub heap: HeapLayout,
    /// Heap counters at dump time.
    pub status: HeapStatus,
    /// Translation table root and depth.
    pub table: TableLayout,
    /// Node that owned the store.
    pub owner: NodeId,
    /// Next local id the store would have minted.
    pub next_local_id: u64,
    /// Recycler ring capacity.
    pub recycler_capacity: usize,
    /// Ids waiting in the recycler ring, front first.
    pub recycler_ring: Vec<u64>,
    /// Recyclable ids known to the recycler, including unswept zombies.
    pub recycler_available: u64,
}

/// A decoded dump.
#[derive(Debug, Clone)]
pub struct Dump {
    header: DumpHeader,
    image: Vec<u8>,
}

impl Dump {
    /// Creates a dump from a header and an arena image.
    pub fn new(header: DumpHeader, image: Vec<u8>) -> StoreResult<Self> {
        if image.len() as u64 != header.heap.arena_size {
            return Err(StoreError::dump_corrupted(format!(
                "image of {} bytes does not match arena size {}",
                image.len(),
                header.heap.arena_size
            )));
        }
        Ok(Self { header, image })
    }

    /// The metadata header.
    pub fn header(&self) -> &DumpHeader {
        &self.header
    }

    /// The raw arena image.
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Serializes the dump into its file representation.
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        let header = bincode::serialize(&self.header)
            .map_err(|e| StoreError::encoding(format!("dump header: {e}")))?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| StoreError::encoding("dump header too large"))?;

        let mut buf =
            BytesMut::with_capacity(PREAMBLE_SIZE + header.len() + TRAILER_SIZE + self.image.len());
        buf.put_u32_le(DUMP_MAGIC);
        buf.put_u32_le(DUMP_VERSION);
        buf.put_u32_le(header_len);
        buf.put_slice(&header);
        buf.put_u64_le(self.image.len() as u64);
        buf.put_slice(&self.image);

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        Ok(buf.to_vec())
    }

    /// Parses and verifies a dump.
    pub fn decode(data: &[u8]) -> StoreResult<Self> {
        if data.len() < PREAMBLE_SIZE + TRAILER_SIZE {
            return Err(StoreError::dump_corrupted(format!(
                "file of {} bytes is too short",
                data.len()
            )));
        }

        let (body, mut trailer) = data.split_at(data.len() - 4);
        let stored_checksum = trailer.get_u32_le();
        let computed_checksum = crc32fast::hash(body);
        if stored_checksum != computed_checksum {
            return Err(StoreError::dump_corrupted(format!(
                "checksum mismatch: expected {stored_checksum:08x}, got {computed_checksum:08x}"
            )));
        }

        let mut cursor = body;
        let magic = cursor.get_u32_le();
        if magic != DUMP_MAGIC {
            return Err(StoreError::dump_corrupted(format!(
                "invalid magic: expected {DUMP_MAGIC:08x}, got {magic:08x}"
            )));
        }
        let version = cursor.get_u32_le();
        if version != DUMP_VERSION {
            return Err(StoreError::dump_corrupted(format!(
                "unsupported version: {version}"
            )));
        }

        let header_len = cursor.get_u32_le() as usize;
        if cursor.remaining() < header_len + 8 {
            return Err(StoreError::dump_corrupted("truncated header"));
        }
        let header: DumpHeader = bincode::deserialize(&cursor[..header_len])
            .map_err(|e| StoreError::dump_corrupted(format!("bad header: {e}")))?;
        cursor.advance(header_len);

        let image_len = cursor.get_u64_le();
        if cursor.remaining() as u64 != image_len {
            return Err(StoreError::dump_corrupted(format!(
                "image length {image_len} does not match the {} bytes present",
                cursor.remaining()
            )));
        }
        header.heap.validate()?;

        Self::new(header, cursor.to_vec())
    }

    /// Writes the dump to `path`.
    ///
    /// Uses atomic file replacement: write to temp file, sync, rename.
    pub fn write_to(&self, path: &Path) -> StoreResult<()> {
        let data = self.encode()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, path)?;
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        info!(path = %path.display(), bytes = data.len(), "wrote arena dump");
        Ok(())
    }

    /// Reads and verifies the dump stored at `path`.
    pub fn read_from(path: &Path) -> StoreResult<Self> {
        let data = fs::read(path)?;
        debug!(path = %path.display(), bytes = data.len(), "read arena dump");
        Self::decode(&data)
    }

    /// Loads the image into a fresh in-process arena.
    pub fn to_arena(&self) -> HeapArena {
        HeapArena::from_bytes(&self.image)
    }

    /// Reattaches a heap and a translation table to a copy of the image.
    pub fn attach(&self) -> StoreResult<(Heap, TranslationTable)> {
        let arena = Arc::new(self.to_arena());
        let heap = Heap::attach(
            Arc::clone(&arena),
            self.header.heap.clone(),
            self.header.status,
        )?;
        let table = TranslationTable::attach(arena, self.header.table, false)?;
        Ok((heap, table))
    }
}

/// Builds a dump of a live heap. The caller holds the structural lock.
pub(crate) fn capture<A: Arena>(
    heap: &Heap<A>,
    table: &TranslationTable<A>,
    header: impl FnOnce(HeapLayout, HeapStatus, TableLayout) -> DumpHeader,
) -> StoreResult<Dump> {
    let image = heap.arena().snapshot()?;
    let header = header(heap.layout().clone(), heap.status(), table.layout());
    Dump::new(header, image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Dump {
        let arena = Arc::new(HeapArena::new(1 << 20));
        let mut heap = Heap::new(Arc::clone(&arena), 4096).unwrap();
        let table = TranslationTable::create(&mut heap, 4, false).unwrap();
        heap.malloc(100).unwrap();

        capture(&heap, &table, |heap, status, table| DumpHeader {
            heap,
            status,
            table,
            owner: NodeId::new(3),
            next_local_id: 7,
            recycler_capacity: 16,
            recycler_ring: vec![1, 2],
            recycler_available: 2,
        })
        .unwrap()
    }

    #[test]
    fn test_encode_decode() {
        let dump = sample();
        let decoded = Dump::decode(&dump.encode().unwrap()).unwrap();
        assert_eq!(decoded.header(), dump.header());
        assert_eq!(decoded.image(), dump.image());
    }

    #[test]
    fn test_write_and_read_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dumps").join("arena.dump");

        let dump = sample();
        dump.write_to(&path).unwrap();
        let loaded = Dump::read_from(&path).unwrap();
        assert_eq!(loaded.header().next_local_id, 7);
        assert_eq!(loaded.header().owner, NodeId::new(3));
    }

    #[test]
    fn test_checksum_detects_flipped_byte() {
        let mut data = sample().encode().unwrap();
        let middle = data.len() / 2;
        data[middle] ^= 0x40;
        let err = Dump::decode(&data).unwrap_err();
        assert!(matches!(err, StoreError::DumpCorrupted { .. }));
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        let mut data = sample().encode().unwrap();
        data[0] = b'X';
        let len = data.len();
        let checksum = crc32fast::hash(&data[..len - 4]);
        data[len - 4..].copy_from_slice(&checksum.to_le_bytes());
        assert!(Dump::decode(&data).is_err());

        assert!(Dump::decode(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_attach_restores_heap_state() {
        let dump = sample();
        let (heap, table) = dump.attach().unwrap();
        assert_eq!(heap.status(), dump.header().status);
        assert_eq!(table.layout(), dump.header().table);
        assert_eq!(heap.status().allocated_blocks, 2);
    }
}
