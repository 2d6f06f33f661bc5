//! Record identifier types.
//!
//! A record id is a 64-bit value made of a 16-bit owner (the node that
//! created the record) and a 48-bit local id minted by that owner.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{LOCAL_ID_BITS, LOCAL_ID_MASK};

/// Node identifier - the owner of a record.
///
/// # Example
///
/// ```rust
/// use chunkstore_common::types::NodeId;
///
/// let node = NodeId::new(7);
/// assert_eq!(node.as_u16(), 7);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct NodeId(u16);

impl NodeId {
    /// Creates a new `NodeId`.
    #[inline]
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:#06x})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl From<u16> for NodeId {
    #[inline]
    fn from(id: u16) -> Self {
        Self::new(id)
    }
}

/// Record identifier: owner in the high 16 bits, local id in the low 48.
///
/// # Example
///
/// ```rust
/// use chunkstore_common::types::{ChunkId, NodeId};
///
/// let id = ChunkId::from_raw(0x0001_0000_0000_0005);
/// assert_eq!(id.owner(), NodeId::new(1));
/// assert_eq!(id.local_id(), 5);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ChunkId(u64);

impl ChunkId {
    /// Invalid record id, used as a sentinel value.
    pub const INVALID: Self = Self(u64::MAX);

    /// Creates a record id from an owner and a local id.
    ///
    /// Bits of `local_id` above the 48-bit local id range are discarded.
    #[inline]
    #[must_use]
    pub const fn new(owner: NodeId, local_id: u64) -> Self {
        Self(((owner.0 as u64) << LOCAL_ID_BITS) | (local_id & LOCAL_ID_MASK))
    }

    /// Creates a record id from its raw 64-bit representation.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the owning node.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn owner(self) -> NodeId {
        NodeId((self.0 >> LOCAL_ID_BITS) as u16)
    }

    /// Returns the 48-bit local id.
    #[inline]
    #[must_use]
    pub const fn local_id(self) -> u64 {
        self.0 & LOCAL_ID_MASK
    }

    /// Returns true if this record was created by `node`.
    #[inline]
    #[must_use]
    pub const fn is_owned_by(self, node: NodeId) -> bool {
        self.owner().0 == node.0
    }

    /// Checks if this is a valid record id.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "ChunkId(INVALID)")
        } else {
            write!(f, "ChunkId({:#018x})", self.0)
        }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<u64> for ChunkId {
    #[inline]
    fn from(raw: u64) -> Self {
        Self::from_raw(raw)
    }
}

impl From<ChunkId> for u64 {
    #[inline]
    fn from(id: ChunkId) -> Self {
        id.0
    }
}

/// An inclusive range of record ids `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkIdRange {
    /// First id of the range.
    pub start: ChunkId,
    /// Last id of the range (inclusive).
    pub end: ChunkId,
}

impl ChunkIdRange {
    /// Creates a range covering a single id.
    #[must_use]
    pub const fn single(id: ChunkId) -> Self {
        Self { start: id, end: id }
    }

    /// Number of ids in the range.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.0 - self.start.0 + 1
    }

    /// A range is never empty; provided for symmetry with `len`.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Returns true if `id` lies inside the range.
    #[must_use]
    pub const fn contains(&self, id: ChunkId) -> bool {
        id.0 >= self.start.0 && id.0 <= self.end.0
    }

    /// Extends the range by one id if `id` directly follows it.
    ///
    /// Returns false (and leaves the range untouched) otherwise.
    pub fn try_extend(&mut self, id: ChunkId) -> bool {
        if self.end.0.checked_add(1) == Some(id.0) {
            self.end = id;
            true
        } else {
            false
        }
    }
}

impl fmt::Display for ChunkIdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_parts() {
        let id = ChunkId::new(NodeId::new(0xABCD), 0x1234_5678_9ABC);
        assert_eq!(id.owner(), NodeId::new(0xABCD));
        assert_eq!(id.local_id(), 0x1234_5678_9ABC);
        assert_eq!(id.as_u64(), 0xABCD_1234_5678_9ABC);
    }

    #[test]
    fn test_local_id_is_truncated() {
        let id = ChunkId::new(NodeId::new(1), u64::MAX);
        assert_eq!(id.owner(), NodeId::new(1));
        assert_eq!(id.local_id(), LOCAL_ID_MASK);
    }

    #[test]
    fn test_ownership() {
        let id = ChunkId::from_raw(0x0002_0000_0000_0010);
        assert!(id.is_owned_by(NodeId::new(2)));
        assert!(!id.is_owned_by(NodeId::new(1)));
    }

    #[test]
    fn test_invalid() {
        assert!(!ChunkId::INVALID.is_valid());
        assert!(ChunkId::from_raw(0).is_valid());
        assert_eq!(format!("{:?}", ChunkId::INVALID), "ChunkId(INVALID)");
    }

    #[test]
    fn test_display() {
        let id = ChunkId::from_raw(0x0001_0000_0000_0005);
        assert_eq!(id.to_string(), "0x0001000000000005");
    }

    #[test]
    fn test_range_extend() {
        let mut range = ChunkIdRange::single(ChunkId::from_raw(10));
        assert!(range.try_extend(ChunkId::from_raw(11)));
        assert!(!range.try_extend(ChunkId::from_raw(13)));
        assert_eq!(range.len(), 2);
        assert!(range.contains(ChunkId::from_raw(11)));
        assert!(!range.contains(ChunkId::from_raw(12)));
    }
}
