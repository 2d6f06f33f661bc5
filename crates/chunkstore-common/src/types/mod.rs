//! Core types for ChunkStore.

mod ids;

pub use ids::{ChunkId, ChunkIdRange, NodeId};
