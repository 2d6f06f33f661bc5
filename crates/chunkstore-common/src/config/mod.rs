//! Configuration for ChunkStore.
//!
//! This module provides the configuration structure shared by all store
//! components.

mod store;

pub use store::StoreConfig;
