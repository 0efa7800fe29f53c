//! Cardvault Store - persistent key/value areas under a storage quota
//!
//! This crate provides the storage engine abstraction and the two stores
//! the bulk dataset pipeline is built on:
//!
//! - [`StorageEngine`]: area-scoped put/get/delete with quota accounting,
//!   backed by redb ([`RedbEngine`]) or memory ([`MemoryEngine`])
//! - [`EngineHandle`]: memoized open shared by every consumer
//! - [`ChunkStore`]: chunk id -> encoded chunk, with windowed bulk writes
//! - [`IndexStore`]: the singleton dataset index

pub mod chunk;
pub mod engine;
pub mod handle;
pub mod index;
pub mod tables;
pub mod types;

pub use chunk::{BulkWriter, ChunkStore, DeleteSummary};
pub use engine::{EntryMeta, MemoryEngine, QuotaLedger, QuotaSnapshot, RedbEngine, StorageEngine};
pub use handle::EngineHandle;
pub use index::IndexStore;
pub use types::{Chunk, ChunkRef, DatasetIndex};
