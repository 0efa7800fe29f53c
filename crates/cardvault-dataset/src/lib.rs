//! Cardvault Dataset - chunked storage for the bulk reference dataset
//!
//! The reference dataset is far larger than the storage budget allows in
//! raw form. It is projected down to [`CardRecord`](cardvault_common::CardRecord)s,
//! split into compressed chunks and tracked by a single dataset index:
//!
//! - [`ChunkCodec`] / [`FramedCodec`]: versioned, checksummed batch encoding
//! - [`RawDataset`]: the parsed upstream blob
//! - [`BulkDatasetManager`]: all-or-nothing ingest and index-driven queries

pub mod codec;
pub mod manager;
pub mod projection;

pub use codec::{CODEC_VERSION, ChunkCodec, EncodedChunk, FramedCodec, PayloadFormat};
pub use manager::{
    BulkDatasetManager, ClearReport, DatasetOptions, DatasetState, IngestReport, QueryOutcome,
};
pub use projection::{RawDataset, project};
