//! Persisted records of the bulk dataset.

use cardvault_common::Generation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One compressed batch of dataset records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Storage key, unique across ingest runs
    pub id: String,
    /// Partition the records belong to
    pub partition_key: String,
    /// Version of the codec that produced `payload`
    pub codec_version: u8,
    /// Encoded record batch
    pub payload: Vec<u8>,
    /// Size of the batch before compression
    pub uncompressed_size: u64,
    /// Number of records in the batch
    pub record_count: u32,
    /// When the chunk was written
    pub updated_at: DateTime<Utc>,
}

/// Index entry pointing at one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub id: String,
    pub partition_key: String,
    pub record_count: u32,
}

/// Durable pointer structure enumerating every chunk of the current dataset.
///
/// This is the only way readers learn which chunks exist; the chunk area is
/// never enumerated to answer a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetIndex {
    /// Upstream dataset version
    pub version: String,
    /// Upstream dataset date
    pub ingest_date: String,
    /// Ingest run that wrote the chunks
    pub generation: Generation,
    /// Partitions present in the source dataset
    pub total_partitions: usize,
    /// Records stored across all chunks
    pub total_records: u64,
    /// Chunks in query order
    pub chunks: Vec<ChunkRef>,
    /// When the index was written
    pub last_updated: DateTime<Utc>,
}

impl DatasetIndex {
    /// Chunk ids in index order
    pub fn chunk_ids(&self) -> impl Iterator<Item = &str> {
        self.chunks.iter().map(|c| c.id.as_str())
    }

    /// Chunks tagged with `partition_key`, in index order
    pub fn chunks_for<'a>(&'a self, partition_key: &'a str) -> impl Iterator<Item = &'a ChunkRef> {
        self.chunks
            .iter()
            .filter(move |c| c.partition_key == partition_key)
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn contains(&self, chunk_id: &str) -> bool {
        self.chunks.iter().any(|c| c.id == chunk_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_ref(id: &str, partition: &str) -> ChunkRef {
        ChunkRef {
            id: id.into(),
            partition_key: partition.into(),
            record_count: 1,
        }
    }

    #[test]
    fn test_chunks_for_partition_keeps_order() {
        let index = DatasetIndex {
            version: "1".into(),
            ingest_date: "2024-05-01".into(),
            generation: Generation::new(),
            total_partitions: 2,
            total_records: 3,
            chunks: vec![chunk_ref("a1", "A"), chunk_ref("b1", "B"), chunk_ref("a2", "A")],
            last_updated: Utc::now(),
        };
        let ids: Vec<_> = index.chunks_for("A").map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2"]);
        assert_eq!(index.chunk_ids().collect::<Vec<_>>(), vec!["a1", "b1", "a2"]);
        assert!(index.contains("b1"));
        assert!(!index.contains("b2"));
    }
}
