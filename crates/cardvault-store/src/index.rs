//! Dataset index storage

use crate::engine::StorageEngine;
use crate::types::DatasetIndex;
use cardvault_common::{Area, Error, Result};
use std::sync::Arc;

/// Key of the single index record
const CURRENT: &str = "current";

/// Reads and writes the one [`DatasetIndex`] record
#[derive(Clone)]
pub struct IndexStore {
    engine: Arc<dyn StorageEngine>,
}

impl IndexStore {
    #[must_use]
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self { engine }
    }

    /// Current index, if a dataset is stored
    pub async fn get(&self) -> Result<Option<DatasetIndex>> {
        let Some(bytes) = self.engine.get(Area::DatasetIndex, CURRENT).await? else {
            return Ok(None);
        };
        bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| Error::decode(format!("dataset index: {e}")))
    }

    /// Replace the index
    pub async fn set(&self, index: &DatasetIndex) -> Result<()> {
        let bytes = bincode::serialize(index)?;
        self.engine.put(Area::DatasetIndex, CURRENT, bytes).await
    }

    /// Remove the index; returns whether one existed
    pub async fn delete(&self) -> Result<bool> {
        self.engine.delete(Area::DatasetIndex, CURRENT).await
    }

    /// Remove every entry of the index area; returns the number removed
    pub async fn clear(&self) -> Result<usize> {
        self.engine.clear_area(Area::DatasetIndex).await
    }

    /// Bytes `index` is charged against the storage budget once stored
    pub fn stored_size(index: &DatasetIndex) -> Result<u64> {
        Ok(CURRENT.len() as u64 + bincode::serialized_size(index)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::types::ChunkRef;
    use cardvault_common::Generation;
    use chrono::Utc;

    #[tokio::test]
    async fn test_index_set_get_delete() {
        let store = IndexStore::new(Arc::new(MemoryEngine::new(1 << 16)));
        assert_eq!(store.get().await.unwrap(), None);

        let index = DatasetIndex {
            version: "5.2.1".into(),
            ingest_date: "2024-05-01".into(),
            generation: Generation::new(),
            total_partitions: 1,
            total_records: 2,
            chunks: vec![ChunkRef {
                id: "x/LEA/00000".into(),
                partition_key: "LEA".into(),
                record_count: 2,
            }],
            last_updated: Utc::now(),
        };
        store.set(&index).await.unwrap();
        assert_eq!(store.get().await.unwrap(), Some(index));

        assert!(store.delete().await.unwrap());
        assert!(!store.delete().await.unwrap());
    }
}
