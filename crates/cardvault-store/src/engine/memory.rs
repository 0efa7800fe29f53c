//! In-memory engine for ephemeral sessions and tests.

use super::{EntryMeta, QuotaLedger, QuotaSnapshot, StorageEngine, entry_size};
use async_trait::async_trait;
use cardvault_common::{Area, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// [`StorageEngine`] holding every area in memory, with the same quota
/// semantics as the persistent engine
pub struct MemoryEngine {
    areas: RwLock<HashMap<Area, BTreeMap<String, Vec<u8>>>>,
    ledger: QuotaLedger,
}

impl MemoryEngine {
    /// Create an empty engine with a storage budget of `quota_bytes`
    #[must_use]
    pub fn new(quota_bytes: u64) -> Self {
        Self {
            areas: RwLock::new(HashMap::new()),
            ledger: QuotaLedger::new(quota_bytes, 0),
        }
    }

    /// Number of entries in `area`
    #[must_use]
    pub fn len(&self, area: Area) -> usize {
        self.areas.read().get(&area).map_or(0, BTreeMap::len)
    }

    /// True if `area` holds no entries
    #[must_use]
    pub fn is_empty(&self, area: Area) -> bool {
        self.len(area) == 0
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, area: Area, key: &str, value: Vec<u8>) -> Result<()> {
        let mut areas = self.areas.write();
        let table = areas.entry(area).or_default();
        let old_size = table.get(key).map_or(0, |v| entry_size(key, v));
        self.ledger.try_apply(old_size, entry_size(key, &value))?;
        table.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, area: Area, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .areas
            .read()
            .get(&area)
            .and_then(|table| table.get(key).cloned()))
    }

    async fn delete(&self, area: Area, key: &str) -> Result<bool> {
        let mut areas = self.areas.write();
        let removed = areas.get_mut(&area).and_then(|table| table.remove(key));
        if let Some(value) = &removed {
            self.ledger.release(entry_size(key, value));
        }
        Ok(removed.is_some())
    }

    async fn delete_if_unchanged(&self, area: Area, key: &str, expected: &[u8]) -> Result<bool> {
        let mut areas = self.areas.write();
        let Some(table) = areas.get_mut(&area) else {
            return Ok(false);
        };
        if table.get(key).is_none_or(|v| v.as_slice() != expected) {
            return Ok(false);
        }
        table.remove(key);
        self.ledger.release(entry_size(key, expected));
        Ok(true)
    }

    async fn entries(&self, area: Area) -> Result<Vec<EntryMeta>> {
        Ok(self
            .areas
            .read()
            .get(&area)
            .map(|table| {
                table
                    .iter()
                    .map(|(k, v)| EntryMeta {
                        key: k.clone(),
                        size: entry_size(k, v),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn scan(&self, area: Area) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .areas
            .read()
            .get(&area)
            .map(|table| table.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn clear_area(&self, area: Area) -> Result<usize> {
        let mut areas = self.areas.write();
        let Some(table) = areas.remove(&area) else {
            return Ok(0);
        };
        let freed = table.iter().map(|(k, v)| entry_size(k, v)).sum();
        self.ledger.release(freed);
        Ok(table.len())
    }

    fn quota(&self) -> QuotaSnapshot {
        self.ledger.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_engine_quota() {
        let engine = MemoryEngine::new(32);
        engine.put(Area::Chunks, "a", vec![0; 20]).await.unwrap();
        assert!(
            engine
                .put(Area::Chunks, "b", vec![0; 20])
                .await
                .unwrap_err()
                .is_quota_exceeded()
        );
        assert_eq!(engine.len(Area::Chunks), 1);

        engine.delete(Area::Chunks, "a").await.unwrap();
        engine.put(Area::Chunks, "b", vec![0; 20]).await.unwrap();
        assert_eq!(engine.quota().used_bytes, 21);
    }

    #[tokio::test]
    async fn test_memory_engine_delete_if_unchanged() {
        let engine = MemoryEngine::new(1024);
        engine.put(Area::Cache, "k", b"old".to_vec()).await.unwrap();
        engine.put(Area::Cache, "k", b"new".to_vec()).await.unwrap();

        assert!(!engine.delete_if_unchanged(Area::Cache, "k", b"old").await.unwrap());
        assert_eq!(engine.get(Area::Cache, "k").await.unwrap(), Some(b"new".to_vec()));

        assert!(engine.delete_if_unchanged(Area::Cache, "k", b"new").await.unwrap());
        assert_eq!(engine.quota().used_bytes, 0);
        assert!(!engine.delete_if_unchanged(Area::Chunks, "k", b"new").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_engine_ordered_keys() {
        let engine = MemoryEngine::new(1024);
        for key in ["c", "a", "b"] {
            engine.put(Area::Cache, key, vec![1]).await.unwrap();
        }
        assert_eq!(engine.keys(Area::Cache).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(engine.clear_area(Area::Cache).await.unwrap(), 3);
        assert_eq!(engine.quota().used_bytes, 0);
    }
}
