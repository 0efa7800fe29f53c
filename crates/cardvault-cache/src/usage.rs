//! Storage usage estimates
//!
//! Figures are estimates: the serialized length of each key and value,
//! scaled by a configured bytes-per-unit factor. They do not account for
//! the backend's page and index overhead.

use cardvault_common::{Area, Result};
use cardvault_store::StorageEngine;
use serde::Serialize;
use std::sync::Arc;

/// Estimated size of one stored entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyUsage {
    pub area: Area,
    pub key: String,
    pub bytes: u64,
}

/// Estimated usage of one area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AreaUsage {
    pub area: Area,
    pub entries: usize,
    pub bytes: u64,
}

/// Estimated usage across every area
#[derive(Debug, Clone, Serialize)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub total_budget_bytes: u64,
    /// `used_bytes` as a percentage of the budget
    pub percentage: f64,
    /// Largest entries, biggest first
    pub largest_keys: Vec<KeyUsage>,
}

/// Computes [`StorageUsage`] from the engine's entries
pub struct StorageUsageReporter {
    engine: Arc<dyn StorageEngine>,
    bytes_per_unit: u64,
    largest_keys: usize,
}

impl StorageUsageReporter {
    pub fn new(engine: Arc<dyn StorageEngine>, bytes_per_unit: u64, largest_keys: usize) -> Self {
        Self {
            engine,
            bytes_per_unit: bytes_per_unit.max(1),
            largest_keys,
        }
    }

    /// Estimated usage and the largest entries
    pub async fn usage(&self) -> Result<StorageUsage> {
        let mut keys = Vec::new();
        for area in Area::ALL {
            keys.extend(
                self.engine
                    .entries(area)
                    .await?
                    .into_iter()
                    .map(|e| KeyUsage {
                        area,
                        key: e.key,
                        bytes: e.size.saturating_mul(self.bytes_per_unit),
                    }),
            );
        }

        let used_bytes = keys.iter().map(|k| k.bytes).sum();
        let total_budget_bytes = self.engine.quota().budget_bytes;
        keys.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.key.cmp(&b.key)));
        keys.truncate(self.largest_keys);

        Ok(StorageUsage {
            used_bytes,
            total_budget_bytes,
            percentage: percentage(used_bytes, total_budget_bytes),
            largest_keys: keys,
        })
    }

    /// Estimated usage per area
    pub async fn usage_by_area(&self) -> Result<Vec<AreaUsage>> {
        let mut areas = Vec::with_capacity(Area::ALL.len());
        for area in Area::ALL {
            let entries = self.engine.entries(area).await?;
            areas.push(AreaUsage {
                area,
                entries: entries.len(),
                bytes: entries
                    .iter()
                    .map(|e| e.size.saturating_mul(self.bytes_per_unit))
                    .sum(),
            });
        }
        Ok(areas)
    }
}

#[allow(clippy::cast_precision_loss)]
fn percentage(used: u64, budget: u64) -> f64 {
    if budget == 0 {
        return 0.0;
    }
    used as f64 / budget as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardvault_store::MemoryEngine;

    #[tokio::test]
    async fn test_usage_estimate() {
        let engine = Arc::new(MemoryEngine::new(1000));
        engine.put(Area::Chunks, "c1", vec![0; 98]).await.unwrap();
        engine.put(Area::Cache, "metadata/x", vec![0; 40]).await.unwrap();
        engine.put(Area::UserData, "p", vec![0; 9]).await.unwrap();

        let reporter = StorageUsageReporter::new(engine, 2, 2);
        let usage = reporter.usage().await.unwrap();
        assert_eq!(usage.used_bytes, (100 + 50 + 10) * 2);
        assert_eq!(usage.total_budget_bytes, 1000);
        assert!((usage.percentage - 32.0).abs() < f64::EPSILON);
        let largest: Vec<_> = usage.largest_keys.iter().map(|k| k.key.as_str()).collect();
        assert_eq!(largest, vec!["c1", "metadata/x"]);

        let by_area = reporter.usage_by_area().await.unwrap();
        assert_eq!(by_area.len(), 4);
        assert_eq!(by_area[0], AreaUsage { area: Area::Chunks, entries: 1, bytes: 200 });
        assert_eq!(by_area[1].entries, 0);
    }
}
