//! Cleanup and quota recovery
//!
//! [`CleanupService`] is the only component allowed to delete data it did
//! not write itself. It works exclusively on reclaimable areas; user data is
//! never touched, whatever the quota situation.
//!
//! Reclaim runs in tiers and stops as soon as a probe write succeeds and,
//! for [`CleanupService::reclaim_for`], the requested bytes are free:
//!
//! | Tier | Deletes | Loss |
//! |------|---------|------|
//! | 0 | orphan chunks, expired or undecodable cache entries | none |
//! | 1 | the bulk dataset | re-ingestable |
//! | 2 | live cache entries, oldest first, in batches | re-fetchable |
//!
//! Every failure is logged; none is returned to the caller.

use crate::ttl::TtlCache;
use cardvault_common::config::CleanupConfig;
use cardvault_common::{Area, Error, Result};
use cardvault_dataset::BulkDatasetManager;
use cardvault_store::StorageEngine;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Key of the quota probe entry; outside every cache namespace
pub const PROBE_KEY: &str = "~probe";

/// Outcome of a quota probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QuotaStatus {
    /// A probe write succeeded
    Available,
    /// The probe write was rejected for lack of space
    Exceeded,
    /// The probe failed for another reason
    Unavailable,
}

/// Result of an expired-entry sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired_removed: usize,
    pub undecodable_removed: usize,
    pub freed_bytes: u64,
}

/// Reclaim tiers, cheapest loss first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ReclaimTier {
    Lossless,
    BulkDataset,
    LiveCache,
}

/// Result of a tiered reclaim
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReclaimReport {
    /// Tiers that ran, in order
    pub tiers: Vec<ReclaimTier>,
    pub orphan_chunks_removed: usize,
    pub expired_entries_removed: usize,
    pub dataset_cleared: bool,
    pub live_entries_removed: usize,
    pub freed_bytes: u64,
    /// Free bytes the caller asked for
    pub required_bytes: u64,
    /// Whether a probe write succeeded at the end with the required bytes
    /// free
    pub recovered: bool,
}

/// Result of an emergency purge
#[derive(Debug, Clone, Default, Serialize)]
pub struct EmergencyReport {
    /// Entries removed per area
    pub removed: Vec<(Area, usize)>,
    pub freed_bytes: u64,
    pub recovered: bool,
}

/// Expiry sweeps, quota probing and tiered reclamation
pub struct CleanupService {
    engine: Arc<dyn StorageEngine>,
    dataset: Arc<BulkDatasetManager>,
    cache: Arc<TtlCache>,
    config: CleanupConfig,
}

impl CleanupService {
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        dataset: Arc<BulkDatasetManager>,
        cache: Arc<TtlCache>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            engine,
            dataset,
            cache,
            config,
        }
    }

    fn used_bytes(&self) -> u64 {
        self.engine.quota().used_bytes
    }

    /// Remove every expired or undecodable cache entry
    pub async fn sweep_expired(&self) -> SweepReport {
        let before = self.used_bytes();
        let now = self.cache.now();
        let scan = match self.cache.scan().await {
            Ok(scan) => scan,
            Err(e) => {
                error!("Cache sweep scan failed: {}", e);
                return SweepReport::default();
            }
        };

        let mut report = SweepReport {
            scanned: scan.entries.len() + scan.undecodable.len(),
            ..SweepReport::default()
        };
        for entry in scan.entries.iter().filter(|e| now >= e.expires_at) {
            if self.cache.remove_if_expired(&entry.storage_key, now).await {
                report.expired_removed += 1;
            }
        }
        for key in &scan.undecodable {
            if self.cache.remove_if_expired(key, now).await {
                report.undecodable_removed += 1;
            }
        }
        report.freed_bytes = before.saturating_sub(self.used_bytes());

        if report.expired_removed + report.undecodable_removed > 0 {
            info!(
                "Swept {} expired and {} undecodable cache entries ({} bytes)",
                report.expired_removed, report.undecodable_removed, report.freed_bytes
            );
        }
        report
    }

    /// Probe whether a small write currently fits
    pub async fn quota_status(&self) -> QuotaStatus {
        let probe = vec![0u8; self.config.probe_bytes];
        match self.engine.put(Area::Cache, PROBE_KEY, probe).await {
            Ok(()) => {
                if let Err(e) = self.engine.delete(Area::Cache, PROBE_KEY).await {
                    warn!("Failed to remove quota probe: {}", e);
                }
                QuotaStatus::Available
            }
            Err(e) if e.is_quota_exceeded() => QuotaStatus::Exceeded,
            Err(e) => {
                warn!("Quota probe failed: {}", e);
                QuotaStatus::Unavailable
            }
        }
    }

    pub async fn is_quota_exceeded(&self) -> bool {
        self.quota_status().await == QuotaStatus::Exceeded
    }

    /// Free space tier by tier until a probe write succeeds
    pub async fn reclaim(&self) -> ReclaimReport {
        self.reclaim_for(0).await
    }

    /// Free space tier by tier until a probe write succeeds and at least
    /// `required` bytes of the budget are free
    pub async fn reclaim_for(&self, required: u64) -> ReclaimReport {
        let before = self.used_bytes();
        let mut report = ReclaimReport {
            required_bytes: required,
            ..ReclaimReport::default()
        };
        info!(
            "Reclaiming storage ({} of {} bytes used, {} required)",
            before,
            self.engine.quota().budget_bytes,
            required
        );

        report.tiers.push(ReclaimTier::Lossless);
        report.orphan_chunks_removed = self.remove_orphan_chunks().await;
        report.expired_entries_removed = self.sweep_expired().await.expired_removed;
        if self.recovered(&mut report, before).await {
            return report;
        }

        report.tiers.push(ReclaimTier::BulkDataset);
        match self.dataset.clear().await {
            Ok(cleared) => {
                report.dataset_cleared = cleared.index_deleted;
                if !cleared.chunks_failed.is_empty() {
                    warn!(
                        "{} dataset chunks could not be deleted",
                        cleared.chunks_failed.len()
                    );
                }
            }
            Err(e) => error!("Failed to clear bulk dataset: {}", e),
        }
        if self.recovered(&mut report, before).await {
            return report;
        }

        report.tiers.push(ReclaimTier::LiveCache);
        match self.cache.scan().await {
            Ok(scan) => {
                let mut entries = scan.entries;
                entries.sort_by_key(|e| e.created_at);
                for batch in entries.chunks(self.config.reclaim_batch.max(1)) {
                    for entry in batch {
                        if self.cache.remove(&entry.storage_key).await {
                            report.live_entries_removed += 1;
                        }
                    }
                    if self.recovered(&mut report, before).await {
                        return report;
                    }
                }
            }
            Err(e) => error!("Cache scan for reclaim failed: {}", e),
        }

        self.recovered(&mut report, before).await;
        if !report.recovered {
            error!(
                "Reclaim exhausted every tier without recovering quota ({} bytes freed)",
                report.freed_bytes
            );
        }
        report
    }

    /// Probe, check the free bytes and record the outcome in `report`
    async fn recovered(&self, report: &mut ReclaimReport, before: u64) -> bool {
        report.freed_bytes = before.saturating_sub(self.used_bytes());
        report.recovered = self.engine.quota().available_bytes() >= report.required_bytes
            && self.quota_status().await == QuotaStatus::Available;
        if report.recovered {
            info!(
                "Quota recovered after {:?} ({} bytes freed)",
                report.tiers.last(),
                report.freed_bytes
            );
        }
        report.recovered
    }

    async fn remove_orphan_chunks(&self) -> usize {
        match self.dataset.sweep_orphans().await {
            Ok(summary) => summary.deleted,
            Err(e) => {
                error!("Orphan chunk sweep failed: {}", e);
                0
            }
        }
    }

    /// Delete every entry of a reclaimable area.
    ///
    /// The chunk and index areas are only ever purged together, through the
    /// dataset manager.
    pub async fn purge_area(&self, area: Area) -> Result<usize> {
        if !area.is_reclaimable() {
            return Err(Error::invalid_argument(format!(
                "area {area} is not reclaimable"
            )));
        }
        if matches!(area, Area::Chunks | Area::DatasetIndex) {
            let removed = self.dataset.purge().await?;
            return Ok(removed
                .into_iter()
                .find(|(purged, _)| *purged == area)
                .map_or(0, |(_, n)| n));
        }
        let removed = self.engine.clear_area(area).await?;
        warn!("Purged {} entries from {}", removed, area);
        Ok(removed)
    }

    /// Purge the bulk dataset and the whole cache at once
    pub async fn emergency_reclaim(&self) -> EmergencyReport {
        let before = self.used_bytes();
        warn!("Emergency reclaim: purging dataset and cache");

        let mut report = EmergencyReport::default();
        match self.dataset.purge().await {
            Ok(removed) => report.removed.extend(removed),
            Err(e) => error!("Failed to purge bulk dataset: {}", e),
        }
        match self.purge_area(Area::Cache).await {
            Ok(removed) => report.removed.push((Area::Cache, removed)),
            Err(e) => error!("Failed to purge {}: {}", Area::Cache, e),
        }
        report.freed_bytes = before.saturating_sub(self.used_bytes());
        report.recovered = self.quota_status().await == QuotaStatus::Available;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardvault_common::config::CacheConfig;
    use cardvault_common::{Clock, ManualClock, Namespace};
    use cardvault_dataset::{DatasetOptions, FramedCodec, RawDataset};
    use cardvault_store::MemoryEngine;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Fixture {
        engine: Arc<MemoryEngine>,
        clock: Arc<ManualClock>,
        dataset: Arc<BulkDatasetManager>,
        cache: Arc<TtlCache>,
        cleanup: CleanupService,
    }

    fn fixture(quota: u64) -> Fixture {
        let engine = Arc::new(MemoryEngine::new(quota));
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        ));
        let dyn_engine: Arc<dyn StorageEngine> = Arc::clone(&engine) as Arc<dyn StorageEngine>;
        let dyn_clock: Arc<dyn Clock> = Arc::clone(&clock) as Arc<dyn Clock>;
        let dataset = Arc::new(BulkDatasetManager::new(
            Arc::clone(&dyn_engine),
            Arc::new(FramedCodec::default()),
            Arc::clone(&dyn_clock),
            DatasetOptions {
                chunk_size: 20,
                write_pause: Duration::ZERO,
                ..DatasetOptions::default()
            },
        ));
        let cache = Arc::new(TtlCache::new(
            Arc::clone(&dyn_engine),
            dyn_clock,
            CacheConfig::default(),
        ));
        let cleanup = CleanupService::new(
            dyn_engine,
            Arc::clone(&dataset),
            Arc::clone(&cache),
            CleanupConfig {
                probe_bytes: 256,
                reclaim_batch: 2,
                largest_keys: 5,
            },
        );
        Fixture {
            engine,
            clock,
            dataset,
            cache,
            cleanup,
        }
    }

    fn dataset() -> RawDataset {
        let cards = (0..60)
            .map(|i| json!({"uuid": format!("u{i}"), "name": format!("Serra Angel {i}")}))
            .collect();
        RawDataset {
            version: "1".into(),
            date: "2024-06-01".into(),
            partitions: BTreeMap::from([("LEA".to_string(), cards)]),
        }
    }

    async fn user_data(engine: &MemoryEngine) -> Vec<(String, Vec<u8>)> {
        engine.scan(Area::UserData).await.unwrap()
    }

    /// Fill the cache until a probe no longer fits
    async fn exhaust(f: &Fixture) {
        let mut i = 0;
        while f.cleanup.quota_status().await == QuotaStatus::Available {
            f.cache
                .set(Namespace::PriceHistory, &format!("card-{i}"), &"p".repeat(64), None)
                .await;
            i += 1;
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let f = fixture(1 << 20);
        f.cache.set(Namespace::Metadata, "short", &1, None).await;
        f.cache.set(Namespace::PriceHistory, "long", &2, None).await;
        f.clock.advance(Duration::from_secs(2 * 3600));

        let report = f.cleanup.sweep_expired().await;
        assert_eq!(report.scanned, 2);
        assert_eq!(report.expired_removed, 1);
        assert!(report.freed_bytes > 0);
        assert_eq!(f.cache.get::<i32>(Namespace::PriceHistory, "long").await, Some(2));
    }

    #[tokio::test]
    async fn test_quota_probe() {
        let f = fixture(600);
        assert_eq!(f.cleanup.quota_status().await, QuotaStatus::Available);
        // The probe leaves nothing behind
        assert_eq!(f.engine.quota().used_bytes, 0);

        f.engine
            .put(Area::UserData, "portfolio", vec![1; 500])
            .await
            .unwrap();
        assert!(f.cleanup.is_quota_exceeded().await);
    }

    #[tokio::test]
    async fn test_reclaim_stops_at_lossless_tier() {
        let f = fixture(32 * 1024);
        f.dataset.ingest(&dataset()).await.unwrap();
        f.cache
            .set(Namespace::Metadata, "stale", &"m".repeat(400), None)
            .await;
        f.clock.advance(Duration::from_secs(2 * 3600));
        exhaust(&f).await;

        let report = f.cleanup.reclaim().await;
        assert!(report.recovered);
        assert_eq!(report.tiers, vec![ReclaimTier::Lossless]);
        assert_eq!(report.expired_entries_removed, 1);
        assert!(f.dataset.is_available().await.unwrap());
    }

    #[tokio::test]
    async fn test_reclaim_escalates_and_spares_user_data() {
        let f = fixture(16 * 1024);
        f.engine
            .put(Area::UserData, "portfolio", b"{\"cards\":[\"u1\"]}".to_vec())
            .await
            .unwrap();
        f.engine
            .put(Area::UserData, "watchlist", vec![9; 4000])
            .await
            .unwrap();
        let saved = user_data(&f.engine).await;

        f.dataset.ingest(&dataset()).await.unwrap();
        exhaust(&f).await;

        for _ in 0..3 {
            let report = f.cleanup.reclaim().await;
            assert!(report.recovered);
            assert_eq!(user_data(&f.engine).await, saved);
            exhaust(&f).await;
        }

        let report = f.cleanup.emergency_reclaim().await;
        assert!(report.recovered);
        assert!(report.removed.iter().all(|(area, _)| area.is_reclaimable()));
        assert_eq!(user_data(&f.engine).await, saved);
        assert!(f.engine.is_empty(Area::Chunks));
        assert!(f.engine.is_empty(Area::Cache));
        assert!(!f.dataset.is_available().await.unwrap());
    }

    #[tokio::test]
    async fn test_live_cache_evicted_oldest_first() {
        let f = fixture(8 * 1024);
        let mut i = 0;
        while f.cleanup.quota_status().await == QuotaStatus::Available {
            f.cache
                .set(Namespace::PriceHistory, &format!("card-{i:03}"), &"p".repeat(64), None)
                .await;
            f.clock.advance(Duration::from_secs(1));
            i += 1;
        }
        let newest = format!("card-{:03}", i - 1);

        let report = f.cleanup.reclaim().await;
        assert!(report.recovered);
        assert_eq!(report.tiers.last(), Some(&ReclaimTier::LiveCache));
        assert!(report.live_entries_removed >= 1);
        assert!(f.cache.get::<String>(Namespace::PriceHistory, "card-000").await.is_none());
        assert!(f.cache.get::<String>(Namespace::PriceHistory, &newest).await.is_some());
    }

    #[tokio::test]
    async fn test_reclaim_for_keeps_going_past_a_passing_probe() {
        let f = fixture(8 * 1024);
        while f.engine.quota().available_bytes() > 1024 {
            f.cache
                .set(Namespace::PriceHistory, &format!("card-{}", f.engine.len(Area::Cache)), &"p".repeat(64), None)
                .await;
            f.clock.advance(Duration::from_secs(1));
        }
        assert_eq!(f.cleanup.quota_status().await, QuotaStatus::Available);

        let report = f.cleanup.reclaim_for(4096).await;
        assert!(report.recovered);
        assert_eq!(report.required_bytes, 4096);
        assert_eq!(report.tiers.last(), Some(&ReclaimTier::LiveCache));
        assert!(f.engine.quota().available_bytes() >= 4096);
        assert!(!f.engine.is_empty(Area::Cache));
    }

    #[tokio::test]
    async fn test_purge_refuses_user_data() {
        let f = fixture(4096);
        f.engine.put(Area::UserData, "prefs", vec![1]).await.unwrap();
        assert!(f.cleanup.purge_area(Area::UserData).await.is_err());
        assert_eq!(f.engine.len(Area::UserData), 1);
    }
}
