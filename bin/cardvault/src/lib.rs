//! Cardvault - persistent cache and bulk dataset store
//!
//! [`Vault`] wires the storage engine, bulk dataset manager, TTL cache,
//! cleanup service and usage reporter together over one shared engine and
//! one clock. It is what the application (and the `cardvault` CLI) talks
//! to; the components remain usable on their own.
//!
//! Writes issued through the vault react to quota exhaustion: the vault
//! reclaims at least the space the write needs and retries it once.

use cardvault_cache::{
    CleanupService, QuotaStatus, StorageUsageReporter, SweepReport, TtlCache,
};
use cardvault_common::{Clock, Config, Error, Namespace, Result, SystemClock};
use cardvault_dataset::{BulkDatasetManager, DatasetOptions, FramedCodec, IngestReport, RawDataset};
use cardvault_store::{EngineHandle, StorageEngine};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Housekeeping done when a session starts
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub sweep: SweepReport,
    pub quota: QuotaStatus,
}

/// Facade over every Cardvault component
pub struct Vault {
    /// Keeps a shared handle alive for as long as the vault
    handle: Option<Arc<EngineHandle>>,
    engine: Arc<dyn StorageEngine>,
    dataset: Arc<BulkDatasetManager>,
    cache: Arc<TtlCache>,
    cleanup: CleanupService,
    usage: StorageUsageReporter,
}

impl Vault {
    /// Open the persistent store described by `config`.
    ///
    /// Vaults opened on the same database path share one engine.
    pub async fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        let handle =
            EngineHandle::shared_redb(config.storage.db_path(), config.storage.quota_bytes);
        let mut vault = Self::from_handle(&handle, Arc::new(SystemClock), config).await?;
        vault.handle = Some(handle);
        Ok(vault)
    }

    /// Build a vault on the engine behind `handle`
    pub async fn from_handle(
        handle: &EngineHandle,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Result<Self> {
        Ok(Self::with_engine(handle.engine().await?, clock, config))
    }

    /// Build a vault on an already open engine
    pub fn with_engine(engine: Arc<dyn StorageEngine>, clock: Arc<dyn Clock>, config: &Config) -> Self {
        let dataset = Arc::new(BulkDatasetManager::new(
            Arc::clone(&engine),
            Arc::new(FramedCodec::new(config.dataset.compression_level)),
            Arc::clone(&clock),
            DatasetOptions::from(&config.dataset),
        ));
        let cache = Arc::new(TtlCache::new(
            Arc::clone(&engine),
            clock,
            config.cache.clone(),
        ));
        let cleanup = CleanupService::new(
            Arc::clone(&engine),
            Arc::clone(&dataset),
            Arc::clone(&cache),
            config.cleanup.clone(),
        );
        let usage = StorageUsageReporter::new(
            Arc::clone(&engine),
            config.storage.bytes_per_unit,
            config.cleanup.largest_keys,
        );
        Self {
            handle: None,
            engine,
            dataset,
            cache,
            cleanup,
            usage,
        }
    }

    /// Shared handle the vault was opened through, if any
    #[must_use]
    pub const fn handle(&self) -> Option<&Arc<EngineHandle>> {
        self.handle.as_ref()
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    #[must_use]
    pub fn dataset(&self) -> &BulkDatasetManager {
        &self.dataset
    }

    #[must_use]
    pub fn cache(&self) -> &TtlCache {
        &self.cache
    }

    #[must_use]
    pub const fn cleanup(&self) -> &CleanupService {
        &self.cleanup
    }

    #[must_use]
    pub const fn usage(&self) -> &StorageUsageReporter {
        &self.usage
    }

    /// Sweep expired cache entries and probe the quota
    pub async fn start_session(&self) -> SessionReport {
        let sweep = self.cleanup.sweep_expired().await;
        let quota = self.cleanup.quota_status().await;
        if quota != QuotaStatus::Available {
            warn!("Session started with storage quota {:?}", quota);
        }
        info!(
            "Session started ({} expired cache entries removed)",
            sweep.expired_removed
        );
        SessionReport { sweep, quota }
    }

    /// Ingest `dataset`, reclaiming the space it needs and retrying once if
    /// the quota runs out
    pub async fn ingest(&self, dataset: &RawDataset) -> Result<IngestReport> {
        match self.dataset.ingest(dataset).await {
            Err(e) if e.is_quota_exceeded() => {
                let required = self.dataset.estimate_stored_bytes(dataset)?;
                warn!(
                    "Ingest hit the storage quota, reclaiming {} bytes and retrying",
                    required
                );
                self.retry_after_reclaim(e, required).await?;
                self.dataset.ingest(dataset).await
            }
            result => result,
        }
    }

    /// Cache `value`, reclaiming the space it needs and retrying once if the
    /// quota runs out
    pub async fn cache_set<T: Serialize + ?Sized>(
        &self,
        namespace: Namespace,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        match self.cache.try_set(namespace, key, value, ttl).await {
            Err(e) if e.is_quota_exceeded() => {
                let required = e.quota_required().unwrap_or_default();
                warn!(
                    "Cache write hit the storage quota, reclaiming {} bytes and retrying",
                    required
                );
                self.retry_after_reclaim(e, required).await?;
                self.cache.try_set(namespace, key, value, ttl).await
            }
            result => result,
        }
    }

    /// Reclaim `required` bytes; hands `error` back if that is not possible
    async fn retry_after_reclaim(&self, error: Error, required: u64) -> Result<()> {
        let report = self.cleanup.reclaim_for(required).await;
        if report.recovered {
            Ok(())
        } else {
            Err(error)
        }
    }
}
