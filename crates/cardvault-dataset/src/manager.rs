//! Bulk dataset manager
//!
//! Owns the chunked copy of the reference dataset: ingestion, partition
//! reads, name search, identifier lookup and teardown.
//!
//! # Ingest protocol
//!
//! 1. Retire the previous dataset: delete the index, then its chunks.
//! 2. Project records and split each partition into batches.
//! 3. Encode and write chunks in bounded windows. Chunk ids carry the
//!    run's [`Generation`] so they never collide with another run.
//! 4. Write the index.
//!
//! The index is written last, so readers never see a half-written run. If
//! any step after retirement fails, every chunk id planned by the run and
//! any index are deleted and the dataset is left absent.
//!
//! # Reads
//!
//! Reads start from the index and fetch chunks one at a time. A chunk the
//! index names but the store no longer has does not fail the read; the
//! outcome is [`QueryOutcome::Degraded`] and names the missing ids.

use crate::codec::{ChunkCodec, FramedCodec};
use crate::projection::{RawDataset, project};
use cardvault_common::config::DatasetConfig;
use cardvault_common::{Area, CardRecord, Clock, Error, Generation, Result, SystemClock};
use cardvault_store::{
    Chunk, ChunkRef, ChunkStore, DatasetIndex, DeleteSummary, IndexStore, StorageEngine,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Ingest and query tuning
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    /// Records per chunk
    pub chunk_size: usize,
    /// Concurrent chunk writes per window
    pub write_concurrency: usize,
    /// Pause between write windows
    pub write_pause: Duration,
    /// Age after which the dataset is stale
    pub freshness_window: Duration,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self::from(&DatasetConfig::default())
    }
}

impl From<&DatasetConfig> for DatasetOptions {
    fn from(config: &DatasetConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            write_concurrency: config.write_concurrency.max(1),
            write_pause: config.write_pause(),
            freshness_window: config.freshness_window(),
        }
    }
}

/// Lifecycle state of the bulk dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DatasetState {
    /// No index stored
    Absent,
    /// An ingest run is in progress
    Ingesting,
    /// Index stored and within the freshness window
    Available,
    /// Index stored but older than the freshness window
    Stale,
}

/// Result of a read against the bulk dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome<T> {
    /// Every chunk the read needed was present
    Complete(T),
    /// Some chunks named by the index were missing; `value` covers the rest
    Degraded {
        value: T,
        missing_chunks: Vec<String>,
        total_chunks: usize,
    },
    /// No dataset is stored
    Unavailable,
}

impl<T> QueryOutcome<T> {
    fn from_parts(value: T, missing_chunks: Vec<String>, total_chunks: usize) -> Self {
        if missing_chunks.is_empty() {
            Self::Complete(value)
        } else {
            Self::Degraded {
                value,
                missing_chunks,
                total_chunks,
            }
        }
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }

    /// Value of a complete or degraded read
    pub const fn value(&self) -> Option<&T> {
        match self {
            Self::Complete(value) | Self::Degraded { value, .. } => Some(value),
            Self::Unavailable => None,
        }
    }

    /// Chunk ids a degraded read could not find
    #[must_use]
    pub fn missing_chunks(&self) -> &[String] {
        match self {
            Self::Degraded { missing_chunks, .. } => missing_chunks,
            _ => &[],
        }
    }

    /// Strict accessor: only a complete read yields a value
    pub fn into_complete(self) -> Result<T> {
        match self {
            Self::Complete(value) => Ok(value),
            Self::Degraded {
                missing_chunks,
                total_chunks,
                ..
            } => Err(Error::PartialDataset {
                missing: missing_chunks,
                total: total_chunks,
            }),
            Self::Unavailable => Err(Error::not_found("bulk dataset")),
        }
    }

    /// Apply `f` to the value, keeping the outcome kind
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> QueryOutcome<U> {
        match self {
            Self::Complete(value) => QueryOutcome::Complete(f(value)),
            Self::Degraded {
                value,
                missing_chunks,
                total_chunks,
            } => QueryOutcome::Degraded {
                value: f(value),
                missing_chunks,
                total_chunks,
            },
            Self::Unavailable => QueryOutcome::Unavailable,
        }
    }
}

/// Summary of a successful ingest
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub version: String,
    pub generation: String,
    pub partitions: usize,
    pub records: u64,
    /// Raw records dropped because they could not be projected
    pub skipped_records: usize,
    pub chunks: usize,
    pub uncompressed_bytes: u64,
    pub stored_bytes: u64,
    pub elapsed: Duration,
}

/// Summary of a dataset teardown
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClearReport {
    pub chunks_deleted: usize,
    /// Chunk ids left behind; they become orphans for cleanup
    pub chunks_failed: Vec<String>,
    pub index_deleted: bool,
}

/// A batch waiting to be encoded and written
struct PlannedChunk {
    chunk_ref: ChunkRef,
    records: Vec<CardRecord>,
}

/// Clears the ingesting flag when an ingest ends, however it ends
struct IngestFlag<'a>(&'a AtomicBool);

impl<'a> IngestFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for IngestFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Chunked store for the bulk reference dataset
pub struct BulkDatasetManager {
    chunks: ChunkStore,
    index: IndexStore,
    codec: Arc<dyn ChunkCodec>,
    clock: Arc<dyn Clock>,
    options: DatasetOptions,
    /// Serializes ingest and clear
    ingest_lock: Mutex<()>,
    ingesting: AtomicBool,
}

impl BulkDatasetManager {
    /// Create a manager with an explicit codec and clock
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        codec: Arc<dyn ChunkCodec>,
        clock: Arc<dyn Clock>,
        options: DatasetOptions,
    ) -> Self {
        Self {
            chunks: ChunkStore::new(Arc::clone(&engine)),
            index: IndexStore::new(engine),
            codec,
            clock,
            options,
            ingest_lock: Mutex::new(()),
            ingesting: AtomicBool::new(false),
        }
    }

    /// Create a manager with the default codec, wall clock and options
    pub fn with_defaults(engine: Arc<dyn StorageEngine>) -> Self {
        Self::new(
            engine,
            Arc::new(FramedCodec::default()),
            Arc::new(SystemClock),
            DatasetOptions::default(),
        )
    }

    #[must_use]
    pub const fn options(&self) -> &DatasetOptions {
        &self.options
    }

    /// Replace the stored dataset with `dataset`.
    ///
    /// On failure the dataset is absent afterwards and the returned
    /// [`Error::IngestFailed`] carries the first underlying error.
    pub async fn ingest(&self, dataset: &RawDataset) -> Result<IngestReport> {
        let _lock = self.ingest_lock.lock().await;
        let _flag = IngestFlag::raise(&self.ingesting);
        let started = Instant::now();
        let generation = Generation::new();
        let version = dataset.version.clone();

        info!(
            "Ingesting dataset {} ({} partitions, {} records, generation {})",
            version,
            dataset.partitions.len(),
            dataset.record_count(),
            generation.short()
        );

        if let Err(e) = self.retire().await {
            error!("Failed to retire previous dataset: {}", e);
            return Err(Error::IngestFailed {
                version,
                written: 0,
                planned: 0,
                source: Box::new(e),
            });
        }

        let (planned, skipped) = self.plan(dataset, generation);
        let planned_ids: Vec<String> = planned.iter().map(|p| p.chunk_ref.id.clone()).collect();
        let total_records: u64 = planned
            .iter()
            .map(|p| u64::from(p.chunk_ref.record_count))
            .sum();
        if skipped > 0 {
            warn!("Skipped {} records that could not be projected", skipped);
        }

        let mut writer = self
            .chunks
            .writer(self.options.write_concurrency, self.options.write_pause);
        let mut refs = Vec::with_capacity(planned.len());
        let mut uncompressed_bytes = 0u64;
        let mut stored_bytes = 0u64;

        let written = async {
            for PlannedChunk { chunk_ref, records } in planned {
                let encoded = self.codec.encode(&records)?;
                uncompressed_bytes += encoded.uncompressed_size;
                stored_bytes += encoded.payload.len() as u64;
                writer
                    .push(Chunk {
                        id: chunk_ref.id.clone(),
                        partition_key: chunk_ref.partition_key.clone(),
                        codec_version: self.codec.version(),
                        payload: encoded.payload,
                        uncompressed_size: encoded.uncompressed_size,
                        record_count: chunk_ref.record_count,
                        updated_at: self.clock.now(),
                    })
                    .await?;
                refs.push(chunk_ref);
            }
            writer.flush().await?;

            self.index
                .set(&DatasetIndex {
                    version: version.clone(),
                    ingest_date: dataset.date.clone(),
                    generation,
                    total_partitions: dataset.partitions.len(),
                    total_records,
                    chunks: refs,
                    last_updated: self.clock.now(),
                })
                .await
        }
        .await;

        if let Err(source) = written {
            let written = writer.written();
            error!(
                "Ingest of dataset {} failed after {}/{} chunks: {}",
                version,
                written,
                planned_ids.len(),
                source
            );
            self.rollback(&planned_ids).await;
            return Err(Error::IngestFailed {
                version,
                written,
                planned: planned_ids.len(),
                source: Box::new(source),
            });
        }

        let report = IngestReport {
            version,
            generation: generation.short(),
            partitions: dataset.partitions.len(),
            records: total_records,
            skipped_records: skipped,
            chunks: planned_ids.len(),
            uncompressed_bytes,
            stored_bytes,
            elapsed: started.elapsed(),
        };
        info!(
            "Ingested dataset {}: {} records in {} chunks ({} bytes stored, {} uncompressed) in {:?}",
            report.version,
            report.records,
            report.chunks,
            report.stored_bytes,
            report.uncompressed_bytes,
            report.elapsed
        );
        Ok(report)
    }

    /// Split every partition into batches of at most `chunk_size` records
    fn plan(&self, dataset: &RawDataset, generation: Generation) -> (Vec<PlannedChunk>, usize) {
        let prefix = generation.short();
        let mut planned = Vec::new();
        let mut skipped = 0;

        for (key, raws) in &dataset.partitions {
            let records: Vec<CardRecord> = raws
                .iter()
                .filter_map(|raw| match project(key, raw) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        debug!("Skipping record in {}: {}", key, e);
                        skipped += 1;
                        None
                    }
                })
                .collect();

            for (seq, batch) in records.chunks(self.options.chunk_size).enumerate() {
                planned.push(PlannedChunk {
                    chunk_ref: ChunkRef {
                        id: format!("{prefix}/{key}/{seq:05}"),
                        partition_key: key.clone(),
                        record_count: u32::try_from(batch.len()).unwrap_or(u32::MAX),
                    },
                    records: batch.to_vec(),
                });
            }
        }
        (planned, skipped)
    }

    /// Delete the current index, then the chunks it named
    async fn retire(&self) -> Result<()> {
        let Some(previous) = self.index.get().await? else {
            return Ok(());
        };
        self.index.delete().await?;
        let summary = self.chunks.delete_many(previous.chunk_ids()).await;
        info!(
            "Retired dataset {} ({} chunks deleted, {} left as orphans)",
            previous.version,
            summary.deleted,
            summary.failed.len()
        );
        Ok(())
    }

    /// Remove everything a failed run may have written
    async fn rollback(&self, planned_ids: &[String]) {
        if let Err(e) = self.index.delete().await {
            warn!("Rollback could not delete dataset index: {}", e);
        }
        let summary = self.chunks.delete_many(planned_ids).await;
        if summary.is_clean() {
            info!("Rolled back {} chunks", summary.deleted);
        } else {
            warn!(
                "Rollback left {} chunks behind; cleanup will reclaim them",
                summary.failed.len()
            );
        }
    }

    /// Fetch and decode one chunk; `None` if the store lacks it
    async fn load(&self, chunk_ref: &ChunkRef) -> Result<Option<Vec<CardRecord>>> {
        let Some(chunk) = self.chunks.get(&chunk_ref.id).await? else {
            warn!("Chunk {} named by the index is missing", chunk_ref.id);
            return Ok(None);
        };
        if chunk.codec_version != self.codec.version() {
            return Err(Error::decode(format!(
                "chunk {} has codec version {}, expected {}",
                chunk.id,
                chunk.codec_version,
                self.codec.version()
            )));
        }
        self.codec.decode(&chunk.payload).map(Some)
    }

    /// Every record of partition `key`, in index order
    pub async fn get_partition(&self, key: &str) -> Result<QueryOutcome<Vec<CardRecord>>> {
        let Some(index) = self.index.get().await? else {
            return Ok(QueryOutcome::Unavailable);
        };

        let refs: Vec<&ChunkRef> = index.chunks_for(key).collect();
        let mut records = Vec::new();
        let mut missing = Vec::new();
        for chunk_ref in &refs {
            match self.load(chunk_ref).await? {
                Some(batch) => records.extend(batch),
                None => missing.push(chunk_ref.id.clone()),
            }
        }
        Ok(QueryOutcome::from_parts(records, missing, refs.len()))
    }

    /// Records whose name contains `term` (case-insensitive), in index
    /// order, stopping once `max_results` are found
    pub async fn search(
        &self,
        term: &str,
        max_results: usize,
    ) -> Result<QueryOutcome<Vec<CardRecord>>> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            return Err(Error::invalid_argument("search term is empty"));
        }
        let Some(index) = self.index.get().await? else {
            return Ok(QueryOutcome::Unavailable);
        };
        if max_results == 0 {
            return Ok(QueryOutcome::Complete(Vec::new()));
        }

        let mut matches = Vec::new();
        let mut missing = Vec::new();
        let mut scanned = 0;
        for chunk_ref in &index.chunks {
            scanned += 1;
            let Some(batch) = self.load(chunk_ref).await? else {
                missing.push(chunk_ref.id.clone());
                continue;
            };
            for record in batch {
                if record.name_contains(&needle) {
                    matches.push(record);
                    if matches.len() >= max_results {
                        break;
                    }
                }
            }
            if matches.len() >= max_results {
                break;
            }
        }
        debug!(
            "Search '{}' scanned {}/{} chunks, {} matches",
            term,
            scanned,
            index.chunk_count(),
            matches.len()
        );
        Ok(QueryOutcome::from_parts(matches, missing, scanned))
    }

    /// First record whose uuid or any external id equals `id`
    pub async fn find_by_external_id(&self, id: &str) -> Result<QueryOutcome<Option<CardRecord>>> {
        if id.is_empty() {
            return Err(Error::invalid_argument("identifier is empty"));
        }
        let Some(index) = self.index.get().await? else {
            return Ok(QueryOutcome::Unavailable);
        };

        let mut missing = Vec::new();
        let mut scanned = 0;
        for chunk_ref in &index.chunks {
            scanned += 1;
            let Some(batch) = self.load(chunk_ref).await? else {
                missing.push(chunk_ref.id.clone());
                continue;
            };
            if let Some(record) = batch.into_iter().find(|r| r.matches_external_id(id)) {
                return Ok(QueryOutcome::from_parts(Some(record), missing, scanned));
            }
        }
        Ok(QueryOutcome::from_parts(None, missing, scanned))
    }

    /// Current index, if a dataset is stored
    pub async fn index(&self) -> Result<Option<DatasetIndex>> {
        self.index.get().await
    }

    /// True if a dataset is stored
    pub async fn is_available(&self) -> Result<bool> {
        Ok(self.index.get().await?.is_some())
    }

    /// True if a dataset is stored and younger than the freshness window
    pub async fn is_fresh(&self) -> Result<bool> {
        Ok(self
            .index
            .get()
            .await?
            .is_some_and(|index| self.within_window(&index)))
    }

    fn within_window(&self, index: &DatasetIndex) -> bool {
        let age = self.clock.now() - index.last_updated;
        age.to_std().map_or(true, |age| age < self.options.freshness_window)
    }

    /// True while an ingest run holds the dataset
    #[must_use]
    pub fn is_ingesting(&self) -> bool {
        self.ingesting.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> Result<DatasetState> {
        if self.is_ingesting() {
            return Ok(DatasetState::Ingesting);
        }
        Ok(match self.index.get().await? {
            None => DatasetState::Absent,
            Some(index) if self.within_window(&index) => DatasetState::Available,
            Some(_) => DatasetState::Stale,
        })
    }

    /// Delete every indexed chunk, then the index
    pub async fn clear(&self) -> Result<ClearReport> {
        let _lock = self.ingest_lock.lock().await;
        let Some(index) = self.index.get().await? else {
            return Ok(ClearReport::default());
        };
        let DeleteSummary { deleted, failed } = self.chunks.delete_many(index.chunk_ids()).await;
        let index_deleted = self.index.delete().await?;
        info!(
            "Cleared dataset {} ({} chunks deleted, {} failed)",
            index.version,
            deleted,
            failed.len()
        );
        Ok(ClearReport {
            chunks_deleted: deleted,
            chunks_failed: failed,
            index_deleted,
        })
    }

    /// Stored chunks the current index does not name.
    ///
    /// Empty while an ingest is running, since that run's chunks are not
    /// indexed yet. The answer can be outdated by the time it returns; use
    /// [`sweep_orphans`](Self::sweep_orphans) to delete them.
    pub async fn orphan_chunk_ids(&self) -> Result<Vec<String>> {
        if self.is_ingesting() {
            return Ok(Vec::new());
        }
        self.unindexed_chunk_ids().await
    }

    async fn unindexed_chunk_ids(&self) -> Result<Vec<String>> {
        let indexed: HashSet<String> = self
            .index
            .get()
            .await?
            .map(|index| index.chunks.into_iter().map(|c| c.id).collect())
            .unwrap_or_default();
        Ok(self
            .chunks
            .ids()
            .await?
            .into_iter()
            .filter(|id| !indexed.contains(id))
            .collect())
    }

    /// Delete stored chunks the current index does not name.
    ///
    /// Holds the ingest lock from the scan through the last delete. Skipped
    /// while an ingest is running.
    pub async fn sweep_orphans(&self) -> Result<DeleteSummary> {
        let Ok(_lock) = self.ingest_lock.try_lock() else {
            debug!("Ingest in progress, skipping orphan sweep");
            return Ok(DeleteSummary::default());
        };
        let orphans = self.unindexed_chunk_ids().await?;
        if orphans.is_empty() {
            return Ok(DeleteSummary::default());
        }
        let summary = self.chunks.delete_many(&orphans).await;
        info!(
            "Removed {} orphan chunks ({} failed)",
            summary.deleted,
            summary.failed.len()
        );
        Ok(summary)
    }

    /// Remove the index and every stored chunk, indexed or not.
    ///
    /// Waits for a running ingest and holds the ingest lock throughout.
    /// Returns the entries removed per area.
    pub async fn purge(&self) -> Result<Vec<(Area, usize)>> {
        let _lock = self.ingest_lock.lock().await;
        let index = self.index.clear().await?;
        let chunks = self.chunks.clear().await?;
        warn!("Purged dataset storage ({} chunks, {} index entries)", chunks, index);
        Ok(vec![(Area::DatasetIndex, index), (Area::Chunks, chunks)])
    }

    /// Bytes an ingest of `dataset` would store, chunks and index together.
    ///
    /// Encodes one batch at a time without writing anything. Timestamps
    /// vary slightly in encoded length, so each chunk carries some slack.
    pub fn estimate_stored_bytes(&self, dataset: &RawDataset) -> Result<u64> {
        const SLACK_PER_CHUNK: u64 = 16;

        let generation = Generation::new();
        let (planned, _) = self.plan(dataset, generation);
        let now = self.clock.now();
        let mut total = 0u64;
        let mut refs = Vec::with_capacity(planned.len());
        for PlannedChunk { chunk_ref, records } in planned {
            let encoded = self.codec.encode(&records)?;
            total += ChunkStore::stored_size(&Chunk {
                id: chunk_ref.id.clone(),
                partition_key: chunk_ref.partition_key.clone(),
                codec_version: self.codec.version(),
                payload: encoded.payload,
                uncompressed_size: encoded.uncompressed_size,
                record_count: chunk_ref.record_count,
                updated_at: now,
            })? + SLACK_PER_CHUNK;
            refs.push(chunk_ref);
        }
        total += IndexStore::stored_size(&DatasetIndex {
            version: dataset.version.clone(),
            ingest_date: dataset.date.clone(),
            generation,
            total_partitions: dataset.partitions.len(),
            total_records: refs.iter().map(|r| u64::from(r.record_count)).sum(),
            chunks: refs,
            last_updated: now,
        })? + SLACK_PER_CHUNK;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cardvault_common::ManualClock;
    use cardvault_store::{EntryMeta, MemoryEngine, QuotaSnapshot};
    use chrono::{TimeZone, Utc};
    use serde_json::{Value, json};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Delegating engine that fails chunk writes after a set number, counts
    /// chunk reads and can hold the first chunk listing until released
    struct TestEngine {
        inner: MemoryEngine,
        fail_chunk_puts_after: Option<usize>,
        chunk_puts: AtomicUsize,
        chunk_gets: AtomicUsize,
        listing_gate: Option<ListingGate>,
    }

    struct ListingGate {
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl TestEngine {
        fn new() -> Self {
            Self {
                inner: MemoryEngine::new(64 << 20),
                fail_chunk_puts_after: None,
                chunk_puts: AtomicUsize::new(0),
                chunk_gets: AtomicUsize::new(0),
                listing_gate: None,
            }
        }

        fn gated() -> Self {
            Self {
                listing_gate: Some(ListingGate {
                    armed: AtomicBool::new(true),
                    entered: Notify::new(),
                    release: Notify::new(),
                }),
                ..Self::new()
            }
        }

        fn gate(&self) -> &ListingGate {
            self.listing_gate.as_ref().unwrap()
        }

        fn failing_after(n: usize) -> Self {
            Self {
                fail_chunk_puts_after: Some(n),
                ..Self::new()
            }
        }

        fn chunk_gets(&self) -> usize {
            self.chunk_gets.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StorageEngine for TestEngine {
        fn name(&self) -> &str {
            "test"
        }

        async fn put(&self, area: Area, key: &str, value: Vec<u8>) -> Result<()> {
            if area == Area::Chunks {
                let n = self.chunk_puts.fetch_add(1, Ordering::SeqCst);
                if self.fail_chunk_puts_after.is_some_and(|limit| n >= limit) {
                    return Err(Error::storage("injected write failure"));
                }
            }
            self.inner.put(area, key, value).await
        }

        async fn get(&self, area: Area, key: &str) -> Result<Option<Vec<u8>>> {
            if area == Area::Chunks {
                self.chunk_gets.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.get(area, key).await
        }

        async fn delete(&self, area: Area, key: &str) -> Result<bool> {
            self.inner.delete(area, key).await
        }

        async fn delete_if_unchanged(&self, area: Area, key: &str, expected: &[u8]) -> Result<bool> {
            self.inner.delete_if_unchanged(area, key, expected).await
        }

        async fn entries(&self, area: Area) -> Result<Vec<EntryMeta>> {
            if let Some(gate) = &self.listing_gate {
                if area == Area::Chunks && gate.armed.swap(false, Ordering::SeqCst) {
                    gate.entered.notify_one();
                    gate.release.notified().await;
                }
            }
            self.inner.entries(area).await
        }

        async fn scan(&self, area: Area) -> Result<Vec<(String, Vec<u8>)>> {
            self.inner.scan(area).await
        }

        async fn clear_area(&self, area: Area) -> Result<usize> {
            self.inner.clear_area(area).await
        }

        fn quota(&self) -> QuotaSnapshot {
            self.inner.quota()
        }
    }

    fn options(chunk_size: usize) -> DatasetOptions {
        DatasetOptions {
            chunk_size,
            write_concurrency: 10,
            write_pause: Duration::ZERO,
            freshness_window: Duration::from_secs(7 * 24 * 3600),
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        ))
    }

    fn manager(engine: Arc<TestEngine>, clock: Arc<ManualClock>, chunk_size: usize) -> BulkDatasetManager {
        BulkDatasetManager::new(
            engine,
            Arc::new(FramedCodec::default()),
            clock,
            options(chunk_size),
        )
    }

    fn raw_records(set: &str, n: usize) -> Vec<Value> {
        (0..n)
            .map(|i| {
                json!({
                    "uuid": format!("{set}-{i}"),
                    "name": format!("{set} Card {i}"),
                    "number": i.to_string(),
                    "identifiers": {"scryfallId": format!("sf-{set}-{i}")}
                })
            })
            .collect()
    }

    /// Partitions A, B and C with 120, 30 and 5 records
    fn dataset(version: &str) -> RawDataset {
        RawDataset {
            version: version.to_string(),
            date: "2024-05-01".to_string(),
            partitions: BTreeMap::from([
                ("A".to_string(), raw_records("A", 120)),
                ("B".to_string(), raw_records("B", 30)),
                ("C".to_string(), raw_records("C", 5)),
            ]),
        }
    }

    #[tokio::test]
    async fn test_ingest_splits_partitions_into_chunks() {
        let engine = Arc::new(TestEngine::new());
        let mgr = manager(Arc::clone(&engine), clock(), 50);

        let report = mgr.ingest(&dataset("1")).await.unwrap();
        assert_eq!(report.chunks, 5);
        assert_eq!(report.records, 155);
        assert_eq!(report.partitions, 3);

        let index = mgr.index().await.unwrap().unwrap();
        let counts: Vec<u32> = index.chunks.iter().map(|c| c.record_count).collect();
        assert_eq!(counts, vec![50, 50, 20, 30, 5]);
        assert_eq!(index.total_records, 155);
        assert_eq!(mgr.state().await.unwrap(), DatasetState::Available);

        let a = mgr.get_partition("A").await.unwrap().into_complete().unwrap();
        assert_eq!(a.len(), 120);
        assert_eq!(a[0].uuid, "A-0");
        assert_eq!(a[119].uuid, "A-119");
        let c = mgr.get_partition("C").await.unwrap();
        assert_eq!(c.value().unwrap().len(), 5);
        assert!(mgr.get_partition("Z").await.unwrap().value().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_ingest_leaves_nothing_behind() {
        let engine = Arc::new(TestEngine::failing_after(3));
        let mgr = manager(Arc::clone(&engine), clock(), 50);

        let err = mgr.ingest(&dataset("1")).await.unwrap_err();
        match err {
            Error::IngestFailed {
                written, planned, ..
            } => {
                assert_eq!(written, 3);
                assert_eq!(planned, 5);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(!mgr.is_available().await.unwrap());
        assert_eq!(mgr.state().await.unwrap(), DatasetState::Absent);
        assert!(engine.inner.is_empty(Area::Chunks));
        assert!(engine.inner.is_empty(Area::DatasetIndex));
        assert!(mgr.get_partition("A").await.unwrap().is_unavailable());
    }

    #[tokio::test]
    async fn test_reingest_replaces_dataset() {
        let engine = Arc::new(TestEngine::new());
        let mgr = manager(Arc::clone(&engine), clock(), 50);

        mgr.ingest(&dataset("1")).await.unwrap();
        let first = mgr.index().await.unwrap().unwrap();
        mgr.ingest(&dataset("2")).await.unwrap();
        let second = mgr.index().await.unwrap().unwrap();

        assert_eq!(second.version, "2");
        assert_ne!(first.generation, second.generation);
        assert_eq!(engine.inner.len(Area::Chunks), 5);
        assert!(mgr.orphan_chunk_ids().await.unwrap().is_empty());
        assert_eq!(
            mgr.get_partition("B").await.unwrap().into_complete().unwrap().len(),
            30
        );
    }

    #[tokio::test]
    async fn test_search_stops_after_enough_matches() {
        let engine = Arc::new(TestEngine::new());
        let mgr = manager(Arc::clone(&engine), clock(), 50);
        mgr.ingest(&dataset("1")).await.unwrap();

        let before = engine.chunk_gets();
        let hits = mgr.search("card", 10).await.unwrap().into_complete().unwrap();
        assert_eq!(hits.len(), 10);
        assert_eq!(engine.chunk_gets() - before, 1);

        let before = engine.chunk_gets();
        let hits = mgr.search("b CARD", 100).await.unwrap().into_complete().unwrap();
        assert_eq!(hits.len(), 30);
        assert_eq!(engine.chunk_gets() - before, 5);

        assert!(mgr.search("  ", 5).await.is_err());
        let before = engine.chunk_gets();
        assert!(mgr.search("card", 0).await.unwrap().value().unwrap().is_empty());
        assert_eq!(engine.chunk_gets(), before);
    }

    #[tokio::test]
    async fn test_find_by_external_id() {
        let engine = Arc::new(TestEngine::new());
        let mgr = manager(engine, clock(), 50);
        mgr.ingest(&dataset("1")).await.unwrap();

        let found = mgr.find_by_external_id("sf-B-7").await.unwrap();
        assert_eq!(found.into_complete().unwrap().unwrap().uuid, "B-7");
        let by_uuid = mgr.find_by_external_id("C-4").await.unwrap();
        assert_eq!(by_uuid.into_complete().unwrap().unwrap().name, "C Card 4");
        assert_eq!(
            mgr.find_by_external_id("nope").await.unwrap(),
            QueryOutcome::Complete(None)
        );
    }

    #[tokio::test]
    async fn test_missing_chunk_degrades_reads() {
        let engine = Arc::new(TestEngine::new());
        let mgr = manager(Arc::clone(&engine), clock(), 50);
        mgr.ingest(&dataset("1")).await.unwrap();

        let index = mgr.index().await.unwrap().unwrap();
        let lost = index.chunks[1].id.clone();
        engine.inner.delete(Area::Chunks, &lost).await.unwrap();

        let outcome = mgr.get_partition("A").await.unwrap();
        assert!(outcome.is_degraded());
        assert_eq!(outcome.missing_chunks(), [lost.clone()]);
        assert_eq!(outcome.value().unwrap().len(), 70);

        let err = outcome.into_complete().unwrap_err();
        assert!(err.is_degraded());
        assert!(matches!(err, Error::PartialDataset { total: 3, .. }));

        let search = mgr.search("card", 1000).await.unwrap();
        assert!(search.is_degraded());
        assert_eq!(search.value().unwrap().len(), 105);
    }

    #[tokio::test]
    async fn test_corrupt_chunk_surfaces_decode_error() {
        let engine = Arc::new(TestEngine::new());
        let mgr = manager(Arc::clone(&engine), clock(), 50);
        mgr.ingest(&dataset("1")).await.unwrap();

        let index = mgr.index().await.unwrap().unwrap();
        let store = ChunkStore::new(Arc::clone(&engine) as Arc<dyn StorageEngine>);
        let mut chunk = store.get(&index.chunks[3].id).await.unwrap().unwrap();
        let last = chunk.payload.len() - 1;
        chunk.payload[last] ^= 0x5a;
        store.put(&chunk).await.unwrap();

        assert!(mgr.get_partition("B").await.unwrap_err().is_corruption());
    }

    #[tokio::test]
    async fn test_dataset_goes_stale() {
        let clock = clock();
        let mgr = manager(Arc::new(TestEngine::new()), Arc::clone(&clock), 50);
        assert_eq!(mgr.state().await.unwrap(), DatasetState::Absent);
        mgr.ingest(&dataset("1")).await.unwrap();
        assert!(mgr.is_fresh().await.unwrap());

        clock.advance(Duration::from_secs(8 * 24 * 3600));
        assert!(!mgr.is_fresh().await.unwrap());
        assert_eq!(mgr.state().await.unwrap(), DatasetState::Stale);
        // Stale data still serves reads
        assert!(mgr.get_partition("C").await.unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_clear_and_orphans() {
        let engine = Arc::new(TestEngine::new());
        let mgr = manager(Arc::clone(&engine), clock(), 50);
        mgr.ingest(&dataset("1")).await.unwrap();

        let store = ChunkStore::new(Arc::clone(&engine) as Arc<dyn StorageEngine>);
        let mut stray = store.get(&mgr.index().await.unwrap().unwrap().chunks[0].id)
            .await
            .unwrap()
            .unwrap();
        stray.id = "0000dead/A/00000".to_string();
        store.put(&stray).await.unwrap();
        assert_eq!(mgr.orphan_chunk_ids().await.unwrap(), vec![stray.id.clone()]);

        let report = mgr.clear().await.unwrap();
        assert_eq!(report.chunks_deleted, 5);
        assert!(report.index_deleted);
        assert_eq!(mgr.state().await.unwrap(), DatasetState::Absent);
        assert_eq!(engine.inner.len(Area::Chunks), 1);
    }

    #[tokio::test]
    async fn test_unprojectable_records_are_skipped() {
        let mgr = manager(Arc::new(TestEngine::new()), clock(), 50);
        let mut data = dataset("1");
        data.partitions
            .get_mut("C")
            .unwrap()
            .push(json!({"name": "No Uuid"}));
        let report = mgr.ingest(&data).await.unwrap();
        assert_eq!(report.skipped_records, 1);
        assert_eq!(report.records, 155);
    }

    #[tokio::test]
    async fn test_sweep_orphans_spares_concurrent_ingest() {
        let engine = Arc::new(TestEngine::gated());
        let mgr = Arc::new(manager(Arc::clone(&engine), clock(), 10));

        let sweeper = tokio::spawn({
            let mgr = Arc::clone(&mgr);
            async move { mgr.sweep_orphans().await.unwrap() }
        });
        // The sweep is now between reading the index and listing chunks
        engine.gate().entered.notified().await;

        let ingest = tokio::spawn({
            let mgr = Arc::clone(&mgr);
            async move {
                let data = RawDataset {
                    version: "2".to_string(),
                    date: "2024-05-02".to_string(),
                    partitions: BTreeMap::from([("D".to_string(), raw_records("D", 30))]),
                };
                mgr.ingest(&data).await.unwrap()
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.gate().release.notify_one();

        let swept = sweeper.await.unwrap();
        let report = ingest.await.unwrap();
        assert_eq!(swept.deleted, 0);
        assert_eq!(report.chunks, 3);

        let outcome = mgr.get_partition("D").await.unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.into_complete().unwrap().len(), 30);
    }

    #[tokio::test]
    async fn test_sweep_orphans_removes_unindexed_chunks() {
        let engine = Arc::new(TestEngine::new());
        let mgr = manager(Arc::clone(&engine), clock(), 50);
        mgr.ingest(&dataset("1")).await.unwrap();

        let store = ChunkStore::new(Arc::clone(&engine) as Arc<dyn StorageEngine>);
        let mut stray = store.get(&mgr.index().await.unwrap().unwrap().chunks[0].id)
            .await
            .unwrap()
            .unwrap();
        stray.id = "0000dead/A/00000".to_string();
        store.put(&stray).await.unwrap();

        let summary = mgr.sweep_orphans().await.unwrap();
        assert_eq!(summary.deleted, 1);
        assert_eq!(engine.inner.len(Area::Chunks), 5);
        assert!(mgr.get_partition("A").await.unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_purge_removes_indexed_and_stray_chunks() {
        let engine = Arc::new(TestEngine::new());
        let mgr = manager(Arc::clone(&engine), clock(), 50);
        mgr.ingest(&dataset("1")).await.unwrap();
        engine
            .inner
            .put(Area::Chunks, "0000dead/A/00000", vec![0; 8])
            .await
            .unwrap();

        let removed = mgr.purge().await.unwrap();
        assert_eq!(removed, vec![(Area::DatasetIndex, 1), (Area::Chunks, 6)]);
        assert_eq!(mgr.state().await.unwrap(), DatasetState::Absent);
        assert_eq!(engine.inner.quota().used_bytes, 0);
    }

    #[tokio::test]
    async fn test_estimate_covers_stored_bytes() {
        let engine = Arc::new(TestEngine::new());
        let mgr = manager(Arc::clone(&engine), clock(), 50);
        let data = dataset("1");

        let estimate = mgr.estimate_stored_bytes(&data).unwrap();
        mgr.ingest(&data).await.unwrap();
        let used = engine.inner.quota().used_bytes;
        assert!(estimate >= used);
        assert!(estimate - used <= 6 * 16);
    }
}
