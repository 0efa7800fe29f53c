//! Namespaced TTL cache
//!
//! Entries live in [`Area::Cache`] under `"{namespace}/{key}"`. Each stored
//! entry records when it was written and when it expires; an entry is
//! present while `now < expires_at` and absent from that instant on.
//! Expired entries are deleted when a read finds them, and in bulk by
//! [`CleanupService::sweep_expired`](crate::CleanupService::sweep_expired).
//! Both deletes are conditional on the stored bytes being the ones judged
//! expired, so an entry rewritten in between survives.
//!
//! The cache never fails its caller on storage trouble: read errors are
//! misses and write errors are logged. [`TtlCache::try_set`] is the one
//! operation that reports write failures, for callers that react to quota
//! exhaustion.

use cardvault_common::clock::add_duration;
use cardvault_common::config::CacheConfig;
use cardvault_common::{Area, Clock, Error, Namespace, Result};
use cardvault_store::StorageEngine;
use cardvault_store::engine::entry_size;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// A cached value with its lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// On-disk entry; the value is kept as JSON so any serde type round-trips
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    value: Vec<u8>,
}

impl StoredEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Storage key of `key` in `namespace`
#[must_use]
pub fn storage_key(namespace: Namespace, key: &str) -> String {
    format!("{namespace}/{key}")
}

/// Split a storage key into namespace and key.
///
/// Keys outside any namespace (such as the quota probe) yield `None`.
#[must_use]
pub fn parse_storage_key(storage_key: &str) -> Option<(Namespace, &str)> {
    let (ns, key) = storage_key.split_once('/')?;
    Some((ns.parse().ok()?, key))
}

/// Metadata of one stored cache entry, as seen by a full scan
#[derive(Debug, Clone)]
pub struct ScannedEntry {
    pub storage_key: String,
    pub namespace: Namespace,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Bytes charged against the storage budget
    pub size: u64,
}

/// Result of a full cache scan
#[derive(Debug, Default)]
pub struct CacheScan {
    pub entries: Vec<ScannedEntry>,
    /// Keys whose stored bytes could not be decoded
    pub undecodable: Vec<String>,
}

/// Operation counters
#[derive(Debug, Default)]
pub struct CacheCounters {
    /// Reads that returned a value
    pub hits: AtomicU64,
    /// Reads that found nothing usable
    pub misses: AtomicU64,
    /// Entries deleted because they had expired
    pub evictions: AtomicU64,
    /// Writes that failed
    pub write_failures: AtomicU64,
}

impl CacheCounters {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.write_failures.store(0, Ordering::Relaxed);
    }
}

/// Live entries in one namespace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NamespaceStats {
    pub entries: usize,
    pub bytes: u64,
}

/// Cache diagnostics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Live entries per namespace; expired entries are not counted
    pub namespaces: BTreeMap<Namespace, NamespaceStats>,
    /// Expired entries still awaiting deletion
    pub expired_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    #[must_use]
    pub fn namespace(&self, namespace: Namespace) -> NamespaceStats {
        self.namespaces.get(&namespace).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn total_entries(&self) -> usize {
        self.namespaces.values().map(|s| s.entries).sum()
    }
}

/// Persistent cache with per-namespace default lifetimes
pub struct TtlCache {
    engine: Arc<dyn StorageEngine>,
    clock: Arc<dyn Clock>,
    ttls: CacheConfig,
    counters: CacheCounters,
}

impl TtlCache {
    pub fn new(engine: Arc<dyn StorageEngine>, clock: Arc<dyn Clock>, ttls: CacheConfig) -> Self {
        Self {
            engine,
            clock,
            ttls,
            counters: CacheCounters::default(),
        }
    }

    /// Default lifetime of entries in `namespace`
    #[must_use]
    pub const fn default_ttl(&self, namespace: Namespace) -> Duration {
        self.ttls.ttl(namespace)
    }

    #[must_use]
    pub const fn counters(&self) -> &CacheCounters {
        &self.counters
    }

    /// Current time as seen by the cache
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Value stored under `key`, if present and unexpired
    pub async fn get<T: DeserializeOwned>(&self, namespace: Namespace, key: &str) -> Option<T> {
        self.get_entry(namespace, key).await.map(|e| e.value)
    }

    /// Entry stored under `key`, if present and unexpired
    pub async fn get_entry<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        key: &str,
    ) -> Option<CacheEntry<T>> {
        let skey = storage_key(namespace, key);
        let entry = self.read(&skey).await;
        if entry.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        entry
    }

    async fn read<T: DeserializeOwned>(&self, skey: &str) -> Option<CacheEntry<T>> {
        let bytes = match self.engine.get(Area::Cache, skey).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!("Cache read of {} failed: {}", skey, e);
                return None;
            }
        };

        let stored: StoredEntry = match bincode::deserialize(&bytes) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Dropping undecodable cache entry {}: {}", skey, e);
                self.remove_unchanged(skey, &bytes).await;
                return None;
            }
        };

        if !stored.is_live(self.clock.now()) {
            debug!("Cache entry {} expired at {}", skey, stored.expires_at);
            if self.remove_unchanged(skey, &bytes).await {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
            return None;
        }

        match serde_json::from_slice(&stored.value) {
            Ok(value) => Some(CacheEntry {
                value,
                created_at: stored.created_at,
                expires_at: stored.expires_at,
            }),
            Err(e) => {
                // Shape changed since the entry was written
                warn!("Cache entry {} does not match requested type: {}", skey, e);
                None
            }
        }
    }

    /// Store `value` under `key`, logging instead of failing
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        namespace: Namespace,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) {
        if let Err(e) = self.try_set(namespace, key, value, ttl).await {
            warn!("Cache write of {}/{} failed: {}", namespace, key, e);
        }
    }

    /// Store `value` under `key` for `ttl` (or the namespace default)
    pub async fn try_set<T: Serialize + ?Sized>(
        &self,
        namespace: Namespace,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(Error::invalid_argument("cache key is empty"));
        }
        let now = self.clock.now();
        let stored = StoredEntry {
            created_at: now,
            expires_at: add_duration(now, ttl.unwrap_or_else(|| self.default_ttl(namespace))),
            value: serde_json::to_vec(value)?,
        };
        let bytes = bincode::serialize(&stored)?;
        let result = self
            .engine
            .put(Area::Cache, &storage_key(namespace, key), bytes)
            .await;
        if result.is_err() {
            self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Remove `key`; returns whether it existed
    pub async fn delete(&self, namespace: Namespace, key: &str) -> bool {
        self.remove(&storage_key(namespace, key)).await
    }

    /// Remove an entry by storage key, logging failures
    pub(crate) async fn remove(&self, skey: &str) -> bool {
        match self.engine.delete(Area::Cache, skey).await {
            Ok(existed) => existed,
            Err(e) => {
                warn!("Cache delete of {} failed: {}", skey, e);
                false
            }
        }
    }

    /// Remove an entry only if it still holds `bytes`, logging failures
    pub(crate) async fn remove_unchanged(&self, skey: &str, bytes: &[u8]) -> bool {
        match self.engine.delete_if_unchanged(Area::Cache, skey, bytes).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Cache delete of {} failed: {}", skey, e);
                false
            }
        }
    }

    /// Remove the entry under `skey` if, as currently stored, it is expired
    /// at `now` or undecodable
    pub(crate) async fn remove_if_expired(&self, skey: &str, now: DateTime<Utc>) -> bool {
        let bytes = match self.engine.get(Area::Cache, skey).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return false,
            Err(e) => {
                warn!("Cache read of {} failed: {}", skey, e);
                return false;
            }
        };
        match bincode::deserialize::<StoredEntry>(&bytes) {
            Ok(stored) if stored.is_live(now) => false,
            _ => self.remove_unchanged(skey, &bytes).await,
        }
    }

    /// Remove every entry in `namespace`; returns how many were removed
    pub async fn clear_namespace(&self, namespace: Namespace) -> Result<usize> {
        let prefix = format!("{namespace}/");
        let mut removed = 0;
        for key in self.engine.keys(Area::Cache).await? {
            if key.starts_with(&prefix) && self.remove(&key).await {
                removed += 1;
            }
        }
        debug!("Cleared {} entries from {}", removed, namespace);
        Ok(removed)
    }

    /// Decode the metadata of every namespaced entry
    pub async fn scan(&self) -> Result<CacheScan> {
        let mut scan = CacheScan::default();
        for (skey, bytes) in self.engine.scan(Area::Cache).await? {
            let Some((namespace, _)) = parse_storage_key(&skey) else {
                continue;
            };
            match bincode::deserialize::<StoredEntry>(&bytes) {
                Ok(stored) => scan.entries.push(ScannedEntry {
                    size: entry_size(&skey, &bytes),
                    storage_key: skey,
                    namespace,
                    created_at: stored.created_at,
                    expires_at: stored.expires_at,
                }),
                Err(_) => scan.undecodable.push(skey),
            }
        }
        Ok(scan)
    }

    /// Per-namespace live entry counts and sizes, plus counters
    pub async fn stats(&self) -> Result<CacheStats> {
        let now = self.clock.now();
        let mut stats = CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            ..CacheStats::default()
        };
        for entry in self.scan().await?.entries {
            if now < entry.expires_at {
                let ns = stats.namespaces.entry(entry.namespace).or_default();
                ns.entries += 1;
                ns.bytes += entry.size;
            } else {
                stats.expired_entries += 1;
            }
        }
        Ok(stats)
    }

    /// Return the cached value for `key`, or compute it with `fetch` and
    /// cache the result. Cache failures never fail the computation.
    pub async fn get_or_insert_with<T, E, F, Fut>(
        &self,
        namespace: Namespace,
        key: &str,
        ttl: Option<Duration>,
        fetch: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.get(namespace, key).await {
            return Ok(value);
        }
        let value = fetch().await?;
        self.set(namespace, key, &value, ttl).await;
        Ok(value)
    }
}
