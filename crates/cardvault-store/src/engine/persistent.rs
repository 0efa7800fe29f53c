//! Persistent engine backed by redb.
//!
//! Each area is a redb table. Every put/delete is one write transaction, so
//! a failed write never disturbs other keys. redb calls are blocking and
//! run on tokio's blocking pool.

use super::{EntryMeta, QuotaLedger, QuotaSnapshot, StorageEngine, entry_size};
use crate::tables;
use async_trait::async_trait;
use cardvault_common::{Area, Error, Result};
use redb::{Database, ReadableTable};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Convert any redb error into a storage error
fn backend(e: impl Into<redb::Error>) -> Error {
    Error::Storage(format!("redb: {}", e.into()))
}

/// Run blocking redb work off the async executor
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::storage(format!("blocking task failed: {e}")))?
}

/// redb-backed [`StorageEngine`]
pub struct RedbEngine {
    db: Arc<Database>,
    ledger: Arc<QuotaLedger>,
    path: PathBuf,
}

impl RedbEngine {
    /// Open (or create) the database at `path` with a storage budget of
    /// `quota_bytes`.
    pub fn open(path: impl AsRef<Path>, quota_bytes: u64) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(backend)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write().map_err(backend)?;
        for area in Area::ALL {
            write_txn.open_table(tables::table(area)).map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;

        let used = Self::measure(&db)?;
        info!(
            "Opened redb engine at {:?} ({} of {} bytes used)",
            path, used, quota_bytes
        );

        Ok(Self {
            db: Arc::new(db),
            ledger: Arc::new(QuotaLedger::new(quota_bytes, used)),
            path: path.to_path_buf(),
        })
    }

    /// Path of the database file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sum of entry sizes across every area
    fn measure(db: &Database) -> Result<u64> {
        let read_txn = db.begin_read().map_err(backend)?;
        let mut used = 0u64;
        for area in Area::ALL {
            let table = read_txn.open_table(tables::table(area)).map_err(backend)?;
            for entry in table.iter().map_err(backend)? {
                let entry = entry.map_err(backend)?;
                used += entry_size(entry.0.value(), entry.1.value());
            }
        }
        Ok(used)
    }

    fn put_blocking(
        db: &Database,
        ledger: &QuotaLedger,
        area: Area,
        key: &str,
        value: &[u8],
    ) -> Result<()> {
        let new_size = entry_size(key, value);
        let write_txn = db.begin_write().map_err(backend)?;
        let old_size = {
            let mut table = write_txn.open_table(tables::table(area)).map_err(backend)?;
            let old_size = table
                .get(key)
                .map_err(backend)?
                .map_or(0, |v| entry_size(key, v.value()));
            // Dropping the txn on rejection aborts it
            ledger.try_apply(old_size, new_size)?;
            if let Err(e) = table.insert(key, value) {
                ledger.revert(old_size, new_size);
                return Err(backend(e));
            }
            old_size
        };
        if let Err(e) = write_txn.commit() {
            ledger.revert(old_size, new_size);
            return Err(backend(e));
        }
        Ok(())
    }

    fn delete_blocking(db: &Database, ledger: &QuotaLedger, area: Area, key: &str) -> Result<bool> {
        let write_txn = db.begin_write().map_err(backend)?;
        let removed = {
            let mut table = write_txn.open_table(tables::table(area)).map_err(backend)?;
            table
                .remove(key)
                .map_err(backend)?
                .map(|v| entry_size(key, v.value()))
        };
        write_txn.commit().map_err(backend)?;
        if let Some(size) = removed {
            ledger.release(size);
        }
        Ok(removed.is_some())
    }

    fn delete_if_unchanged_blocking(
        db: &Database,
        ledger: &QuotaLedger,
        area: Area,
        key: &str,
        expected: &[u8],
    ) -> Result<bool> {
        let write_txn = db.begin_write().map_err(backend)?;
        let removed = {
            let mut table = write_txn.open_table(tables::table(area)).map_err(backend)?;
            let unchanged = table
                .get(key)
                .map_err(backend)?
                .is_some_and(|v| v.value() == expected);
            if unchanged {
                table.remove(key).map_err(backend)?;
            }
            unchanged
        };
        if !removed {
            write_txn.abort().map_err(backend)?;
            return Ok(false);
        }
        write_txn.commit().map_err(backend)?;
        ledger.release(entry_size(key, expected));
        Ok(true)
    }

    fn clear_blocking(db: &Database, ledger: &QuotaLedger, area: Area) -> Result<usize> {
        let write_txn = db.begin_write().map_err(backend)?;
        let (count, freed) = {
            let mut table = write_txn.open_table(tables::table(area)).map_err(backend)?;
            // Collect keys first, then remove
            let mut keys = Vec::new();
            for entry in table.iter().map_err(backend)? {
                let entry = entry.map_err(backend)?;
                keys.push((
                    entry.0.value().to_string(),
                    entry_size(entry.0.value(), entry.1.value()),
                ));
            }
            let mut freed = 0u64;
            for (key, size) in &keys {
                table.remove(key.as_str()).map_err(backend)?;
                freed += size;
            }
            (keys.len(), freed)
        };
        write_txn.commit().map_err(backend)?;
        ledger.release(freed);
        Ok(count)
    }

    fn scan_blocking(db: &Database, area: Area) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = db.begin_read().map_err(backend)?;
        let table = read_txn.open_table(tables::table(area)).map_err(backend)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(backend)? {
            let entry = entry.map_err(backend)?;
            result.push((entry.0.value().to_string(), entry.1.value().to_vec()));
        }
        Ok(result)
    }

    fn entries_blocking(db: &Database, area: Area) -> Result<Vec<EntryMeta>> {
        let read_txn = db.begin_read().map_err(backend)?;
        let table = read_txn.open_table(tables::table(area)).map_err(backend)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(backend)? {
            let entry = entry.map_err(backend)?;
            let key = entry.0.value();
            result.push(EntryMeta {
                key: key.to_string(),
                size: entry_size(key, entry.1.value()),
            });
        }
        Ok(result)
    }
}

#[async_trait]
impl StorageEngine for RedbEngine {
    fn name(&self) -> &str {
        "redb"
    }

    async fn put(&self, area: Area, key: &str, value: Vec<u8>) -> Result<()> {
        let db = Arc::clone(&self.db);
        let ledger = Arc::clone(&self.ledger);
        let key = key.to_string();
        blocking(move || Self::put_blocking(&db, &ledger, area, &key, &value)).await
    }

    async fn get(&self, area: Area, key: &str) -> Result<Option<Vec<u8>>> {
        let db = Arc::clone(&self.db);
        let key = key.to_string();
        blocking(move || {
            let read_txn = db.begin_read().map_err(backend)?;
            let table = read_txn.open_table(tables::table(area)).map_err(backend)?;
            Ok(table
                .get(key.as_str())
                .map_err(backend)?
                .map(|v| v.value().to_vec()))
        })
        .await
    }

    async fn delete(&self, area: Area, key: &str) -> Result<bool> {
        let db = Arc::clone(&self.db);
        let ledger = Arc::clone(&self.ledger);
        let key = key.to_string();
        blocking(move || Self::delete_blocking(&db, &ledger, area, &key)).await
    }

    async fn delete_if_unchanged(&self, area: Area, key: &str, expected: &[u8]) -> Result<bool> {
        let db = Arc::clone(&self.db);
        let ledger = Arc::clone(&self.ledger);
        let key = key.to_string();
        let expected = expected.to_vec();
        blocking(move || Self::delete_if_unchanged_blocking(&db, &ledger, area, &key, &expected))
            .await
    }

    async fn entries(&self, area: Area) -> Result<Vec<EntryMeta>> {
        let db = Arc::clone(&self.db);
        blocking(move || Self::entries_blocking(&db, area)).await
    }

    async fn scan(&self, area: Area) -> Result<Vec<(String, Vec<u8>)>> {
        let db = Arc::clone(&self.db);
        blocking(move || Self::scan_blocking(&db, area)).await
    }

    async fn clear_area(&self, area: Area) -> Result<usize> {
        let db = Arc::clone(&self.db);
        let ledger = Arc::clone(&self.ledger);
        let removed = blocking(move || Self::clear_blocking(&db, &ledger, area)).await?;
        debug!("Cleared {} entries from {}", removed, area);
        Ok(removed)
    }

    fn quota(&self) -> QuotaSnapshot {
        self.ledger.snapshot()
    }
}
