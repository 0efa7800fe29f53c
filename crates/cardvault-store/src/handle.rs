//! Memoized engine open.
//!
//! Consumers share one [`EngineHandle`] and ask it for the engine. The first
//! caller runs the open; concurrent first callers wait on that same open
//! instead of issuing their own.
//!
//! [`EngineHandle::shared_redb`] hands out one handle per database path for
//! as long as any holder keeps it alive.

use crate::engine::{MemoryEngine, RedbEngine, StorageEngine};
use cardvault_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Live redb handles by database path
static SHARED_REDB: LazyLock<Mutex<HashMap<PathBuf, Weak<EngineHandle>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

type Opener = Arc<dyn Fn() -> Result<Arc<dyn StorageEngine>> + Send + Sync>;

/// Lazily opened, shared storage engine
pub struct EngineHandle {
    opener: Opener,
    cell: OnceCell<Arc<dyn StorageEngine>>,
    opens: AtomicUsize,
}

impl EngineHandle {
    /// Create a handle that opens the engine with `opener` on first use.
    ///
    /// `opener` may block; it runs on tokio's blocking pool.
    pub fn new<F>(opener: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn StorageEngine>> + Send + Sync + 'static,
    {
        Self {
            opener: Arc::new(opener),
            cell: OnceCell::new(),
            opens: AtomicUsize::new(0),
        }
    }

    /// Handle for a redb database at `path`
    #[must_use]
    pub fn redb(path: PathBuf, quota_bytes: u64) -> Self {
        Self::new(move || {
            let engine: Arc<dyn StorageEngine> = Arc::new(RedbEngine::open(&path, quota_bytes)?);
            Ok(engine)
        })
    }

    /// Handle for the redb database at `path`, shared with every other
    /// caller that asks for the same path while a handle for it is alive.
    ///
    /// `quota_bytes` only applies when no live handle exists yet.
    #[must_use]
    pub fn shared_redb(path: PathBuf, quota_bytes: u64) -> Arc<Self> {
        let mut handles = SHARED_REDB.lock();
        handles.retain(|_, handle| handle.strong_count() > 0);
        if let Some(handle) = handles.get(&path).and_then(Weak::upgrade) {
            debug!("Reusing engine handle for {}", path.display());
            return handle;
        }
        let handle = Arc::new(Self::redb(path.clone(), quota_bytes));
        handles.insert(path, Arc::downgrade(&handle));
        handle
    }

    /// Handle for an in-memory engine
    #[must_use]
    pub fn memory(quota_bytes: u64) -> Self {
        Self::new(move || {
            let engine: Arc<dyn StorageEngine> = Arc::new(MemoryEngine::new(quota_bytes));
            Ok(engine)
        })
    }

    /// Get the engine, opening it if this is the first call
    pub async fn engine(&self) -> Result<Arc<dyn StorageEngine>> {
        let engine = self
            .cell
            .get_or_try_init(|| async {
                self.opens.fetch_add(1, Ordering::Relaxed);
                let opener = Arc::clone(&self.opener);
                let engine = tokio::task::spawn_blocking(move || opener())
                    .await
                    .map_err(|e| Error::storage(format!("engine open task failed: {e}")))??;
                info!("Storage engine '{}' ready", engine.name());
                Ok::<_, Error>(engine)
            })
            .await?;
        Ok(Arc::clone(engine))
    }

    /// True once an open has succeeded
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.cell.initialized()
    }

    /// Number of opens attempted through this handle
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    /// Drop the cached engine; the next [`engine`](Self::engine) call opens
    /// again. Returns whether an engine was held.
    pub fn close(&mut self) -> bool {
        let closed = self.cell.take().is_some();
        if closed {
            info!("Storage engine handle closed");
        }
        closed
    }
}
