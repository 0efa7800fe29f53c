//! Chunk storage
//!
//! Chunks live in [`Area::Chunks`], keyed by chunk id. Bulk writes go
//! through a [`BulkWriter`], which issues writes in bounded concurrent
//! windows and pauses between windows so foreground reads are not starved.

use crate::engine::StorageEngine;
use crate::types::Chunk;
use cardvault_common::{Area, Error, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a best-effort multi-chunk delete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    /// Chunks that existed and were removed
    pub deleted: usize,
    /// Chunk ids whose delete failed
    pub failed: Vec<String>,
}

impl DeleteSummary {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Typed access to the chunk area
#[derive(Clone)]
pub struct ChunkStore {
    engine: Arc<dyn StorageEngine>,
}

impl ChunkStore {
    #[must_use]
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self { engine }
    }

    /// Store `chunk` under its id
    pub async fn put(&self, chunk: &Chunk) -> Result<()> {
        let bytes = bincode::serialize(chunk)?;
        self.engine.put(Area::Chunks, &chunk.id, bytes).await
    }

    /// Load a chunk. Stored bytes that do not parse are reported as
    /// [`Error::Decode`].
    pub async fn get(&self, id: &str) -> Result<Option<Chunk>> {
        let Some(bytes) = self.engine.get(Area::Chunks, id).await? else {
            return Ok(None);
        };
        bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| Error::decode(format!("chunk {id}: {e}")))
    }

    /// Remove a chunk; returns whether it existed
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.engine.delete(Area::Chunks, id).await
    }

    /// Ids of every stored chunk, in key order
    pub async fn ids(&self) -> Result<Vec<String>> {
        self.engine.keys(Area::Chunks).await
    }

    /// Remove every stored chunk, indexed or not; returns the number removed
    pub async fn clear(&self) -> Result<usize> {
        self.engine.clear_area(Area::Chunks).await
    }

    /// Bytes `chunk` is charged against the storage budget once stored
    pub fn stored_size(chunk: &Chunk) -> Result<u64> {
        Ok(chunk.id.len() as u64 + bincode::serialized_size(chunk)?)
    }

    /// Delete every id in `ids`, continuing past failures
    pub async fn delete_many<I, S>(&self, ids: I) -> DeleteSummary
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut summary = DeleteSummary::default();
        for id in ids {
            let id = id.as_ref();
            match self.delete(id).await {
                Ok(true) => summary.deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to delete chunk {}: {}", id, e);
                    summary.failed.push(id.to_string());
                }
            }
        }
        summary
    }

    /// Write `chunks` in windows of `concurrency`; returns how many were
    /// written before the first failure, alongside that failure
    pub async fn put_batch(
        &self,
        chunks: Vec<Chunk>,
        concurrency: usize,
        pause: Duration,
    ) -> (usize, Result<()>) {
        let mut writer = self.writer(concurrency, pause);
        for chunk in chunks {
            if let Err(e) = writer.push(chunk).await {
                return (writer.written(), Err(e));
            }
        }
        let result = writer.flush().await;
        (writer.written(), result)
    }

    /// Start a bulk write with at most `concurrency` writes in flight and
    /// `pause` between windows
    #[must_use]
    pub fn writer(&self, concurrency: usize, pause: Duration) -> BulkWriter {
        BulkWriter {
            store: self.clone(),
            concurrency: concurrency.max(1),
            pause,
            pending: Vec::new(),
            written: 0,
            windows: 0,
        }
    }
}

/// Windowed bulk chunk writer
///
/// Chunks are buffered with [`push`](Self::push); once a full window is
/// buffered it is written concurrently. The first failed write stops the
/// writer and is returned; chunks of that window that did succeed are
/// still counted in [`written`](Self::written).
pub struct BulkWriter {
    store: ChunkStore,
    concurrency: usize,
    pause: Duration,
    pending: Vec<Chunk>,
    written: usize,
    windows: usize,
}

impl BulkWriter {
    /// Queue a chunk, writing a window if one is full
    pub async fn push(&mut self, chunk: Chunk) -> Result<()> {
        self.pending.push(chunk);
        if self.pending.len() >= self.concurrency {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write every queued chunk
    pub async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if self.windows > 0 && !self.pause.is_zero() {
            tokio::time::sleep(self.pause).await;
        }
        self.windows += 1;

        let window = std::mem::take(&mut self.pending);
        let results = join_all(window.iter().map(|chunk| self.store.put(chunk))).await;

        let mut first_error = None;
        for (chunk, result) in window.iter().zip(results) {
            match result {
                Ok(()) => self.written += 1,
                Err(e) => {
                    debug!("Chunk {} write failed: {}", chunk.id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Chunks successfully written so far
    #[must_use]
    pub const fn written(&self) -> usize {
        self.written
    }

    /// Windows issued so far
    #[must_use]
    pub const fn windows(&self) -> usize {
        self.windows
    }
}
