//! Storage engine abstraction
//!
//! Every durable byte Cardvault keeps goes through a [`StorageEngine`]: a
//! set of named areas mapping string keys to opaque values. The engine owns
//! the storage budget; a write that would push usage past the budget fails
//! with [`Error::QuotaExceeded`] and leaves the previous value in place.
//!
//! # Accounting
//!
//! An entry costs `key.len() + value.len()` bytes. Each backend keeps a
//! [`QuotaLedger`] that is rebuilt from the stored entries on open and
//! adjusted on every committed write or delete.
//!
//! Writes are atomic per key. There is no transaction spanning several
//! keys or several areas.

mod memory;
mod persistent;

pub use memory::MemoryEngine;
pub use persistent::RedbEngine;

use async_trait::async_trait;
use cardvault_common::{Area, Error, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Key and stored size of one entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryMeta {
    pub key: String,
    pub size: u64,
}

/// Point-in-time view of the storage budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub used_bytes: u64,
    pub budget_bytes: u64,
}

impl QuotaSnapshot {
    #[must_use]
    pub const fn available_bytes(&self) -> u64 {
        self.budget_bytes.saturating_sub(self.used_bytes)
    }
}

/// Persistent key/value engine with per-area tables and a storage budget
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Insert or replace `key` in `area`
    async fn put(&self, area: Area, key: &str, value: Vec<u8>) -> Result<()>;

    /// Fetch the value stored under `key`
    async fn get(&self, area: Area, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove `key`; returns whether it existed
    async fn delete(&self, area: Area, key: &str) -> Result<bool>;

    /// Remove `key` only while its stored value still equals `expected`.
    ///
    /// Returns whether the entry was removed. A value replaced since the
    /// caller read it is left in place.
    async fn delete_if_unchanged(&self, area: Area, key: &str, expected: &[u8]) -> Result<bool>;

    /// Keys and sizes of every entry in `area`, in key order
    async fn entries(&self, area: Area) -> Result<Vec<EntryMeta>>;

    /// Every entry in `area` with its value, in key order
    async fn scan(&self, area: Area) -> Result<Vec<(String, Vec<u8>)>>;

    /// Remove every entry in `area`; returns the number removed
    async fn clear_area(&self, area: Area) -> Result<usize>;

    /// Current usage against the budget
    fn quota(&self) -> QuotaSnapshot;

    /// Keys of every entry in `area`, in key order
    async fn keys(&self, area: Area) -> Result<Vec<String>> {
        Ok(self
            .entries(area)
            .await?
            .into_iter()
            .map(|e| e.key)
            .collect())
    }
}

/// Bytes charged against the budget for one entry
#[must_use]
pub const fn entry_size(key: &str, value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64
}

/// Tracks bytes in use against a fixed budget
#[derive(Debug)]
pub struct QuotaLedger {
    used: AtomicU64,
    budget: u64,
}

impl QuotaLedger {
    /// Create a ledger with `used` bytes already stored
    #[must_use]
    pub const fn new(budget: u64, used: u64) -> Self {
        Self {
            used: AtomicU64::new(used),
            budget,
        }
    }

    /// Account for replacing an entry of `old` bytes with one of `new` bytes.
    ///
    /// Growth is rejected if it would exceed the budget; shrinking always
    /// succeeds.
    pub fn try_apply(&self, old: u64, new: u64) -> Result<()> {
        if new <= old {
            self.release(old - new);
            return Ok(());
        }
        let grow = new - old;
        let budget = self.budget;
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(grow).filter(|next| *next <= budget)
            })
            .map(|_| ())
            .map_err(|used| Error::QuotaExceeded {
                required: grow,
                available: budget.saturating_sub(used),
                budget,
            })
    }

    /// Undo a successful [`try_apply`](Self::try_apply) whose write did not commit
    pub fn revert(&self, old: u64, new: u64) {
        if new >= old {
            self.release(new - old);
        } else {
            self.used.fetch_add(old - new, Ordering::AcqRel);
        }
    }

    /// Return `bytes` to the budget
    pub fn release(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    #[must_use]
    pub fn snapshot(&self) -> QuotaSnapshot {
        QuotaSnapshot {
            used_bytes: self.used.load(Ordering::Acquire),
            budget_bytes: self.budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_rejects_growth_past_budget() {
        let ledger = QuotaLedger::new(100, 90);
        ledger.try_apply(0, 10).unwrap();
        let err = ledger.try_apply(0, 1).unwrap_err();
        assert!(err.is_quota_exceeded());
        assert_eq!(ledger.snapshot().used_bytes, 100);
    }

    #[test]
    fn test_ledger_shrink_always_succeeds() {
        let ledger = QuotaLedger::new(100, 100);
        ledger.try_apply(40, 10).unwrap();
        assert_eq!(ledger.snapshot().used_bytes, 70);
        assert_eq!(ledger.snapshot().available_bytes(), 30);
    }

    #[test]
    fn test_ledger_revert() {
        let ledger = QuotaLedger::new(100, 20);
        ledger.try_apply(5, 25).unwrap();
        ledger.revert(5, 25);
        assert_eq!(ledger.snapshot().used_bytes, 20);

        ledger.try_apply(15, 5).unwrap();
        ledger.revert(15, 5);
        assert_eq!(ledger.snapshot().used_bytes, 20);
    }

    #[test]
    fn test_entry_size() {
        assert_eq!(entry_size("abc", &[0u8; 7]), 10);
        assert_eq!(entry_size("é", b""), 2);
    }
}
