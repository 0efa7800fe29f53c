//! Cardvault Cache - TTL cache and storage housekeeping
//!
//! - [`TtlCache`]: namespaced, persistent cache for derived lookups
//! - [`CleanupService`]: expiry sweeps, quota probes and tiered reclaim
//! - [`StorageUsageReporter`]: usage estimates for diagnostics

pub mod cleanup;
pub mod ttl;
pub mod usage;

pub use cleanup::{
    CleanupService, EmergencyReport, PROBE_KEY, QuotaStatus, ReclaimReport, ReclaimTier,
    SweepReport,
};
pub use ttl::{CacheCounters, CacheEntry, CacheStats, NamespaceStats, TtlCache};
pub use usage::{AreaUsage, KeyUsage, StorageUsage, StorageUsageReporter};
