//! Core type definitions for Cardvault
//!
//! Record, namespace and storage-area types shared by the dataset pipeline
//! and the TTL cache.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A card printing as kept by the bulk dataset store.
///
/// Only the fields needed by lookups survive ingestion; the provider's raw
/// records carry far more and are dropped at projection time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardRecord {
    /// Provider-wide unique id of the printing
    pub uuid: String,
    /// Card name (arbitrary Unicode)
    pub name: String,
    /// Set code the printing belongs to (the partition key)
    pub set_code: String,
    /// Collector number within the set
    pub number: String,
    /// Rarity, when the provider reports one
    pub rarity: Option<String>,
    /// Identifiers in third-party catalogs, keyed by catalog name
    pub external_ids: BTreeMap<String, String>,
}

impl CardRecord {
    /// True if `id` is this record's uuid or one of its external ids
    #[must_use]
    pub fn matches_external_id(&self, id: &str) -> bool {
        self.uuid == id || self.external_ids.values().any(|v| v == id)
    }

    /// Case-insensitive name match; `needle` must already be lowercase
    #[must_use]
    pub fn name_contains(&self, needle: &str) -> bool {
        self.name.to_lowercase().contains(needle)
    }
}

/// Logical partition of the TTL cache, each with its own default expiry
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Namespace {
    /// Price histories for a card
    PriceHistory,
    /// Mappings between catalog identifiers
    IdentifierMapping,
    /// Summary metadata (set lists, catalog info)
    Metadata,
}

impl Namespace {
    /// All namespaces
    pub const ALL: [Self; 3] = [Self::PriceHistory, Self::IdentifierMapping, Self::Metadata];

    /// Stable name used as the storage key prefix
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PriceHistory => "price-history",
            Self::IdentifierMapping => "identifier-mapping",
            Self::Metadata => "metadata",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ns| ns.as_str() == s)
            .ok_or_else(|| crate::Error::invalid_argument(format!("unknown namespace: {s}")))
    }
}

/// Durable area of the storage engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Area {
    /// Chunk id -> encoded chunk
    Chunks,
    /// Singleton dataset index
    DatasetIndex,
    /// Namespaced TTL cache entries
    Cache,
    /// Portfolios, watchlists and preferences owned by the application
    UserData,
}

impl Area {
    /// All areas
    pub const ALL: [Self; 4] = [Self::Chunks, Self::DatasetIndex, Self::Cache, Self::UserData];

    /// Areas that automatic reclamation is allowed to touch
    pub const RECLAIMABLE: [Self; 3] = [Self::Chunks, Self::DatasetIndex, Self::Cache];

    /// Table name in the persistent engine
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chunks => "chunks",
            Self::DatasetIndex => "dataset_index",
            Self::Cache => "cache",
            Self::UserData => "user_data",
        }
    }

    /// Whether cleanup may delete entries in this area.
    ///
    /// User-authored data is never reclaimable.
    #[must_use]
    pub const fn is_reclaimable(self) -> bool {
        !matches!(self, Self::UserData)
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one ingest run; every chunk key written by the run carries it
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Generation(Uuid);

impl Generation {
    /// Generate a new random generation
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Short hex form used in chunk keys
    #[must_use]
    pub fn short(&self) -> String {
        let mut hex = self.0.simple().to_string();
        hex.truncate(12);
        hex
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Generation({})", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
