//! Raw dataset input and record projection
//!
//! The upstream provider's records carry dozens of fields. Ingestion keeps
//! only what lookups need and drops the rest before anything is stored.

use cardvault_common::{CardRecord, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Read;

/// Parsed dataset blob handed over by the fetch layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawDataset {
    /// Upstream dataset version
    pub version: String,
    /// Upstream dataset date
    pub date: String,
    /// Raw records grouped by partition key (set code), in key order
    pub partitions: BTreeMap<String, Vec<Value>>,
}

impl RawDataset {
    /// Parse a dataset from JSON text
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Parse a dataset from a JSON reader
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Number of raw records across every partition
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }
}

/// Project one raw record of partition `set_code` to a [`CardRecord`].
///
/// `uuid` and `name` are required. `number` defaults to empty, `rarity` is
/// optional and `identifiers` keeps only its string-valued entries.
pub fn project(set_code: &str, raw: &Value) -> Result<CardRecord> {
    let obj = raw
        .as_object()
        .ok_or_else(|| Error::invalid_argument("record is not a JSON object"))?;

    let text = |field: &str| obj.get(field).and_then(Value::as_str).map(str::to_string);

    let uuid = text("uuid").ok_or_else(|| Error::invalid_argument("record has no uuid"))?;
    let name =
        text("name").ok_or_else(|| Error::invalid_argument(format!("record {uuid} has no name")))?;

    let external_ids = obj
        .get("identifiers")
        .and_then(Value::as_object)
        .map(|ids| {
            ids.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Ok(CardRecord {
        uuid,
        name,
        set_code: set_code.to_string(),
        number: text("number").unwrap_or_default(),
        rarity: text("rarity"),
        external_ids,
    })
}
