//! Redb table definitions, one per storage area.

use cardvault_common::Area;
use redb::TableDefinition;

// Bulk dataset
pub const CHUNKS: TableDefinition<&str, &[u8]> = TableDefinition::new("chunks");
// Single key, see `index::INDEX_KEY`
pub const DATASET_INDEX: TableDefinition<&str, &[u8]> = TableDefinition::new("dataset_index");

// Key: "namespace/key", Value: bincode-encoded cache entry
pub const CACHE: TableDefinition<&str, &[u8]> = TableDefinition::new("cache");

// Owned by the application; never reclaimed
pub const USER_DATA: TableDefinition<&str, &[u8]> = TableDefinition::new("user_data");

/// Table backing an area
#[must_use]
pub const fn table(area: Area) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match area {
        Area::Chunks => CHUNKS,
        Area::DatasetIndex => DATASET_INDEX,
        Area::Cache => CACHE,
        Area::UserData => USER_DATA,
    }
}
