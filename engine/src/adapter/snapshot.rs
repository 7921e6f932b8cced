//! Snapshots of the in-memory backend.
//!
//! Snapshots serialize to JSON with deterministic ordering (tables and
//! records keyed by `BTreeMap`), so two adapters holding the same data
//! produce byte-identical output.

use crate::schema::AppSchema;
use crate::{error::Result, Error, RawRecord, RecordId, SchemaVersion, TableName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current snapshot format version.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Full contents of a [`MemoryAdapter`](super::MemoryAdapter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    pub format_version: u32,
    pub schema_version: SchemaVersion,
    /// Table -> record id -> raw record
    pub tables: BTreeMap<TableName, BTreeMap<RecordId, RawRecord>>,
    /// Opaque key/value pairs
    #[serde(default)]
    pub local: BTreeMap<String, String>,
}

impl MemorySnapshot {
    pub fn new(schema_version: SchemaVersion) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            tables: BTreeMap::new(),
            local: BTreeMap::new(),
        }
    }

    pub fn add_record(&mut self, table: &str, raw: RawRecord) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(raw.id.clone(), raw);
    }

    pub fn get_record(&self, table: &str, id: &str) -> Option<&RawRecord> {
        self.tables.get(table).and_then(|rows| rows.get(id))
    }

    /// Total number of records, deleted ones included.
    pub fn record_count(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    /// Check that the snapshot fits `schema`.
    pub fn validate(&self, schema: &AppSchema) -> Result<()> {
        if self.schema_version != schema.version {
            return Err(Error::InvalidSnapshot(format!(
                "schema version mismatch: expected {}, got {}",
                schema.version, self.schema_version
            )));
        }

        for (table, rows) in &self.tables {
            let table_schema = schema.require_table(table)?;
            for (id, raw) in rows {
                if id != &raw.id {
                    return Err(Error::InvalidSnapshot(format!(
                        "record keyed as {}#{} has id '{}'",
                        table, id, raw.id
                    )));
                }
                if let Some(column) = raw.columns.keys().find(|c| table_schema.column(c).is_none()) {
                    return Err(Error::InvalidSnapshot(format!(
                        "{}#{} has unknown column '{}'",
                        table, id, column
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}
