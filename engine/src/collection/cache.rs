//! Identity map of live records for one table.

use crate::adapter::QueryResult;
use crate::{error::Result, Error, RawRecord, Record, RecordId, TableName};
use std::collections::HashMap;
use tracing::warn;

/// Per-table identity map from record id to the one live [`Record`].
#[derive(Debug)]
pub struct RecordCache {
    table: TableName,
    records: HashMap<RecordId, Record>,
}

impl RecordCache {
    /// Create an empty cache.
    pub fn new(table: impl Into<TableName>) -> Self {
        Self {
            table: table.into(),
            records: HashMap::new(),
        }
    }

    /// Get a record by ID.
    pub fn get(&self, id: &str) -> Option<Record> {
        self.records.get(id).cloned()
    }

    /// Insert a record, replacing nothing if one with the same id is cached.
    pub fn add(&mut self, record: Record) {
        self.records.entry(record.id().to_string()).or_insert(record);
    }

    pub fn delete(&mut self, id: &str) -> Option<Record> {
        self.records.remove(id)
    }

    /// Remove every record, returning them.
    pub fn clear(&mut self) -> Vec<Record> {
        self.records.drain().map(|(_, record)| record).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Turn one adapter answer into the live record.
    ///
    /// A cached id the cache doesn't hold is a [`Error::Consistency`]. A raw
    /// record for an id that is already cached resolves to the cached
    /// instance; `materialize` only runs for records seen for the first time.
    pub fn record_from_query_result(
        &mut self,
        result: QueryResult,
        materialize: &impl Fn(RawRecord) -> Record,
    ) -> Result<Record> {
        match result {
            QueryResult::Cached(id) => self.get(&id).ok_or_else(|| Error::Consistency {
                table: self.table.clone(),
                id,
                reason: "adapter reported the record as cached, but it is not".into(),
            }),
            QueryResult::Raw(raw) => {
                if let Some(cached) = self.get(&raw.id) {
                    warn!(
                        table = %self.table,
                        id = %raw.id,
                        "adapter sent a raw record that is already cached; using the cached instance"
                    );
                    return Ok(cached);
                }
                let record = materialize(raw);
                self.add(record.clone());
                Ok(record)
            }
        }
    }

    /// Like [`RecordCache::record_from_query_result`] for a whole answer.
    ///
    /// Records seen for the first time are only added once the whole answer
    /// resolved, so a consistency error leaves the cache unchanged.
    pub fn records_from_query_results(
        &mut self,
        results: Vec<QueryResult>,
        materialize: &impl Fn(RawRecord) -> Record,
    ) -> Result<Vec<Record>> {
        if let Some(missing) = results.iter().find_map(|result| match result {
            QueryResult::Cached(id) if !self.contains(id) => Some(id.clone()),
            _ => None,
        }) {
            return Err(Error::Consistency {
                table: self.table.clone(),
                id: missing,
                reason: "adapter reported the record as cached, but it is not".into(),
            });
        }

        results
            .into_iter()
            .map(|result| self.record_from_query_result(result, materialize))
            .collect()
    }
}
