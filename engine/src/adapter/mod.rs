//! Storage adapter boundary.
//!
//! The core never touches storage directly. Everything persistent goes
//! through [`StorageAdapter`], whose calls are opaque asynchronous operations
//! from the work queue's point of view. Queries cross the boundary as
//! [`SerializedQuery`] values so an adapter may run in another thread or
//! process.

pub mod executor;
pub mod memory;
pub mod snapshot;

use crate::query::SerializedQuery;
use crate::schema::AppSchema;
use crate::{error::Result, RawRecord, RecordId, TableName};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::MemoryAdapter;
pub use snapshot::{MemorySnapshot, SNAPSHOT_FORMAT_VERSION};

/// Answer to a single-record lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum FindResult {
    /// The adapter believes the caller already holds this record.
    Cached(RecordId),
    Raw(RawRecord),
    NotFound,
}

/// One element of a query answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum QueryResult {
    Cached(RecordId),
    Raw(RawRecord),
}

impl QueryResult {
    pub fn id(&self) -> &str {
        match self {
            QueryResult::Cached(id) => id,
            QueryResult::Raw(raw) => &raw.id,
        }
    }
}

/// A single write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BatchOperation {
    Create { table: TableName, raw: RawRecord },
    Update { table: TableName, raw: RawRecord },
    MarkAsDeleted { table: TableName, id: RecordId },
    DestroyPermanently { table: TableName, id: RecordId },
}

impl BatchOperation {
    pub fn table(&self) -> &str {
        match self {
            BatchOperation::Create { table, .. }
            | BatchOperation::Update { table, .. }
            | BatchOperation::MarkAsDeleted { table, .. }
            | BatchOperation::DestroyPermanently { table, .. } => table,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            BatchOperation::Create { raw, .. } | BatchOperation::Update { raw, .. } => &raw.id,
            BatchOperation::MarkAsDeleted { id, .. }
            | BatchOperation::DestroyPermanently { id, .. } => id,
        }
    }
}

/// Backend contract consumed by the database.
///
/// `batch` must be atomic: either every operation applies or none does.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn schema(&self) -> &AppSchema;

    async fn find(&self, table: &str, id: &str) -> Result<FindResult>;

    async fn query(&self, query: &SerializedQuery) -> Result<Vec<QueryResult>>;

    async fn query_ids(&self, query: &SerializedQuery) -> Result<Vec<RecordId>>;

    async fn count(&self, query: &SerializedQuery) -> Result<usize>;

    async fn batch(&self, operations: Vec<BatchOperation>) -> Result<()>;

    /// Ids of records marked as deleted but not yet destroyed.
    async fn get_deleted_records(&self, table: &str) -> Result<Vec<RecordId>>;

    async fn destroy_deleted_records(&self, table: &str, ids: &[RecordId]) -> Result<()>;

    /// Wipe all persisted state.
    async fn reset_all(&self) -> Result<()>;

    /// Forget which records of `table` the caller holds, so later answers for
    /// that table carry raw records.
    async fn clear_cached_records(&self, table: &str) -> Result<()>;

    async fn get_local(&self, key: &str) -> Result<Option<String>>;

    async fn set_local(&self, key: &str, value: &str) -> Result<()>;

    async fn remove_local(&self, key: &str) -> Result<()>;
}
