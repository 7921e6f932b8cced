//! Collections: one table's records, cache and change stream.

pub mod cache;

use crate::adapter::{FindResult, QueryResult, StorageAdapter};
use crate::operation::CollectionChangeSet;
use crate::query::{Clause, Query, SerializedQuery};
use crate::raw_record::{dirty_from_json, sanitized_raw};
use crate::record::{RecordBuilder, RecordEvent};
use crate::schema::TableSchema;
use crate::subscriptions::{Subscribers, Subscription};
use crate::{error::Result, Action, Database, Error, RawRecord, Record, TableName};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;

pub use cache::RecordCache;

/// Per-table state owned by the database.
pub(crate) struct CollectionState {
    pub(crate) schema: TableSchema,
    pub(crate) cache: Mutex<RecordCache>,
    pub(crate) changes: Subscribers<CollectionChangeSet>,
}

impl CollectionState {
    pub(crate) fn new(schema: TableSchema) -> Self {
        Self {
            cache: Mutex::new(RecordCache::new(schema.name.clone())),
            changes: Subscribers::new(),
            schema,
        }
    }
}

/// Handle to one table of a [`Database`].
#[derive(Clone)]
pub struct Collection {
    database: Database,
    state: Arc<CollectionState>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("table", &self.state.schema.name)
            .field("cached", &self.state.cache.lock().len())
            .finish()
    }
}

impl Collection {
    pub(crate) fn new(database: Database, state: Arc<CollectionState>) -> Self {
        Self { database, state }
    }

    pub fn table(&self) -> &str {
        &self.state.schema.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.state.schema
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        self.database.adapter()
    }

    fn materialize(&self, raw: RawRecord) -> Record {
        Record::committed(self.database.downgrade(), self.table(), raw)
    }

    /// Find a record by id, from the cache if possible.
    pub async fn find(&self, id: &str) -> Result<Record> {
        if let Some(record) = self.state.cache.lock().get(id) {
            return Ok(record);
        }

        let found = self.adapter().find(self.table(), id).await?;
        match self.record_from_find_result(id, found) {
            Err(Error::Consistency { id, reason, .. }) => {
                error!(table = %self.table(), %id, %reason, "record cache out of sync with adapter; refetching");
                self.adapter().clear_cached_records(self.table()).await?;
                let found = self.adapter().find(self.table(), &id).await?;
                self.record_from_find_result(&id, found)
            }
            other => other,
        }
    }

    fn record_from_find_result(&self, id: &str, found: FindResult) -> Result<Record> {
        let result = match found {
            FindResult::NotFound => {
                return Err(Error::RecordNotFound {
                    table: self.table().to_string(),
                    id: id.to_string(),
                })
            }
            FindResult::Cached(id) => QueryResult::Cached(id),
            FindResult::Raw(raw) => QueryResult::Raw(raw),
        };
        self.state
            .cache
            .lock()
            .record_from_query_result(result, &|raw| self.materialize(raw))
    }

    /// Find a record and observe it. See [`Record::observe`].
    pub async fn find_and_observe(
        &self,
        id: &str,
        callback: impl Fn(&RecordEvent) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.find(id).await?.observe(callback)
    }

    /// Build a query on this table. Column names are checked against the schema.
    pub fn query<I, C>(&self, clauses: I) -> Result<Query>
    where
        I: IntoIterator<Item = C>,
        C: Into<Clause>,
    {
        Query::new(self.clone(), clauses)
    }

    /// Run a serialized query and materialize the answer through the cache.
    ///
    /// On a cache inconsistency the adapter forgets what it believes is
    /// cached and the query runs once more; a second failure is returned.
    pub(crate) async fn fetch_query(&self, query: &SerializedQuery) -> Result<Vec<Record>> {
        let results = self.adapter().query(query).await?;
        let first = self.records_from_query_results(results);
        match first {
            Err(Error::Consistency { id, reason, .. }) => {
                error!(table = %self.table(), %id, %reason, "record cache out of sync with adapter; refetching");
                self.adapter().clear_cached_records(self.table()).await?;
                let results = self.adapter().query(query).await?;
                self.records_from_query_results(results)
            }
            other => other,
        }
    }

    fn records_from_query_results(&self, results: Vec<QueryResult>) -> Result<Vec<Record>> {
        self.state
            .cache
            .lock()
            .records_from_query_results(results, &|raw| self.materialize(raw))
    }

    /// Prepare a new record. It is persisted by passing it to [`Database::batch`].
    ///
    /// `created_at` and `updated_at` are set to now when the table has them.
    pub fn prepare_create(&self, builder: impl FnOnce(&mut RecordBuilder<'_>)) -> Result<Record> {
        let mut raw = sanitized_raw(&BTreeMap::new(), self.schema());
        let mut editor = RecordBuilder::new(&mut raw, self.schema(), false);
        editor.touch("created_at");
        editor.touch("updated_at");
        builder(&mut editor);
        editor.finish()?;
        Ok(Record::pending_create(self.database.downgrade(), self.table(), raw))
    }

    /// Prepare and commit a new record inside `action`.
    pub async fn create(
        &self,
        action: &Action,
        builder: impl FnOnce(&mut RecordBuilder<'_>),
    ) -> Result<Record> {
        let record = self.prepare_create(builder)?;
        self.database.batch(action, vec![record.clone()]).await?;
        Ok(record)
    }

    /// Prepare a record from untrusted column data, keeping its id and sync status if valid.
    pub fn prepare_create_from_dirty_raw(&self, dirty: &serde_json::Value) -> Result<Record> {
        let raw = sanitized_raw(&dirty_from_json(dirty), self.schema());
        if self.state.cache.lock().contains(&raw.id) {
            return Err(Error::InvalidRecordState {
                table: self.table().to_string(),
                id: raw.id,
                reason: "a record with this id is already cached".into(),
            });
        }
        Ok(Record::pending_create(self.database.downgrade(), self.table(), raw))
    }

    /// A read-only record built from column data. Never cached, never written.
    pub fn disposable_from_dirty_raw(&self, dirty: &serde_json::Value) -> Record {
        let raw = sanitized_raw(&dirty_from_json(dirty), self.schema());
        Record::disposable(self.database.downgrade(), self.table(), raw)
    }

    /// Receive every committed change set of this table.
    pub fn subscribe_changes(
        &self,
        callback: impl Fn(&CollectionChangeSet) + Send + Sync + 'static,
    ) -> Subscription {
        self.state.changes.subscribe(callback)
    }

    /// Forget every cached record. Live handles keep working but are no longer
    /// the canonical instance for their id.
    pub async fn unsafe_clear_cache(&self) -> Result<()> {
        let dropped = self.state.cache.lock().clear();
        tracing::debug!(table = %self.table(), records = dropped.len(), "cache cleared");
        self.adapter().clear_cached_records(self.table()).await
    }

    pub(crate) fn state(&self) -> &CollectionState {
        &self.state
    }
}

/// Tables of a batch in first-appearance order.
pub(crate) fn group_by_table<T>(
    items: impl IntoIterator<Item = (TableName, T)>,
) -> Vec<(TableName, Vec<T>)> {
    let mut groups: Vec<(TableName, Vec<T>)> = Vec::new();
    for (table, item) in items {
        match groups.iter_mut().find(|(name, _)| *name == table) {
            Some((_, group)) => group.push(item),
            None => groups.push((table, vec![item])),
        }
    }
    groups
}
