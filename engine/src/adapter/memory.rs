//! In-memory storage adapter.

use super::executor::{self, RowSource};
use super::snapshot::MemorySnapshot;
use super::{BatchOperation, FindResult, QueryResult, StorageAdapter};
use crate::query::SerializedQuery;
use crate::raw_record::SyncStatus;
use crate::schema::AppSchema;
use crate::{error::Result, Error, RawRecord, RecordId, TableName};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Rows of one table in insertion order.
#[derive(Debug, Clone, Default)]
struct TableData {
    rows: BTreeMap<u64, RawRecord>,
    index: HashMap<RecordId, u64>,
    next_seq: u64,
}

impl TableData {
    fn get(&self, id: &str) -> Option<&RawRecord> {
        self.index.get(id).and_then(|seq| self.rows.get(seq))
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut RawRecord> {
        match self.index.get(id) {
            Some(seq) => self.rows.get_mut(seq),
            None => None,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    fn insert(&mut self, raw: RawRecord) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(raw.id.clone(), seq);
        self.rows.insert(seq, raw);
    }

    fn remove(&mut self, id: &str) -> Option<RawRecord> {
        let seq = self.index.remove(id)?;
        self.rows.remove(&seq)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<TableName, TableData>,
    /// Records the caller currently holds in its cache
    cached: HashSet<(TableName, RecordId)>,
    local: BTreeMap<String, String>,
}

impl RowSource for MemoryState {
    fn rows(&self, table: &str) -> Vec<&RawRecord> {
        self.tables
            .get(table)
            .map(|data| data.rows.values().collect())
            .unwrap_or_default()
    }
}

impl MemoryState {
    fn table(&self, table: &str) -> Result<&TableData> {
        self.tables
            .get(table)
            .ok_or_else(|| Error::UnknownTable(table.to_string()))
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut TableData> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| Error::UnknownTable(table.to_string()))
    }

    /// Answer with an id if the caller holds the record, else with the raw record.
    fn respond(&mut self, table: &str, raw: &RawRecord) -> QueryResult {
        let key = (table.to_string(), raw.id.clone());
        if self.cached.contains(&key) {
            QueryResult::Cached(raw.id.clone())
        } else {
            self.cached.insert(key);
            QueryResult::Raw(raw.clone())
        }
    }

    /// Check that every operation in `operations` would apply, in order.
    fn validate_batch(&self, operations: &[BatchOperation]) -> Result<()> {
        let mut created: HashSet<(&str, &str)> = HashSet::new();
        let mut removed: HashSet<(&str, &str)> = HashSet::new();

        for operation in operations {
            let (table, id) = (operation.table(), operation.id());
            let data = self.table(table)?;
            let exists = (data.contains(id) || created.contains(&(table, id)))
                && !removed.contains(&(table, id));

            match operation {
                BatchOperation::Create { .. } => {
                    if exists {
                        return Err(Error::Adapter(format!(
                            "cannot create {}#{}: record already exists",
                            table, id
                        )));
                    }
                    created.insert((table, id));
                    removed.remove(&(table, id));
                }
                BatchOperation::Update { .. } | BatchOperation::MarkAsDeleted { .. } => {
                    if !exists {
                        return Err(Error::Adapter(format!(
                            "cannot write {}#{}: record does not exist",
                            table, id
                        )));
                    }
                }
                BatchOperation::DestroyPermanently { .. } => {
                    if !exists {
                        return Err(Error::Adapter(format!(
                            "cannot destroy {}#{}: record does not exist",
                            table, id
                        )));
                    }
                    removed.insert((table, id));
                }
            }
        }

        Ok(())
    }

    fn apply(&mut self, operation: BatchOperation) -> Result<()> {
        match operation {
            BatchOperation::Create { table, raw } => {
                self.cached.insert((table.clone(), raw.id.clone()));
                self.table_mut(&table)?.insert(raw);
            }
            BatchOperation::Update { table, raw } => {
                let id = raw.id.clone();
                let slot = self
                    .table_mut(&table)?
                    .get_mut(&id)
                    .ok_or_else(|| Error::Adapter(format!("{}#{} vanished", table, id)))?;
                *slot = raw;
                self.cached.insert((table, id));
            }
            BatchOperation::MarkAsDeleted { table, id } => {
                if let Some(raw) = self.table_mut(&table)?.get_mut(&id) {
                    raw.status = SyncStatus::Deleted;
                }
                self.cached.remove(&(table, id));
            }
            BatchOperation::DestroyPermanently { table, id } => {
                self.table_mut(&table)?.remove(&id);
                self.cached.remove(&(table, id));
            }
        }
        Ok(())
    }
}

/// Storage adapter keeping everything in process memory.
///
/// Useful for tests and for embedders that persist through snapshots.
#[derive(Debug)]
pub struct MemoryAdapter {
    schema: AppSchema,
    state: Mutex<MemoryState>,
}

impl MemoryAdapter {
    pub fn new(schema: AppSchema) -> Self {
        let state = MemoryState {
            tables: Self::empty_tables(&schema),
            ..MemoryState::default()
        };
        Self {
            schema,
            state: Mutex::new(state),
        }
    }

    fn empty_tables(schema: &AppSchema) -> HashMap<TableName, TableData> {
        schema
            .tables
            .keys()
            .map(|name| (name.clone(), TableData::default()))
            .collect()
    }

    /// Export every table and local value.
    pub fn export_snapshot(&self) -> MemorySnapshot {
        let state = self.state.lock();
        let mut snapshot = MemorySnapshot::new(self.schema.version);
        for (table, data) in &state.tables {
            for raw in data.rows.values() {
                snapshot.add_record(table, raw.clone());
            }
        }
        snapshot.local = state.local.clone();
        snapshot
    }

    /// Replace all state with `snapshot`. Rows load in id order.
    ///
    /// The caller's cache is considered empty afterwards.
    pub fn import_snapshot(&self, snapshot: MemorySnapshot) -> Result<()> {
        snapshot.validate(&self.schema)?;

        let mut tables = Self::empty_tables(&self.schema);
        for (table, rows) in snapshot.tables {
            let data = tables
                .get_mut(&table)
                .ok_or_else(|| Error::UnknownTable(table.clone()))?;
            for raw in rows.into_values() {
                data.insert(raw);
            }
        }

        let mut state = self.state.lock();
        state.tables = tables;
        state.cached.clear();
        state.local = snapshot.local;
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    fn schema(&self) -> &AppSchema {
        &self.schema
    }

    async fn find(&self, table: &str, id: &str) -> Result<FindResult> {
        let mut state = self.state.lock();
        let raw = match state.table(table)?.get(id) {
            Some(raw) if raw.status != SyncStatus::Deleted => raw.clone(),
            _ => return Ok(FindResult::NotFound),
        };
        Ok(match state.respond(table, &raw) {
            QueryResult::Cached(id) => FindResult::Cached(id),
            QueryResult::Raw(raw) => FindResult::Raw(raw),
        })
    }

    async fn query(&self, query: &SerializedQuery) -> Result<Vec<QueryResult>> {
        let mut state = self.state.lock();
        state.table(&query.table)?;
        let rows: Vec<RawRecord> = executor::execute(&*state, query)?
            .into_iter()
            .cloned()
            .collect();
        debug!(table = %query.table, rows = rows.len(), "memory adapter query");
        Ok(rows
            .iter()
            .map(|raw| state.respond(&query.table, raw))
            .collect())
    }

    async fn query_ids(&self, query: &SerializedQuery) -> Result<Vec<RecordId>> {
        let state = self.state.lock();
        state.table(&query.table)?;
        Ok(executor::execute(&*state, query)?
            .into_iter()
            .map(|raw| raw.id.clone())
            .collect())
    }

    async fn count(&self, query: &SerializedQuery) -> Result<usize> {
        let state = self.state.lock();
        state.table(&query.table)?;
        executor::count(&*state, query)
    }

    async fn batch(&self, operations: Vec<BatchOperation>) -> Result<()> {
        let mut state = self.state.lock();
        state.validate_batch(&operations)?;
        let count = operations.len();
        for operation in operations {
            state.apply(operation)?;
        }
        debug!(operations = count, "memory adapter batch applied");
        Ok(())
    }

    async fn get_deleted_records(&self, table: &str) -> Result<Vec<RecordId>> {
        let state = self.state.lock();
        Ok(state
            .table(table)?
            .rows
            .values()
            .filter(|raw| raw.status == SyncStatus::Deleted)
            .map(|raw| raw.id.clone())
            .collect())
    }

    async fn destroy_deleted_records(&self, table: &str, ids: &[RecordId]) -> Result<()> {
        let mut state = self.state.lock();
        let data = state.table_mut(table)?;
        for id in ids {
            if data.get(id).is_some_and(|raw| raw.status == SyncStatus::Deleted) {
                data.remove(id);
            }
        }
        Ok(())
    }

    async fn reset_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.tables = Self::empty_tables(&self.schema);
        state.cached.clear();
        state.local.clear();
        Ok(())
    }

    async fn clear_cached_records(&self, table: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.table(table)?;
        state.cached.retain(|(cached_table, _)| cached_table != table);
        Ok(())
    }

    async fn get_local(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.lock().local.get(key).cloned())
    }

    async fn set_local(&self, key: &str, value: &str) -> Result<()> {
        self.state
            .lock()
            .local
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_local(&self, key: &str) -> Result<()> {
        self.state.lock().local.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{q, QueryDescription};
    use crate::schema::{ColumnSchema, ColumnType, TableSchema};

    fn schema() -> AppSchema {
        AppSchema::new(1).with_table(TableSchema::new(
            "tasks",
            vec![ColumnSchema::new("title", ColumnType::String)],
        ))
    }

    fn raw(id: &str, title: &str) -> RawRecord {
        RawRecord {
            id: id.into(),
            status: SyncStatus::Created,
            changed: String::new(),
            last_modified: None,
            columns: [("title".to_string(), title.into())].into_iter().collect(),
        }
    }

    fn create(id: &str, title: &str) -> BatchOperation {
        BatchOperation::Create {
            table: "tasks".into(),
            raw: raw(id, title),
        }
    }

    fn all_tasks() -> SerializedQuery {
        let description = QueryDescription::build(Vec::<crate::query::Clause>::new())
            .unwrap()
            .without_deleted();
        SerializedQuery::new(&schema(), "tasks", description).unwrap()
    }

    #[tokio::test]
    async fn created_records_are_reported_as_cached() {
        let adapter = MemoryAdapter::new(schema());
        adapter.batch(vec![create("t1", "a")]).await.unwrap();

        assert_eq!(
            adapter.find("tasks", "t1").await.unwrap(),
            FindResult::Cached("t1".into())
        );

        adapter.clear_cached_records("tasks").await.unwrap();
        assert!(matches!(
            adapter.find("tasks", "t1").await.unwrap(),
            FindResult::Raw(_)
        ));
        assert_eq!(
            adapter.query(&all_tasks()).await.unwrap(),
            vec![QueryResult::Cached("t1".into())]
        );
    }

    #[tokio::test]
    async fn clearing_cached_records_is_scoped_to_one_table() {
        let schema = schema().with_table(TableSchema::new(
            "projects",
            vec![ColumnSchema::new("name", ColumnType::String)],
        ));
        let adapter = MemoryAdapter::new(schema);
        adapter
            .batch(vec![
                create("t1", "a"),
                BatchOperation::Create {
                    table: "projects".into(),
                    raw: RawRecord {
                        id: "p1".into(),
                        status: SyncStatus::Created,
                        changed: String::new(),
                        last_modified: None,
                        columns: [("name".to_string(), "inbox".into())].into_iter().collect(),
                    },
                },
            ])
            .await
            .unwrap();

        adapter.clear_cached_records("tasks").await.unwrap();
        assert!(matches!(
            adapter.find("tasks", "t1").await.unwrap(),
            FindResult::Raw(_)
        ));
        assert_eq!(
            adapter.find("projects", "p1").await.unwrap(),
            FindResult::Cached("p1".into())
        );
        assert!(matches!(
            adapter.clear_cached_records("nope").await,
            Err(Error::UnknownTable(_))
        ));
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let adapter = MemoryAdapter::new(schema());
        adapter.batch(vec![create("t1", "a")]).await.unwrap();

        let result = adapter
            .batch(vec![
                create("t2", "b"),
                BatchOperation::Update {
                    table: "tasks".into(),
                    raw: raw("missing", "x"),
                },
            ])
            .await;
        assert!(matches!(result, Err(Error::Adapter(_))));
        assert_eq!(adapter.count(&all_tasks()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn create_then_destroy_in_one_batch() {
        let adapter = MemoryAdapter::new(schema());
        adapter
            .batch(vec![
                create("t1", "a"),
                BatchOperation::DestroyPermanently {
                    table: "tasks".into(),
                    id: "t1".into(),
                },
            ])
            .await
            .unwrap();
        assert_eq!(adapter.count(&all_tasks()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deleted_records_lifecycle() {
        let adapter = MemoryAdapter::new(schema());
        adapter
            .batch(vec![create("t1", "a"), create("t2", "b")])
            .await
            .unwrap();
        adapter
            .batch(vec![BatchOperation::MarkAsDeleted {
                table: "tasks".into(),
                id: "t1".into(),
            }])
            .await
            .unwrap();

        assert_eq!(adapter.count(&all_tasks()).await.unwrap(), 1);
        assert_eq!(adapter.find("tasks", "t1").await.unwrap(), FindResult::NotFound);
        assert_eq!(
            adapter.get_deleted_records("tasks").await.unwrap(),
            vec!["t1".to_string()]
        );

        adapter
            .destroy_deleted_records("tasks", &["t1".into(), "t2".into()])
            .await
            .unwrap();
        assert!(adapter.get_deleted_records("tasks").await.unwrap().is_empty());
        assert_eq!(adapter.count(&all_tasks()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_ids_in_insertion_order() {
        let adapter = MemoryAdapter::new(schema());
        adapter
            .batch(vec![create("z", "a"), create("a", "b"), create("m", "a")])
            .await
            .unwrap();
        let description = QueryDescription::build(vec![q::where_("title", "a")])
            .unwrap()
            .without_deleted();
        let query = SerializedQuery::new(&schema(), "tasks", description).unwrap();
        assert_eq!(adapter.query_ids(&query).await.unwrap(), vec!["z", "m"]);
    }

    #[tokio::test]
    async fn local_storage_and_reset() {
        let adapter = MemoryAdapter::new(schema());
        adapter.set_local("k", "v").await.unwrap();
        assert_eq!(adapter.get_local("k").await.unwrap(), Some("v".into()));
        adapter.remove_local("k").await.unwrap();
        assert_eq!(adapter.get_local("k").await.unwrap(), None);

        adapter.set_local("k", "v").await.unwrap();
        adapter.batch(vec![create("t1", "a")]).await.unwrap();
        adapter.reset_all().await.unwrap();
        assert_eq!(adapter.get_local("k").await.unwrap(), None);
        assert_eq!(adapter.count(&all_tasks()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_table_is_an_error() {
        let adapter = MemoryAdapter::new(schema());
        assert!(matches!(
            adapter.find("nope", "x").await,
            Err(Error::UnknownTable(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_roundtrip() {
        let adapter = MemoryAdapter::new(schema());
        adapter
            .batch(vec![create("t2", "b"), create("t1", "a")])
            .await
            .unwrap();
        adapter.set_local("cursor", "42").await.unwrap();

        let json = adapter.export_snapshot().to_json().unwrap();
        let restored = MemoryAdapter::new(schema());
        restored
            .import_snapshot(MemorySnapshot::from_json(&json).unwrap())
            .unwrap();

        assert_eq!(restored.count(&all_tasks()).await.unwrap(), 2);
        assert_eq!(restored.get_local("cursor").await.unwrap(), Some("42".into()));
        assert!(matches!(
            restored.find("tasks", "t1").await.unwrap(),
            FindResult::Raw(_)
        ));
    }
}
