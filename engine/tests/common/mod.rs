//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use larder_engine::{
    AppSchema, AssociationInfo, BatchOperation, ColumnSchema, ColumnType, Database,
    DatabaseConfig, Error, FindResult, MemoryAdapter, QueryResult, Record, RecordId, Result,
    SerializedQuery, StorageAdapter, TableSchema, Value,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn test_schema() -> AppSchema {
    AppSchema::new(1)
        .with_table(
            TableSchema::new(
                "tasks",
                vec![
                    ColumnSchema::new("title", ColumnType::String),
                    ColumnSchema::optional("status", ColumnType::String),
                    ColumnSchema::optional("project_id", ColumnType::String).indexed(),
                    ColumnSchema::new("position", ColumnType::Number),
                ],
            )
            .with_association("projects", AssociationInfo::belongs_to("project_id")),
        )
        .with_table(
            TableSchema::new(
                "projects",
                vec![ColumnSchema::new("name", ColumnType::String)],
            )
            .with_association("tasks", AssociationInfo::has_many("project_id")),
        )
}

/// Memory adapter that counts reads and can be told to reject batches.
pub struct InstrumentedAdapter {
    inner: MemoryAdapter,
    pub fail_batches: AtomicBool,
    pub queries: AtomicUsize,
    pub counts: AtomicUsize,
    pub batch_delay: Mutex<Option<Duration>>,
}

impl InstrumentedAdapter {
    pub fn new(schema: AppSchema) -> Self {
        Self {
            inner: MemoryAdapter::new(schema),
            fail_batches: AtomicBool::new(false),
            queries: AtomicUsize::new(0),
            counts: AtomicUsize::new(0),
            batch_delay: Mutex::new(None),
        }
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn count_calls(&self) -> usize {
        self.counts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageAdapter for InstrumentedAdapter {
    fn schema(&self) -> &AppSchema {
        self.inner.schema()
    }

    async fn find(&self, table: &str, id: &str) -> Result<FindResult> {
        self.inner.find(table, id).await
    }

    async fn query(&self, query: &SerializedQuery) -> Result<Vec<QueryResult>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.query(query).await
    }

    async fn query_ids(&self, query: &SerializedQuery) -> Result<Vec<RecordId>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.query_ids(query).await
    }

    async fn count(&self, query: &SerializedQuery) -> Result<usize> {
        self.counts.fetch_add(1, Ordering::SeqCst);
        self.inner.count(query).await
    }

    async fn batch(&self, operations: Vec<BatchOperation>) -> Result<()> {
        let delay = *self.batch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(Error::Adapter("disk full".into()));
        }
        self.inner.batch(operations).await
    }

    async fn get_deleted_records(&self, table: &str) -> Result<Vec<RecordId>> {
        self.inner.get_deleted_records(table).await
    }

    async fn destroy_deleted_records(&self, table: &str, ids: &[RecordId]) -> Result<()> {
        self.inner.destroy_deleted_records(table, ids).await
    }

    async fn reset_all(&self) -> Result<()> {
        self.inner.reset_all().await
    }

    async fn clear_cached_records(&self, table: &str) -> Result<()> {
        self.inner.clear_cached_records(table).await
    }

    async fn get_local(&self, key: &str) -> Result<Option<String>> {
        self.inner.get_local(key).await
    }

    async fn set_local(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set_local(key, value).await
    }

    async fn remove_local(&self, key: &str) -> Result<()> {
        self.inner.remove_local(key).await
    }
}

pub fn database() -> Database {
    instrumented_database(DatabaseConfig::default().with_queue_warnings(false)).0
}

pub fn instrumented_database(config: DatabaseConfig) -> (Database, Arc<InstrumentedAdapter>) {
    let adapter = Arc::new(InstrumentedAdapter::new(test_schema()));
    let db = Database::new(adapter.clone(), config).expect("valid schema");
    (db, adapter)
}

/// Create one task per `(title, status)` pair in a single writer.
pub async fn seed_tasks(db: &Database, tasks: &[(&str, Option<&str>)]) -> Vec<Record> {
    let collection = db.get("tasks").expect("tasks table");
    let tasks: Vec<(String, Value)> = tasks
        .iter()
        .map(|(title, status)| (title.to_string(), Value::from(*status)))
        .collect();
    let writer = db.clone();
    db.write("seed tasks", move |action| async move {
        let records = tasks
            .into_iter()
            .enumerate()
            .map(|(position, (title, status))| {
                collection.prepare_create(|task| {
                    task.set_raw("title", title)
                        .set_raw("status", status)
                        .set_raw("position", position as f64);
                })
            })
            .collect::<Result<Vec<_>>>()?;
        writer.batch(&action, records.clone()).await?;
        Ok(records)
    })
    .await
    .expect("seed writer")
}

/// Values pushed by a callback, awaited from the test.
pub struct Emissions<T> {
    values: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Emissions<T> {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Emissions<T> {
    pub fn new() -> Self {
        Self {
            values: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, value: T) {
        self.values.lock().push(value);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.values.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    /// Wait until at least `count` values have arrived.
    pub async fn wait_for(&self, count: usize) -> Vec<T> {
        self.wait_until(|values| values.len() >= count).await
    }

    /// Wait until `done` holds for the values received so far.
    pub async fn wait_until(&self, done: impl Fn(&[T]) -> bool) -> Vec<T> {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !done(&self.snapshot()) {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out after {} emissions", self.len());
        self.snapshot()
    }
}

pub fn ids(records: &[Record]) -> Vec<String> {
    records.iter().map(|record| record.id().to_string()).collect()
}

pub fn titles(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .map(|record| record.get_raw("title").as_str().unwrap_or_default().to_string())
        .collect()
}

/// Let spawned observation tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
