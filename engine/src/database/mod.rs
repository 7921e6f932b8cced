//! The database: collections, the work queue and the batch pipeline.
//!
//! # Batch pipeline
//!
//! Every mutation goes through [`Database::batch`], which runs four stages in
//! a fixed order:
//!
//! 1. translate pending operations and submit them to the adapter as one
//!    atomic batch;
//! 2. once the adapter accepted, update the record cache of every affected
//!    table;
//! 3. once every cache is updated, emit each table's change set (tables in
//!    first-appearance order), followed by that table's record-level events;
//! 4. notify database-level subscribers.
//!
//! Observers reacting to stage 4 can therefore fetch and always see caches
//! that reflect the batch.

pub mod local_storage;

use crate::adapter::{BatchOperation, StorageAdapter};
use crate::collection::{group_by_table, CollectionState};
use crate::config::DatabaseConfig;
use crate::operation::{ChangeKind, CollectionChange, CollectionChangeSet, PendingOperation};
use crate::queue::{Action, WorkQueue};
use crate::schema::AppSchema;
use crate::subscriptions::{DeliveryGate, Subscribers, Subscription};
use crate::{error::Result, Collection, Error, Record, TableName};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

pub use local_storage::LocalStorage;

pub(crate) struct DatabaseInner {
    pub(crate) adapter: Arc<dyn StorageAdapter>,
    pub(crate) schema: AppSchema,
    pub(crate) config: DatabaseConfig,
    pub(crate) collections: HashMap<TableName, Arc<CollectionState>>,
    pub(crate) queue: WorkQueue,
    /// Tables touched by each committed batch
    pub(crate) changes: Subscribers<Vec<TableName>>,
}

/// Handle to a database. Cloning is cheap and yields the same database.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("schema_version", &self.inner.schema.version)
            .field("tables", &self.inner.schema.tables.keys().collect::<Vec<_>>())
            .field("queued", &self.inner.queue.len())
            .finish()
    }
}

impl Database {
    /// Create a database over `adapter`, using the adapter's schema.
    pub fn new(adapter: Arc<dyn StorageAdapter>, config: DatabaseConfig) -> Result<Self> {
        let schema = adapter.schema().clone();
        schema.validate()?;

        let collections = schema
            .tables
            .values()
            .map(|table| (table.name.clone(), Arc::new(CollectionState::new(table.clone()))))
            .collect();

        info!(
            schema_version = schema.version,
            tables = schema.tables.len(),
            "database opened"
        );

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                adapter,
                queue: WorkQueue::new(config.warn_on_queue_contention),
                schema,
                config,
                collections,
                changes: Subscribers::new(),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<DatabaseInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<DatabaseInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn schema(&self) -> &AppSchema {
        &self.inner.schema
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.inner.adapter
    }

    /// Get the collection for `table`.
    pub fn get(&self, table: &str) -> Result<Collection> {
        self.inner
            .collections
            .get(table)
            .map(|state| Collection::new(self.clone(), state.clone()))
            .ok_or_else(|| Error::UnknownTable(table.to_string()))
    }

    pub fn local_storage(&self) -> LocalStorage {
        LocalStorage::new(self.inner.adapter.clone())
    }

    /// Queue a writer. Only writers may call [`Database::batch`].
    ///
    /// The writer is queued when this is called; the returned future only
    /// waits for its result.
    pub fn write<T, F, Fut>(&self, description: &str, work: F) -> BoxFuture<'static, Result<T>>
    where
        T: Send + 'static,
        F: FnOnce(Action) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.inner.queue.enqueue(Some(description), true, work)
    }

    /// Queue a reader. Readers may fetch but not write.
    pub fn read<T, F, Fut>(&self, description: &str, work: F) -> BoxFuture<'static, Result<T>>
    where
        T: Send + 'static,
        F: FnOnce(Action) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.inner.queue.enqueue(Some(description), false, work)
    }

    /// Commit every record's pending operation atomically.
    ///
    /// `action` must be the running writer. If the adapter rejects the batch,
    /// nothing is cached or notified and every record keeps its pending
    /// operation.
    pub async fn batch(&self, action: &Action, records: Vec<Record>) -> Result<()> {
        action.ensure_writer()?;
        let operations = self.translate(&records)?;
        if operations.is_empty() {
            return Ok(());
        }

        debug!(operations = operations.len(), "batch: submitting to adapter");
        self.inner.adapter.batch(operations).await?;

        let mut changes = Vec::with_capacity(records.len());
        for record in records {
            let Some(operation) = record.commit() else {
                continue;
            };
            if let Some(state) = self.inner.collections.get(record.table()) {
                let mut cache = state.cache.lock();
                match operation {
                    PendingOperation::Create => cache.add(record.clone()),
                    PendingOperation::Update => {}
                    PendingOperation::MarkAsDeleted | PendingOperation::DestroyPermanently => {
                        cache.delete(record.id());
                    }
                }
            }
            changes.push((
                record.table().to_string(),
                CollectionChange {
                    kind: operation.change_kind(),
                    record,
                },
            ));
        }
        debug!(changes = changes.len(), "batch: caches updated");

        let change_sets = group_by_table(changes);
        for (table, change_set) in &change_sets {
            self.notify_collection(table, change_set);
        }

        let tables: Vec<TableName> = change_sets.into_iter().map(|(table, _)| table).collect();
        debug!(?tables, "batch: notifying database subscribers");
        self.inner.changes.emit(&tables);
        Ok(())
    }

    fn translate(&self, records: &[Record]) -> Result<Vec<BatchOperation>> {
        let mut seen = HashSet::new();
        records
            .iter()
            .map(|record| {
                let invalid = |reason: &str| Error::InvalidRecordState {
                    table: record.table().to_string(),
                    id: record.id().to_string(),
                    reason: reason.to_string(),
                };

                if !record.belongs_to(&self.inner) {
                    return Err(invalid("record belongs to another database"));
                }
                if !self.inner.collections.contains_key(record.table()) {
                    return Err(Error::UnknownTable(record.table().to_string()));
                }
                if !seen.insert((record.table(), record.id())) {
                    return Err(invalid("record appears more than once in the batch"));
                }
                let operation = record
                    .pending_operation()
                    .ok_or_else(|| invalid("record has no pending operation"))?;

                let table = record.table().to_string();
                Ok(match operation {
                    PendingOperation::Create => BatchOperation::Create {
                        table,
                        raw: record.raw(),
                    },
                    PendingOperation::Update => BatchOperation::Update {
                        table,
                        raw: record.raw(),
                    },
                    PendingOperation::MarkAsDeleted => BatchOperation::MarkAsDeleted {
                        table,
                        id: record.id().to_string(),
                    },
                    PendingOperation::DestroyPermanently => BatchOperation::DestroyPermanently {
                        table,
                        id: record.id().to_string(),
                    },
                })
            })
            .collect()
    }

    /// Emit a table's change set, then the record-level events it implies.
    fn notify_collection(&self, table: &str, change_set: &CollectionChangeSet) {
        if let Some(state) = self.inner.collections.get(table) {
            state.changes.emit(change_set);
        }
        for change in change_set {
            match change.kind {
                ChangeKind::Created => {}
                ChangeKind::Updated => change.record.notify_changed(),
                ChangeKind::Destroyed => change.record.notify_destroyed(),
            }
        }
    }

    /// Call `callback` after every batch touching any of `tables`.
    pub fn subscribe<I, S>(&self, tables: I, callback: impl Fn() + Send + Sync + 'static) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<TableName>,
    {
        let watched: HashSet<TableName> = tables.into_iter().map(Into::into).collect();
        self.inner.changes.subscribe(move |changed: &Vec<TableName>| {
            if changed.iter().any(|table| watched.contains(table)) {
                callback();
            }
        })
    }

    /// Call `callback` with `None` right away, then with every change set of
    /// any of `tables`.
    pub fn with_changes_for_tables<I, S>(
        &self,
        tables: I,
        callback: impl Fn(Option<&CollectionChangeSet>) + Send + Sync + 'static,
    ) -> Result<Subscription>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let states = tables
            .into_iter()
            .map(|table| {
                let table = table.as_ref();
                self.inner
                    .collections
                    .get(table)
                    .cloned()
                    .ok_or_else(|| Error::UnknownTable(table.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let gate = DeliveryGate::default();
        let callback = Arc::new(callback);
        let initial = gate.enter();
        let subscriptions = states
            .iter()
            .map(|state| {
                let gate = gate.clone();
                let callback = callback.clone();
                state.changes.subscribe(move |changes| {
                    let _delivering = gate.enter();
                    callback(Some(changes));
                })
            })
            .collect();
        callback(None);
        drop(initial);

        Ok(Subscription::all(subscriptions))
    }

    /// Wipe the database.
    ///
    /// Rejects every queued reader/writer behind `action` with
    /// [`Error::Aborted`], clears every cache, resets the adapter, and then
    /// tells every observer that its cached records are gone.
    pub async fn unsafe_reset_database(&self, action: &Action) -> Result<()> {
        let aborted = action.abort_pending_work()?;
        info!(aborted, "resetting database");

        let cleared: Vec<(TableName, Vec<Record>)> = self
            .inner
            .schema
            .tables
            .keys()
            .filter_map(|table| {
                let state = self.inner.collections.get(table)?;
                let records = state.cache.lock().clear();
                Some((table.clone(), records))
            })
            .collect();

        self.inner.adapter.reset_all().await?;

        for (table, records) in &cleared {
            if records.is_empty() {
                continue;
            }
            let change_set: CollectionChangeSet = records
                .iter()
                .map(|record| CollectionChange {
                    record: record.clone(),
                    kind: ChangeKind::Destroyed,
                })
                .collect();
            self.notify_collection(table, &change_set);
        }

        let tables: Vec<TableName> = cleared.into_iter().map(|(table, _)| table).collect();
        self.inner.changes.emit(&tables);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::raw_record::SyncStatus;
    use crate::schema::{ColumnSchema, ColumnType, TableSchema};
    use parking_lot::Mutex;

    fn database() -> Database {
        let schema = AppSchema::new(1)
            .with_table(TableSchema::new(
                "tasks",
                vec![ColumnSchema::new("title", ColumnType::String)],
            ))
            .with_table(TableSchema::new(
                "projects",
                vec![ColumnSchema::new("name", ColumnType::String)],
            ));
        Database::new(Arc::new(MemoryAdapter::new(schema)), DatabaseConfig::default()).unwrap()
    }

    async fn create(db: &Database, table: &'static str, column: &'static str, value: &'static str) -> Record {
        let collection = db.get(table).unwrap();
        db.write("create", move |action| async move {
            collection
                .create(&action, |r| {
                    r.set_raw(column, value);
                })
                .await
        })
        .await
        .unwrap()
    }

    #[test]
    fn unknown_table() {
        let db = database();
        assert!(matches!(db.get("nope"), Err(Error::UnknownTable(_))));
        assert!(db.with_changes_for_tables(["nope"], |_| {}).is_err());
    }

    #[tokio::test]
    async fn batch_requires_the_running_writer() {
        let db = database();
        let record = db.get("tasks").unwrap().prepare_create(|_| {}).unwrap();

        let result = db
            .read("not a writer", {
                let db = db.clone();
                let record = record.clone();
                move |action| async move { db.batch(&action, vec![record]).await }
            })
            .await;
        assert!(matches!(result, Err(Error::QueueViolation(_))));

        // A settled writer's action can't be reused.
        let stale = db.write("settles", |action| async move { Ok(action) }).await.unwrap();
        assert!(matches!(
            db.batch(&stale, vec![record.clone()]).await,
            Err(Error::QueueViolation(_))
        ));
        assert_eq!(record.pending_operation(), Some(PendingOperation::Create));
    }

    #[tokio::test]
    async fn batch_rejects_unprepared_and_duplicate_records() {
        let db = database();
        let task = create(&db, "tasks", "title", "a").await;

        let result = db
            .write("unprepared", {
                let db = db.clone();
                let task = task.clone();
                move |action| async move { db.batch(&action, vec![task]).await }
            })
            .await;
        assert!(matches!(result, Err(Error::InvalidRecordState { .. })));

        task.prepare_mark_as_deleted().unwrap();
        let result = db
            .write("duplicate", {
                let db = db.clone();
                let task = task.clone();
                move |action| async move { db.batch(&action, vec![task.clone(), task]).await }
            })
            .await;
        assert!(matches!(result, Err(Error::InvalidRecordState { .. })));
        assert_eq!(task.pending_operation(), Some(PendingOperation::MarkAsDeleted));
    }

    #[tokio::test]
    async fn notifications_follow_table_order() {
        let db = database();
        let task = create(&db, "tasks", "title", "a").await;
        let log = Arc::new(Mutex::new(Vec::new()));

        let subscriptions = vec![
            db.get("tasks").unwrap().subscribe_changes({
                let log = log.clone();
                move |changes| log.lock().push(format!("tasks:{}", changes.len()))
            }),
            db.get("projects").unwrap().subscribe_changes({
                let log = log.clone();
                move |changes| log.lock().push(format!("projects:{}", changes.len()))
            }),
            db.subscribe(["tasks", "projects"], {
                let log = log.clone();
                move || log.lock().push("database".into())
            }),
        ];

        let projects = db.get("projects").unwrap();
        db.write("mixed", {
            let db = db.clone();
            move |action| async move {
                let project = projects.prepare_create(|r| {
                    r.set_raw("name", "p");
                })?;
                let update = task.prepare_update(|r| {
                    r.set_raw("title", "b");
                })?;
                db.batch(&action, vec![project, update]).await
            }
        })
        .await
        .unwrap();

        assert_eq!(*log.lock(), vec!["projects:1", "tasks:1", "database"]);
        Subscription::all(subscriptions).unsubscribe();
    }

    #[tokio::test]
    async fn with_changes_for_tables_starts_with_none() {
        let db = database();
        let log = Arc::new(Mutex::new(Vec::new()));
        let subscription = db
            .with_changes_for_tables(["tasks"], {
                let log = log.clone();
                move |changes| log.lock().push(changes.map(|c| c.len()))
            })
            .unwrap();

        create(&db, "tasks", "title", "a").await;
        create(&db, "projects", "name", "p").await;
        assert_eq!(*log.lock(), vec![None, Some(1)]);
        subscription.unsubscribe();
    }

    #[tokio::test]
    async fn reset_aborts_queued_work_and_clears_caches() {
        let db = database();
        let task = create(&db, "tasks", "title", "a").await;
        let destroyed = Arc::new(Mutex::new(false));
        let observer = task
            .observe({
                let destroyed = destroyed.clone();
                move |event| {
                    if matches!(event, crate::RecordEvent::Destroyed) {
                        *destroyed.lock() = true;
                    }
                }
            })
            .unwrap();

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let reset = db.write("reset", {
            let db = db.clone();
            move |action| async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                db.unsafe_reset_database(&action).await
            }
        });
        let queued = db.read("queued", |_| async { Ok(()) });

        started_rx.await.unwrap();
        release_tx.send(()).unwrap();
        reset.await.unwrap();

        assert_eq!(queued.await, Err(Error::Aborted));
        assert!(*destroyed.lock());
        assert!(task.is_destroyed());
        assert_eq!(task.status(), SyncStatus::Created);
        assert!(matches!(
            db.get("tasks").unwrap().find(task.id()).await,
            Err(Error::RecordNotFound { .. })
        ));
        observer.unsubscribe();
    }
}
