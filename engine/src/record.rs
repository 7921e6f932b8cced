//! Live record instances.
//!
//! A [`Record`] is a cheap handle around shared state: cloning it yields the
//! same instance, and equality is identity. The [`RecordCache`] of each
//! collection guarantees there is at most one live instance per id.
//!
//! Records are never mutated directly. `prepare_*` methods flag a record
//! with exactly one [`PendingOperation`], and [`Database::batch`] commits it.
//!
//! [`RecordCache`]: crate::collection::RecordCache
//! [`Database::batch`]: crate::Database::batch

use crate::database::{Database, DatabaseInner};
use crate::operation::PendingOperation;
use crate::queue::Action;
use crate::raw_record::{set_raw_column_change, set_raw_sanitized, SyncStatus};
use crate::schema::{TableSchema, BUILTIN_COLUMNS};
use crate::subscriptions::{DeliveryGate, Subscribers, Subscription};
use crate::{error::Result, Collection, Error, RawRecord, RecordId, TableName, Value};
use parking_lot::{Mutex, RwLock};
use std::borrow::Cow;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// Event delivered to record observers.
#[derive(Debug, Clone)]
pub enum RecordEvent {
    /// Current state of the record, sent on subscribe and after each committed update.
    Changed(Record),
    /// The record was marked as deleted or destroyed. Nothing follows.
    Destroyed,
}

#[derive(Debug, Default)]
struct RecordState {
    committed: bool,
    pending: Option<PendingOperation>,
    /// Raw record as it was before the pending operation was prepared
    before_prepare: Option<RawRecord>,
    destroyed: bool,
    disposable: bool,
}

struct RecordInner {
    id: RecordId,
    table: TableName,
    raw: RwLock<RawRecord>,
    state: Mutex<RecordState>,
    changes: Subscribers<RecordEvent>,
    database: Weak<DatabaseInner>,
}

/// Handle to a live record.
#[derive(Clone)]
pub struct Record {
    inner: Arc<RecordInner>,
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Record")
            .field("table", &self.inner.table)
            .field("id", &self.inner.id)
            .field("status", &self.inner.raw.read().status)
            .field("pending", &state.pending)
            .finish()
    }
}

/// Identity, not structural equality.
impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Record {}

pub(crate) fn now_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as f64)
        .unwrap_or_default()
}

impl Record {
    fn with_state(
        database: Weak<DatabaseInner>,
        table: &str,
        raw: RawRecord,
        state: RecordState,
    ) -> Self {
        Self {
            inner: Arc::new(RecordInner {
                id: raw.id.clone(),
                table: table.to_string(),
                raw: RwLock::new(raw),
                state: Mutex::new(state),
                changes: Subscribers::new(),
                database,
            }),
        }
    }

    /// A record materialized from storage.
    pub(crate) fn committed(database: Weak<DatabaseInner>, table: &str, raw: RawRecord) -> Self {
        Self::with_state(
            database,
            table,
            raw,
            RecordState {
                committed: true,
                ..RecordState::default()
            },
        )
    }

    /// A new record waiting to be created by a batch.
    pub(crate) fn pending_create(
        database: Weak<DatabaseInner>,
        table: &str,
        raw: RawRecord,
    ) -> Self {
        Self::with_state(
            database,
            table,
            raw,
            RecordState {
                pending: Some(PendingOperation::Create),
                ..RecordState::default()
            },
        )
    }

    /// A read-only record that is never cached nor written.
    pub(crate) fn disposable(database: Weak<DatabaseInner>, table: &str, raw: RawRecord) -> Self {
        Self::with_state(
            database,
            table,
            raw,
            RecordState {
                disposable: true,
                ..RecordState::default()
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn table(&self) -> &str {
        &self.inner.table
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.raw.read().status
    }

    /// Value of `column`; builtin columns included, absent columns read as null.
    pub fn get_raw(&self, column: &str) -> Value {
        self.inner.raw.read().value(column).into_owned()
    }

    /// Snapshot of the raw record.
    pub fn raw(&self) -> RawRecord {
        self.inner.raw.read().clone()
    }

    /// Borrow the raw record without cloning it.
    pub fn with_raw<R>(&self, f: impl FnOnce(&RawRecord) -> R) -> R {
        f(&self.inner.raw.read())
    }

    pub fn pending_operation(&self) -> Option<PendingOperation> {
        self.inner.state.lock().pending
    }

    /// Whether the record has been persisted by a batch (or loaded from storage).
    pub fn is_committed(&self) -> bool {
        self.inner.state.lock().committed
    }

    /// Whether a batch marked this record as deleted or destroyed it.
    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    pub fn is_disposable(&self) -> bool {
        self.inner.state.lock().disposable
    }

    pub fn database(&self) -> Result<Database> {
        self.database_inner().map(Database::from_inner)
    }

    pub fn collection(&self) -> Result<Collection> {
        self.database()?.get(&self.inner.table)
    }

    pub(crate) fn belongs_to(&self, database: &Arc<DatabaseInner>) -> bool {
        std::ptr::eq(self.inner.database.as_ptr(), Arc::as_ptr(database))
    }

    fn database_inner(&self) -> Result<Arc<DatabaseInner>> {
        self.inner
            .database
            .upgrade()
            .ok_or_else(|| self.state_error("its database has been dropped"))
    }

    fn state_error(&self, reason: impl Into<String>) -> Error {
        Error::InvalidRecordState {
            table: self.inner.table.clone(),
            id: self.inner.id.clone(),
            reason: reason.into(),
        }
    }

    fn ensure_preparable(&self, state: &RecordState, operation: PendingOperation) -> Result<()> {
        if state.disposable {
            return Err(self.state_error(format!("cannot {} a disposable record", operation)));
        }
        if !state.committed {
            return Err(self.state_error(format!("cannot {} a record that isn't created yet", operation)));
        }
        if let Some(pending) = state.pending {
            return Err(self.state_error(format!(
                "cannot {}: the record is already prepared for {}",
                operation, pending
            )));
        }
        if state.destroyed || self.status() == SyncStatus::Deleted {
            return Err(self.state_error(format!("cannot {} a deleted record", operation)));
        }
        Ok(())
    }

    /// Prepare an update. `builder` edits a copy of the raw record, which replaces
    /// the live one only if every edit is valid.
    pub fn prepare_update(&self, builder: impl FnOnce(&mut RecordBuilder<'_>)) -> Result<Record> {
        let database = self.database_inner()?;
        let table = database.schema.require_table(&self.inner.table)?;
        self.ensure_preparable(&self.inner.state.lock(), PendingOperation::Update)?;

        let mut raw = self.raw();
        let mut editor = RecordBuilder::new(&mut raw, table, true);
        builder(&mut editor);
        editor.touch("updated_at");
        editor.finish()?;

        let mut state = self.inner.state.lock();
        self.ensure_preparable(&state, PendingOperation::Update)?;
        state.before_prepare = Some(std::mem::replace(&mut *self.inner.raw.write(), raw));
        state.pending = Some(PendingOperation::Update);
        Ok(self.clone())
    }

    /// Prepare a soft delete: the record stays in storage with status `deleted`
    /// until sync pushes it.
    pub fn prepare_mark_as_deleted(&self) -> Result<Record> {
        let mut state = self.inner.state.lock();
        self.ensure_preparable(&state, PendingOperation::MarkAsDeleted)?;
        let mut raw = self.inner.raw.write();
        state.before_prepare = Some(raw.clone());
        raw.status = SyncStatus::Deleted;
        state.pending = Some(PendingOperation::MarkAsDeleted);
        Ok(self.clone())
    }

    pub fn prepare_destroy_permanently(&self) -> Result<Record> {
        let mut state = self.inner.state.lock();
        self.ensure_preparable(&state, PendingOperation::DestroyPermanently)?;
        state.pending = Some(PendingOperation::DestroyPermanently);
        Ok(self.clone())
    }

    /// Discard the pending operation of a committed record, restoring the raw
    /// record it had before it was prepared.
    ///
    /// This is how a caller recovers after a batch was rejected. A record
    /// prepared for creation can't be cancelled; drop it instead.
    pub fn cancel_prepared(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        match state.pending {
            None => Err(self.state_error("nothing is prepared")),
            Some(PendingOperation::Create) => {
                Err(self.state_error("a record prepared for creation can't be cancelled"))
            }
            Some(_) => {
                if let Some(raw) = state.before_prepare.take() {
                    *self.inner.raw.write() = raw;
                }
                state.pending = None;
                Ok(())
            }
        }
    }

    /// Prepare and commit an update inside `action`.
    pub async fn update(
        &self,
        action: &Action,
        builder: impl FnOnce(&mut RecordBuilder<'_>),
    ) -> Result<()> {
        let record = self.prepare_update(builder)?;
        self.database()?.batch(action, vec![record]).await
    }

    pub async fn mark_as_deleted(&self, action: &Action) -> Result<()> {
        let record = self.prepare_mark_as_deleted()?;
        self.database()?.batch(action, vec![record]).await
    }

    pub async fn destroy_permanently(&self, action: &Action) -> Result<()> {
        let record = self.prepare_destroy_permanently()?;
        self.database()?.batch(action, vec![record]).await
    }

    /// Observe this record.
    ///
    /// `callback` receives [`RecordEvent::Changed`] immediately, again after
    /// every committed update, and [`RecordEvent::Destroyed`] once the record
    /// is deleted. Events are delivered in order.
    pub fn observe(
        &self,
        callback: impl Fn(&RecordEvent) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        {
            let state = self.inner.state.lock();
            if state.disposable || !state.committed {
                return Err(self.state_error("only committed records can be observed"));
            }
            if state.destroyed {
                drop(state);
                callback(&RecordEvent::Destroyed);
                return Ok(Subscription::empty());
            }
        }

        let gate = DeliveryGate::default();
        let callback = Arc::new(callback);
        let initial = gate.enter();
        let subscription = {
            let gate = gate.clone();
            let callback = callback.clone();
            self.inner.changes.subscribe(move |event| {
                let _delivering = gate.enter();
                callback(event);
            })
        };
        callback(&RecordEvent::Changed(self.clone()));
        drop(initial);

        Ok(subscription)
    }

    /// Clear the pending flag after the adapter accepted the batch.
    pub(crate) fn commit(&self) -> Option<PendingOperation> {
        let mut state = self.inner.state.lock();
        let operation = state.pending.take()?;
        state.before_prepare = None;
        match operation {
            PendingOperation::Create => state.committed = true,
            PendingOperation::Update => {}
            PendingOperation::MarkAsDeleted | PendingOperation::DestroyPermanently => {
                state.destroyed = true
            }
        }
        Some(operation)
    }

    pub(crate) fn notify_changed(&self) {
        self.inner.changes.emit(&RecordEvent::Changed(self.clone()));
    }

    pub(crate) fn notify_destroyed(&self) {
        self.inner.state.lock().destroyed = true;
        self.inner.changes.emit(&RecordEvent::Destroyed);
        self.inner.changes.clear();
    }

    #[cfg(test)]
    pub(crate) fn observer_count(&self) -> usize {
        self.inner.changes.len()
    }
}

/// Edits a raw record inside `prepare_create` / `prepare_update`.
///
/// Values are coerced to the column type. The first invalid edit is reported
/// when the prepare call returns.
pub struct RecordBuilder<'a> {
    raw: &'a mut RawRecord,
    table: &'a TableSchema,
    track_changes: bool,
    error: Option<Error>,
}

impl<'a> RecordBuilder<'a> {
    pub(crate) fn new(raw: &'a mut RawRecord, table: &'a TableSchema, track_changes: bool) -> Self {
        Self {
            raw,
            table,
            track_changes,
            error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.raw.id
    }

    pub fn get_raw(&self, column: &str) -> Cow<'_, Value> {
        self.raw.value(column)
    }

    pub fn set_raw(&mut self, column: &str, value: impl Into<Value>) -> &mut Self {
        if self.error.is_some() {
            return self;
        }
        if BUILTIN_COLUMNS.contains(&column) {
            self.error = Some(Error::InvalidRecordState {
                table: self.table.name.clone(),
                id: self.raw.id.clone(),
                reason: format!("column '{}' is managed by the database", column),
            });
            return self;
        }
        match self.table.column(column) {
            Some(schema) => {
                set_raw_sanitized(self.raw, schema, &value.into());
                if self.track_changes {
                    set_raw_column_change(self.raw, column);
                }
            }
            None => {
                self.error = Some(Error::UnknownColumn {
                    table: self.table.name.clone(),
                    column: column.to_string(),
                });
            }
        }
        self
    }

    /// Set a timestamp column to now, if the table declares it.
    pub(crate) fn touch(&mut self, column: &str) {
        if self.table.has_column(column) {
            self.set_raw(column, now_millis());
        }
    }

    pub(crate) fn finish(self) -> Result<()> {
        self.error.map_or(Ok(()), Err)
    }
}
