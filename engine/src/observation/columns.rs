//! List observation that also reacts to column changes.
//!
//! A plain list observer only emits when the membership of the list changes.
//! This one also emits when a record already on the list changes one of the
//! watched columns, so views rendering those columns can refresh.

use super::reloading::{self, ReloadEvent};
use super::simple;
use crate::matcher::can_compile;
use crate::operation::{ChangeKind, CollectionChangeSet};
use crate::query::QueryCore;
use crate::subscriptions::{DeliveryGate, Subscription};
use crate::{ColumnName, Record, RecordId, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

struct ColumnsState {
    /// Column-only changes are held back while the source is fetching
    source_is_fetching: bool,
    has_pending_column_changes: bool,
    first_emission: bool,
    observed: Vec<Record>,
    column_values: HashMap<RecordId, Vec<Value>>,
    unsubscribed: bool,
}

struct ColumnsObserver<F> {
    columns: Vec<ColumnName>,
    async_source: bool,
    callback: F,
    state: Mutex<ColumnsState>,
    gate: DeliveryGate,
}

impl<F: Fn(&[Record])> ColumnsObserver<F> {
    fn column_values(&self, record: &Record) -> Vec<Value> {
        self.columns
            .iter()
            .map(|column| record.get_raw(column))
            .collect()
    }

    fn on_collection_changes(&self, changes: &CollectionChangeSet) {
        let _delivering = self.gate.enter();
        let snapshot = {
            let mut state = self.state.lock();
            if state.unsubscribed {
                return;
            }

            // Every change is visited so the stored values stay current.
            let mut has_column_changes = false;
            for change in changes {
                if change.kind != ChangeKind::Updated {
                    continue;
                }
                let values = self.column_values(&change.record);
                let Some(previous) = state.column_values.get_mut(change.record.id()) else {
                    continue;
                };
                if *previous != values {
                    *previous = values;
                    has_column_changes = true;
                }
            }

            if !has_column_changes {
                return;
            }
            // A synchronous source emits right after this with the final
            // list; emitting here as well would double up.
            if state.source_is_fetching || !self.async_source {
                state.has_pending_column_changes = true;
                return;
            }
            state.observed.clone()
        };
        (self.callback)(snapshot.as_slice());
    }

    fn on_source_fetching(&self) {
        self.state.lock().source_is_fetching = true;
    }

    fn on_source_records(&self, records: &[Record]) {
        let _delivering = self.gate.enter();
        {
            let mut state = self.state.lock();
            if state.unsubscribed {
                return;
            }
            state.source_is_fetching = false;

            let should_emit = state.first_emission
                || state.has_pending_column_changes
                || state.observed.as_slice() != records;
            state.has_pending_column_changes = false;
            state.first_emission = false;

            state
                .column_values
                .retain(|id, _| records.iter().any(|record| record.id() == id));
            for record in records {
                if !state.column_values.contains_key(record.id()) {
                    let values = self.column_values(record);
                    state.column_values.insert(record.id().to_string(), values);
                }
            }
            state.observed = records.to_vec();

            if !should_emit {
                return;
            }
        }
        (self.callback)(records);
    }
}

/// Observe the records matching `core`, re-emitting when any of `columns`
/// changes on a record in the list.
pub(crate) fn subscribe(
    core: Arc<QueryCore>,
    columns: Vec<ColumnName>,
    callback: impl Fn(&[Record]) + Send + Sync + 'static,
) -> Subscription {
    let sync_source = can_compile(&core.description);
    let observer = Arc::new(ColumnsObserver {
        columns,
        async_source: !sync_source,
        callback,
        state: Mutex::new(ColumnsState {
            source_is_fetching: true,
            has_pending_column_changes: false,
            first_emission: true,
            observed: Vec::new(),
            column_values: HashMap::new(),
            unsubscribed: false,
        }),
        gate: DeliveryGate::default(),
    });

    // Registered before the source so column diffs are taken before the
    // source reacts to the same batch.
    let changes = core.collection.subscribe_changes({
        let observer = observer.clone();
        move |changes| observer.on_collection_changes(changes)
    });

    let source = if sync_source {
        let observer = observer.clone();
        simple::subscribe(core, true, move |records| {
            observer.on_source_records(records)
        })
    } else {
        let observer = observer.clone();
        reloading::subscribe(core, true, move |event| match event {
            ReloadEvent::Fetching => observer.on_source_fetching(),
            ReloadEvent::Loaded(records) => observer.on_source_records(records),
        })
    };

    Subscription::new(move || {
        observer.state.lock().unsubscribed = true;
        source.unsubscribe();
        changes.unsubscribe();
    })
}
