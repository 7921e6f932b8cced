//! Incremental observation of join-free, unordered queries.
//!
//! The adapter is asked once. After that, the observed list is maintained
//! from the collection's change sets using the compiled [`Matcher`].

use crate::matcher::Matcher;
use crate::operation::{ChangeKind, CollectionChangeSet};
use crate::query::QueryCore;
use crate::subscriptions::{DeliveryGate, Subscription};
use crate::{Record, RecordId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

/// The observed result with an id index, so a change costs O(1) regardless
/// of how many records are listed.
///
/// Queries observed this way have no ordering, so a removal moves the last
/// record into the gap.
#[derive(Debug, Default, Clone)]
pub struct ObservedList {
    records: Vec<Record>,
    positions: HashMap<RecordId, usize>,
}

impl ObservedList {
    pub fn new(records: Vec<Record>) -> Self {
        let positions = records
            .iter()
            .enumerate()
            .map(|(index, record)| (record.id().to_string(), index))
            .collect();
        Self { records, positions }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `record` itself, not just a record with its id, is listed.
    fn position(&self, record: &Record) -> Option<usize> {
        self.positions
            .get(record.id())
            .copied()
            .filter(|&index| self.records[index] == *record)
    }

    fn push(&mut self, record: Record) {
        self.positions
            .insert(record.id().to_string(), self.records.len());
        self.records.push(record);
    }

    fn remove(&mut self, index: usize) {
        let removed = self.records.swap_remove(index);
        self.positions.remove(removed.id());
        if let Some(moved) = self.records.get(index) {
            self.positions.insert(moved.id().to_string(), index);
        }
    }

    /// Apply a change set. Returns whether the list changed.
    pub fn apply(&mut self, changes: &CollectionChangeSet, matcher: &Matcher) -> bool {
        let mut changed = false;
        for change in changes {
            let index = self.position(&change.record);

            if change.kind == ChangeKind::Destroyed {
                if let Some(index) = index {
                    self.remove(index);
                    changed = true;
                }
                continue;
            }

            let matches = change.record.with_raw(|raw| matcher.matches(raw));
            match (index, matches) {
                (Some(index), false) => {
                    self.remove(index);
                    changed = true;
                }
                (None, true) => {
                    self.push(change.record.clone());
                    changed = true;
                }
                _ => {}
            }
        }
        changed
    }
}

#[derive(Default)]
struct SimpleState {
    /// `None` until the initial fetch resolves
    records: Option<ObservedList>,
    /// Change sets that arrived while the initial fetch was running
    buffered: Vec<CollectionChangeSet>,
    unsubscribed: bool,
}

struct SimpleObserver<F> {
    matcher: Matcher,
    always_emit: bool,
    callback: F,
    state: Mutex<SimpleState>,
    gate: DeliveryGate,
}

impl<F: Fn(&[Record])> SimpleObserver<F> {
    fn on_initial(&self, records: Vec<Record>) {
        let _delivering = self.gate.enter();
        let snapshot = {
            let mut state = self.state.lock();
            if state.unsubscribed {
                return;
            }
            let mut list = ObservedList::new(records);
            for changes in std::mem::take(&mut state.buffered) {
                list.apply(&changes, &self.matcher);
            }
            let snapshot = list.records().to_vec();
            state.records = Some(list);
            snapshot
        };
        (self.callback)(snapshot.as_slice());
    }

    fn on_changes(&self, changes: &CollectionChangeSet) {
        let _delivering = self.gate.enter();
        let snapshot = {
            let mut state = self.state.lock();
            if state.unsubscribed {
                return;
            }
            let Some(records) = state.records.as_mut() else {
                state.buffered.push(changes.clone());
                return;
            };
            let changed = records.apply(changes, &self.matcher);
            if !changed && !self.always_emit {
                return;
            }
            records.records().to_vec()
        };
        (self.callback)(snapshot.as_slice());
    }
}

/// Observe `core` incrementally.
///
/// The collection subscription is made before the initial fetch starts, and
/// change sets arriving before the fetch resolves are applied to its result.
/// With `always_emit`, every change set of the table causes an emission.
pub(crate) fn subscribe(
    core: Arc<QueryCore>,
    always_emit: bool,
    callback: impl Fn(&[Record]) + Send + Sync + 'static,
) -> Subscription {
    let matcher = match Matcher::compile(&core.description) {
        Ok(matcher) => matcher,
        Err(err) => {
            error!(table = %core.table(), error = %err, "query can't be observed incrementally");
            return Subscription::empty();
        }
    };

    let observer = Arc::new(SimpleObserver {
        matcher,
        always_emit,
        callback,
        state: Mutex::new(SimpleState::default()),
        gate: DeliveryGate::default(),
    });

    let changes = core.collection.subscribe_changes({
        let observer = observer.clone();
        move |changes| observer.on_changes(changes)
    });

    let fetch = tokio::spawn({
        let observer = observer.clone();
        async move {
            match core.fetch().await {
                Ok(records) => observer.on_initial(records),
                Err(err) => error!(table = %core.table(), error = %err, "initial query fetch failed"),
            }
        }
    });

    Subscription::new(move || {
        observer.state.lock().unsubscribed = true;
        fetch.abort();
        changes.unsubscribe();
    })
}
