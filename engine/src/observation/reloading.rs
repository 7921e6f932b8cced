//! Observation by re-running the query.
//!
//! Used whenever the matcher can't represent the query: joins need state from
//! other tables and sorting or pagination depend on the whole result. Every
//! batch touching any of the query's tables triggers a fresh fetch.

use crate::query::QueryCore;
use crate::subscriptions::{DeliveryGate, Subscription};
use crate::{Record, RecordId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// What a reloading observer reports.
#[derive(Debug, Clone, Copy)]
pub enum ReloadEvent<'a> {
    /// A fetch has started. Only sent when requested.
    Fetching,
    Loaded(&'a [Record]),
}

#[derive(Default)]
struct ReloadState {
    previous: Option<Vec<Record>>,
    generation: u64,
    unsubscribed: bool,
    in_flight: Option<JoinHandle<()>>,
}

struct ReloadingObserver<F> {
    core: Arc<QueryCore>,
    emit_status: bool,
    callback: F,
    state: Mutex<ReloadState>,
    gate: DeliveryGate,
}

impl<F> ReloadingObserver<F>
where
    F: Fn(ReloadEvent<'_>) + Send + Sync + 'static,
{
    fn reload(self: &Arc<Self>) {
        let generation = {
            let mut state = self.state.lock();
            if state.unsubscribed {
                return;
            }
            state.generation += 1;
            state.generation
        };

        if self.emit_status {
            let _delivering = self.gate.enter();
            (self.callback)(ReloadEvent::Fetching);
        }

        debug!(table = %self.core.table(), generation, "reloading query");
        let observer = self.clone();
        let task = tokio::spawn(async move {
            let result = observer.core.fetch().await;
            observer.on_fetched(generation, result);
        });

        let mut state = self.state.lock();
        if let Some(previous) = state.in_flight.replace(task) {
            previous.abort();
        }
    }

    fn on_fetched(&self, generation: u64, result: crate::Result<Vec<Record>>) {
        let _delivering = self.gate.enter();
        let records = {
            let mut state = self.state.lock();
            // A newer fetch supersedes this one.
            if state.unsubscribed || state.generation != generation {
                return;
            }
            let records = match result {
                Ok(records) => records,
                Err(err) => {
                    error!(table = %self.core.table(), error = %err, "query reload failed");
                    return;
                }
            };
            let unchanged = !self.emit_status && state.previous.as_ref() == Some(&records);
            state.previous = Some(records.clone());
            if unchanged {
                return;
            }
            records
        };
        (self.callback)(ReloadEvent::Loaded(&records));
    }
}

/// Observe `core` by refetching after every batch touching its tables.
///
/// Identical consecutive results (same record instances in the same order)
/// are not re-emitted, unless `emit_status` is set; then every fetch is
/// announced with [`ReloadEvent::Fetching`] and every result is emitted.
pub(crate) fn subscribe(
    core: Arc<QueryCore>,
    emit_status: bool,
    callback: impl Fn(ReloadEvent<'_>) + Send + Sync + 'static,
) -> Subscription {
    let observer = Arc::new(ReloadingObserver {
        core: core.clone(),
        emit_status,
        callback,
        state: Mutex::new(ReloadState::default()),
        gate: DeliveryGate::default(),
    });

    let changes = core.collection.database().subscribe(core.tables.clone(), {
        let observer = observer.clone();
        move || observer.reload()
    });
    observer.reload();

    Subscription::new(move || {
        let in_flight = {
            let mut state = observer.state.lock();
            state.unsubscribed = true;
            state.in_flight.take()
        };
        if let Some(task) = in_flight {
            task.abort();
        }
        changes.unsubscribe();
    })
}

/// Observe the ids of matching records, refetching after every relevant batch.
pub(crate) fn subscribe_to_ids(
    core: Arc<QueryCore>,
    callback: impl Fn(&[RecordId]) + Send + Sync + 'static,
) -> Subscription {
    struct IdsState {
        generation: u64,
        unsubscribed: bool,
    }

    let state = Arc::new(Mutex::new(IdsState {
        generation: 0,
        unsubscribed: false,
    }));
    let gate = DeliveryGate::default();
    let callback = Arc::new(callback);

    let fetch: Arc<dyn Fn() + Send + Sync> = {
        let state = state.clone();
        let core = core.clone();
        Arc::new(move || {
            let generation = {
                let mut state = state.lock();
                if state.unsubscribed {
                    return;
                }
                state.generation += 1;
                state.generation
            };
            let state = state.clone();
            let core = core.clone();
            let gate = gate.clone();
            let callback = callback.clone();
            tokio::spawn(async move {
                let ids = match core.fetch_ids().await {
                    Ok(ids) => ids,
                    Err(err) => {
                        error!(table = %core.table(), error = %err, "id query failed");
                        return;
                    }
                };
                let _delivering = gate.enter();
                {
                    let state = state.lock();
                    if state.unsubscribed || state.generation != generation {
                        return;
                    }
                }
                callback(&ids);
            });
        })
    };

    let changes = core.collection.database().subscribe(core.tables.clone(), {
        let fetch = fetch.clone();
        move || fetch()
    });
    fetch();

    Subscription::new(move || {
        state.lock().unsubscribed = true;
        changes.unsubscribe();
    })
}
