//! Count observation.
//!
//! Queries the matcher can evaluate are counted from the incrementally
//! maintained list. Everything else is re-counted by the adapter after each
//! relevant batch, optionally coalescing bursts of batches into one re-count.

use super::simple;
use crate::matcher::can_compile;
use crate::query::QueryCore;
use crate::subscriptions::{DeliveryGate, Subscription};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Forwards only values different from the previous one.
struct Distinct<F> {
    previous: Mutex<Option<usize>>,
    callback: F,
}

impl<F: Fn(usize)> Distinct<F> {
    fn emit(&self, count: usize) {
        {
            let mut previous = self.previous.lock();
            if *previous == Some(count) {
                return;
            }
            *previous = Some(count);
        }
        (self.callback)(count);
    }
}

#[derive(Default)]
struct RecountState {
    generation: u64,
    /// A coalesced re-count is waiting for its window to close
    scheduled: bool,
    unsubscribed: bool,
}

struct Recount<F> {
    core: Arc<QueryCore>,
    throttle: Option<Duration>,
    output: Distinct<F>,
    state: Mutex<RecountState>,
    gate: DeliveryGate,
}

impl<F> Recount<F>
where
    F: Fn(usize) + Send + Sync + 'static,
{
    fn on_change(self: &Arc<Self>) {
        let Some(window) = self.throttle else {
            self.spawn_recount(None);
            return;
        };
        {
            let mut state = self.state.lock();
            if state.unsubscribed || state.scheduled {
                return;
            }
            state.scheduled = true;
        }
        self.spawn_recount(Some(window));
    }

    fn spawn_recount(self: &Arc<Self>, delay: Option<Duration>) {
        let observer = self.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
                observer.state.lock().scheduled = false;
            }
            observer.recount().await;
        });
    }

    async fn recount(&self) {
        let generation = {
            let mut state = self.state.lock();
            if state.unsubscribed {
                return;
            }
            state.generation += 1;
            state.generation
        };
        debug!(table = %self.core.table(), generation, "re-counting query");

        match self.core.fetch_count().await {
            Ok(count) => {
                let _delivering = self.gate.enter();
                {
                    let state = self.state.lock();
                    if state.unsubscribed || state.generation != generation {
                        return;
                    }
                }
                self.output.emit(count);
            }
            Err(err) => error!(table = %self.core.table(), error = %err, "query count failed"),
        }
    }
}

/// Observe the number of records matching `core`. Only distinct counts are emitted.
///
/// `throttle` only applies when the count needs the adapter: the first count
/// runs right away, and later batches schedule one re-count at the end of
/// the window.
pub(crate) fn subscribe(
    core: Arc<QueryCore>,
    throttle: Option<Duration>,
    callback: impl Fn(usize) + Send + Sync + 'static,
) -> Subscription {
    let output = Distinct {
        previous: Mutex::new(None),
        callback,
    };

    if can_compile(&core.description) {
        return simple::subscribe(core, false, move |records| output.emit(records.len()));
    }

    let observer = Arc::new(Recount {
        core: core.clone(),
        throttle,
        output,
        state: Mutex::new(RecountState::default()),
        gate: DeliveryGate::default(),
    });

    let changes = core.collection.database().subscribe(core.tables.clone(), {
        let observer = observer.clone();
        move || observer.on_change()
    });
    observer.spawn_recount(None);

    Subscription::new(move || {
        observer.state.lock().unsubscribed = true;
        changes.unsubscribe();
    })
}
