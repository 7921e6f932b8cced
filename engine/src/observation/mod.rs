//! Query observation strategies.
//!
//! Which strategy a query gets depends on what the [`Matcher`](crate::matcher::Matcher)
//! can evaluate from a single record:
//!
//! - join-free queries without sorting or pagination are observed
//!   [incrementally](simple): one fetch, then change sets are matched in memory.
//! - everything else [reloads](reloading) after each batch touching any of the
//!   query's tables.
//!
//! [`columns`] and [`count`] build on these two. [`shared`] lets many
//! subscribers share one running observer.

pub mod columns;
pub mod count;
pub mod reloading;
pub mod shared;
pub mod simple;

pub use reloading::ReloadEvent;
pub use shared::{Emitter, SharedSubscribable};

use crate::matcher::can_compile;
use crate::query::QueryCore;
use crate::subscriptions::Subscription;
use crate::Record;
use std::sync::Arc;

/// Observe the records matching `core` with the cheapest strategy available.
pub(crate) fn subscribe_to_query(
    core: Arc<QueryCore>,
    callback: impl Fn(&[Record]) + Send + Sync + 'static,
) -> Subscription {
    if can_compile(&core.description) {
        simple::subscribe(core, false, callback)
    } else {
        reloading::subscribe(core, false, move |event| {
            if let ReloadEvent::Loaded(records) = event {
                callback(records);
            }
        })
    }
}
