//! Queries: descriptions bound to a collection.
//!
//! A [`Query`] is built from a clause list (see [`q`]) and is immutable. It
//! can be fetched once or observed. Observation shares one underlying source
//! between all subscribers of the same `Query` value and replays the latest
//! result to late subscribers.

pub mod description;
pub mod like;
pub mod q;

use crate::matcher::can_compile;
use crate::observation::{self, SharedSubscribable};
use crate::subscriptions::Subscription;
use crate::{error::Result, Action, Collection, ColumnName, Error, Record, RecordId, TableName};
use std::sync::Arc;

pub use description::{
    Clause, Comparison, ComparisonRight, NestedJoin, Operator, QueryAssociation,
    QueryDescription, SerializedQuery, SortBy, SortOrder, Where,
};

/// The parts of a query observation sources need.
pub(crate) struct QueryCore {
    pub(crate) collection: Collection,
    pub(crate) raw_description: QueryDescription,
    /// `raw_description` with deleted records excluded
    pub(crate) description: QueryDescription,
    pub(crate) serialized: SerializedQuery,
    pub(crate) tables: Vec<TableName>,
}

impl QueryCore {
    pub(crate) fn table(&self) -> &str {
        self.collection.table()
    }

    pub(crate) async fn fetch(&self) -> Result<Vec<Record>> {
        self.collection.fetch_query(&self.serialized).await
    }

    pub(crate) async fn fetch_ids(&self) -> Result<Vec<RecordId>> {
        self.collection
            .database()
            .adapter()
            .query_ids(&self.serialized)
            .await
    }

    pub(crate) async fn fetch_count(&self) -> Result<usize> {
        self.collection
            .database()
            .adapter()
            .count(&self.serialized)
            .await
    }
}

struct Observers {
    records: SharedSubscribable<Vec<Record>>,
    count: SharedSubscribable<usize>,
    throttled_count: SharedSubscribable<usize>,
}

/// An immutable query on one collection.
#[derive(Clone)]
pub struct Query {
    core: Arc<QueryCore>,
    observers: Arc<Observers>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("table", &self.core.table())
            .field("description", &self.core.raw_description)
            .finish()
    }
}

impl Query {
    pub(crate) fn new<I, C>(collection: Collection, clauses: I) -> Result<Self>
    where
        I: IntoIterator<Item = C>,
        C: Into<Clause>,
    {
        let raw_description = QueryDescription::build(clauses)?;
        let schema = collection.database().schema();
        raw_description.validate_columns(schema, collection.table())?;

        let description = raw_description.without_deleted();
        let serialized = SerializedQuery::new(schema, collection.table(), description.clone())?;
        let tables = raw_description.all_tables(collection.table());

        let core = Arc::new(QueryCore {
            collection,
            raw_description,
            description,
            serialized,
            tables,
        });
        Ok(Self {
            observers: Arc::new(Observers::new(&core)),
            core,
        })
    }

    pub fn collection(&self) -> &Collection {
        &self.core.collection
    }

    pub fn table(&self) -> &str {
        self.core.table()
    }

    /// The description as built, without the implicit deleted-record filter.
    pub fn raw_description(&self) -> &QueryDescription {
        &self.core.raw_description
    }

    /// The description that actually runs.
    pub fn description(&self) -> &QueryDescription {
        &self.core.description
    }

    /// Self-contained form handed to the adapter.
    pub fn serialize(&self) -> &SerializedQuery {
        &self.core.serialized
    }

    /// Every table whose changes can affect the result, main table first.
    pub fn all_tables(&self) -> &[TableName] {
        &self.core.tables
    }

    /// Whether observation can be maintained in-process.
    pub fn is_incremental(&self) -> bool {
        can_compile(&self.core.description)
    }

    /// A new query with `clauses` appended. A later `take`/`skip` replaces an earlier one.
    pub fn extend<I, C>(&self, clauses: I) -> Result<Query>
    where
        I: IntoIterator<Item = C>,
        C: Into<Clause>,
    {
        let mut all = self.core.raw_description.clauses();
        all.extend(clauses.into_iter().map(Into::into));
        Query::new(self.core.collection.clone(), all)
    }

    pub async fn fetch(&self) -> Result<Vec<Record>> {
        self.core.fetch().await
    }

    pub async fn fetch_ids(&self) -> Result<Vec<RecordId>> {
        self.core.fetch_ids().await
    }

    pub async fn fetch_count(&self) -> Result<usize> {
        self.core.fetch_count().await
    }

    /// Observe the matching records.
    ///
    /// `callback` receives the full list after the initial fetch and after
    /// every change to it. Requires a tokio runtime.
    pub fn observe(
        &self,
        callback: impl Fn(&[Record]) + Send + Sync + 'static,
    ) -> Subscription {
        self.observers
            .records
            .subscribe(move |records: &Vec<Record>| callback(records.as_slice()))
    }

    /// Observe the ids of matching records, refetched after every batch
    /// touching any of [`Query::all_tables`].
    pub fn observe_ids(
        &self,
        callback: impl Fn(&[RecordId]) + Send + Sync + 'static,
    ) -> Subscription {
        observation::reloading::subscribe_to_ids(self.core.clone(), callback)
    }

    /// Like [`Query::observe`], but also emits when any of `columns` changes
    /// on a listed record.
    pub fn observe_with_columns(
        &self,
        columns: &[&str],
        callback: impl Fn(&[Record]) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        let schema = self.core.collection.schema();
        let columns = columns
            .iter()
            .map(|column| {
                if schema.has_column(column) {
                    Ok(ColumnName::from(*column))
                } else {
                    Err(Error::UnknownColumn {
                        table: schema.name.clone(),
                        column: column.to_string(),
                    })
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(observation::columns::subscribe(
            self.core.clone(),
            columns,
            callback,
        ))
    }

    /// Observe the number of matching records. Only distinct values are emitted.
    ///
    /// When `throttled` and the count needs the adapter, bursts of changes
    /// within the configured window cause a single re-count.
    pub fn observe_count(
        &self,
        throttled: bool,
        callback: impl Fn(usize) + Send + Sync + 'static,
    ) -> Subscription {
        let source = if throttled {
            &self.observers.throttled_count
        } else {
            &self.observers.count
        };
        source.subscribe(move |count: &usize| callback(*count))
    }

    /// Mark every matching record as deleted in one batch.
    pub async fn mark_all_as_deleted(&self, action: &Action) -> Result<()> {
        action.ensure_writer()?;
        let records = self.fetch().await?;
        let prepared = prepare_all(&records, Record::prepare_mark_as_deleted)?;
        self.core.collection.database().batch(action, prepared).await
    }

    /// Permanently destroy every matching record in one batch.
    pub async fn destroy_all_permanently(&self, action: &Action) -> Result<()> {
        action.ensure_writer()?;
        let records = self.fetch().await?;
        let prepared = prepare_all(&records, Record::prepare_destroy_permanently)?;
        self.core.collection.database().batch(action, prepared).await
    }
}

/// Prepare every record or none: on the first failure, the records prepared
/// so far are cancelled.
fn prepare_all(
    records: &[Record],
    prepare: impl Fn(&Record) -> Result<Record>,
) -> Result<Vec<Record>> {
    let mut prepared = Vec::with_capacity(records.len());
    for record in records {
        match prepare(record) {
            Ok(record) => prepared.push(record),
            Err(err) => {
                for record in &prepared {
                    record.cancel_prepared()?;
                }
                return Err(err);
            }
        }
    }
    Ok(prepared)
}

impl Observers {
    fn new(core: &Arc<QueryCore>) -> Self {
        let throttle = core.collection.database().config().count_throttle;
        Self {
            records: SharedSubscribable::new({
                let core = core.clone();
                move |emitter| {
                    observation::subscribe_to_query(core.clone(), move |records| {
                        emitter.emit(records.to_vec())
                    })
                }
            }),
            count: SharedSubscribable::new({
                let core = core.clone();
                move |emitter| {
                    observation::count::subscribe(core.clone(), None, move |count| emitter.emit(count))
                }
            }),
            throttled_count: SharedSubscribable::new({
                let core = core.clone();
                move |emitter| {
                    observation::count::subscribe(core.clone(), throttle, move |count| {
                        emitter.emit(count)
                    })
                }
            }),
        }
    }
}
