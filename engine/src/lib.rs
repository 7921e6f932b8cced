//! # Larder Engine
//!
//! A reactive, offline-first record store.
//!
//! Applications declare an [`AppSchema`], open a [`Database`] over a
//! [`StorageAdapter`], and then read, write and observe records. The engine
//! keeps exactly one [`Record`] instance per stored row, serializes all reads
//! and writes through a [`WorkQueue`], and keeps observed queries up to date
//! after every committed batch.
//!
//! ## Core Concepts
//!
//! ### Records and batches
//!
//! Changes are *prepared* on records ([`Collection::prepare_create`],
//! [`Record::prepare_update`], ...) and then committed together with
//! [`Database::batch`]. A batch is atomic: the adapter applies all of it or
//! none of it, and nothing is observable until it has been applied.
//!
//! ### Readers and writers
//!
//! [`Database::write`] and [`Database::read`] enqueue work that runs one item
//! at a time. Batches are only accepted from the running writer's [`Action`].
//!
//! ### Queries and observation
//!
//! Queries are built from clauses (see [`q`]) and can be fetched or observed.
//! Simple queries are observed incrementally with an in-process [`Matcher`];
//! anything with joins, sorting or pagination reloads from the adapter.
//!
//! ## Quick Start
//!
//! ```rust
//! use larder_engine::{
//!     q, AppSchema, ColumnSchema, ColumnType, Database, DatabaseConfig, MemoryAdapter,
//!     TableSchema,
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> larder_engine::Result<()> {
//! // 1. Define a schema
//! let schema = AppSchema::new(1).with_table(TableSchema::new(
//!     "tasks",
//!     vec![
//!         ColumnSchema::new("title", ColumnType::String),
//!         ColumnSchema::new("done", ColumnType::Boolean),
//!     ],
//! ));
//!
//! // 2. Open a database
//! let db = Database::new(Arc::new(MemoryAdapter::new(schema)), DatabaseConfig::default())?;
//! let tasks = db.get("tasks")?;
//!
//! // 3. Write inside a writer
//! db.write("create task", {
//!     let tasks = tasks.clone();
//!     move |action| async move {
//!         tasks
//!             .create(&action, |task| {
//!                 task.set_raw("title", "Buy milk").set_raw("done", false);
//!             })
//!             .await
//!     }
//! })
//! .await?;
//!
//! // 4. Query records
//! let open = tasks.query(vec![q::where_("done", false)])?;
//! assert_eq!(open.fetch_count().await?, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence
//!
//! [`MemoryAdapter`] can export and import a [`MemorySnapshot`], serializable
//! to JSON with deterministic ordering.

pub mod adapter;
pub mod collection;
pub mod config;
pub mod database;
pub mod error;
pub mod matcher;
pub mod observation;
pub mod operation;
pub mod query;
pub mod queue;
pub mod raw_record;
pub mod record;
pub mod schema;
pub mod subscriptions;
pub mod value;

// Re-export main types at crate root
pub use adapter::{
    BatchOperation, FindResult, MemoryAdapter, MemorySnapshot, QueryResult, StorageAdapter,
};
pub use collection::{Collection, RecordCache};
pub use config::{ConfigError, DatabaseConfig};
pub use database::{Database, LocalStorage};
pub use error::{Error, Result};
pub use matcher::Matcher;
pub use observation::ReloadEvent;
pub use operation::{ChangeKind, CollectionChange, CollectionChangeSet, PendingOperation};
pub use query::{q, Clause, Query, QueryDescription, SerializedQuery, SortOrder};
pub use queue::{Action, ActionId, WorkQueue};
pub use raw_record::{RawRecord, SyncStatus};
pub use record::{Record, RecordBuilder, RecordEvent};
pub use schema::{AppSchema, AssociationInfo, ColumnSchema, ColumnType, TableSchema};
pub use subscriptions::Subscription;
pub use value::Value;

/// Type aliases for clarity
pub type RecordId = String;
pub type TableName = String;
pub type ColumnName = String;
pub type SchemaVersion = u32;
