//! Pending record operations and the change sets they produce.
//!
//! A record is prepared for exactly one operation at a time. Prepared records
//! are handed to [`Database::batch`](crate::Database::batch), which commits
//! them atomically and turns each into a [`CollectionChange`].

use crate::Record;
use serde::{Deserialize, Serialize};

/// Operation a record has been prepared for but not yet committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PendingOperation {
    Create,
    Update,
    MarkAsDeleted,
    DestroyPermanently,
}

impl PendingOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingOperation::Create => "create",
            PendingOperation::Update => "update",
            PendingOperation::MarkAsDeleted => "markAsDeleted",
            PendingOperation::DestroyPermanently => "destroyPermanently",
        }
    }

    /// The change observers see once this operation commits.
    pub fn change_kind(&self) -> ChangeKind {
        match self {
            PendingOperation::Create => ChangeKind::Created,
            PendingOperation::Update => ChangeKind::Updated,
            PendingOperation::MarkAsDeleted | PendingOperation::DestroyPermanently => {
                ChangeKind::Destroyed
            }
        }
    }

    /// Whether committing this operation removes the record from its collection.
    pub fn removes_record(&self) -> bool {
        self.change_kind() == ChangeKind::Destroyed
    }
}

impl std::fmt::Display for PendingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a record in a committed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Destroyed,
}

/// One record change inside a committed batch.
#[derive(Debug, Clone)]
pub struct CollectionChange {
    pub record: Record,
    pub kind: ChangeKind,
}

/// All changes a batch made to one collection, in batch order.
pub type CollectionChangeSet = Vec<CollectionChange>;
