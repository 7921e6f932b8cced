//! Error types for the Larder engine.

use crate::{ColumnName, RecordId, TableName};
use thiserror::Error;

/// All possible errors from the Larder engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Validation errors
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("unsafe name '{name}' not allowed ({reason})")]
    InvalidName { name: String, reason: String },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("table not found: {0}")]
    UnknownTable(TableName),

    #[error("column '{column}' not found in table '{table}'")]
    UnknownColumn { table: TableName, column: ColumnName },

    // Record lifecycle errors
    #[error("invalid state for {table}#{id}: {reason}")]
    InvalidRecordState {
        table: TableName,
        id: RecordId,
        reason: String,
    },

    #[error("record not found: {table}#{id}")]
    RecordNotFound { table: TableName, id: RecordId },

    #[error("cache inconsistency for {table}#{id}: {reason}")]
    Consistency {
        table: TableName,
        id: RecordId,
        reason: String,
    },

    // Queue errors
    #[error("queue violation: {0}")]
    QueueViolation(String),

    #[error("reader/writer has been aborted because the database was reset")]
    Aborted,

    // Backend errors
    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::UnknownTable("tasks".into());
        assert_eq!(err.to_string(), "table not found: tasks");

        let err = Error::InvalidName {
            name: "__proto__".into(),
            reason: "Object prototype property".into(),
        };
        assert_eq!(
            err.to_string(),
            "unsafe name '__proto__' not allowed (Object prototype property)"
        );

        let err = Error::Consistency {
            table: "tasks".into(),
            id: "t1".into(),
            reason: "adapter returned a cached id".into(),
        };
        assert_eq!(
            err.to_string(),
            "cache inconsistency for tasks#t1: adapter returned a cached id"
        );
    }

    #[test]
    fn aborted_is_distinct() {
        assert_ne!(Error::Aborted, Error::QueueViolation("aborted".into()));
    }
}
