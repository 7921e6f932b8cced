//! Raw records: the per-record column map exchanged with adapters.

use crate::schema::{ColumnSchema, ColumnType, TableSchema};
use crate::{ColumnName, RecordId, Value};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Per-record lifecycle tag, distinct from cache presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    #[default]
    Created,
    Updated,
    Deleted,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Created => "created",
            SyncStatus::Updated => "updated",
            SyncStatus::Deleted => "deleted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "synced" => Some(SyncStatus::Synced),
            "created" => Some(SyncStatus::Created),
            "updated" => Some(SyncStatus::Updated),
            "deleted" => Some(SyncStatus::Deleted),
            _ => None,
        }
    }
}

/// A record's stored columns plus sync bookkeeping.
///
/// Serializes as a flat object: `{"id", "_status", "_changed", "last_modified", ...columns}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: RecordId,
    #[serde(rename = "_status")]
    pub status: SyncStatus,
    /// Comma-separated names of columns changed since the last sync
    #[serde(rename = "_changed")]
    pub changed: String,
    pub last_modified: Option<f64>,
    #[serde(flatten)]
    pub columns: BTreeMap<ColumnName, Value>,
}

impl RawRecord {
    /// Look up any column by name, including the builtin ones.
    ///
    /// Absent columns read as null.
    pub fn value(&self, column: &str) -> Cow<'_, Value> {
        match column {
            "id" => Cow::Owned(Value::String(self.id.clone())),
            "_status" => Cow::Owned(Value::String(self.status.as_str().to_string())),
            "_changed" => Cow::Owned(Value::String(self.changed.clone())),
            "last_modified" => Cow::Owned(self.last_modified.map_or(Value::Null, Value::Number)),
            _ => self
                .columns
                .get(column)
                .map_or(Cow::Owned(Value::Null), Cow::Borrowed),
        }
    }

    /// Like [`RawRecord::value`] but distinguishes an absent column.
    pub fn get(&self, column: &str) -> Option<Cow<'_, Value>> {
        match column {
            "id" | "_status" | "_changed" | "last_modified" => Some(self.value(column)),
            _ => self.columns.get(column).map(Cow::Borrowed),
        }
    }

    pub fn changed_columns(&self) -> impl Iterator<Item = &str> {
        self.changed.split(',').filter(|c| !c.is_empty())
    }

    /// Flat JSON object view.
    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        object.insert("id".into(), serde_json::Value::String(self.id.clone()));
        object.insert("_status".into(), self.status.as_str().into());
        object.insert("_changed".into(), self.changed.clone().into());
        object.insert(
            "last_modified".into(),
            Value::from(self.last_modified).to_json(),
        );
        for (column, value) in &self.columns {
            object.insert(column.clone(), value.to_json());
        }
        serde_json::Value::Object(object)
    }
}

/// Generate a fresh record id.
pub fn random_id() -> RecordId {
    uuid::Uuid::new_v4().simple().to_string()
}

fn sanitize_value(value: Option<&Value>, column: &ColumnSchema) -> Value {
    let fallback = |default: Value| {
        if column.is_optional {
            Value::Null
        } else {
            default
        }
    };

    match column.column_type {
        ColumnType::String => match value {
            Some(Value::String(s)) => Value::String(s.clone()),
            _ => fallback(Value::String(String::new())),
        },
        ColumnType::Boolean => match value {
            Some(Value::Bool(b)) => Value::Bool(*b),
            Some(Value::Number(n)) if *n == 1.0 || *n == 0.0 => Value::Bool(*n == 1.0),
            _ => fallback(Value::Bool(false)),
        },
        ColumnType::Number => match value {
            Some(Value::Number(n)) if n.is_finite() => Value::Number(*n),
            _ => fallback(Value::Number(0.0)),
        },
    }
}

/// Build a well-formed raw record from arbitrary column data.
///
/// Missing or malformed ids get a fresh random id and `created` status.
/// Every schema column is coerced to its declared type; unknown keys are dropped.
pub fn sanitized_raw(dirty: &BTreeMap<String, Value>, table: &TableSchema) -> RawRecord {
    let (id, status, changed, last_modified) = match dirty.get("id") {
        Some(Value::String(id)) => (
            id.clone(),
            dirty
                .get("_status")
                .and_then(Value::as_str)
                .and_then(SyncStatus::parse)
                .unwrap_or(SyncStatus::Created),
            dirty
                .get("_changed")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            dirty
                .get("last_modified")
                .and_then(Value::as_f64)
                .filter(|n| n.is_finite()),
        ),
        _ => (random_id(), SyncStatus::Created, String::new(), None),
    };

    let columns = table
        .columns
        .iter()
        .map(|column| {
            (
                column.name.clone(),
                sanitize_value(dirty.get(&column.name), column),
            )
        })
        .collect();

    RawRecord {
        id,
        status,
        changed,
        last_modified,
        columns,
    }
}

/// Build dirty column data from a JSON object. Nested values are dropped.
pub fn dirty_from_json(json: &serde_json::Value) -> BTreeMap<String, Value> {
    json.as_object()
        .map(|object| {
            object
                .iter()
                .filter_map(|(key, value)| Value::from_json(value).map(|v| (key.clone(), v)))
                .collect()
        })
        .unwrap_or_default()
}

/// Set a column, coercing the value to the column's type.
pub fn set_raw_sanitized(raw: &mut RawRecord, column: &ColumnSchema, value: &Value) {
    raw.columns
        .insert(column.name.clone(), sanitize_value(Some(value), column));
}

/// Record that `column` changed since the last sync.
pub fn set_raw_column_change(raw: &mut RawRecord, column: &str) {
    if raw.status == SyncStatus::Synced {
        raw.status = SyncStatus::Updated;
    }
    if !raw.changed_columns().any(|c| c == column) {
        if !raw.changed.is_empty() {
            raw.changed.push(',');
        }
        raw.changed.push_str(column);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;

    fn tasks() -> TableSchema {
        TableSchema::new(
            "tasks",
            vec![
                ColumnSchema::new("title", ColumnType::String),
                ColumnSchema::optional("note", ColumnType::String),
                ColumnSchema::new("is_done", ColumnType::Boolean),
                ColumnSchema::optional("priority", ColumnType::Number),
                ColumnSchema::new("position", ColumnType::Number),
            ],
        )
    }

    fn dirty(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn sanitizes_missing_columns() {
        let raw = sanitized_raw(&BTreeMap::new(), &tasks());
        assert!(!raw.id.is_empty());
        assert_eq!(raw.status, SyncStatus::Created);
        assert_eq!(raw.value("title").into_owned(), Value::from(""));
        assert_eq!(raw.value("note").into_owned(), Value::Null);
        assert_eq!(raw.value("is_done").into_owned(), Value::Bool(false));
        assert_eq!(raw.value("priority").into_owned(), Value::Null);
        assert_eq!(raw.value("position").into_owned(), Value::Number(0.0));
    }

    #[test]
    fn keeps_valid_bookkeeping() {
        let raw = sanitized_raw(
            &dirty(&[
                ("id", "t1".into()),
                ("_status", "synced".into()),
                ("_changed", "title".into()),
                ("last_modified", Value::Number(10.0)),
                ("is_done", Value::Number(1.0)),
                ("position", Value::Number(f64::INFINITY)),
                ("bogus", "x".into()),
            ]),
            &tasks(),
        );
        assert_eq!(raw.id, "t1");
        assert_eq!(raw.status, SyncStatus::Synced);
        assert_eq!(raw.changed, "title");
        assert_eq!(raw.last_modified, Some(10.0));
        assert_eq!(raw.value("is_done").into_owned(), Value::Bool(true));
        assert_eq!(raw.value("position").into_owned(), Value::Number(0.0));
        assert!(raw.get("bogus").is_none());
    }

    #[test]
    fn invalid_status_defaults_to_created() {
        let raw = sanitized_raw(
            &dirty(&[("id", "t1".into()), ("_status", "weird".into())]),
            &tasks(),
        );
        assert_eq!(raw.status, SyncStatus::Created);
    }

    #[test]
    fn column_change_tracking() {
        let mut raw = sanitized_raw(
            &dirty(&[("id", "t1".into()), ("_status", "synced".into())]),
            &tasks(),
        );
        set_raw_column_change(&mut raw, "title");
        set_raw_column_change(&mut raw, "is_done");
        set_raw_column_change(&mut raw, "title");
        assert_eq!(raw.status, SyncStatus::Updated);
        assert_eq!(raw.changed, "title,is_done");
    }

    #[test]
    fn flat_serde_shape() {
        let raw = sanitized_raw(
            &dirty(&[("id", "t1".into()), ("title", "Buy milk".into())]),
            &tasks(),
        );
        let json = serde_json::to_value(&raw).unwrap();
        assert_eq!(json["id"], "t1");
        assert_eq!(json["_status"], "created");
        assert_eq!(json["title"], "Buy milk");
        assert_eq!(json, raw.to_json());

        let back: RawRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn builtin_lookup() {
        let raw = sanitized_raw(&dirty(&[("id", "t1".into())]), &tasks());
        assert_eq!(raw.value("id").into_owned(), Value::from("t1"));
        assert_eq!(raw.value("_status").into_owned(), Value::from("created"));
        assert_eq!(raw.value("missing").into_owned(), Value::Null);
    }
}
