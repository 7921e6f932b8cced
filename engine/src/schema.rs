//! Schema definition and validation.
//!
//! The schema is static: it is supplied at database construction and only
//! used to validate names, sanitize raw records and resolve associations
//! for join encoding. Migrations are the adapter's business.

use crate::{error::Result, ColumnName, Error, SchemaVersion, TableName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Column names every raw record carries regardless of schema.
pub const BUILTIN_COLUMNS: [&str; 4] = ["id", "_status", "_changed", "last_modified"];

const RESERVED_NAMES: [&str; 4] = ["id", "_changed", "_status", "local_storage"];

const PROTOTYPE_NAMES: [&str; 8] = [
    "__proto__",
    "constructor",
    "prototype",
    "hasOwnProperty",
    "isPrototypeOf",
    "toString",
    "toLocaleString",
    "valueOf",
];

const STORAGE_ENGINE_NAMES: [&str; 5] = ["$loki", "rowid", "oid", "_rowid_", "sqlite_master"];

/// Check that a table or column name is safe to hand to any backend.
///
/// Rejects names that collide with object prototype properties or storage
/// engine internals, names starting with `__`, and anything that isn't
/// essentially alphanumeric. Builtin columns like `id` pass.
pub fn check_name(name: &str) -> Result<&str> {
    let invalid = |reason: &str| Error::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if PROTOTYPE_NAMES.contains(&name) {
        return Err(invalid("Object prototype property"));
    }
    let lower = name.to_lowercase();
    if STORAGE_ENGINE_NAMES.contains(&lower.as_str()) {
        return Err(invalid("reserved by a storage engine"));
    }
    if name.starts_with("__") {
        return Err(invalid("names starting with '__' are reserved"));
    }

    let mut chars = name.chars();
    let safe = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if !safe {
        return Err(invalid("names must match ^[a-zA-Z_]\\w*$"));
    }

    Ok(name)
}

/// Validate a user-declared table or column name.
fn validate_declared_name(name: &str) -> Result<()> {
    if RESERVED_NAMES.contains(&name.to_lowercase().as_str()) {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "reserved for internal columns".to_string(),
        });
    }
    check_name(name).map(|_| ())
}

/// Column types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Number,
    Boolean,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::String => write!(f, "string"),
            ColumnType::Number => write!(f, "number"),
            ColumnType::Boolean => write!(f, "boolean"),
        }
    }
}

/// Definition of a column in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSchema {
    pub name: ColumnName,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub is_optional: bool,
    #[serde(default)]
    pub is_indexed: bool,
}

impl ColumnSchema {
    /// A non-optional column.
    pub fn new(name: impl Into<ColumnName>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            is_optional: false,
            is_indexed: false,
        }
    }

    /// A column that may hold null.
    pub fn optional(name: impl Into<ColumnName>, column_type: ColumnType) -> Self {
        Self {
            is_optional: true,
            ..Self::new(name, column_type)
        }
    }

    pub fn indexed(mut self) -> Self {
        self.is_indexed = true;
        self
    }

    fn validate(&self) -> Result<()> {
        validate_declared_name(&self.name)?;

        match self.name.as_str() {
            "created_at" | "updated_at" => {
                if self.column_type != ColumnType::Number || self.is_optional {
                    return Err(Error::InvalidSchema(format!(
                        "{} must be of type number and not optional",
                        self.name
                    )));
                }
            }
            "last_modified" if self.column_type != ColumnType::Number => {
                return Err(Error::InvalidSchema(
                    "column last_modified must be of type number".to_string(),
                ));
            }
            _ => {}
        }

        Ok(())
    }
}

/// How a table relates to another one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssociationInfo {
    /// This table holds `key`, pointing at the other table's id.
    BelongsTo { key: ColumnName },
    /// The other table holds `foreign_key`, pointing at this table's id.
    HasMany {
        #[serde(rename = "foreignKey")]
        foreign_key: ColumnName,
    },
}

impl AssociationInfo {
    pub fn belongs_to(key: impl Into<ColumnName>) -> Self {
        AssociationInfo::BelongsTo { key: key.into() }
    }

    pub fn has_many(foreign_key: impl Into<ColumnName>) -> Self {
        AssociationInfo::HasMany {
            foreign_key: foreign_key.into(),
        }
    }
}

/// Schema for a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub name: TableName,
    /// Columns in declaration order
    pub columns: Vec<ColumnSchema>,
    /// Associations keyed by the related table
    #[serde(default)]
    pub associations: BTreeMap<TableName, AssociationInfo>,
}

impl TableSchema {
    pub fn new(name: impl Into<TableName>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            columns,
            associations: BTreeMap::new(),
        }
    }

    /// Builder-style method to declare an association.
    pub fn with_association(mut self, table: impl Into<TableName>, info: AssociationInfo) -> Self {
        self.associations.insert(table.into(), info);
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// Whether `name` is a declared or builtin column of this table.
    pub fn has_column(&self, name: &str) -> bool {
        BUILTIN_COLUMNS.contains(&name) || self.column(name).is_some()
    }

    pub fn association(&self, table: &str) -> Option<&AssociationInfo> {
        self.associations.get(table)
    }
}

/// Schema for the entire database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSchema {
    pub version: SchemaVersion,
    pub tables: BTreeMap<TableName, TableSchema>,
}

impl AppSchema {
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            tables: BTreeMap::new(),
        }
    }

    /// Add a table to the schema.
    pub fn add_table(&mut self, table: TableSchema) -> &mut Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Builder-style method to add a table.
    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.add_table(table);
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn require_table(&self, name: &str) -> Result<&TableSchema> {
        self.table(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    /// Validate names, special columns and associations.
    pub fn validate(&self) -> Result<()> {
        if self.version == 0 {
            return Err(Error::InvalidSchema(
                "schema version must be greater than 0".to_string(),
            ));
        }

        for (name, table) in &self.tables {
            if name != &table.name {
                return Err(Error::InvalidSchema(format!(
                    "table registered as '{}' is named '{}'",
                    name, table.name
                )));
            }
            validate_declared_name(&table.name)?;

            for (i, column) in table.columns.iter().enumerate() {
                column.validate()?;
                if table.columns[..i].iter().any(|c| c.name == column.name) {
                    return Err(Error::InvalidSchema(format!(
                        "duplicate column '{}' in table '{}'",
                        column.name, table.name
                    )));
                }
            }

            for (related, info) in &table.associations {
                let related_schema = self.require_table(related)?;
                match info {
                    AssociationInfo::BelongsTo { key } if !table.has_column(key) => {
                        return Err(Error::UnknownColumn {
                            table: table.name.clone(),
                            column: key.clone(),
                        });
                    }
                    AssociationInfo::HasMany { foreign_key }
                        if !related_schema.has_column(foreign_key) =>
                    {
                        return Err(Error::UnknownColumn {
                            table: related.clone(),
                            column: foreign_key.clone(),
                        });
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }
}
