//! Query description: an immutable, serializable AST of query clauses.

use crate::schema::{check_name, AppSchema, AssociationInfo, TableSchema};
use crate::{error::Result, ColumnName, Error, TableName, Value};
use serde::{Deserialize, Serialize};

/// Comparison operators. Semantics are shared by every evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Eq,
    NotEq,
    Gt,
    Gte,
    /// `gt`, or true when the right side is null and the left isn't
    WeakGt,
    Lt,
    Lte,
    OneOf,
    NotIn,
    Between,
    Like,
    NotLike,
    Includes,
}

impl Operator {
    pub const ALL: [Operator; 13] = [
        Operator::Eq,
        Operator::NotEq,
        Operator::Gt,
        Operator::Gte,
        Operator::WeakGt,
        Operator::Lt,
        Operator::Lte,
        Operator::OneOf,
        Operator::NotIn,
        Operator::Between,
        Operator::Like,
        Operator::NotLike,
        Operator::Includes,
    ];

    /// Operators whose right side is a literal set.
    pub fn takes_set(&self) -> bool {
        matches!(self, Operator::OneOf | Operator::NotIn | Operator::Between)
    }

    /// Operators whose right side must be a string literal.
    pub fn takes_pattern(&self) -> bool {
        matches!(self, Operator::Like | Operator::NotLike | Operator::Includes)
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComparisonRight {
    Value(Value),
    Values(Vec<Value>),
    /// Sibling column of the same record
    Column(ColumnName),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub operator: Operator,
    pub right: ComparisonRight,
}

/// A node of the condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Where {
    Where {
        left: ColumnName,
        comparison: Comparison,
    },
    And {
        conditions: Vec<Where>,
    },
    Or {
        conditions: Vec<Where>,
    },
    /// Conditions evaluated against a related table
    On {
        table: TableName,
        conditions: Vec<Where>,
    },
    /// Backend-specific escape hatch, opaque to in-process evaluation
    Sql {
        expr: String,
    },
}

impl Where {
    /// Whether this subtree contains a join or an escape clause.
    pub fn has_join_or_escape(&self) -> bool {
        match self {
            Where::Where { .. } => false,
            Where::And { conditions } | Where::Or { conditions } => {
                conditions.iter().any(Where::has_join_or_escape)
            }
            Where::On { .. } | Where::Sql { .. } => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortBy {
    pub column: ColumnName,
    pub order: SortOrder,
}

/// Declares that `to` is joined from inside an `on(from, ..)` subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedJoin {
    pub from: TableName,
    pub to: TableName,
}

/// Anything that can appear in a clause list.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Where(Where),
    JoinTables(Vec<TableName>),
    NestedJoin(NestedJoin),
    SortBy(SortBy),
    Take(u32),
    Skip(u32),
}

impl From<Where> for Clause {
    fn from(value: Where) -> Self {
        Clause::Where(value)
    }
}

/// A validated, frozen query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescription {
    #[serde(rename = "where")]
    pub conditions: Vec<Where>,
    pub joined_tables: Vec<TableName>,
    pub nested_joins: Vec<NestedJoin>,
    pub sort_by: Vec<SortBy>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub take: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub skip: Option<u32>,
}

impl QueryDescription {
    /// Build and validate a description from a clause list.
    ///
    /// Top-level `on` clauses declare their table implicitly. An `on` nested
    /// inside `and`/`or` needs its table in a `join_tables` clause, and an `on`
    /// inside another `on` needs a matching `nested_join` clause.
    pub fn build<I, C>(clauses: I) -> Result<Self>
    where
        I: IntoIterator<Item = C>,
        C: Into<Clause>,
    {
        let mut description = QueryDescription::default();

        for clause in clauses {
            match clause.into() {
                Clause::Where(condition) => {
                    if let Where::On { table, .. } = &condition {
                        push_unique(&mut description.joined_tables, table);
                    }
                    description.conditions.push(condition);
                }
                Clause::JoinTables(tables) => {
                    for table in &tables {
                        push_unique(&mut description.joined_tables, table);
                    }
                }
                Clause::NestedJoin(join) => {
                    if !description.nested_joins.contains(&join) {
                        description.nested_joins.push(join);
                    }
                }
                Clause::SortBy(sort) => description.sort_by.push(sort),
                // Last one wins, so extended queries can override pagination.
                Clause::Take(count) => description.take = Some(count),
                Clause::Skip(count) => description.skip = Some(count),
            }
        }

        description.validate()?;
        Ok(description)
    }

    /// Clause list that builds this description again.
    pub fn clauses(&self) -> Vec<Clause> {
        let mut clauses: Vec<Clause> = self.conditions.iter().cloned().map(Clause::Where).collect();
        if !self.joined_tables.is_empty() {
            clauses.push(Clause::JoinTables(self.joined_tables.clone()));
        }
        clauses.extend(self.nested_joins.iter().cloned().map(Clause::NestedJoin));
        clauses.extend(self.sort_by.iter().cloned().map(Clause::SortBy));
        clauses.extend(self.take.map(Clause::Take));
        clauses.extend(self.skip.map(Clause::Skip));
        clauses
    }

    /// Structural validation. Called by [`QueryDescription::build`].
    pub fn validate(&self) -> Result<()> {
        if self.skip.is_some() && self.take.is_none() {
            return Err(Error::InvalidQuery(
                "skip can only be used together with take".into(),
            ));
        }
        for table in &self.joined_tables {
            check_name(table)?;
        }
        for join in &self.nested_joins {
            check_name(&join.from)?;
            check_name(&join.to)?;
        }
        for sort in &self.sort_by {
            check_name(&sort.column)?;
        }
        for condition in &self.conditions {
            self.validate_where(condition, None, true)?;
        }
        Ok(())
    }

    fn validate_where(
        &self,
        condition: &Where,
        enclosing_on: Option<&str>,
        top_level: bool,
    ) -> Result<()> {
        match condition {
            Where::Where { left, comparison } => {
                check_name(left)?;
                validate_comparison(left, comparison)
            }
            Where::And { conditions } | Where::Or { conditions } => conditions
                .iter()
                .try_for_each(|c| self.validate_where(c, enclosing_on, false)),
            Where::On { table, conditions } => {
                check_name(table)?;
                match enclosing_on {
                    Some(from) => {
                        let declared = self
                            .nested_joins
                            .iter()
                            .any(|join| join.from == from && &join.to == table);
                        if !declared {
                            return Err(Error::InvalidQuery(format!(
                                "nested join from '{}' to '{}' must be declared with nested_join",
                                from, table
                            )));
                        }
                    }
                    None if !top_level && !self.joined_tables.contains(table) => {
                        return Err(Error::InvalidQuery(format!(
                            "on('{}') inside and/or requires '{}' to be declared with join_tables",
                            table, table
                        )));
                    }
                    None => {}
                }
                if conditions.is_empty() {
                    return Err(Error::InvalidQuery(format!(
                        "on('{}') needs at least one condition",
                        table
                    )));
                }
                conditions
                    .iter()
                    .try_for_each(|c| self.validate_where(c, Some(table), false))
            }
            Where::Sql { expr } if expr.trim().is_empty() => {
                Err(Error::InvalidQuery("empty sql clause".into()))
            }
            Where::Sql { .. } => Ok(()),
        }
    }

    /// Check column references against the schema. `table` is the main table.
    pub fn validate_columns(&self, schema: &AppSchema, table: &str) -> Result<()> {
        let main = schema.require_table(table)?;
        for joined in &self.joined_tables {
            schema.require_table(joined)?;
        }
        for sort in &self.sort_by {
            require_column(main, &sort.column)?;
        }
        self.conditions
            .iter()
            .try_for_each(|c| validate_where_columns(schema, main, c))
    }

    /// Copy of this description that excludes deleted records at every level.
    pub fn without_deleted(&self) -> QueryDescription {
        let mut description = self.clone();
        description.conditions = exclude_deleted(&self.conditions);
        description
    }

    /// Whether this description joins other tables.
    pub fn has_joins(&self) -> bool {
        !self.joined_tables.is_empty() || !self.nested_joins.is_empty()
    }

    /// Tables this query depends on, main table first.
    pub fn all_tables(&self, table: &str) -> Vec<TableName> {
        let mut tables = vec![table.to_string()];
        for joined in &self.joined_tables {
            push_unique(&mut tables, joined);
        }
        for join in &self.nested_joins {
            push_unique(&mut tables, &join.to);
        }
        tables
    }

    /// Resolve the associations needed to encode this query's joins.
    pub fn associations(&self, schema: &AppSchema, table: &str) -> Result<Vec<QueryAssociation>> {
        let main = schema.require_table(table)?;
        let mut associations = Vec::new();

        for joined in &self.joined_tables {
            associations.push(resolve_association(main, joined)?);
        }
        for join in &self.nested_joins {
            let from = schema.require_table(&join.from)?;
            associations.push(resolve_association(from, &join.to)?);
        }

        Ok(associations)
    }
}

fn push_unique(tables: &mut Vec<TableName>, table: &str) {
    if !tables.iter().any(|t| t == table) {
        tables.push(table.to_string());
    }
}

fn validate_comparison(left: &str, comparison: &Comparison) -> Result<()> {
    let invalid = |reason: String| Err(Error::InvalidQuery(format!("{}: {}", left, reason)));
    let operator = comparison.operator;

    match &comparison.right {
        ComparisonRight::Column(column) => {
            check_name(column)?;
            if operator.takes_set() || operator.takes_pattern() {
                return invalid(format!("{:?} cannot compare against a column", operator));
            }
        }
        ComparisonRight::Values(values) => {
            if !operator.takes_set() {
                return invalid(format!("{:?} does not accept a list of values", operator));
            }
            if values.iter().any(Value::is_null) {
                return invalid(format!("{:?} does not accept null in its set", operator));
            }
            if operator == Operator::Between
                && (values.len() != 2 || values.iter().any(|v| v.as_f64().is_none()))
            {
                return invalid("between needs exactly two numbers".to_string());
            }
        }
        ComparisonRight::Value(value) => {
            if operator.takes_set() {
                return invalid(format!("{:?} needs a list of values", operator));
            }
            if operator.takes_pattern() && value.as_str().is_none() {
                return invalid(format!("{:?} needs a string pattern", operator));
            }
        }
    }

    Ok(())
}

fn require_column(table: &TableSchema, column: &str) -> Result<()> {
    if table.has_column(column) {
        Ok(())
    } else {
        Err(Error::UnknownColumn {
            table: table.name.clone(),
            column: column.to_string(),
        })
    }
}

fn validate_where_columns(schema: &AppSchema, table: &TableSchema, condition: &Where) -> Result<()> {
    match condition {
        Where::Where { left, comparison } => {
            require_column(table, left)?;
            if let ComparisonRight::Column(right) = &comparison.right {
                require_column(table, right)?;
            }
            Ok(())
        }
        Where::And { conditions } | Where::Or { conditions } => conditions
            .iter()
            .try_for_each(|c| validate_where_columns(schema, table, c)),
        Where::On {
            table: joined,
            conditions,
        } => {
            let joined = schema.require_table(joined)?;
            conditions
                .iter()
                .try_for_each(|c| validate_where_columns(schema, joined, c))
        }
        Where::Sql { .. } => Ok(()),
    }
}

fn not_deleted() -> Where {
    Where::Where {
        left: "_status".to_string(),
        comparison: Comparison {
            operator: Operator::NotEq,
            right: ComparisonRight::Value(Value::from("deleted")),
        },
    }
}

fn exclude_deleted(conditions: &[Where]) -> Vec<Where> {
    let mut result: Vec<Where> = conditions.iter().map(exclude_deleted_in).collect();
    result.push(not_deleted());
    result
}

fn exclude_deleted_in(condition: &Where) -> Where {
    match condition {
        Where::On { table, conditions } => Where::On {
            table: table.clone(),
            conditions: exclude_deleted(conditions),
        },
        Where::And { conditions } => Where::And {
            conditions: conditions.iter().map(exclude_deleted_in).collect(),
        },
        Where::Or { conditions } => Where::Or {
            conditions: conditions.iter().map(exclude_deleted_in).collect(),
        },
        other => other.clone(),
    }
}

/// Join metadata shipped to the adapter with a serialized query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryAssociation {
    pub from: TableName,
    pub to: TableName,
    pub info: AssociationInfo,
}

fn resolve_association(from: &TableSchema, to: &str) -> Result<QueryAssociation> {
    let info = from.association(to).ok_or_else(|| {
        Error::InvalidQuery(format!(
            "no association from '{}' to '{}' declared in the schema",
            from.name, to
        ))
    })?;
    Ok(QueryAssociation {
        from: from.name.clone(),
        to: to.to_string(),
        info: info.clone(),
    })
}

/// Self-contained query that can cross a process boundary by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedQuery {
    pub table: TableName,
    pub description: QueryDescription,
    pub associations: Vec<QueryAssociation>,
}

impl SerializedQuery {
    /// Serialize a description for `table`, resolving joins through `schema`.
    pub fn new(schema: &AppSchema, table: &str, description: QueryDescription) -> Result<Self> {
        let associations = description.associations(schema, table)?;
        Ok(Self {
            table: table.to_string(),
            description,
            associations,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidQuery(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidQuery(e.to_string()))
    }
}
