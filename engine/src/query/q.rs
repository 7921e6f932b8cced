//! Query builder functions.
//!
//! ```rust
//! use larder_engine::query::{q, QueryDescription, SortOrder};
//!
//! let description = QueryDescription::build(vec![
//!     q::where_("status", "active").into(),
//!     q::where_("priority", q::gte(3)).into(),
//!     q::sort_by("priority", SortOrder::Desc),
//!     q::take(20),
//! ])
//! .unwrap();
//! assert_eq!(description.take, Some(20));
//! ```

use super::description::{
    Clause, Comparison, ComparisonRight, NestedJoin, Operator, SortBy, SortOrder, Where,
};
use crate::{ColumnName, TableName, Value};

pub use super::like::sanitize_like_string;

macro_rules! literal_conversions {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ComparisonRight {
                fn from(value: $ty) -> Self {
                    ComparisonRight::Value(Value::from(value))
                }
            }

            impl From<$ty> for Comparison {
                fn from(value: $ty) -> Self {
                    eq(value)
                }
            }
        )*
    };
}

literal_conversions!(&str, String, f64, i32, i64, u32, bool);

impl From<Value> for ComparisonRight {
    fn from(value: Value) -> Self {
        ComparisonRight::Value(value)
    }
}

impl From<Value> for Comparison {
    fn from(value: Value) -> Self {
        eq(value)
    }
}

fn comparison(operator: Operator, right: impl Into<ComparisonRight>) -> Comparison {
    Comparison {
        operator,
        right: right.into(),
    }
}

fn set(operator: Operator, values: impl IntoIterator<Item = impl Into<Value>>) -> Comparison {
    Comparison {
        operator,
        right: ComparisonRight::Values(values.into_iter().map(Into::into).collect()),
    }
}

/// Leaf condition. A bare literal means equality.
pub fn where_(column: impl Into<ColumnName>, comparison: impl Into<Comparison>) -> Where {
    Where::Where {
        left: column.into(),
        comparison: comparison.into(),
    }
}

pub fn and(conditions: Vec<Where>) -> Where {
    Where::And { conditions }
}

pub fn or(conditions: Vec<Where>) -> Where {
    Where::Or { conditions }
}

/// Conditions on a related table.
pub fn on(table: impl Into<TableName>, conditions: Vec<Where>) -> Where {
    Where::On {
        table: table.into(),
        conditions,
    }
}

/// Shorthand for `on(table, vec![where_(column, comparison)])`.
pub fn on_column(
    table: impl Into<TableName>,
    column: impl Into<ColumnName>,
    comparison: impl Into<Comparison>,
) -> Where {
    on(table, vec![where_(column, comparison)])
}

/// Raw backend expression. In-process evaluators refuse it.
pub fn unsafe_sql(expr: impl Into<String>) -> Where {
    Where::Sql { expr: expr.into() }
}

/// Reference to a sibling column, for column-to-column comparisons.
pub fn column(name: impl Into<ColumnName>) -> ComparisonRight {
    ComparisonRight::Column(name.into())
}

pub fn eq(right: impl Into<ComparisonRight>) -> Comparison {
    comparison(Operator::Eq, right)
}

pub fn not_eq(right: impl Into<ComparisonRight>) -> Comparison {
    comparison(Operator::NotEq, right)
}

pub fn gt(right: impl Into<ComparisonRight>) -> Comparison {
    comparison(Operator::Gt, right)
}

pub fn gte(right: impl Into<ComparisonRight>) -> Comparison {
    comparison(Operator::Gte, right)
}

pub fn weak_gt(right: impl Into<ComparisonRight>) -> Comparison {
    comparison(Operator::WeakGt, right)
}

pub fn lt(right: impl Into<ComparisonRight>) -> Comparison {
    comparison(Operator::Lt, right)
}

pub fn lte(right: impl Into<ComparisonRight>) -> Comparison {
    comparison(Operator::Lte, right)
}

pub fn one_of(values: impl IntoIterator<Item = impl Into<Value>>) -> Comparison {
    set(Operator::OneOf, values)
}

pub fn not_in(values: impl IntoIterator<Item = impl Into<Value>>) -> Comparison {
    set(Operator::NotIn, values)
}

/// Inclusive numeric range.
pub fn between(left: f64, right: f64) -> Comparison {
    set(Operator::Between, [left, right])
}

pub fn like(pattern: impl Into<Value>) -> Comparison {
    comparison(Operator::Like, pattern.into())
}

pub fn not_like(pattern: impl Into<Value>) -> Comparison {
    comparison(Operator::NotLike, pattern.into())
}

/// Substring test, case-sensitive.
pub fn includes(needle: impl Into<Value>) -> Comparison {
    comparison(Operator::Includes, needle.into())
}

pub fn sort_by(column: impl Into<ColumnName>, order: SortOrder) -> Clause {
    Clause::SortBy(SortBy {
        column: column.into(),
        order,
    })
}

pub fn take(count: u32) -> Clause {
    Clause::Take(count)
}

pub fn skip(count: u32) -> Clause {
    Clause::Skip(count)
}

/// Declare tables joined from inside `and`/`or`.
pub fn join_tables(tables: impl IntoIterator<Item = impl Into<TableName>>) -> Clause {
    Clause::JoinTables(tables.into_iter().map(Into::into).collect())
}

pub fn nested_join(from: impl Into<TableName>, to: impl Into<TableName>) -> Clause {
    Clause::NestedJoin(NestedJoin {
        from: from.into(),
        to: to.into(),
    })
}
