//! In-process predicate compiler.
//!
//! Compiles the `where` tree of a [`QueryDescription`] into a predicate over a
//! single [`RawRecord`], used to maintain observed result sets without asking
//! the adapter. The predicate must agree with the adapter's own evaluation for
//! every operator and every null, absent or mistyped operand.
//!
//! Only join-free, unordered, unpaginated queries compile; see [`can_compile`].

pub mod operators;

use crate::query::description::{Comparison, ComparisonRight, Operator, QueryDescription, Where};
use crate::query::like::like_to_regex;
use crate::{error::Result, ColumnName, Error, RawRecord, Value};
use regex::Regex;

/// Whether `description` can be evaluated in-process.
///
/// Joins, sorting, pagination and escape clauses need the adapter.
pub fn can_compile(description: &QueryDescription) -> bool {
    !description.has_joins()
        && description.sort_by.is_empty()
        && description.take.is_none()
        && description.skip.is_none()
        && !description.conditions.iter().any(Where::has_join_or_escape)
}

/// A compiled predicate. Cheap to evaluate, safe to share.
#[derive(Debug, Clone)]
pub struct Matcher {
    root: Node,
}

#[derive(Debug, Clone)]
enum Node {
    All(Vec<Node>),
    Any(Vec<Node>),
    Leaf { left: ColumnName, test: Test },
}

#[derive(Debug, Clone)]
enum Operand {
    Value(Value),
    Column(ColumnName),
}

#[derive(Debug, Clone)]
enum Test {
    Compare { operator: Operator, right: Operand },
    OneOf(Vec<Value>),
    NotIn(Vec<Value>),
    Between(f64, f64),
    Like(Regex),
    NotLike(Regex),
    Includes(String),
}

impl Matcher {
    /// Compile `description`. Fails for anything [`can_compile`] rejects.
    pub fn compile(description: &QueryDescription) -> Result<Self> {
        if !can_compile(description) {
            return Err(Error::InvalidQuery(
                "query with joins, sorting, pagination or sql cannot be matched in-process".into(),
            ));
        }
        let nodes = description
            .conditions
            .iter()
            .map(compile_where)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            root: Node::All(nodes),
        })
    }

    pub fn matches(&self, raw: &RawRecord) -> bool {
        evaluate(&self.root, raw)
    }
}

fn compile_where(condition: &Where) -> Result<Node> {
    match condition {
        Where::Where { left, comparison } => Ok(Node::Leaf {
            left: left.clone(),
            test: compile_comparison(comparison)?,
        }),
        Where::And { conditions } => Ok(Node::All(
            conditions.iter().map(compile_where).collect::<Result<_>>()?,
        )),
        Where::Or { conditions } => Ok(Node::Any(
            conditions.iter().map(compile_where).collect::<Result<_>>()?,
        )),
        Where::On { table, .. } => Err(Error::InvalidQuery(format!(
            "on('{}') cannot be matched in-process",
            table
        ))),
        Where::Sql { .. } => Err(Error::InvalidQuery(
            "sql clauses cannot be matched in-process".into(),
        )),
    }
}

fn compile_comparison(comparison: &Comparison) -> Result<Test> {
    let malformed = || Error::InvalidQuery(format!("malformed {:?} comparison", comparison.operator));
    let normalized = |values: &[Value]| {
        values
            .iter()
            .map(|v| operators::normalize(v).into_owned())
            .collect::<Vec<_>>()
    };

    let test = match (comparison.operator, &comparison.right) {
        (Operator::OneOf, ComparisonRight::Values(values)) => Test::OneOf(normalized(values)),
        (Operator::NotIn, ComparisonRight::Values(values)) => Test::NotIn(normalized(values)),
        (Operator::Between, ComparisonRight::Values(values)) => match values.as_slice() {
            [Value::Number(low), Value::Number(high)] => Test::Between(*low, *high),
            _ => return Err(malformed()),
        },
        (Operator::Like, ComparisonRight::Value(Value::String(pattern))) => {
            Test::Like(like_to_regex(pattern)?)
        }
        (Operator::NotLike, ComparisonRight::Value(Value::String(pattern))) => {
            Test::NotLike(like_to_regex(pattern)?)
        }
        (Operator::Includes, ComparisonRight::Value(Value::String(needle))) => {
            Test::Includes(needle.clone())
        }
        (operator, ComparisonRight::Value(value))
            if !operator.takes_set() && !operator.takes_pattern() =>
        {
            Test::Compare {
                operator,
                right: Operand::Value(operators::normalize(value).into_owned()),
            }
        }
        (operator, ComparisonRight::Column(column))
            if !operator.takes_set() && !operator.takes_pattern() =>
        {
            Test::Compare {
                operator,
                right: Operand::Column(column.clone()),
            }
        }
        _ => return Err(malformed()),
    };

    Ok(test)
}

fn evaluate(node: &Node, raw: &RawRecord) -> bool {
    match node {
        Node::All(nodes) => nodes.iter().all(|n| evaluate(n, raw)),
        Node::Any(nodes) => nodes.iter().any(|n| evaluate(n, raw)),
        Node::Leaf { left, test } => {
            let value = raw.value(left);
            let left = operators::normalize(&value);
            apply(test, &left, raw)
        }
    }
}

fn apply(test: &Test, left: &Value, raw: &RawRecord) -> bool {
    match test {
        Test::Compare { operator, right } => {
            let column_value;
            let right = match right {
                Operand::Value(value) => value,
                Operand::Column(column) => {
                    column_value = operators::normalize(&raw.value(column)).into_owned();
                    &column_value
                }
            };
            match operator {
                Operator::Eq => operators::eq(left, right),
                Operator::NotEq => operators::not_eq(left, right),
                Operator::Gt => operators::gt(left, right),
                Operator::Gte => operators::gte(left, right),
                Operator::WeakGt => operators::weak_gt(left, right),
                Operator::Lt => operators::lt(left, right),
                Operator::Lte => operators::lte(left, right),
                // Rejected at compile time.
                _ => false,
            }
        }
        Test::OneOf(values) => operators::one_of(left, values),
        Test::NotIn(values) => operators::not_in(left, values),
        Test::Between(low, high) => operators::between(left, *low, *high),
        Test::Like(pattern) => operators::like(left, pattern),
        Test::NotLike(pattern) => operators::not_like(left, pattern),
        Test::Includes(needle) => operators::includes(left, needle),
    }
}
