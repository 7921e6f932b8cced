//! Query executor for the in-memory backend.
//!
//! Evaluates a [`SerializedQuery`] the way a SQL engine would: conditions use
//! three-valued logic (a comparison involving null is *unknown*), rows are
//! kept only when the whole `where` is definitely true, booleans are stored
//! as 1/0, joins follow the query's associations with exists semantics, and
//! sort, skip and take apply last.

use crate::query::description::{Comparison, ComparisonRight, Operator, SortOrder, Where};
use crate::query::like::like_to_regex;
use crate::query::{QueryAssociation, SerializedQuery};
use crate::schema::AssociationInfo;
use crate::{error::Result, Error, RawRecord, TableName, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Rows of each table, in storage order.
pub trait RowSource {
    fn rows(&self, table: &str) -> Vec<&RawRecord>;
}

impl RowSource for HashMap<TableName, Vec<RawRecord>> {
    fn rows(&self, table: &str) -> Vec<&RawRecord> {
        self.get(table)
            .map(|rows| rows.iter().collect())
            .unwrap_or_default()
    }
}

/// Unknown is `None`.
type Truth = Option<bool>;

fn and3(values: impl IntoIterator<Item = Truth>) -> Truth {
    let mut result = Some(true);
    for value in values {
        match value {
            Some(false) => return Some(false),
            None => result = None,
            Some(true) => {}
        }
    }
    result
}

fn or3(values: impl IntoIterator<Item = Truth>) -> Truth {
    let mut result = Some(false);
    for value in values {
        match value {
            Some(true) => return Some(true),
            None => result = None,
            Some(false) => {}
        }
    }
    result
}

/// Storage representation of a value: booleans become integers.
fn stored(value: &Value) -> Value {
    match value {
        Value::Bool(b) => Value::Number(if *b { 1.0 } else { 0.0 }),
        other => other.clone(),
    }
}

/// `IS` semantics: null is null, otherwise same type and value.
fn is(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Number(l), Value::Number(r)) => l == r,
        (Value::String(l), Value::String(r)) => l == r,
        _ => false,
    }
}

fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.partial_cmp(r),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn compare(left: &Value, right: &Value, accept: fn(Ordering) -> bool) -> Truth {
    if left.is_null() || right.is_null() {
        return None;
    }
    ordering(left, right).map(accept)
}

struct Executor<'a, S: RowSource> {
    source: &'a S,
    associations: &'a [QueryAssociation],
    patterns: HashMap<String, regex::Regex>,
}

impl<'a, S: RowSource> Executor<'a, S> {
    fn pattern(&mut self, pattern: &str) -> Result<&regex::Regex> {
        if !self.patterns.contains_key(pattern) {
            self.patterns
                .insert(pattern.to_string(), like_to_regex(pattern)?);
        }
        self.patterns
            .get(pattern)
            .ok_or_else(|| Error::InvalidQuery(format!("bad LIKE pattern '{}'", pattern)))
    }

    fn eval_all(&mut self, conditions: &[Where], table: &str, row: &RawRecord) -> Result<Truth> {
        let mut results = Vec::with_capacity(conditions.len());
        for condition in conditions {
            results.push(self.eval(condition, table, row)?);
        }
        Ok(and3(results))
    }

    fn eval(&mut self, condition: &Where, table: &str, row: &RawRecord) -> Result<Truth> {
        match condition {
            Where::Where { left, comparison } => self.leaf(left, comparison, row),
            Where::And { conditions } => self.eval_all(conditions, table, row),
            Where::Or { conditions } => {
                let mut results = Vec::with_capacity(conditions.len());
                for condition in conditions {
                    results.push(self.eval(condition, table, row)?);
                }
                Ok(or3(results))
            }
            Where::On {
                table: joined,
                conditions,
            } => self.exists(table, joined, conditions, row),
            Where::Sql { .. } => Err(Error::InvalidQuery(
                "the in-memory adapter cannot execute sql clauses".into(),
            )),
        }
    }

    fn exists(
        &mut self,
        table: &str,
        joined: &str,
        conditions: &[Where],
        row: &RawRecord,
    ) -> Result<Truth> {
        let info = self
            .associations
            .iter()
            .find(|a| a.from == table && a.to == joined)
            .map(|a| a.info.clone())
            .ok_or_else(|| {
                Error::InvalidQuery(format!("no association from '{}' to '{}'", table, joined))
            })?;

        let source = self.source;
        let candidates: Vec<&RawRecord> = match &info {
            AssociationInfo::BelongsTo { key } => match row.value(key).as_ref() {
                Value::String(target) => source
                    .rows(joined)
                    .into_iter()
                    .filter(|r| &r.id == target)
                    .collect(),
                _ => Vec::new(),
            },
            AssociationInfo::HasMany { foreign_key } => source
                .rows(joined)
                .into_iter()
                .filter(|r| is(&r.value(foreign_key), &Value::String(row.id.clone())))
                .collect(),
        };

        for candidate in candidates {
            if self.eval_all(conditions, joined, candidate)? == Some(true) {
                return Ok(Some(true));
            }
        }
        Ok(Some(false))
    }

    fn leaf(&mut self, left: &str, comparison: &Comparison, row: &RawRecord) -> Result<Truth> {
        let left = stored(&row.value(left));
        let operator = comparison.operator;

        let truth = match (&comparison.right, operator) {
            (ComparisonRight::Values(values), Operator::OneOf) => {
                if left.is_null() {
                    None
                } else {
                    Some(values.iter().any(|v| is(&left, &stored(v))))
                }
            }
            (ComparisonRight::Values(values), Operator::NotIn) => {
                if left.is_null() {
                    None
                } else {
                    Some(!values.iter().any(|v| is(&left, &stored(v))))
                }
            }
            (ComparisonRight::Values(values), Operator::Between) => {
                match (&left, values.as_slice()) {
                    (Value::Null, _) => None,
                    (Value::Number(n), [Value::Number(low), Value::Number(high)]) => {
                        Some(low <= n && n <= high)
                    }
                    (_, [Value::Number(_), Value::Number(_)]) => Some(false),
                    _ => return Err(malformed(operator)),
                }
            }
            (ComparisonRight::Value(Value::String(pattern)), Operator::Like) => match &left {
                Value::Null => None,
                Value::String(s) => Some(self.pattern(pattern)?.is_match(s)),
                _ => Some(false),
            },
            (ComparisonRight::Value(Value::String(pattern)), Operator::NotLike) => match &left {
                Value::Null => None,
                Value::String(s) => Some(!self.pattern(pattern)?.is_match(s)),
                _ => Some(true),
            },
            (ComparisonRight::Value(Value::String(needle)), Operator::Includes) => match &left {
                Value::Null => None,
                Value::String(s) => Some(s.contains(needle.as_str())),
                _ => Some(false),
            },
            (ComparisonRight::Value(_) | ComparisonRight::Column(_), _)
                if !operator.takes_set() && !operator.takes_pattern() =>
            {
                let right = match &comparison.right {
                    ComparisonRight::Value(value) => stored(value),
                    ComparisonRight::Column(column) => stored(&row.value(column)),
                    ComparisonRight::Values(_) => return Err(malformed(operator)),
                };
                scalar(operator, &left, &right)
            }
            _ => return Err(malformed(operator)),
        };

        Ok(truth)
    }
}

fn scalar(operator: Operator, left: &Value, right: &Value) -> Truth {
    match operator {
        Operator::Eq => Some(is(left, right)),
        Operator::NotEq => Some(!is(left, right)),
        Operator::Gt => compare(left, right, Ordering::is_gt),
        Operator::Gte => compare(left, right, Ordering::is_ge),
        Operator::Lt => compare(left, right, Ordering::is_lt),
        Operator::Lte => compare(left, right, Ordering::is_le),
        Operator::WeakGt => or3([
            compare(left, right, Ordering::is_gt),
            Some(!left.is_null() && right.is_null()),
        ]),
        _ => None,
    }
}

fn malformed(operator: Operator) -> Error {
    Error::InvalidQuery(format!("malformed {:?} comparison", operator))
}

fn sort_rows(rows: &mut [&RawRecord], query: &SerializedQuery) {
    if query.description.sort_by.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for sort in &query.description.sort_by {
            let ordering = a.value(&sort.column).sort_cmp(&b.value(&sort.column));
            let ordering = match sort.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Run `query` against `source`, returning matching rows of the main table.
pub fn execute<'s, S: RowSource>(source: &'s S, query: &SerializedQuery) -> Result<Vec<&'s RawRecord>> {
    let mut executor = Executor {
        source,
        associations: &query.associations,
        patterns: HashMap::new(),
    };

    let mut rows = Vec::new();
    for row in source.rows(&query.table) {
        if executor.eval_all(&query.description.conditions, &query.table, row)? == Some(true) {
            rows.push(row);
        }
    }

    sort_rows(&mut rows, query);

    let skip = query.description.skip.unwrap_or(0) as usize;
    let take = query
        .description
        .take
        .map_or(usize::MAX, |take| take as usize);
    Ok(rows.into_iter().skip(skip).take(take).collect())
}

/// Number of rows `query` would return.
pub fn count<S: RowSource>(source: &S, query: &SerializedQuery) -> Result<usize> {
    execute(source, query).map(|rows| rows.len())
}
