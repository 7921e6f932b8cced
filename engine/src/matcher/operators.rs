//! Operator table for in-process evaluation.
//!
//! All functions take values already passed through [`normalize`].

use crate::Value;
use regex::Regex;
use std::borrow::Cow;
use std::cmp::Ordering;

/// Booleans compare as 1/0.
pub fn normalize(value: &Value) -> Cow<'_, Value> {
    match value {
        Value::Bool(b) => Cow::Owned(Value::Number(if *b { 1.0 } else { 0.0 })),
        other => Cow::Borrowed(other),
    }
}

/// Order of two non-null values of the same type.
fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.partial_cmp(r),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

/// Weak equality: null equals null, otherwise same type and value.
pub fn eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Number(l), Value::Number(r)) => l == r,
        (Value::String(l), Value::String(r)) => l == r,
        _ => false,
    }
}

pub fn not_eq(left: &Value, right: &Value) -> bool {
    !eq(left, right)
}

pub fn gt(left: &Value, right: &Value) -> bool {
    compare(left, right) == Some(Ordering::Greater)
}

pub fn gte(left: &Value, right: &Value) -> bool {
    matches!(
        compare(left, right),
        Some(Ordering::Greater | Ordering::Equal)
    )
}

pub fn weak_gt(left: &Value, right: &Value) -> bool {
    gt(left, right) || (!left.is_null() && right.is_null())
}

pub fn lt(left: &Value, right: &Value) -> bool {
    compare(left, right) == Some(Ordering::Less)
}

pub fn lte(left: &Value, right: &Value) -> bool {
    matches!(compare(left, right), Some(Ordering::Less | Ordering::Equal))
}

pub fn one_of(left: &Value, values: &[Value]) -> bool {
    !left.is_null() && values.iter().any(|value| eq(left, value))
}

/// `null notIn set` is false.
pub fn not_in(left: &Value, values: &[Value]) -> bool {
    !left.is_null() && !values.iter().any(|value| eq(left, value))
}

pub fn between(left: &Value, low: f64, high: f64) -> bool {
    match left {
        Value::Number(n) => low <= *n && *n <= high,
        _ => false,
    }
}

pub fn like(left: &Value, pattern: &Regex) -> bool {
    match left {
        Value::String(s) => pattern.is_match(s),
        _ => false,
    }
}

/// False, not true, when the left side is null.
pub fn not_like(left: &Value, pattern: &Regex) -> bool {
    !left.is_null() && !like(left, pattern)
}

pub fn includes(left: &Value, needle: &str) -> bool {
    match left {
        Value::String(s) => s.contains(needle),
        _ => false,
    }
}
