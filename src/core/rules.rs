// src/core/rules.rs — Condition evaluation over named-field value maps
//
// Shared by the guard's per-user rules and the actions manager. Every operator
// is a pure function of (actual, expected); a missing field never matches.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::infra::errors::SpendGuardError;

const EPSILON: f64 = 1e-9;

/// A field value: number, text, or a list of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
    List(Vec<Value>),
}

/// Named fields a condition is evaluated against.
pub type FieldMap = BTreeMap<String, Value>;

impl Value {
    /// Numeric view. Text that parses as a number counts as numeric.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            Value::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (Value::List(_), _) | (_, Value::List(_)) => false,
            (Value::Text(a), Value::Text(b)) if a == b => true,
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => (a - b).abs() < EPSILON,
                _ => false,
            },
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => f.write_str(&format_number(*n)),
            Value::Text(s) => f.write_str(s),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                f.write_str(&parts.join(", "))
            }
        }
    }
}

/// Whole numbers print without decimals, everything else with two.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n:.2}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    In,
    Between,
    NotIn,
    Contains,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Gt => "gt",
            Operator::Lt => "lt",
            Operator::Gte => "gte",
            Operator::Lte => "lte",
            Operator::Eq => "eq",
            Operator::In => "in",
            Operator::Between => "between",
            Operator::NotIn => "not_in",
            Operator::Contains => "contains",
        }
    }

    /// Apply the operator to an actual field value and the rule's expected value.
    pub fn apply(&self, actual: &Value, expected: &Value) -> bool {
        match self {
            Operator::Gt => compare(actual, expected, |a, b| a > b),
            Operator::Lt => compare(actual, expected, |a, b| a < b),
            Operator::Gte => compare(actual, expected, |a, b| a >= b),
            Operator::Lte => compare(actual, expected, |a, b| a <= b),
            Operator::Eq => actual.loose_eq(expected),
            Operator::In => is_member(actual, expected),
            Operator::NotIn => !is_member(actual, expected),
            Operator::Between => between(actual, expected),
            Operator::Contains => contains(actual, expected),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = SpendGuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "gt" | ">" => Operator::Gt,
            "lt" | "<" => Operator::Lt,
            "gte" | ">=" => Operator::Gte,
            "lte" | "<=" => Operator::Lte,
            "eq" | "==" => Operator::Eq,
            "in" => Operator::In,
            "between" => Operator::Between,
            "not_in" => Operator::NotIn,
            "contains" => Operator::Contains,
            other => return Err(SpendGuardError::Config(format!("unknown operator '{other}'"))),
        })
    }
}

fn compare(actual: &Value, expected: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.as_number(), expected.as_number()) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

fn is_member(actual: &Value, expected: &Value) -> bool {
    match expected.as_list() {
        Some(items) => items.iter().any(|item| actual.loose_eq(item)),
        None => actual.loose_eq(expected),
    }
}

/// Inclusive range check; `expected` must be a two-number list.
fn between(actual: &Value, expected: &Value) -> bool {
    let Some(a) = actual.as_number() else {
        return false;
    };
    let Some([lo, hi]) = expected.as_list() else {
        return false;
    };
    match (lo.as_number(), hi.as_number()) {
        (Some(lo), Some(hi)) => {
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            a >= lo && a <= hi
        }
        _ => false,
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Text(haystack), Value::Text(needle)) => haystack.contains(needle.as_str()),
        (Value::List(items), needle) => items.iter().any(|item| item.loose_eq(needle)),
        _ => false,
    }
}

/// One predicate: `<field> <operator> <value>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn matches(&self, fields: &FieldMap) -> bool {
        fields
            .get(&self.field)
            .is_some_and(|actual| self.operator.apply(actual, &self.value))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.operator, self.value)
    }
}

/// AND-combine conditions. An empty list matches everything.
pub fn evaluate_all(conditions: &[Condition], fields: &FieldMap) -> bool {
    conditions.iter().all(|c| c.matches(fields))
}
