//! Typed values and operators for decision-table rule matching.
//!
//! Numeric literals are exact base-10 decimals, never binary floats. When a
//! decimal literal is compared against a non-decimal input the comparison
//! still proceeds (text is coerced when it parses losslessly), but a warning
//! is emitted because implicit float/decimal mixing is a classic source of
//! silent rule mismatches.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// A condition operator in a decision-table cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleOperator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl fmt::Display for RuleOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            RuleOperator::Eq => "==",
            RuleOperator::Ne => "!=",
            RuleOperator::Lt => "<",
            RuleOperator::Le => "<=",
            RuleOperator::Gt => ">",
            RuleOperator::Ge => ">=",
            RuleOperator::In => "in",
            RuleOperator::NotIn => "not in",
        };
        f.write_str(symbol)
    }
}

/// A pre-parsed rule value: either a table literal or a resolved input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RuleValue {
    Null,
    Bool(bool),
    Decimal(Decimal),
    Text(String),
    List(Vec<RuleValue>),
}

impl RuleValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            RuleValue::Null => "null",
            RuleValue::Bool(_) => "bool",
            RuleValue::Decimal(_) => "decimal",
            RuleValue::Text(_) => "text",
            RuleValue::List(_) => "list",
        }
    }

    /// Lossless view of this value as a decimal, if one exists.
    fn as_decimal(&self) -> Option<Decimal> {
        match self {
            RuleValue::Decimal(d) => Some(*d),
            RuleValue::Text(t) => Decimal::from_str(t.trim()).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for RuleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleValue::Null => f.write_str("null"),
            RuleValue::Bool(b) => write!(f, "{b}"),
            RuleValue::Decimal(d) => write!(f, "{d}"),
            RuleValue::Text(t) => write!(f, "'{t}'"),
            RuleValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<Decimal> for RuleValue {
    fn from(d: Decimal) -> Self {
        RuleValue::Decimal(d)
    }
}

impl From<i64> for RuleValue {
    fn from(n: i64) -> Self {
        RuleValue::Decimal(Decimal::from(n))
    }
}

impl From<&str> for RuleValue {
    fn from(s: &str) -> Self {
        RuleValue::Text(s.to_string())
    }
}

impl From<bool> for RuleValue {
    fn from(b: bool) -> Self {
        RuleValue::Bool(b)
    }
}

impl TryFrom<&serde_json::Value> for RuleValue {
    type Error = ValueError;

    fn try_from(value: &serde_json::Value) -> Result<Self, ValueError> {
        match value {
            serde_json::Value::Null => Ok(RuleValue::Null),
            serde_json::Value::Bool(b) => Ok(RuleValue::Bool(*b)),
            serde_json::Value::Number(n) => {
                // Display gives the shortest round-trip form, which parses
                // exactly as base-10.
                Decimal::from_str(&n.to_string())
                    .map(RuleValue::Decimal)
                    .map_err(|_| ValueError::Unsupported(n.to_string()))
            }
            serde_json::Value::String(s) => Ok(RuleValue::Text(s.clone())),
            serde_json::Value::Array(items) => {
                let converted: Result<Vec<_>, _> =
                    items.iter().map(RuleValue::try_from).collect();
                Ok(RuleValue::List(converted?))
            }
            serde_json::Value::Object(_) => {
                Err(ValueError::Unsupported("object".to_string()))
            }
        }
    }
}

impl From<&RuleValue> for serde_json::Value {
    fn from(value: &RuleValue) -> Self {
        match value {
            RuleValue::Null => serde_json::Value::Null,
            RuleValue::Bool(b) => serde_json::Value::Bool(*b),
            RuleValue::Decimal(d) => {
                if d.fract().is_zero() {
                    if let Some(n) = d.to_i64() {
                        return serde_json::Value::from(n);
                    }
                }
                serde_json::Value::from(d.to_f64().unwrap_or_default())
            }
            RuleValue::Text(t) => serde_json::Value::String(t.clone()),
            RuleValue::List(items) => {
                serde_json::Value::Array(items.iter().map(Into::into).collect())
            }
        }
    }
}

/// Errors raised by value comparison and conversion.
#[derive(Debug, Error)]
pub enum ValueError {
    #[error("cannot order {0} against {1}")]
    Incomparable(&'static str, &'static str),
    #[error("membership test requires a list value, got {0}")]
    NotAList(&'static str),
    #[error("unsupported value for rule evaluation: {0}")]
    Unsupported(String),
}

/// Apply one (operator, parsed value) condition to a resolved input.
///
/// `parsed` is the pre-parsed table literal; `input` is the resolved input
/// value for the column. Membership operators treat `parsed` as the
/// container.
pub fn compare(
    operator: RuleOperator,
    input: &RuleValue,
    parsed: &RuleValue,
) -> Result<bool, ValueError> {
    match operator {
        RuleOperator::In | RuleOperator::NotIn => {
            let RuleValue::List(items) = parsed else {
                return Err(ValueError::NotAList(parsed.type_name()));
            };
            let found = items.iter().any(|item| values_equal(input, item));
            Ok(if operator == RuleOperator::In {
                found
            } else {
                !found
            })
        }
        RuleOperator::Eq => Ok(values_equal(input, parsed)),
        RuleOperator::Ne => Ok(!values_equal(input, parsed)),
        RuleOperator::Lt => Ok(order_values(input, parsed)? == Ordering::Less),
        RuleOperator::Le => Ok(order_values(input, parsed)? != Ordering::Greater),
        RuleOperator::Gt => Ok(order_values(input, parsed)? == Ordering::Greater),
        RuleOperator::Ge => Ok(order_values(input, parsed)? != Ordering::Less),
    }
}

fn warn_on_mixed_decimal(input: &RuleValue, parsed: &RuleValue) {
    if matches!(parsed, RuleValue::Decimal(_)) && !matches!(input, RuleValue::Decimal(_)) {
        warn!(
            input_type = input.type_name(),
            "comparing a decimal literal against a non-decimal input"
        );
    }
}

fn values_equal(input: &RuleValue, parsed: &RuleValue) -> bool {
    warn_on_mixed_decimal(input, parsed);
    match (input, parsed) {
        (RuleValue::Null, RuleValue::Null) => true,
        (RuleValue::Bool(a), RuleValue::Bool(b)) => a == b,
        (RuleValue::Decimal(a), RuleValue::Decimal(b)) => a == b,
        (RuleValue::Text(a), RuleValue::Text(b)) => a == b,
        (RuleValue::List(a), RuleValue::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        // A decimal literal against coercible text compares numerically.
        (_, RuleValue::Decimal(b)) => input.as_decimal().map(|a| a == *b).unwrap_or(false),
        _ => false,
    }
}

fn order_values(input: &RuleValue, parsed: &RuleValue) -> Result<Ordering, ValueError> {
    warn_on_mixed_decimal(input, parsed);
    match (input, parsed) {
        (RuleValue::Decimal(a), RuleValue::Decimal(b)) => Ok(a.cmp(b)),
        (RuleValue::Text(a), RuleValue::Text(b)) => Ok(a.cmp(b)),
        (RuleValue::Bool(a), RuleValue::Bool(b)) => Ok(a.cmp(b)),
        (_, RuleValue::Decimal(b)) => input
            .as_decimal()
            .map(|a| a.cmp(b))
            .ok_or_else(|| ValueError::Incomparable(input.type_name(), parsed.type_name())),
        _ => Err(ValueError::Incomparable(
            input.type_name(),
            parsed.type_name(),
        )),
    }
}
