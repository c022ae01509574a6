//! Operator types and evaluation logic for trait and event-property
//! conditions.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use engage_core::{EngageError, EngageResult};

/// Longest window a definition may use (100 years).
pub const MAX_WINDOW_MILLIS: u64 = 100 * 365 * 24 * 60 * 60 * 1_000;

/// Window lengths must lie in `1..=MAX_WINDOW_MILLIS`.
pub fn check_window(millis: u64) -> EngageResult<()> {
    if millis == 0 {
        return Err(EngageError::InvalidDefinition(
            "time window must be greater than zero".into(),
        ));
    }
    if millis > MAX_WINDOW_MILLIS {
        return Err(EngageError::InvalidDefinition(format!(
            "time window of {} ms exceeds the {} ms limit",
            millis, MAX_WINDOW_MILLIS
        )));
    }
    Ok(())
}

/// `now - millis`, or `None` when the window is out of range or the result
/// falls outside the representable time range.
pub fn window_start(now: DateTime<Utc>, millis: u64) -> Option<DateTime<Utc>> {
    check_window(millis).ok()?;
    let window = chrono::Duration::try_milliseconds(i64::try_from(millis).ok()?)?;
    now.checked_sub_signed(window)
}

/// A resolved trait: absence is its own state, distinct from `null` or `""`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TraitValue<'a> {
    Absent,
    Present(&'a Value),
}

impl<'a> From<Option<&'a Value>> for TraitValue<'a> {
    fn from(value: Option<&'a Value>) -> Self {
        match value {
            Some(v) => TraitValue::Present(v),
            None => TraitValue::Absent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SegmentOperator {
    Equals {
        value: Value,
    },
    /// Absence is treated as false.
    NotEquals {
        value: Value,
    },
    Exists,
    NotExists,
    GreaterThanOrEqual {
        value: f64,
    },
    LessThan {
        value: f64,
    },
    Contains {
        value: String,
    },
    /// The trait holds a timestamp within `[now - window, now]`.
    Within {
        window_millis: u64,
    },
    /// The trait has held `value` continuously for at least (`Gte`) or less
    /// than (`Lt`) the window.
    HasBeen {
        comparator: HasBeenComparator,
        value: Value,
        window_millis: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HasBeenComparator {
    Gte,
    Lt,
}

/// How many matching events a `Performed` condition requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "count")]
pub enum CountOperator {
    AtLeast(u64),
    AtMost(u64),
    Exactly(u64),
}

impl Default for CountOperator {
    fn default() -> Self {
        CountOperator::AtLeast(1)
    }
}

impl CountOperator {
    pub fn matches(&self, actual: u64) -> bool {
        match *self {
            CountOperator::AtLeast(n) => actual >= n,
            CountOperator::AtMost(n) => actual <= n,
            CountOperator::Exactly(n) => actual == n,
        }
    }
}

impl SegmentOperator {
    pub fn window_millis(&self) -> Option<u64> {
        match self {
            SegmentOperator::Within { window_millis }
            | SegmentOperator::HasBeen { window_millis, .. } => Some(*window_millis),
            _ => None,
        }
    }

    /// Whether the outcome can change with `now` alone, without new events.
    pub fn is_time_dependent(&self) -> bool {
        self.window_millis().is_some()
    }
}

/// Applies a point-in-time operator. `HasBeen` needs trait history and is
/// evaluated by the caller; here it only reports `false`.
pub fn matches(operator: &SegmentOperator, actual: TraitValue<'_>, now: DateTime<Utc>) -> bool {
    let value = match actual {
        TraitValue::Absent => return matches!(operator, SegmentOperator::NotExists),
        TraitValue::Present(value) => value,
    };
    match operator {
        SegmentOperator::Equals { value: expected } => values_equal(value, expected),
        SegmentOperator::NotEquals { value: expected } => !values_equal(value, expected),
        SegmentOperator::Exists => true,
        SegmentOperator::NotExists => false,
        SegmentOperator::GreaterThanOrEqual { value: bound } => {
            as_number(value).map_or(false, |n| n >= *bound)
        }
        SegmentOperator::LessThan { value: bound } => as_number(value).map_or(false, |n| n < *bound),
        SegmentOperator::Contains { value: needle } => match value {
            Value::String(s) => s.contains(needle.as_str()),
            Value::Array(items) => items.iter().any(|item| item.as_str() == Some(needle)),
            _ => false,
        },
        SegmentOperator::Within { window_millis } => {
            match (as_timestamp(value), window_start(now, *window_millis)) {
                (Some(ts), Some(from)) => ts <= now && ts >= from,
                _ => false,
            }
        }
        SegmentOperator::HasBeen { .. } => false,
    }
}

/// JSON equality, additionally treating a scalar and its string rendering as
/// equal (`5` == `"5"`, `true` == `"true"`).
pub fn values_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (scalar_string(actual), scalar_string(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// RFC 3339 strings or epoch milliseconds.
pub fn as_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}
