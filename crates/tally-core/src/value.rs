//! Typed field values and record aliases.
//!
//! Raw records arrive as JSON objects from a record source. After inference
//! every field holds a [`Value`], and a typed record is a [`Record`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;
use serde::{Serialize, Serializer};

use crate::inference::parse_number;

/// A record as fetched from a record source, before inference.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// A typed (and possibly enriched) record.
pub type Record = BTreeMap<String, Value>;

/// Serialization format for temporal values.
pub const TEMPORAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Display format for temporal values used in labels.
const TEMPORAL_DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A field value after type inference.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    /// A calendar date and wall-clock time. Offsets are discarded at parse time.
    Temporal(NaiveDateTime),
}

impl Value {
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub const fn as_temporal(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Temporal(dt) => Some(*dt),
            _ => None,
        }
    }

    /// Coerces the value to a number.
    ///
    /// Temporals become Unix epoch milliseconds (wall clock read as UTC), so that
    /// numeric and temporal comparisons share one representation.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Number(n) => Some(*n),
            Self::Text(s) => parse_number(s),
            Self::Temporal(dt) => Some(epoch_millis(*dt)),
        }
    }

    /// Numeric coercion used by aggregation: anything non-numeric counts as 0.
    pub fn to_number_or_zero(&self) -> f64 {
        self.as_f64().filter(|n| n.is_finite()).unwrap_or(0.0)
    }

    /// Converts a raw JSON value without any string inference.
    ///
    /// Arrays and objects are kept as their JSON text.
    pub fn verbatim(raw: &serde_json::Value) -> Self {
        match raw {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => n.as_f64().map_or(Self::Null, Self::Number),
            serde_json::Value::String(s) => Self::Text(s.clone()),
            other => Self::Text(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{}", format_number(*n)),
            Self::Text(s) => f.write_str(s),
            Self::Temporal(dt) => write!(f, "{}", dt.format(TEMPORAL_DISPLAY_FORMAT)),
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Null => serializer.serialize_none(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => serializer.serialize_f64(*n),
            Self::Text(s) => serializer.serialize_str(s),
            Self::Temporal(dt) => serializer.collect_str(&dt.format(TEMPORAL_FORMAT)),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    #[expect(
        clippy::cast_precision_loss,
        reason = "calendar components are small integers"
    )]
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

#[expect(
    clippy::cast_precision_loss,
    reason = "epoch millis fit comfortably in the f64 mantissa"
)]
fn epoch_millis(dt: NaiveDateTime) -> f64 {
    dt.and_utc().timestamp_millis() as f64
}

#[expect(
    clippy::cast_precision_loss,
    reason = "record counts stay far below 2^52"
)]
pub(crate) fn count_as_f64(count: usize) -> f64 {
    count as f64
}

/// Formats a number the way dashboards label it: integral values lose the `.0`.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{n:.0}")
    } else {
        format!("{n}")
    }
}

/// Rounds to two decimal places.
pub fn round2(n: f64) -> f64 {
    (n * 100.0).round() / 100.0
}
