//! Filter predicates over typed records.
//!
//! Widget queries send a flat list of conditions that must all hold, while
//! saved advanced queries send an `AND`/`OR` tree. Both deserialize into one
//! [`FilterExpression`]: a flat list is sugar for [`FilterExpression::All`].
//!
//! Unrecognized operators evaluate as satisfied so that payloads written by a
//! newer dashboard never hide records on an older one.

use std::cmp::Ordering;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Deserializer, Serialize};

use crate::inference::{infer, parse_number, parse_temporal};
use crate::value::{Record, Value};

/// A filter over records.
#[derive(Debug, Clone)]
pub enum FilterExpression {
    Leaf(Condition),
    /// Every child must match. Empty matches everything.
    All(Vec<FilterExpression>),
    /// At least one child must match. Empty matches nothing.
    Any(Vec<FilterExpression>),
}

impl FilterExpression {
    /// Builds the implicit-AND form used by widget queries.
    pub fn all_of(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Self::All(conditions.into_iter().map(Self::Leaf).collect())
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::Leaf(condition) => condition.matches(record),
            Self::All(children) => children.iter().all(|child| child.matches(record)),
            Self::Any(children) => children.iter().any(|child| child.matches(record)),
        }
    }
}

impl From<Vec<Condition>> for FilterExpression {
    fn from(conditions: Vec<Condition>) -> Self {
        Self::all_of(conditions)
    }
}

/// Returns the records matching `filter`, in input order.
pub fn apply(records: &[Record], filter: &FilterExpression) -> Vec<Record> {
    records
        .iter()
        .filter(|record| filter.matches(record))
        .cloned()
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FilterRepr {
    List(Vec<FilterExpression>),
    Group {
        operator: LogicalOperator,
        children: Vec<FilterExpression>,
    },
    Leaf(Condition),
}

#[derive(Deserialize)]
enum LogicalOperator {
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

impl<'de> Deserialize<'de> for FilterExpression {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match FilterRepr::deserialize(deserializer)? {
            FilterRepr::List(children)
            | FilterRepr::Group {
                operator: LogicalOperator::And,
                children,
            } => Self::All(children),
            FilterRepr::Group {
                operator: LogicalOperator::Or,
                children,
            } => Self::Any(children),
            FilterRepr::Leaf(condition) => Self::Leaf(condition),
        })
    }
}

/// Representation a condition compares in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Number,
    #[serde(alias = "datetime")]
    Date,
    #[serde(alias = "text")]
    String,
    #[serde(alias = "bool")]
    Boolean,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Number => "number",
            Self::Date => "date",
            Self::String => "string",
            Self::Boolean => "boolean",
        })
    }
}

/// Leaf comparison operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    Nin,
    Between,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    Exists,
    /// Kept so that newer payloads still deserialize.
    Unknown(String),
}

impl FromStr for Operator {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "eq" => Self::Eq,
            "ne" => Self::Ne,
            "gt" => Self::Gt,
            "lt" => Self::Lt,
            "gte" => Self::Gte,
            "lte" => Self::Lte,
            "in" => Self::In,
            "nin" => Self::Nin,
            "between" => Self::Between,
            "contains" => Self::Contains,
            "startsWith" => Self::StartsWith,
            "endsWith" => Self::EndsWith,
            "regex" => Self::Regex,
            "exists" => Self::Exists,
            other => Self::Unknown(other.to_string()),
        })
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Gte => "gte",
            Self::Lte => "lte",
            Self::In => "in",
            Self::Nin => "nin",
            Self::Between => "between",
            Self::Contains => "contains",
            Self::StartsWith => "startsWith",
            Self::EndsWith => "endsWith",
            Self::Regex => "regex",
            Self::Exists => "exists",
            Self::Unknown(other) => other.as_str(),
        };
        f.write_str(s)
    }
}

impl<'de> Deserialize<'de> for Operator {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let Ok(op) = s.parse::<Self>();
        Ok(op)
    }
}

/// A single `{field, operator, value, dataType}` predicate.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub data_type: Option<DataType>,
    #[serde(skip)]
    pattern: OnceLock<Option<Regex>>,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: serde_json::Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            data_type: None,
            pattern: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        let actual = record.get(&self.field).unwrap_or(&Value::Null);
        match &self.operator {
            Operator::Eq => self.equals(actual, &self.value),
            Operator::Ne => !self.equals(actual, &self.value),
            Operator::Gt => self.compare(actual, &self.value) == Some(Ordering::Greater),
            Operator::Lt => self.compare(actual, &self.value) == Some(Ordering::Less),
            Operator::Gte => matches!(
                self.compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Lte => matches!(
                self.compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::In => self.is_member(actual),
            Operator::Nin => !self.is_member(actual),
            Operator::Between => self.is_between(actual),
            Operator::Contains => text_test(actual, &self.value, |hay, needle| hay.contains(needle)),
            Operator::StartsWith => {
                text_test(actual, &self.value, |hay, needle| hay.starts_with(needle))
            }
            Operator::EndsWith => text_test(actual, &self.value, |hay, needle| hay.ends_with(needle)),
            Operator::Regex => !actual.is_null()
                && self
                    .regex()
                    .is_some_and(|re| re.is_match(&actual.to_string())),
            Operator::Exists => !actual.is_null() == exists_flag(&self.value),
            Operator::Unknown(op) => {
                tracing::debug!(operator = %op, field = %self.field, "unknown filter operator, treating as satisfied");
                true
            }
        }
    }

    fn equals(&self, actual: &Value, expected: &serde_json::Value) -> bool {
        if expected.is_null() {
            return actual.is_null();
        }
        self.compare(actual, expected) == Some(Ordering::Equal)
    }

    fn is_member(&self, actual: &Value) -> bool {
        match &self.value {
            serde_json::Value::Array(items) => items.iter().any(|item| self.equals(actual, item)),
            scalar => self.equals(actual, scalar),
        }
    }

    fn is_between(&self, actual: &Value) -> bool {
        let Some([min, max]) = self.value.as_array().map(Vec::as_slice) else {
            return false;
        };
        matches!(
            self.compare(actual, min),
            Some(Ordering::Greater | Ordering::Equal)
        ) && matches!(
            self.compare(actual, max),
            Some(Ordering::Less | Ordering::Equal)
        )
    }

    /// Orders the record value against a condition value.
    ///
    /// Both sides are coerced to the same representation first; `None` means
    /// the two cannot be compared.
    fn compare(&self, actual: &Value, expected: &serde_json::Value) -> Option<Ordering> {
        if actual.is_null() || expected.is_null() {
            return None;
        }
        match self.data_type {
            Some(DataType::Number | DataType::Boolean) => {
                let a = actual.as_f64()?;
                let b = infer(expected).as_f64()?;
                a.partial_cmp(&b)
            }
            Some(DataType::Date) => {
                let a = actual
                    .as_temporal()
                    .or_else(|| parse_temporal(&actual.to_string()))?;
                let b = parse_temporal(&Value::verbatim(expected).to_string())?;
                Some(a.cmp(&b))
            }
            Some(DataType::String) => {
                Some(actual.to_string().cmp(&Value::verbatim(expected).to_string()))
            }
            None => {
                let expected = infer(expected);
                match (actual.as_f64(), expected.as_f64()) {
                    (Some(a), Some(b)) if is_numeric_like(actual) && is_numeric_like(&expected) => {
                        a.partial_cmp(&b)
                    }
                    _ => Some(actual.to_string().cmp(&expected.to_string())),
                }
            }
        }
    }

    fn regex(&self) -> Option<&Regex> {
        self.pattern
            .get_or_init(|| {
                let pattern = Value::verbatim(&self.value).to_string();
                match RegexBuilder::new(&pattern).case_insensitive(true).build() {
                    Ok(re) => Some(re),
                    Err(err) => {
                        tracing::warn!(field = %self.field, pattern = %pattern, error = %err, "invalid filter regex");
                        None
                    }
                }
            })
            .as_ref()
    }
}

/// Whether a value takes part in numeric comparison.
///
/// Text only counts when it parses as a number, so `"abc"` compares as text.
fn is_numeric_like(value: &Value) -> bool {
    match value {
        Value::Number(_) | Value::Bool(_) | Value::Temporal(_) => true,
        Value::Text(s) => parse_number(s).is_some(),
        Value::Null => false,
    }
}

fn text_test(actual: &Value, expected: &serde_json::Value, test: impl Fn(&str, &str) -> bool) -> bool {
    if actual.is_null() {
        return false;
    }
    let haystack = actual.to_string().to_lowercase();
    let needle = Value::verbatim(expected).to_string().to_lowercase();
    test(&haystack, &needle)
}

fn exists_flag(value: &serde_json::Value) -> bool {
    match infer(value) {
        Value::Bool(b) => b,
        Value::Number(n) => n != 0.0,
        _ => true,
    }
}
