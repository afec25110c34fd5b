//! Grouping and aggregation of typed records.
//!
//! # Algorithm Summary
//!
//! 1. Derive a group key per record from the group-by fields (temporal values
//!    are bucketed by granularity, missing values go to `unspecified`)
//! 2. Partition records by key, remembering the order keys were first seen
//! 3. Reduce each partition with the requested aggregation
//!
//! Without a group-by the whole record set reduces to one value.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::formula;
use crate::temporal::{Granularity, bucket_label};
use crate::value::{Record, Value, count_as_f64, round2};

/// Group key for records whose group-by field is missing or null.
pub const UNSPECIFIED: &str = "unspecified";

/// Separator between per-field keys when grouping by several fields.
const KEY_SEPARATOR: &str = " / ";

/// Reduction applied to each group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationType {
    Sum,
    Avg,
    Count,
    Min,
    Max,
    /// Evaluate the attached formula over the group.
    Custom,
}

impl AggregationType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for AggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for unknown aggregation type strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAggregationType(String);

impl fmt::Display for UnknownAggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown aggregation type: {}", self.0)
    }
}

impl std::error::Error for UnknownAggregationType {}

impl FromStr for AggregationType {
    type Err = UnknownAggregationType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(Self::Sum),
            "avg" | "average" => Ok(Self::Avg),
            "count" => Ok(Self::Count),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "custom" | "formula" => Ok(Self::Custom),
            _ => Err(UnknownAggregationType(s.to_string())),
        }
    }
}

/// What to compute: `{type, field?, formula?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationSpec {
    #[serde(rename = "type")]
    pub kind: AggregationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
}

impl AggregationSpec {
    pub const fn count() -> Self {
        Self {
            kind: AggregationType::Count,
            field: None,
            formula: None,
        }
    }

    pub fn of(kind: AggregationType, field: impl Into<String>) -> Self {
        Self {
            kind,
            field: Some(field.into()),
            formula: None,
        }
    }

    pub fn custom(formula: impl Into<String>) -> Self {
        Self {
            kind: AggregationType::Custom,
            field: None,
            formula: Some(formula.into()),
        }
    }
}

/// One group-by dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupField {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
}

/// Ordered group-by dimensions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupBySpec {
    pub fields: Vec<GroupField>,
}

impl GroupBySpec {
    pub fn single(field: impl Into<String>, granularity: Option<Granularity>) -> Self {
        Self {
            fields: vec![GroupField {
                field: field.into(),
                granularity,
            }],
        }
    }

    /// Derives the group key of a record.
    pub fn key_for(&self, record: &Record) -> String {
        self.fields
            .iter()
            .map(|group| group_key(record.get(&group.field), group.granularity))
            .collect::<Vec<_>>()
            .join(KEY_SEPARATOR)
    }
}

/// Order of buckets in a grouped result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketOrder {
    /// Order in which each bucket's first record appeared.
    #[default]
    FirstSeen,
    /// Lexicographic by label.
    Label,
}

/// Which values `min` considers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinPolicy {
    /// Zero and negative values mark rows that are not populated yet and are
    /// skipped. `max` has no such rule.
    #[default]
    IgnoreNonPositive,
    /// Every numeric-coerced value takes part.
    AllValues,
}

/// Tunable aggregation behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationPolicy {
    #[serde(default)]
    pub bucket_order: BucketOrder,
    #[serde(default)]
    pub min_policy: MinPolicy,
}

/// A labeled group value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub label: String,
    pub value: f64,
}

/// Output of [`aggregate`].
///
/// Serializes as `{"value": n}` or `{"data": [...], "grouped": true}`.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationResult {
    Scalar(f64),
    Grouped(Vec<Bucket>),
}

impl Serialize for AggregationResult {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Scalar(value) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("value", value)?;
                map.end()
            }
            Self::Grouped(data) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("data", data)?;
                map.serialize_entry("grouped", &true)?;
                map.end()
            }
        }
    }
}

/// Derives the bucket a value falls into.
///
/// Temporal values are bucketed by `granularity`; everything else uses its
/// display form, since derived calendar fields are already labels.
pub fn group_key(value: Option<&Value>, granularity: Option<Granularity>) -> String {
    let key = match (value, granularity) {
        (None | Some(Value::Null), _) => return UNSPECIFIED.to_string(),
        (Some(Value::Temporal(dt)), Some(granularity)) => bucket_label(*dt, granularity),
        (Some(other), _) => other.to_string(),
    };
    if key.is_empty() {
        UNSPECIFIED.to_string()
    } else {
        key
    }
}

/// Aggregates with the default [`AggregationPolicy`].
pub fn aggregate(
    records: &[Record],
    spec: &AggregationSpec,
    group_by: Option<&GroupBySpec>,
) -> AggregationResult {
    aggregate_with(records, spec, group_by, &AggregationPolicy::default())
}

/// Aggregates records, grouped when `group_by` names at least one field.
pub fn aggregate_with(
    records: &[Record],
    spec: &AggregationSpec,
    group_by: Option<&GroupBySpec>,
    policy: &AggregationPolicy,
) -> AggregationResult {
    let Some(group_by) = group_by.filter(|g| !g.fields.is_empty()) else {
        return AggregationResult::Scalar(calculate_aggregation(records, spec, policy));
    };

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut partitions: Vec<(String, Vec<&Record>)> = Vec::new();
    for record in records {
        let key = group_by.key_for(record);
        match index.get(&key) {
            Some(&slot) => partitions[slot].1.push(record),
            None => {
                index.insert(key.clone(), partitions.len());
                partitions.push((key, vec![record]));
            }
        }
    }

    let mut buckets: Vec<Bucket> = partitions
        .into_iter()
        .map(|(label, members)| Bucket {
            value: calculate_aggregation(&members, spec, policy),
            label,
        })
        .collect();
    if policy.bucket_order == BucketOrder::Label {
        buckets.sort_by(|a, b| a.label.cmp(&b.label));
    }
    tracing::trace!(buckets = buckets.len(), kind = %spec.kind, "grouped aggregation");
    AggregationResult::Grouped(buckets)
}

/// Reduces a record set to one number.
pub fn calculate_aggregation<R: Borrow<Record>>(
    records: &[R],
    spec: &AggregationSpec,
    policy: &AggregationPolicy,
) -> f64 {
    let values = || {
        records.iter().map(Borrow::<Record>::borrow).map(|record| {
            spec.field
                .as_deref()
                .and_then(|field| record.get(field))
                .map_or(0.0, Value::to_number_or_zero)
        })
    };

    match spec.kind {
        AggregationType::Count => count_as_f64(records.len()),
        AggregationType::Sum => round2(values().sum()),
        AggregationType::Avg => {
            if records.is_empty() {
                0.0
            } else {
                round2(values().sum::<f64>() / count_as_f64(records.len()))
            }
        }
        AggregationType::Min => {
            let include_all = policy.min_policy == MinPolicy::AllValues;
            values()
                .filter(|v| include_all || *v > 0.0)
                .reduce(f64::min)
                .unwrap_or(0.0)
        }
        AggregationType::Max => values().reduce(f64::max).unwrap_or(0.0),
        AggregationType::Custom => match spec.formula.as_deref() {
            Some(formula) => formula::evaluate(records, formula),
            None => {
                tracing::warn!("custom aggregation without a formula");
                0.0
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{NaiveDate, NaiveDateTime};
    use serde_json::json;

    use crate::inference::process_dataset;
    use crate::value::RawRecord;

    fn process(values: Vec<serde_json::Value>) -> Vec<Record> {
        let raw: Vec<RawRecord> = values
            .into_iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect();
        process_dataset(&raw)
    }

    fn sales() -> Vec<Record> {
        process(vec![
            json!({"fecha": "15/01/2024", "ventas": "100", "agente": "Ana"}),
            json!({"fecha": "20/01/2024", "ventas": "200", "agente": "Luis"}),
        ])
    }

    fn staffing() -> Vec<Record> {
        process(vec![
            json!({"fecha": "2024-02-03 09:10", "agentes": "4", "turno": "tarde"}),
            json!({"fecha": "2024-01-10 09:40", "agentes": "0", "turno": "mañana"}),
            json!({"fecha": "2024-02-04 10:05", "agentes": "-2", "turno": "tarde"}),
            json!({"fecha": "2024-01-11 09:20", "agentes": "6"}),
        ])
    }

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn grouped(result: AggregationResult) -> Vec<(String, f64)> {
        let AggregationResult::Grouped(buckets) = result else {
            panic!("expected grouped result");
        };
        buckets.into_iter().map(|b| (b.label, b.value)).collect()
    }

    #[test]
    fn sum_grouped_by_month() {
        let result = aggregate(
            &sales(),
            &AggregationSpec::of(AggregationType::Sum, "ventas"),
            Some(&GroupBySpec::single("fecha", Some(Granularity::Month))),
        );
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"data": [{"label": "2024-01", "value": 300.0}], "grouped": true})
        );
    }

    #[test]
    fn ungrouped_result_shape() {
        let result = aggregate(&sales(), &AggregationSpec::of(AggregationType::Avg, "ventas"), None);
        assert_eq!(result, AggregationResult::Scalar(150.0));
        assert_eq!(serde_json::to_value(&result).unwrap(), json!({"value": 150.0}));
    }

    #[test]
    fn empty_group_by_is_ungrouped() {
        let result = aggregate(&sales(), &AggregationSpec::count(), Some(&GroupBySpec::default()));
        assert_eq!(result, AggregationResult::Scalar(2.0));
    }

    #[test]
    fn count_equals_record_count() {
        let policy = AggregationPolicy::default();
        for records in [sales(), staffing(), Vec::new()] {
            let count = calculate_aggregation(&records, &AggregationSpec::count(), &policy);
            assert!((count - count_as_f64(records.len())).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn empty_input_yields_zero() {
        let empty: Vec<Record> = Vec::new();
        let policy = AggregationPolicy::default();
        for kind in [
            AggregationType::Sum,
            AggregationType::Avg,
            AggregationType::Min,
            AggregationType::Max,
        ] {
            let value = calculate_aggregation(&empty, &AggregationSpec::of(kind, "x"), &policy);
            assert!(value.abs() < f64::EPSILON, "{kind}");
        }
        assert_eq!(
            aggregate(&empty, &AggregationSpec::count(), Some(&GroupBySpec::single("x", None))),
            AggregationResult::Grouped(vec![])
        );
    }

    #[test]
    fn min_ignores_non_positive_by_default() {
        let records = staffing();
        let spec = AggregationSpec::of(AggregationType::Min, "agentes");
        let value = calculate_aggregation(&records, &spec, &AggregationPolicy::default());
        assert!((value - 4.0).abs() < f64::EPSILON);

        let all = AggregationPolicy {
            min_policy: MinPolicy::AllValues,
            ..AggregationPolicy::default()
        };
        let value = calculate_aggregation(&records, &spec, &all);
        assert!((value + 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn max_includes_negative_values() {
        let records = process(vec![json!({"x": "-5"}), json!({"x": "-3"})]);
        let value = calculate_aggregation(
            &records,
            &AggregationSpec::of(AggregationType::Max, "x"),
            &AggregationPolicy::default(),
        );
        assert!((value + 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sum_coerces_missing_and_text_to_zero() {
        let records = process(vec![json!({"x": "1.256"}), json!({"x": "abc"}), json!({})]);
        let value = calculate_aggregation(
            &records,
            &AggregationSpec::of(AggregationType::Sum, "x"),
            &AggregationPolicy::default(),
        );
        assert!((value - 1.26).abs() < 1e-9);
    }

    #[test]
    fn buckets_keep_first_seen_order() {
        let result = aggregate(
            &staffing(),
            &AggregationSpec::count(),
            Some(&GroupBySpec::single("fecha", Some(Granularity::Month))),
        );
        assert_eq!(
            grouped(result),
            vec![("2024-02".to_string(), 2.0), ("2024-01".to_string(), 2.0)]
        );
    }

    #[test]
    fn buckets_sorted_by_label_when_requested() {
        let policy = AggregationPolicy {
            bucket_order: BucketOrder::Label,
            ..AggregationPolicy::default()
        };
        let result = aggregate_with(
            &staffing(),
            &AggregationSpec::count(),
            Some(&GroupBySpec::single("turno", None)),
            &policy,
        );
        assert_eq!(
            grouped(result),
            vec![
                ("mañana".to_string(), 1.0),
                ("tarde".to_string(), 2.0),
                ("unspecified".to_string(), 1.0)
            ]
        );
    }

    #[test]
    fn group_by_derived_field_uses_its_label() {
        let result = aggregate(
            &staffing(),
            &AggregationSpec::of(AggregationType::Sum, "agentes"),
            Some(&GroupBySpec::single("fecha_hourLabel", None)),
        );
        assert_eq!(
            grouped(result),
            vec![("09:00".to_string(), 10.0), ("10:00".to_string(), -2.0)]
        );
    }

    #[test]
    fn group_by_several_fields() {
        let group_by = GroupBySpec {
            fields: vec![
                GroupField {
                    field: "fecha".into(),
                    granularity: Some(Granularity::Month),
                },
                GroupField {
                    field: "turno".into(),
                    granularity: None,
                },
            ],
        };
        let result = aggregate(&staffing(), &AggregationSpec::count(), Some(&group_by));
        assert_eq!(
            grouped(result),
            vec![
                ("2024-02 / tarde".to_string(), 2.0),
                ("2024-01 / mañana".to_string(), 1.0),
                ("2024-01 / unspecified".to_string(), 1.0)
            ]
        );
    }

    #[test]
    fn group_key_same_month_same_key() {
        let a = Value::Temporal(at(2024, 3, 1));
        let b = Value::Temporal(at(2024, 3, 31));
        let c = Value::Temporal(at(2024, 4, 1));
        let month = Some(Granularity::Month);
        assert_eq!(group_key(Some(&a), month), group_key(Some(&b), month));
        assert_ne!(group_key(Some(&a), month), group_key(Some(&c), month));
    }

    #[test]
    fn group_key_fallbacks() {
        assert_eq!(group_key(None, Some(Granularity::Day)), UNSPECIFIED);
        assert_eq!(group_key(Some(&Value::Null), None), UNSPECIFIED);
        assert_eq!(group_key(Some(&Value::Number(3.0)), Some(Granularity::Day)), "3");
        assert_eq!(
            group_key(Some(&Value::Temporal(at(2024, 3, 1))), None),
            "2024-03-01 12:00:00"
        );
    }

    #[test]
    fn custom_delegates_to_formula_per_group() {
        let result = aggregate(
            &staffing(),
            &AggregationSpec::custom("SUM(agentes)/COUNT(*)"),
            Some(&GroupBySpec::single("turno", None)),
        );
        assert_eq!(
            grouped(result),
            vec![
                ("tarde".to_string(), 1.0),
                ("mañana".to_string(), 0.0),
                ("unspecified".to_string(), 6.0)
            ]
        );
    }

    #[test]
    fn custom_without_formula_is_zero() {
        let spec = AggregationSpec {
            kind: AggregationType::Custom,
            field: None,
            formula: None,
        };
        assert_eq!(aggregate(&sales(), &spec, None), AggregationResult::Scalar(0.0));
    }

    #[test]
    fn spec_deserializes_from_widget_json() {
        let spec: AggregationSpec =
            serde_json::from_value(json!({"type": "sum", "field": "ventas"})).unwrap();
        assert_eq!(spec, AggregationSpec::of(AggregationType::Sum, "ventas"));

        let group_by: GroupBySpec =
            serde_json::from_value(json!([{"field": "fecha", "granularity": "halfHour"}])).unwrap();
        assert_eq!(group_by, GroupBySpec::single("fecha", Some(Granularity::HalfHour)));
    }
}
