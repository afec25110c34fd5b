//! Calendar derivation for temporal fields.
//!
//! Every temporal field `f` in a processed record gains sibling fields
//! `f_year`, `f_month`, ..., `f_weekLabel`. The composite labels double as the
//! group keys used by the aggregation engine, so both sides format buckets
//! through the helpers in this module.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Suffixes of the fields derived from a temporal field, in emission order.
pub const DERIVED_SUFFIXES: [&str; 18] = [
    "year",
    "month",
    "day",
    "hour",
    "minute",
    "yearMonth",
    "date",
    "dateHour",
    "dateHalfHour",
    "weekNumber",
    "quarter",
    "dayOfWeek",
    "dayName",
    "monthName",
    "hourLabel",
    "halfHourLabel",
    "quarterLabel",
    "weekLabel",
];

const MONTH_NAMES: [&str; 12] = [
    "Enero",
    "Febrero",
    "Marzo",
    "Abril",
    "Mayo",
    "Junio",
    "Julio",
    "Agosto",
    "Septiembre",
    "Octubre",
    "Noviembre",
    "Diciembre",
];

// Indexed by days from Sunday.
const DAY_NAMES: [&str; 7] = [
    "Domingo",
    "Lunes",
    "Martes",
    "Miércoles",
    "Jueves",
    "Viernes",
    "Sábado",
];

/// Temporal bucket width used when grouping by a temporal field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Granularity {
    HalfHour,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Granularity {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::HalfHour => "halfHour",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Quarter => "quarter",
            Self::Year => "year",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for unknown granularity strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownGranularity(String);

impl fmt::Display for UnknownGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown granularity: {}", self.0)
    }
}

impl std::error::Error for UnknownGranularity {}

impl FromStr for Granularity {
    type Err = UnknownGranularity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "halfHour" | "half_hour" | "half-hour" => Ok(Self::HalfHour),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "quarter" => Ok(Self::Quarter),
            "year" => Ok(Self::Year),
            _ => Err(UnknownGranularity(s.to_string())),
        }
    }
}

/// Formats the bucket a temporal value falls into at the given granularity.
pub fn bucket_label(dt: NaiveDateTime, granularity: Granularity) -> String {
    match granularity {
        Granularity::HalfHour => date_half_hour(dt),
        Granularity::Hour => date_hour(dt),
        Granularity::Day => dt.format("%Y-%m-%d").to_string(),
        Granularity::Week => week_label(dt.date()),
        Granularity::Month => dt.format("%Y-%m").to_string(),
        Granularity::Quarter => quarter_label(dt.date()),
        Granularity::Year => dt.format("%Y").to_string(),
    }
}

/// Week of year where the week containing January 1st is week 1 and weeks
/// start on Sunday.
pub fn week_number(date: NaiveDate) -> u32 {
    let jan_first_offset = NaiveDate::from_ymd_opt(date.year(), 1, 1)
        .map_or(0, |jan1| jan1.weekday().num_days_from_sunday());
    (date.ordinal0() + jan_first_offset + 1).div_ceil(7)
}

/// Calendar quarter, 1 through 4.
pub const fn quarter(month: u32) -> u32 {
    month.div_ceil(3)
}

fn half_hour_minute(minute: u32) -> &'static str {
    if minute < 30 { "00" } else { "30" }
}

fn date_hour(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%d %H:00").to_string()
}

fn date_half_hour(dt: NaiveDateTime) -> String {
    format!(
        "{} {:02}:{}",
        dt.format("%Y-%m-%d"),
        dt.hour(),
        half_hour_minute(dt.minute())
    )
}

fn week_label(date: NaiveDate) -> String {
    format!("{}-W{:02}", date.year(), week_number(date))
}

fn quarter_label(date: NaiveDate) -> String {
    format!("{}-Q{}", date.year(), quarter(date.month()))
}

/// Derives the calendar sibling fields for a temporal field named `field`.
///
/// Returned in [`DERIVED_SUFFIXES`] order.
pub fn enrich_temporal(dt: NaiveDateTime, field: &str) -> Vec<(String, Value)> {
    let date = dt.date();
    let month = date.month();
    let weekday = date.weekday().num_days_from_sunday();
    let values: [Value; 18] = [
        i64::from(date.year()).into(),
        i64::from(month).into(),
        i64::from(date.day()).into(),
        i64::from(dt.hour()).into(),
        i64::from(dt.minute()).into(),
        dt.format("%Y-%m").to_string().into(),
        dt.format("%Y-%m-%d").to_string().into(),
        date_hour(dt).into(),
        date_half_hour(dt).into(),
        i64::from(week_number(date)).into(),
        i64::from(quarter(month)).into(),
        i64::from(weekday).into(),
        DAY_NAMES[weekday as usize].into(),
        MONTH_NAMES[date.month0() as usize].into(),
        format!("{:02}:00", dt.hour()).into(),
        format!("{:02}:{}", dt.hour(), half_hour_minute(dt.minute())).into(),
        quarter_label(date).into(),
        week_label(date).into(),
    ];

    DERIVED_SUFFIXES
        .iter()
        .zip(values)
        .map(|(suffix, value)| (format!("{field}_{suffix}"), value))
        .collect()
}

/// Returns the base field name if `field` is named like a derived sibling.
///
/// `fecha_dateHour` yields `Some("fecha")`. The caller decides whether the
/// base is actually temporal.
pub fn derived_base(field: &str) -> Option<&str> {
    DERIVED_SUFFIXES.iter().find_map(|suffix| {
        field
            .strip_suffix(suffix)
            .and_then(|rest| rest.strip_suffix('_'))
            .filter(|base| !base.is_empty())
    })
}
