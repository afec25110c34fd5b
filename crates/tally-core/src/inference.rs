//! Type inference for heterogeneous uploaded records.
//!
//! Uploaded spreadsheets deliver every cell as text, so each string is tried
//! against a fixed precedence of interpretations:
//! 1. Temporal (`YYYY-MM-DD[THH:MM:SS]`, `D/M/YYYY[ HH:MM[:SS]]`, `YYYY/M/D`)
//! 2. Numeric (thousands separators and a trailing `%` are stripped)
//! 3. Boolean words
//! 4. The trimmed string itself
//!
//! A temporal candidate must name a real calendar date, otherwise it falls
//! through to the next interpretation.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rayon::prelude::*;
use regex::{Captures, Regex};

use crate::temporal::{derived_base, enrich_temporal};
use crate::value::{RawRecord, Record, Value};

/// Fields carrying storage metadata. They are never inferred or enriched.
pub const RESERVED_FIELDS: [&str; 4] = ["_id", "__v", "createdAt", "updatedAt"];

static ISO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{4})-(\d{2})-(\d{2})(?:[T ](\d{2}):(\d{2})(?::(\d{2})(?:\.\d+)?)?)?(?:Z|[+-]\d{2}:?\d{2})?$",
    )
    .unwrap()
});

static DMY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2})/(\d{1,2})/(\d{4})(?:\s+(\d{1,2}):(\d{2})(?::(\d{2}))?)?$").unwrap()
});

static YMD_SLASH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})/(\d{1,2})/(\d{1,2})$").unwrap());

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-+]?(?:(?:\d{1,3}(?:,\d{3})+|\d+)(?:\.\d+)?|\.\d+)$").unwrap()
});

const TRUE_WORDS: [&str; 6] = ["true", "yes", "si", "sí", "verdadero", "1"];
const FALSE_WORDS: [&str; 4] = ["false", "no", "falso", "0"];

/// A record whose fields can be fed through inference.
///
/// Implemented for raw records from a record source and for already typed
/// records, which is what makes [`process_dataset`] re-runnable on its own
/// output.
pub trait InferableRecord {
    /// Returns every field converted without string inference.
    fn verbatim_fields(&self) -> Vec<(&str, Value)>;
}

impl InferableRecord for RawRecord {
    fn verbatim_fields(&self) -> Vec<(&str, Value)> {
        self.iter()
            .map(|(key, raw)| (key.as_str(), Value::verbatim(raw)))
            .collect()
    }
}

impl InferableRecord for Record {
    fn verbatim_fields(&self) -> Vec<(&str, Value)> {
        self.iter()
            .map(|(key, value)| (key.as_str(), value.clone()))
            .collect()
    }
}

/// Infers the typed value of a raw JSON value.
pub fn infer(raw: &serde_json::Value) -> Value {
    match raw {
        serde_json::Value::String(s) => infer_str(s),
        other => Value::verbatim(other),
    }
}

/// Re-runs inference on a value. Only text is reinterpreted.
pub fn infer_value(value: &Value) -> Value {
    match value {
        Value::Text(s) => infer_str(s),
        other => other.clone(),
    }
}

/// Infers the typed value of a string.
pub fn infer_str(s: &str) -> Value {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Some(dt) = parse_temporal(trimmed) {
        return Value::Temporal(dt);
    }
    if let Some(n) = parse_number(trimmed) {
        return Value::Number(n);
    }
    if let Some(b) = parse_bool(trimmed) {
        return Value::Bool(b);
    }
    Value::Text(trimmed.to_string())
}

/// Parses a temporal string in one of the supported layouts.
pub fn parse_temporal(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Some(caps) = ISO_RE.captures(s) {
        if let Some(dt) = build_datetime(&caps, 1, 2, 3) {
            return Some(dt);
        }
    }
    if let Some(caps) = DMY_RE.captures(s) {
        if let Some(dt) = build_datetime(&caps, 3, 2, 1) {
            return Some(dt);
        }
    }
    if let Some(caps) = YMD_SLASH_RE.captures(s) {
        return build_datetime(&caps, 1, 2, 3);
    }
    None
}

/// Builds a date-time from capture groups. Time groups, when present, are
/// always groups 4 to 6.
fn build_datetime(caps: &Captures<'_>, year: usize, month: usize, day: usize) -> Option<NaiveDateTime> {
    let group = |idx: usize| -> Option<u32> { caps.get(idx).and_then(|m| m.as_str().parse().ok()) };
    let date = NaiveDate::from_ymd_opt(
        caps.get(year)?.as_str().parse().ok()?,
        group(month)?,
        group(day)?,
    )?;
    let time = NaiveTime::from_hms_opt(
        group(4).unwrap_or(0),
        group(5).unwrap_or(0),
        group(6).unwrap_or(0),
    )?;
    Some(date.and_time(time))
}

/// Parses a numeric string.
///
/// Accepts comma thousands separators (`1,250.5`) and a trailing percent sign,
/// which is removed without scaling (`45%` is `45`).
pub fn parse_number(s: &str) -> Option<f64> {
    let s = s.trim();
    let s = s.strip_suffix('%').map_or(s, str::trim_end);
    if !NUMBER_RE.is_match(s) {
        return None;
    }
    s.replace(',', "").parse().ok()
}

fn parse_bool(s: &str) -> Option<bool> {
    let lower = s.to_lowercase();
    if TRUE_WORDS.contains(&lower.as_str()) {
        Some(true)
    } else if FALSE_WORDS.contains(&lower.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Types every field of every record and adds temporal sibling fields.
///
/// Output order matches input order. Inputs are never modified. Running the
/// function on its own output yields the same records.
pub fn process_dataset<R>(records: &[R]) -> Vec<Record>
where
    R: InferableRecord + Sync,
{
    records.par_iter().map(process_record).collect()
}

/// Types and enriches a single record.
pub fn process_record<R: InferableRecord + ?Sized>(record: &R) -> Record {
    let fields: Vec<Field<'_>> = record
        .verbatim_fields()
        .into_iter()
        .map(|(key, original)| {
            let reserved = RESERVED_FIELDS.contains(&key);
            let typed = if reserved {
                original.clone()
            } else {
                infer_value(&original)
            };
            Field {
                key,
                original,
                typed,
                reserved,
            }
        })
        .collect();

    let temporal_keys: HashSet<&str> = fields
        .iter()
        .filter(|field| !field.reserved && field.typed.as_temporal().is_some())
        .map(|field| field.key)
        .collect();
    let is_derived =
        |key: &str| derived_base(key).is_some_and(|base| temporal_keys.contains(base));

    let mut out = Record::new();
    let mut to_enrich = Vec::new();
    for field in &fields {
        if field.reserved {
            out.insert(field.key.to_string(), field.typed.clone());
        } else if is_derived(field.key) {
            // Labels such as `fecha_date` would otherwise re-infer as temporal.
            out.insert(field.key.to_string(), field.original.clone());
        } else {
            if let Some(dt) = field.typed.as_temporal() {
                to_enrich.push((field.key, dt));
            }
            out.insert(field.key.to_string(), field.typed.clone());
        }
    }

    for (key, dt) in to_enrich {
        out.extend(enrich_temporal(dt, key));
    }
    out
}

struct Field<'a> {
    key: &'a str,
    original: Value,
    typed: Value,
    reserved: bool,
}
