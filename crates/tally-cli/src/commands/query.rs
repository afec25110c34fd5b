//! Query command: fetch, process, filter and aggregate a tenant's records.
//!
//! Mirrors a dashboard widget request. The filter is the widget's JSON
//! condition list, and each `--group-by` adds one dimension written as
//! `FIELD` or `FIELD:GRANULARITY` (e.g., `fecha:month`).

use std::io::Write;

use anyhow::{Context, Result, bail};
use clap::Args;

use tally_core::filter::{self, FilterExpression};
use tally_core::value::format_number;
use tally_core::{
    AggregationPolicy, AggregationResult, AggregationSpec, AggregationType, BucketOrder,
    GroupBySpec, GroupField, Granularity, ModelRegistry, RecordQuery, aggregate_with,
};
use tally_db::Database;

use super::{Target, load_records};

#[derive(Debug, Args)]
pub struct QueryArgs {
    #[command(flatten)]
    pub target: Target,

    /// Filter as JSON: a condition, a list of conditions, or an AND/OR group.
    #[arg(long)]
    pub filter: Option<String>,

    /// Aggregation: sum, avg, count, min, max or custom.
    ///
    /// Defaults to `custom` when `--formula` is given and `count` otherwise.
    #[arg(long)]
    pub agg: Option<AggregationType>,

    /// Field to aggregate.
    #[arg(long)]
    pub field: Option<String>,

    /// Formula for custom aggregations (e.g., `SUM(ventas)/COUNT(*)`).
    #[arg(long)]
    pub formula: Option<String>,

    /// Group-by dimension as `FIELD[:GRANULARITY]`. Repeatable.
    #[arg(long = "group-by", value_parser = parse_group_field)]
    pub group_by: Vec<GroupField>,

    /// Order groups by label instead of first appearance.
    #[arg(long)]
    pub sort_labels: bool,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl QueryArgs {
    fn spec(&self) -> Result<AggregationSpec> {
        let kind = self.agg.unwrap_or(if self.formula.is_some() {
            AggregationType::Custom
        } else {
            AggregationType::Count
        });
        match kind {
            AggregationType::Custom if self.formula.is_none() => {
                bail!("--agg custom requires --formula");
            }
            AggregationType::Sum | AggregationType::Avg | AggregationType::Min | AggregationType::Max
                if self.field.is_none() =>
            {
                bail!("--agg {kind} requires --field");
            }
            _ => {}
        }
        Ok(AggregationSpec {
            kind,
            field: self.field.clone(),
            formula: self.formula.clone(),
        })
    }
}

fn parse_group_field(s: &str) -> Result<GroupField, String> {
    let (field, granularity) = match s.split_once(':') {
        Some((field, granularity)) => (
            field,
            Some(granularity.parse::<Granularity>().map_err(|e| e.to_string())?),
        ),
        None => (s, None),
    };
    if field.trim().is_empty() {
        return Err("group-by field must not be empty".to_string());
    }
    Ok(GroupField {
        field: field.trim().to_string(),
        granularity,
    })
}

pub fn run<W: Write>(
    writer: &mut W,
    args: &QueryArgs,
    registry: &ModelRegistry,
    db: &Database,
    policy: &AggregationPolicy,
) -> Result<AggregationResult> {
    let spec = args.spec()?;
    let filter: Option<FilterExpression> = args
        .filter
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context("invalid --filter JSON")?;

    let model = args.target.model(registry)?;
    let mut records = load_records(db, &model, &RecordQuery::default())?;
    if let Some(filter) = &filter {
        records = filter::apply(&records, filter);
        tracing::debug!(matched = records.len(), "applied filter");
    }

    let mut policy = *policy;
    if args.sort_labels {
        policy.bucket_order = BucketOrder::Label;
    }
    let group_by = GroupBySpec {
        fields: args.group_by.clone(),
    };
    let result = aggregate_with(&records, &spec, Some(&group_by), &policy);

    if args.json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&result)?)?;
    } else {
        write_table(writer, &result)?;
    }
    Ok(result)
}

fn write_table<W: Write>(writer: &mut W, result: &AggregationResult) -> Result<()> {
    match result {
        AggregationResult::Scalar(value) => writeln!(writer, "{}", format_number(*value))?,
        AggregationResult::Grouped(buckets) if buckets.is_empty() => {
            writeln!(writer, "No matching records.")?;
        }
        AggregationResult::Grouped(buckets) => {
            let width = buckets
                .iter()
                .map(|bucket| bucket.label.chars().count())
                .max()
                .unwrap_or(0);
            for bucket in buckets {
                writeln!(
                    writer,
                    "{:<width$}  {}",
                    bucket.label,
                    format_number(bucket.value)
                )?;
            }
        }
    }
    Ok(())
}
