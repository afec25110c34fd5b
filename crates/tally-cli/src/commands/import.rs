//! Import command for storing uploaded records in a tenant collection.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use clap::Args;

use tally_core::{ModelRegistry, RawRecord};
use tally_db::Database;

use super::Target;

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[command(flatten)]
    pub target: Target,
}

/// Reads JSONL records from `reader` and appends them to the collection.
pub fn run<R: BufRead, W: Write>(
    reader: R,
    writer: &mut W,
    args: &ImportArgs,
    registry: &ModelRegistry,
    db: &mut Database,
) -> Result<usize> {
    let model = args.target.model(registry)?;
    let records = parse_records(reader)?;
    let inserted = db
        .insert_records(&model, &records)
        .with_context(|| format!("failed to store records in {}", model.collection))?;
    tracing::info!(collection = %model.collection, inserted, "import complete");
    writeln!(writer, "Imported {inserted} records into {}", model.collection)?;
    Ok(inserted)
}

fn parse_records<R: BufRead>(reader: R) -> Result<Vec<RawRecord>> {
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", idx + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record: RawRecord = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid record on line {}", idx + 1))?;
        records.push(record);
    }
    Ok(records)
}
