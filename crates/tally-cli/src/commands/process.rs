//! Process command: prints typed, enriched records as JSONL.

use std::io::Write;

use anyhow::Result;
use clap::Args;

use tally_core::{ModelRegistry, RecordQuery};
use tally_db::Database;

use super::{Target, load_records};

#[derive(Debug, Args)]
pub struct ProcessArgs {
    #[command(flatten)]
    pub target: Target,

    /// Maximum number of records to print.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Number of records to skip.
    #[arg(long)]
    pub offset: Option<usize>,
}

pub fn run<W: Write>(
    writer: &mut W,
    args: &ProcessArgs,
    registry: &ModelRegistry,
    db: &Database,
) -> Result<usize> {
    let model = args.target.model(registry)?;
    let query = RecordQuery {
        limit: args.limit,
        offset: args.offset,
    };
    let records = load_records(db, &model, &query)?;
    for record in &records {
        writeln!(writer, "{}", serde_json::to_string(record)?)?;
    }
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{TimeZone, Utc};
    use insta::assert_snapshot;
    use serde_json::json;
    use tally_core::{RawRecord, SchemaDefinition};

    fn seeded() -> (ModelRegistry, Database) {
        let registry = ModelRegistry::new();
        registry
            .register_schema("Bar", SchemaDefinition::default())
            .unwrap();
        let model = registry.get_model("Bar", "acme").unwrap();
        let records: Vec<RawRecord> = [
            json!({"fecha": "15/01/2024", "ventas": "1,250", "activo": "sí"}),
            json!({"fecha": "", "ventas": "n/a"}),
        ]
        .into_iter()
        .map(|v| v.as_object().unwrap().clone())
        .collect();
        let mut db = Database::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap();
        db.insert_records_at(&model, &records, now).unwrap();
        (registry, db)
    }

    fn args(limit: Option<usize>) -> ProcessArgs {
        ProcessArgs {
            target: Target {
                tenant: "acme".to_string(),
                schema: "Bar".to_string(),
            },
            limit,
            offset: None,
        }
    }

    #[test]
    fn process_prints_enriched_records() {
        let (registry, db) = seeded();
        let mut output = Vec::new();
        let printed = run(&mut output, &args(None), &registry, &db).unwrap();
        assert_eq!(printed, 2);

        let output = String::from_utf8(output).unwrap();
        let mut lines = output.lines();
        let first: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(first["fecha"], "2024-01-15T00:00:00");
        assert_eq!(first["ventas"], 1250.0);
        assert_eq!(first["activo"], true);
        assert_eq!(first["fecha_monthName"], "Enero");
        assert_eq!(first["fecha_dayName"], "Lunes");
        assert_eq!(first["fecha_weekLabel"], "2024-W03");
        assert_eq!(first["_id"], "1");
        assert_eq!(first["createdAt"], "2024-02-01T08:00:00Z");

        assert_snapshot!(lines.next().unwrap(), @r#"{"_id":"2","createdAt":"2024-02-01T08:00:00Z","fecha":null,"ventas":"n/a"}"#);
    }

    #[test]
    fn process_respects_limit() {
        let (registry, db) = seeded();
        let mut output = Vec::new();
        let printed = run(&mut output, &args(Some(1)), &registry, &db).unwrap();
        assert_eq!(printed, 1);
        assert_eq!(String::from_utf8(output).unwrap().lines().count(), 1);
    }

    #[test]
    fn process_rejects_empty_tenant() {
        let (registry, db) = seeded();
        let mut args = args(None);
        args.target.tenant = "  ".to_string();
        let err = run(&mut Vec::new(), &args, &registry, &db).unwrap_err();
        assert!(format!("{err:#}").contains("invalid tenant"));
    }
}
