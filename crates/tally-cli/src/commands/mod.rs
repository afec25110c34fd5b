//! CLI subcommand implementations.

pub mod import;
pub mod process;
pub mod query;
pub mod schemas;
pub mod status;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use tally_core::{CompiledModel, ModelRegistry, RecordQuery, RecordSource, Record, process_dataset};

/// The tenant collection a command operates on.
#[derive(Debug, Clone, Args)]
pub struct Target {
    /// Tenant owning the records.
    #[arg(long)]
    pub tenant: String,

    /// Registered schema name (e.g., `Bar`).
    #[arg(long)]
    pub schema: String,
}

impl Target {
    /// Resolves the compiled model for this tenant and schema.
    pub fn model(&self, registry: &ModelRegistry) -> Result<Arc<CompiledModel>> {
        registry
            .get_model(&self.schema, &self.tenant)
            .with_context(|| format!("cannot resolve {} for tenant {:?}", self.schema, self.tenant))
    }
}

/// Fetches a model's records and runs them through inference.
fn load_records<S>(source: &S, model: &CompiledModel, query: &RecordQuery) -> Result<Vec<Record>>
where
    S: RecordSource,
{
    let raw = source
        .fetch(model, query)
        .with_context(|| format!("failed to fetch records from {}", model.collection))?;
    let records = process_dataset(&raw);
    tracing::debug!(collection = %model.collection, records = records.len(), "loaded records");
    Ok(records)
}
