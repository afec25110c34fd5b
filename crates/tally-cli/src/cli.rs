//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::commands::import::ImportArgs;
use crate::commands::process::ProcessArgs;
use crate::commands::query::QueryArgs;

/// Multi-tenant aggregation engine for operations dashboards.
///
/// Stores uploaded records per tenant, infers their types and aggregates them
/// into dashboard-ready figures.
#[derive(Debug, Parser)]
#[command(name = "tally", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Import JSONL records from stdin into a tenant collection.
    Import(ImportArgs),

    /// Print a tenant's records typed and enriched, one JSON object per line.
    Process(ProcessArgs),

    /// Filter and aggregate a tenant's records.
    Query(QueryArgs),

    /// List registered schemas.
    Schemas,

    /// Show the database and its collections.
    Status,
}
