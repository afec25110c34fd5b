use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tally_cli::commands::{import, process, query, schemas, status};
use tally_cli::{Cli, Commands, Config};
use tally_db::Database;

/// Open the configured database, ensuring the parent directory exists.
fn open_database(config: &Config) -> Result<Database> {
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }
    Database::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Logs go to stderr so stdout stays machine-readable
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    let Some(command) = &cli.command else {
        // No subcommand, show help
        use clap::CommandFactory;
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let config = Config::load_from(cli.config.as_deref()).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");
    let registry = config
        .registry()
        .context("invalid schema in configuration")?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match command {
        Commands::Import(args) => {
            let mut db = open_database(&config)?;
            import::run(io::stdin().lock(), &mut out, args, &registry, &mut db)?;
        }
        Commands::Process(args) => {
            let db = open_database(&config)?;
            process::run(&mut out, args, &registry, &db)?;
        }
        Commands::Query(args) => {
            let db = open_database(&config)?;
            query::run(&mut out, args, &registry, &db, &config.aggregation)?;
        }
        Commands::Schemas => schemas::run(&mut out, &registry)?,
        Commands::Status => {
            let db = open_database(&config)?;
            status::run(&mut out, &db, &config.database_path)?;
        }
    }
    out.flush()?;

    Ok(())
}
