//! VeldDB command-line query runner
//!
//! Parses, plans, compiles, and executes each statement of a SQL file (or
//! standard input) against a JSON catalog. A failing statement is reported
//! and later statements still run; the exit code is non-zero when any
//! statement failed. `load` serializes CSV data into a table's binary
//! column files.

use std::io::Read;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use veld_catalog::Database;
use veld_common::{EngineConfig, SkinnerMode};
use veld_parser::Statement;
use veld_plan::Planner;

mod load;

/// The VeldDB compiling query engine
#[derive(Parser)]
#[command(name = "veld")]
#[command(about = "Adaptive compiling SQL query engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the statements of a SQL file ('-' reads standard input)
    Run {
        /// Path to the SQL file, or '-' for stdin
        sql: String,

        /// Path to the JSON catalog manifest
        #[arg(long)]
        catalog: String,

        /// SkinnerJoin implementation: permute or recompile
        #[arg(long, default_value = "permute")]
        skinner: String,

        /// Plan single-table filters as static ScanSelect instead of the
        /// adaptive scan
        #[arg(long)]
        no_adaptive_scan: bool,
    },

    /// Parse and plan the statements without executing them
    Check {
        /// Path to the SQL file, or '-' for stdin
        sql: String,

        /// Path to the JSON catalog manifest
        #[arg(long)]
        catalog: String,
    },

    /// Serialize a CSV file into a table's binary column files
    Load {
        /// Path to the CSV file (comma-separated, no quoting; empty fields
        /// read as NULL, dates as yyyy-mm-dd)
        csv: String,

        /// Path to the JSON catalog manifest
        #[arg(long)]
        catalog: String,

        /// Target table in the catalog
        #[arg(long)]
        table: String,
    },
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init();

    let code = match run(cli) {
        Ok(failed) if failed == 0 => 0,
        Ok(failed) => {
            eprintln!("{failed} statement(s) failed");
            1
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            2
        }
    };
    std::process::exit(code);
}

fn read_sql(path: &str) -> Result<String> {
    if path == "-" {
        let mut out = String::new();
        std::io::stdin()
            .read_to_string(&mut out)
            .context("reading standard input")?;
        Ok(out)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading '{path}'"))
    }
}

/// Runs the statements; returns how many failed.
fn run(cli: Cli) -> Result<usize> {
    match cli.command {
        Commands::Run { sql, catalog, skinner, no_adaptive_scan } => {
            let skinner: SkinnerMode = skinner.parse()?;
            let config = EngineConfig { skinner, adaptive_scan: !no_adaptive_scan };
            let db = Database::from_manifest_file(&catalog)?;
            let source = read_sql(&sql)?;
            execute_statements(&source, &db, &config, false)
        }
        Commands::Check { sql, catalog } => {
            let db = Database::from_manifest_file(&catalog)?;
            let source = read_sql(&sql)?;
            execute_statements(&source, &db, &EngineConfig::new(), true)
        }
        Commands::Load { csv, catalog, table } => {
            let db = Database::from_manifest_file(&catalog)?;
            let target = db
                .table(&table)
                .with_context(|| format!("unknown table '{table}'"))?;
            let rows = load::load_table(&csv, target)?;
            println!("loaded {rows} row(s) into '{}'", target.name);
            Ok(0)
        }
    }
}

fn execute_statements(
    source: &str,
    db: &Database,
    config: &EngineConfig,
    plan_only: bool,
) -> Result<usize> {
    // A parse error poisons the whole input (statement boundaries are
    // unknown past it).
    let statements = veld_parser::parse(source)?;

    let mut failed = 0;
    for (i, statement) in statements.iter().enumerate() {
        let Statement::Select(stmt) = statement;
        let result = Planner::new(db, config).plan(stmt).and_then(|plan| {
            if plan_only {
                print!("{}", plan.explain());
                return Ok(());
            }
            let query = veld_compile::compile_query(&plan, db, config)?;
            query.execute()
        });
        if let Err(e) = result {
            eprintln!("statement {}: {e}", i + 1);
            failed += 1;
        }
    }
    Ok(failed)
}
