//! Command-line front-end for autosqlite.
//!
//! Reads a schema file and validates, plans, applies or exports it against a database.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use autosqlite::{Migrator, OpenAction, Plan};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "autosqlite", version, about = "Keep a SQLite database in step with a declarative schema")]
struct Cli {
    /// Log debug output to stderr (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check that a schema executes against an empty database
    Validate {
        #[arg(long)]
        schema: PathBuf,
    },
    /// Show what `apply` would do, without changing anything
    Plan {
        #[arg(long)]
        schema: PathBuf,
        #[arg(long, env = "AUTOSQLITE_DB")]
        db: String,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Create, open or migrate the database so that it runs the schema
    Apply {
        #[arg(long)]
        schema: PathBuf,
        #[arg(long, env = "AUTOSQLITE_DB")]
        db: String,
        /// Give up waiting for another migration after this many seconds
        #[arg(long)]
        lock_timeout: Option<u64>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Write a migrated copy of the database to a new file
    Export {
        #[arg(long)]
        schema: PathBuf,
        #[arg(long, env = "AUTOSQLITE_DB")]
        db: String,
        #[arg(long)]
        new_db: String,
    },
    /// Show the schema versions recorded in the database
    History {
        #[arg(long, env = "AUTOSQLITE_DB")]
        db: String,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct PlanOutput<'a> {
    database: &'a str,
    plan: Plan,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let stdout = std::io::stdout();
    if let Err(e) = run(cli.command, &mut stdout.lock()) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(command: Commands, out: &mut impl Write) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Validate { schema } => {
            let text = read_schema(&schema)?;
            Migrator::new().validate(&text)?;
            writeln!(out, "Schema {} is valid.", schema.display())?;
        }
        Commands::Plan { schema, db, json } => {
            let text = read_schema(&schema)?;
            let plan = Migrator::new().plan(&text, db.as_str())?;
            if json {
                serde_json::to_writer_pretty(&mut *out, &PlanOutput { database: &db, plan: plan.clone() })?;
                writeln!(out)?;
            } else {
                writeln!(out, "{}", describe_plan(&plan))?;
            }
        }
        Commands::Apply {
            schema,
            db,
            lock_timeout,
            json,
        } => {
            let text = read_schema(&schema)?;
            let migrator = Migrator::new().with_lock_timeout(lock_timeout.map(Duration::from_secs));
            let (_conn, report) = migrator.open_with_report(&text, db.as_str())?;
            if json {
                serde_json::to_writer_pretty(&mut *out, &report)?;
                writeln!(out)?;
            } else {
                let verb = match report.action {
                    OpenAction::Created => "Created",
                    OpenAction::Opened => "Opened",
                    OpenAction::Stamped => "Stamped",
                    OpenAction::Migrated => "Migrated",
                };
                writeln!(out, "{} {} at schema version {}.", verb, db, report.ordinal)?;
                for table in &report.tables {
                    writeln!(out, "  {}: {} rows copied", table.table, table.rows_copied)?;
                }
                if let Some(backup) = &report.backup_path {
                    writeln!(out, "Backup written to {}.", backup.display())?;
                }
            }
        }
        Commands::Export { schema, db, new_db } => {
            let text = read_schema(&schema)?;
            let (_conn, report) =
                Migrator::new().migrate_to_new_file_with_report(&text, db.as_str(), new_db.as_str())?;
            writeln!(
                out,
                "Exported {} to {} at schema version {} ({} rows copied).",
                db,
                new_db,
                report.ordinal,
                report.rows_copied()
            )?;
        }
        Commands::History { db, json } => {
            let history = Migrator::new().history(db.as_str())?;
            if json {
                serde_json::to_writer_pretty(&mut *out, &history)?;
                writeln!(out)?;
            } else if history.is_empty() {
                writeln!(out, "No schema versions recorded.")?;
            } else {
                for version in &history {
                    writeln!(
                        out,
                        "{:>4}  {}  {}",
                        version.ordinal,
                        version.applied_at.to_rfc3339(),
                        &version.content_hash[..12.min(version.content_hash.len())]
                    )?;
                }
            }
        }
    }
    Ok(())
}

fn read_schema(path: &Path) -> Result<String, String> {
    tracing::debug!(path = %path.display(), "Reading schema file");
    fs::read_to_string(path).map_err(|e| format!("could not read schema file {}: {}", path.display(), e))
}

fn describe_plan(plan: &Plan) -> &'static str {
    match plan {
        Plan::CreateFresh => "create: no database exists yet, it will be created from the schema",
        Plan::OpenAsIs => "open: the database already runs this schema",
        Plan::Stamp => "stamp: the database already has this structure, only the lineage is updated",
        Plan::Migrate => "migrate: the database will be backed up and rebuilt with the new schema",
        Plan::RejectBackward => "reject: this schema was superseded earlier in the database's lineage",
    }
}
