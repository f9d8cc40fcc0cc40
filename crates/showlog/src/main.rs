use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use showlog_config::AppConfig;
use showlog_mod_history::{
    self as history, HistoryConfig, HistoryConnection, HistoryError, HistoryResponse,
    DEFAULT_TRACKED_TABLES,
};

/// Inspect and drive the undo/redo history of a show database.
#[derive(Parser, Debug)]
#[command(name = "showlog", version, about)]
struct Cli {
    /// Config file to use instead of the default location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Show database to open instead of the configured one.
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create history tables and track the configured tables.
    Init,
    /// Start tracking the given tables.
    Track { tables: Vec<String> },
    /// Stop tracking the given tables.
    Untrack { tables: Vec<String> },
    /// Run SQL as one undoable operation.
    Exec { label: String, sql: String },
    /// Undo the most recent operation.
    Undo,
    /// Redo the most recently undone operation.
    Redo,
    /// Print history counters and stack sizes.
    Status,
    /// Set how many undo groups are kept (0 = unbounded).
    Limit { groups: i64 },
    /// Put every tracked table back into editing mode.
    Recover,
}

fn history_config(config: &AppConfig) -> HistoryConfig {
    let tracked_tables = if config.tracked_tables.is_empty() {
        DEFAULT_TRACKED_TABLES.iter().map(|t| t.to_string()).collect()
    } else {
        config.tracked_tables.clone()
    };
    HistoryConfig {
        group_limit: config.group_limit,
        tracked_tables,
        enforce_foreign_keys: config.enforce_foreign_keys,
    }
}

fn open_database(path: &Path, config: &HistoryConfig) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data dir: {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database: {}", path.display()))?;
    history::create_history_tables(&conn)?;
    if config.enforce_foreign_keys {
        conn.run_batch("PRAGMA foreign_keys = ON;")?;
    }
    Ok(conn)
}

fn report(kind: &str, response: HistoryResponse) -> Result<()> {
    if let Some(failure) = response.error {
        for cause in &failure.stack {
            tracing::debug!("caused by: {cause}");
        }
        bail!("{kind} failed: {}", failure.message);
    }
    if response.sql_statements.is_empty() {
        println!("Nothing to {kind}");
        return Ok(());
    }
    let tables: Vec<&str> = response.table_names.iter().map(String::as_str).collect();
    println!(
        "{kind}: {} statement(s) on {}",
        response.sql_statements.len(),
        tables.join(", ")
    );
    for sql in &response.sql_statements {
        tracing::debug!("{sql}");
    }
    Ok(())
}

fn print_status(conn: &Connection) -> Result<()> {
    let stats = history::read_stats(conn)?;
    let registry = history::TriggerRegistry::from_catalog(conn)?;
    println!("undo groups:    {}", history::get_undo_stack_length(conn)?);
    println!("redo groups:    {}", history::get_redo_stack_length(conn)?);
    println!("current undo:   {}", stats.cur_undo_group);
    println!("current redo:   {}", stats.cur_redo_group);
    println!("group limit:    {}", stats.group_limit);
    println!("history size:   {} bytes", history::calculate_history_size(conn)?);
    println!("tracked tables: {}", registry.len());
    for table in registry.tables() {
        if let Some(mode) = registry.mode(table) {
            println!("  {table} ({mode:?})");
        }
    }
    Ok(())
}

fn run(command: Command, conn: &Connection, config: &HistoryConfig) -> Result<()> {
    match command {
        Command::Init => {
            history::initialize_history(conn, config)?;
            print_status(conn)?;
        }
        Command::Track { tables } => {
            let tracked = history::create_all_undo_triggers(conn, &tables)?;
            println!("Tracking {}", tracked.join(", "));
        }
        Command::Untrack { tables } => {
            for table in &tables {
                history::drop_undo_triggers(conn, table)?;
            }
            println!("Stopped tracking {}", tables.join(", "));
        }
        Command::Exec { label, sql } => {
            history::transaction_with_history(conn, &label, |tx| tx.run_batch(&sql))
                .with_context(|| format!("Operation \"{label}\" was rolled back"))?;
            println!("Recorded \"{label}\" as undo group {}", history::get_current_undo_group(conn)? - 1);
        }
        Command::Undo => report("undo", history::perform_undo(conn))?,
        Command::Redo => report("redo", history::perform_redo(conn))?,
        Command::Status => print_status(conn)?,
        Command::Limit { groups } => {
            history::set_group_limit(conn, groups)?;
            println!("Group limit set to {groups}");
        }
        Command::Recover => {
            let recovered = history::recover_trigger_modes(conn)?;
            if recovered.is_empty() {
                println!("All tracked tables already in editing mode");
            } else {
                println!("Recovered {}", recovered.join(", "));
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::config_path);
    let app_config = AppConfig::load_or_create(&config_path);

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&app_config.log_filter)),
        )
        .init();

    let database = cli
        .database
        .clone()
        .unwrap_or_else(|| app_config.resolve_database_path(&AppConfig::data_dir()));
    tracing::info!("Opening {}", database.display());

    let config = history_config(&app_config);
    let conn = open_database(&database, &config)?;
    run(cli.command, &conn, &config).map_err(|e| {
        if let Some(err) = e.downcast_ref::<HistoryError>() {
            if err.is_invariant_violation() {
                tracing::error!("History invariant violated: {err}");
            }
        }
        e
    })
}
