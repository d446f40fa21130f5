use anyhow::{Context, Result};
use bqt::config::AppConfig;
use bqt::diagnostics::explain_query_error;
use bqt::job::{AssumeYes, Confirm, QueryOutput, ResultFormat};
use bqt::partition::PartitionSelection;
use bqt::sync::{PlaidClient, SqliteSyncStore, SyncMode, TransactionPuller};
use bqt::warehouse::{TableRef, WriteDisposition};
use bqt::{Bqt, CacheMode, QueryOptions};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "bqt", about = "Warehouse query and transaction sync tool", version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, env = "BQT_CONFIG")]
    config: Option<String>,

    /// Run against an in-process warehouse instead of the configured one
    #[arg(long)]
    local: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a query and print its rows
    Query(QueryArgs),
    /// Manage the result cache
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Manage warehouse tables
    #[command(subcommand)]
    Tables(TablesCommand),
    /// Pull transactions for every configured item
    Sync(SyncArgs),
}

#[derive(Args)]
struct QueryArgs {
    /// SQL text (reads --file when omitted)
    sql: Option<String>,

    #[arg(short, long, conflicts_with = "sql")]
    file: Option<PathBuf>,

    /// Run the query again and overwrite the cached result
    #[arg(long)]
    renew: bool,

    /// Neither read nor write the cache
    #[arg(long, conflicts_with = "renew")]
    no_cache: bool,

    #[arg(short, long, default_value = "table")]
    output: OutputFormat,

    /// Destination table as dataset.table
    #[arg(long, value_parser = parse_table_ref)]
    destination: Option<TableRef>,

    #[arg(long, requires = "destination")]
    write_disposition: Option<DispositionArg>,

    #[arg(long)]
    legacy_sql: bool,
}

#[derive(ValueEnum, Clone, Copy)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(ValueEnum, Clone, Copy)]
enum DispositionArg {
    Truncate,
    Append,
    Empty,
}

impl From<DispositionArg> for WriteDisposition {
    fn from(value: DispositionArg) -> Self {
        match value {
            DispositionArg::Truncate => WriteDisposition::Truncate,
            DispositionArg::Append => WriteDisposition::Append,
            DispositionArg::Empty => WriteDisposition::Empty,
        }
    }
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Remove the cached result of one query, or every entry with --all
    Clear {
        sql: Option<String>,
        #[arg(long, conflicts_with = "sql")]
        all: bool,
        /// Skip the confirmation prompt
        #[arg(long)]
        all_yes: bool,
    },
    /// Delete expired entries now
    Sweep,
}

#[derive(Subcommand)]
enum TablesCommand {
    /// Delete a table or a range of its date partitions
    Delete {
        #[arg(long)]
        dataset: String,
        /// Base table name; partitions are named <table>_YYYYMMDD
        table: String,
        #[arg(long, value_parser = parse_date)]
        start: Option<NaiveDate>,
        #[arg(long, value_parser = parse_date)]
        end: Option<NaiveDate>,
        #[arg(long)]
        all_partitions: bool,
        /// Skip the confirmation prompt
        #[arg(long)]
        all_yes: bool,
    },
}

#[derive(Args)]
struct SyncArgs {
    /// Page every item from the beginning instead of the latest cursors
    #[arg(long)]
    backfill: bool,

    /// Partition the cursors are committed to (default: today, UTC)
    #[arg(long, value_parser = parse_date)]
    partition: Option<NaiveDate>,
}

fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d"))
        .map_err(|_| format!("expected YYYYMMDD or YYYY-MM-DD, got {:?}", value))
}

fn parse_table_ref(value: &str) -> Result<TableRef, String> {
    match value.split_once('.') {
        Some((dataset, table)) if !dataset.is_empty() && !table.is_empty() => {
            Ok(TableRef::new(dataset, table))
        }
        _ => Err(format!("expected dataset.table, got {:?}", value)),
    }
}

/// Yes/no prompt on the terminal. Anything but an explicit yes is a no.
#[derive(Debug, Default)]
struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        let mut editor = match DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot open terminal for confirmation");
                return false;
            }
        };
        match editor.readline(&format!("{} [y/N] ", prompt)) {
            Ok(answer) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read confirmation");
                false
            }
        }
    }
}

fn confirmer(assume_yes: bool) -> Arc<dyn Confirm> {
    if assume_yes {
        Arc::new(AssumeYes)
    } else {
        Arc::new(TerminalConfirm)
    }
}

/// Token cancelled on the first Ctrl+C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            child.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    bqt::telemetry::init_telemetry(level)?;

    let config = AppConfig::load(cli.config.as_deref())?;
    let result = run(cli, config).await;
    bqt::telemetry::shutdown_telemetry();
    result
}

async fn run(cli: Cli, mut config: AppConfig) -> Result<()> {
    if cli.local {
        config.warehouse.kind = "memory".to_string();
    }
    if !matches!(cli.command, Command::Sync(_)) {
        config.validate()?;
    }

    match cli.command {
        Command::Query(args) => run_query(&config, cli.local, args).await,
        Command::Cache(command) => run_cache(&config, cli.local, command).await,
        Command::Tables(command) => run_tables(&config, cli.local, command).await,
        Command::Sync(args) => run_sync(&config, args).await,
    }
}

async fn run_query(config: &AppConfig, local: bool, args: QueryArgs) -> Result<()> {
    let sql = match (&args.sql, &args.file) {
        (Some(sql), _) => sql.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, None) => anyhow::bail!("Provide the query text or --file"),
    };

    let client = Bqt::from_config(config, local, Arc::new(TerminalConfirm)).await?;
    let options = QueryOptions {
        cache: if args.no_cache {
            CacheMode::Bypass
        } else if args.renew {
            CacheMode::Renew
        } else {
            CacheMode::Use
        },
        format: match args.output {
            OutputFormat::Table => ResultFormat::Arrow,
            OutputFormat::Json => ResultFormat::JsonRows,
        },
        destination: args.destination,
        write_disposition: args.write_disposition.map(Into::into),
        use_legacy_sql: args.legacy_sql,
    };

    let cancel = interrupt_token();
    match client.query(&sql, &options, &cancel).await {
        Ok(Some(output)) => print_output(&output),
        Ok(None) => {
            eprintln!("Query interrupted");
            Ok(())
        }
        Err(e) => anyhow::bail!(explain_query_error(&e, Some(&sql))),
    }
}

fn print_output(output: &QueryOutput) -> Result<()> {
    match output {
        QueryOutput::Arrow(rows) => {
            let table = datafusion::arrow::util::pretty::pretty_format_batches(&rows.batches)?;
            println!("{}", table);
        }
        QueryOutput::JsonRows(rows) => {
            println!("{}", serde_json::to_string_pretty(rows)?);
        }
    }
    Ok(())
}

async fn run_cache(config: &AppConfig, local: bool, command: CacheCommand) -> Result<()> {
    let client = Bqt::from_config(config, local, Arc::new(TerminalConfirm)).await?;
    match command {
        CacheCommand::Clear { sql, all, all_yes } => {
            if all {
                let prompt = format!("Clear every entry of the {} cache?", client.cache().kind());
                if !confirmer(all_yes).confirm(&prompt) {
                    println!("Nothing cleared");
                    return Ok(());
                }
                let removed = client.clear_all_cache().await?;
                println!("Cleared {} cache entries", removed);
            } else {
                let sql = sql.context("Provide the query text or --all")?;
                if client.clear_cache(&sql).await? {
                    println!("Cleared cached result");
                } else {
                    println!("No cached result for this query");
                }
            }
        }
        CacheCommand::Sweep => {
            let removed = client.sweep_cache().await?;
            println!("Swept {} expired cache entries", removed);
        }
    }
    Ok(())
}

async fn run_tables(config: &AppConfig, local: bool, command: TablesCommand) -> Result<()> {
    let client = Bqt::from_config(config, local, Arc::new(TerminalConfirm)).await?;
    match command {
        TablesCommand::Delete {
            dataset,
            table,
            start,
            end,
            all_partitions,
            all_yes,
        } => {
            let selection = PartitionSelection {
                dataset,
                base: table,
                start,
                end,
                all_partitions,
            };
            let deleted = client
                .delete_tables(&selection, confirmer(all_yes).as_ref())
                .await?;
            if deleted.is_empty() {
                println!("No tables deleted");
            }
            for table in deleted {
                println!("Deleted {}", table);
            }
        }
    }
    Ok(())
}

async fn run_sync(config: &AppConfig, args: SyncArgs) -> Result<()> {
    config.validate_sync()?;
    let sync = &config.sync;

    let db_path = sync.resolved_database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = SqliteSyncStore::open(&db_path)
        .await
        .with_context(|| format!("Failed to open cursor store {}", db_path.display()))?;

    let source = PlaidClient::new(
        sync.plaid_base_url.clone(),
        sync.client_id.clone().unwrap_or_default(),
        sync.secret.clone().unwrap_or_default(),
        sync.page_size,
    )?;

    let mode = if args.backfill {
        SyncMode::Backfill
    } else {
        SyncMode::Incremental
    };
    let partition = args.partition.unwrap_or_else(|| Utc::now().date_naive());

    let puller = TransactionPuller::new(Arc::new(source), Arc::new(store));
    let report = puller.run(&sync.items, mode, partition).await?;

    for item in &report.items {
        println!(
            "{}: {} added, {} modified, {} removed over {} page(s)",
            item.item_id, item.added, item.modified, item.removed, item.pages
        );
    }
    println!(
        "Committed {} cursor(s) to partition {}",
        report.committed.len(),
        bqt::partition::partition_suffix(report.partition)
    );
    Ok(())
}
