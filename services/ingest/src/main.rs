//! Ingest Service - Loads daily case-report snapshots into Postgres
//!
//! Responsibilities:
//! - Discover dated CSV snapshots in the data directory
//! - Normalize drifting column layouts and country names
//! - Load each file through stage → merge → clear → commit
//! - Record per-file outcomes in ingest_runs
//!
//! Re-running over files already loaded inserts nothing: rows are only
//! ever added when their (country, state, admin2, timestamp) is new.

use anyhow::{Context, Result};
use clap::Parser;
use ingest::coordinator::{CoordinatorConfig, FailurePolicy, IngestReport, LoadMode};
use ingest::source::survey_columns;
use ingest::{
    discover_snapshots, AliasTables, CsvDirectorySource, IngestionCoordinator, PgStore,
    RecordNormalizer, RecordSource, SnapshotFile,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ingest", about = "Loads daily case-report snapshots")]
struct Args {
    /// Directory holding MM-DD-YYYY.csv snapshots (overrides DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Alias table JSON (defaults to the built-in table)
    #[arg(long)]
    aliases: Option<PathBuf>,

    /// Files loaded at once (overrides INGEST_CONCURRENCY)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Stage-and-merge or direct insert-if-absent
    #[arg(long, value_enum, default_value_t = LoadMode::Staged)]
    mode: LoadMode,

    /// Stop the run on the first failed file, or keep going
    #[arg(long, value_enum, default_value_t = FailurePolicy::Abort)]
    on_error: FailurePolicy,

    /// Only load these file names (repeatable)
    #[arg(long = "file")]
    files: Vec<String>,

    /// Read and normalize only - don't touch the database
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Print the distinct column layouts found across snapshots and exit
    #[arg(long, default_value = "false")]
    list_schemas: bool,

    /// Database pool size (defaults to concurrency + 1)
    #[arg(long)]
    max_connections: Option<u32>,
}

#[derive(Debug, Clone)]
struct Config {
    db_url: Option<String>,
    data_dir: PathBuf,
    concurrency: usize,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            db_url: std::env::var("DB_URL").ok(),
            data_dir: PathBuf::from(
                std::env::var("DATA_DIR").unwrap_or_else(|_| "./data/daily_reports".to_string()),
            ),
            concurrency: parse_concurrency(std::env::var("INGEST_CONCURRENCY").ok())?,
        })
    }

    /// CLI flags win over the environment.
    fn apply(mut self, args: &Args) -> Self {
        if let Some(dir) = &args.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(n) = args.concurrency {
            self.concurrency = n;
        }
        self.concurrency = self.concurrency.max(1);
        self
    }
}

/// Unset means the default of 4; anything else must be a positive integer.
fn parse_concurrency(raw: Option<String>) -> Result<usize> {
    let Some(raw) = raw else {
        return Ok(4);
    };
    let n: usize = raw
        .trim()
        .parse()
        .with_context(|| format!("INGEST_CONCURRENCY must be a positive integer, got '{}'", raw))?;
    if n == 0 {
        anyhow::bail!("INGEST_CONCURRENCY must be at least 1");
    }
    Ok(n)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn load_aliases(path: Option<&PathBuf>) -> Result<AliasTables> {
    match path {
        Some(p) => AliasTables::from_path(p)
            .with_context(|| format!("Failed to load alias table {}", p.display())),
        None => AliasTables::builtin().context("Built-in alias table is invalid"),
    }
}

/// Keeps only the files named with `--file`; all of them when none were given.
fn select_files(all: Vec<SnapshotFile>, wanted: &[String]) -> Result<Vec<SnapshotFile>> {
    if wanted.is_empty() {
        return Ok(all);
    }
    for name in wanted {
        if !all.iter().any(|f| &f.name == name) {
            anyhow::bail!("No snapshot named {} in data directory", name);
        }
    }
    Ok(all
        .into_iter()
        .filter(|f| wanted.iter().any(|w| w == &f.name))
        .collect())
}

// =============================================================================
// MODES
// =============================================================================

fn list_schemas(source: &dyn RecordSource, files: &[SnapshotFile]) -> Result<()> {
    let layouts = survey_columns(source, files).context("Failed to survey snapshots")?;
    println!("Found {} distinct column layouts:", layouts.len());
    for (i, (headers, names)) in layouts.iter().enumerate() {
        println!(
            "\n[{}] {} files, {} .. {}",
            i + 1,
            names.len(),
            names.first().map(String::as_str).unwrap_or(""),
            names.last().map(String::as_str).unwrap_or("")
        );
        println!("    {}", headers.join(" | "));
    }
    Ok(())
}

fn dry_run(
    source: &dyn RecordSource,
    normalizer: &RecordNormalizer,
    files: &[SnapshotFile],
) -> Result<()> {
    let mut total = 0;
    for file in files {
        let snapshot = source
            .read(file)
            .with_context(|| format!("Failed to read {}", file.name))?;
        let map = normalizer.column_map(&snapshot.rows);
        if !map.dropped().is_empty() {
            debug!(file = %file.name, columns = ?map.dropped(), "dropped unrecognized columns");
        }
        let records = normalizer.normalize_file(&snapshot.rows, file.reporting_date);
        println!(
            "{}: {} records, {} columns dropped, {} attributes missing",
            file.name,
            records.len(),
            map.dropped().len(),
            map.missing().len()
        );
        if total == 0 {
            for (i, record) in records.iter().take(3).enumerate() {
                println!("  [{}] {}", i + 1, serde_json::to_string(record)?);
            }
            if records.len() > 3 {
                println!("  ... and {} more", records.len() - 3);
            }
        }
        total += records.len();
    }
    println!("\nDry run - {} records normalized, nothing saved", total);
    Ok(())
}

fn print_summary(report: &IngestReport) {
    println!("\n=== Ingest Summary ===");
    println!("Run ID:    {}", report.run_id);
    println!("Files:     {}", report.outcomes.len());
    println!("Committed: {}", report.committed());
    println!("Failed:    {}", report.failures().len());
    println!("Records:   {}", report.records());
    println!("Inserted:  {}", report.inserted());
    for failed in report.failures() {
        println!(
            "  FAILED {} after {}: {}",
            failed.file,
            failed.failed_after.map(|s| s.as_str()).unwrap_or("?"),
            failed.error.as_deref().unwrap_or("")
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing();
    let config = Config::from_env()?.apply(&args);

    println!("=== Case Report Ingest ===");
    println!("Data dir: {}", config.data_dir.display());
    println!(
        "Mode: {}",
        if args.dry_run {
            "dry-run".to_string()
        } else {
            format!("{:?}", args.mode).to_lowercase()
        }
    );

    let aliases = Arc::new(load_aliases(args.aliases.as_ref())?);
    info!(version = aliases.version(), "alias table loaded");

    let discovered = discover_snapshots(&config.data_dir)
        .with_context(|| format!("Failed to list {}", config.data_dir.display()))?;
    let files = select_files(discovered, &args.files)?;
    if files.is_empty() {
        warn!(dir = %config.data_dir.display(), "no snapshots found");
        return Ok(());
    }
    println!("Snapshots: {}", files.len());

    let source = Arc::new(CsvDirectorySource::new());
    let normalizer = Arc::new(RecordNormalizer::new(aliases));

    if args.list_schemas {
        return list_schemas(source.as_ref(), &files);
    }
    if args.dry_run {
        return dry_run(source.as_ref(), &normalizer, &files);
    }

    let db_url = config.db_url.as_deref().context("DB_URL env var missing")?;
    let max_connections = args
        .max_connections
        .unwrap_or(config.concurrency as u32 + 1);
    let store = PgStore::connect(db_url, max_connections)
        .await
        .context("Failed to connect to database")?;
    store.migrate().await.context("Failed to apply migrations")?;

    let coordinator = IngestionCoordinator::new(
        source,
        normalizer,
        Arc::new(store),
        CoordinatorConfig {
            concurrency: config.concurrency,
            mode: args.mode,
            on_error: args.on_error,
        },
    );

    let report = coordinator.ingest_all(files).await.context("Ingest run aborted")?;
    print_summary(&report);

    let failed = report.failures().len();
    if failed > 0 {
        anyhow::bail!("{} of {} files failed", failed, report.outcomes.len());
    }
    Ok(())
}
