//! db_mirror: mirror a remote MySQL database into a local one
//!
//! # Usage
//!
//! ```bash
//! # Full run using mirror.toml
//! db_mirror --config mirror.toml
//!
//! # Show what would change without writing anything
//! db_mirror --config mirror.toml --dry-run
//!
//! # Only compare schemas, report as JSON
//! db_mirror --config mirror.toml --validate-only --format json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;

use db_mirror::config::{self, OrderStrategy, SyncMode};
use db_mirror::utils::init_logging;
use db_mirror::Error;

#[derive(Parser)]
#[command(name = "db_mirror")]
#[command(version)]
#[command(about = "One-way schema and data replication from a remote MySQL database", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "mirror.toml")]
    config: String,

    /// Compute and report changes without writing to the local database
    #[arg(long)]
    dry_run: bool,

    /// Only compare schemas
    #[arg(long)]
    validate_only: bool,

    /// Override the configured sync mode
    #[arg(short, long, value_enum)]
    mode: Option<CliMode>,

    /// Override the configured table order
    #[arg(long, value_enum)]
    order: Option<CliOrder>,

    /// Additional tables to exclude
    #[arg(short = 'x', long = "exclude")]
    exclude: Vec<String>,

    /// Report format
    #[arg(short, long, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliMode {
    Incremental,
    DropRecreate,
    MultiPass,
}

impl From<CliMode> for SyncMode {
    fn from(val: CliMode) -> Self {
        match val {
            CliMode::Incremental => SyncMode::Incremental,
            CliMode::DropRecreate => SyncMode::DropRecreate,
            CliMode::MultiPass => SyncMode::MultiPass,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CliOrder {
    Dependency,
    Alphabetical,
    CustomPrefix,
}

impl From<CliOrder> for OrderStrategy {
    fn from(val: CliOrder) -> Self {
        match val {
            CliOrder::Dependency => OrderStrategy::Dependency,
            CliOrder::Alphabetical => OrderStrategy::Alphabetical,
            CliOrder::CustomPrefix => OrderStrategy::CustomPrefix,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config))?;
    init_logging(&config.logging)?;

    config.sync.dry_run |= cli.dry_run;
    config.sync.validate_only |= cli.validate_only;
    if let Some(mode) = cli.mode {
        config.sync.mode = mode.into();
    }
    if let Some(order) = cli.order {
        config.sync.order = order.into();
    }
    config.filters.excluded_tables.extend(cli.exclude);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing current table");
            on_signal.cancel();
        }
    });

    let report = match db_mirror::run_with_config(config, &cancel).await {
        Ok(report) => report,
        Err(Error::Cancelled(stats)) => {
            match cli.format {
                OutputFormat::Text => print!("{}", stats),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
            }
            anyhow::bail!("synchronization cancelled after {} table(s)", stats.tables_processed);
        }
        Err(e) => return Err(e.into()),
    };

    match cli.format {
        OutputFormat::Text => print!("{}", report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    if !report.statistics.is_success() {
        std::process::exit(2);
    }
    Ok(())
}
