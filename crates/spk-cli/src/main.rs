use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spk_etl::{EtlConfig, EtlPipeline, PassKind, RunSummary};
use spk_storage::{MemoryWarehouse, PgWarehouse, Warehouse};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "spk-cli")]
#[command(about = "Sparkify songplay ETL command-line interface")]
struct Cli {
    /// Overrides DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,
    /// Overrides SPK_WORKSPACE_ROOT.
    #[arg(long, global = true)]
    workspace_root: Option<PathBuf>,
    /// Overrides SPK_PIPELINE_CONFIG.
    #[arg(long, global = true)]
    pipeline: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load song files, then log files, committing after each file.
    Run {
        /// Load into an in-memory warehouse and print row counts.
        #[arg(long)]
        dry_run: bool,
    },
    /// Create the star-schema tables.
    InitSchema {
        /// Drop existing tables first.
        #[arg(long)]
        reset: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = EtlConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(root) = cli.workspace_root {
        config.workspace_root = root;
    }
    if let Some(pipeline) = cli.pipeline {
        config.pipeline_config = Some(pipeline);
    }

    match cli.command.unwrap_or(Commands::Run { dry_run: false }) {
        Commands::Run { dry_run: true } => {
            let warehouse = MemoryWarehouse::new();
            let summary = run_pipeline(&config, &warehouse).await?;
            let counts = warehouse.row_counts().await?;
            print_summary(&summary);
            println!(
                "dry run rows: songs={} artists={} users={} time={} songplays={}",
                counts.songs, counts.artists, counts.users, counts.time, counts.songplays
            );
        }
        Commands::Run { dry_run: false } => {
            let warehouse = PgWarehouse::connect(&config.database_url)
                .await
                .context("connecting to warehouse")?;
            let summary = run_pipeline(&config, &warehouse).await?;
            print_summary(&summary);
        }
        Commands::InitSchema { reset } => {
            let warehouse = PgWarehouse::connect(&config.database_url)
                .await
                .context("connecting to warehouse")?;
            if reset {
                warehouse.drop_schema().await.context("dropping tables")?;
            }
            warehouse.create_schema().await.context("creating tables")?;
            info!(reset, "schema ready");
        }
    }

    Ok(())
}

async fn run_pipeline(config: &EtlConfig, warehouse: &dyn Warehouse) -> Result<RunSummary> {
    let spec = config.pipeline_spec()?;
    let mut stdout = std::io::stdout();
    EtlPipeline::new(warehouse, spec).run(&mut stdout).await
}

fn print_summary(summary: &RunSummary) {
    let files_for = |kind: PassKind| -> usize {
        summary
            .passes
            .iter()
            .filter(|p| p.kind == kind)
            .map(|p| p.files_processed)
            .sum()
    };
    let totals = summary.totals();
    println!(
        "run complete: run_id={} song_files={} log_files={} songplays={} resolved={}",
        summary.run_id,
        files_for(PassKind::Songs),
        files_for(PassKind::Logs),
        totals.songplays,
        totals.resolved
    );
}
