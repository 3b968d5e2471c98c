use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use feedmart_storage::{ensure_schema, DbCreds, RetryPolicy};
use feedmart_warehouse::{GraphRunner, PipelineParams, ProductPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "feedmart")]
#[command(about = "Product feed warehouse loader")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reload staging from the feed CSV and refresh dimensions, facts, and
    /// the aggregate.
    Run {
        /// Path to the product feed CSV (`sku,name,description` with header).
        #[arg(long, default_value = "./data/products.csv")]
        csv: PathBuf,
        /// Rows per ingestion batch.
        #[arg(long, default_value_t = 1_000_000)]
        chunk_size: usize,
        /// Report per-chunk load progress.
        #[arg(long)]
        verbose: bool,
        /// Worker bound for independent pipeline branches.
        #[arg(long, default_value_t = 4)]
        max_parallel: usize,
    },
    /// Create the warehouse schema and tables if absent.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let creds = DbCreds::from_env();

    match cli.command {
        Commands::Run {
            csv,
            chunk_size,
            verbose,
            max_parallel,
        } => {
            let pool = creds.connect(8).await?;
            let params = PipelineParams {
                csv_path: csv,
                chunk_size,
                verbose,
            };
            let runner = GraphRunner {
                max_parallel,
                retry: RetryPolicy::default(),
            };
            let report = ProductPipeline::new(pool, params)
                .with_runner(runner)
                .run_once()
                .await;

            for task in &report.tasks {
                match &task.error {
                    Some(error) => println!(
                        "{:<32} {:?} (attempts: {}): {error}",
                        task.name, task.outcome, task.attempts
                    ),
                    None => println!(
                        "{:<32} {:?} (attempts: {})",
                        task.name, task.outcome, task.attempts
                    ),
                }
            }
            println!(
                "run {} finished in {}s",
                report.run_id,
                (report.finished_at - report.started_at).num_seconds()
            );
            if !report.succeeded() {
                bail!("pipeline run failed");
            }
        }
        Commands::Migrate => {
            let pool = creds.connect(1).await?;
            ensure_schema(&pool).await?;
            println!("warehouse schema ensured");
        }
    }

    Ok(())
}
