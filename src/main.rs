use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use kc311_pipeline::constants::METRICS_JOB;
use kc311_pipeline::error::{PipelineError, Stage};
use kc311_pipeline::infra::{BigQueryTable, SocrataSource};
use kc311_pipeline::pipeline::{Orchestrator, RunOptions, RunOutcome};
use kc311_pipeline::{logging, metrics, Config};

#[derive(Parser)]
#[command(name = "kc311_pipeline")]
#[command(about = "Load new Kansas City 311 service requests into BigQuery")]
#[command(version)]
struct Cli {
    /// TOML config file (defaults to ./config.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the number of records fetched from the source
    #[arg(long)]
    fetch_limit: Option<usize>,

    /// Run every stage except the final upload
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load environment variables
    dotenv::dotenv().ok();

    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(limit) = cli.fetch_limit {
        config.fetch_limit = limit;
        config.validate()?;
    }

    let _log_guard = logging::init_logging(&config.log_dir);
    let metrics_handle = metrics::init_metrics();

    let result = run(&config, cli.dry_run).await;

    if let (Some(handle), Some(url)) = (&metrics_handle, &config.pushgateway_url) {
        metrics::push_metrics(handle, url, METRICS_JOB).await;
    }

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Pipeline failed: {}", e);
            println!("❌ FAILED: {}", e);
            Err(e.into())
        }
    }
}

async fn run(config: &Config, dry_run: bool) -> Result<(), PipelineError> {
    info!(
        "🚀 Starting pipeline: {}/{} → {}",
        config.socrata_domain,
        config.socrata_dataset_id,
        config.table()
    );

    let sink = BigQueryTable::connect(config)
        .await
        .map_err(PipelineError::at(Stage::Connect))?;
    let source = SocrataSource::from_config(config);

    let options = RunOptions {
        dry_run,
        ..RunOptions::from_config(config)
    };
    let report = Orchestrator::new(&source, &sink, options).run().await?;

    info!(
        report = %serde_json::to_string(&report).unwrap_or_default(),
        "Run complete"
    );
    match report.outcome {
        RunOutcome::Loaded { rows } => {
            println!("✅ SUCCESS: loaded {} new records", rows);
        }
        RunOutcome::NoNewRecords => {
            println!("✅ SUCCESS: no new unique data to upload");
        }
        RunOutcome::DryRun { would_load } => {
            println!("📝 Dry run: {} new records would be uploaded", would_load);
        }
    }
    println!(
        "   Fetched: {}  Duplicates filtered: {}  Latest existing date: {}",
        report.fetched,
        report.duplicates_filtered,
        report.latest_existing_date.as_deref().unwrap_or("none")
    );
    Ok(())
}
