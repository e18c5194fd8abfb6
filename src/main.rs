use clap::Parser;
use lead_sniper::config::Config;
use lead_sniper::pipeline::Pipeline;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Refine, enrich, score and tier a lead export.
#[derive(Parser, Debug)]
#[command(name = "lead-sniper", version, about, long_about = None)]
struct Cli {
    /// Input CSV export.
    input: PathBuf,

    /// Output CSV path.
    output: PathBuf,

    /// Write every tier, not only S/AAA/AA/A.
    #[arg(long)]
    all_tiers: bool,

    /// Run statistics sidecar (defaults to `<output>.stats.json`).
    #[arg(long)]
    stats: Option<PathBuf>,

    /// Enable the external gateways.
    #[arg(long)]
    live: bool,

    /// Ignore fresh cache entries and refetch.
    #[arg(long)]
    force_refresh: bool,
}

/// Main entry point.
///
/// Loads configuration from the environment (and `.env`), applies CLI
/// overrides, then runs the pipeline. Ctrl-C stops the run after the
/// chunks in flight.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lead_sniper=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::from_env()?;
    config.export_all_tiers |= cli.all_tiers;
    config.live_data |= cli.live;
    config.force_refresh |= cli.force_refresh;
    tracing::info!("Configuration loaded successfully");

    let pipeline = Pipeline::new(config)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("⚠️ Ctrl-C received, finishing chunks in flight");
                cancel.cancel();
            }
        }
    });

    let stats = pipeline
        .run_files(&cli.input, &cli.output, cli.stats.as_deref(), cancel)
        .await?;

    tracing::info!(
        "✓ {} of {} rows exported to {}",
        stats.rows_exported,
        stats.rows_in,
        cli.output.display()
    );
    Ok(())
}
