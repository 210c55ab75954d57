//! Standalone runner for the six-stage wallet narrowing pipeline. Reads a
//! candidate address list from a file (one address per line) and an
//! optional TOML filter policy, then runs the funnel to completion.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use polyintel::batch_funnel::{BatchFunnel, FunnelConfig};
use polyintel::catalog::CatalogClient;
use polyintel::config::Config;
use polyintel::store::AnalyticalStore;

#[derive(Debug, Parser)]
#[command(name = "batch_funnel", about = "Run the batch wallet narrowing pipeline")]
struct Cli {
    /// File with one candidate wallet address per line.
    #[arg(long)]
    candidates: String,

    /// TOML filter policy file. Falls back to documented defaults if omitted.
    #[arg(long)]
    filters: Option<String>,

    /// Overrides DATABASE_PATH from the environment.
    #[arg(long)]
    database_path: Option<String>,
}

fn read_candidates(path: &str) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.to_lowercase())
        .collect())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "batch_funnel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(path) = cli.database_path {
        config.database_path = path;
    }

    let candidates = read_candidates(&cli.candidates)?;
    info!(count = candidates.len(), "loaded candidate wallets");

    let store = Arc::new(AnalyticalStore::open(&config.database_path)?);
    let catalog = Arc::new(CatalogClient::new(
        config.catalog_api_base_url.clone(),
        config.catalog_api_key.clone(),
    ));
    let filter_config = FunnelConfig::load(cli.filters.as_deref())?;

    let funnel = BatchFunnel::new(store, catalog, filter_config);
    let stats = funnel.run(candidates).await?;

    info!(
        copytrade = stats.copytrade_candidates,
        bots = stats.likely_bots,
        insiders = stats.insider_suspects,
        "batch funnel complete"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}
