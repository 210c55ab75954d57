//! Polymarket intelligence pipeline: live trade ingestion, wallet discovery,
//! insider scoring, and copy-trade execution, wired into one process.

#![allow(dead_code, unused_variables)]

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use polyintel::catalog::CatalogClient;
use polyintel::clob::{
    ClobBookQuoteSource, ClobStats, ExecutionAdapter, PaperExecutionAdapter, PaperExecutionConfig,
    PolymarketClobAdapter, PolymarketClobCredentials,
};
use polyintel::config::Config;
use polyintel::copy_trader::CopyTrader;
use polyintel::insider_scorer::InsiderScorer;
use polyintel::live_feed::LiveFeedClient;
use polyintel::risk::{RiskLimits, RiskManager};
use polyintel::store::AnalyticalStore;
use polyintel::trade_processor::TradeProcessor;
use polyintel::wallet_discovery::DiscoveryProcessor;

/// Which part of the engine to run. `All` is the normal production mode;
/// the narrower variants are useful for running one subsystem in isolation
/// (e.g. backfilling the database without a live feed connection).
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum Component {
    All,
    Feed,
    Discovery,
    Insider,
    CopyTrader,
}

#[derive(Debug, Parser)]
#[command(name = "polyintel", about = "Real-time Polymarket intelligence pipeline")]
struct Cli {
    /// Overrides DATABASE_PATH from the environment.
    #[arg(long)]
    database_path: Option<String>,

    /// Run only the named component instead of the full engine.
    #[arg(long, value_enum, default_value = "all")]
    component: Component,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(path) = cli.database_path {
        config.database_path = path;
    }

    info!(component = ?cli.component, db = %config.database_path, "starting polyintel");

    let store = Arc::new(
        AnalyticalStore::open(&config.database_path).context("failed to open analytical store")?,
    );

    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .build()
        .context("failed to build http client")?;

    let catalog = Arc::new(CatalogClient::new(
        config.catalog_api_base_url.clone(),
        config.catalog_api_key.clone(),
    ));

    let risk_limits = RiskLimits {
        max_position_size_usd: config.risk_limits.max_position_size_usd,
        max_total_exposure_usd: config.risk_limits.max_total_exposure_usd,
        max_single_order_usd: config.risk_limits.max_single_order_usd,
        max_daily_loss_usd: config.risk_limits.max_daily_loss_usd,
        max_daily_orders: config.risk_limits.max_daily_orders,
        ..RiskLimits::default()
    };
    let risk_manager = RiskManager::new(risk_limits);

    let quotes = Arc::new(ClobBookQuoteSource::new(http_client.clone()));
    let paper_adapter = Arc::new(PaperExecutionAdapter::new(
        PaperExecutionConfig::default(),
        quotes,
    ));

    let live_adapter: Option<Arc<dyn ExecutionAdapter>> = PolymarketClobCredentials::from_env(
        config.clob_api_key.clone(),
        config.clob_secret.clone(),
        config.clob_passphrase.clone(),
        config.clob_wallet_address.clone(),
    )
    .map(|creds| Arc::new(PolymarketClobAdapter::new(creds)) as Arc<dyn ExecutionAdapter>);

    if live_adapter.is_none() && !config.copy_trading.paper_trading {
        warn!("live CLOB credentials missing; copy trader will fall back to paper execution");
    }

    let self_address = config
        .clob_wallet_address
        .clone()
        .unwrap_or_else(|| "self".to_string());
    let copy_trader = CopyTrader::new(
        store.clone(),
        self_address,
        config.copy_trading.clone(),
        risk_manager,
        paper_adapter.clone(),
        live_adapter,
    );

    let (trade_processor, write_rx) = TradeProcessor::new(store.clone());
    let (discovery, discovery_queue_rx) = DiscoveryProcessor::new(store.clone(), catalog.clone());
    let insider_scorer = InsiderScorer::new(
        store.clone(),
        catalog.clone(),
        http_client.clone(),
        config.polygon_rpc_url.clone(),
    )?;

    let status_state = StatusState {
        paper_adapter: paper_adapter.clone(),
    };
    let health_addr = format!("0.0.0.0:{}", config.health_port);
    let health_router = Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .with_state(status_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let mut tasks = Vec::new();

    if matches!(cli.component, Component::All | Component::Discovery) {
        tasks.extend(discovery.spawn_workers(discovery_queue_rx));
    }

    if matches!(cli.component, Component::All | Component::Insider) {
        let scorer = insider_scorer.clone();
        tasks.push(tokio::spawn(async move { scorer.run().await }));
    }

    if matches!(cli.component, Component::All | Component::CopyTrader) {
        let trader = copy_trader.clone();
        tasks.push(tokio::spawn(async move { trader.run_cache_refresher().await }));
    }

    let (trade_tx, trade_rx) = mpsc::channel(1024);
    tasks.push(tokio::spawn({
        let processor = trade_processor.clone();
        async move { processor.run(trade_rx, write_rx).await }
    }));

    if matches!(cli.component, Component::All | Component::Feed) {
        let (live_feed, mut feed_rx) = LiveFeedClient::new(config.live_feed_ws_url.clone());
        tasks.push(tokio::spawn(async move { live_feed.run().await }));

        let run_discovery = matches!(cli.component, Component::All);
        let run_copy_trader = matches!(cli.component, Component::All);
        tasks.push(tokio::spawn(async move {
            while let Some(trade) = feed_rx.recv().await {
                if run_discovery {
                    discovery.check_and_queue(&trade.trader_address, trade.usd_value);
                }
                if run_copy_trader {
                    if let Err(e) = copy_trader.evaluate_trade(&trade).await {
                        warn!(error = %e, trade_id = %trade.trade_id, "copy-trade evaluation failed");
                    }
                }
                if trade_tx.send(trade).await.is_err() {
                    break;
                }
            }
        }));
    } else {
        drop(trade_tx);
    }

    let listener = TcpListener::bind(health_addr.clone())
        .await
        .with_context(|| format!("failed to bind health listener on {health_addr}"))?;
    info!(addr = %health_addr, "health endpoint listening");
    axum::serve(listener, health_router)
        .await
        .context("health server error")?;

    Ok(())
}

#[derive(Clone)]
struct StatusState {
    paper_adapter: Arc<PaperExecutionAdapter>,
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(serde::Serialize)]
struct StatusResponse {
    clob: ClobStats,
}

async fn status(State(state): State<StatusState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        clob: state.paper_adapter.stats(),
    })
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "polyintel=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
