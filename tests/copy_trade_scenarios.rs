//! Integration tests exercising the literal copy-trade scenarios end to
//! end against an in-memory store, using only the crate's public API.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use polyintel::clob::{PaperExecutionAdapter, PaperExecutionConfig, QuoteSource};
use polyintel::config::CopyTradingConfig;
use polyintel::copy_trader::CopyTrader;
use polyintel::models::{Side, Trade, Wallet, WindowMetrics, BehaviouralMetrics};
use polyintel::risk::{RiskLimits, RiskManager};
use polyintel::store::AnalyticalStore;

struct FixedQuotes {
    bid: f64,
    ask: f64,
}

#[async_trait]
impl QuoteSource for FixedQuotes {
    async fn best_bid_ask(&self, _token_id: &str) -> Result<(f64, f64)> {
        Ok((self.bid, self.ask))
    }
}

fn sample_wallet(address: &str, score: f64) -> Wallet {
    Wallet {
        address: address.to_string(),
        source: "test".into(),
        balance: Some(10_000.0),
        username: None,
        account_created_at: None,
        window_7d: WindowMetrics::default(),
        window_30d: WindowMetrics::default(),
        pnl_all: 0.0,
        roi_all: 0.0,
        win_rate_all: 0.0,
        volume_all: 0.0,
        trade_count_all: 0,
        wins_all: 0,
        losses_all: 0,
        drawdown_all: 0.0,
        copytrade_score: score,
        behavioural: BehaviouralMetrics::default(),
        metrics_updated_at: Utc::now(),
    }
}

fn whale_trade(usd_value: f64, price: f64) -> Trade {
    Trade {
        trade_id: uuid::Uuid::new_v4().to_string(),
        trader_address: "0xA".into(),
        condition_id: "market-m".into(),
        asset_id: Some("token-m".into()),
        market_slug: None,
        event_slug: None,
        side: Side::Buy,
        outcome: None,
        outcome_index: 0,
        size: usd_value / price,
        price,
        usd_value,
        executed_at: Utc::now(),
        tx_hash: None,
    }
}

/// S1: a whale trade from a qualified trader, in paper mode, fills
/// immediately because the copy order crosses the best ask, and gets sized
/// down to the single-order cap.
#[tokio::test]
async fn whale_trade_from_qualified_trader_fills_in_paper_mode() {
    let store = Arc::new(AnalyticalStore::open_in_memory().unwrap());
    store.upsert_wallet(&sample_wallet("0xa", 75.0)).unwrap();

    let quotes = Arc::new(FixedQuotes { bid: 0.29, ask: 0.30 });
    let paper = Arc::new(PaperExecutionAdapter::new(PaperExecutionConfig::default(), quotes));

    let config = CopyTradingConfig {
        enabled: true,
        paper_trading: true,
        min_copytrade_score: 60.0,
        copy_fraction: 0.10,
        min_copy_size_usd: 5.0,
        max_copy_size_usd: 100.0,
        min_trade_size_usd: 50.0,
        copy_from_watchlist_only: false,
        max_delay_seconds: 30,
    };

    let trader = CopyTrader::new(
        store,
        "0xself".to_string(),
        config,
        RiskManager::new(RiskLimits::default()),
        paper.clone(),
        None,
    );
    trader.refresh_caches().unwrap();

    let trade = whale_trade(50_000.0, 0.30);
    trader.evaluate_trade(&trade).await.unwrap();

    let stats = paper.stats();
    assert_eq!(stats.placed, 1);
    assert_eq!(stats.open_count, 0);
    assert!(stats.total_volume_usd > 0.0);
}

/// S2: once accumulated losses trip the kill switch, a subsequent
/// qualifying trade is rejected and no order is placed.
#[tokio::test]
async fn kill_switch_rejects_further_copy_trades() {
    let store = Arc::new(AnalyticalStore::open_in_memory().unwrap());
    store.upsert_wallet(&sample_wallet("0xa", 75.0)).unwrap();

    let quotes = Arc::new(FixedQuotes { bid: 0.29, ask: 0.30 });
    let paper = Arc::new(PaperExecutionAdapter::new(PaperExecutionConfig::default(), quotes));

    let mut risk = RiskManager::new(RiskLimits::default());
    // Prior losses already exceed the daily cap; record_fill's own
    // accounting trips the kill switch before any new order is evaluated.
    risk.record_fill("market-m", 0.0, -550.0);
    assert!(!risk.is_trading_allowed());

    let config = CopyTradingConfig {
        enabled: true,
        paper_trading: true,
        min_copytrade_score: 60.0,
        copy_fraction: 0.10,
        min_copy_size_usd: 5.0,
        max_copy_size_usd: 100.0,
        min_trade_size_usd: 50.0,
        copy_from_watchlist_only: false,
        max_delay_seconds: 30,
    };

    let trader = CopyTrader::new(store, "0xself".to_string(), config, risk, paper.clone(), None);
    trader.refresh_caches().unwrap();

    let trade = whale_trade(1_000.0, 0.30);
    trader.evaluate_trade(&trade).await.unwrap();

    assert_eq!(paper.stats().placed, 0);
}
