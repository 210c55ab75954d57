//! Mirrors qualifying trades from the live feed under the risk engine's
//! limits, placing orders through the CLOB client.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::interval;
use tracing::{info, warn};

use crate::clob::{ExecutionAdapter, OrderRequest, TimeInForce};
use crate::config::CopyTradingConfig;
use crate::models::{CopyTradeLog, CopyTradeStatus, Trade};
use crate::risk::{PositionTracker, RiskManager};
use crate::store::AnalyticalStore;

const QUALIFICATION_REFRESH: Duration = Duration::from_secs(300);
const RECENT_COPIES_CAP: usize = 10_000;
const RECENT_COPIES_TRIM_AGE: Duration = Duration::from_secs(3_600);

pub struct CopyTrader {
    store: Arc<AnalyticalStore>,
    self_address: String,
    paper_adapter: Arc<dyn ExecutionAdapter>,
    live_adapter: Option<Arc<dyn ExecutionAdapter>>,
    paper_mode: AtomicBool,

    config: Mutex<CopyTradingConfig>,
    enabled: AtomicBool,

    risk: Mutex<RiskManager>,
    positions: Mutex<PositionTracker>,

    qualified: ArcSwap<HashMap<String, f64>>,
    watchlist: ArcSwap<HashSet<String>>,
    recent_copies: Mutex<HashMap<String, chrono::DateTime<Utc>>>,
}

impl CopyTrader {
    pub fn new(
        store: Arc<AnalyticalStore>,
        self_address: String,
        config: CopyTradingConfig,
        risk: RiskManager,
        paper_adapter: Arc<dyn ExecutionAdapter>,
        live_adapter: Option<Arc<dyn ExecutionAdapter>>,
    ) -> Arc<Self> {
        let enabled = config.enabled;
        let paper_mode = config.paper_trading;
        let positions = PositionTracker::new(store.clone(), self_address.clone());
        Arc::new(Self {
            store,
            self_address,
            paper_adapter,
            live_adapter,
            paper_mode: AtomicBool::new(paper_mode),
            config: Mutex::new(config),
            enabled: AtomicBool::new(enabled),
            risk: Mutex::new(risk),
            positions: Mutex::new(positions),
            qualified: ArcSwap::from_pointee(HashMap::new()),
            watchlist: ArcSwap::from_pointee(HashSet::new()),
            recent_copies: Mutex::new(HashMap::new()),
        })
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Switching to paper mode must propagate to the adapter actually used
    /// for order placement; there is no separate "live" CLOB client to swap.
    pub fn set_paper_mode(&self, paper: bool) {
        self.paper_mode.store(paper, Ordering::Relaxed);
    }

    pub fn activate_kill_switch(&self, reason: impl Into<String>) {
        self.risk.lock().activate_kill_switch(reason);
    }

    pub fn deactivate_kill_switch(&self) {
        self.risk.lock().deactivate_kill_switch();
    }

    fn adapter(&self) -> Arc<dyn ExecutionAdapter> {
        if self.paper_mode.load(Ordering::Relaxed) {
            self.paper_adapter.clone()
        } else {
            self.live_adapter.clone().unwrap_or_else(|| self.paper_adapter.clone())
        }
    }

    pub fn refresh_caches(&self) -> Result<()> {
        let min_score = self.config.lock().min_copytrade_score;
        let qualified: HashMap<String, f64> = self
            .store
            .qualified_wallets(min_score)?
            .into_iter()
            .map(|(addr, wallet)| (addr, wallet.copytrade_score))
            .collect();
        self.qualified.store(Arc::new(qualified));

        let watchlist = self.store.watchlist_addresses("copy_watchlist")?;
        self.watchlist.store(Arc::new(watchlist));
        Ok(())
    }

    fn trim_recent_copies(&self, recent: &mut HashMap<String, chrono::DateTime<Utc>>) {
        if recent.len() <= RECENT_COPIES_CAP {
            return;
        }
        let cutoff = Utc::now() - chrono::Duration::from_std(RECENT_COPIES_TRIM_AGE).unwrap();
        recent.retain(|_, at| *at >= cutoff);
    }

    /// Main entry point, called for every trade the processor observes.
    pub async fn evaluate_trade(&self, trade: &Trade) -> Result<()> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }

        let config = self.config.lock().clone();
        let address = trade.trader_address.to_lowercase();

        if config.copy_from_watchlist_only && !self.watchlist.load().contains(&address) {
            return Ok(());
        }

        if self.recent_copies.lock().contains_key(&trade.trade_id) {
            return Ok(());
        }

        if trade.usd_value < config.min_trade_size_usd {
            return Ok(());
        }

        let age = Utc::now() - trade.executed_at;
        if age.num_seconds() > config.max_delay_seconds {
            return Ok(());
        }

        let score = match self.qualified.load().get(&address) {
            Some(score) if *score >= config.min_copytrade_score => *score,
            _ => return Ok(()),
        };

        self.copy_trade(trade, score, &config).await
    }

    async fn copy_trade(&self, trade: &Trade, score: f64, config: &CopyTradingConfig) -> Result<()> {
        let base = trade.usd_value * config.copy_fraction;
        let scaled = base * (score / 100.0);
        let upper_bound = config.max_copy_size_usd.min(self.risk.lock().max_single_order_usd());
        let copy_size_usd = scaled.max(config.min_copy_size_usd).min(upper_bound);
        let copy_size_usd = (copy_size_usd * 100.0).round() / 100.0;

        let price = if trade.price > 0.0 { trade.price } else { 0.5 };

        let market_id = trade
            .asset_id
            .clone()
            .unwrap_or_else(|| trade.condition_id.clone());

        let rejection = self
            .risk
            .lock()
            .check_order(&market_id, copy_size_usd, trade.event_slug.as_deref());

        if let Some(reason) = rejection {
            warn!(trade_id = %trade.trade_id, reason = %reason, "copy trade rejected by risk engine");
            self.store.insert_copy_trade_log(&CopyTradeLog {
                source_trader: trade.trader_address.clone(),
                source_trade_id: trade.trade_id.clone(),
                our_order_id: None,
                market_id,
                size_chosen_usd: copy_size_usd,
                status: CopyTradeStatus::Rejected,
                rejection_reason: Some(reason),
                created_at: Utc::now(),
            })?;
            return Ok(());
        }

        let request = OrderRequest {
            client_order_id: uuid::Uuid::new_v4().to_string(),
            token_id: market_id.clone(),
            side: trade.side,
            price,
            notional_usd: copy_size_usd,
            tif: TimeInForce::Gtc,
        };

        match self.adapter().place_order(request).await {
            Ok(ack) => {
                self.risk.lock().record_order(&market_id, copy_size_usd);
                if ack.filled_notional_usd > 0.0 && ack.filled_price > 0.0 {
                    let filled_shares = ack.filled_notional_usd / ack.filled_price;
                    self.positions
                        .lock()
                        .apply_fill(&market_id, trade.side, filled_shares, ack.filled_price);
                }
                self.recent_copies
                    .lock()
                    .insert(trade.trade_id.clone(), Utc::now());
                self.trim_recent_copies(&mut self.recent_copies.lock());

                info!(trade_id = %trade.trade_id, order_id = %ack.order_id, status = ?ack.status, size_usd = copy_size_usd, "copy trade placed");
                self.store.insert_copy_trade_log(&CopyTradeLog {
                    source_trader: trade.trader_address.clone(),
                    source_trade_id: trade.trade_id.clone(),
                    our_order_id: Some(ack.order_id),
                    market_id,
                    size_chosen_usd: copy_size_usd,
                    status: CopyTradeStatus::Executed,
                    rejection_reason: None,
                    created_at: Utc::now(),
                })?;
            }
            Err(e) => {
                warn!(trade_id = %trade.trade_id, error = %e, "copy trade execution failed");
                self.store.insert_copy_trade_log(&CopyTradeLog {
                    source_trader: trade.trader_address.clone(),
                    source_trade_id: trade.trade_id.clone(),
                    our_order_id: None,
                    market_id,
                    size_chosen_usd: copy_size_usd,
                    status: CopyTradeStatus::Failed,
                    rejection_reason: Some(e.to_string()),
                    created_at: Utc::now(),
                })?;
            }
        }

        Ok(())
    }

    pub async fn run_cache_refresher(self: Arc<Self>) {
        if let Err(e) = self.refresh_caches() {
            warn!(error = %e, "initial copy-trader cache refresh failed");
        }
        let mut tick = interval(QUALIFICATION_REFRESH);
        loop {
            tick.tick().await;
            if let Err(e) = self.refresh_caches() {
                warn!(error = %e, "copy-trader cache refresh failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clob::{PaperExecutionAdapter, PaperExecutionConfig};
    use crate::models::Side;
    use crate::risk::RiskLimits;

    fn sample_trade(usd_value: f64) -> Trade {
        Trade {
            trade_id: uuid::Uuid::new_v4().to_string(),
            trader_address: "0xabc".into(),
            condition_id: "cond1".into(),
            asset_id: Some("tok1".into()),
            market_slug: None,
            event_slug: None,
            side: Side::Buy,
            outcome: None,
            outcome_index: 0,
            size: 1000.0,
            price: 0.40,
            usd_value,
            executed_at: Utc::now(),
            tx_hash: None,
        }
    }

    fn make_trader(store: Arc<AnalyticalStore>) -> Arc<CopyTrader> {
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
        let quotes = Arc::new(crate::clob::StaticQuoteSource { bid: 0.38, ask: 0.40 });
        let paper = Arc::new(PaperExecutionAdapter::new(PaperExecutionConfig::default(), quotes));
        CopyTrader::new(
            store,
            "0xself".to_string(),
            config,
            RiskManager::new(RiskLimits::default()),
            paper,
            None,
        )
    }

    #[tokio::test]
    async fn skips_trade_below_min_size() {
        let store = Arc::new(AnalyticalStore::open_in_memory().unwrap());
        let trader = make_trader(store.clone());
        trader.qualified.store(Arc::new(HashMap::from([("0xabc".to_string(), 80.0)])));
        trader.evaluate_trade(&sample_trade(10.0)).await.unwrap();
        assert!(trader.recent_copies.lock().is_empty());
    }

    #[tokio::test]
    async fn executes_qualifying_trade() {
        let store = Arc::new(AnalyticalStore::open_in_memory().unwrap());
        let trader = make_trader(store.clone());
        let trade = sample_trade(400.0);
        trader.qualified.store(Arc::new(HashMap::from([("0xabc".to_string(), 80.0)])));
        trader.evaluate_trade(&trade).await.unwrap();
        assert!(trader.recent_copies.lock().contains_key(&trade.trade_id));
    }
}
