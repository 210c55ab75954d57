//! Enriches, flags, and persists trades observed on the live feed.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwap;
use chrono::{DateTime, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::models::{Side, Trade};
use crate::store::AnalyticalStore;

const WHALE_USD: f64 = 10_000.0;
const INSIDER_SUSPECT_THRESHOLD: f64 = 60.0;
const CACHE_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const BATCH_SIZE: usize = 50;
const BATCH_TIMEOUT: Duration = Duration::from_millis(500);
const WRITE_QUEUE_CAPACITY: usize = 2_000;
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3_600);
const RETENTION_WINDOW: Duration = Duration::from_secs(7 * 24 * 3_600);
const SESSION_WINDOW: Duration = Duration::from_secs(2 * 3_600);
const SESSION_HISTORY_CAP: usize = 100;

#[derive(Debug, Clone, Default)]
struct WalletCacheFacts {
    score: f64,
}

#[derive(Debug, Clone)]
struct SessionEntry {
    at: DateTime<Utc>,
    usd_value: f64,
    market_id: String,
    side: Side,
}

/// A per-address bounded trade history used to score wallets the discovery
/// engine has not yet analyzed.
#[derive(Default)]
struct SessionHeuristics {
    history: HashMap<String, VecDeque<SessionEntry>>,
}

impl SessionHeuristics {
    fn record_and_score(&mut self, address: &str, trade: &Trade) -> f64 {
        let entries = self.history.entry(address.to_string()).or_default();
        let cutoff = Utc::now() - chrono::Duration::from_std(SESSION_WINDOW).unwrap();
        while entries.front().is_some_and(|e| e.at < cutoff) {
            entries.pop_front();
        }

        entries.push_back(SessionEntry {
            at: trade.executed_at,
            usd_value: trade.usd_value,
            market_id: trade.condition_id.clone(),
            side: trade.side,
        });
        while entries.len() > SESSION_HISTORY_CAP {
            entries.pop_front();
        }

        score_session(entries, trade)
    }
}

fn score_session(entries: &VecDeque<SessionEntry>, trade: &Trade) -> f64 {
    let mut score = 0.0;

    if trade.usd_value >= 5_000.0 {
        score += 30.0;
    }

    let same_market = entries
        .iter()
        .filter(|e| e.market_id == trade.condition_id)
        .count();
    if same_market >= 5 {
        score += 25.0;
    }

    let session_volume: f64 = entries.iter().map(|e| e.usd_value).sum();
    if session_volume >= 50_000.0 {
        score += 25.0;
    }

    let hour = trade.executed_at.hour();
    if (2..=6).contains(&hour) {
        score += 10.0;
    }

    if entries.len() >= 3 {
        let first_side = entries[0].side;
        if entries.iter().all(|e| e.side == first_side) {
            score += 10.0;
        }
    }

    score.min(100.0)
}

#[derive(Debug, Clone, Deserialize)]
struct AlertConditions {
    #[serde(default)]
    min_usd_value: Option<f64>,
    #[serde(default)]
    categories: Option<Vec<String>>,
    #[serde(default)]
    hours: Option<Vec<u32>>,
    #[serde(default)]
    sides: Option<Vec<String>>,
}

impl AlertConditions {
    fn matches(&self, trade: &Trade, category: Option<&str>) -> bool {
        if let Some(min) = self.min_usd_value {
            if trade.usd_value < min {
                return false;
            }
        }
        if let Some(categories) = &self.categories {
            match category {
                Some(c) if categories.iter().any(|x| x == c) => {}
                _ => return false,
            }
        }
        if let Some(hours) = &self.hours {
            if !hours.contains(&trade.executed_at.hour()) {
                return false;
            }
        }
        if let Some(sides) = &self.sides {
            if !sides.iter().any(|s| s.eq_ignore_ascii_case(trade.side.as_str())) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeFlags {
    pub is_whale: bool,
    pub is_watchlist: bool,
    pub is_insider_suspect: bool,
    pub score: f64,
    pub processing_latency_ms: i64,
}

/// Enriches trades with cached wallet facts, applies flags, persists the
/// significant ones, and evaluates alert rules synchronously.
pub struct TradeProcessor {
    store: Arc<AnalyticalStore>,
    wallet_cache: ArcSwap<HashMap<String, WalletCacheFacts>>,
    watchlist: ArcSwap<HashMap<String, (f64, f64)>>,
    session: Mutex<SessionHeuristics>,
    write_tx: mpsc::Sender<Trade>,
    running: Arc<AtomicBool>,
}

impl TradeProcessor {
    pub fn new(store: Arc<AnalyticalStore>) -> (Arc<Self>, mpsc::Receiver<Trade>) {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let processor = Arc::new(Self {
            store,
            wallet_cache: ArcSwap::from_pointee(HashMap::new()),
            watchlist: ArcSwap::from_pointee(HashMap::new()),
            session: Mutex::new(SessionHeuristics::default()),
            write_tx,
            running: Arc::new(AtomicBool::new(true)),
        });
        (processor, write_rx)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    fn refresh_caches(&self) -> Result<()> {
        let qualified = self.store.qualified_wallets(0.0)?;
        let cache: HashMap<String, WalletCacheFacts> = qualified
            .into_iter()
            .map(|(addr, wallet)| (addr, WalletCacheFacts { score: wallet.copytrade_score }))
            .collect();
        self.wallet_cache.store(Arc::new(cache));

        let watchlist = self.store.watchlist_entries()?;
        self.watchlist.store(Arc::new(watchlist));
        Ok(())
    }

    fn flag_trade(&self, trade: &Trade) -> TradeFlags {
        let address = trade.trader_address.to_lowercase();
        let cache = self.wallet_cache.load();
        let score = match cache.get(&address) {
            Some(facts) => facts.score,
            None => self.session.lock().record_and_score(&address, trade),
        };

        let watchlist = self.watchlist.load();
        let is_watchlist = watchlist.contains_key(&address);

        TradeFlags {
            is_whale: trade.usd_value >= WHALE_USD,
            is_watchlist,
            is_insider_suspect: score >= INSIDER_SUSPECT_THRESHOLD,
            score,
            processing_latency_ms: (Utc::now() - trade.executed_at).num_milliseconds(),
        }
    }

    fn evaluate_alert_rules(&self, trade: &Trade, flags: &TradeFlags) -> Result<()> {
        let rules = self.store.list_enabled_alert_rules()?;
        let watchlist = self.watchlist.load();

        for rule in rules {
            let matched = match rule.rule_type.as_str() {
                "whale" => flags.is_whale,
                "watchlist_activity" => {
                    let address = trade.trader_address.to_lowercase();
                    match watchlist.get(&address) {
                        Some((min_trade_size, _)) => trade.usd_value >= *min_trade_size,
                        None => false,
                    }
                }
                "insider_activity" => flags.is_insider_suspect,
                other => {
                    debug!(rule_type = other, "unknown alert rule type, skipping");
                    false
                }
            };

            if !matched {
                continue;
            }

            let conditions: AlertConditions = match serde_json::from_str(&rule.conditions) {
                Ok(c) => c,
                Err(_) => AlertConditions {
                    min_usd_value: None,
                    categories: None,
                    hours: None,
                    sides: None,
                },
            };

            if conditions.matches(trade, trade.event_slug.as_deref()) {
                self.store
                    .insert_trade_alert(&rule.rule_type, &trade.trade_id, &rule.severity)?;
                info!(rule_type = %rule.rule_type, trade_id = %trade.trade_id, "alert rule matched");
            }
        }
        Ok(())
    }

    /// Processes one trade inline: enrichment, flagging, alert evaluation,
    /// and (if significant) enqueue for batched persistence.
    pub async fn process(&self, trade: Trade) -> Result<TradeFlags> {
        let flags = self.flag_trade(&trade);
        self.evaluate_alert_rules(&trade, &flags)?;

        if flags.is_whale || flags.is_insider_suspect || flags.is_watchlist {
            if self.write_tx.try_send(trade).is_err() {
                warn!("trade write queue full, dropping newest trade");
            }
        }

        Ok(flags)
    }

    /// Long-running loop: consumes trades from the live feed, runs the
    /// periodic cache refresher and retention sweep, and feeds the batch
    /// writer. Exits once `stop()` is called and the feed channel closes.
    pub async fn run(self: Arc<Self>, mut trade_rx: mpsc::Receiver<Trade>, write_rx: mpsc::Receiver<Trade>) {
        if let Err(e) = self.refresh_caches() {
            warn!(error = %e, "initial wallet cache refresh failed");
        }

        let refresher = {
            let processor = self.clone();
            tokio::spawn(async move {
                let mut tick = interval(CACHE_REFRESH_INTERVAL);
                while processor.running.load(Ordering::Relaxed) {
                    tick.tick().await;
                    if let Err(e) = processor.refresh_caches() {
                        warn!(error = %e, "wallet cache refresh failed");
                    }
                }
            })
        };

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let writer = {
            let store = self.store.clone();
            tokio::spawn(async move { batch_writer(store, write_rx, shutdown_rx).await })
        };

        let sweeper = {
            let processor = self.clone();
            tokio::spawn(async move {
                let mut tick = interval(RETENTION_SWEEP_INTERVAL);
                while processor.running.load(Ordering::Relaxed) {
                    tick.tick().await;
                    let cutoff = Utc::now() - chrono::Duration::from_std(RETENTION_WINDOW).unwrap();
                    match processor.store.prune_trades_older_than(cutoff) {
                        Ok(n) if n > 0 => info!(pruned = n, "retention sweep removed old trades"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "trade retention sweep failed"),
                    }
                    match processor.store.prune_acknowledged_alerts_older_than(cutoff) {
                        Ok(n) if n > 0 => info!(pruned = n, "retention sweep removed acked alerts"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "alert retention sweep failed"),
                    }
                }
            })
        };

        while let Some(trade) = trade_rx.recv().await {
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = self.process(trade).await {
                warn!(error = %e, "trade processing failed");
            }
        }

        self.stop();
        refresher.abort();
        sweeper.abort();
        let _ = shutdown_tx.send(());
        let _ = writer.await;
    }
}

/// Drains the write queue into batches, flushing on size or timeout,
/// deduplicating by `trade_id` (keeping the last observation). Flushes its
/// current batch before exiting on shutdown.
async fn batch_writer(
    store: Arc<AnalyticalStore>,
    mut write_rx: mpsc::Receiver<Trade>,
    mut shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) {
    let mut batch: HashMap<String, Trade> = HashMap::new();
    let mut tick = interval(BATCH_TIMEOUT);

    loop {
        tokio::select! {
            maybe_trade = write_rx.recv() => {
                match maybe_trade {
                    Some(trade) => {
                        batch.insert(trade.trade_id.clone(), trade);
                        if batch.len() >= BATCH_SIZE {
                            flush_batch(&store, &mut batch);
                        }
                    }
                    None => {
                        flush_batch(&store, &mut batch);
                        break;
                    }
                }
            }
            _ = tick.tick() => {
                if !batch.is_empty() {
                    flush_batch(&store, &mut batch);
                }
            }
            _ = &mut shutdown_rx => {
                while let Ok(trade) = write_rx.try_recv() {
                    batch.insert(trade.trade_id.clone(), trade);
                }
                flush_batch(&store, &mut batch);
                break;
            }
        }
    }
}

fn flush_batch(store: &Arc<AnalyticalStore>, batch: &mut HashMap<String, Trade>) {
    if batch.is_empty() {
        return;
    }
    let n = batch.len();
    for trade in batch.values() {
        if let Err(e) = store.upsert_trade(trade) {
            warn!(error = %e, trade_id = %trade.trade_id, "failed to persist trade");
        }
    }
    debug!(count = n, "flushed trade batch");
    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_trade(usd_value: f64, side: Side, condition_id: &str, hour_offset: i64) -> Trade {
        Trade {
            trade_id: uuid::Uuid::new_v4().to_string(),
            trader_address: "0xabc".into(),
            condition_id: condition_id.to_string(),
            asset_id: None,
            market_slug: None,
            event_slug: None,
            side,
            outcome: None,
            outcome_index: 0,
            size: 100.0,
            price: 0.5,
            usd_value,
            executed_at: Utc::now() - chrono::Duration::hours(hour_offset),
            tx_hash: None,
        }
    }

    #[test]
    fn session_heuristic_caps_at_100() {
        let mut heuristics = SessionHeuristics::default();
        let mut score = 0.0;
        for _ in 0..10 {
            let trade = make_trade(10_000.0, Side::Buy, "market-a", 0);
            score = heuristics.record_and_score("0xabc", &trade);
        }
        assert!(score <= 100.0);
        assert!(score >= 30.0);
    }

    #[test]
    fn whale_flag_triggers_at_threshold() {
        assert!(10_000.0_f64 >= WHALE_USD);
        assert!(9_999.0_f64 < WHALE_USD);
    }

    #[test]
    fn alert_conditions_filter_by_sides() {
        let conditions = AlertConditions {
            min_usd_value: None,
            categories: None,
            hours: None,
            sides: Some(vec!["BUY".to_string()]),
        };
        let buy_trade = make_trade(100.0, Side::Buy, "m1", 0);
        let sell_trade = make_trade(100.0, Side::Sell, "m1", 0);
        assert!(conditions.matches(&buy_trade, None));
        assert!(!conditions.matches(&sell_trade, None));
    }

    #[tokio::test]
    async fn batch_writer_flushes_pending_batch_on_shutdown() {
        let store = Arc::new(AnalyticalStore::open_in_memory().unwrap());
        let (write_tx, write_rx) = mpsc::channel(10);
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let store_for_writer = store.clone();
        let writer = tokio::spawn(async move {
            batch_writer(store_for_writer, write_rx, shutdown_rx).await
        });

        for i in 0..3 {
            write_tx
                .send(make_trade(100.0 + i as f64, Side::Buy, "m1", 0))
                .await
                .unwrap();
        }
        // Give the writer a chance to pull the sends into its batch before
        // the queue closes.
        tokio::task::yield_now().await;
        shutdown_tx.send(()).unwrap();
        drop(write_tx);
        writer.await.unwrap();

        assert_eq!(store.max_trade_id().unwrap(), 3);
    }

    #[tokio::test]
    async fn batch_writer_dedups_by_trade_id_last_write_wins() {
        let store = Arc::new(AnalyticalStore::open_in_memory().unwrap());
        let (write_tx, write_rx) = mpsc::channel(10);
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let store_for_writer = store.clone();
        let writer = tokio::spawn(async move {
            batch_writer(store_for_writer, write_rx, shutdown_rx).await
        });

        let mut trade = make_trade(100.0, Side::Buy, "m1", 0);
        trade.trade_id = "dup-1".to_string();
        write_tx.send(trade.clone()).await.unwrap();
        trade.usd_value = 250.0;
        write_tx.send(trade).await.unwrap();

        tokio::task::yield_now().await;
        shutdown_tx.send(()).unwrap();
        drop(write_tx);
        writer.await.unwrap();

        let (_, stored) = store
            .trades_since(0, 10)
            .unwrap()
            .into_iter()
            .find(|(_, t)| t.trade_id == "dup-1")
            .unwrap();
        assert_eq!(stored.usd_value, 250.0);
    }
}
