//! Bounded worker pool that backfills wallet metrics the first time (or the
//! first time in a cooldown window) a wallet is seen trading.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::catalog::CatalogClient;
use crate::models::{ClosedPosition, Wallet, WindowMetrics};
use crate::store::AnalyticalStore;

const NUM_WORKERS: usize = 5;
const REQUEST_INTERVAL: Duration = Duration::from_millis(300);
const MAX_QUEUE_SIZE: usize = 5_000;
const REANALYSIS_COOLDOWN_DAYS: i64 = 1;
const QUEUE_WARN_USD: f64 = 1_000.0;
const WINDOW_7D: Duration = Duration::from_secs(7 * 24 * 3_600);
const WINDOW_30D: Duration = Duration::from_secs(30 * 24 * 3_600);

pub(crate) struct FoldedTrade {
    pub(crate) realized_pnl: f64,
    pub(crate) total_bought: f64,
    pub(crate) resolved_at: DateTime<Utc>,
}

/// Folds raw closed positions into win-rate atoms: same-outcome positions on
/// a condition stay separate (re-entries); different-outcome positions on
/// the same condition (a hedge) collapse into one trade.
pub(crate) fn fold_closed_positions(closed: &[ClosedPosition]) -> Vec<FoldedTrade> {
    let mut by_condition: HashMap<&str, Vec<&ClosedPosition>> = HashMap::new();
    for position in closed {
        by_condition
            .entry(position.condition_id.as_str())
            .or_default()
            .push(position);
    }

    let mut out = Vec::new();
    for group in by_condition.values() {
        let distinct_outcomes: HashSet<&str> = group.iter().map(|p| p.outcome.as_str()).collect();
        if distinct_outcomes.len() > 1 {
            let realized_pnl = group.iter().map(|p| p.realized_pnl).sum();
            let total_bought = group.iter().map(|p| p.total_bought).sum();
            let resolved_at = group.iter().map(|p| p.resolved_at).max().unwrap();
            out.push(FoldedTrade {
                realized_pnl,
                total_bought,
                resolved_at,
            });
        } else {
            for position in group {
                out.push(FoldedTrade {
                    realized_pnl: position.realized_pnl,
                    total_bought: position.total_bought,
                    resolved_at: position.resolved_at,
                });
            }
        }
    }
    out
}

pub(crate) struct MetricsResult {
    pub(crate) pnl: f64,
    pub(crate) roi: f64,
    pub(crate) win_rate: f64,
    pub(crate) volume: f64,
    pub(crate) trade_count: u32,
    pub(crate) drawdown: f64,
    pub(crate) wins: u32,
    pub(crate) losses: u32,
}

pub(crate) fn compute_metrics(trades: &[&FoldedTrade], open_cash_pnl: f64, balance: f64, seed_at_initial_capital: bool) -> MetricsResult {
    let r: f64 = trades.iter().map(|t| t.realized_pnl).sum();
    let total_pnl = r + open_cash_pnl;
    let total_bought: f64 = trades.iter().map(|t| t.total_bought).sum();

    let wins = trades.iter().filter(|t| t.realized_pnl > 0.0).count() as u32;
    let losses = trades.iter().filter(|t| t.realized_pnl < 0.0).count() as u32;
    let win_rate = if wins + losses > 0 {
        wins as f64 / (wins + losses) as f64 * 100.0
    } else {
        0.0
    };

    let initial_capital_raw = balance - total_pnl;
    let initial_capital = if initial_capital_raw > 0.0 {
        initial_capital_raw
    } else {
        total_bought
    };

    let roi = if initial_capital > 0.0 {
        total_pnl / initial_capital * 100.0
    } else if total_pnl < 0.0 && balance == 0.0 {
        -100.0
    } else {
        0.0
    };

    let mut ordered: Vec<&&FoldedTrade> = trades.iter().collect();
    ordered.sort_by_key(|t| t.resolved_at);
    let mut running_balance = if seed_at_initial_capital {
        if initial_capital_raw > 0.0 {
            initial_capital_raw
        } else {
            total_bought
        }
    } else {
        0.0
    };
    let mut peak = running_balance;
    let mut max_drawdown = 0.0_f64;
    for trade in ordered {
        running_balance += trade.realized_pnl;
        peak = peak.max(running_balance);
        if peak > 0.0 {
            let dd = (peak - running_balance) / peak;
            max_drawdown = max_drawdown.max(dd);
        }
    }
    max_drawdown = max_drawdown.min(1.0);

    MetricsResult {
        pnl: total_pnl,
        roi,
        win_rate,
        volume: total_bought,
        trade_count: trades.len() as u32,
        drawdown: max_drawdown,
        wins,
        losses,
    }
}

/// Metrics for one lookback window. ROI is volume-denominated here (unlike
/// the all-time figure, which is denominated by implied initial capital),
/// and drawdown is seeded from the wallet's overall balance history rather
/// than from zero, so a window that opens mid-drawdown doesn't understate it.
pub(crate) fn window_metrics(
    trades: &[FoldedTrade],
    window: Duration,
    current_balance: f64,
    overall_pnl: f64,
) -> WindowMetrics {
    let cutoff = Utc::now() - ChronoDuration::from_std(window).unwrap();
    let mut windowed: Vec<&FoldedTrade> = trades.iter().filter(|t| t.resolved_at >= cutoff).collect();

    let pnl: f64 = windowed.iter().map(|t| t.realized_pnl).sum();
    let volume: f64 = windowed.iter().map(|t| t.total_bought).sum();
    let wins = windowed.iter().filter(|t| t.realized_pnl > 0.0).count() as u32;
    let roi = if volume > 0.0 { pnl / volume * 100.0 } else { 0.0 };
    let win_rate = if !windowed.is_empty() {
        wins as f64 / windowed.len() as f64 * 100.0
    } else {
        0.0
    };

    windowed.sort_by_key(|t| t.resolved_at);
    let seed = (current_balance - overall_pnl).max(1.0);
    let mut running_balance = seed;
    let mut peak = running_balance;
    let mut max_drawdown = 0.0_f64;
    for trade in &windowed {
        running_balance += trade.realized_pnl;
        peak = peak.max(running_balance);
        if peak > 0.0 {
            let dd = (peak - running_balance) / peak;
            max_drawdown = max_drawdown.max(dd);
        }
    }

    WindowMetrics {
        pnl,
        roi,
        win_rate,
        volume,
        trade_count: windowed.len() as u32,
        drawdown: max_drawdown.min(1.0),
    }
}

/// Coordinates the queue of addresses awaiting (re-)analysis and the fixed
/// worker pool that drains it.
pub struct DiscoveryProcessor {
    store: Arc<AnalyticalStore>,
    catalog: Arc<CatalogClient>,
    known_wallets: Mutex<HashSet<String>>,
    last_analyzed: Mutex<HashMap<String, DateTime<Utc>>>,
    pending: Mutex<HashSet<String>>,
    queue_tx: mpsc::Sender<String>,
}

impl DiscoveryProcessor {
    pub fn new(store: Arc<AnalyticalStore>, catalog: Arc<CatalogClient>) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (queue_tx, queue_rx) = mpsc::channel(MAX_QUEUE_SIZE);
        let known_wallets = store.known_wallet_addresses().unwrap_or_default();
        let last_analyzed = store.last_analyzed_map().unwrap_or_default();

        let processor = Arc::new(Self {
            store,
            catalog,
            known_wallets: Mutex::new(known_wallets),
            last_analyzed: Mutex::new(last_analyzed),
            pending: Mutex::new(HashSet::new()),
            queue_tx,
        });
        (processor, queue_rx)
    }

    /// Called from the trade processor for every observed trade.
    pub fn check_and_queue(&self, trader_address: &str, usd_value: f64) {
        let address = trader_address.to_lowercase();
        let is_known = self.known_wallets.lock().contains(&address);
        let is_stale = self
            .last_analyzed
            .lock()
            .get(&address)
            .map(|t| Utc::now() - *t > ChronoDuration::days(REANALYSIS_COOLDOWN_DAYS))
            .unwrap_or(true);

        if (!is_known || is_stale) && !self.pending.lock().contains(&address) {
            match self.queue_tx.try_send(address.clone()) {
                Ok(()) => {
                    self.pending.lock().insert(address);
                }
                Err(_) => {
                    if usd_value >= QUEUE_WARN_USD {
                        warn!(address = %address, usd_value, "discovery queue full, dropping wallet");
                    }
                }
            }
        }
    }

    /// Spawns the fixed worker pool. Each worker paces itself independently.
    pub fn spawn_workers(self: &Arc<Self>, queue_rx: mpsc::Receiver<String>) -> Vec<tokio::task::JoinHandle<()>> {
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        (0..NUM_WORKERS)
            .map(|worker_id| {
                let processor = self.clone();
                let queue_rx = queue_rx.clone();
                tokio::spawn(async move { processor.worker_loop(worker_id, queue_rx).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>) {
        loop {
            let address = {
                let mut rx = queue_rx.lock().await;
                rx.recv().await
            };
            let Some(address) = address else {
                debug!(worker_id, "discovery queue closed, worker exiting");
                return;
            };

            if let Err(e) = self.process_wallet(&address).await {
                warn!(worker_id, address = %address, error = %e, "wallet discovery failed");
            }
            self.pending.lock().remove(&address);

            sleep(REQUEST_INTERVAL).await;
        }
    }

    async fn process_wallet(&self, address: &str) -> Result<()> {
        let (open, closed, portfolio, profile) = tokio::join!(
            self.catalog.open_positions(address),
            self.catalog.closed_positions(address),
            self.catalog.portfolio_value(address),
            self.catalog.profile(address),
        );

        let open = open.unwrap_or_default();
        let closed = closed.unwrap_or_default();
        let (portfolio_value, cash) = portfolio.unwrap_or((0.0, 0.0));
        let profile = profile.unwrap_or(None);
        let balance = portfolio_value + cash;

        let folded = fold_closed_positions(&closed);
        let open_cash_pnl: f64 = open.iter().filter_map(|p| p.cash_pnl).sum();

        let all_refs: Vec<&FoldedTrade> = folded.iter().collect();
        let overall = compute_metrics(&all_refs, open_cash_pnl, balance, true);

        let username = profile
            .as_ref()
            .and_then(|p| p.get("username"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let wallet = Wallet {
            address: address.to_string(),
            source: "discovery".to_string(),
            balance: Some(balance),
            username,
            account_created_at: None,
            window_7d: window_metrics(&folded, WINDOW_7D, balance, overall.pnl),
            window_30d: window_metrics(&folded, WINDOW_30D, balance, overall.pnl),
            pnl_all: overall.pnl,
            roi_all: overall.roi,
            win_rate_all: overall.win_rate,
            volume_all: overall.volume,
            trade_count_all: overall.trade_count,
            wins_all: overall.wins,
            losses_all: overall.losses,
            drawdown_all: overall.drawdown,
            copytrade_score: 0.0,
            behavioural: Default::default(),
            metrics_updated_at: Utc::now(),
        };

        self.store.upsert_wallet(&wallet)?;
        self.known_wallets.lock().insert(address.to_string());
        self.last_analyzed.lock().insert(address.to_string(), Utc::now());

        info!(address, pnl = overall.pnl, win_rate = overall.win_rate, "wallet metrics refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClosedPosition;

    fn closed(condition_id: &str, outcome: &str, pnl: f64, bought: f64, days_ago: i64) -> ClosedPosition {
        ClosedPosition {
            address: "0xabc".into(),
            condition_id: condition_id.into(),
            outcome: outcome.into(),
            total_bought: bought,
            avg_price: 0.5,
            final_price: 1.0,
            realized_pnl: pnl,
            is_win: pnl > 0.0,
            resolved_at: Utc::now() - ChronoDuration::days(days_ago),
        }
    }

    #[test]
    fn hedge_positions_collapse_into_one_trade() {
        let positions = vec![
            closed("c1", "Yes", 50.0, 100.0, 1),
            closed("c1", "No", -20.0, 50.0, 1),
        ];
        let folded = fold_closed_positions(&positions);
        assert_eq!(folded.len(), 1);
        assert_eq!(folded[0].realized_pnl, 30.0);
    }

    #[test]
    fn same_outcome_reentries_stay_separate() {
        let positions = vec![
            closed("c1", "Yes", 50.0, 100.0, 1),
            closed("c1", "Yes", -10.0, 80.0, 2),
        ];
        let folded = fold_closed_positions(&positions);
        assert_eq!(folded.len(), 2);
    }

    #[test]
    fn win_rate_zero_when_no_resolved_trades() {
        let result = compute_metrics(&[], 0.0, 0.0, true);
        assert_eq!(result.win_rate, 0.0);
    }

    #[test]
    fn roi_falls_back_to_negative_100_when_balance_zero() {
        let trades = vec![closed("c1", "Yes", -100.0, 100.0, 1)];
        let folded = fold_closed_positions(&trades);
        let refs: Vec<&FoldedTrade> = folded.iter().collect();
        let result = compute_metrics(&refs, 0.0, 0.0, true);
        assert_eq!(result.roi, -100.0);
    }

    #[test]
    fn window_roi_is_volume_denominated_not_all_time_fallback() {
        let trades = vec![closed("c1", "Yes", -50.0, 200.0, 1)];
        let folded = fold_closed_positions(&trades);
        let metrics = window_metrics(&folded, WINDOW_7D, 0.0, -50.0);
        assert_eq!(metrics.roi, -25.0);
    }

    #[test]
    fn window_drawdown_seeds_from_overall_balance_not_zero() {
        let trades = vec![closed("c1", "Yes", -50.0, 100.0, 1)];
        let folded = fold_closed_positions(&trades);
        // current_balance=150, overall_pnl=-50 -> seed = max(150-(-50), 1) = 200
        let metrics = window_metrics(&folded, WINDOW_7D, 150.0, -50.0);
        assert!((metrics.drawdown - 0.25).abs() < 1e-9);
    }
}
