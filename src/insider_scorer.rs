//! Independent tailing consumer: scores trades for insider-like behavior
//! and writes alerts, advancing a cursor through the trade store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::catalog::CatalogClient;
use crate::models::{InsiderAlert, InsiderSubScores, ProfitabilityStatus, Side, Trade};
use crate::store::AnalyticalStore;

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const POLL_BATCH_SIZE: usize = 100;
const MIN_USD_VALUE: f64 = 200.0;
const SCORE_THRESHOLD: u32 = 50;
const SIGNAL_THRESHOLD: f64 = 60.0;

const W_WALLET_AGE: f64 = 0.20;
const W_SIZE_LIQUIDITY: f64 = 0.20;
const W_MARKET_NICHE: f64 = 0.15;
const W_EXTREME_ODDS: f64 = 0.20;
const W_CONVICTION: f64 = 0.15;
const W_CATEGORY_WINRATE: f64 = 0.10;

const WALLET_AGE_CACHE_TTL: Duration = Duration::from_secs(86_400);
const MARKET_VOL_CACHE_TTL: Duration = Duration::from_secs(3_600);
const WALLETS_PROJECTION_REFRESH: Duration = Duration::from_secs(300);
const CONVICTION_CACHE_CAP: usize = 50;
const ALERT_RETENTION_DAYS: i64 = 30;

fn score_wallet_age(age_days: Option<f64>, nonce: Option<u64>) -> f64 {
    let age_score = age_days.map(|d| {
        if d <= 1.0 {
            100.0
        } else if d <= 7.0 {
            70.0
        } else if d <= 30.0 {
            30.0
        } else {
            0.0
        }
    });
    let nonce_score = nonce.map(|n| {
        if n <= 5 {
            100.0
        } else if n <= 20 {
            60.0
        } else if n <= 50 {
            20.0
        } else {
            0.0
        }
    });

    match (age_score, nonce_score) {
        (Some(a), Some(n)) => a * 0.6 + n * 0.4,
        (Some(a), None) => a,
        (None, Some(n)) => n,
        (None, None) => 50.0,
    }
}

fn score_size_vs_liquidity(usd: f64, market_volume_24h: Option<f64>) -> f64 {
    match market_volume_24h {
        Some(vol) if vol > 0.0 => {
            let r = usd / vol;
            if r > 0.20 {
                100.0
            } else if r > 0.10 {
                70.0
            } else if r > 0.05 {
                40.0
            } else {
                0.0
            }
        }
        _ => 50.0,
    }
}

fn score_market_niche(market_volume_24h: Option<f64>) -> f64 {
    match market_volume_24h {
        Some(vol) => {
            if vol < 10_000.0 {
                100.0
            } else if vol < 50_000.0 {
                70.0
            } else if vol < 200_000.0 {
                30.0
            } else {
                0.0
            }
        }
        None => 50.0,
    }
}

fn score_extreme_odds(side: Side, price: f64, usd: f64) -> f64 {
    if usd < 500.0 {
        return 0.0;
    }
    match side {
        Side::Buy if price <= 0.10 => {
            if usd >= 5_000.0 {
                100.0
            } else if usd >= 1_000.0 {
                80.0
            } else {
                60.0
            }
        }
        Side::Buy if price <= 0.20 => {
            if usd >= 5_000.0 {
                70.0
            } else if usd >= 1_000.0 {
                40.0
            } else {
                0.0
            }
        }
        Side::Sell if price >= 0.85 => {
            if usd >= 5_000.0 {
                80.0
            } else if usd >= 1_000.0 {
                50.0
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

fn score_conviction(history: &VecDeque<Side>) -> f64 {
    let total = history.len();
    if total < 2 {
        return 0.0;
    }
    let buys = history.iter().filter(|s| **s == Side::Buy).count();
    let sells = total - buys;
    let r = buys.max(sells) as f64 / total as f64;

    if r >= 1.0 && total >= 3 {
        100.0
    } else if r >= 0.90 && total >= 3 {
        60.0
    } else if r >= 0.80 && total >= 5 {
        30.0
    } else {
        0.0
    }
}

fn score_category_win_rate(win_rate_all: f64, trade_count_all: u32) -> f64 {
    if trade_count_all < 10 {
        return 0.0;
    }
    if win_rate_all >= 90.0 {
        100.0
    } else if win_rate_all >= 80.0 {
        60.0
    } else if win_rate_all >= 70.0 {
        30.0
    } else {
        0.0
    }
}

struct CachedValue<T> {
    value: T,
    at: Instant,
}

/// Polls the trade store from a saved cursor, scores each new trade across
/// six weighted signals, and writes an alert when the composite qualifies.
pub struct InsiderScorer {
    store: Arc<AnalyticalStore>,
    catalog: Arc<CatalogClient>,
    http_client: reqwest::Client,
    polygon_rpc_url: String,
    cursor: Mutex<i64>,
    wallet_age_cache: Mutex<HashMap<String, CachedValue<(Option<f64>, Option<u64>)>>>,
    market_vol_cache: Mutex<HashMap<String, CachedValue<Option<f64>>>>,
    conviction_history: Mutex<HashMap<(String, String), VecDeque<Side>>>,
    wallets_projection: Mutex<(HashMap<String, (f64, u32, f64, f64)>, Instant)>,
    running: Arc<AtomicBool>,
}

impl InsiderScorer {
    pub fn new(
        store: Arc<AnalyticalStore>,
        catalog: Arc<CatalogClient>,
        http_client: reqwest::Client,
        polygon_rpc_url: String,
    ) -> Result<Arc<Self>> {
        let cursor = store.get_cursor("insider_scorer")?;
        let cursor = if cursor == 0 { store.max_trade_id()? } else { cursor };
        store.set_cursor("insider_scorer", cursor)?;

        Ok(Arc::new(Self {
            store,
            catalog,
            http_client,
            polygon_rpc_url,
            cursor: Mutex::new(cursor),
            wallet_age_cache: Mutex::new(HashMap::new()),
            market_vol_cache: Mutex::new(HashMap::new()),
            conviction_history: Mutex::new(HashMap::new()),
            wallets_projection: Mutex::new((HashMap::new(), Instant::now() - WALLETS_PROJECTION_REFRESH)),
            running: Arc::new(AtomicBool::new(true)),
        }))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    async fn market_volume_24h(&self, condition_id: &str) -> Option<f64> {
        {
            let cache = self.market_vol_cache.lock();
            if let Some(cached) = cache.get(condition_id) {
                if cached.at.elapsed() < MARKET_VOL_CACHE_TTL {
                    return cached.value;
                }
            }
        }

        let volume = self
            .catalog
            .market_metadata(condition_id)
            .await
            .ok()
            .flatten()
            .and_then(|v| {
                v.get("volume24hr")
                    .or_else(|| v.get("volume"))
                    .and_then(|x| x.as_f64())
            });

        self.market_vol_cache.lock().insert(
            condition_id.to_string(),
            CachedValue { value: volume, at: Instant::now() },
        );
        volume
    }

    /// Three-tier age resolution: the TTL cache, then the wallets table
    /// (`account_created_at`, or trade count as an activity proxy for
    /// wallets with no creation date), then a Polygon RPC nonce lookup for
    /// addresses we've never seen before. Returns `(age_days, nonce)`;
    /// either side may be `None` if no tier could resolve it.
    async fn wallet_age_days(&self, address: &str) -> (Option<f64>, Option<u64>) {
        {
            let cache = self.wallet_age_cache.lock();
            if let Some(cached) = cache.get(address) {
                if cached.at.elapsed() < WALLET_AGE_CACHE_TTL {
                    return cached.value;
                }
            }
        }

        let wallet = self.store.get_wallet(address).ok().flatten();
        let resolved = match &wallet {
            Some(w) => match w.account_created_at {
                Some(created) => {
                    let age = (Utc::now() - created).num_seconds() as f64 / 86_400.0;
                    Some((Some(age), Some(w.trade_count_all as u64)))
                }
                None if w.trade_count_all > 20 => Some((Some(365.0), Some(w.trade_count_all as u64))),
                None => None,
            },
            None => None,
        };

        let resolved = match resolved {
            Some(r) => r,
            None => self.polygon_wallet_age(address).await,
        };

        self.wallet_age_cache
            .lock()
            .insert(address.to_string(), CachedValue { value: resolved, at: Instant::now() });
        resolved
    }

    /// Fallback for wallets not yet in our DB: estimate age from the
    /// on-chain transaction nonce via `eth_getTransactionCount`.
    async fn polygon_wallet_age(&self, address: &str) -> (Option<f64>, Option<u64>) {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_getTransactionCount",
            "params": [address, "latest"],
            "id": 1,
        });

        let nonce = async {
            let resp = self
                .http_client
                .post(&self.polygon_rpc_url)
                .json(&body)
                .timeout(Duration::from_secs(10))
                .send()
                .await
                .ok()?;
            if !resp.status().is_success() {
                return None;
            }
            let payload: serde_json::Value = resp.json().await.ok()?;
            let hex_count = payload.get("result")?.as_str()?;
            u64::from_str_radix(hex_count.trim_start_matches("0x"), 16).ok()
        }
        .await;

        match nonce {
            Some(n) => {
                let age_days = if n <= 5 {
                    1.0
                } else if n <= 20 {
                    7.0
                } else if n <= 100 {
                    30.0
                } else {
                    90.0
                };
                (Some(age_days), Some(n))
            }
            None => {
                debug!(address = %address, "polygon rpc nonce lookup failed, defaulting to established wallet");
                (Some(90.0), Some(100))
            }
        }
    }

    fn refresh_wallets_projection(&self) {
        let mut guard = self.wallets_projection.lock();
        if guard.1.elapsed() < WALLETS_PROJECTION_REFRESH {
            return;
        }
        match self.store.wallet_profitability_projection() {
            Ok(projection) => {
                *guard = (projection, Instant::now());
            }
            Err(e) => warn!(error = %e, "failed to refresh wallets profitability projection"),
        }
    }

    fn classify_profitability(&self, address: &str, composite_score: u32) -> ProfitabilityStatus {
        let projection = self.wallets_projection.lock();
        match projection.0.get(&address.to_lowercase()) {
            Some((pnl_all, trade_count_all, copytrade_score, profit_factor_30d)) => {
                if composite_score as f64 >= 60.0 && *copytrade_score >= 60.0 && *profit_factor_30d >= 1.5 {
                    ProfitabilityStatus::Copyable
                } else if *pnl_all > 0.0 {
                    ProfitabilityStatus::Profitable
                } else if *trade_count_all >= 15 && *pnl_all <= 0.0 {
                    ProfitabilityStatus::Unprofitable
                } else {
                    ProfitabilityStatus::Unknown
                }
            }
            None => ProfitabilityStatus::Pending,
        }
    }

    async fn score_trade(&self, trade: &Trade) -> (u32, InsiderSubScores, Vec<String>) {
        let address = trade.trader_address.to_lowercase();
        let market_volume = self.market_volume_24h(&trade.condition_id).await;
        let (age_days, nonce) = self.wallet_age_days(&address).await;

        let wallet = self.store.get_wallet(&address).ok().flatten();

        let conviction_score = {
            let mut history = self.conviction_history.lock();
            let key = (address.clone(), trade.condition_id.clone());
            let entry = history.entry(key).or_default();
            entry.push_back(trade.side);
            while entry.len() > CONVICTION_CACHE_CAP {
                entry.pop_front();
            }
            score_conviction(entry)
        };

        let sub_scores = InsiderSubScores {
            wallet_age: score_wallet_age(age_days, nonce),
            size_vs_liquidity: score_size_vs_liquidity(trade.usd_value, market_volume),
            market_niche: score_market_niche(market_volume),
            extreme_odds: score_extreme_odds(trade.side, trade.price, trade.usd_value),
            conviction: conviction_score,
            category_win_rate: wallet
                .as_ref()
                .map(|w| score_category_win_rate(w.win_rate_all, w.trade_count_all))
                .unwrap_or(0.0),
        };

        let composite = sub_scores.wallet_age * W_WALLET_AGE
            + sub_scores.size_vs_liquidity * W_SIZE_LIQUIDITY
            + sub_scores.market_niche * W_MARKET_NICHE
            + sub_scores.extreme_odds * W_EXTREME_ODDS
            + sub_scores.conviction * W_CONVICTION
            + sub_scores.category_win_rate * W_CATEGORY_WINRATE;

        let mut signals = Vec::new();
        if sub_scores.wallet_age >= SIGNAL_THRESHOLD {
            signals.push("wallet_age".to_string());
        }
        if sub_scores.size_vs_liquidity >= SIGNAL_THRESHOLD {
            signals.push("size_vs_liquidity".to_string());
        }
        if sub_scores.market_niche >= SIGNAL_THRESHOLD {
            signals.push("market_niche".to_string());
        }
        if sub_scores.extreme_odds >= SIGNAL_THRESHOLD {
            signals.push("extreme_odds".to_string());
        }
        if sub_scores.conviction >= SIGNAL_THRESHOLD {
            signals.push("conviction".to_string());
        }
        if sub_scores.category_win_rate >= SIGNAL_THRESHOLD {
            signals.push("category_win_rate".to_string());
        }

        (composite.round() as u32, sub_scores, signals)
    }

    async fn tick(&self) -> Result<()> {
        self.refresh_wallets_projection();

        let since = *self.cursor.lock();
        let rows = match self.store.trades_since(since, POLL_BATCH_SIZE) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "insider scorer fetch failed, cursor not advanced");
                return Err(e);
            }
        };

        for (id, trade) in rows {
            if trade.usd_value >= MIN_USD_VALUE {
                let (composite, sub_scores, signals) = self.score_trade(&trade).await;
                if composite >= SCORE_THRESHOLD {
                    let profitability = self.classify_profitability(&trade.trader_address, composite);
                    let alert = InsiderAlert {
                        trade_id: trade.trade_id.clone(),
                        composite_score: composite,
                        sub_scores,
                        signals,
                        profitability,
                        created_at: Utc::now(),
                    };
                    if let Err(e) = self.store.insert_insider_alert(&alert) {
                        warn!(error = %e, trade_id = %trade.trade_id, "failed to write insider alert");
                    } else {
                        info!(trade_id = %trade.trade_id, composite_score = composite, "insider alert written");
                    }
                }
            }

            *self.cursor.lock() = id;
            if let Err(e) = self.store.set_cursor("insider_scorer", id) {
                warn!(error = %e, "failed to persist insider scorer cursor");
            }
        }

        Ok(())
    }

    pub async fn run(self: Arc<Self>) {
        let mut poll_tick = interval(POLL_INTERVAL);
        let mut retention_tick = interval(Duration::from_secs(24 * 3_600));

        loop {
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            tokio::select! {
                _ = poll_tick.tick() => {
                    if let Err(e) = self.tick().await {
                        debug!(error = %e, "insider scorer tick failed");
                    }
                }
                _ = retention_tick.tick() => {
                    let cutoff = Utc::now() - ChronoDuration::days(ALERT_RETENTION_DAYS);
                    match self.store.prune_insider_alerts_older_than(cutoff) {
                        Ok(n) if n > 0 => info!(pruned = n, "insider alert retention sweep"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "insider alert retention sweep failed"),
                    }
                }
            }
        }
        info!("insider scorer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wallet_age_blends_age_and_nonce() {
        let score = score_wallet_age(Some(1.0), Some(5));
        assert_eq!(score, 100.0);
        let score = score_wallet_age(Some(45.0), Some(60));
        assert_eq!(score, 0.0);
    }

    #[test]
    fn extreme_odds_scores_small_buy_at_long_odds() {
        assert_eq!(score_extreme_odds(Side::Buy, 0.05, 6_000.0), 100.0);
        assert_eq!(score_extreme_odds(Side::Buy, 0.05, 100.0), 0.0);
        assert_eq!(score_extreme_odds(Side::Buy, 0.90, 10_000.0), 0.0);
    }

    #[test]
    fn conviction_requires_minimum_trades() {
        let mut history = VecDeque::new();
        history.push_back(Side::Buy);
        assert_eq!(score_conviction(&history), 0.0);
        history.push_back(Side::Buy);
        history.push_back(Side::Buy);
        assert_eq!(score_conviction(&history), 100.0);
    }

    #[test]
    fn category_win_rate_needs_ten_trades() {
        assert_eq!(score_category_win_rate(95.0, 5), 0.0);
        assert_eq!(score_category_win_rate(95.0, 10), 100.0);
    }
}
