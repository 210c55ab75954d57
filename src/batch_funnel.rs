//! Batch narrowing pipeline over a candidate wallet set: four elimination
//! stages, an annotation stage, and a final classification stage. Reuses the
//! same metric formulae as the live discovery path. Not part of the
//! streaming engine's task set; run on demand from `batch_funnel`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::catalog::CatalogClient;
use crate::models::Wallet;
use crate::store::AnalyticalStore;
use crate::wallet_discovery::{compute_metrics, fold_closed_positions};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Step1Filters {
    pub min_trades: u32,
}

impl Default for Step1Filters {
    fn default() -> Self {
        Self { min_trades: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Step2Filters {
    pub min_portfolio_value: f64,
}

impl Default for Step2Filters {
    fn default() -> Self {
        Self { min_portfolio_value: 200.0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Step3Filters {
    pub min_position_size: f64,
    pub require_positions: bool,
}

impl Default for Step3Filters {
    fn default() -> Self {
        Self { min_position_size: 10.0, require_positions: false }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Step4Filters {
    pub min_win_rate: f64,
    pub min_total_pnl: f64,
    pub require_one: bool,
}

impl Default for Step4Filters {
    fn default() -> Self {
        Self { min_win_rate: 40.0, min_total_pnl: 0.0, require_one: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifyThresholds {
    pub min_copytrade_score: f64,
    pub min_bot_trade_count: u32,
    pub max_insider_account_age_days: i64,
}

impl Default for ClassifyThresholds {
    fn default() -> Self {
        Self {
            min_copytrade_score: 60.0,
            min_bot_trade_count: 100,
            max_insider_account_age_days: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FunnelConfig {
    pub step1_goldsky: Step1Filters,
    pub step2_balance: Step2Filters,
    pub step3_positions: Step3Filters,
    pub step4_performance: Step4Filters,
    pub classify: ClassifyThresholds,
}

impl FunnelConfig {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read funnel filter file {path}"))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse funnel filter file {path}"))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageCounters {
    pub processed: u64,
    pub qualified: u64,
    pub eliminated: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FunnelStats {
    pub stage1_trade_count: StageCounters,
    pub stage2_balance: StageCounters,
    pub stage3_positions: StageCounters,
    pub stage4_performance: StageCounters,
    pub stage5_annotate: StageCounters,
    pub stage6_classify: StageCounters,
    pub copytrade_candidates: u64,
    pub likely_bots: u64,
    pub insider_suspects: u64,
}

pub struct BatchFunnel {
    store: Arc<AnalyticalStore>,
    catalog: Arc<CatalogClient>,
    config: FunnelConfig,
    stats: Mutex<FunnelStats>,
}

impl BatchFunnel {
    pub fn new(store: Arc<AnalyticalStore>, catalog: Arc<CatalogClient>, config: FunnelConfig) -> Self {
        Self {
            store,
            catalog,
            config,
            stats: Mutex::new(FunnelStats::default()),
        }
    }

    pub fn stats(&self) -> FunnelStats {
        self.stats.lock().clone()
    }

    pub async fn run(&self, candidates: Vec<String>) -> Result<FunnelStats> {
        let run_id = self.store.start_pipeline_run(candidates.len())?;
        self.store
            .insert_pipeline_log(run_id, &format!("starting run over {} candidates", candidates.len()))?;

        let survivors = self.stage1_trade_count(run_id, candidates).await;
        let survivors = self.stage2_balance(run_id, survivors).await;
        let survivors = self.stage3_positions(run_id, survivors).await;
        let survivors = self.stage4_performance(run_id, survivors).await;
        let annotated = self.stage5_annotate(run_id, survivors).await;
        self.stage6_classify(run_id, annotated).await;

        let stats = self.stats();
        let stats_json = serde_json::to_string(&stats).context("serializing funnel stats")?;
        self.store.finish_pipeline_run(run_id, &stats_json)?;
        Ok(stats)
    }

    async fn stage1_trade_count(&self, run_id: i64, candidates: Vec<String>) -> Vec<String> {
        let mut survivors = Vec::new();
        let mut counters = StageCounters::default();
        for address in candidates {
            counters.processed += 1;
            let trade_count = self.catalog.activity(&address).await.map(|a| a.len()).unwrap_or(0);
            if trade_count as u32 >= self.config.step1_goldsky.min_trades {
                counters.qualified += 1;
                survivors.push(address);
            } else {
                counters.eliminated += 1;
            }
        }
        info!(processed = counters.processed, qualified = counters.qualified, "stage1 trade-count filter complete");
        self.stats.lock().stage1_trade_count = counters;
        self.record_progress(run_id, "stage1_trade_count", &counters);
        survivors
    }

    async fn stage2_balance(&self, run_id: i64, candidates: Vec<String>) -> Vec<String> {
        let mut survivors = Vec::new();
        let mut counters = StageCounters::default();
        for address in candidates {
            counters.processed += 1;
            let (value, cash) = self.catalog.portfolio_value(&address).await.unwrap_or((0.0, 0.0));
            if value + cash >= self.config.step2_balance.min_portfolio_value {
                counters.qualified += 1;
                survivors.push(address);
            } else {
                counters.eliminated += 1;
            }
        }
        info!(processed = counters.processed, qualified = counters.qualified, "stage2 balance filter complete");
        self.stats.lock().stage2_balance = counters;
        self.record_progress(run_id, "stage2_balance", &counters);
        survivors
    }

    async fn stage3_positions(&self, run_id: i64, candidates: Vec<String>) -> Vec<String> {
        let mut survivors = Vec::new();
        let mut counters = StageCounters::default();
        for address in candidates {
            counters.processed += 1;
            let open = self.catalog.open_positions(&address).await.unwrap_or_default();
            let has_qualifying_position = open
                .iter()
                .any(|p| p.size * p.avg_price >= self.config.step3_positions.min_position_size);
            let passes = if self.config.step3_positions.require_positions {
                has_qualifying_position
            } else {
                open.is_empty() || has_qualifying_position
            };
            if passes {
                counters.qualified += 1;
                survivors.push(address);
            } else {
                counters.eliminated += 1;
            }
        }
        info!(processed = counters.processed, qualified = counters.qualified, "stage3 positions filter complete");
        self.stats.lock().stage3_positions = counters;
        self.record_progress(run_id, "stage3_positions", &counters);
        survivors
    }

    async fn stage4_performance(&self, run_id: i64, candidates: Vec<String>) -> Vec<String> {
        let mut survivors = Vec::new();
        let mut counters = StageCounters::default();
        for address in candidates {
            counters.processed += 1;
            let closed = self.catalog.closed_positions(&address).await.unwrap_or_default();
            let folded = fold_closed_positions(&closed);
            let refs: Vec<_> = folded.iter().collect();
            let metrics = compute_metrics(&refs, 0.0, 0.0, false);

            let win_rate_ok = metrics.win_rate >= self.config.step4_performance.min_win_rate;
            let pnl_ok = metrics.pnl >= self.config.step4_performance.min_total_pnl;
            let passes = if self.config.step4_performance.require_one {
                win_rate_ok || pnl_ok
            } else {
                win_rate_ok && pnl_ok
            };

            if passes {
                counters.qualified += 1;
                survivors.push(address);
            } else {
                counters.eliminated += 1;
            }
        }
        info!(processed = counters.processed, qualified = counters.qualified, "stage4 performance filter complete");
        self.stats.lock().stage4_performance = counters;
        self.record_progress(run_id, "stage4_performance", &counters);
        survivors
    }

    /// Annotates surviving wallets with full lifetime metrics, persisting
    /// the results the same way the live discovery path does.
    async fn stage5_annotate(&self, run_id: i64, candidates: Vec<String>) -> Vec<Wallet> {
        let mut annotated = Vec::new();
        let mut counters = StageCounters::default();
        for address in candidates {
            counters.processed += 1;
            let (open, closed, portfolio, profile) = tokio::join!(
                self.catalog.open_positions(&address),
                self.catalog.closed_positions(&address),
                self.catalog.portfolio_value(&address),
                self.catalog.profile(&address),
            );
            let open = open.unwrap_or_default();
            let closed = closed.unwrap_or_default();
            let (portfolio_value, cash) = portfolio.unwrap_or((0.0, 0.0));
            let balance = portfolio_value + cash;
            let account_created_at = profile
                .ok()
                .flatten()
                .and_then(|p| p.get("createdAt").and_then(|v| v.as_str()).map(str::to_string))
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                .map(|d| d.with_timezone(&Utc));

            let folded = fold_closed_positions(&closed);
            let open_cash_pnl: f64 = open.iter().filter_map(|p| p.cash_pnl).sum();
            let refs: Vec<_> = folded.iter().collect();
            let overall = compute_metrics(&refs, open_cash_pnl, balance, true);

            let wallet = Wallet {
                address: address.clone(),
                source: "batch_funnel".to_string(),
                balance: Some(balance),
                username: None,
                account_created_at,
                window_7d: crate::models::WindowMetrics::default(),
                window_30d: crate::models::WindowMetrics::default(),
                pnl_all: overall.pnl,
                roi_all: overall.roi,
                win_rate_all: overall.win_rate,
                volume_all: overall.volume,
                trade_count_all: overall.trade_count,
                wins_all: overall.wins,
                losses_all: overall.losses,
                drawdown_all: overall.drawdown,
                copytrade_score: 0.0,
                behavioural: crate::models::BehaviouralMetrics::default(),
                metrics_updated_at: Utc::now(),
            };
            annotated.push(wallet);
            counters.qualified += 1;
        }
        info!(processed = counters.processed, "stage5 annotation complete");
        self.stats.lock().stage5_annotate = counters;
        self.record_progress(run_id, "stage5_annotate", &counters);
        annotated
    }

    /// Scores and labels every annotated wallet, then persists it. Stage 6
    /// never eliminates; every wallet that reaches it gets classified and
    /// written back.
    async fn stage6_classify(&self, run_id: i64, wallets: Vec<Wallet>) {
        let thresholds = &self.config.classify;
        let mut counters = StageCounters::default();
        let mut copytrade = 0u64;
        let mut bot = 0u64;
        let mut insider = 0u64;

        for mut wallet in wallets {
            counters.processed += 1;

            let copytrade_score = score_copytrade(&wallet);
            wallet.copytrade_score = copytrade_score;
            if copytrade_score >= thresholds.min_copytrade_score {
                copytrade += 1;
            }
            if wallet.trade_count_all >= thresholds.min_bot_trade_count && wallet.win_rate_all >= 55.0 {
                bot += 1;
            }
            let age_days = wallet
                .account_created_at
                .map(|t| (Utc::now() - t).num_days())
                .unwrap_or(i64::MAX);
            if age_days <= thresholds.max_insider_account_age_days && wallet.pnl_all > 0.0 {
                insider += 1;
            }

            if let Err(e) = self.store.upsert_wallet(&wallet) {
                tracing::warn!(address = %wallet.address, error = %e, "failed to persist classified wallet");
            }
            counters.qualified += 1;
        }

        info!(processed = counters.processed, copytrade, bot, insider, "stage6 classification complete");
        {
            let mut stats = self.stats.lock();
            stats.stage6_classify = counters;
            stats.copytrade_candidates = copytrade;
            stats.likely_bots = bot;
            stats.insider_suspects = insider;
        }
        self.record_progress(run_id, "stage6_classify", &counters);
        if let Err(e) = self.store.insert_pipeline_log(
            run_id,
            &format!("classified {copytrade} copytrade candidates, {bot} bots, {insider} insiders"),
        ) {
            tracing::warn!(error = %e, "failed to write pipeline log");
        }
    }

    fn record_progress(&self, run_id: i64, stage: &str, counters: &StageCounters) {
        if let Err(e) = self.store.record_pipeline_progress(
            run_id,
            stage,
            counters.processed as u32,
            counters.qualified as u32,
            counters.eliminated as u32,
        ) {
            tracing::warn!(stage, error = %e, "failed to record pipeline progress");
        }
    }
}

/// Blends win rate, ROI and drawdown into a single 0-100 score, mirroring
/// the weighting used for the qualification cache (§4.3).
fn score_copytrade(wallet: &Wallet) -> f64 {
    let win_component = wallet.win_rate_all.clamp(0.0, 100.0) * 0.5;
    let roi_component = wallet.roi_all.clamp(-100.0, 200.0).max(0.0).min(100.0) * 0.3;
    let drawdown_component = (1.0 - wallet.drawdown_all.clamp(0.0, 1.0)) * 100.0 * 0.2;
    (win_component + roi_component + drawdown_component).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = FunnelConfig::default();
        assert_eq!(config.step1_goldsky.min_trades, 10);
        assert_eq!(config.step4_performance.min_win_rate, 40.0);
        assert!(config.step4_performance.require_one);
    }

    #[test]
    fn load_missing_path_falls_back_to_defaults() {
        let config = FunnelConfig::load(None).unwrap();
        assert_eq!(config.step2_balance.min_portfolio_value, 200.0);
    }

    #[test]
    fn copytrade_score_rewards_high_winrate_low_drawdown() {
        let mut wallet = sample_wallet();
        wallet.win_rate_all = 80.0;
        wallet.roi_all = 50.0;
        wallet.drawdown_all = 0.1;
        let score = score_copytrade(&wallet);
        assert!(score > 60.0);
    }

    fn sample_wallet() -> Wallet {
        Wallet {
            address: "0xabc".into(),
            source: "test".into(),
            balance: Some(1000.0),
            username: None,
            account_created_at: None,
            window_7d: crate::models::WindowMetrics::default(),
            window_30d: crate::models::WindowMetrics::default(),
            pnl_all: 0.0,
            roi_all: 0.0,
            win_rate_all: 0.0,
            volume_all: 0.0,
            trade_count_all: 0,
            wins_all: 0,
            losses_all: 0,
            drawdown_all: 0.0,
            copytrade_score: 0.0,
            behavioural: crate::models::BehaviouralMetrics::default(),
            metrics_updated_at: Utc::now(),
        }
    }
}
