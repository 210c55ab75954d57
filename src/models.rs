//! Shared data types for the live-trade pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// A single trade observed on the live feed. Never mutated once created;
/// duplicate `trade_id`s are resolved by upsert at the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub trader_address: String,
    pub condition_id: String,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub market_slug: Option<String>,
    #[serde(default)]
    pub event_slug: Option<String>,
    pub side: Side,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub outcome_index: u32,
    pub size: f64,
    pub price: f64,
    pub usd_value: f64,
    pub executed_at: DateTime<Utc>,
    #[serde(default)]
    pub tx_hash: Option<String>,
}

impl Trade {
    /// `usd_value` should track `size * price` within a small relative tolerance.
    pub fn usd_value_consistent(&self) -> bool {
        let expected = self.size * self.price;
        if expected.abs() < 1e-9 {
            return self.usd_value.abs() < 1e-6;
        }
        ((self.usd_value - expected) / expected).abs() < 1e-6
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowMetrics {
    pub pnl: f64,
    pub roi: f64,
    pub win_rate: f64,
    pub volume: f64,
    pub trade_count: u32,
    pub drawdown: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BehaviouralMetrics {
    pub trade_frequency: f64,
    pub night_trade_ratio: f64,
    pub trade_time_variance: f64,
    pub position_size_variance: f64,
    pub avg_hold_hours: f64,
    pub max_drawdown: f64,
    pub unique_markets: u32,
    pub position_concentration: f64,
    pub avg_entry_probability: f64,
    pub pnl_concentration: f64,
    pub category_concentration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub address: String,
    pub source: String,
    #[serde(default)]
    pub balance: Option<f64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub account_created_at: Option<DateTime<Utc>>,

    pub window_7d: WindowMetrics,
    pub window_30d: WindowMetrics,

    pub pnl_all: f64,
    pub roi_all: f64,
    pub win_rate_all: f64,
    pub volume_all: f64,
    pub trade_count_all: u32,
    pub wins_all: u32,
    pub losses_all: u32,
    pub drawdown_all: f64,

    pub copytrade_score: f64,

    #[serde(default)]
    pub behavioural: BehaviouralMetrics,

    pub metrics_updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn wins_losses_consistent(&self) -> bool {
        self.wins_all + self.losses_all <= self.trade_count_all
    }
}

/// An open position, keyed by (address, condition_id, outcome_index).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub address: String,
    pub condition_id: String,
    pub outcome_index: u32,
    pub size: f64,
    pub avg_price: f64,
    pub initial_value: f64,
    #[serde(default)]
    pub current_value: Option<f64>,
    #[serde(default)]
    pub cash_pnl: Option<f64>,
}

/// A resolved position, keyed by (address, condition_id, outcome).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub address: String,
    pub condition_id: String,
    pub outcome: String,
    pub total_bought: f64,
    pub avg_price: f64,
    pub final_price: f64,
    pub realized_pnl: f64,
    pub is_win: bool,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsiderAlert {
    pub trade_id: String,
    pub composite_score: u32,
    pub sub_scores: InsiderSubScores,
    pub signals: Vec<String>,
    pub profitability: ProfitabilityStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InsiderSubScores {
    pub wallet_age: f64,
    pub size_vs_liquidity: f64,
    pub market_niche: f64,
    pub extreme_odds: f64,
    pub conviction: f64,
    pub category_win_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfitabilityStatus {
    Copyable,
    Profitable,
    Unprofitable,
    Pending,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyTradeLog {
    pub source_trader: String,
    pub source_trade_id: String,
    #[serde(default)]
    pub our_order_id: Option<String>,
    pub market_id: String,
    pub size_chosen_usd: f64,
    pub status: CopyTradeStatus,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyTradeStatus {
    Executed,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Open,
    Filled,
    Partial,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub token_id: String,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    pub filled_size: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usd_value_consistency() {
        let trade = Trade {
            trade_id: "1".into(),
            trader_address: "0xabc".into(),
            condition_id: "c1".into(),
            asset_id: None,
            market_slug: None,
            event_slug: None,
            side: Side::Buy,
            outcome: None,
            outcome_index: 0,
            size: 100.0,
            price: 0.3,
            usd_value: 30.0,
            executed_at: Utc::now(),
            tx_hash: None,
        };
        assert!(trade.usd_value_consistent());
    }

    #[test]
    fn wins_losses_invariant() {
        let wallet_json = serde_json::json!({
            "address": "0xabc",
            "source": "discovery",
            "balance": null,
            "username": null,
            "account_created_at": null,
            "window_7d": {"pnl":0.0,"roi":0.0,"win_rate":0.0,"volume":0.0,"trade_count":0,"drawdown":0.0},
            "window_30d": {"pnl":0.0,"roi":0.0,"win_rate":0.0,"volume":0.0,"trade_count":0,"drawdown":0.0},
            "pnl_all": 0.0, "roi_all": 0.0, "win_rate_all": 0.0, "volume_all": 0.0,
            "trade_count_all": 10, "wins_all": 6, "losses_all": 4, "drawdown_all": 0.0,
            "copytrade_score": 0.0,
            "metrics_updated_at": Utc::now().to_rfc3339(),
        });
        let wallet: Wallet = serde_json::from_value(wallet_json).unwrap();
        assert!(wallet.wins_losses_consistent());
    }
}
