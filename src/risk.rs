//! Risk limits, kill switch, and open-position tracking for the copy trader.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::Side;
use crate::store::{AnalyticalStore, OrderRow, PositionRow};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_position_size_usd: f64,
    pub max_total_exposure_usd: f64,
    pub max_single_order_usd: f64,
    pub max_daily_loss_usd: f64,
    pub max_daily_orders: u32,
    pub min_order_usd: f64,
    pub blocked_markets: Vec<String>,
    pub allowed_categories: Option<Vec<String>>,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size_usd: 500.0,
            max_total_exposure_usd: 5000.0,
            max_single_order_usd: 100.0,
            max_daily_loss_usd: 500.0,
            max_daily_orders: 100,
            min_order_usd: 5.0,
            blocked_markets: Vec::new(),
            allowed_categories: None,
        }
    }
}

#[derive(Debug, Clone)]
struct RiskState {
    total_exposure_usd: f64,
    daily_pnl_usd: f64,
    daily_orders: u32,
    day_start: DateTime<Utc>,
    positions: HashMap<String, f64>,
}

fn utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now)
}

use chrono::Datelike;

impl RiskState {
    fn new() -> Self {
        Self {
            total_exposure_usd: 0.0,
            daily_pnl_usd: 0.0,
            daily_orders: 0,
            day_start: utc_midnight(Utc::now()),
            positions: HashMap::new(),
        }
    }
}

/// Per-call guard: every `check_order` and `status` call resets the daily
/// counters once midnight UTC has passed, so callers never observe stale
/// daily accounting across a day boundary.
fn check_daily_reset(state: &mut RiskState) {
    let today_start = utc_midnight(Utc::now());
    if state.day_start < today_start {
        info!(
            prior_orders = state.daily_orders,
            prior_pnl = state.daily_pnl_usd,
            "daily risk counters reset"
        );
        state.day_start = today_start;
        state.daily_pnl_usd = 0.0;
        state.daily_orders = 0;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskStatus {
    pub kill_switch_active: bool,
    pub kill_switch_reason: Option<String>,
    pub trading_allowed: bool,
    pub total_exposure_usd: f64,
    pub exposure_utilization: f64,
    pub daily_pnl_usd: f64,
    pub daily_orders: u32,
    pub daily_orders_remaining: u32,
    pub position_count: usize,
}

/// Enforces hard position/exposure/order caps and a kill switch. Logically
/// single-threaded: all mutation happens from the copy-trade evaluator task.
pub struct RiskManager {
    limits: RiskLimits,
    state: RiskState,
    kill_switch_active: bool,
    kill_switch_reason: Option<String>,
}

impl RiskManager {
    pub fn new(limits: RiskLimits) -> Self {
        info!(
            max_exposure = limits.max_total_exposure_usd,
            max_daily_loss = limits.max_daily_loss_usd,
            "risk manager initialized"
        );
        Self {
            limits,
            state: RiskState::new(),
            kill_switch_active: false,
            kill_switch_reason: None,
        }
    }

    pub fn activate_kill_switch(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "kill switch activated");
        self.kill_switch_reason = Some(reason);
        self.kill_switch_active = true;
    }

    pub fn deactivate_kill_switch(&mut self) {
        info!("kill switch deactivated");
        self.kill_switch_active = false;
        self.kill_switch_reason = None;
    }

    pub fn is_trading_allowed(&self) -> bool {
        !self.kill_switch_active
    }

    /// Checks whether an order of `size_usd` in `market_id` is allowed.
    /// Returns the first matching rejection reason, if any.
    pub fn check_order(
        &mut self,
        market_id: &str,
        size_usd: f64,
        category: Option<&str>,
    ) -> Option<String> {
        check_daily_reset(&mut self.state);

        if self.kill_switch_active {
            return Some(format!(
                "Kill switch active: {}",
                self.kill_switch_reason.as_deref().unwrap_or("unknown")
            ));
        }

        if size_usd > self.limits.max_single_order_usd {
            return Some(format!(
                "Order size ${size_usd:.2} exceeds limit ${:.2}",
                self.limits.max_single_order_usd
            ));
        }

        if size_usd < self.limits.min_order_usd {
            return Some(format!(
                "Order size ${size_usd:.2} below minimum ${:.2}",
                self.limits.min_order_usd
            ));
        }

        let new_exposure = self.state.total_exposure_usd + size_usd;
        if new_exposure > self.limits.max_total_exposure_usd {
            return Some(format!(
                "Would exceed total exposure limit: ${new_exposure:.2} > ${:.2}",
                self.limits.max_total_exposure_usd
            ));
        }

        let current_position = self.state.positions.get(market_id).copied().unwrap_or(0.0);
        let new_position = current_position + size_usd;
        if new_position > self.limits.max_position_size_usd {
            return Some(format!(
                "Would exceed position limit for {market_id}: ${new_position:.2} > ${:.2}",
                self.limits.max_position_size_usd
            ));
        }

        if self.state.daily_pnl_usd < -self.limits.max_daily_loss_usd {
            return Some(format!(
                "Daily loss limit reached: ${:.2} < -${:.2}",
                self.state.daily_pnl_usd, self.limits.max_daily_loss_usd
            ));
        }

        if self.state.daily_orders >= self.limits.max_daily_orders {
            return Some(format!(
                "Daily order limit reached: {}",
                self.limits.max_daily_orders
            ));
        }

        if self
            .limits
            .blocked_markets
            .iter()
            .any(|m| m == market_id)
        {
            return Some(format!("Market {market_id} is blocked"));
        }

        if let Some(allowed) = &self.limits.allowed_categories {
            if let Some(category) = category {
                if !allowed.iter().any(|c| c == category) {
                    return Some(format!("Category '{category}' not in allowed list"));
                }
            }
        }

        None
    }

    pub fn record_order(&mut self, market_id: &str, size_usd: f64) {
        self.state.total_exposure_usd += size_usd;
        self.state.daily_orders += 1;
        *self
            .state
            .positions
            .entry(market_id.to_string())
            .or_insert(0.0) += size_usd;
    }

    pub fn record_fill(&mut self, market_id: &str, size_usd: f64, pnl_usd: f64) {
        self.state.total_exposure_usd = (self.state.total_exposure_usd - size_usd).max(0.0);

        if let Some(position) = self.state.positions.get_mut(market_id) {
            *position = (*position - size_usd).max(0.0);
        }

        self.state.daily_pnl_usd += pnl_usd;

        if self.state.daily_pnl_usd < -self.limits.max_daily_loss_usd {
            let reason = format!(
                "Daily loss limit exceeded: ${:.2}",
                self.state.daily_pnl_usd
            );
            self.activate_kill_switch(reason);
        }
    }

    pub fn max_single_order_usd(&self) -> f64 {
        self.limits.max_single_order_usd
    }

    pub fn status(&mut self) -> RiskStatus {
        check_daily_reset(&mut self.state);
        let utilization = if self.limits.max_total_exposure_usd > 0.0 {
            self.state.total_exposure_usd / self.limits.max_total_exposure_usd
        } else {
            0.0
        };
        RiskStatus {
            kill_switch_active: self.kill_switch_active,
            kill_switch_reason: self.kill_switch_reason.clone(),
            trading_allowed: self.is_trading_allowed(),
            total_exposure_usd: self.state.total_exposure_usd,
            exposure_utilization: utilization,
            daily_pnl_usd: self.state.daily_pnl_usd,
            daily_orders: self.state.daily_orders,
            daily_orders_remaining: self
                .limits
                .max_daily_orders
                .saturating_sub(self.state.daily_orders),
            position_count: self.state.positions.values().filter(|p| **p > 0.0).count(),
        }
    }
}

/// An open position for the position tracker, keyed by `token_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub token_id: String,
    pub side: Side,
    pub size: f64,
    pub avg_price: f64,
    pub current_price: f64,
}

impl TrackedPosition {
    pub fn unrealized_pnl(&self) -> f64 {
        let pnl = (self.current_price - self.avg_price) * self.size;
        match self.side {
            Side::Buy => pnl,
            Side::Sell => -pnl,
        }
    }
}

/// Tracks open positions by `token_id`. Adding on the same side re-averages
/// price; the opposite side reduces (or closes) the position. Every mutation
/// is mirrored to `user_positions` so the book on disk never lags this map.
pub struct PositionTracker {
    positions: HashMap<String, TrackedPosition>,
    store: Arc<AnalyticalStore>,
    address: String,
}

impl PositionTracker {
    pub fn new(store: Arc<AnalyticalStore>, address: String) -> Self {
        Self {
            positions: HashMap::new(),
            store,
            address,
        }
    }

    fn persist(&self, token_id: &str) {
        match self.positions.get(token_id) {
            Some(position) => {
                let row = PositionRow {
                    token_id: token_id.to_string(),
                    side: position.side.as_str().to_string(),
                    size: position.size,
                    avg_price: position.avg_price,
                    current_price: position.current_price,
                };
                if let Err(e) = self.store.upsert_position(&self.address, &row) {
                    warn!(token_id, error = %e, "failed to persist position");
                }
            }
            None => {
                if let Err(e) = self.store.delete_position(&self.address, token_id) {
                    warn!(token_id, error = %e, "failed to delete closed position");
                }
            }
        }
    }

    pub fn apply_fill(&mut self, token_id: &str, side: Side, size: f64, price: f64) {
        match self.positions.get_mut(token_id) {
            Some(existing) if existing.side == side => {
                let total_size = existing.size + size;
                existing.avg_price =
                    (existing.avg_price * existing.size + price * size) / total_size;
                existing.size = total_size;
            }
            Some(existing) => {
                if size >= existing.size {
                    self.positions.remove(token_id);
                } else {
                    existing.size -= size;
                }
            }
            None => {
                self.positions.insert(
                    token_id.to_string(),
                    TrackedPosition {
                        token_id: token_id.to_string(),
                        side,
                        size,
                        avg_price: price,
                        current_price: price,
                    },
                );
            }
        }

        let order_id = uuid::Uuid::new_v4().to_string();
        let order = OrderRow {
            id: order_id,
            address: self.address.clone(),
            token_id: token_id.to_string(),
            side: side.as_str().to_string(),
            size,
            price,
            status: "filled".to_string(),
            filled_notional_usd: size * price,
            filled_price: price,
        };
        if let Err(e) = self.store.insert_order(&order) {
            warn!(token_id, error = %e, "failed to persist fill order");
        }

        self.persist(token_id);
    }

    pub fn update_price(&mut self, token_id: &str, price: f64) {
        if let Some(position) = self.positions.get_mut(token_id) {
            position.current_price = price;
            self.persist(token_id);
        }
    }

    pub fn get(&self, token_id: &str) -> Option<&TrackedPosition> {
        self.positions.get(token_id)
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &TrackedPosition> {
        self.positions.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposure_never_goes_negative() {
        let mut manager = RiskManager::new(RiskLimits::default());
        assert!(manager.check_order("m1", 50.0, None).is_none());
        manager.record_order("m1", 50.0);
        manager.record_fill("m1", 1000.0, -10.0);
        let status = manager.status();
        assert!(status.total_exposure_usd >= 0.0);
    }

    #[test]
    fn rejects_over_single_order_cap() {
        let mut manager = RiskManager::new(RiskLimits::default());
        let reason = manager.check_order("m1", 1000.0, None);
        assert!(reason.unwrap().contains("exceeds limit"));
    }

    #[test]
    fn rejects_when_total_exposure_exceeded() {
        let mut limits = RiskLimits::default();
        limits.max_total_exposure_usd = 100.0;
        limits.max_single_order_usd = 100.0;
        let mut manager = RiskManager::new(limits);
        manager.record_order("m1", 80.0);
        let reason = manager.check_order("m2", 50.0, None);
        assert!(reason.unwrap().contains("total exposure"));
    }

    #[test]
    fn daily_loss_trips_kill_switch() {
        let mut limits = RiskLimits::default();
        limits.max_daily_loss_usd = 500.0;
        let mut manager = RiskManager::new(limits);
        manager.record_order("m1", 50.0);
        manager.record_fill("m1", 50.0, -499.0);
        assert!(manager.is_trading_allowed());
        manager.record_order("m2", 50.0);
        manager.record_fill("m2", 50.0, -2.0);
        assert!(!manager.is_trading_allowed());
        let reason = manager.check_order("m3", 10.0, None);
        assert!(reason.unwrap().contains("Kill switch"));
    }

    #[test]
    fn blocked_market_is_rejected() {
        let mut limits = RiskLimits::default();
        limits.blocked_markets = vec!["bad".to_string()];
        let mut manager = RiskManager::new(limits);
        let reason = manager.check_order("bad", 10.0, None);
        assert!(reason.unwrap().contains("is blocked"));
    }

    fn test_tracker() -> PositionTracker {
        let store = Arc::new(AnalyticalStore::open_in_memory().unwrap());
        PositionTracker::new(store, "0xself".to_string())
    }

    #[test]
    fn position_tracker_reaverages_same_side() {
        let mut tracker = test_tracker();
        tracker.apply_fill("tok1", Side::Buy, 100.0, 0.40);
        tracker.apply_fill("tok1", Side::Buy, 100.0, 0.60);
        let position = tracker.get("tok1").unwrap();
        assert_eq!(position.size, 200.0);
        assert!((position.avg_price - 0.50).abs() < 1e-9);
    }

    #[test]
    fn position_tracker_closes_on_full_opposite_fill() {
        let mut tracker = test_tracker();
        tracker.apply_fill("tok1", Side::Buy, 100.0, 0.40);
        tracker.apply_fill("tok1", Side::Sell, 100.0, 0.50);
        assert!(tracker.get("tok1").is_none());
    }

    #[test]
    fn position_tracker_persists_to_store() {
        let store = Arc::new(AnalyticalStore::open_in_memory().unwrap());
        let mut tracker = PositionTracker::new(store.clone(), "0xself".to_string());
        tracker.apply_fill("tok1", Side::Buy, 100.0, 0.40);
        let rows = store.open_positions_for("0xself").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].token_id, "tok1");

        tracker.apply_fill("tok1", Side::Sell, 100.0, 0.50);
        let rows = store.open_positions_for("0xself").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn unrealized_pnl_sign_for_sell() {
        let position = TrackedPosition {
            token_id: "tok1".into(),
            side: Side::Sell,
            size: 100.0,
            avg_price: 0.50,
            current_price: 0.60,
        };
        assert!(position.unrealized_pnl() < 0.0);
    }
}
