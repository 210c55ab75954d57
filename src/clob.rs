//! CLOB execution client: a paper-trading simulator and a live Polymarket
//! adapter behind the same trait, selected at startup by config.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::models::{OrderStatus, Side};

type HmacSha256 = Hmac<Sha256>;

const CLOB_HOST: &str = "https://clob.polymarket.com";
/// Fixed delay applied to every paper fill so the adapter behaves like an
/// async I/O call rather than resolving instantly.
const PAPER_SIMULATED_LATENCY_MS: u64 = 40;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: f64,
    pub notional_usd: f64,
    pub tif: TimeInForce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_notional_usd: f64,
    pub filled_price: f64,
    pub filled_at: chrono::DateTime<Utc>,
    pub fees_usd: f64,
    pub slippage_bps: f64,
}

/// Running counters an execution adapter exposes for the status endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ClobStats {
    pub placed: u64,
    pub cancelled: u64,
    pub total_volume_usd: f64,
    pub open_count: u64,
}

#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn place_order(&self, req: OrderRequest) -> Result<OrderAck>;

    async fn cancel_order(&self, _order_id: &str) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> ClobStats {
        ClobStats::default()
    }
}

/// Best bid/ask lookup, implemented against the live CLOB book endpoint and
/// swappable in tests.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn best_bid_ask(&self, token_id: &str) -> Result<(f64, f64)>;
}

/// Fetches the book from the public CLOB REST endpoint, grounded on the
/// same `/book?token_id=` shape the scraper uses for its own order books.
pub struct ClobBookQuoteSource {
    client: Client,
    host: String,
}

impl ClobBookQuoteSource {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            host: CLOB_HOST.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct BookLevel {
    #[serde(deserialize_with = "de_f64")]
    price: f64,
}

#[derive(Deserialize)]
struct BookSnapshot {
    #[serde(default)]
    bids: Vec<BookLevel>,
    #[serde(default)]
    asks: Vec<BookLevel>,
}

fn de_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(deserializer)?;
    match v {
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("invalid number")),
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom("invalid float string")),
        _ => Err(serde::de::Error::custom("expected string or number")),
    }
}

#[async_trait]
impl QuoteSource for ClobBookQuoteSource {
    async fn best_bid_ask(&self, token_id: &str) -> Result<(f64, f64)> {
        let url = format!("{}/book", self.host);
        let book: BookSnapshot = self
            .client
            .get(&url)
            .query(&[("token_id", token_id)])
            .send()
            .await
            .context("failed to fetch order book")?
            .json()
            .await
            .context("failed to parse order book")?;

        let best_bid = book.bids.iter().map(|l| l.price).fold(0.0_f64, f64::max);
        let best_ask = book
            .asks
            .iter()
            .map(|l| l.price)
            .fold(1.0_f64, f64::min);
        Ok((best_bid, best_ask))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PaperExecutionConfig {
    pub fee_rate: f64,
}

impl Default for PaperExecutionConfig {
    fn default() -> Self {
        Self { fee_rate: 0.005 }
    }
}

struct OpenOrder {
    token_id: String,
    side: Side,
    price: f64,
    notional_usd: f64,
}

/// Fills against a just-fetched best bid/ask: a BUY fills when it crosses
/// the ask, a SELL fills when it crosses the bid, otherwise the order rests
/// open until cancelled.
pub struct PaperExecutionAdapter {
    config: PaperExecutionConfig,
    quotes: Arc<dyn QuoteSource>,
    open_orders: Mutex<HashMap<String, OpenOrder>>,
    placed: AtomicU64,
    cancelled: AtomicU64,
    total_volume_bps: Mutex<f64>,
}

impl PaperExecutionAdapter {
    pub fn new(config: PaperExecutionConfig, quotes: Arc<dyn QuoteSource>) -> Self {
        Self {
            config,
            quotes,
            open_orders: Mutex::new(HashMap::new()),
            placed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            total_volume_bps: Mutex::new(0.0),
        }
    }
}

#[async_trait]
impl ExecutionAdapter for PaperExecutionAdapter {
    async fn place_order(&self, req: OrderRequest) -> Result<OrderAck> {
        if !(req.price.is_finite() && req.price > 0.0 && req.price < 1.0) {
            return Err(anyhow!("invalid price: {}", req.price));
        }
        if !(req.notional_usd.is_finite() && req.notional_usd > 0.0) {
            return Err(anyhow!("invalid notional: {}", req.notional_usd));
        }

        sleep(Duration::from_millis(PAPER_SIMULATED_LATENCY_MS)).await;

        let (best_bid, best_ask) = self.quotes.best_bid_ask(&req.token_id).await?;
        let crosses = match req.side {
            Side::Buy => req.price >= best_ask && best_ask > 0.0,
            Side::Sell => req.price <= best_bid && best_bid > 0.0,
        };

        self.placed.fetch_add(1, Ordering::Relaxed);
        let order_id = format!("paper:{}", req.client_order_id);

        if !crosses {
            if req.tif != TimeInForce::Gtc {
                return Err(anyhow!("order did not cross the book ({:?})", req.tif));
            }
            self.open_orders.lock().insert(
                order_id.clone(),
                OpenOrder {
                    token_id: req.token_id,
                    side: req.side,
                    price: req.price,
                    notional_usd: req.notional_usd,
                },
            );
            return Ok(OrderAck {
                order_id,
                status: OrderStatus::Open,
                filled_notional_usd: 0.0,
                filled_price: req.price,
                filled_at: Utc::now(),
                fees_usd: 0.0,
                slippage_bps: 0.0,
            });
        }

        let filled_price = match req.side {
            Side::Buy => best_ask,
            Side::Sell => best_bid,
        };
        let fees_usd = req.notional_usd * self.config.fee_rate;
        *self.total_volume_bps.lock() += req.notional_usd;

        Ok(OrderAck {
            order_id,
            status: OrderStatus::Filled,
            filled_notional_usd: req.notional_usd,
            filled_price,
            filled_at: Utc::now(),
            fees_usd,
            slippage_bps: ((filled_price - req.price).abs() / req.price) * 10_000.0,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        if self.open_orders.lock().remove(order_id).is_some() {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            Err(anyhow!("no open paper order with id {order_id}"))
        }
    }

    fn stats(&self) -> ClobStats {
        ClobStats {
            placed: self.placed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            total_volume_usd: *self.total_volume_bps.lock(),
            open_count: self.open_orders.lock().len() as u64,
        }
    }
}

#[derive(Clone)]
pub struct PolymarketClobCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
    pub wallet_address: String,
}

impl std::fmt::Debug for PolymarketClobCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolymarketClobCredentials")
            .field("api_key", &"<redacted>")
            .field("wallet_address", &self.wallet_address)
            .finish()
    }
}

impl PolymarketClobCredentials {
    pub fn from_env(
        api_key: Option<String>,
        secret: Option<String>,
        passphrase: Option<String>,
        wallet_address: Option<String>,
    ) -> Option<Self> {
        Some(Self {
            api_key: api_key?,
            secret: secret?,
            passphrase: passphrase?,
            wallet_address: wallet_address?,
        })
    }
}

#[derive(Serialize)]
struct ClobOrderPayload {
    #[serde(rename = "tokenID")]
    token_id: String,
    price: String,
    size: String,
    side: String,
    #[serde(rename = "orderType")]
    order_type: String,
    #[serde(rename = "timeInForce")]
    time_in_force: String,
}

#[derive(Deserialize)]
struct ClobOrderResponse {
    #[serde(rename = "orderID")]
    order_id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    #[serde(rename = "makingAmount")]
    making_amount: Option<String>,
}

pub struct PolymarketClobAdapter {
    client: Client,
    creds: PolymarketClobCredentials,
    host: String,
}

impl std::fmt::Debug for PolymarketClobAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolymarketClobAdapter")
            .field("creds", &self.creds)
            .field("host", &self.host)
            .finish()
    }
}

impl PolymarketClobAdapter {
    pub fn new(creds: PolymarketClobCredentials) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build CLOB http client");
        Self {
            client,
            creds,
            host: CLOB_HOST.to_string(),
        }
    }

    fn sign_request(&self, method: &str, path: &str, body: &str, timestamp: i64) -> Result<String> {
        let message = format!("{timestamp}{method}{path}{body}");
        let secret_bytes = URL_SAFE
            .decode(&self.creds.secret)
            .context("failed to decode CLOB secret")?;
        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .map_err(|e| anyhow!("HMAC key error: {e}"))?;
        mac.update(message.as_bytes());
        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }

    fn auth_headers(&self, method: &str, path: &str, body: &str) -> Result<Vec<(String, String)>> {
        let timestamp = Utc::now().timestamp();
        let signature = self.sign_request(method, path, body, timestamp)?;
        Ok(vec![
            ("POLY_ADDRESS".to_string(), self.creds.wallet_address.clone()),
            ("POLY_API_KEY".to_string(), self.creds.api_key.clone()),
            ("POLY_SIGNATURE".to_string(), signature),
            ("POLY_TIMESTAMP".to_string(), timestamp.to_string()),
            ("POLY_PASSPHRASE".to_string(), self.creds.passphrase.clone()),
        ])
    }
}

#[async_trait]
impl ExecutionAdapter for PolymarketClobAdapter {
    async fn place_order(&self, req: OrderRequest) -> Result<OrderAck> {
        if !(req.price.is_finite() && req.price > 0.0 && req.price < 1.0) {
            return Err(anyhow!("invalid price: {}", req.price));
        }
        if !(req.notional_usd.is_finite() && req.notional_usd > 0.0) {
            return Err(anyhow!("invalid notional: {}", req.notional_usd));
        }

        let size = req.notional_usd / req.price;
        let side_str = match req.side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let tif_str = match req.tif {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
        };

        let payload = ClobOrderPayload {
            token_id: req.token_id.clone(),
            price: format!("{:.4}", req.price),
            size: format!("{size:.6}"),
            side: side_str.to_string(),
            order_type: "LIMIT".to_string(),
            time_in_force: tif_str.to_string(),
        };
        let body = serde_json::to_string(&payload).context("failed to serialize order")?;
        let path = "/order";
        let headers = self.auth_headers("POST", path, &body)?;

        debug!(token_id = %req.token_id, side = side_str, price = req.price, "submitting CLOB order");

        let url = format!("{}{}", self.host, path);
        let mut request = self.client.post(&url).header("Content-Type", "application/json");
        for (key, value) in headers {
            request = request.header(&key, &value);
        }

        let response = request.body(body).send().await.context("CLOB request failed")?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(%status, error = %error_text, "CLOB order rejected");
            return Err(anyhow!("CLOB order rejected ({status}): {error_text}"));
        }

        let parsed: ClobOrderResponse = response.json().await.context("failed to parse CLOB response")?;
        let filled_shares: f64 = parsed
            .making_amount
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(size);
        let filled_notional = filled_shares * req.price;

        if parsed.status.as_deref() == Some("FAILED") {
            return Err(anyhow!("CLOB order failed: {}", parsed.order_id));
        }

        let order_status = match parsed.status.as_deref() {
            Some("MATCHED") | Some("FILLED") => OrderStatus::Filled,
            Some("PARTIAL") => OrderStatus::Partial,
            _ => OrderStatus::Open,
        };

        Ok(OrderAck {
            order_id: parsed.order_id,
            status: order_status,
            filled_notional_usd: filled_notional,
            filled_price: req.price,
            filled_at: Utc::now(),
            fees_usd: filled_notional * 0.005,
            slippage_bps: 0.0,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let path = format!("/order/{order_id}");
        let headers = self.auth_headers("DELETE", &path, "")?;
        let url = format!("{}{}", self.host, path);
        let mut request = self.client.delete(&url);
        for (key, value) in headers {
            request = request.header(&key, &value);
        }
        let response = request.send().await.context("CLOB cancel request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("CLOB cancel rejected ({status}): {error_text}"));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) struct StaticQuoteSource {
    pub bid: f64,
    pub ask: f64,
}

#[cfg(test)]
#[async_trait]
impl QuoteSource for StaticQuoteSource {
    async fn best_bid_ask(&self, _token_id: &str) -> Result<(f64, f64)> {
        Ok((self.bid, self.ask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter_with_quote(bid: f64, ask: f64) -> PaperExecutionAdapter {
        PaperExecutionAdapter::new(
            PaperExecutionConfig::default(),
            Arc::new(StaticQuoteSource { bid, ask }),
        )
    }

    #[tokio::test]
    async fn paper_adapter_rejects_invalid_price() {
        let adapter = adapter_with_quote(0.39, 0.41);
        let req = OrderRequest {
            client_order_id: "c1".into(),
            token_id: "tok1".into(),
            side: Side::Buy,
            price: 1.5,
            notional_usd: 10.0,
            tif: TimeInForce::Gtc,
        };
        assert!(adapter.place_order(req).await.is_err());
    }

    #[tokio::test]
    async fn paper_adapter_fills_when_crossing_ask() {
        let adapter = adapter_with_quote(0.38, 0.40);
        let req = OrderRequest {
            client_order_id: "c1".into(),
            token_id: "tok1".into(),
            side: Side::Buy,
            price: 0.40,
            notional_usd: 20.0,
            tif: TimeInForce::Gtc,
        };
        let ack = adapter.place_order(req).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.filled_price, 0.40);
        assert_eq!(adapter.stats().placed, 1);
        assert_eq!(adapter.stats().open_count, 0);
    }

    #[tokio::test]
    async fn paper_adapter_rests_open_when_not_crossing() {
        let adapter = adapter_with_quote(0.38, 0.45);
        let req = OrderRequest {
            client_order_id: "c1".into(),
            token_id: "tok1".into(),
            side: Side::Buy,
            price: 0.40,
            notional_usd: 20.0,
            tif: TimeInForce::Gtc,
        };
        let ack = adapter.place_order(req).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Open);
        assert_eq!(adapter.stats().open_count, 1);

        adapter.cancel_order(&ack.order_id).await.unwrap();
        assert_eq!(adapter.stats().cancelled, 1);
        assert_eq!(adapter.stats().open_count, 0);
    }

    #[tokio::test]
    async fn ioc_order_fails_when_it_does_not_cross() {
        let adapter = adapter_with_quote(0.38, 0.45);
        let req = OrderRequest {
            client_order_id: "c1".into(),
            token_id: "tok1".into(),
            side: Side::Buy,
            price: 0.40,
            notional_usd: 20.0,
            tif: TimeInForce::Ioc,
        };
        assert!(adapter.place_order(req).await.is_err());
    }
}
