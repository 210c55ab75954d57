//! WebSocket client for the venue's live trade feed: connect, subscribe,
//! heartbeat, detect staleness, and hand parsed trades to a processor task.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::models::{Side, Trade};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(10);
const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const STALE_THRESHOLD: Duration = Duration::from_secs(120);
const BACKOFF_BASE_SECS: u64 = 5;
const BACKOFF_CAP_SECS: u64 = 60;

async fn wait_for_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// `delay = min(base * 2^min(n-1,4), cap)`.
pub fn reconnect_backoff(consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        return Duration::from_secs(0);
    }
    let exponent = (consecutive_failures - 1).min(4);
    let delay = BACKOFF_BASE_SECS.saturating_mul(1u64 << exponent);
    Duration::from_secs(delay.min(BACKOFF_CAP_SECS))
}

#[derive(Debug, Serialize)]
struct SubscribeFrame<'a> {
    #[serde(rename = "type")]
    msg_type: &'a str,
    channel: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    filters: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawTrade {
    #[serde(rename = "transactionHash", alias = "tx_hash", default)]
    tx_hash: Option<String>,
    #[serde(alias = "id", default)]
    trade_id: Option<String>,
    #[serde(alias = "proxyWallet", alias = "user", alias = "address", default)]
    trader_address: Option<String>,
    #[serde(alias = "conditionId", default)]
    condition_id: Option<String>,
    #[serde(alias = "asset", default)]
    asset_id: Option<String>,
    #[serde(alias = "slug", default)]
    market_slug: Option<String>,
    #[serde(default)]
    event_slug: Option<String>,
    #[serde(default)]
    side: Option<String>,
    #[serde(default)]
    outcome: Option<String>,
    #[serde(alias = "outcomeIndex", default)]
    outcome_index: Option<u32>,
    #[serde(default)]
    size: Option<f64>,
    #[serde(default)]
    price: Option<f64>,
    #[serde(alias = "usdcSize", default)]
    usd_value: Option<f64>,
    #[serde(alias = "timestamp", default)]
    ts: Option<Value>,
}

/// Parses an epoch value that may be seconds, milliseconds, or an ISO-8601
/// string, returning the equivalent UTC instant.
fn parse_timestamp(value: Option<&Value>) -> DateTime<Utc> {
    match value {
        Some(Value::Number(n)) => {
            let raw = n.as_f64().unwrap_or(0.0);
            if raw > 1e12 {
                Utc.timestamp_millis_opt(raw as i64).single()
            } else {
                Utc.timestamp_opt(raw as i64, 0).single()
            }
            .unwrap_or_else(Utc::now)
        }
        Some(Value::String(s)) => s
            .parse::<f64>()
            .ok()
            .map(|raw| {
                if raw > 1e12 {
                    Utc.timestamp_millis_opt(raw as i64).single()
                } else {
                    Utc.timestamp_opt(raw as i64, 0).single()
                }
                .unwrap_or_else(Utc::now)
            })
            .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc)))
            .unwrap_or_else(Utc::now),
        _ => Utc::now(),
    }
}

fn raw_to_trade(raw: RawTrade) -> Option<Trade> {
    let trader_address = raw.trader_address?;
    let side = raw
        .side
        .as_deref()
        .and_then(Side::parse)
        .unwrap_or(Side::Buy);
    let size = raw.size.unwrap_or(0.0);
    let price = raw.price.unwrap_or(0.0);
    let usd_value = raw.usd_value.unwrap_or(size * price);

    Some(Trade {
        trade_id: raw
            .trade_id
            .or_else(|| raw.tx_hash.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        trader_address,
        condition_id: raw.condition_id.unwrap_or_default(),
        asset_id: raw.asset_id,
        market_slug: raw.market_slug,
        event_slug: raw.event_slug,
        side,
        outcome: raw.outcome,
        outcome_index: raw.outcome_index.unwrap_or(0),
        size,
        price,
        usd_value,
        executed_at: parse_timestamp(raw.ts.as_ref()),
        tx_hash: raw.tx_hash,
    })
}

/// Flattens a singleton-or-array message body into individual trades,
/// dropping entries with no trader address and counting parse errors.
fn parse_message(text: &str, parse_errors: &std::sync::atomic::AtomicU64) -> Vec<Trade> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to decode live feed message");
            parse_errors.fetch_add(1, Ordering::Relaxed);
            return Vec::new();
        }
    };

    let items: Vec<Value> = match value {
        Value::Array(arr) => arr,
        other => vec![other],
    };

    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<RawTrade>(item) {
            Ok(raw) => raw_to_trade(raw),
            Err(e) => {
                debug!(error = %e, "unrecognized live feed message shape, dropping");
                parse_errors.fetch_add(1, Ordering::Relaxed);
                None
            }
        })
        .collect()
}

pub struct LiveFeedClient {
    ws_url: String,
    running: Arc<AtomicBool>,
    last_message_epoch_ms: Arc<AtomicI64>,
    parse_errors: Arc<std::sync::atomic::AtomicU64>,
    trade_tx: mpsc::Sender<Trade>,
}

impl LiveFeedClient {
    pub fn new(ws_url: String) -> (Self, mpsc::Receiver<Trade>) {
        let (trade_tx, trade_rx) = mpsc::channel(1024);
        let client = Self {
            ws_url,
            running: Arc::new(AtomicBool::new(true)),
            last_message_epoch_ms: Arc::new(AtomicI64::new(Utc::now().timestamp_millis())),
            parse_errors: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            trade_tx,
        };
        (client, trade_rx)
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn parse_error_count(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    /// Runs forever, reconnecting with exponential backoff until `stop()`
    /// is observed.
    pub async fn run(&self) {
        let mut consecutive_failures: u32 = 0;

        while self.running.load(Ordering::Relaxed) {
            match self.connect_and_stream().await {
                Ok(()) => {
                    info!("live feed connection closed cleanly");
                    consecutive_failures = 0;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    let delay = reconnect_backoff(consecutive_failures);
                    error!(error = %e, attempt = consecutive_failures, delay_secs = delay.as_secs(), "live feed connection failed, backing off");
                    sleep(delay).await;
                }
            }
        }
        info!("live feed client stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    async fn connect_and_stream(&self) -> Result<()> {
        info!(url = %self.ws_url, "connecting to live feed");
        let (ws_stream, _) = timeout(
            Duration::from_secs(15),
            tokio_tungstenite::connect_async(&self.ws_url),
        )
        .await
        .context("live feed connect timed out")?
        .context("live feed connect failed")?;

        info!("live feed connected");
        self.last_message_epoch_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        let (mut write, mut read) = ws_stream.split();

        let subscribe = SubscribeFrame {
            msg_type: "subscribe",
            channel: "trades",
            filters: Vec::new(),
        };
        let sub_json = serde_json::to_string(&subscribe)?;
        write
            .send(Message::Text(sub_json))
            .await
            .context("failed to send subscription")?;

        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        let mut stale_check = interval(STALE_CHECK_INTERVAL);
        heartbeat.tick().await;
        stale_check.tick().await;

        // Set while a ping is outstanding; cleared on the matching pong. If
        // it elapses first the peer accepted the ping frame but never
        // replied, so we bail and let the caller reconnect.
        let mut pong_deadline: Option<tokio::time::Instant> = None;

        loop {
            if !self.running.load(Ordering::Relaxed) {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }

            tokio::select! {
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            self.last_message_epoch_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                            for trade in parse_message(&text, &self.parse_errors) {
                                if self.trade_tx.send(trade).await.is_err() {
                                    warn!("trade processor channel closed, stopping live feed");
                                    return Ok(());
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            self.last_message_epoch_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                            timeout(PING_TIMEOUT, write.send(Message::Pong(payload))).await.ok();
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.last_message_epoch_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                            pong_deadline = None;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            warn!(?frame, "live feed closed by server");
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(e).context("live feed read error");
                        }
                        None => {
                            return Ok(());
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if timeout(PING_TIMEOUT, write.send(Message::Ping(Vec::new()))).await.is_err() {
                        anyhow::bail!("ping send timed out");
                    }
                    pong_deadline = Some(tokio::time::Instant::now() + PING_TIMEOUT);
                }
                _ = wait_for_deadline(pong_deadline), if pong_deadline.is_some() => {
                    anyhow::bail!("no pong received within ping timeout");
                }
                _ = stale_check.tick() => {
                    let last = self.last_message_epoch_ms.load(Ordering::Relaxed);
                    let age = Utc::now().timestamp_millis() - last;
                    if age > STALE_THRESHOLD.as_millis() as i64 {
                        warn!(age_ms = age, "live feed stale, closing for reconnect");
                        let frame = CloseFrame {
                            code: CloseCode::Abnormal,
                            reason: "stale".into(),
                        };
                        let _ = write.send(Message::Close(Some(frame))).await;
                        anyhow::bail!("stale connection closed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        assert_eq!(reconnect_backoff(1), Duration::from_secs(5));
        assert_eq!(reconnect_backoff(2), Duration::from_secs(10));
        assert_eq!(reconnect_backoff(3), Duration::from_secs(20));
        assert_eq!(reconnect_backoff(4), Duration::from_secs(40));
        assert_eq!(reconnect_backoff(5), Duration::from_secs(60));
        assert_eq!(reconnect_backoff(10), Duration::from_secs(60));
    }

    #[test]
    fn timestamp_heuristic_distinguishes_seconds_and_millis() {
        let seconds = parse_timestamp(Some(&Value::from(1_700_000_000_i64)));
        let millis = parse_timestamp(Some(&Value::from(1_700_000_000_000_i64)));
        assert_eq!(seconds.timestamp(), millis.timestamp());
    }

    #[test]
    fn missing_trader_address_is_dropped() {
        let text = r#"[{"conditionId":"c1","side":"BUY","size":10,"price":0.5}]"#;
        let counter = std::sync::atomic::AtomicU64::new(0);
        let trades = parse_message(text, &counter);
        assert!(trades.is_empty());
    }

    #[test]
    fn singleton_and_array_both_parse() {
        let array = r#"[{"user":"0xabc","conditionId":"c1","side":"BUY","size":10,"price":0.5,"id":"t1"}]"#;
        let singleton = r#"{"user":"0xabc","conditionId":"c1","side":"SELL","size":5,"price":0.6,"id":"t2"}"#;
        let counter = std::sync::atomic::AtomicU64::new(0);
        assert_eq!(parse_message(array, &counter).len(), 1);
        assert_eq!(parse_message(singleton, &counter).len(), 1);
    }
}
