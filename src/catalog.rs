//! Read-only HTTP client for the market/wallet/position/activity catalog.
//!
//! Endpoints are paginated with offset/limit and client-side rate limited
//! to one request budget per rolling minute window.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::models::{ClosedPosition, Position};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 200;
const DEFAULT_PAGE_SIZE: usize = 500;
const SAFETY_BOUND: usize = 50_000;

/// Client-side limiter: N requests per rolling 60s window, sleeping until
/// the window rolls over once the budget is exhausted.
struct RateLimiter {
    requests_per_minute: u32,
    used: u32,
    window_start: std::time::Instant,
}

impl RateLimiter {
    fn new(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            used: 0,
            window_start: std::time::Instant::now(),
        }
    }

    async fn acquire(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(60) {
            self.used = 0;
            self.window_start = std::time::Instant::now();
        }
        if self.used >= self.requests_per_minute {
            let wait = Duration::from_secs(60).saturating_sub(elapsed);
            if wait > Duration::ZERO {
                debug!(wait_ms = wait.as_millis(), "catalog rate limit window, sleeping");
                sleep(wait).await;
            }
            self.used = 0;
            self.window_start = std::time::Instant::now();
        }
        self.used += 1;
    }
}

pub struct CatalogClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    limiter: tokio::sync::Mutex<RateLimiter>,
}

impl CatalogClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build catalog http client");

        Self {
            client,
            base_url,
            api_key,
            limiter: tokio::sync::Mutex::new(RateLimiter::new(100)),
        }
    }

    async fn get_json(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        self.limiter.lock().await.acquire().await;

        let url = format!("{}{}", self.base_url, path);
        let mut backoff = INITIAL_BACKOFF_MS;

        for attempt in 0..MAX_RETRIES {
            let mut request = self.client.get(&url).query(params);
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("Bearer {key}"));
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<Value>()
                        .await
                        .context("failed to parse catalog response");
                }
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    warn!(attempt, "catalog API rate limited, backing off");
                    sleep(Duration::from_millis(backoff * 5)).await;
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    bail!("catalog API error {status}: {body}");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "catalog request failed");
                }
            }

            if attempt + 1 < MAX_RETRIES {
                sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(10_000);
            }
        }

        bail!("max retries exceeded fetching {url}")
    }

    /// Generic paginate-until-empty loop shared by positions, closed
    /// positions, and activity endpoints: pages until a short page signals
    /// exhaustion, or the safety bound is reached.
    async fn paginate<T: DeserializeOwned>(
        &self,
        path: &str,
        mut params: Vec<(&str, String)>,
        page_size: usize,
    ) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let mut offset = 0usize;

        loop {
            let mut page_params = params.clone();
            page_params.push(("limit", page_size.to_string()));
            page_params.push(("offset", offset.to_string()));

            let raw = self.get_json(path, &page_params).await?;
            let page: Vec<T> = match raw {
                Value::Array(_) => serde_json::from_value(raw)?,
                Value::Object(ref obj) if obj.contains_key("data") => {
                    serde_json::from_value(obj["data"].clone())?
                }
                other => serde_json::from_value(Value::Array(vec![other]))?,
            };

            let page_len = page.len();
            out.extend(page);

            if page_len < page_size || out.len() >= SAFETY_BOUND {
                break;
            }
            offset += page_size;
            params = params.clone();
        }

        out.truncate(SAFETY_BOUND);
        Ok(out)
    }

    pub async fn open_positions(&self, address: &str) -> Result<Vec<Position>> {
        self.paginate(
            "/positions",
            vec![("user", address.to_string())],
            DEFAULT_PAGE_SIZE,
        )
        .await
    }

    pub async fn closed_positions(&self, address: &str) -> Result<Vec<ClosedPosition>> {
        self.paginate(
            "/closed-positions",
            vec![("user", address.to_string())],
            DEFAULT_PAGE_SIZE,
        )
        .await
    }

    pub async fn activity(&self, address: &str) -> Result<Vec<Value>> {
        self.paginate(
            "/activity",
            vec![("user", address.to_string())],
            DEFAULT_PAGE_SIZE,
        )
        .await
    }

    /// Returns `(portfolio_value, cash_balance)`. Missing fields default to 0.0.
    pub async fn portfolio_value(&self, address: &str) -> Result<(f64, f64)> {
        let raw = self
            .get_json("/value", &[("user", address.to_string())])
            .await?;
        let value = raw
            .get(0)
            .and_then(|v| v.get("value"))
            .or_else(|| raw.get("value"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let cash = raw
            .get(0)
            .and_then(|v| v.get("cash"))
            .or_else(|| raw.get("cash"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        Ok((value, cash))
    }

    /// Profile lookup. Missing profile data (404 / empty body) is treated as
    /// absent, not an error.
    pub async fn profile(&self, address: &str) -> Result<Option<Value>> {
        match self
            .get_json("/profile", &[("address", address.to_string())])
            .await
        {
            Ok(v) if v.is_null() => Ok(None),
            Ok(v) => Ok(Some(v)),
            Err(_) => Ok(None),
        }
    }

    pub async fn market_metadata(&self, condition_id: &str) -> Result<Option<Value>> {
        match self
            .get_json("/markets", &[("condition_id", condition_id.to_string())])
            .await
        {
            Ok(Value::Array(mut arr)) if !arr.is_empty() => Ok(Some(arr.remove(0))),
            Ok(v) if !v.is_null() => Ok(Some(v)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_allows_burst_under_budget() {
        let mut limiter = RateLimiter::new(5);
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert_eq!(limiter.used, 5);
    }
}
