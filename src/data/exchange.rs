//! Upstream exchange kline clients.
//!
//! The store talks to an [`ExchangeClient`] and never to HTTP directly, so
//! tests run against [`StaticClient`] with canned candles while production
//! uses [`BinanceClient`]:
//!
//! - **Paginated download** — klines come back at most 1000 per request;
//!   the client pages forward through `[start, end)` until the window is
//!   exhausted.
//! - **Rate limiting** — a minimum interval between requests plus
//!   exponential backoff on 429 and 5xx responses.
//! - **Inception** — exchanges have no data before a known launch date;
//!   a full first download starts there instead of the epoch.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use tokio::time::sleep;

use super::{Candle, Timeframe};
use crate::error::CoreError;

const PAGE_LIMIT: usize = 1000;
const TIMEOUT_SECS: u64 = 30;
const MAX_RETRIES: u32 = 5;
const MIN_REQUEST_INTERVAL_MS: u64 = 250;

/// 2017-01-01T00:00:00Z — before this there is no spot market worth caching.
pub const DEFAULT_INCEPTION_MS: i64 = 1_483_228_800_000;

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Exchange identifier used for store partitioning (`binance`, …).
    fn name(&self) -> &str;

    /// Earliest timestamp a full download should start from.
    fn inception_ms(&self) -> i64 {
        DEFAULT_INCEPTION_MS
    }

    /// Fetch klines for `[start_ms, end_ms)` in ascending order. `symbol` is
    /// the provider-native form (`BTCUSDT`). Implementations page internally;
    /// the returned vector covers the whole window the exchange has data for.
    async fn fetch_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, CoreError>;
}

// ---------------------------------------------------------------------------
// Binance spot
// ---------------------------------------------------------------------------

pub struct BinanceClient {
    client: reqwest::Client,
    base_url: String,
    last_request_time: Mutex<Instant>,
    request_count: AtomicU32,
}

impl BinanceClient {
    pub fn new() -> Result<Self, CoreError> {
        Self::with_base_url("https://api.binance.com")
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(TIMEOUT_SECS))
            .build()
            .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            last_request_time: Mutex::new(Instant::now()),
            request_count: AtomicU32::new(0),
        })
    }

    pub fn requests_made(&self) -> u32 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Rate-limited GET with retry on transient errors and 429 backoff.
    async fn throttled_get(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<reqwest::Response, CoreError> {
        for attempt in 0..=MAX_RETRIES {
            // Enforce minimum interval between requests
            let wait_for = {
                let mut last = self
                    .last_request_time
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let elapsed = last.elapsed();
                let min_interval = std::time::Duration::from_millis(MIN_REQUEST_INTERVAL_MS);
                let wait = min_interval.checked_sub(elapsed);
                *last = Instant::now();
                wait
            };
            if let Some(remaining) = wait_for {
                sleep(remaining).await;
            }

            let resp = match self.client.get(url).query(params).send().await {
                Ok(r) => r,
                Err(e) => {
                    if attempt == MAX_RETRIES {
                        return Err(CoreError::Internal(anyhow::anyhow!(e)));
                    }
                    let wait = 2u64.pow(attempt);
                    tracing::warn!(
                        "kline request error, retrying in {wait}s (attempt {}/{}): {e}",
                        attempt + 1,
                        MAX_RETRIES
                    );
                    sleep(std::time::Duration::from_secs(wait)).await;
                    continue;
                }
            };

            self.request_count.fetch_add(1, Ordering::Relaxed);

            let status = resp.status().as_u16();

            // 429/418 (rate limit / IP ban warning) and 5xx — exponential backoff
            if status == 429 || status == 418 || status >= 500 {
                if attempt == MAX_RETRIES {
                    return Ok(resp);
                }
                let wait = 2u64.pow(attempt + 1);
                tracing::warn!(
                    "exchange returned {status}, backing off {wait}s (attempt {}/{})",
                    attempt + 1,
                    MAX_RETRIES
                );
                sleep(std::time::Duration::from_secs(wait)).await;
                continue;
            }

            return Ok(resp);
        }
        Err(CoreError::Internal(anyhow::anyhow!("max retries exceeded")))
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    fn name(&self) -> &str {
        "binance"
    }

    async fn fetch_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, CoreError> {
        let url = format!("{}/api/v3/klines", self.base_url);
        let mut out: Vec<Candle> = Vec::new();
        let mut cursor = start_ms;

        while cursor < end_ms {
            let params: Vec<(String, String)> = vec![
                ("symbol".into(), symbol.to_string()),
                ("interval".into(), timeframe.as_str().to_string()),
                ("startTime".into(), cursor.to_string()),
                ("endTime".into(), (end_ms - 1).to_string()),
                ("limit".into(), PAGE_LIMIT.to_string()),
            ];

            let resp = self.throttled_get(&url, &params).await?;
            let status = resp.status();

            if status.as_u16() == 400 {
                // Binance answers 400 with code -1121 for unknown symbols
                let body = resp.text().await.unwrap_or_default();
                if body.contains("-1121") {
                    return Err(CoreError::InvalidSymbol {
                        symbol: symbol.to_string(),
                    });
                }
                return Err(CoreError::Download {
                    exchange: self.name().to_string(),
                    symbol: symbol.to_string(),
                    message: format!("bad request: {body}"),
                    last_complete_ts: out.last().map(|c| c.ts),
                });
            }
            if !status.is_success() {
                return Err(CoreError::Download {
                    exchange: self.name().to_string(),
                    symbol: symbol.to_string(),
                    message: format!("unexpected status {status}"),
                    last_complete_ts: out.last().map(|c| c.ts),
                });
            }

            let body: serde_json::Value =
                resp.json()
                    .await
                    .map_err(|e| CoreError::Download {
                        exchange: self.name().to_string(),
                        symbol: symbol.to_string(),
                        message: format!("invalid kline payload: {e}"),
                        last_complete_ts: out.last().map(|c| c.ts),
                    })?;

            let page = parse_klines(&body)?;
            if page.is_empty() {
                break;
            }

            let page_len = page.len();
            let last_ts = page.last().map_or(cursor, |c| c.ts);
            out.extend(page);

            tracing::debug!(
                symbol,
                timeframe = %timeframe,
                rows = page_len,
                "fetched kline page"
            );

            if page_len < PAGE_LIMIT {
                break;
            }
            cursor = last_ts + timeframe.duration_ms();
        }

        Ok(out)
    }
}

/// Parse the raw kline array-of-arrays payload:
/// `[[openTime, "open", "high", "low", "close", "volume", closeTime, …], …]`.
fn parse_klines(body: &serde_json::Value) -> Result<Vec<Candle>, CoreError> {
    let rows = body
        .as_array()
        .ok_or_else(|| CoreError::Internal(anyhow::anyhow!("kline payload is not an array")))?;

    let field = |row: &[serde_json::Value], idx: usize| -> Option<f64> {
        match row.get(idx)? {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_f64(),
            _ => None,
        }
    };

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(cells) = row.as_array() else {
            continue;
        };
        let Some(ts) = cells.first().and_then(serde_json::Value::as_i64) else {
            continue;
        };
        let (Some(open), Some(high), Some(low), Some(close), Some(volume)) = (
            field(cells, 1),
            field(cells, 2),
            field(cells, 3),
            field(cells, 4),
            field(cells, 5),
        ) else {
            continue;
        };
        out.push(Candle {
            ts,
            open,
            high,
            low,
            close,
            volume,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Canned client for tests and offline runs
// ---------------------------------------------------------------------------

/// Serves fixed candle series from memory and counts fetches, so tests can
/// assert the store's incremental behavior without a network. A series can
/// be pinned to a timeframe; anything else falls back to the default list.
pub struct StaticClient {
    exchange: String,
    fallback: Vec<Candle>,
    per_timeframe: std::collections::HashMap<Timeframe, Vec<Candle>>,
    fetch_calls: AtomicU32,
}

impl StaticClient {
    pub fn new(exchange: &str, mut candles: Vec<Candle>) -> Self {
        candles.sort_by_key(|c| c.ts);
        Self {
            exchange: exchange.to_string(),
            fallback: candles,
            per_timeframe: std::collections::HashMap::new(),
            fetch_calls: AtomicU32::new(0),
        }
    }

    pub fn with_timeframe(mut self, timeframe: Timeframe, mut candles: Vec<Candle>) -> Self {
        candles.sort_by_key(|c| c.ts);
        self.per_timeframe.insert(timeframe, candles);
        self
    }

    /// Number of `fetch_klines` calls made so far.
    pub fn fetch_calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::Relaxed)
    }

    fn series(&self, timeframe: Timeframe) -> &[Candle] {
        self.per_timeframe
            .get(&timeframe)
            .map_or(&self.fallback, Vec::as_slice)
    }
}

#[async_trait]
impl ExchangeClient for StaticClient {
    fn name(&self) -> &str {
        &self.exchange
    }

    fn inception_ms(&self) -> i64 {
        self.per_timeframe
            .values()
            .chain(std::iter::once(&self.fallback))
            .filter_map(|series| series.first().map(|c| c.ts))
            .min()
            .unwrap_or(DEFAULT_INCEPTION_MS)
    }

    async fn fetch_klines(
        &self,
        _symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, CoreError> {
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .series(timeframe)
            .iter()
            .filter(|c| c.ts >= start_ms && c.ts < end_ms)
            .copied()
            .collect())
    }
}
