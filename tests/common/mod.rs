//! Shared builders for the end-to-end tests: deterministic synthetic candle
//! series, a canned exchange client behind a temp-dir store, and request
//! scaffolding.

#![allow(dead_code)]

use std::sync::Arc;

use cryptolab::data::exchange::StaticClient;
use cryptolab::data::store::OhlcvStore;
use cryptolab::data::Candle;
use cryptolab::engine::types::BacktestRequest;
use cryptolab::strategy::Template;

pub const DAY: i64 = 86_400_000;
pub const HOUR: i64 = 3_600_000;

/// Route engine logs through `RUST_LOG` for tests that want them.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Daily candles following a deterministic oscillating drift, starting at
/// the epoch. Close sits mid-range so entries and exits have room on both
/// sides.
pub fn wavy_daily_candles(n: usize) -> Vec<Candle> {
    (0..n)
        .map(|i| {
            let close = 100.0 + (i as f64 * 0.22).sin() * 12.0 + i as f64 * 0.08;
            Candle {
                ts: i as i64 * DAY,
                open: close - 0.4,
                high: close + 2.0,
                low: close - 2.0,
                close,
                volume: 500.0 + (i as f64 * 0.9).cos().abs() * 100.0,
            }
        })
        .collect()
}

/// Flat daily candles pinned at `price`.
pub fn flat_daily_candles(n: usize, price: f64) -> Vec<Candle> {
    (0..n)
        .map(|i| Candle {
            ts: i as i64 * DAY,
            open: price,
            high: price + 0.5,
            low: price - 0.5,
            close: price,
            volume: 100.0,
        })
        .collect()
}

/// Hourly sub-candles for one day, flat except for chosen hours.
/// `spikes` maps hour → (low, high).
pub fn hourly_candles_for_day(
    day_ts: i64,
    base: f64,
    spikes: &[(i64, f64, f64)],
) -> Vec<Candle> {
    (0..24)
        .map(|h| {
            let spike = spikes.iter().find(|(hour, _, _)| *hour == h);
            let (low, high) = spike.map_or((base - 0.2, base + 0.2), |&(_, lo, hi)| (lo, hi));
            Candle {
                ts: day_ts + h * HOUR,
                open: base,
                high,
                low,
                close: base,
                volume: 10.0,
            }
        })
        .collect()
}

/// A store over a temp dir serving `candles` through a canned client.
/// The temp dir handle must outlive the store.
pub fn store_with_candles(
    exchange: &str,
    candles: Vec<Candle>,
) -> (OhlcvStore, Arc<StaticClient>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = Arc::new(StaticClient::new(exchange, candles));
    let store = OhlcvStore::with_client(dir.path().to_path_buf(), client.clone());
    (store, client, dir)
}

/// Like [`store_with_candles`] but with a distinct hourly series for
/// precise-mode tests.
pub fn store_with_daily_and_hourly(
    exchange: &str,
    daily: Vec<Candle>,
    hourly: Vec<Candle>,
) -> (OhlcvStore, Arc<StaticClient>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = Arc::new(
        StaticClient::new(exchange, daily).with_timeframe(cryptolab::data::Timeframe::H1, hourly),
    );
    let store = OhlcvStore::with_client(dir.path().to_path_buf(), client.clone());
    (store, client, dir)
}

pub fn sma_cross_template(fast: usize, slow: usize) -> Template {
    serde_json::from_value(serde_json::json!({
        "name": "sma_cross",
        "indicators": [
            {"source": "builtin", "name": "sma", "alias": "fast", "params": {"length": fast}},
            {"source": "builtin", "name": "sma", "alias": "slow", "params": {"length": slow}}
        ],
        "entry_logic": "crossover(fast, slow)",
        "exit_logic": "crossunder(fast, slow)",
        "stop_loss": null,
        "take_profit": null
    }))
    .expect("valid template json")
}

/// Enters on the very first tradable bar and never signals out — stop/take
/// and end-of-data do all the exiting.
pub fn always_in_template() -> Template {
    serde_json::from_value(serde_json::json!({
        "name": "always_in",
        "indicators": [],
        "entry_logic": "close > 0",
        "exit_logic": "close < 0",
        "stop_loss": null,
        "take_profit": null
    }))
    .expect("valid template json")
}

pub fn base_request(templates: Vec<Template>, since_day: i64, until_day: i64) -> BacktestRequest {
    let since = chrono::DateTime::from_timestamp_millis(since_day * DAY)
        .expect("valid ts")
        .to_rfc3339();
    let until = chrono::DateTime::from_timestamp_millis(until_day * DAY)
        .expect("valid ts")
        .to_rfc3339();
    serde_json::from_value(serde_json::json!({
        "mode": "run",
        "exchange": "test",
        "symbol": "BTC/USDT",
        "timeframe": "1d",
        "since": since,
        "until": until,
        "templates": serde_json::to_value(&templates).expect("templates serialize"),
        "cash": 1000.0,
        "fee": 0.0,
        "slippage": 0.0,
        "stop_pct": null,
        "take_pct": null
    }))
    .expect("valid request json")
}
