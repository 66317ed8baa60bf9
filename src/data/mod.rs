pub mod exchange;
pub mod store;

use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Canonical column names of a candle frame. Every series served by the
/// store carries exactly these six columns, `ts` sorted ascending and unique.
pub const TS_COL: &str = "ts";
pub const OHLCV_COLS: &[&str] = &["open", "high", "low", "close", "volume"];

/// One time-binned OHLCV record. `ts` is UTC milliseconds at the bar open.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// The closed set of supported timeframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    D1,
    D3,
    W1,
}

impl Timeframe {
    pub const ALL: &'static [Timeframe] = &[
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::D3,
        Timeframe::W1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::D3 => "3d",
            Timeframe::W1 => "1w",
        }
    }

    /// Bar width in milliseconds.
    pub fn duration_ms(self) -> i64 {
        const MINUTE: i64 = 60_000;
        match self {
            Timeframe::M1 => MINUTE,
            Timeframe::M5 => 5 * MINUTE,
            Timeframe::M15 => 15 * MINUTE,
            Timeframe::M30 => 30 * MINUTE,
            Timeframe::H1 => 60 * MINUTE,
            Timeframe::H2 => 120 * MINUTE,
            Timeframe::H4 => 240 * MINUTE,
            Timeframe::D1 => 1_440 * MINUTE,
            Timeframe::D3 => 3 * 1_440 * MINUTE,
            Timeframe::W1 => 7 * 1_440 * MINUTE,
        }
    }

    /// True when `self` is strictly finer than `signal` and divides it
    /// evenly — the requirement for an intraday refinement series.
    pub fn refines(self, signal: Timeframe) -> bool {
        let fine = self.duration_ms();
        let coarse = signal.duration_ms();
        fine < coarse && coarse % fine == 0
    }

    /// Parse a user-supplied interval, tolerating case (`4H` → `4h`).
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let lowered = input.trim().to_lowercase();
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str() == lowered)
            .ok_or_else(|| CoreError::InvalidInterval {
                interval: input.to_string(),
            })
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Timeframe::parse(&value).map_err(|e| e.to_string())
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}

/// Quote assets recognized when splitting a provider-native `BASEQUOTE` pair.
/// Longest match wins (`BTCUSDT` → `BTC/USDT`, not `BTCUSD` + `T`).
const KNOWN_QUOTES: &[&str] = &[
    "USDT", "USDC", "FDUSD", "BUSD", "TUSD", "USD", "EUR", "GBP", "BTC", "ETH", "BNB",
];

/// A fully-normalized series identity: `symbol` is canonical `BASE/QUOTE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    pub fn new(exchange: &str, symbol: &str, timeframe: &str) -> Result<Self, CoreError> {
        Ok(Self {
            exchange: exchange.trim().to_lowercase(),
            symbol: normalize_symbol(symbol)?,
            timeframe: Timeframe::parse(timeframe)?,
        })
    }

    /// Provider-native form without the separator (`BTC/USDT` → `BTCUSDT`).
    pub fn native_symbol(&self) -> String {
        self.symbol.replace('/', "")
    }

    /// Filesystem-safe symbol (`BTC/USDT` → `BTC_USDT`).
    pub fn symbol_dir(&self) -> String {
        self.symbol.replace('/', "_")
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.exchange, self.symbol, self.timeframe)
    }
}

/// Normalize a symbol to canonical `BASE/QUOTE`. Accepts `BASE/QUOTE`
/// directly and provider-native `BASEQUOTE` by splitting on a known quote
/// asset suffix.
pub fn normalize_symbol(input: &str) -> Result<String, CoreError> {
    let raw = input.trim().to_uppercase();
    let invalid = || CoreError::InvalidSymbol {
        symbol: input.to_string(),
    };

    if let Some((base, quote)) = raw.split_once('/') {
        if base.is_empty() || quote.is_empty() || !is_asset(base) || !is_asset(quote) {
            return Err(invalid());
        }
        return Ok(format!("{base}/{quote}"));
    }

    if !is_asset(&raw) {
        return Err(invalid());
    }

    let mut best: Option<(&str, &str)> = None;
    for quote in KNOWN_QUOTES {
        if let Some(base) = raw.strip_suffix(quote) {
            if !base.is_empty() && best.is_none_or(|(_, q)| quote.len() > q.len()) {
                best = Some((base, quote));
            }
        }
    }
    best.map(|(base, quote)| format!("{base}/{quote}"))
        .ok_or_else(invalid)
}

fn is_asset(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Column-oriented view of a candle series used by the evaluation and
/// simulation hot paths. Built once per series from the store's `DataFrame`.
#[derive(Debug, Clone)]
pub struct CandleFrame {
    pub ts: Vec<i64>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
}

impl CandleFrame {
    pub fn from_dataframe(df: &DataFrame) -> Result<Self, CoreError> {
        let ts = df
            .column(TS_COL)?
            .i64()?
            .into_iter()
            .map(|v| v.unwrap_or(i64::MIN))
            .collect();
        let pull = |name: &str| -> Result<Vec<f64>, CoreError> {
            Ok(df
                .column(name)?
                .f64()?
                .into_iter()
                .map(|v| v.unwrap_or(f64::NAN))
                .collect())
        };
        Ok(Self {
            ts,
            open: pull("open")?,
            high: pull("high")?,
            low: pull("low")?,
            close: pull("close")?,
            volume: pull("volume")?,
        })
    }

    pub fn from_candles(candles: &[Candle]) -> Self {
        Self {
            ts: candles.iter().map(|c| c.ts).collect(),
            open: candles.iter().map(|c| c.open).collect(),
            high: candles.iter().map(|c| c.high).collect(),
            low: candles.iter().map(|c| c.low).collect(),
            close: candles.iter().map(|c| c.close).collect(),
            volume: candles.iter().map(|c| c.volume).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.ts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ts.is_empty()
    }

    /// Named OHLCV column, if `name` is one of the canonical five.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        match name {
            "open" => Some(&self.open),
            "high" => Some(&self.high),
            "low" => Some(&self.low),
            "close" => Some(&self.close),
            "volume" => Some(&self.volume),
            _ => None,
        }
    }

    /// Index range of bars whose `ts` falls inside `[start, end)`.
    /// Relies on `ts` being sorted ascending.
    pub fn range(&self, start: i64, end: i64) -> std::ops::Range<usize> {
        let lo = self.ts.partition_point(|&t| t < start);
        let hi = self.ts.partition_point(|&t| t < end);
        lo..hi
    }
}

/// Assemble candles into the canonical six-column `DataFrame`.
pub fn candles_to_dataframe(candles: &[Candle]) -> Result<DataFrame, CoreError> {
    let ts: Vec<i64> = candles.iter().map(|c| c.ts).collect();
    let open: Vec<f64> = candles.iter().map(|c| c.open).collect();
    let high: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let low: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let close: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volume: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let df = df! {
        TS_COL => ts,
        "open" => open,
        "high" => high,
        "low" => low,
        "close" => close,
        "volume" => volume,
    }?;
    Ok(df)
}
