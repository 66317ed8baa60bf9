//! Market-regime bucketing of trade performance.
//!
//! Each trade is labeled by the regime at its entry bar: `bull` when close
//! is above the long SMA, `bear` otherwise, and additionally `strong_trend`
//! when ADX exceeds its threshold. The thresholds are configuration, not
//! axioms.

use crate::data::CandleFrame;
use crate::indicators::overlap::windowed_sma;
use crate::indicators::trend::adx_series;

use super::types::{RegimeBucket, Trade};

#[derive(Debug, Clone)]
pub struct RegimeConfig {
    pub sma_period: usize,
    pub adx_period: usize,
    pub adx_trend_threshold: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            sma_period: 200,
            adx_period: 14,
            adx_trend_threshold: 25.0,
        }
    }
}

/// Bucket trades by the regime at their entry timestamp. Trades entering
/// before the regime indicators are defined are skipped. A trade counts in
/// `bull` or `bear`, and also in `strong_trend` when ADX qualifies.
pub fn bucket_trades(
    frame: &CandleFrame,
    trades: &[Trade],
    config: &RegimeConfig,
) -> Vec<RegimeBucket> {
    if trades.is_empty() || frame.is_empty() {
        return Vec::new();
    }

    let sma = windowed_sma(&frame.close, config.sma_period);
    let adx = adx_series(&frame.high, &frame.low, &frame.close, config.adx_period);

    let mut tallies: Vec<(&str, usize, usize, f64)> = vec![
        ("bull", 0, 0, 0.0),
        ("bear", 0, 0, 0.0),
        ("strong_trend", 0, 0, 0.0),
    ];
    let add = |idx: usize, trade: &Trade, tallies: &mut Vec<(&str, usize, usize, f64)>| {
        tallies[idx].1 += 1;
        if trade.pnl > 0.0 {
            tallies[idx].2 += 1;
        }
        tallies[idx].3 += trade.pnl;
    };

    for trade in trades {
        let bar = frame.ts.partition_point(|&t| t < trade.entry_ts);
        let Some(&sma_value) = sma.get(bar) else {
            continue;
        };
        if sma_value.is_nan() {
            continue;
        }
        let close = frame.close[bar];
        let bucket = usize::from(close <= sma_value); // 0 = bull, 1 = bear
        add(bucket, trade, &mut tallies);

        if adx.get(bar).copied().is_some_and(|a| {
            !a.is_nan() && a > config.adx_trend_threshold
        }) {
            add(2, trade, &mut tallies);
        }
    }

    tallies
        .into_iter()
        .filter(|(_, count, _, _)| *count > 0)
        .map(|(name, count, wins, pnl)| RegimeBucket {
            regime: name.to_string(),
            num_trades: count,
            win_rate: wins as f64 / count as f64,
            total_pnl: pnl,
        })
        .collect()
}
