// Momentum indicators: RSI, MACD

use rust_ti::momentum_indicators::bulk as mi;

use super::overlap::windowed_ema;
use super::{length_param, nan_series, pad_series, IndicatorDef, ParamKind, ParamSpec};

const RSI_PARAMS: &[ParamSpec] = &[ParamSpec {
    name: "length",
    kind: ParamKind::Integer,
    default: 14.0,
    min: 2.0,
    max: 100.0,
}];

const MACD_PARAMS: &[ParamSpec] = &[
    ParamSpec {
        name: "fast",
        kind: ParamKind::Integer,
        default: 12.0,
        min: 2.0,
        max: 100.0,
    },
    ParamSpec {
        name: "slow",
        kind: ParamKind::Integer,
        default: 26.0,
        min: 3.0,
        max: 200.0,
    },
    ParamSpec {
        name: "signal",
        kind: ParamKind::Integer,
        default: 9.0,
        min: 2.0,
        max: 50.0,
    },
];

pub fn defs() -> Vec<IndicatorDef> {
    vec![
        IndicatorDef {
            name: "rsi",
            category: "momentum",
            description: "Relative strength index (smoothed) of close.",
            params: RSI_PARAMS,
            outputs: &[""],
            warmup: |p| length_param(p, "length") - 1,
            compute: |frame, p| {
                let period = length_param(p, "length");
                let n = frame.close.len();
                if n < period {
                    return vec![nan_series(n)];
                }
                let values = mi::relative_strength_index(
                    &frame.close,
                    rust_ti::ConstantModelType::SmoothedMovingAverage,
                    period,
                );
                vec![pad_series(&values, n)]
            },
        },
        IndicatorDef {
            name: "macd",
            category: "momentum",
            description: "MACD line, signal line and histogram from fast/slow EMAs of close.",
            params: MACD_PARAMS,
            outputs: &["", "_signal", "_hist"],
            warmup: |p| {
                let slow = length_param(p, "slow");
                let signal = length_param(p, "signal");
                slow + signal - 2
            },
            compute: |frame, p| {
                let fast = length_param(p, "fast");
                let slow = length_param(p, "slow");
                let signal = length_param(p, "signal");
                macd_columns(&frame.close, fast, slow, signal)
            },
        },
    ]
}

/// MACD from EMA building blocks: line = EMA(fast) − EMA(slow), signal =
/// EMA(line), histogram = line − signal. Warmup bars stay NaN throughout.
fn macd_columns(prices: &[f64], fast: usize, slow: usize, signal: usize) -> Vec<Vec<f64>> {
    let n = prices.len();
    if n < slow {
        return vec![nan_series(n), nan_series(n), nan_series(n)];
    }

    let fast_ema = windowed_ema(prices, fast);
    let slow_ema = windowed_ema(prices, slow);

    let line: Vec<f64> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(&f, &s)| f - s)
        .collect();

    // Signal is an EMA over the defined part of the line only.
    let defined_from = slow - 1;
    let defined = &line[defined_from..];
    let signal_col = if defined.len() < signal {
        nan_series(n)
    } else {
        let tail = windowed_ema(defined, signal);
        let mut padded = nan_series(defined_from);
        padded.extend_from_slice(&tail);
        padded
    };

    let hist: Vec<f64> = line
        .iter()
        .zip(signal_col.iter())
        .map(|(&l, &s)| l - s)
        .collect();

    vec![line, signal_col, hist]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Candle, CandleFrame};
    use crate::indicators::find_indicator;
    use std::collections::BTreeMap;

    fn frame(closes: &[f64]) -> CandleFrame {
        let candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                ts: i as i64,
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 1.0,
            })
            .collect();
        CandleFrame::from_candles(&candles)
    }

    fn ramp(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64).collect()
    }

    #[test]
    fn rsi_of_monotonic_rise_saturates_high() {
        let f = frame(&ramp(40));
        let def = find_indicator("rsi").unwrap();
        let resolved = def.resolve_params(&BTreeMap::new()).unwrap();
        let out = (def.compute)(&f, &resolved);
        let last = *out[0].last().unwrap();
        assert!(last > 90.0, "rsi of a pure uptrend should saturate, got {last}");
    }

    #[test]
    fn macd_outputs_three_columns_with_warmup() {
        let f = frame(&ramp(80));
        let def = find_indicator("macd").unwrap();
        let resolved = def.resolve_params(&BTreeMap::new()).unwrap();
        let out = (def.compute)(&f, &resolved);
        assert_eq!(out.len(), 3);

        let warmup = (def.warmup)(&resolved);
        assert_eq!(warmup, 26 + 9 - 2);
        for column in &out {
            assert!(column[..25].iter().all(|v| v.is_nan()));
            assert!(column[warmup..].iter().all(|v| !v.is_nan()));
        }
    }

    #[test]
    fn macd_line_positive_in_uptrend() {
        let f = frame(&ramp(80));
        let def = find_indicator("macd").unwrap();
        let resolved = def.resolve_params(&BTreeMap::new()).unwrap();
        let out = (def.compute)(&f, &resolved);
        // fast EMA leads slow EMA in a steady rise
        assert!(*out[0].last().unwrap() > 0.0);
    }

    #[test]
    fn macd_hist_is_line_minus_signal() {
        let closes: Vec<f64> = (0..100)
            .map(|i| 100.0 + (i as f64 * 0.4).sin() * 10.0)
            .collect();
        let f = frame(&closes);
        let def = find_indicator("macd").unwrap();
        let resolved = def.resolve_params(&BTreeMap::new()).unwrap();
        let out = (def.compute)(&f, &resolved);
        let i = 90;
        assert!((out[2][i] - (out[0][i] - out[1][i])).abs() < 1e-10);
    }
}
