// Volatility indicators: Bollinger bands, ATR

use super::{length_param, nan_series, pad_series, IndicatorDef, ParamKind, ParamSpec};

const BBANDS_PARAMS: &[ParamSpec] = &[
    ParamSpec {
        name: "length",
        kind: ParamKind::Integer,
        default: 20.0,
        min: 2.0,
        max: 200.0,
    },
    ParamSpec {
        name: "std",
        kind: ParamKind::Fraction,
        default: 2.0,
        min: 0.5,
        max: 4.0,
    },
];

const ATR_PARAMS: &[ParamSpec] = &[ParamSpec {
    name: "length",
    kind: ParamKind::Integer,
    default: 14.0,
    min: 2.0,
    max: 100.0,
}];

pub fn defs() -> Vec<IndicatorDef> {
    vec![
        IndicatorDef {
            name: "bbands",
            category: "volatility",
            description: "Bollinger bands: SMA center with std-dev envelope.",
            params: BBANDS_PARAMS,
            outputs: &["_upper", "_middle", "_lower"],
            warmup: |p| length_param(p, "length") - 1,
            compute: |frame, p| {
                let period = length_param(p, "length");
                let mult = p.get("std").copied().unwrap_or(2.0);
                let n = frame.close.len();
                if n < period {
                    return vec![nan_series(n), nan_series(n), nan_series(n)];
                }
                let bands = rust_ti::candle_indicators::bulk::moving_constant_bands(
                    &frame.close,
                    rust_ti::ConstantModelType::SimpleMovingAverage,
                    rust_ti::DeviationModel::StandardDeviation,
                    mult,
                    period,
                );
                let lower: Vec<f64> = bands.iter().map(|t| t.0).collect();
                let middle: Vec<f64> = bands.iter().map(|t| t.1).collect();
                let upper: Vec<f64> = bands.iter().map(|t| t.2).collect();
                vec![
                    pad_series(&upper, n),
                    pad_series(&middle, n),
                    pad_series(&lower, n),
                ]
            },
        },
        IndicatorDef {
            name: "atr",
            category: "volatility",
            description: "Average true range over high/low/close.",
            params: ATR_PARAMS,
            outputs: &[""],
            warmup: |p| length_param(p, "length") - 1,
            compute: |frame, p| {
                let period = length_param(p, "length");
                vec![atr_series(&frame.close, &frame.high, &frame.low, period)]
            },
        },
    ]
}

pub(crate) fn atr_series(close: &[f64], high: &[f64], low: &[f64], period: usize) -> Vec<f64> {
    let n = close.len();
    if n < period {
        return nan_series(n);
    }
    let values: Vec<f64> = (0..=n - period)
        .map(|i| {
            let end = i + period;
            rust_ti::other_indicators::single::average_true_range(
                &close[i..end],
                &high[i..end],
                &low[i..end],
                rust_ti::ConstantModelType::SimpleMovingAverage,
            )
        })
        .collect();
    pad_series(&values, n)
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
                high: c + 2.0,
                low: c - 2.0,
                close: c,
                volume: 1.0,
            })
            .collect();
        CandleFrame::from_candles(&candles)
    }

    #[test]
    fn bbands_bracket_the_center() {
        let closes: Vec<f64> = (0..40)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0)
            .collect();
        let f = frame(&closes);
        let def = find_indicator("bbands").unwrap();
        let resolved = def.resolve_params(&BTreeMap::new()).unwrap();
        let out = (def.compute)(&f, &resolved);
        let (upper, middle, lower) = (&out[0], &out[1], &out[2]);
        for i in 25..40 {
            assert!(upper[i] >= middle[i] && middle[i] >= lower[i]);
        }
    }

    #[test]
    fn bbands_std_widens_envelope() {
        let closes: Vec<f64> = (0..40)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0)
            .collect();
        let f = frame(&closes);
        let def = find_indicator("bbands").unwrap();

        let mut narrow = BTreeMap::new();
        narrow.insert("std".to_string(), 1.0);
        let mut wide = BTreeMap::new();
        wide.insert("std".to_string(), 3.0);

        let narrow_out = (def.compute)(&f, &def.resolve_params(&narrow).unwrap());
        let wide_out = (def.compute)(&f, &def.resolve_params(&wide).unwrap());
        let i = 30;
        let narrow_width = narrow_out[0][i] - narrow_out[2][i];
        let wide_width = wide_out[0][i] - wide_out[2][i];
        assert!(wide_width > narrow_width);
    }

    #[test]
    fn atr_reflects_constant_range() {
        // Flat closes with a constant 4-point high/low range
        let f = frame(&[100.0; 30]);
        let atr = atr_series(&f.close, &f.high, &f.low, 14);
        assert!(atr[..13].iter().all(|v| v.is_nan()));
        let last = *atr.last().unwrap();
        assert!((last - 4.0).abs() < 1e-9, "constant range ATR, got {last}");
    }
}
