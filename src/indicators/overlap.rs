// Overlap indicators: SMA, EMA, volume SMA

use rust_ti::standard_indicators::bulk as sti;

use super::{length_param, nan_series, pad_series, IndicatorDef, ParamKind, ParamSpec};
use crate::data::CandleFrame;

const LENGTH: &[ParamSpec] = &[ParamSpec {
    name: "length",
    kind: ParamKind::Integer,
    default: 20.0,
    min: 2.0,
    max: 200.0,
}];

pub fn defs() -> Vec<IndicatorDef> {
    vec![
        IndicatorDef {
            name: "sma",
            category: "overlap",
            description: "Simple moving average of close.",
            params: LENGTH,
            outputs: &[""],
            warmup: |p| length_param(p, "length") - 1,
            compute: |frame, p| {
                let period = length_param(p, "length");
                vec![windowed_sma(&frame.close, period)]
            },
        },
        IndicatorDef {
            name: "ema",
            category: "overlap",
            description: "Exponential moving average of close.",
            params: LENGTH,
            outputs: &[""],
            warmup: |p| length_param(p, "length") - 1,
            compute: |frame, p| {
                let period = length_param(p, "length");
                vec![windowed_ema(&frame.close, period)]
            },
        },
        IndicatorDef {
            name: "volume_sma",
            category: "overlap",
            description: "Simple moving average of volume.",
            params: LENGTH,
            outputs: &[""],
            warmup: |p| length_param(p, "length") - 1,
            compute: |frame, p| {
                let period = length_param(p, "length");
                vec![windowed_sma(&frame.volume, period)]
            },
        },
    ]
}

pub(crate) fn windowed_sma(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    if n < period {
        return nan_series(n);
    }
    pad_series(&sti::simple_moving_average(values, period), n)
}

pub(crate) fn windowed_ema(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    if n < period {
        return nan_series(n);
    }
    pad_series(&sti::exponential_moving_average(values, period), n)
}
