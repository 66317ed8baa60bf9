// Trend indicators: ADX (Wilder's directional movement index)

use super::{length_param, nan_series, IndicatorDef, ParamKind, ParamSpec};

const ADX_PARAMS: &[ParamSpec] = &[ParamSpec {
    name: "length",
    kind: ParamKind::Integer,
    default: 14.0,
    min: 2.0,
    max: 100.0,
}];

pub fn defs() -> Vec<IndicatorDef> {
    vec![IndicatorDef {
        name: "adx",
        category: "trend",
        description: "Average directional index: trend strength 0–100.",
        params: ADX_PARAMS,
        outputs: &[""],
        warmup: |p| 2 * length_param(p, "length") - 1,
        compute: |frame, p| {
            let period = length_param(p, "length");
            vec![adx_series(&frame.high, &frame.low, &frame.close, period)]
        },
    }]
}

/// Classic Wilder ADX: smoothed ±DM over smoothed TR gives ±DI, the DX of
/// which is smoothed once more. The first defined value lands at bar
/// `2·period − 1`.
pub(crate) fn adx_series(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let n = close.len();
    if n < 2 * period {
        return nan_series(n);
    }

    let mut tr = vec![0.0_f64; n];
    let mut plus_dm = vec![0.0_f64; n];
    let mut minus_dm = vec![0.0_f64; n];
    for i in 1..n {
        let up = high[i] - high[i - 1];
        let down = low[i - 1] - low[i];
        plus_dm[i] = if up > down && up > 0.0 { up } else { 0.0 };
        minus_dm[i] = if down > up && down > 0.0 { down } else { 0.0 };
        tr[i] = (high[i] - low[i])
            .max((high[i] - close[i - 1]).abs())
            .max((low[i] - close[i - 1]).abs());
    }

    // Wilder smoothing: seed with the sum of the first `period` deltas,
    // then smoothed = prev − prev/period + current.
    let mut sm_tr = tr[1..=period].iter().sum::<f64>();
    let mut sm_plus = plus_dm[1..=period].iter().sum::<f64>();
    let mut sm_minus = minus_dm[1..=period].iter().sum::<f64>();

    let dx_at = |sm_tr: f64, sm_plus: f64, sm_minus: f64| -> f64 {
        if sm_tr <= 0.0 {
            return 0.0;
        }
        let plus_di = 100.0 * sm_plus / sm_tr;
        let minus_di = 100.0 * sm_minus / sm_tr;
        let di_sum = plus_di + minus_di;
        if di_sum <= 0.0 {
            0.0
        } else {
            100.0 * (plus_di - minus_di).abs() / di_sum
        }
    };

    let mut dx = vec![f64::NAN; n];
    dx[period] = dx_at(sm_tr, sm_plus, sm_minus);
    for i in period + 1..n {
        sm_tr = sm_tr - sm_tr / period as f64 + tr[i];
        sm_plus = sm_plus - sm_plus / period as f64 + plus_dm[i];
        sm_minus = sm_minus - sm_minus / period as f64 + minus_dm[i];
        dx[i] = dx_at(sm_tr, sm_plus, sm_minus);
    }

    let mut adx = nan_series(n);
    let first = 2 * period - 1;
    let seed: f64 = dx[period..=first].iter().sum::<f64>() / period as f64;
    adx[first] = seed;
    for i in first + 1..n {
        adx[i] = (adx[i - 1] * (period as f64 - 1.0) + dx[i]) / period as f64;
    }
    adx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trending(n: usize, slope: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let close: Vec<f64> = (0..n).map(|i| 100.0 + i as f64 * slope).collect();
        let high: Vec<f64> = close.iter().map(|c| c + 1.0).collect();
        let low: Vec<f64> = close.iter().map(|c| c - 1.0).collect();
        (high, low, close)
    }

    fn choppy(n: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let close: Vec<f64> = (0..n)
            .map(|i| 100.0 + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let high: Vec<f64> = close.iter().map(|c| c + 1.0).collect();
        let low: Vec<f64> = close.iter().map(|c| c - 1.0).collect();
        (high, low, close)
    }

    #[test]
    fn warmup_is_two_periods() {
        let (high, low, close) = trending(60, 2.0);
        let adx = adx_series(&high, &low, &close, 14);
        assert!(adx[..27].iter().all(|v| v.is_nan()));
        assert!(adx[27..].iter().all(|v| !v.is_nan()));
    }

    #[test]
    fn strong_trend_reads_high() {
        let (high, low, close) = trending(80, 3.0);
        let adx = adx_series(&high, &low, &close, 14);
        let last = *adx.last().unwrap();
        assert!(last > 25.0, "steady trend should read as strong, got {last}");
    }

    #[test]
    fn chop_reads_low() {
        let (high, low, close) = choppy(80);
        let adx = adx_series(&high, &low, &close, 14);
        let last = *adx.last().unwrap();
        assert!(last < 25.0, "chop should read as weak trend, got {last}");
    }

    #[test]
    fn values_bounded_zero_to_hundred() {
        let (high, low, close) = trending(80, 1.0);
        let adx = adx_series(&high, &low, &close, 14);
        for v in adx.iter().filter(|v| !v.is_nan()) {
            assert!((0.0..=100.0).contains(v));
        }
    }
}
