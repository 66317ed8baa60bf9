//! Derived column transforms available to strategy expressions without a
//! registry entry: `<col>_prev`, `<col>_lag(n)`, `<col>_slope(n)`,
//! `<col>_rollmean(n)`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transform {
    /// Value one bar back.
    Prev,
    /// Value `n` bars back.
    Lag(usize),
    /// Difference over `n` bars: `v[i] − v[i−n]`.
    Slope(usize),
    /// Rolling mean over the trailing `n` bars.
    RollMean(usize),
}

impl Transform {
    /// Extra bars of history the transform consumes beyond its base column.
    pub fn extra_warmup(self) -> usize {
        match self {
            Transform::Prev => 1,
            Transform::Lag(n) | Transform::Slope(n) => n,
            Transform::RollMean(n) => n.saturating_sub(1),
        }
    }

    /// Canonical column name for a transformed base column, used as the
    /// cache key when binding a strategy.
    pub fn column_name(self, base: &str) -> String {
        match self {
            Transform::Prev => format!("{base}_prev"),
            Transform::Lag(n) => format!("{base}_lag({n})"),
            Transform::Slope(n) => format!("{base}_slope({n})"),
            Transform::RollMean(n) => format!("{base}_rollmean({n})"),
        }
    }

    pub fn apply(self, base: &[f64]) -> Vec<f64> {
        match self {
            Transform::Prev => shift(base, 1),
            Transform::Lag(n) => shift(base, n),
            Transform::Slope(n) => base
                .iter()
                .enumerate()
                .map(|(i, &v)| {
                    if i < n {
                        f64::NAN
                    } else {
                        v - base[i - n]
                    }
                })
                .collect(),
            Transform::RollMean(n) => rolling_mean(base, n),
        }
    }
}

fn shift(values: &[f64], by: usize) -> Vec<f64> {
    values
        .iter()
        .enumerate()
        .map(|(i, _)| if i < by { f64::NAN } else { values[i - by] })
        .collect()
}

fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    values
        .iter()
        .enumerate()
        .map(|(i, _)| {
            if i + 1 < window {
                return f64::NAN;
            }
            let slice = &values[i + 1 - window..=i];
            if slice.iter().any(|v| v.is_nan()) {
                return f64::NAN;
            }
            slice.iter().sum::<f64>() / window as f64
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prev_shifts_one_bar() {
        let out = Transform::Prev.apply(&[1.0, 2.0, 3.0]);
        assert!(out[0].is_nan());
        assert_eq!(out[1], 1.0);
        assert_eq!(out[2], 2.0);
    }

    #[test]
    fn lag_shifts_n_bars() {
        let out = Transform::Lag(2).apply(&[1.0, 2.0, 3.0, 4.0]);
        assert!(out[0].is_nan() && out[1].is_nan());
        assert_eq!(out[2], 1.0);
        assert_eq!(out[3], 2.0);
    }

    #[test]
    fn slope_is_difference_over_n() {
        let out = Transform::Slope(2).apply(&[1.0, 2.0, 4.0, 7.0]);
        assert!(out[1].is_nan());
        assert_eq!(out[2], 3.0);
        assert_eq!(out[3], 5.0);
    }

    #[test]
    fn rollmean_window() {
        let out = Transform::RollMean(2).apply(&[1.0, 3.0, 5.0]);
        assert!(out[0].is_nan());
        assert_eq!(out[1], 2.0);
        assert_eq!(out[2], 4.0);
    }

    #[test]
    fn rollmean_propagates_nan_warmup() {
        let out = Transform::RollMean(2).apply(&[f64::NAN, 3.0, 5.0]);
        assert!(out[1].is_nan());
        assert_eq!(out[2], 4.0);
    }

    #[test]
    fn column_names_match_expression_forms() {
        assert_eq!(Transform::Prev.column_name("ema_s"), "ema_s_prev");
        assert_eq!(Transform::Lag(3).column_name("rsi"), "rsi_lag(3)");
        assert_eq!(
            Transform::RollMean(5).column_name("close"),
            "close_rollmean(5)"
        );
    }
}
