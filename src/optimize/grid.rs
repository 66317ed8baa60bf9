//! Deterministic grid construction.
//!
//! The grid is a pure function of `(spec, seed)`: axes iterate in sorted
//! parameter-name order, the odometer runs last-name-fastest, correlated
//! groups filter in place, and the optional seed applies one deterministic
//! shuffle. Two runs (or a run and a later resume) always see the same
//! combination sequence.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::strategy::template::{OptimizationSchema, ParamRange};

/// One parameter combination, keyed by parameter name.
pub type ParamSet = BTreeMap<String, f64>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSpec {
    pub parameters: BTreeMap<String, ParamRange>,
    /// Name groups constrained to strict ascending order.
    #[serde(default)]
    pub constraint_groups: Vec<Vec<String>>,
}

impl GridSpec {
    pub fn from_schema(schema: &OptimizationSchema) -> Self {
        Self {
            parameters: schema.parameters.clone(),
            constraint_groups: schema.correlated_groups.clone(),
        }
    }

    /// Raw Cartesian size before constraint filtering — the cheap estimate
    /// the explosion guard uses without enumerating anything.
    pub fn estimated_size(&self) -> usize {
        self.parameters
            .values()
            .map(|range| axis_values(range).len())
            .product()
    }

    /// Fail when the raw grid exceeds `limit` and the caller has not
    /// explicitly confirmed.
    pub fn check_size(&self, limit: usize, confirmed: bool) -> Result<(), CoreError> {
        let estimated = self.estimated_size();
        if estimated > limit && !confirmed {
            return Err(CoreError::GridExplosion { estimated, limit });
        }
        Ok(())
    }

    pub fn satisfies_constraints(&self, combo: &ParamSet) -> bool {
        self.constraint_groups.iter().all(|group| {
            group.windows(2).all(|pair| {
                match (combo.get(&pair[0]), combo.get(&pair[1])) {
                    (Some(a), Some(b)) => a < b,
                    // A group member outside this grid cannot be ordered;
                    // leave the combination in.
                    _ => true,
                }
            })
        })
    }

    /// Enumerate the filtered grid. `seed = 0` keeps odometer order; any
    /// other seed applies one deterministic shuffle.
    pub fn enumerate(&self, seed: u64) -> Vec<ParamSet> {
        if self.parameters.is_empty() {
            return Vec::new();
        }
        let names: Vec<&String> = self.parameters.keys().collect();
        let axes: Vec<Vec<f64>> = self.parameters.values().map(axis_values).collect();
        if axes.iter().any(Vec::is_empty) {
            return Vec::new();
        }

        let mut combos = Vec::new();
        let mut cursor = vec![0usize; axes.len()];
        loop {
            let combo: ParamSet = names
                .iter()
                .zip(axes.iter())
                .zip(cursor.iter())
                .map(|((name, axis), &i)| ((*name).clone(), axis[i]))
                .collect();
            if self.satisfies_constraints(&combo) {
                combos.push(combo);
            }

            // Odometer: last axis spins fastest.
            let mut pos = axes.len();
            loop {
                if pos == 0 {
                    break;
                }
                pos -= 1;
                cursor[pos] += 1;
                if cursor[pos] < axes[pos].len() {
                    break;
                }
                cursor[pos] = 0;
                if pos == 0 {
                    let mut combos = combos;
                    if seed != 0 {
                        let mut rng = StdRng::seed_from_u64(seed);
                        combos.shuffle(&mut rng);
                    }
                    return combos;
                }
            }
        }
    }

    /// Subgrid around a seed point: every parameter clamped to
    /// `center ± radius` with the given step, other bounds intact.
    pub fn zoomed(&self, center: &ParamSet, radius: &BTreeMap<String, f64>, step: &BTreeMap<String, f64>) -> GridSpec {
        let parameters = self
            .parameters
            .iter()
            .map(|(name, range)| {
                let mut out = *range;
                if let (Some(&mid), Some(&r), Some(&s)) =
                    (center.get(name), radius.get(name), step.get(name))
                {
                    out.min = (mid - r).max(range.min);
                    out.max = (mid + r).min(range.max);
                    out.step = s;
                    out.default = mid;
                }
                (name.clone(), out)
            })
            .collect();
        GridSpec {
            parameters,
            constraint_groups: self.constraint_groups.clone(),
        }
    }
}

/// `{min, min+step, …, ≤ max}` with float-tolerant upper bound, values
/// rounded to kill accumulation noise.
pub fn axis_values(range: &ParamRange) -> Vec<f64> {
    if range.step <= 0.0 || range.max < range.min {
        return Vec::new();
    }
    let count = ((range.max - range.min) / range.step + 1e-9).floor() as usize + 1;
    (0..count)
        .map(|i| {
            let value = range.min + i as f64 * range.step;
            (value * 1e9).round() / 1e9
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: f64, max: f64, step: f64) -> ParamRange {
        ParamRange {
            min,
            max,
            step,
            default: min,
        }
    }

    fn three_ma_spec() -> GridSpec {
        let mut parameters = BTreeMap::new();
        parameters.insert("ma_short".to_string(), range(5.0, 15.0, 5.0));
        parameters.insert("ma_mid".to_string(), range(10.0, 30.0, 10.0));
        parameters.insert("ma_long".to_string(), range(20.0, 60.0, 20.0));
        GridSpec {
            parameters,
            constraint_groups: vec![vec![
                "ma_short".to_string(),
                "ma_mid".to_string(),
                "ma_long".to_string(),
            ]],
        }
    }

    #[test]
    fn axis_values_inclusive_of_max() {
        let axis = axis_values(&range(5.0, 15.0, 5.0));
        assert_eq!(axis, vec![5.0, 10.0, 15.0]);
        let axis = axis_values(&range(0.1, 0.3, 0.1));
        assert_eq!(axis.len(), 3);
        assert!((axis[2] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn estimated_size_is_raw_product() {
        assert_eq!(three_ma_spec().estimated_size(), 27);
    }

    #[test]
    fn constraint_filter_keeps_exactly_ordered_combos() {
        let combos = three_ma_spec().enumerate(0);
        // 27 raw; kept only where short < mid < long
        assert_eq!(combos.len(), 10);
        for combo in &combos {
            assert!(combo["ma_short"] < combo["ma_mid"]);
            assert!(combo["ma_mid"] < combo["ma_long"]);
        }
    }

    #[test]
    fn enumeration_is_deterministic() {
        let spec = three_ma_spec();
        assert_eq!(spec.enumerate(0), spec.enumerate(0));
        assert_eq!(spec.enumerate(42), spec.enumerate(42));
        // A different seed permutes, same members
        let a = spec.enumerate(42);
        let b = spec.enumerate(7);
        assert_ne!(a, b);
        let mut a_sorted = a.clone();
        let mut b_sorted = b;
        a_sorted.sort_by_key(|c| format!("{c:?}"));
        b_sorted.sort_by_key(|c| format!("{c:?}"));
        assert_eq!(a_sorted, b_sorted);
    }

    #[test]
    fn explosion_guard_requires_confirmation() {
        let spec = three_ma_spec();
        let err = spec.check_size(10, false).unwrap_err();
        assert_eq!(err.kind(), "grid_explosion");
        assert!(spec.check_size(10, true).is_ok());
        assert!(spec.check_size(500, false).is_ok());
    }

    #[test]
    fn zoomed_clamps_to_original_bounds() {
        let spec = three_ma_spec();
        let mut center = ParamSet::new();
        center.insert("ma_short".to_string(), 5.0);
        center.insert("ma_mid".to_string(), 20.0);
        center.insert("ma_long".to_string(), 40.0);
        let radius: BTreeMap<String, f64> = center.keys().map(|k| (k.clone(), 5.0)).collect();
        let step: BTreeMap<String, f64> = center.keys().map(|k| (k.clone(), 3.0)).collect();
        let zoomed = spec.zoomed(&center, &radius, &step);

        let short = &zoomed.parameters["ma_short"];
        assert_eq!(short.min, 5.0); // clamped at the original lower bound
        assert_eq!(short.max, 10.0);
    }

    #[test]
    fn single_point_axis() {
        let axis = axis_values(&range(7.0, 7.0, 1.0));
        assert_eq!(axis, vec![7.0]);
    }
}
