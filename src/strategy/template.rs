use std::collections::BTreeMap;

use garde::Validate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declarative strategy definition: indicator instances plus entry/exit
/// boolean expressions over their aliases. This is the unit callers submit,
/// persist, and sweep.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct Template {
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(dive)]
    pub indicators: Vec<IndicatorSpec>,
    #[garde(length(min = 1))]
    pub entry_logic: String,
    #[garde(length(min = 1))]
    pub exit_logic: String,
    /// Fractional stop, e.g. 0.02 = exit 2% below entry.
    #[garde(inner(range(min = 0.0001, max = 1.0)))]
    pub stop_loss: Option<f64>,
    /// Fractional target, e.g. 0.05 = exit 5% above entry.
    #[garde(inner(range(min = 0.0001)))]
    pub take_profit: Option<f64>,
    #[serde(default)]
    #[garde(dive)]
    pub optimization_schema: Option<OptimizationSchema>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorSource {
    Builtin,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct IndicatorSpec {
    #[garde(skip)]
    pub source: IndicatorSource,
    /// Registry name (`ema`, `rsi`, …).
    #[garde(length(min = 1))]
    pub name: String,
    /// Column name this instance contributes to expressions. Unique within
    /// the template.
    #[garde(length(min = 1))]
    pub alias: String,
    /// Raw parameter values. Coerced to numbers exactly once, at compile
    /// time, with an explicit error on failure.
    #[serde(default)]
    #[garde(skip)]
    pub params: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct OptimizationSchema {
    #[garde(skip)]
    pub parameters: BTreeMap<String, ParamRange>,
    /// Groups of parameter names constrained to strict ascending order, used
    /// to filter the optimizer's grid (`[a, b, c]` keeps only `a < b < c`).
    #[serde(default)]
    #[garde(skip)]
    pub correlated_groups: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Validate)]
pub struct ParamRange {
    #[garde(skip)]
    pub min: f64,
    #[garde(custom(range_max_gte_min(self.min)))]
    pub max: f64,
    #[garde(range(min = 1e-12))]
    pub step: f64,
    #[garde(skip)]
    pub default: f64,
}

fn range_max_gte_min(min: f64) -> impl FnOnce(&f64, &()) -> garde::Result {
    move |max: &f64, (): &()| {
        if *max < min {
            return Err(garde::Error::new(format!(
                "max ({max}) must be >= min ({min})"
            )));
        }
        Ok(())
    }
}

impl Template {
    /// Substitute a sweep combination into a copy of this template.
    ///
    /// A combination key binds, in order of precedence:
    /// 1. `alias.param` — that parameter of that indicator instance;
    /// 2. a bare alias — the instance's `length` parameter (`ma_short: 10`);
    /// 3. `stop_loss` / `take_profit` — the exit thresholds;
    /// 4. a bare parameter name — every instance declaring it.
    pub fn with_params(&self, combo: &BTreeMap<String, f64>) -> Template {
        let mut out = self.clone();
        for (key, &value) in combo {
            match key.as_str() {
                "stop_loss" => {
                    out.stop_loss = Some(value);
                    continue;
                }
                "take_profit" => {
                    out.take_profit = Some(value);
                    continue;
                }
                _ => {}
            }

            if let Some((alias, param)) = key.split_once('.') {
                for spec in &mut out.indicators {
                    if spec.alias == alias {
                        spec.params
                            .insert(param.to_string(), serde_json::json!(value));
                    }
                }
                continue;
            }

            let mut matched_alias = false;
            for spec in &mut out.indicators {
                if spec.alias == *key {
                    spec.params
                        .insert("length".to_string(), serde_json::json!(value));
                    matched_alias = true;
                }
            }
            if matched_alias {
                continue;
            }

            for spec in &mut out.indicators {
                if crate::indicators::find_indicator(&spec.name)
                    .is_some_and(|def| def.param(key).is_some())
                {
                    spec.params
                        .insert(key.to_string(), serde_json::json!(value));
                }
            }
        }
        out
    }
}
