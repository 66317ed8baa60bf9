pub mod derived;
pub mod momentum;
pub mod overlap;
pub mod trend;
pub mod volatility;

use std::collections::BTreeMap;

use crate::data::CandleFrame;

/// Parameter values an indicator instance was resolved with, keyed by the
/// schema parameter name.
pub type ResolvedParams = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Integer,
    Fraction,
}

/// One accepted parameter of an indicator: name, type, default, and the
/// range a sweep may explore when the template does not narrow it.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub default: f64,
    pub min: f64,
    pub max: f64,
}

/// Registry entry: everything the compiler and optimizer need to know about
/// an indicator without touching its implementation.
pub struct IndicatorDef {
    pub name: &'static str,
    pub category: &'static str,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
    /// Output column suffixes appended to the instance alias. A single
    /// empty suffix means the alias itself is the column.
    pub outputs: &'static [&'static str],
    /// Leading bars of every output that are NaN sentinels.
    pub warmup: fn(&ResolvedParams) -> usize,
    /// Compute all outputs, each padded to the frame length with leading
    /// NaNs. Pure: no I/O, same inputs produce same outputs.
    pub compute: fn(&CandleFrame, &ResolvedParams) -> Vec<Vec<f64>>,
}

impl IndicatorDef {
    pub fn param(&self, name: &str) -> Option<&'static ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Resolve supplied params against the schema, filling defaults.
    /// Unknown names are reported back for the compiler to reject.
    pub fn resolve_params(
        &self,
        supplied: &BTreeMap<String, f64>,
    ) -> Result<ResolvedParams, String> {
        for key in supplied.keys() {
            if self.param(key).is_none() {
                return Err(format!(
                    "indicator `{}` has no parameter `{key}`",
                    self.name
                ));
            }
        }
        let mut resolved = ResolvedParams::new();
        for spec in self.params {
            let value = supplied.get(spec.name).copied().unwrap_or(spec.default);
            resolved.insert(spec.name.to_string(), value);
        }
        Ok(resolved)
    }

    /// Column names this instance contributes under `alias`.
    pub fn output_columns(&self, alias: &str) -> Vec<String> {
        self.outputs
            .iter()
            .map(|suffix| format!("{alias}{suffix}"))
            .collect()
    }
}

pub fn all_indicators() -> &'static [IndicatorDef] {
    use std::sync::OnceLock;
    static REGISTRY: OnceLock<Vec<IndicatorDef>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut defs = Vec::new();
        defs.extend(overlap::defs());
        defs.extend(momentum::defs());
        defs.extend(volatility::defs());
        defs.extend(trend::defs());
        defs
    })
}

pub fn find_indicator(name: &str) -> Option<&'static IndicatorDef> {
    all_indicators().iter().find(|def| def.name == name)
}

/// Pull a resolved parameter as a window length.
pub(crate) fn length_param(params: &ResolvedParams, name: &str) -> usize {
    params.get(name).copied().unwrap_or(0.0).round().max(1.0) as usize
}

/// Left-pad a window-aligned bulk result to the full series length with NaN
/// warmup sentinels.
pub(crate) fn pad_series(values: &[f64], n: usize) -> Vec<f64> {
    let pad = n.saturating_sub(values.len());
    let mut padded = Vec::with_capacity(n);
    padded.resize(pad, f64::NAN);
    padded.extend_from_slice(values);
    padded
}

/// All-NaN column for series shorter than the indicator window.
pub(crate) fn nan_series(n: usize) -> Vec<f64> {
    vec![f64::NAN; n]
}
