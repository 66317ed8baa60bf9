//! Vectorized evaluation of compiled strategies.
//!
//! Binding computes every indicator instance and derived column once over a
//! candle frame; evaluation then folds the boolean ASTs into per-bar signal
//! vectors. Comparisons involving NaN (warmup sentinels) are false, and the
//! whole strategy warmup window is masked off, so `NOT` over an undefined
//! bar can never fire a signal.

use rustc_hash::FxHashMap;

use crate::data::CandleFrame;
use crate::error::CoreError;
use crate::strategy::compiler::CompiledStrategy;
use crate::strategy::expr::{CmpOp, Expr, Term};

pub struct BoundStrategy<'a> {
    compiled: &'a CompiledStrategy,
    frame: &'a CandleFrame,
    columns: FxHashMap<String, Vec<f64>>,
}

/// Compute all columns the strategy references over `frame`.
pub fn bind<'a>(
    compiled: &'a CompiledStrategy,
    frame: &'a CandleFrame,
) -> Result<BoundStrategy<'a>, CoreError> {
    let mut columns: FxHashMap<String, Vec<f64>> = FxHashMap::default();

    for instance in &compiled.indicators {
        let outputs = (instance.def.compute)(frame, &instance.params);
        for (name, values) in instance
            .def
            .output_columns(&instance.alias)
            .into_iter()
            .zip(outputs)
        {
            columns.insert(name, values);
        }
    }

    // Derived columns for every transformed reference, computed once and
    // keyed by their canonical name.
    for term in compiled
        .entry
        .column_refs()
        .into_iter()
        .chain(compiled.exit.column_refs())
    {
        let Term::Column {
            name,
            transform: Some(t),
        } = term
        else {
            continue;
        };
        let key = t.column_name(name);
        if columns.contains_key(&key) {
            continue;
        }
        let base = columns
            .get(name.as_str())
            .map(Vec::as_slice)
            .or_else(|| frame.column(name))
            .ok_or_else(|| CoreError::TemplateValidation {
                template: compiled.name.clone(),
                message: format!("reference to undefined column `{name}`"),
            })?;
        let derived = t.apply(base);
        columns.insert(key, derived);
    }

    Ok(BoundStrategy {
        compiled,
        frame,
        columns,
    })
}

impl BoundStrategy<'_> {
    pub fn frame(&self) -> &CandleFrame {
        self.frame
    }

    pub fn warmup(&self) -> usize {
        self.compiled.warmup
    }

    /// Per-bar entry predicate, false inside the warmup window.
    pub fn entry_signals(&self) -> Vec<bool> {
        self.masked(self.eval(&self.compiled.entry))
    }

    /// Per-bar exit predicate, false inside the warmup window.
    pub fn exit_signals(&self) -> Vec<bool> {
        self.masked(self.eval(&self.compiled.exit))
    }

    fn masked(&self, mut signals: Vec<bool>) -> Vec<bool> {
        let cut = self.compiled.warmup.min(signals.len());
        for flag in &mut signals[..cut] {
            *flag = false;
        }
        signals
    }

    fn series(&self, term: &Term) -> TermSeries<'_> {
        match term {
            Term::Number(value) => TermSeries::Constant(*value),
            Term::Column {
                name,
                transform: None,
            } => {
                let values = self
                    .columns
                    .get(name.as_str())
                    .map(Vec::as_slice)
                    .or_else(|| self.frame.column(name))
                    .unwrap_or(&[]);
                TermSeries::Values(values)
            }
            Term::Column {
                name,
                transform: Some(t),
            } => {
                let key = t.column_name(name);
                let values = self.columns.get(&key).map_or(&[] as &[f64], Vec::as_slice);
                TermSeries::Values(values)
            }
        }
    }

    fn eval(&self, expr: &Expr) -> Vec<bool> {
        let n = self.frame.len();
        match expr {
            Expr::And(l, r) => {
                let (a, b) = (self.eval(l), self.eval(r));
                a.iter().zip(b).map(|(&x, y)| x && y).collect()
            }
            Expr::Or(l, r) => {
                let (a, b) = (self.eval(l), self.eval(r));
                a.iter().zip(b).map(|(&x, y)| x || y).collect()
            }
            Expr::Not(inner) => self.eval(inner).into_iter().map(|v| !v).collect(),
            Expr::Cmp { op, lhs, rhs } => {
                let (a, b) = (self.series(lhs), self.series(rhs));
                (0..n)
                    .map(|i| {
                        let (x, y) = (a.get(i), b.get(i));
                        !x.is_nan() && !y.is_nan() && compare(*op, x, y)
                    })
                    .collect()
            }
            Expr::Cross { above, a, b } => {
                let (a, b) = (self.series(a), self.series(b));
                let mut out = vec![false; n];
                for i in 1..n {
                    let (ap, bp) = (a.get(i - 1), b.get(i - 1));
                    let (ac, bc) = (a.get(i), b.get(i));
                    if ap.is_nan() || bp.is_nan() || ac.is_nan() || bc.is_nan() {
                        continue;
                    }
                    out[i] = if *above {
                        ap <= bp && ac > bc
                    } else {
                        ap >= bp && ac < bc
                    };
                }
                out
            }
        }
    }
}

enum TermSeries<'a> {
    Constant(f64),
    Values(&'a [f64]),
}

impl TermSeries<'_> {
    fn get(&self, i: usize) -> f64 {
        match self {
            TermSeries::Constant(value) => *value,
            TermSeries::Values(values) => values.get(i).copied().unwrap_or(f64::NAN),
        }
    }
}

fn compare(op: CmpOp, x: f64, y: f64) -> bool {
    match op {
        CmpOp::Gt => x > y,
        CmpOp::Lt => x < y,
        CmpOp::Ge => x >= y,
        CmpOp::Le => x <= y,
        CmpOp::Eq => x == y,
        CmpOp::Ne => x != y,
    }
}
