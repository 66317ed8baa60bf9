//! Template → executable strategy.
//!
//! Compilation resolves every indicator instance against the registry,
//! parses the entry/exit expressions, and checks each column reference
//! against the set of names the template actually provides. The first
//! structural error fails the whole template: invalid logic is a hard
//! failure, never silently replaced with something simpler.

use std::collections::BTreeSet;

use garde::Validate;

use crate::data::OHLCV_COLS;
use crate::error::CoreError;
use crate::indicators::{find_indicator, IndicatorDef, ResolvedParams};
use crate::strategy::expr::{self, Expr, Term};
use crate::strategy::template::Template;

#[derive(Clone)]
pub struct ResolvedIndicator {
    pub def: &'static IndicatorDef,
    pub alias: String,
    pub params: ResolvedParams,
}

impl std::fmt::Debug for ResolvedIndicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedIndicator")
            .field("name", &self.def.name)
            .field("alias", &self.alias)
            .field("params", &self.params)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CompiledStrategy {
    pub name: String,
    pub indicators: Vec<ResolvedIndicator>,
    pub entry: Expr,
    pub exit: Expr,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Parameter-name groups constrained to strict ascending order.
    pub constraint_groups: Vec<Vec<String>>,
    /// Bars before which no referenced column is fully defined.
    pub warmup: usize,
}

pub fn compile(template: &Template) -> Result<CompiledStrategy, CoreError> {
    let fail = |message: String| CoreError::TemplateValidation {
        template: template.name.clone(),
        message,
    };

    template
        .validate()
        .map_err(|e| fail(format!("schema validation failed: {e}")))?;

    // Resolve indicator instances; aliases and their output columns must be
    // globally unique and must not shadow the OHLCV columns.
    let mut columns: BTreeSet<String> = OHLCV_COLS.iter().map(ToString::to_string).collect();
    let mut indicators: Vec<ResolvedIndicator> = Vec::with_capacity(template.indicators.len());

    for spec in &template.indicators {
        let def = find_indicator(&spec.name)
            .ok_or_else(|| fail(format!("unknown indicator `{}`", spec.name)))?;

        let mut numeric = std::collections::BTreeMap::new();
        for (key, value) in &spec.params {
            let number = value.as_f64().ok_or_else(|| {
                fail(format!(
                    "parameter `{key}` of `{}` must be a number, got {value}",
                    spec.alias
                ))
            })?;
            numeric.insert(key.clone(), number);
        }
        let params = def.resolve_params(&numeric).map_err(|e| fail(e))?;

        for column in def.output_columns(&spec.alias) {
            if !columns.insert(column.clone()) {
                return Err(fail(format!("duplicate alias or column `{column}`")));
            }
        }

        indicators.push(ResolvedIndicator {
            def,
            alias: spec.alias.clone(),
            params,
        });
    }

    // Parse entry/exit logic; the parser reports the offending token.
    let entry = expr::parse(&template.entry_logic)
        .map_err(|e| fail(format!("entry_logic parse failure: {e}")))?;
    let exit = expr::parse(&template.exit_logic)
        .map_err(|e| fail(format!("exit_logic parse failure: {e}")))?;

    // Resolve every column reference and compute the strategy warmup.
    let base_warmup = |name: &str| -> Option<usize> {
        if OHLCV_COLS.contains(&name) {
            return Some(0);
        }
        indicators.iter().find_map(|ind| {
            ind.def
                .output_columns(&ind.alias)
                .iter()
                .any(|c| c == name)
                .then(|| (ind.def.warmup)(&ind.params))
        })
    };

    let entry = resolve_refs(entry, &columns).map_err(&fail)?;
    let exit = resolve_refs(exit, &columns).map_err(&fail)?;

    let mut warmup = 0usize;
    for term in entry.column_refs().into_iter().chain(exit.column_refs()) {
        if let Term::Column { name, transform } = term {
            let base = base_warmup(name)
                .ok_or_else(|| fail(format!("reference to undefined column `{name}`")))?;
            let extra = transform.map_or(0, |t| t.extra_warmup());
            warmup = warmup.max(base + extra);
        }
    }

    // Correlated groups must name schema parameters.
    let mut constraint_groups = Vec::new();
    if let Some(schema) = &template.optimization_schema {
        for group in &schema.correlated_groups {
            if group.len() < 2 {
                return Err(fail("correlated group needs at least two parameters".into()));
            }
            for name in group {
                if !schema.parameters.contains_key(name) {
                    return Err(fail(format!(
                        "correlated group references unknown parameter `{name}`"
                    )));
                }
            }
            constraint_groups.push(group.clone());
        }
    }

    Ok(CompiledStrategy {
        name: template.name.clone(),
        indicators,
        entry,
        exit,
        stop_loss: template.stop_loss,
        take_profit: template.take_profit,
        constraint_groups,
        warmup,
    })
}

/// Rewrite bare `<col>_prev` identifiers into transform references and
/// reject anything that resolves to no known column.
fn resolve_refs(expr: Expr, columns: &BTreeSet<String>) -> Result<Expr, String> {
    let fix_term = |term: Term| -> Result<Term, String> {
        match term {
            Term::Column {
                name,
                transform: None,
            } => {
                if columns.contains(&name) {
                    return Ok(Term::Column {
                        name,
                        transform: None,
                    });
                }
                if let Some(base) = name.strip_suffix("_prev") {
                    if columns.contains(base) {
                        return Ok(Term::Column {
                            name: base.to_string(),
                            transform: Some(crate::indicators::derived::Transform::Prev),
                        });
                    }
                }
                Err(format!("reference to undefined column `{name}`"))
            }
            Term::Column {
                name,
                transform: Some(t),
            } => {
                if columns.contains(&name) {
                    Ok(Term::Column {
                        name,
                        transform: Some(t),
                    })
                } else {
                    Err(format!("reference to undefined column `{name}`"))
                }
            }
            number => Ok(number),
        }
    };

    Ok(match expr {
        Expr::And(l, r) => Expr::And(
            Box::new(resolve_refs(*l, columns)?),
            Box::new(resolve_refs(*r, columns)?),
        ),
        Expr::Or(l, r) => Expr::Or(
            Box::new(resolve_refs(*l, columns)?),
            Box::new(resolve_refs(*r, columns)?),
        ),
        Expr::Not(inner) => Expr::Not(Box::new(resolve_refs(*inner, columns)?)),
        Expr::Cmp { op, lhs, rhs } => Expr::Cmp {
            op,
            lhs: fix_term(lhs)?,
            rhs: fix_term(rhs)?,
        },
        Expr::Cross { above, a, b } => Expr::Cross {
            above,
            a: fix_term(a)?,
            b: fix_term(b)?,
        },
    })
}
