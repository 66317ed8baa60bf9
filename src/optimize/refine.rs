//! Refinement strategies over the sweep primitive.
//!
//! Three shapes share one report format:
//!
//! - `grid` — a single pass over the deterministic enumeration;
//! - `coarse_to_fine` — up to four rounds with shrinking steps, the top-K
//!   spatially-separated candidates of each round seeding the next;
//! - `coordinate_descent` — one parameter swept at a time with the others
//!   locked, repeated until a full round changes nothing.
//!
//! Every round's combination list is a pure function of `(spec, seed,
//! results-of-earlier-rounds)`, which is what makes checkpoint/resume replay
//! the exact same search.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::SweepConfig;
use crate::engine::types::OptimizerStrategy;
use crate::error::CoreError;

use super::grid::{axis_values, GridSpec, ParamSet};
use super::sweep::{
    best_of, run_sweep, ComboFailure, ComboResult, SelectionMetric, SweepContext, SweepControl,
    SweepProgress, SweepStatus,
};

/// Step schedule per round: integer-valued parameters use the left value,
/// fractional ones the right.
const ROUND_STEPS: &[(f64, f64)] = &[(5.0, 0.5), (3.0, 0.3), (2.0, 0.2), (1.0, 0.1)];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub round: usize,
    pub combos: usize,
    pub evaluated: usize,
    pub best_params: Option<ParamSet>,
    pub best_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub best: Option<ComboResult>,
    pub all_results: Vec<ComboResult>,
    pub failures: Vec<ComboFailure>,
    pub stages: Vec<StageReport>,
    pub status: SweepStatus,
    /// Coordinate descent only: a full round changed no parameter.
    pub converged: bool,
    /// Where to pick back up after a pause: `(round, iteration)`.
    pub next_round: usize,
    pub next_iteration: usize,
}

/// Restart coordinates for a resumed job: skip completed rounds, then skip
/// the first `iteration` combinations of the current round, seeding the
/// accumulated results so later rounds derive identically.
#[derive(Debug, Clone, Default)]
pub struct ResumePoint {
    pub round: usize,
    pub iteration: usize,
    pub results: Vec<ComboResult>,
    pub failures: Vec<ComboFailure>,
}

#[allow(clippy::too_many_arguments)]
pub fn optimize(
    ctx: SweepContext<'_>,
    spec: &GridSpec,
    strategy: OptimizerStrategy,
    seed: u64,
    metric: SelectionMetric,
    config: &SweepConfig,
    control: &SweepControl,
    resume: ResumePoint,
    on_progress: &mut dyn FnMut(SweepProgress<'_>),
) -> Result<OptimizationReport, CoreError> {
    let deadline = config.sweep_timeout.map(|d| Instant::now() + d);
    match strategy {
        OptimizerStrategy::Grid => grid_search(
            ctx, spec, seed, metric, config, control, deadline, resume, on_progress,
        ),
        OptimizerStrategy::CoarseToFine => coarse_to_fine(
            ctx, spec, seed, metric, config, control, deadline, resume, on_progress,
        ),
        OptimizerStrategy::CoordinateDescent => coordinate_descent(
            ctx, spec, seed, metric, config, control, deadline, resume, on_progress,
        ),
    }
}

fn stage_report(
    round: usize,
    combos: usize,
    results: &[ComboResult],
    metric: SelectionMetric,
) -> StageReport {
    let round_results = results.iter().filter(|r| r.round == round);
    let best = best_of(round_results, metric);
    StageReport {
        round,
        combos,
        evaluated: results.iter().filter(|r| r.round == round).count(),
        best_params: best.map(|b| b.params.clone()),
        best_score: best.map(|b| metric.score(&b.metrics)),
    }
}

#[allow(clippy::too_many_arguments)]
fn grid_search(
    ctx: SweepContext<'_>,
    spec: &GridSpec,
    seed: u64,
    metric: SelectionMetric,
    config: &SweepConfig,
    control: &SweepControl,
    deadline: Option<Instant>,
    resume: ResumePoint,
    on_progress: &mut dyn FnMut(SweepProgress<'_>),
) -> Result<OptimizationReport, CoreError> {
    let combos = spec.enumerate(seed);
    let mut results = resume.results;
    let mut failures = resume.failures;

    let outcome = run_sweep(
        ctx,
        &combos,
        0,
        resume.iteration,
        0,
        config,
        control,
        deadline,
        on_progress,
    )?;
    results.extend(outcome.results);
    failures.extend(outcome.failures);

    let stages = vec![stage_report(0, combos.len(), &results, metric)];
    Ok(OptimizationReport {
        best: best_of(&results, metric).cloned(),
        stages,
        status: outcome.status,
        converged: false,
        next_round: 0,
        next_iteration: outcome.next_index,
        all_results: results,
        failures,
    })
}

/// True when every bound of the range is a whole number — the heuristic for
/// choosing the integer step schedule.
fn is_integer_axis(spec: &GridSpec, name: &str) -> bool {
    spec.parameters.get(name).is_some_and(|r| {
        r.min.fract() == 0.0 && r.max.fract() == 0.0 && r.step.fract() == 0.0 && r.step >= 1.0
    })
}

fn round_step(spec: &GridSpec, name: &str, round: usize) -> f64 {
    let (int_step, frac_step) = ROUND_STEPS[round.min(ROUND_STEPS.len() - 1)];
    if is_integer_axis(spec, name) {
        int_step
    } else {
        frac_step
    }
}

/// The widened first-round grid: full ranges, coarse steps.
fn coarse_spec(spec: &GridSpec) -> GridSpec {
    let parameters = spec
        .parameters
        .iter()
        .map(|(name, range)| {
            let mut out = *range;
            out.step = out.step.max(round_step(spec, name, 0));
            (name.clone(), out)
        })
        .collect();
    GridSpec {
        parameters,
        constraint_groups: spec.constraint_groups.clone(),
    }
}

/// Top-K results of `round`, greedily skipping candidates that sit within
/// one previous-round step of an already-picked seed on every axis.
fn top_k_separated(
    results: &[ComboResult],
    round: usize,
    spec: &GridSpec,
    metric: SelectionMetric,
    k: usize,
) -> Vec<ParamSet> {
    let mut round_results: Vec<&ComboResult> =
        results.iter().filter(|r| r.round == round).collect();
    round_results.sort_by(|a, b| {
        ordered_float::OrderedFloat(metric.score(&b.metrics))
            .cmp(&ordered_float::OrderedFloat(metric.score(&a.metrics)))
            .then_with(|| b.num_trades.cmp(&a.num_trades))
            .then_with(|| a.index.cmp(&b.index))
    });

    let mut seeds: Vec<ParamSet> = Vec::new();
    for candidate in round_results {
        if seeds.len() >= k {
            break;
        }
        let separated = seeds.iter().all(|seed| {
            candidate.params.iter().any(|(name, &value)| {
                let step = round_step(spec, name, round).max(f64::EPSILON);
                seed.get(name)
                    .is_none_or(|&other| (value - other).abs() >= step)
            })
        });
        if separated {
            seeds.push(candidate.params.clone());
        }
    }
    seeds
}

/// Combination list of a coarse-to-fine round — derived only from the spec,
/// the seed, and results of *earlier* rounds, so a resumed run regenerates
/// it bit-for-bit.
fn c2f_round_combos(
    spec: &GridSpec,
    seed: u64,
    round: usize,
    results: &[ComboResult],
    top_k: usize,
    metric: SelectionMetric,
) -> Vec<ParamSet> {
    if round == 0 {
        return coarse_spec(spec).enumerate(seed);
    }

    let seeds = top_k_separated(results, round - 1, spec, metric, top_k);
    let mut seen: BTreeSet<String> = results
        .iter()
        .filter(|r| r.round < round)
        .map(|r| format!("{:?}", r.params))
        .collect();

    let mut combos = Vec::new();
    for center in seeds {
        let radius: BTreeMap<String, f64> = center
            .keys()
            .map(|name| (name.clone(), round_step(spec, name, round - 1)))
            .collect();
        let step: BTreeMap<String, f64> = center
            .keys()
            .map(|name| (name.clone(), round_step(spec, name, round)))
            .collect();
        for combo in spec.zoomed(&center, &radius, &step).enumerate(seed) {
            let key = format!("{combo:?}");
            if seen.insert(key) {
                combos.push(combo);
            }
        }
    }
    combos
}

#[allow(clippy::too_many_arguments)]
fn coarse_to_fine(
    ctx: SweepContext<'_>,
    spec: &GridSpec,
    seed: u64,
    metric: SelectionMetric,
    config: &SweepConfig,
    control: &SweepControl,
    deadline: Option<Instant>,
    resume: ResumePoint,
    on_progress: &mut dyn FnMut(SweepProgress<'_>),
) -> Result<OptimizationReport, CoreError> {
    let mut results = resume.results;
    let mut failures = resume.failures;
    let mut stages: Vec<StageReport> = Vec::new();
    let mut status = SweepStatus::Completed;
    let mut next_round = resume.round;
    let mut next_iteration = 0usize;

    let total_rounds = ROUND_STEPS.len();
    for round in resume.round..total_rounds {
        let combos = c2f_round_combos(spec, seed, round, &results, config.top_k, metric);
        if combos.is_empty() {
            break;
        }
        let start_at = if round == resume.round {
            resume.iteration
        } else {
            0
        };
        let index_offset = results.len() + failures.len();

        let outcome = run_sweep(
            ctx,
            &combos,
            round,
            start_at,
            index_offset.saturating_sub(start_at),
            config,
            control,
            deadline,
            on_progress,
        )?;
        results.extend(outcome.results);
        failures.extend(outcome.failures);
        stages.push(stage_report(round, combos.len(), &results, metric));

        next_round = round;
        next_iteration = outcome.next_index;
        if outcome.status != SweepStatus::Completed {
            status = outcome.status;
            break;
        }
        next_round = round + 1;
        next_iteration = 0;
    }

    Ok(OptimizationReport {
        best: best_of(&results, metric).cloned(),
        stages,
        status,
        converged: false,
        next_round,
        next_iteration,
        all_results: results,
        failures,
    })
}

/// Axis sweep list for coordinate descent: the current point swept along one
/// parameter, everything else locked.
fn axis_combos(spec: &GridSpec, current: &ParamSet, name: &str) -> Vec<ParamSet> {
    let Some(range) = spec.parameters.get(name) else {
        return Vec::new();
    };
    axis_values(range)
        .into_iter()
        .map(|value| {
            let mut combo = current.clone();
            combo.insert(name.to_string(), value);
            combo
        })
        .filter(|combo| spec.satisfies_constraints(combo))
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn coordinate_descent(
    ctx: SweepContext<'_>,
    spec: &GridSpec,
    _seed: u64,
    metric: SelectionMetric,
    config: &SweepConfig,
    control: &SweepControl,
    deadline: Option<Instant>,
    resume: ResumePoint,
    on_progress: &mut dyn FnMut(SweepProgress<'_>),
) -> Result<OptimizationReport, CoreError> {
    let names: Vec<String> = spec.parameters.keys().cloned().collect();
    if names.is_empty() {
        return Ok(OptimizationReport {
            best: None,
            all_results: resume.results,
            failures: resume.failures,
            stages: Vec::new(),
            status: SweepStatus::Completed,
            converged: true,
            next_round: 0,
            next_iteration: 0,
        });
    }
    let mut current: ParamSet = spec
        .parameters
        .iter()
        .map(|(name, range)| (name.clone(), range.default))
        .collect();

    // Replaying a resumed run: fold prior per-stage bests back into the
    // current point so the walk continues where it left off.
    let mut results = resume.results;
    let mut failures = resume.failures;
    for stage in 0..resume.round {
        let name = &names[stage % names.len()];
        if let Some(best) = best_of(results.iter().filter(|r| r.round == stage), metric) {
            if let Some(&value) = best.params.get(name) {
                current.insert(name.clone(), value);
            }
        }
    }

    let mut stages: Vec<StageReport> = Vec::new();
    let mut status = SweepStatus::Completed;
    let mut converged = false;
    let mut next_round = resume.round;
    let mut next_iteration = 0usize;
    let mut stage = resume.round;
    let mut changed_this_round = false;

    'outer: while stage < config.max_rounds * names.len() {
        let within_round = stage % names.len();
        // Convergence can only be declared once a full uninterrupted round
        // has been observed since (re)start.
        if within_round == 0 && stage >= resume.round + names.len() {
            if !changed_this_round {
                converged = true;
                break;
            }
            changed_this_round = false;
        }

        let name = &names[within_round];
        let combos = axis_combos(spec, &current, name);
        let start_at = if stage == resume.round {
            resume.iteration
        } else {
            0
        };
        let index_offset = results.len() + failures.len();

        let outcome = run_sweep(
            ctx,
            &combos,
            stage,
            start_at,
            index_offset.saturating_sub(start_at),
            config,
            control,
            deadline,
            on_progress,
        )?;
        results.extend(outcome.results);
        failures.extend(outcome.failures);
        stages.push(stage_report(stage, combos.len(), &results, metric));

        next_round = stage;
        next_iteration = outcome.next_index;
        if outcome.status != SweepStatus::Completed {
            status = outcome.status;
            break 'outer;
        }

        if let Some(best) = best_of(results.iter().filter(|r| r.round == stage), metric) {
            if let Some(&best_value) = best.params.get(name) {
                if current.get(name) != Some(&best_value) {
                    current.insert(name.clone(), best_value);
                    changed_this_round = true;
                }
            }
        }

        stage += 1;
        next_round = stage;
        next_iteration = 0;
    }

    Ok(OptimizationReport {
        best: best_of(&results, metric).cloned(),
        stages,
        status,
        converged,
        next_round,
        next_iteration,
        all_results: results,
        failures,
    })
}
