//! Parallel evaluation of parameter combinations.
//!
//! Combinations are processed in chunks: within a chunk rayon fans the work
//! across cores against a shared read-only candle frame; between chunks the
//! coordinator honors pause/cancel flags, wall-clock ceilings, and invokes
//! the progress callback (where jobs hook their checkpoints). A failing
//! combination is recorded and skipped; the sweep only aborts when the
//! failure ratio passes the configured threshold.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::SweepConfig;
use crate::data::CandleFrame;
use crate::engine::core::run_template;
use crate::engine::types::{PerformanceMetrics, SimOptions};
use crate::error::CoreError;
use crate::strategy::Template;

use super::grid::ParamSet;

/// Cross-thread pause/cancel flags, checked at chunk boundaries. Running
/// combinations always finish.
#[derive(Debug, Default)]
pub struct SweepControl {
    pause: AtomicBool,
    cancel: AtomicBool,
}

impl SweepControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn clear_pause(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Minimal per-combination result: the coordinator keeps metrics, not the
/// full trade ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComboResult {
    /// Global discovery index — the deterministic tie-breaker.
    pub index: usize,
    /// Refinement round that produced this combination.
    pub round: usize,
    pub params: ParamSet,
    pub metrics: PerformanceMetrics,
    pub num_trades: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComboFailure {
    pub index: usize,
    pub round: usize,
    pub params: ParamSet,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStatus {
    Completed,
    /// The sweep-level wall clock expired; results are partial.
    CompletedPartial,
    Paused,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SweepOutcome {
    pub status: SweepStatus,
    pub results: Vec<ComboResult>,
    pub failures: Vec<ComboFailure>,
    /// Position in the combination list where processing stopped; equals the
    /// list length when the sweep completed.
    pub next_index: usize,
}

/// Borrowed evaluation context shared by every worker.
#[derive(Clone, Copy)]
pub struct SweepContext<'a> {
    pub template: &'a Template,
    pub frame: &'a CandleFrame,
    pub intraday: Option<&'a CandleFrame>,
    pub bar_ms: i64,
    pub base: &'a SimOptions,
}

/// Chunk-level progress event for observers (checkpointing, logging).
pub struct SweepProgress<'a> {
    pub round: usize,
    /// Combinations of this sweep processed so far.
    pub next_index: usize,
    pub new_results: &'a [ComboResult],
    pub new_failures: &'a [ComboFailure],
}

pub fn evaluate_combo(
    ctx: SweepContext<'_>,
    round: usize,
    index: usize,
    params: &ParamSet,
    timeout: Option<Duration>,
) -> Result<ComboResult, ComboFailure> {
    let started = Instant::now();
    let template = ctx.template.with_params(params);

    let report = run_template(
        &template,
        ctx.frame,
        ctx.intraday,
        ctx.bar_ms,
        ctx.base,
        None,
    )
    .map_err(|e| ComboFailure {
        index,
        round,
        params: params.clone(),
        kind: e.kind().to_string(),
        message: e.to_string(),
    })?;

    if timeout.is_some_and(|limit| started.elapsed() > limit) {
        return Err(ComboFailure {
            index,
            round,
            params: params.clone(),
            kind: "timeout".to_string(),
            message: "combination exceeded its wall-clock ceiling".to_string(),
        });
    }

    Ok(ComboResult {
        index,
        round,
        params: params.clone(),
        metrics: report.metrics,
        num_trades: report.trades.len(),
    })
}

/// Sweep `combos[start_at..]`, dispatching each chunk across the rayon pool.
///
/// `index_offset` shifts the global discovery index so multi-round
/// strategies keep one total order across rounds.
#[allow(clippy::too_many_arguments)]
pub fn run_sweep(
    ctx: SweepContext<'_>,
    combos: &[ParamSet],
    round: usize,
    start_at: usize,
    index_offset: usize,
    config: &SweepConfig,
    control: &SweepControl,
    deadline: Option<Instant>,
    on_progress: &mut dyn FnMut(SweepProgress<'_>),
) -> Result<SweepOutcome, CoreError> {
    let total = combos.len();
    let mut results: Vec<ComboResult> = Vec::new();
    let mut failures: Vec<ComboFailure> = Vec::new();
    let mut idx = start_at.min(total);
    let mut status = SweepStatus::Completed;

    let bar = if config.progress {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {prefix:.bold} [{bar:30.cyan/dim}] {pos}/{len} combos  {msg}")
                .expect("valid template")
                .progress_chars("=> "),
        );
        pb.set_prefix(ctx.template.name.clone());
        pb.set_position(idx as u64);
        Some(pb)
    } else {
        None
    };

    while idx < total {
        if control.cancel_requested() {
            status = SweepStatus::Cancelled;
            break;
        }
        if control.pause_requested() {
            status = SweepStatus::Paused;
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            status = SweepStatus::CompletedPartial;
            break;
        }

        let end = (idx + config.chunk_size.max(1)).min(total);
        let chunk: Vec<Result<ComboResult, ComboFailure>> = combos[idx..end]
            .par_iter()
            .enumerate()
            .map(|(k, params)| {
                evaluate_combo(ctx, round, index_offset + idx + k, params, config.combo_timeout)
            })
            .collect();

        let mut new_results = Vec::new();
        let mut new_failures = Vec::new();
        for item in chunk {
            match item {
                Ok(result) => new_results.push(result),
                Err(failure) => {
                    tracing::warn!(
                        index = failure.index,
                        kind = %failure.kind,
                        "combination failed: {}",
                        failure.message
                    );
                    new_failures.push(failure);
                }
            }
        }

        idx = end;
        if let Some(pb) = &bar {
            pb.set_position(idx as u64);
        }

        on_progress(SweepProgress {
            round,
            next_index: idx,
            new_results: &new_results,
            new_failures: &new_failures,
        });

        results.extend(new_results);
        failures.extend(new_failures);

        let evaluated = results.len() + failures.len();
        if evaluated >= 10 {
            let ratio = failures.len() as f64 / evaluated as f64;
            if ratio >= config.max_failure_ratio {
                if let Some(pb) = &bar {
                    pb.abandon_with_message("aborted");
                }
                return Err(CoreError::Internal(anyhow::anyhow!(
                    "sweep aborted: {}/{evaluated} combinations failed (threshold {})",
                    failures.len(),
                    config.max_failure_ratio
                )));
            }
        }
    }

    if let Some(pb) = &bar {
        match status {
            SweepStatus::Completed => pb.finish_with_message("done"),
            SweepStatus::CompletedPartial => pb.abandon_with_message("deadline"),
            SweepStatus::Paused => pb.abandon_with_message("paused"),
            SweepStatus::Cancelled => pb.abandon_with_message("cancelled"),
        }
    }

    Ok(SweepOutcome {
        status,
        results,
        failures,
        next_index: idx,
    })
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMetric {
    #[default]
    Sharpe,
    TotalReturn,
    ProfitFactor,
}

impl SelectionMetric {
    pub fn score(self, metrics: &PerformanceMetrics) -> f64 {
        match self {
            SelectionMetric::Sharpe => metrics.sharpe,
            SelectionMetric::TotalReturn => metrics.total_return,
            SelectionMetric::ProfitFactor => metrics.profit_factor.unwrap_or(0.0),
        }
    }
}

/// Best result under the selection metric. Ties break toward more trades,
/// then toward the earlier discovery index — a total order independent of
/// worker completion timing.
pub fn best_of<'a>(
    results: impl IntoIterator<Item = &'a ComboResult>,
    metric: SelectionMetric,
) -> Option<&'a ComboResult> {
    results.into_iter().max_by(|a, b| {
        ordered_float::OrderedFloat(metric.score(&a.metrics))
            .cmp(&ordered_float::OrderedFloat(metric.score(&b.metrics)))
            .then_with(|| a.num_trades.cmp(&b.num_trades))
            .then_with(|| b.index.cmp(&a.index))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn combo_result(index: usize, sharpe: f64, num_trades: usize) -> ComboResult {
        let mut metrics = PerformanceMetrics::empty();
        metrics.sharpe = sharpe;
        ComboResult {
            index,
            round: 0,
            params: ParamSet::new(),
            metrics,
            num_trades,
        }
    }

    #[test]
    fn best_of_prefers_higher_score() {
        let results = vec![combo_result(0, 1.0, 5), combo_result(1, 2.0, 5)];
        let best = best_of(&results, SelectionMetric::Sharpe).unwrap();
        assert_eq!(best.index, 1);
    }

    #[test]
    fn ties_break_on_trades_then_earlier_index() {
        let results = vec![
            combo_result(0, 1.0, 5),
            combo_result(1, 1.0, 9),
            combo_result(2, 1.0, 9),
        ];
        let best = best_of(&results, SelectionMetric::Sharpe).unwrap();
        assert_eq!(best.index, 1);
    }

    #[test]
    fn empty_results_no_best() {
        assert!(best_of(&[], SelectionMetric::Sharpe).is_none());
    }

    #[test]
    fn control_flags_round_trip() {
        let control = SweepControl::new();
        assert!(!control.pause_requested());
        control.request_pause();
        assert!(control.pause_requested());
        control.clear_pause();
        assert!(!control.pause_requested());
        control.request_cancel();
        assert!(control.cancel_requested());
    }
}
