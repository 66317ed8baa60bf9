pub mod grid;
pub mod refine;
pub mod sweep;

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::SweepConfig;
use crate::data::store::OhlcvStore;
use crate::engine::core::prepare_dataset;
use crate::engine::types::{BacktestRequest, DatasetInfo, RequestMode};
use crate::error::CoreError;

pub use grid::{GridSpec, ParamSet};
pub use refine::{optimize, OptimizationReport, ResumePoint, StageReport};
pub use sweep::{
    best_of, ComboFailure, ComboResult, SelectionMetric, SweepControl, SweepOutcome, SweepStatus,
};

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationResponse {
    pub run_id: String,
    pub dataset: DatasetInfo,
    pub results: BTreeMap<String, OptimizationReport>,
}

/// Synchronous entry point for `mode: optimize` requests: fetch the dataset
/// once, then sweep every template carrying an `optimization_schema`. The
/// candle frame is shared read-only across all workers; the call blocks
/// until the search finishes (long-running callers go through the job
/// manager instead).
pub async fn run_optimization(
    store: &OhlcvStore,
    req: &BacktestRequest,
    config: &SweepConfig,
    seed: u64,
) -> Result<OptimizationResponse, CoreError> {
    if req.mode != RequestMode::Optimize {
        return Err(CoreError::Internal(anyhow::anyhow!(
            "run_optimization expects mode: optimize"
        )));
    }

    // Validate everything before any data is fetched: templates compile and
    // every grid passes the explosion guard.
    let mut specs = Vec::with_capacity(req.templates.len());
    for template in &req.templates {
        crate::strategy::compile(template)?;
        let schema = template.optimization_schema.as_ref().ok_or_else(|| {
            CoreError::TemplateValidation {
                template: template.name.clone(),
                message: "optimize mode requires an optimization_schema".into(),
            }
        })?;
        let spec = GridSpec::from_schema(schema);
        spec.check_size(config.grid_limit, req.confirm_large_grid)?;
        specs.push(spec);
    }

    let dataset = prepare_dataset(store, req).await?;
    let base = dataset.sim_options(req);

    let mut results = BTreeMap::new();
    for (template, spec) in req.templates.iter().zip(specs) {
        let ctx = sweep::SweepContext {
            template,
            frame: &dataset.frame,
            intraday: dataset.intraday.as_ref(),
            bar_ms: dataset.bar_ms(),
            base: &base,
        };
        let control = SweepControl::new();
        let report = optimize(
            ctx,
            &spec,
            req.optimizer_strategy,
            seed,
            SelectionMetric::default(),
            config,
            &control,
            ResumePoint::default(),
            &mut |_| {},
        )?;
        tracing::info!(
            template = %template.name,
            evaluated = report.all_results.len(),
            failures = report.failures.len(),
            "optimization sweep finished"
        );
        results.insert(template.name.clone(), report);
    }

    Ok(OptimizationResponse {
        run_id: uuid::Uuid::new_v4().to_string(),
        dataset: dataset.dataset_info(req),
        results,
    })
}
