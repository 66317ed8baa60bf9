//! Optimization flows: constraint-filtered grids, job lifecycle over a
//! store-served dataset, and the checkpoint document shape.

mod common;

use std::sync::Arc;

use common::{store_with_candles, wavy_daily_candles, DAY};
use cryptolab::config::{CheckpointPolicy, SweepConfig};
use cryptolab::data::CandleFrame;
use cryptolab::engine::types::{OptimizerStrategy, SimOptions};
use cryptolab::jobs::{JobConfig, JobManager, JobStatus};
use cryptolab::optimize::{GridSpec, SelectionMetric};
use cryptolab::strategy::Template;

fn optimizable_template() -> Template {
    serde_json::from_value(serde_json::json!({
        "name": "triple_ma",
        "indicators": [
            {"source": "builtin", "name": "sma", "alias": "ma_short", "params": {"length": 5}},
            {"source": "builtin", "name": "sma", "alias": "ma_mid", "params": {"length": 20}},
            {"source": "builtin", "name": "sma", "alias": "ma_long", "params": {"length": 40}}
        ],
        "entry_logic": "crossover(ma_short, ma_mid) AND close > ma_long",
        "exit_logic": "crossunder(ma_short, ma_mid)",
        "stop_loss": null,
        "take_profit": null,
        "optimization_schema": {
            "parameters": {
                "ma_short": {"min": 5, "max": 15, "step": 5, "default": 5},
                "ma_mid": {"min": 10, "max": 30, "step": 10, "default": 20},
                "ma_long": {"min": 20, "max": 60, "step": 20, "default": 40}
            },
            "correlated_groups": [["ma_short", "ma_mid", "ma_long"]]
        }
    }))
    .unwrap()
}

#[test]
fn constraint_filter_keeps_ten_of_twentyseven() {
    let template = optimizable_template();
    let spec = GridSpec::from_schema(template.optimization_schema.as_ref().unwrap());

    assert_eq!(spec.estimated_size(), 27);
    let combos = spec.enumerate(0);
    assert_eq!(combos.len(), 10);

    // Spot-check the documented members of the filtered grid
    let has = |s: f64, m: f64, l: f64| {
        combos.iter().any(|c| {
            c["ma_short"] == s && c["ma_mid"] == m && c["ma_long"] == l
        })
    };
    assert!(has(5.0, 10.0, 20.0));
    assert!(has(5.0, 20.0, 40.0));
    assert!(has(10.0, 20.0, 40.0));
    assert!(!has(15.0, 10.0, 20.0));
    for combo in &combos {
        assert!(combo["ma_short"] < combo["ma_mid"]);
        assert!(combo["ma_mid"] < combo["ma_long"]);
    }
}

async fn frame_from_store(days: usize) -> (Arc<CandleFrame>, tempfile::TempDir) {
    let (store, _client, dir) = store_with_candles("test", wavy_daily_candles(days));
    let df = store
        .fetch_range("test", "BTC/USDT", "1d", 0, Some((days as i64 - 1) * DAY))
        .await
        .unwrap();
    (Arc::new(CandleFrame::from_dataframe(&df).unwrap()), dir)
}

fn manager(dir: &std::path::Path) -> JobManager {
    JobManager::new(
        dir.to_path_buf(),
        SweepConfig {
            chunk_size: 5,
            combo_timeout: None,
            ..SweepConfig::default()
        },
        CheckpointPolicy::default(),
    )
}

fn job(strategy: OptimizerStrategy, seed: u64) -> JobConfig {
    JobConfig {
        template: optimizable_template(),
        strategy,
        metric: SelectionMetric::Sharpe,
        sim: SimOptions {
            cash: 1000.0,
            fee_rate: 0.00075,
            ..SimOptions::default()
        },
        bar_ms: DAY,
        seed,
        confirm_large_grid: false,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn optimize_request_round_trip() {
    let (store, _client, _dir) = store_with_candles("test", wavy_daily_candles(260));

    let mut req: cryptolab::engine::types::BacktestRequest =
        serde_json::from_value(serde_json::json!({
            "mode": "optimize",
            "exchange": "test",
            "symbol": "BTC/USDT",
            "timeframe": "1d",
            "since": "1970-01-01",
            "until": chrono::DateTime::from_timestamp_millis(259 * DAY).unwrap().to_rfc3339(),
            "templates": [serde_json::to_value(optimizable_template()).unwrap()],
            "cash": 1000.0,
            "fee": 0.00075,
            "slippage": 0.0,
            "stop_pct": null,
            "take_pct": null,
            "optimizer_strategy": "grid"
        }))
        .unwrap();

    let resp = cryptolab::optimize::run_optimization(&store, &req, &SweepConfig::default(), 0)
        .await
        .unwrap();
    assert_eq!(resp.dataset.candle_count, 260);
    let report = &resp.results["triple_ma"];
    assert_eq!(report.all_results.len(), 10);
    assert!(report.best.is_some());

    // An oversized grid without confirmation is rejected before any work
    let tight = SweepConfig {
        grid_limit: 5,
        ..SweepConfig::default()
    };
    let err = cryptolab::optimize::run_optimization(&store, &req, &tight, 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "grid_explosion");

    req.confirm_large_grid = true;
    assert!(
        cryptolab::optimize::run_optimization(&store, &req, &tight, 0)
            .await
            .is_ok()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn grid_job_over_store_data_completes() {
    common::init_tracing();
    let (frame, _data_dir) = frame_from_store(260).await;
    let jobs_dir = tempfile::tempdir().unwrap();
    let m = manager(jobs_dir.path());

    let job_id = m
        .start(job(OptimizerStrategy::Grid, 42), frame, None)
        .unwrap();
    let done = m.wait(&job_id).unwrap();

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.partial_results.len(), 10);
    let best = done.best_so_far.expect("a best combination");
    assert!(best.params["ma_short"] < best.params["ma_mid"]);
    assert!(best.params["ma_mid"] < best.params["ma_long"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn coarse_to_fine_job_refines_past_round_zero() {
    let (frame, _data_dir) = frame_from_store(260).await;
    let jobs_dir = tempfile::tempdir().unwrap();
    let m = manager(jobs_dir.path());

    let job_id = m
        .start(job(OptimizerStrategy::CoarseToFine, 0), frame, None)
        .unwrap();
    let done = m.wait(&job_id).unwrap();

    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.best_so_far.is_some());
    // At least one refinement round ran after the coarse pass
    assert!(
        done.partial_results.iter().any(|r| r.round > 0),
        "expected refined rounds, got {} round-0 results",
        done.partial_results.len()
    );
    // Constraints hold everywhere, including refined rounds
    for result in &done.partial_results {
        assert!(result.params["ma_short"] < result.params["ma_mid"]);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn coordinate_descent_job_converges() {
    let (frame, _data_dir) = frame_from_store(260).await;
    let jobs_dir = tempfile::tempdir().unwrap();
    let m = manager(jobs_dir.path());

    let job_id = m
        .start(job(OptimizerStrategy::CoordinateDescent, 0), frame, None)
        .unwrap();
    let done = m.wait(&job_id).unwrap();

    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.converged, "descent should converge");
    assert!(done.best_so_far.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoint_document_carries_required_fields() {
    let (frame, _data_dir) = frame_from_store(120).await;
    let jobs_dir = tempfile::tempdir().unwrap();
    let m = manager(jobs_dir.path());

    let job_id = m
        .start(job(OptimizerStrategy::Grid, 42), frame, None)
        .unwrap();
    m.wait(&job_id).unwrap();

    let raw = std::fs::read_to_string(jobs_dir.path().join(format!("{job_id}.json"))).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    for field in [
        "job_id",
        "config",
        "grid_spec",
        "seed",
        "round_idx",
        "current_iteration",
        "total_iterations",
        "partial_results",
        "best_so_far",
        "status",
        "updated_at",
    ] {
        assert!(doc.get(field).is_some(), "checkpoint missing `{field}`");
    }
    assert_eq!(doc["status"], "COMPLETED");
    assert_eq!(doc["seed"], 42);
}

#[tokio::test(flavor = "multi_thread")]
async fn every_combination_is_accounted_for() {
    // results + failures always partition the grid, whatever happens to
    // individual combinations.
    let (frame, _data_dir) = frame_from_store(120).await;
    let jobs_dir = tempfile::tempdir().unwrap();
    let m = manager(jobs_dir.path());

    let mut config = job(OptimizerStrategy::Grid, 0);
    config.template = serde_json::from_value(serde_json::json!({
        "name": "skewed",
        "indicators": [
            {"source": "builtin", "name": "sma", "alias": "fast", "params": {"length": 5}},
            {"source": "builtin", "name": "sma", "alias": "slow", "params": {"length": 20}}
        ],
        "entry_logic": "crossover(fast, slow)",
        "exit_logic": "crossunder(fast, slow)",
        "stop_loss": null,
        "take_profit": null,
        "optimization_schema": {
            "parameters": {
                "fast": {"min": 4, "max": 12, "step": 4, "default": 8},
                "slow": {"min": 16, "max": 32, "step": 8, "default": 24}
            }
        }
    }))
    .unwrap();

    let job_id = m.start(config, frame, None).unwrap();
    let done = m.wait(&job_id).unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(
        done.partial_results.len() + done.failures.len(),
        done.total_iterations
    );
}
