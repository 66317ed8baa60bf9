//! Backtest orchestration: template → compiled strategy → signals →
//! simulation → metrics, and the request-level run/compare entry point.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use garde::Validate;
use polars::prelude::DataFrame;

use crate::data::store::OhlcvStore;
use crate::data::{CandleFrame, SeriesKey, Timeframe};
use crate::error::CoreError;
use crate::strategy::{self, Template};

use super::metrics::calculate_metrics;
use super::regime::{bucket_trades, RegimeConfig};
use super::simulator::simulate;
use super::types::{
    BacktestRequest, BacktestResponse, DatasetInfo, ExecutionMode, Marker, MarkerKind,
    RequestMode, SimOptions, TemplateReport, Trade,
};

/// Run one template over a prepared frame. `base` carries the request-level
/// execution settings; the template's own stop/take override the request
/// defaults.
pub fn run_template(
    template: &Template,
    frame: &CandleFrame,
    intraday: Option<&CandleFrame>,
    bar_ms: i64,
    base: &SimOptions,
    regime: Option<&RegimeConfig>,
) -> Result<TemplateReport, CoreError> {
    let compiled = strategy::compile(template)?;
    let bound = strategy::eval::bind(&compiled, frame)?;
    let entry = bound.entry_signals();
    let exit = bound.exit_signals();

    let opts = SimOptions {
        stop_loss: compiled.stop_loss.or(base.stop_loss),
        take_profit: compiled.take_profit.or(base.take_profit),
        ..base.clone()
    };

    let (trades, equity) = simulate(
        frame,
        &entry,
        &exit,
        compiled.warmup,
        intraday,
        bar_ms,
        &opts,
    )?;

    let mut metrics = calculate_metrics(&trades, &equity, opts.cash, bar_ms);
    if let Some(config) = regime {
        metrics.regimes = bucket_trades(frame, &trades, config);
    }

    let markers = trade_markers(&trades);
    Ok(TemplateReport {
        metrics,
        trades,
        equity,
        markers,
    })
}

fn trade_markers(trades: &[Trade]) -> Vec<Marker> {
    let mut markers = Vec::with_capacity(trades.len() * 2);
    for trade in trades {
        markers.push(Marker {
            ts: trade.entry_ts,
            price: trade.entry_price,
            kind: MarkerKind::Entry,
            label: "enter_long".to_string(),
        });
        let label = match serde_json::to_value(trade.exit_reason) {
            Ok(serde_json::Value::String(s)) => s,
            _ => "exit".to_string(),
        };
        markers.push(Marker {
            ts: trade.exit_ts,
            price: trade.exit_price,
            kind: MarkerKind::Exit,
            label,
        });
    }
    markers
}

/// Parse an ISO-8601 timestamp, tolerating a bare date.
pub fn parse_request_ts(input: &str) -> Result<i64, CoreError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc).timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        let dt = date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc();
        return Ok(dt.timestamp_millis());
    }
    Err(CoreError::Internal(anyhow::anyhow!(
        "unparseable timestamp `{input}` (expected ISO-8601)"
    )))
}

/// Everything `run`/`compare`/`optimize` share: validated key, time window,
/// loaded signal frame, and the optional intraday frame. `precision` is the
/// mode the simulation will actually execute in; it is what the result
/// document reports, so consumers are never told a run was precise when the
/// intraday series turned out to be empty.
pub struct PreparedDataset {
    pub key: SeriesKey,
    pub frame: CandleFrame,
    pub intraday: Option<CandleFrame>,
    pub intraday_tf: Option<Timeframe>,
    pub precision: ExecutionMode,
    pub since_ms: i64,
    pub until_ms: Option<i64>,
}

impl PreparedDataset {
    pub fn bar_ms(&self) -> i64 {
        self.key.timeframe.duration_ms()
    }

    pub fn dataset_info(&self, req: &BacktestRequest) -> DatasetInfo {
        DatasetInfo {
            exchange: self.key.exchange.clone(),
            symbol: self.key.symbol.clone(),
            timeframe: self.key.timeframe.to_string(),
            candle_count: self.frame.len(),
            precision: self.precision,
            fill_mode: req.fill_mode,
            intraday_tf: self.intraday_tf.map(|tf| tf.to_string()),
        }
    }

    pub fn sim_options(&self, req: &BacktestRequest) -> SimOptions {
        SimOptions {
            cash: req.cash,
            fee_rate: req.fee,
            slippage: req.slippage,
            stop_loss: req.stop_pct,
            take_profit: req.take_pct,
            fill_mode: req.fill_mode,
            mode: self.precision,
            position_fraction: 1.0,
        }
    }
}

/// Validate the request, fetch the signal series (and the intraday series in
/// precise mode), and fail fast before any simulation work is scheduled.
pub async fn prepare_dataset(
    store: &OhlcvStore,
    req: &BacktestRequest,
) -> Result<PreparedDataset, CoreError> {
    req.validate().map_err(|e| CoreError::TemplateValidation {
        template: String::from("request"),
        message: format!("request validation failed: {e}"),
    })?;

    let key = SeriesKey::new(&req.exchange, &req.symbol, &req.timeframe)?;

    let intraday_tf = match (req.precision_mode, &req.intraday_tf) {
        (ExecutionMode::Precise, Some(raw)) => {
            let fine = Timeframe::parse(raw)?;
            if !fine.refines(key.timeframe) {
                return Err(CoreError::InvalidInterval {
                    interval: format!(
                        "{fine} does not refine {} (must be strictly finer and divide it)",
                        key.timeframe
                    ),
                });
            }
            Some(fine)
        }
        (ExecutionMode::Precise, None) => {
            return Err(CoreError::InvalidInterval {
                interval: "precise mode requires intraday_tf".to_string(),
            })
        }
        (ExecutionMode::Fast, _) => None,
    };

    let since_ms = parse_request_ts(&req.since)?;
    let until_ms = req.until.as_deref().map(parse_request_ts).transpose()?;

    let df = store
        .fetch_range(&req.exchange, &req.symbol, &req.timeframe, since_ms, until_ms)
        .await?;
    if df.height() == 0 {
        return Err(CoreError::InsufficientData {
            bars: 0,
            required: 1,
        });
    }
    let frame = CandleFrame::from_dataframe(&df)?;

    let intraday = match intraday_tf {
        Some(fine) => {
            let df = store
                .fetch_range(
                    &req.exchange,
                    &req.symbol,
                    fine.as_str(),
                    since_ms,
                    until_ms,
                )
                .await?;
            if df.height() == 0 {
                None
            } else {
                Some(CandleFrame::from_dataframe(&df)?)
            }
        }
        None => None,
    };

    // An exchange with no intraday data for the window cannot refine
    // anything: the run executes bar-level throughout, and the result
    // document must say so. Bars merely missing sub-candles inside an
    // otherwise-populated series still degrade per bar in the simulator.
    let (precision, intraday_tf) = if intraday.is_some() {
        (req.precision_mode, intraday_tf)
    } else {
        if let Some(fine) = intraday_tf {
            tracing::warn!(
                key = %key,
                intraday_tf = %fine,
                "intraday series is empty for the requested window; \
                 executing in fast mode"
            );
        }
        (ExecutionMode::Fast, None)
    };

    Ok(PreparedDataset {
        key,
        frame,
        intraday,
        intraday_tf,
        precision,
        since_ms,
        until_ms,
    })
}

/// Entry point for `run` and `compare` requests: every template is executed
/// over the same dataset and keyed by name in the result document.
pub async fn run_request(
    store: &OhlcvStore,
    req: &BacktestRequest,
) -> Result<BacktestResponse, CoreError> {
    if req.mode == RequestMode::Optimize {
        return Err(CoreError::Internal(anyhow::anyhow!(
            "optimize requests are handled by the optimizer entry point"
        )));
    }

    // Templates are validated before any data is fetched or work scheduled.
    for template in &req.templates {
        strategy::compile(template)?;
    }

    let dataset = prepare_dataset(store, req).await?;
    let base = dataset.sim_options(req);
    let regime = RegimeConfig::default();

    let mut results: BTreeMap<String, TemplateReport> = BTreeMap::new();
    for template in &req.templates {
        let report = run_template(
            template,
            &dataset.frame,
            dataset.intraday.as_ref(),
            dataset.bar_ms(),
            &base,
            Some(&regime),
        )?;
        tracing::info!(
            template = %template.name,
            trades = report.trades.len(),
            total_return_pct = report.metrics.total_return_pct,
            "backtest finished"
        );
        results.insert(template.name.clone(), report);
    }

    Ok(BacktestResponse {
        run_id: uuid::Uuid::new_v4().to_string(),
        dataset: dataset.dataset_info(req),
        results,
    })
}

/// Convenience for callers holding a frame already (workers, tests).
pub fn run_on_frame(
    template: &Template,
    df: &DataFrame,
    bar_ms: i64,
    base: &SimOptions,
) -> Result<TemplateReport, CoreError> {
    let frame = CandleFrame::from_dataframe(df)?;
    run_template(template, &frame, None, bar_ms, base, None)
}
