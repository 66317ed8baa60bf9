use std::collections::BTreeMap;

use garde::Validate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::strategy::Template;

/// When an entry signal turns into a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FillMode {
    /// Fill at the signal bar's close.
    #[default]
    Close,
    /// Fill at the next bar's open.
    NextOpen,
}

/// Stop/target resolution granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Bar-level high/low checks. Cannot tell which of stop and target was
    /// touched first inside one bar; the favorable (target-first) order is
    /// assumed, so tight stops read optimistic.
    #[default]
    Fast,
    /// Walk a finer-timeframe series through each bar to resolve the
    /// intra-bar ordering deterministically.
    Precise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    SignalExit,
    StopLoss,
    TakeProfit,
    EndOfData,
}

/// One round trip. Fees are inside `pnl`: cost includes the entry fee,
/// proceeds are net of the exit fee.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Trade {
    pub entry_ts: i64,
    pub entry_price: f64,
    pub exit_ts: i64,
    pub exit_price: f64,
    pub qty: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub exit_reason: ExitReason,
    pub held_bars: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
pub struct EquityPoint {
    pub ts: i64,
    pub cash: f64,
    pub position_value: f64,
    pub equity: f64,
}

/// Simulator knobs. Stop/take here are the *effective* values after the
/// template override (template-level stop wins over the request default).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimOptions {
    pub cash: f64,
    /// Fee rate on notional, charged symmetrically at entry and exit.
    pub fee_rate: f64,
    /// Fractional price slippage applied against market fills.
    pub slippage: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub fill_mode: FillMode,
    pub mode: ExecutionMode,
    /// Fraction of current cash deployed per entry.
    pub position_fraction: f64,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            cash: 10_000.0,
            fee_rate: 0.00075,
            slippage: 0.0,
            stop_loss: None,
            take_profit: None,
            fill_mode: FillMode::Close,
            mode: ExecutionMode::Fast,
            position_fraction: 1.0,
        }
    }
}

/// Aggregate statistics over one backtest. Ratios are fractions; `_pct`
/// variants are derived at this boundary for display.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub total_return_pct: f64,
    pub cagr: f64,
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub sharpe: f64,
    pub win_rate: f64,
    pub num_trades: usize,
    /// `None` when undefined (no trades) — serialized as `null`, never NaN.
    pub profit_factor: Option<f64>,
    pub avg_win: f64,
    /// Mean losing-trade PnL, a negative number.
    pub avg_loss: f64,
    pub expectancy: f64,
    pub max_consecutive_losses: usize,
    /// Per-regime performance buckets; empty when regime labeling was off.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regimes: Vec<RegimeBucket>,
}

impl PerformanceMetrics {
    pub fn empty() -> Self {
        Self {
            total_return: 0.0,
            total_return_pct: 0.0,
            cagr: 0.0,
            max_drawdown: 0.0,
            max_drawdown_pct: 0.0,
            sharpe: 0.0,
            win_rate: 0.0,
            num_trades: 0,
            profit_factor: None,
            avg_win: 0.0,
            avg_loss: 0.0,
            expectancy: 0.0,
            max_consecutive_losses: 0,
            regimes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RegimeBucket {
    pub regime: String,
    pub num_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
}

// ---------------------------------------------------------------------------
// Request / response shapes (normative; transport belongs to callers)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    Run,
    Compare,
    Optimize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerStrategy {
    Grid,
    #[default]
    CoarseToFine,
    CoordinateDescent,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct BacktestRequest {
    #[garde(skip)]
    pub mode: RequestMode,
    #[garde(length(min = 1))]
    pub exchange: String,
    #[garde(length(min = 1))]
    pub symbol: String,
    #[garde(length(min = 1))]
    pub timeframe: String,
    /// ISO-8601 start of the window.
    #[garde(length(min = 1))]
    pub since: String,
    /// ISO-8601 end of the window; `null` means "now".
    #[garde(skip)]
    pub until: Option<String>,
    #[garde(length(min = 1), dive)]
    pub templates: Vec<Template>,
    #[garde(range(min = 0.01))]
    pub cash: f64,
    #[garde(range(min = 0.0, max = 0.1))]
    pub fee: f64,
    #[garde(range(min = 0.0, max = 0.1))]
    pub slippage: f64,
    /// Request-level defaults; a template's own stop/take wins.
    #[garde(inner(range(min = 0.0001, max = 1.0)))]
    pub stop_pct: Option<f64>,
    #[garde(inner(range(min = 0.0001)))]
    pub take_pct: Option<f64>,
    #[serde(default)]
    #[garde(skip)]
    pub fill_mode: FillMode,
    #[serde(default)]
    #[garde(skip)]
    pub precision_mode: ExecutionMode,
    /// Required when `precision_mode` is `precise`; must be strictly finer
    /// than `timeframe` and divide it evenly.
    #[serde(default)]
    #[garde(skip)]
    pub intraday_tf: Option<String>,
    /// Acknowledges a grid larger than the configured hard limit.
    #[serde(default)]
    #[garde(skip)]
    pub confirm_large_grid: bool,
    #[serde(default)]
    #[garde(skip)]
    pub optimizer_strategy: OptimizerStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DatasetInfo {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: String,
    pub candle_count: usize,
    pub precision: ExecutionMode,
    pub fill_mode: FillMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intraday_tf: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    Entry,
    Exit,
}

/// Chart annotation for one fill.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Marker {
    pub ts: i64,
    pub price: f64,
    pub kind: MarkerKind,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TemplateReport {
    pub metrics: PerformanceMetrics,
    pub trades: Vec<Trade>,
    pub equity: Vec<EquityPoint>,
    pub markers: Vec<Marker>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BacktestResponse {
    pub run_id: String,
    pub dataset: DatasetInfo,
    pub results: BTreeMap<String, TemplateReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> BacktestRequest {
        serde_json::from_value(serde_json::json!({
            "mode": "run",
            "exchange": "binance",
            "symbol": "BTC/USDT",
            "timeframe": "1d",
            "since": "2024-01-01T00:00:00Z",
            "until": null,
            "templates": [{
                "name": "t",
                "indicators": [],
                "entry_logic": "close > open",
                "exit_logic": "close < open",
                "stop_loss": null,
                "take_profit": null
            }],
            "cash": 1000.0,
            "fee": 0.00075,
            "slippage": 0.0,
            "stop_pct": null,
            "take_pct": null
        }))
        .unwrap()
    }

    #[test]
    fn exit_reason_serializes_snake_case() {
        let json = serde_json::to_string(&ExitReason::StopLoss).unwrap();
        assert_eq!(json, "\"stop_loss\"");
        let json = serde_json::to_string(&ExitReason::EndOfData).unwrap();
        assert_eq!(json, "\"end_of_data\"");
    }

    #[test]
    fn undefined_profit_factor_is_null_not_nan() {
        let m = PerformanceMetrics::empty();
        let json = serde_json::to_value(&m).unwrap();
        assert!(json["profit_factor"].is_null());
        assert!(!json.to_string().contains("NaN"));
    }

    #[test]
    fn request_defaults_fill_and_precision() {
        let req = base_request();
        assert_eq!(req.fill_mode, FillMode::Close);
        assert_eq!(req.precision_mode, ExecutionMode::Fast);
        assert!(!req.confirm_large_grid);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn request_rejects_negative_fee() {
        let mut req = base_request();
        req.fee = -0.1;
        assert!(req.validate().is_err());
    }

    #[test]
    fn request_rejects_empty_template_list() {
        let mut req = base_request();
        req.templates.clear();
        assert!(req.validate().is_err());
    }
}
