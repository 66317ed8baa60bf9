use serde::Serialize;
use thiserror::Error;

/// Every failure a caller can observe. Each variant carries a stable `kind`
/// identifier (see [`CoreError::kind`]) so the request layer can map errors
/// without string-matching messages.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unrecognized symbol `{symbol}`")]
    InvalidSymbol { symbol: String },

    #[error("unrecognized interval `{interval}`")]
    InvalidInterval { interval: String },

    #[error("download failed for {exchange}:{symbol}: {message}")]
    Download {
        exchange: String,
        symbol: String,
        message: String,
        /// Last timestamp up to which the local store is contiguous, if any
        /// candles were persisted before the failure.
        last_complete_ts: Option<i64>,
    },

    #[error("template `{template}` is invalid: {message}")]
    TemplateValidation { template: String, message: String },

    #[error("insufficient data: {bars} bars in window, {required} required")]
    InsufficientData { bars: usize, required: usize },

    #[error("simulation failed at bar {bar}: {message}")]
    Simulation { bar: usize, message: String },

    #[error("grid of {estimated} combinations exceeds the limit of {limit}; pass confirm_large_grid to proceed")]
    GridExplosion { estimated: usize, limit: usize },

    #[error("{scope} exceeded its wall-clock ceiling")]
    Timeout { scope: String },

    #[error("cancelled")]
    Cancelled,

    #[error("unknown job `{job_id}`")]
    UnknownJob { job_id: String },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Stable identifier for this error class.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidSymbol { .. } => "invalid_symbol",
            CoreError::InvalidInterval { .. } => "invalid_interval",
            CoreError::Download { .. } => "download_error",
            CoreError::TemplateValidation { .. } => "template_validation_error",
            CoreError::InsufficientData { .. } => "insufficient_data",
            CoreError::Simulation { .. } => "simulation_error",
            CoreError::GridExplosion { .. } => "grid_explosion",
            CoreError::Timeout { .. } => "timeout",
            CoreError::Cancelled => "cancelled",
            CoreError::UnknownJob { .. } => "unknown_job",
            CoreError::Internal(_) => "internal_error",
        }
    }

    /// Kind-specific structured details for the error body.
    fn details(&self) -> serde_json::Value {
        match self {
            CoreError::InvalidSymbol { symbol } => serde_json::json!({ "symbol": symbol }),
            CoreError::InvalidInterval { interval } => serde_json::json!({ "interval": interval }),
            CoreError::Download {
                exchange,
                symbol,
                last_complete_ts,
                ..
            } => serde_json::json!({
                "exchange": exchange,
                "symbol": symbol,
                "last_complete_ts": last_complete_ts,
            }),
            CoreError::TemplateValidation { template, .. } => {
                serde_json::json!({ "template": template })
            }
            CoreError::InsufficientData { bars, required } => {
                serde_json::json!({ "bars": bars, "required": required })
            }
            CoreError::Simulation { bar, .. } => serde_json::json!({ "bar": bar }),
            CoreError::GridExplosion { estimated, limit } => {
                serde_json::json!({ "estimated": estimated, "limit": limit })
            }
            CoreError::Timeout { scope } => serde_json::json!({ "scope": scope }),
            CoreError::UnknownJob { job_id } => serde_json::json!({ "job_id": job_id }),
            CoreError::Cancelled | CoreError::Internal(_) => serde_json::Value::Null,
        }
    }

    /// The caller-visible error document: `{kind, message, details}`.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
            details: self.details(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
    pub details: serde_json::Value,
}

impl From<polars::error::PolarsError> for CoreError {
    fn from(e: polars::error::PolarsError) -> Self {
        CoreError::Internal(anyhow::anyhow!(e))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Internal(anyhow::anyhow!(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        let e = CoreError::InvalidSymbol {
            symbol: "???".into(),
        };
        assert_eq!(e.kind(), "invalid_symbol");

        let e = CoreError::GridExplosion {
            estimated: 10_000,
            limit: 500,
        };
        assert_eq!(e.kind(), "grid_explosion");
    }

    #[test]
    fn body_carries_structured_details() {
        let e = CoreError::InsufficientData {
            bars: 3,
            required: 200,
        };
        let body = e.to_body();
        assert_eq!(body.kind, "insufficient_data");
        assert_eq!(body.details["required"], 200);
    }

    #[test]
    fn body_serializes_without_nan() {
        let e = CoreError::Cancelled;
        let json = serde_json::to_string(&e.to_body()).unwrap();
        assert!(json.contains("\"cancelled\""));
    }
}
