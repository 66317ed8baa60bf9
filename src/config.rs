use std::path::PathBuf;
use std::time::Duration;

/// Root directories for the candle store and job checkpoints.
///
/// | Env Var | Default | Purpose |
/// |---------|---------|---------|
/// | `CRYPTOLAB_DATA_ROOT` | `~/.cryptolab/store` | Parquet candle cache |
/// | `CRYPTOLAB_JOBS_ROOT` | `~/.cryptolab/jobs` | Optimization job checkpoints |
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub data_root: PathBuf,
    pub jobs_root: PathBuf,
}

impl CoreConfig {
    pub fn from_env() -> Self {
        let data_root = std::env::var("CRYPTOLAB_DATA_ROOT")
            .map_or_else(|_| default_home().join(".cryptolab").join("store"), PathBuf::from);
        let jobs_root = std::env::var("CRYPTOLAB_JOBS_ROOT")
            .map_or_else(|_| default_home().join(".cryptolab").join("jobs"), PathBuf::from);
        Self {
            data_root,
            jobs_root,
        }
    }
}

fn default_home() -> PathBuf {
    std::env::var("HOME").map_or_else(|_| PathBuf::from("/tmp"), PathBuf::from)
}

/// Knobs for a parameter sweep. Everything here has a conservative default so
/// a bare request behaves sensibly.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Hard ceiling on the raw grid size; a larger grid fails with
    /// `grid_explosion` unless the request explicitly confirms.
    pub grid_limit: usize,
    /// Combinations evaluated per parallel batch. Checkpoints, pause and
    /// cancel are honored at batch boundaries.
    pub chunk_size: usize,
    /// Wall-clock ceiling for one combination.
    pub combo_timeout: Option<Duration>,
    /// Wall-clock ceiling for the whole sweep; on expiry the sweep finalizes
    /// with partial results.
    pub sweep_timeout: Option<Duration>,
    /// Abort the sweep once this fraction of evaluated combinations failed.
    pub max_failure_ratio: f64,
    /// Maximum rounds for the iterative refinement strategies.
    pub max_rounds: usize,
    /// Refinement seeds kept per round in coarse-to-fine search.
    pub top_k: usize,
    /// Render an indicatif progress bar while sweeping.
    pub progress: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            grid_limit: 500,
            chunk_size: 50,
            combo_timeout: Some(Duration::from_secs(60)),
            sweep_timeout: None,
            max_failure_ratio: 0.5,
            max_rounds: 10,
            top_k: 3,
            progress: false,
        }
    }
}

/// Checkpoint cadence for long-running jobs: whichever of the two thresholds
/// trips first triggers a write.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    pub every_iterations: usize,
    pub every_elapsed: Duration,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            every_iterations: 50,
            every_elapsed: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_defaults() {
        let c = SweepConfig::default();
        assert_eq!(c.grid_limit, 500);
        assert_eq!(c.chunk_size, 50);
        assert!(c.max_failure_ratio > 0.0 && c.max_failure_ratio <= 1.0);
    }

    #[test]
    fn checkpoint_defaults() {
        let p = CheckpointPolicy::default();
        assert_eq!(p.every_iterations, 50);
        assert_eq!(p.every_elapsed, Duration::from_secs(60));
    }
}
