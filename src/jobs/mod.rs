//! Long-running optimization jobs.
//!
//! Each `start` spawns a worker thread that drives the optimizer and
//! checkpoints its progress to `<jobs_root>/<job_id>.json`, written as a
//! temp file and renamed, so a crash never leaves a torn checkpoint. Pause
//! and cancel are atomic flags honored at chunk boundaries; a resume reloads
//! the checkpoint, regenerates the grid deterministically from
//! `(config, seed)`, and skips the combinations already evaluated, which is
//! what makes an interrupted run land on the same answer as an
//! uninterrupted one.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::{CheckpointPolicy, CoreConfig, SweepConfig};
use crate::data::CandleFrame;
use crate::engine::types::{OptimizerStrategy, SimOptions};
use crate::error::CoreError;
use crate::optimize::{
    best_of, ComboFailure, ComboResult, GridSpec, ResumePoint, SelectionMetric, SweepControl,
    SweepStatus,
};
use crate::strategy::Template;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Paused,
    Completed,
    CompletedPartial,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedPartial | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Everything needed to re-run the job from nothing but this document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub template: Template,
    pub strategy: OptimizerStrategy,
    pub metric: SelectionMetric,
    pub sim: SimOptions,
    pub bar_ms: i64,
    pub seed: u64,
    #[serde(default)]
    pub confirm_large_grid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCheckpoint {
    pub job_id: String,
    pub config: JobConfig,
    pub grid_spec: GridSpec,
    pub seed: u64,
    /// Refinement round (or descent stage) in progress.
    pub round_idx: usize,
    /// Combinations of the current round already evaluated — the resume
    /// skip count.
    pub current_iteration: usize,
    /// Size of the initial round's combination list.
    pub total_iterations: usize,
    pub partial_results: Vec<ComboResult>,
    pub failures: Vec<ComboFailure>,
    pub best_so_far: Option<ComboResult>,
    pub converged: bool,
    pub status: JobStatus,
    pub updated_at: String,
}

struct JobHandle {
    control: Arc<SweepControl>,
    state: Arc<Mutex<JobCheckpoint>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

pub struct JobManager {
    jobs_root: PathBuf,
    sweep_config: SweepConfig,
    policy: CheckpointPolicy,
    live: DashMap<String, Arc<JobHandle>>,
}

impl JobManager {
    pub fn new(jobs_root: PathBuf, sweep_config: SweepConfig, policy: CheckpointPolicy) -> Self {
        Self {
            jobs_root,
            sweep_config,
            policy,
            live: DashMap::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            CoreConfig::from_env().jobs_root,
            SweepConfig::default(),
            CheckpointPolicy::default(),
        )
    }

    fn checkpoint_path(&self, job_id: &str) -> PathBuf {
        self.jobs_root.join(format!("{job_id}.json"))
    }

    fn write_checkpoint(&self, checkpoint: &JobCheckpoint) -> Result<(), CoreError> {
        std::fs::create_dir_all(&self.jobs_root)?;
        let path = self.checkpoint_path(&checkpoint.job_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_checkpoint(&self, job_id: &str) -> Result<JobCheckpoint, CoreError> {
        let path = self.checkpoint_path(job_id);
        if !path.exists() {
            return Err(CoreError::UnknownJob {
                job_id: job_id.to_string(),
            });
        }
        let body = std::fs::read(&path)?;
        serde_json::from_slice(&body).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))
    }

    /// Start a new optimization job over an already-loaded frame.
    /// Returns the job id immediately; the sweep runs on a worker thread.
    pub fn start(
        &self,
        config: JobConfig,
        frame: Arc<CandleFrame>,
        intraday: Option<Arc<CandleFrame>>,
    ) -> Result<String, CoreError> {
        let schema = config
            .template
            .optimization_schema
            .as_ref()
            .ok_or_else(|| CoreError::TemplateValidation {
                template: config.template.name.clone(),
                message: "template has no optimization_schema".into(),
            })?;
        let grid_spec = GridSpec::from_schema(schema);
        grid_spec.check_size(self.sweep_config.grid_limit, config.confirm_large_grid)?;

        let job_id = uuid::Uuid::new_v4().to_string();
        let total_iterations = grid_spec.enumerate(config.seed).len();
        let checkpoint = JobCheckpoint {
            job_id: job_id.clone(),
            seed: config.seed,
            grid_spec,
            config,
            round_idx: 0,
            current_iteration: 0,
            total_iterations,
            partial_results: Vec::new(),
            failures: Vec::new(),
            best_so_far: None,
            converged: false,
            status: JobStatus::Running,
            updated_at: Utc::now().to_rfc3339(),
        };
        self.write_checkpoint(&checkpoint)?;
        self.spawn_worker(checkpoint, ResumePoint::default(), frame, intraday);
        Ok(job_id)
    }

    /// Resume a paused (or interrupted) job from its checkpoint. The grid is
    /// regenerated from `(config, seed)`; previously evaluated combinations
    /// are skipped and their results reused.
    pub fn resume(
        &self,
        job_id: &str,
        frame: Arc<CandleFrame>,
        intraday: Option<Arc<CandleFrame>>,
    ) -> Result<(), CoreError> {
        if let Some(handle) = self.live.get(job_id) {
            let running = handle
                .worker
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .as_ref()
                .is_some_and(|w| !w.is_finished());
            if running {
                return Err(CoreError::Internal(anyhow::anyhow!(
                    "job {job_id} is still running"
                )));
            }
        }

        let mut checkpoint = self.read_checkpoint(job_id)?;
        if checkpoint.status.is_terminal() {
            return Err(CoreError::Internal(anyhow::anyhow!(
                "job {job_id} already finished with status {:?}",
                checkpoint.status
            )));
        }

        let resume = ResumePoint {
            round: checkpoint.round_idx,
            iteration: checkpoint.current_iteration,
            results: checkpoint.partial_results.clone(),
            failures: checkpoint.failures.clone(),
        };
        checkpoint.status = JobStatus::Running;
        checkpoint.updated_at = Utc::now().to_rfc3339();
        self.write_checkpoint(&checkpoint)?;
        self.spawn_worker(checkpoint, resume, frame, intraday);
        Ok(())
    }

    fn spawn_worker(
        &self,
        checkpoint: JobCheckpoint,
        resume: ResumePoint,
        frame: Arc<CandleFrame>,
        intraday: Option<Arc<CandleFrame>>,
    ) {
        let job_id = checkpoint.job_id.clone();
        let control = Arc::new(SweepControl::new());
        let state = Arc::new(Mutex::new(checkpoint));
        let handle = Arc::new(JobHandle {
            control: Arc::clone(&control),
            state: Arc::clone(&state),
            worker: Mutex::new(None),
        });
        self.live.insert(job_id.clone(), Arc::clone(&handle));

        let manager = ManagerIo {
            jobs_root: self.jobs_root.clone(),
        };
        let sweep_config = self.sweep_config.clone();
        let policy = self.policy.clone();

        let worker = std::thread::spawn(move || {
            run_job_worker(
                &manager,
                &sweep_config,
                &policy,
                &state,
                &control,
                resume,
                &frame,
                intraday.as_deref(),
            );
        });
        *handle
            .worker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(worker);
    }

    /// Current job document: live state when the job is in memory, the
    /// on-disk checkpoint otherwise.
    pub fn status(&self, job_id: &str) -> Result<JobCheckpoint, CoreError> {
        if let Some(handle) = self.live.get(job_id) {
            let state = handle
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            return Ok(state.clone());
        }
        self.read_checkpoint(job_id)
    }

    /// Request a pause. Running combinations finish; the worker writes a
    /// final checkpoint with status `PAUSED`.
    pub fn pause(&self, job_id: &str) -> Result<(), CoreError> {
        let handle = self.live.get(job_id).ok_or_else(|| CoreError::UnknownJob {
            job_id: job_id.to_string(),
        })?;
        handle.control.request_pause();
        Ok(())
    }

    /// Request cancellation; the job lands in status `CANCELLED` with a
    /// final checkpoint.
    pub fn cancel(&self, job_id: &str) -> Result<(), CoreError> {
        let handle = self.live.get(job_id).ok_or_else(|| CoreError::UnknownJob {
            job_id: job_id.to_string(),
        })?;
        handle.control.request_cancel();
        Ok(())
    }

    /// Final result document; fails while the job is still running.
    pub fn result(&self, job_id: &str) -> Result<JobCheckpoint, CoreError> {
        let checkpoint = self.status(job_id)?;
        if checkpoint.status == JobStatus::Running {
            return Err(CoreError::Internal(anyhow::anyhow!(
                "job {job_id} is still running"
            )));
        }
        Ok(checkpoint)
    }

    /// Remove the job and its checkpoint. The only way a checkpoint dies.
    pub fn delete(&self, job_id: &str) -> Result<(), CoreError> {
        if let Some((_, handle)) = self.live.remove(job_id) {
            handle.control.request_cancel();
            let worker = handle
                .worker
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            if let Some(worker) = worker {
                let _ = worker.join();
            }
        }
        let path = self.checkpoint_path(job_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Build and start a job straight from an `optimize` request: fetches
    /// the dataset, then runs the request's first template as a managed job.
    pub async fn start_request(
        &self,
        store: &crate::data::store::OhlcvStore,
        req: &crate::engine::types::BacktestRequest,
        seed: u64,
    ) -> Result<String, CoreError> {
        let template = req
            .templates
            .first()
            .ok_or_else(|| CoreError::TemplateValidation {
                template: "request".into(),
                message: "optimize request carries no template".into(),
            })?
            .clone();
        crate::strategy::compile(&template)?;

        let dataset = crate::engine::core::prepare_dataset(store, req).await?;
        let config = JobConfig {
            sim: dataset.sim_options(req),
            bar_ms: dataset.bar_ms(),
            template,
            strategy: req.optimizer_strategy,
            metric: SelectionMetric::default(),
            seed,
            confirm_large_grid: req.confirm_large_grid,
        };
        self.start(
            config,
            Arc::new(dataset.frame),
            dataset.intraday.map(Arc::new),
        )
    }

    /// Block until the worker thread exits (tests and synchronous callers).
    pub fn wait(&self, job_id: &str) -> Result<JobCheckpoint, CoreError> {
        let worker = {
            let handle = self.live.get(job_id).ok_or_else(|| CoreError::UnknownJob {
                job_id: job_id.to_string(),
            })?;
            let worker = handle
                .worker
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            worker
        };
        if let Some(worker) = worker {
            worker
                .join()
                .map_err(|_| CoreError::Internal(anyhow::anyhow!("job worker panicked")))?;
        }
        self.status(job_id)
    }
}

/// The slice of the manager a worker thread needs: checkpoint I/O only.
struct ManagerIo {
    jobs_root: PathBuf,
}

impl ManagerIo {
    fn write(&self, checkpoint: &JobCheckpoint) {
        let write = || -> Result<(), CoreError> {
            std::fs::create_dir_all(&self.jobs_root)?;
            let path = self.jobs_root.join(format!("{}.json", checkpoint.job_id));
            let tmp = path.with_extension("json.tmp");
            let body = serde_json::to_vec_pretty(checkpoint)
                .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
            std::fs::write(&tmp, body)?;
            std::fs::rename(&tmp, &path)?;
            Ok(())
        };
        if let Err(e) = write() {
            // Keep the last good checkpoint rather than killing the sweep.
            tracing::warn!(job_id = %checkpoint.job_id, "checkpoint write failed: {e}");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_job_worker(
    io: &ManagerIo,
    sweep_config: &SweepConfig,
    policy: &CheckpointPolicy,
    state: &Arc<Mutex<JobCheckpoint>>,
    control: &SweepControl,
    resume: ResumePoint,
    frame: &CandleFrame,
    intraday: Option<&CandleFrame>,
) {
    let (config, grid_spec, job_id) = {
        let checkpoint = state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        (
            checkpoint.config.clone(),
            checkpoint.grid_spec.clone(),
            checkpoint.job_id.clone(),
        )
    };

    tracing::info!(job_id = %job_id, strategy = ?config.strategy, "optimization job started");

    let ctx = crate::optimize::sweep::SweepContext {
        template: &config.template,
        frame,
        intraday,
        bar_ms: config.bar_ms,
        base: &config.sim,
    };

    let mut since_last_write = 0usize;
    let mut last_write = Instant::now();

    let mut on_progress = |progress: crate::optimize::sweep::SweepProgress<'_>| {
        let mut checkpoint = state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        checkpoint.round_idx = progress.round;
        checkpoint.current_iteration = progress.next_index;
        checkpoint
            .partial_results
            .extend_from_slice(progress.new_results);
        checkpoint
            .failures
            .extend_from_slice(progress.new_failures);
        checkpoint.best_so_far =
            best_of(&checkpoint.partial_results, checkpoint.config.metric).cloned();
        checkpoint.updated_at = Utc::now().to_rfc3339();

        since_last_write += progress.new_results.len() + progress.new_failures.len();
        if since_last_write >= policy.every_iterations || last_write.elapsed() >= policy.every_elapsed
        {
            io.write(&checkpoint);
            since_last_write = 0;
            last_write = Instant::now();
        }
    };

    let outcome = crate::optimize::optimize(
        ctx,
        &grid_spec,
        config.strategy,
        config.seed,
        config.metric,
        sweep_config,
        control,
        resume,
        &mut on_progress,
    );

    let mut checkpoint = state
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    match outcome {
        Ok(report) => {
            checkpoint.status = match report.status {
                SweepStatus::Completed => JobStatus::Completed,
                SweepStatus::CompletedPartial => JobStatus::CompletedPartial,
                SweepStatus::Paused => JobStatus::Paused,
                SweepStatus::Cancelled => JobStatus::Cancelled,
            };
            checkpoint.round_idx = report.next_round;
            checkpoint.current_iteration = report.next_iteration;
            checkpoint.partial_results = report.all_results;
            checkpoint.failures = report.failures;
            checkpoint.converged = report.converged;
            checkpoint.best_so_far = report.best;
            tracing::info!(
                job_id = %checkpoint.job_id,
                status = ?checkpoint.status,
                evaluated = checkpoint.partial_results.len(),
                "optimization job finished"
            );
        }
        Err(e) => {
            checkpoint.status = JobStatus::Failed;
            tracing::warn!(job_id = %checkpoint.job_id, "optimization job failed: {e}");
        }
    }
    checkpoint.updated_at = Utc::now().to_rfc3339();
    io.write(&checkpoint);
}
