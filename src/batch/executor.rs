//! Batch executor
//!
//! Runs one pipeline per work unit with bounded parallelism:
//! - Completed units are skipped before any worker starts
//! - Incomplete units are reset, then their steps run in order
//! - One unit failing never cancels another
//! - Progress callbacks, structured logging and a final report

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::batch::{
    pipeline_label, BatchJob, BatchReport, ProgressCallback, RunResult, UnitOutcome, WorkerPool,
};
use crate::logging::BatchLog;
use crate::metrics::PipelineMetrics;
use crate::pipeline::{run_pipeline, CommandRunner, StepError};
use crate::recipes::Recipe;
use crate::Result;

/// Batch executor for running pipelines over many work units
pub struct BatchExecutor {
    /// Launches the external commands
    runner: Arc<dyn CommandRunner>,
    /// Maximum units running at once
    concurrency_limit: usize,
    /// Persistent batch log
    log: BatchLog,
    /// Progress callback
    progress_callback: Option<Arc<ProgressCallback>>,
}

impl BatchExecutor {
    /// Create an executor with one worker per CPU and no batch log file
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            concurrency_limit: num_cpus::get(),
            log: BatchLog::disabled(),
            progress_callback: None,
        }
    }

    /// Set concurrency limit (number of parallel units)
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// Set the batch log
    pub fn with_log(mut self, log: BatchLog) -> Self {
        self.log = log;
        self
    }

    /// Set progress callback, called with (finished, pending) as units finish
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(Box::new(callback)));
        self
    }

    /// Configured concurrency limit
    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Build one job per unit from `recipe` and run them
    #[instrument(skip(self, units, recipe), fields(recipe = %recipe.name(), unit_count = units.len()))]
    pub async fn run_units<R>(&self, units: Vec<crate::batch::WorkUnit>, recipe: &R) -> Result<BatchReport>
    where
        R: Recipe + ?Sized,
    {
        let jobs = recipe.jobs(units)?;
        self.run_batch(jobs).await
    }

    /// Run a batch of jobs and wait for every one of them
    #[instrument(skip(self, jobs), fields(job_count = jobs.len()))]
    pub async fn run_batch(&self, jobs: Vec<BatchJob>) -> Result<BatchReport> {
        let batch_start = Instant::now();
        let run_id = Uuid::new_v4();
        let label = pipeline_label(&jobs);

        let (complete, pending): (Vec<BatchJob>, Vec<BatchJob>) =
            tokio::task::spawn_blocking(move || jobs.into_iter().partition(BatchJob::is_complete)).await?;

        let mut results: Vec<RunResult> = Vec::with_capacity(complete.len() + pending.len());
        for job in &complete {
            debug!(unit = %job.unit.id, pipeline = %job.pipeline.name, "Already complete, skipping");
            self.log
                .append(format!("[{}] {} already complete, skipped", job.unit.id, job.pipeline.name))
                .await;
            PipelineMetrics::new(&job.pipeline.name).record_skipped(1);
            results.push(RunResult::skipped(job.unit.id.clone()));
        }

        if pending.is_empty() {
            info!(pipeline = %label, skipped = results.len(), "All units complete, nothing to do");
            self.log
                .append(format!("{} run {}: nothing to do ({} complete)", label, run_id, results.len()))
                .await;
            return Ok(BatchReport::from_results(run_id, label, results, 0, batch_start.elapsed()));
        }

        let total = pending.len();
        info!(
            pipeline = %label,
            run_id = %run_id,
            pending = total,
            skipped = complete.len(),
            concurrency_limit = self.concurrency_limit,
            "Starting batch"
        );
        self.log
            .append(format!(
                "START {} run {}: {} pending, {} skipped, concurrency {}",
                label,
                run_id,
                total,
                complete.len(),
                self.concurrency_limit
            ))
            .await;

        let pool = WorkerPool::new(self.concurrency_limit);
        let mut tasks = FuturesUnordered::new();

        for job in pending {
            let unit_id = job.unit.id.clone();
            let runner = Arc::clone(&self.runner);
            let log = self.log.clone();
            let handle = pool.spawn(execute_job(job, runner, log));
            tasks.push(async move { (unit_id, handle.await) });
        }

        let mut finished = 0;
        while let Some((unit_id, joined)) = tasks.next().await {
            let result = match joined {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    error!(unit = %unit_id, error = %e, "Unit could not be scheduled");
                    RunResult::failed(unit_id, 0, e.to_string(), Duration::ZERO)
                }
                Err(e) => {
                    error!(unit = %unit_id, error = %e, "Unit task aborted");
                    RunResult::failed(unit_id, 0, format!("worker task aborted: {}", e), Duration::ZERO)
                }
            };
            results.push(result);

            finished += 1;
            if let Some(ref callback) = self.progress_callback {
                callback(finished, total);
            }
        }

        let peak = pool.metrics().peak_workers;
        let report = BatchReport::from_results(run_id, label, results, peak, batch_start.elapsed());

        info!(
            pipeline = %report.pipeline,
            run_id = %run_id,
            skipped = report.skipped_count(),
            succeeded = report.succeeded_count(),
            failed = report.failed_count(),
            peak_concurrency = peak,
            batch_duration_ms = report.duration_ms,
            "Batch completed"
        );
        if !report.is_success() {
            warn!(failed = ?report.failed_ids(), "Some units failed; re-run the batch to retry them");
        }

        self.log
            .append(format!(
                "DONE {} run {}: {} succeeded, {} failed, {} skipped in {:.1}s{}",
                report.pipeline,
                run_id,
                report.succeeded_count(),
                report.failed_count(),
                report.skipped_count(),
                report.duration_ms as f64 / 1000.0,
                if report.is_success() {
                    String::new()
                } else {
                    format!("; failed: {}", report.failed_ids().join(", "))
                }
            ))
            .await;

        Ok(report)
    }
}

/// Reset then run one unit; never fails, failures become the outcome
async fn execute_job(job: BatchJob, runner: Arc<dyn CommandRunner>, log: BatchLog) -> RunResult {
    let start = Instant::now();
    let BatchJob { unit, pipeline } = job;
    let metrics = PipelineMetrics::new(&pipeline.name);

    debug!(unit = %unit.id, pipeline = %pipeline.name, "Unit starting");

    let outcome = match pipeline.reset.apply(&unit).await {
        Ok(removed) => {
            if !removed.is_empty() {
                info!(unit = %unit.id, removed = removed.len(), "Removed stale outputs before retry");
                log.append(format!("[{}] reset: removed {} stale path(s)", unit.id, removed.len()))
                    .await;
            }
            run_pipeline(&unit, &pipeline, runner.as_ref(), &log).await
        }
        Err(e) => {
            let detail = StepError::Reset(e).to_string();
            warn!(unit = %unit.id, error = %detail, "Reset failed");
            log.append(format!("{} {} failed at step 0: {}", pipeline.name, unit.id, detail))
                .await;
            UnitOutcome::Failed { step_index: 0, detail }
        }
    };

    let duration = start.elapsed();
    metrics.record_unit(outcome.label(), duration.as_secs_f64());

    match &outcome {
        UnitOutcome::Failed { step_index, .. } => error!(
            unit = %unit.id,
            pipeline = %pipeline.name,
            step = step_index,
            duration_ms = duration.as_millis() as u64,
            "Unit failed"
        ),
        _ => info!(
            unit = %unit.id,
            pipeline = %pipeline.name,
            duration_ms = duration.as_millis() as u64,
            "Unit succeeded"
        ),
    }
    log.append(format!(
        "[{}] {} {} in {:.1}s",
        unit.id,
        pipeline.name,
        outcome.label(),
        duration.as_secs_f64()
    ))
    .await;

    RunResult {
        unit_id: unit.id,
        outcome,
        duration,
    }
}
