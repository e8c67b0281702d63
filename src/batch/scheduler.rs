//! Bounded worker pool for unit tasks

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::metrics;

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    /// The pool's semaphore was closed
    #[error("Worker pool error: {0}")]
    WorkerPoolError(String),
}

/// Metrics for monitoring worker usage
#[derive(Debug, Clone, Default)]
pub struct WorkerMetrics {
    /// Configured permit count
    pub max_workers: usize,
    /// Tasks currently holding a permit
    pub active_workers: usize,
    /// Highest number of tasks holding a permit at once
    pub peak_workers: usize,
    /// Tasks that ran to completion (or panicked)
    pub total_jobs_processed: usize,
    /// Mean time a task held its permit
    pub avg_job_duration: Duration,
    total_duration: Duration,
}

/// Bounded pool of async workers.
///
/// Every spawned task waits for one of `limit` permits before running, so at
/// most `limit` tasks execute their body at any instant.
pub struct WorkerPool {
    limit: usize,
    semaphore: Arc<Semaphore>,
    metrics: Arc<Mutex<WorkerMetrics>>,
}

impl WorkerPool {
    /// Create a pool with `limit` permits (at least one)
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            metrics: Arc::new(Mutex::new(WorkerMetrics {
                max_workers: limit,
                ..Default::default()
            })),
        }
    }

    /// Configured permit count
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Snapshot of the pool metrics
    pub fn metrics(&self) -> WorkerMetrics {
        self.metrics.lock().clone()
    }

    /// Spawn `task` on the runtime once a permit is available
    pub fn spawn<F, R>(&self, task: F) -> JoinHandle<Result<R, SchedulingError>>
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| SchedulingError::WorkerPoolError(e.to_string()))?;

            let _guard = ActiveGuard::enter(metrics);
            Ok(task.await)
        })
    }
}

/// Tracks one running task; released on drop, including on panic
struct ActiveGuard {
    metrics: Arc<Mutex<WorkerMetrics>>,
    started: Instant,
}

impl ActiveGuard {
    fn enter(metrics: Arc<Mutex<WorkerMetrics>>) -> Self {
        {
            let mut m = metrics.lock();
            m.active_workers += 1;
            m.peak_workers = m.peak_workers.max(m.active_workers);
        }
        metrics::unit_started();
        Self {
            metrics,
            started: Instant::now(),
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut m = self.metrics.lock();
        m.active_workers = m.active_workers.saturating_sub(1);
        m.total_jobs_processed += 1;
        m.total_duration += self.started.elapsed();
        m.avg_job_duration = m.total_duration / m.total_jobs_processed as u32;
        drop(m);
        metrics::unit_finished();
    }
}
