//! Work units, outcomes and batch reports

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::Pipeline;

/// One independently schedulable subject or subject/session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Identifier, unique within a batch
    pub id: String,
    /// Directory owned by this unit
    pub root: PathBuf,
    /// Subject id for session-level units
    pub parent_id: Option<String>,
}

impl WorkUnit {
    /// Create a subject-level unit
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
            parent_id: None,
        }
    }

    /// Create a session-level unit with id `<subject>/<session>`
    pub fn session(subject: &str, session: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            id: format!("{}/{}", subject, session),
            root: root.into(),
            parent_id: Some(subject.to_string()),
        }
    }

    /// Subject this unit belongs to
    pub fn subject(&self) -> &str {
        self.parent_id.as_deref().unwrap_or(&self.id)
    }

    /// Session name, for session-level units
    pub fn session_name(&self) -> Option<&str> {
        self.parent_id
            .as_ref()
            .and_then(|_| self.id.rsplit('/').next())
    }

    /// Resolve a unit-relative path
    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }
}

/// Terminal outcome of one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitOutcome {
    /// Already complete before the run
    Skipped,
    /// Every step exited successfully
    Succeeded,
    /// The pipeline stopped at `step_index`
    Failed {
        /// Zero-based index of the failing step (0 for failures before the first step)
        step_index: usize,
        /// Human-readable failure detail
        detail: String,
    },
}

impl UnitOutcome {
    /// Label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            UnitOutcome::Skipped => "skipped",
            UnitOutcome::Succeeded => "succeeded",
            UnitOutcome::Failed { .. } => "failed",
        }
    }

    /// Whether this outcome is a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, UnitOutcome::Failed { .. })
    }
}

/// Result of one unit in a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Unit identifier
    pub unit_id: String,
    /// Final outcome
    pub outcome: UnitOutcome,
    /// Wall time spent on the unit
    pub duration: Duration,
}

impl RunResult {
    /// Result for a unit that was already complete
    pub fn skipped(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            outcome: UnitOutcome::Skipped,
            duration: Duration::ZERO,
        }
    }

    /// Result for a unit that failed at `step_index`
    pub fn failed(
        unit_id: impl Into<String>,
        step_index: usize,
        detail: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            outcome: UnitOutcome::Failed {
                step_index,
                detail: detail.into(),
            },
            duration,
        }
    }
}

/// A unit paired with the pipeline to run on it
#[derive(Debug, Clone)]
pub struct BatchJob {
    /// Unit to process
    pub unit: WorkUnit,
    /// Pipeline shared by every unit of a recipe
    pub pipeline: Arc<Pipeline>,
}

impl BatchJob {
    /// Create a job
    pub fn new(unit: WorkUnit, pipeline: Arc<Pipeline>) -> Self {
        Self { unit, pipeline }
    }

    /// Whether the unit's outputs are already in place
    pub fn is_complete(&self) -> bool {
        self.pipeline.completion.is_complete(&self.unit)
    }
}

/// A failed unit entry in the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUnit {
    /// Unit identifier
    pub unit_id: String,
    /// Zero-based index of the failing step
    pub step_index: usize,
    /// Failure detail
    pub detail: String,
}

/// Aggregated outcome of one batch invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    /// Identifier of this run, also written to the batch log
    pub run_id: Uuid,
    /// Pipeline name(s) that were run
    pub pipeline: String,
    /// Units that were already complete
    pub skipped: Vec<String>,
    /// Units whose pipeline succeeded
    pub succeeded: Vec<String>,
    /// Units whose pipeline failed
    pub failed: Vec<FailedUnit>,
    /// Highest number of units observed running at once
    pub peak_concurrency: usize,
    /// Total batch wall time in milliseconds
    pub duration_ms: u64,
}

impl BatchReport {
    /// Build a report from individual results; ids are sorted
    pub fn from_results(
        run_id: Uuid,
        pipeline: impl Into<String>,
        results: Vec<RunResult>,
        peak_concurrency: usize,
        duration: Duration,
    ) -> Self {
        let mut skipped = Vec::new();
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();

        for result in results {
            match result.outcome {
                UnitOutcome::Skipped => skipped.push(result.unit_id),
                UnitOutcome::Succeeded => succeeded.push(result.unit_id),
                UnitOutcome::Failed { step_index, detail } => failed.push(FailedUnit {
                    unit_id: result.unit_id,
                    step_index,
                    detail,
                }),
            }
        }

        skipped.sort();
        succeeded.sort();
        failed.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));

        Self {
            run_id,
            pipeline: pipeline.into(),
            skipped,
            succeeded,
            failed,
            peak_concurrency,
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Number of skipped units
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    /// Number of succeeded units
    pub fn succeeded_count(&self) -> usize {
        self.succeeded.len()
    }

    /// Number of failed units
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Total units considered
    pub fn total(&self) -> usize {
        self.skipped_count() + self.succeeded_count() + self.failed_count()
    }

    /// True when no unit failed
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Ids of failed units, for targeted re-runs
    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.unit_id.as_str()).collect()
    }

    /// Pretty JSON rendering
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Label for a set of jobs: their distinct pipeline names joined by `+`
pub fn pipeline_label(jobs: &[BatchJob]) -> String {
    let names: BTreeSet<&str> = jobs.iter().map(|j| j.pipeline.name.as_str()).collect();
    if names.is_empty() {
        "empty".to_string()
    } else {
        names.into_iter().collect::<Vec<_>>().join("+")
    }
}

/// Progress callback type, called with (finished, total)
pub type ProgressCallback = Box<dyn Fn(usize, usize) + Send + Sync>;
