use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use neurobatch::batch::{
    discover_units, BatchExecutor, BatchJob, CompletionCheck, DiscoverySpec, ResetPolicy, WorkUnit,
};
use neurobatch::logging::BatchLog;
use neurobatch::pipeline::{CommandRunner, Pipeline, PipelineStep, StepOutput, StepTemplate};

/// Stand-in for the external tools: creates each step's expected output,
/// except for units listed as failing.
struct FakeTools {
    failing: HashSet<String>,
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl FakeTools {
    fn new() -> Self {
        Self {
            failing: HashSet::new(),
            delay: Duration::from_millis(5),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing(mut self, unit: &str) -> Self {
        self.failing.insert(unit.to_string());
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls_for(&self, unit: &str) -> usize {
        self.calls.lock().iter().filter(|u| u.as_str() == unit).count()
    }
}

#[async_trait]
impl CommandRunner for FakeTools {
    async fn run(&self, step: &PipelineStep) -> io::Result<StepOutput> {
        let unit_dir = Path::new(&step.arguments[0]);
        let unit = unit_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.calls.lock().push(unit.clone());

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&unit) {
            return Ok(StepOutput::failed(1, format!("ERROR: {} is broken\n", unit)));
        }
        if let Some(output) = &step.expected_output {
            if let Some(parent) = output.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(output, "done")?;
        }
        Ok(StepOutput::ok(""))
    }
}

fn fake_pipeline() -> Arc<Pipeline> {
    Arc::new(
        Pipeline::new("fake")
            .completion(CompletionCheck::sentinel("out/done"))
            .reset(ResetPolicy::none().remove("out"))
            .step(
                StepTemplate::new("tool")
                    .arg("{unit_dir}")
                    .expect_output("{unit_dir}/out/done"),
            ),
    )
}

fn make_subjects(root: &Path, ids: &[&str]) -> Vec<BatchJob> {
    ids.iter()
        .map(|id| {
            std::fs::create_dir_all(root.join(id)).unwrap();
            BatchJob::new(WorkUnit::new(*id, root.join(id)), fake_pipeline())
        })
        .collect()
}

fn mark_complete(root: &Path, id: &str) {
    std::fs::create_dir_all(root.join(id).join("out")).unwrap();
    std::fs::write(root.join(id).join("out/done"), "done").unwrap();
}

#[tokio::test]
async fn test_second_run_skips_everything() {
    let dir = TempDir::new().unwrap();
    let tools = Arc::new(FakeTools::new());
    let executor = BatchExecutor::new(tools.clone()).with_concurrency_limit(4);

    let first = executor.run_batch(make_subjects(dir.path(), &["s1", "s2", "s3"])).await.unwrap();
    assert_eq!(first.succeeded, vec!["s1", "s2", "s3"]);
    assert_eq!(tools.calls.lock().len(), 3);

    let second = executor.run_batch(make_subjects(dir.path(), &["s1", "s2", "s3"])).await.unwrap();
    assert_eq!(second.skipped, vec!["s1", "s2", "s3"]);
    assert_eq!(second.succeeded_count(), 0);
    assert_eq!(second.peak_concurrency, 0);
    assert_eq!(tools.calls.lock().len(), 3, "complete units must not be re-run");
}

#[tokio::test]
async fn test_failure_is_isolated() {
    let dir = TempDir::new().unwrap();
    let tools = Arc::new(FakeTools::new().failing("s2"));
    let executor = BatchExecutor::new(tools.clone()).with_concurrency_limit(2);

    let report = executor
        .run_batch(make_subjects(dir.path(), &["s1", "s2", "s3", "s4"]))
        .await
        .unwrap();

    assert_eq!(report.succeeded, vec!["s1", "s3", "s4"]);
    assert_eq!(report.failed_ids(), vec!["s2"]);
    assert_eq!(report.failed[0].step_index, 0);
    assert!(report.failed[0].detail.contains("s2 is broken"));
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_concurrency_bound_is_respected() {
    let dir = TempDir::new().unwrap();
    let tools = Arc::new(FakeTools::new().with_delay(Duration::from_millis(30)));
    let executor = BatchExecutor::new(tools.clone()).with_concurrency_limit(2);

    let ids = ["a", "b", "c", "d", "e", "f", "g"];
    let report = executor.run_batch(make_subjects(dir.path(), &ids)).await.unwrap();

    assert_eq!(report.succeeded_count(), ids.len());
    assert!(tools.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(report.peak_concurrency, 2);
}

#[tokio::test]
async fn test_stale_outputs_removed_before_retry() {
    let dir = TempDir::new().unwrap();
    let jobs = make_subjects(dir.path(), &["s1"]);
    std::fs::create_dir_all(dir.path().join("s1/out")).unwrap();
    std::fs::write(dir.path().join("s1/out/partial.tmp"), "half written").unwrap();

    let tools = Arc::new(FakeTools::new());
    let report = BatchExecutor::new(tools).run_batch(jobs).await.unwrap();

    assert_eq!(report.succeeded, vec!["s1"]);
    assert!(!dir.path().join("s1/out/partial.tmp").exists());
    assert!(dir.path().join("s1/out/done").exists());
}

#[tokio::test]
async fn test_complete_incomplete_and_stale_units() {
    let dir = TempDir::new().unwrap();
    let jobs = make_subjects(dir.path(), &["A", "B", "C"]);
    mark_complete(dir.path(), "A");
    std::fs::create_dir_all(dir.path().join("C/out")).unwrap();
    std::fs::write(dir.path().join("C/out/partial.tmp"), "half written").unwrap();

    let tools = Arc::new(FakeTools::new());
    let report = BatchExecutor::new(tools.clone())
        .with_concurrency_limit(2)
        .run_batch(jobs)
        .await
        .unwrap();

    assert_eq!(report.skipped, vec!["A"]);
    assert_eq!(report.succeeded, vec!["B", "C"]);
    assert!(report.failed.is_empty());
    assert_eq!(tools.calls_for("A"), 0);
    assert!(!dir.path().join("C/out/partial.tmp").exists());
    assert!(dir.path().join("C/out/done").exists());
}

#[tokio::test]
async fn test_mixed_batch_then_retry() {
    // A complete, B incomplete, C fails on the first run
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("logs/batch.log");
    make_subjects(dir.path(), &["A", "B", "C"]);
    mark_complete(dir.path(), "A");

    let spec = DiscoverySpec::subjects();
    let units = discover_units(dir.path(), &spec).unwrap();
    let jobs = |units: Vec<WorkUnit>| -> Vec<BatchJob> {
        units.into_iter().map(|u| BatchJob::new(u, fake_pipeline())).collect()
    };

    let tools = Arc::new(FakeTools::new().failing("C"));
    let report = BatchExecutor::new(tools.clone())
        .with_log(BatchLog::new(&log_path))
        .run_batch(jobs(units.clone()))
        .await
        .unwrap();

    assert_eq!(report.skipped, vec!["A"]);
    assert_eq!(report.succeeded, vec!["B"]);
    assert_eq!(report.failed_ids(), vec!["C"]);
    assert_eq!(tools.calls_for("A"), 0);

    let log = std::fs::read_to_string(&log_path).unwrap();
    assert!(log.contains("[A] fake already complete, skipped"));
    assert!(log.contains("failed: C"));

    let fixed = Arc::new(FakeTools::new());
    let retry = BatchExecutor::new(fixed.clone())
        .with_log(BatchLog::new(&log_path))
        .run_batch(jobs(units))
        .await
        .unwrap();

    assert_eq!(retry.skipped, vec!["A", "B"]);
    assert_eq!(retry.succeeded, vec!["C"]);
    assert_eq!(fixed.calls_for("C"), 1);
    assert_eq!(fixed.calls.lock().len(), 1);
}

#[tokio::test]
async fn test_nothing_to_do() {
    let dir = TempDir::new().unwrap();
    let jobs = make_subjects(dir.path(), &["s1", "s2"]);
    mark_complete(dir.path(), "s1");
    mark_complete(dir.path(), "s2");

    let progress = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&progress);
    let report = BatchExecutor::new(Arc::new(FakeTools::new()))
        .with_progress_callback(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .run_batch(jobs)
        .await
        .unwrap();

    assert_eq!(report.skipped_count(), 2);
    assert_eq!(report.total(), 2);
    assert_eq!(progress.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_progress_reports_every_unit() {
    let dir = TempDir::new().unwrap();
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&updates);

    BatchExecutor::new(Arc::new(FakeTools::new()))
        .with_concurrency_limit(3)
        .with_progress_callback(move |done, total| sink.lock().push((done, total)))
        .run_batch(make_subjects(dir.path(), &["a", "b", "c", "d"]))
        .await
        .unwrap();

    let updates = updates.lock();
    assert_eq!(updates.len(), 4);
    assert_eq!(*updates.last().unwrap(), (4, 4));
}

#[tokio::test]
async fn test_missing_required_input_fails_before_first_step() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("s1")).unwrap();
    let pipeline = Pipeline::new("needs-input")
        .require_input("{unit_dir}/t1/T1.nii.gz")
        .step(StepTemplate::new("tool").arg("{unit_dir}"));
    let job = BatchJob::new(WorkUnit::new("s1", dir.path().join("s1")), Arc::new(pipeline));

    let tools = Arc::new(FakeTools::new());
    let report = BatchExecutor::new(tools.clone()).run_batch(vec![job]).await.unwrap();

    match &report.failed[..] {
        [failed] => {
            assert_eq!(failed.step_index, 0);
            assert!(failed.detail.contains("T1.nii.gz"));
        }
        other => panic!("expected one failure, got {:?}", other),
    }
    assert!(tools.calls.lock().is_empty());
}

#[tokio::test]
async fn test_report_serializes() {
    let dir = TempDir::new().unwrap();
    let report = BatchExecutor::new(Arc::new(FakeTools::new().failing("b")))
        .run_batch(make_subjects(dir.path(), &["a", "b"]))
        .await
        .unwrap();

    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["pipeline"], "fake");
    assert_eq!(json["succeeded"][0], "a");
    assert_eq!(json["failed"][0]["unit_id"], "b");
}
