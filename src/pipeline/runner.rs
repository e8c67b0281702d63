use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::batch::{UnitOutcome, WorkUnit};
use crate::logging::BatchLog;
use crate::metrics::{PipelineMetrics, Timer};
use crate::pipeline::{CommandRunner, Pipeline, TemplateContext, TemplateError};

/// Lines of stderr/stdout kept in a failure detail
const DIAGNOSTIC_LINES: usize = 5;

/// Why a unit's pipeline stopped
#[derive(Error, Debug)]
pub enum StepError {
    /// The executable could not be started
    #[error("failed to launch {program}: {source}")]
    Launch {
        /// Executable
        program: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The process exited unsuccessfully
    #[error("{program} exited with {}{}", exit_label(.code), tail_suffix(.tail))]
    NonZeroExit {
        /// Executable
        program: String,
        /// Exit code, `None` when killed by a signal
        code: Option<i32>,
        /// Tail of the process diagnostics
        tail: String,
    },

    /// The step succeeded but its expected output is absent
    #[error("expected output missing: {}", .0.display())]
    MissingOutput(PathBuf),

    /// A required input is absent
    #[error("required input missing: {}", .0.display())]
    MissingInput(PathBuf),

    /// A template could not be rendered
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Captured stdout could not be converted
    #[error("capture failed: {0}")]
    Capture(String),

    /// Stale outputs could not be removed
    #[error("reset failed: {0}")]
    Reset(#[source] io::Error),

    /// A working directory could not be created
    #[error("failed to create {}: {source}", path.display())]
    Prepare {
        /// Directory
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

fn tail_suffix(tail: &str) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!(": {}", tail)
    }
}

/// Run every step of `pipeline` on `unit`, in order, stopping at the first
/// failure.
///
/// Required inputs are checked and working directories created before the
/// first step; failures there are reported at step index 0. Rendered paths
/// are used as-is, exactly as the external commands receive them.
pub async fn run_pipeline(
    unit: &WorkUnit,
    pipeline: &Pipeline,
    runner: &dyn CommandRunner,
    log: &BatchLog,
) -> UnitOutcome {
    match execute_steps(unit, pipeline, runner, log).await {
        Ok(()) => UnitOutcome::Succeeded,
        Err((step_index, error)) => {
            let detail = error.to_string();
            warn!(unit = %unit.id, pipeline = %pipeline.name, step = step_index, error = %detail, "Pipeline failed");
            log.append(format!("{} {} failed at step {}: {}", pipeline.name, unit.id, step_index, detail))
                .await;
            UnitOutcome::Failed { step_index, detail }
        }
    }
}

async fn execute_steps(
    unit: &WorkUnit,
    pipeline: &Pipeline,
    runner: &dyn CommandRunner,
    log: &BatchLog,
) -> Result<(), (usize, StepError)> {
    let at_start = |e: StepError| (0, e);
    let mut ctx = pipeline.context_for(unit).map_err(|e| at_start(e.into()))?;

    check_inputs(pipeline, &ctx).await.map_err(at_start)?;
    prepare_dirs(pipeline, &ctx).await.map_err(at_start)?;

    let metrics = PipelineMetrics::new(&pipeline.name);

    for (index, template) in pipeline.steps.iter().enumerate() {
        let step = template.render(&ctx).map_err(|e| (index, e.into()))?;
        let command_line = step.command_line();

        info!(unit = %unit.id, step = index, program = %step.program, "{}", command_line);
        log.append(format!("[{}] {}", unit.id, command_line)).await;

        let timer = Timer::start();
        let output = runner.run(&step).await;
        let elapsed = timer.elapsed_secs();

        let output = match output {
            Ok(output) => output,
            Err(source) => {
                metrics.record_step(&step.program, false, elapsed);
                return Err((
                    index,
                    StepError::Launch {
                        program: step.program.clone(),
                        source,
                    },
                ));
            }
        };
        metrics.record_step(&step.program, output.success, elapsed);

        let duration_ms = (elapsed * 1000.0) as u64;
        log.append(format!(
            "[{}] {} exited with {} after {} ms",
            unit.id,
            step.program,
            exit_label(&output.status),
            duration_ms
        ))
        .await;

        if !output.success {
            return Err((
                index,
                StepError::NonZeroExit {
                    program: step.program.clone(),
                    code: output.status,
                    tail: output.diagnostic_tail(DIAGNOSTIC_LINES),
                },
            ));
        }
        debug!(unit = %unit.id, step = index, program = %step.program, duration_ms, "Step finished");

        if let Some(expected) = &step.expected_output {
            if !tokio::fs::try_exists(expected).await.unwrap_or(false) {
                return Err((index, StepError::MissingOutput(expected.clone())));
            }
        }

        if let Some(capture) = &step.capture {
            let value = capture
                .apply(&output.stdout)
                .map_err(|e| (index, StepError::Capture(e)))?;
            debug!(unit = %unit.id, name = %capture.name, value = %value, "Captured step output");
            ctx.set(capture.name.clone(), value);
        }
    }

    Ok(())
}

async fn check_inputs(pipeline: &Pipeline, ctx: &TemplateContext) -> Result<(), StepError> {
    for input in &pipeline.required_inputs {
        let path = PathBuf::from(ctx.render(input)?);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StepError::MissingInput(path));
        }
    }
    Ok(())
}

async fn prepare_dirs(pipeline: &Pipeline, ctx: &TemplateContext) -> Result<(), StepError> {
    for dir in &pipeline.prepare_dirs {
        let path = PathBuf::from(ctx.render(dir)?);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| StepError::Prepare { path, source })?;
    }
    Ok(())
}
