//! Pipeline model: an ordered list of external command steps applied to one
//! work unit, with the unit's completion check and reset policy.

mod command;
mod runner;
mod template;

pub use command::{CommandRunner, ProcessRunner, StepOutput};
pub use runner::{run_pipeline, StepError};
pub use template::{literal, Capture, CaptureTransform, StepTemplate, TemplateContext, TemplateError};

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::batch::{CompletionCheck, ResetPolicy, WorkUnit};

/// A concrete invocation of an external binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStep {
    /// Executable name or path
    pub program: String,
    /// Literal argument list
    pub arguments: Vec<String>,
    /// Environment overrides for this invocation only
    pub env: BTreeMap<String, String>,
    /// File that must exist after a successful exit
    pub expected_output: Option<PathBuf>,
    /// Stdout capture for later steps
    pub capture: Option<Capture>,
}

impl PipelineStep {
    /// Command line as logged: program followed by its arguments
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.arguments {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Ordered steps plus the idempotence rules for one unit
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Name used in logs, metrics and reports
    pub name: String,
    /// Step templates, run strictly in order
    pub steps: Vec<StepTemplate>,
    /// Pipeline variables; each value is itself a template rendered in order
    pub vars: Vec<(String, String)>,
    /// Completion check applied before dispatch
    pub completion: CompletionCheck,
    /// Paths removed before an incomplete unit runs
    pub reset: ResetPolicy,
    /// Directories (templates) created before the first step.
    ///
    /// Like `required_inputs`, these render to paths used as-is; only the
    /// completion check and reset policy are relative to the unit root.
    pub prepare_dirs: Vec<String>,
    /// Files (templates) that must exist before the first step
    pub required_inputs: Vec<String>,
}

impl Pipeline {
    /// Create an empty pipeline that never reports completion
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            vars: Vec::new(),
            completion: CompletionCheck::never(),
            reset: ResetPolicy::none(),
            prepare_dirs: Vec::new(),
            required_inputs: Vec::new(),
        }
    }

    /// Append a step
    pub fn step(mut self, step: StepTemplate) -> Self {
        self.steps.push(step);
        self
    }

    /// Define a variable; later variables may reference earlier ones
    pub fn var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.push((name.into(), value.into()));
        self
    }

    /// Set the completion check
    pub fn completion(mut self, check: CompletionCheck) -> Self {
        self.completion = check;
        self
    }

    /// Set the reset policy
    pub fn reset(mut self, policy: ResetPolicy) -> Self {
        self.reset = policy;
        self
    }

    /// Create a directory before the first step
    pub fn prepare_dir(mut self, dir: impl Into<String>) -> Self {
        self.prepare_dirs.push(dir.into());
        self
    }

    /// Require an input file before the first step
    pub fn require_input(mut self, path: impl Into<String>) -> Self {
        self.required_inputs.push(path.into());
        self
    }

    /// Template context for `unit`: unit variables followed by the pipeline
    /// variables rendered in declaration order
    pub fn context_for(&self, unit: &WorkUnit) -> Result<TemplateContext, TemplateError> {
        let mut ctx = TemplateContext::for_unit(unit);
        for (name, value) in &self.vars {
            let rendered = ctx.render(value)?;
            ctx.set(name.clone(), rendered);
        }
        Ok(ctx)
    }

    /// Render every step for `unit` without running anything.
    ///
    /// Captured variables are not known ahead of execution; they render as
    /// `<name>`.
    pub fn render_steps(&self, unit: &WorkUnit) -> Result<Vec<PipelineStep>, TemplateError> {
        let mut ctx = self.context_for(unit)?;
        for capture in self.steps.iter().filter_map(|s| s.capture.as_ref()) {
            ctx.set(capture.name.clone(), format!("<{}>", capture.name));
        }
        self.steps.iter().map(|s| s.render(&ctx)).collect()
    }
}
