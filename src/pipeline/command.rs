use std::io;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::Command;

use crate::pipeline::PipelineStep;

/// Captured result of one external invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
    /// Exit code, `None` when terminated by a signal
    pub status: Option<i32>,
    /// Whether the process exited with status 0
    pub success: bool,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl StepOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    fn from_status(status: ExitStatus, stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            status: status.code(),
            success: status.success(),
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }
    }

    /// Last `lines` non-empty lines of stderr, or of stdout when stderr is empty
    pub fn diagnostic_tail(&self, lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let tail: Vec<&str> = source
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect();
        let start = tail.len().saturating_sub(lines);
        tail[start..].join("\n")
    }
}

/// Launches external commands
///
/// The only seam between the batch machinery and the outside world.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `step` to completion and capture its output.
    ///
    /// An `Err` means the process could not be launched at all.
    async fn run(&self, step: &PipelineStep) -> io::Result<StepOutput>;
}

/// Runs steps as child processes without a shell
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    _private: (),
}

impl ProcessRunner {
    /// Create a process runner
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, step: &PipelineStep) -> io::Result<StepOutput> {
        let output = Command::new(&step.program)
            .args(&step.arguments)
            .envs(&step.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(StepOutput::from_status(output.status, &output.stdout, &output.stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_tail_prefers_stderr() {
        let out = StepOutput {
            status: Some(1),
            success: false,
            stdout: "a\nb\n".to_string(),
            stderr: "e1\n\ne2\ne3\n".to_string(),
        };
        assert_eq!(out.diagnostic_tail(2), "e2\ne3");

        let out = StepOutput {
            stderr: "  \n".to_string(),
            ..out
        };
        assert_eq!(out.diagnostic_tail(5), "a\nb");
    }
}
