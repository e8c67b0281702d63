//! Append-only batch log and console tracing setup

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Timestamp format of batch log lines
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Persistent, append-only record of a batch run.
///
/// Every line is written with a single `write_all` on a freshly opened
/// append-mode handle, so lines from concurrent workers never interleave.
/// Cloning is cheap; clones share the same target.
#[derive(Debug, Clone, Default)]
pub struct BatchLog {
    path: Option<Arc<PathBuf>>,
}

impl BatchLog {
    /// Log to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(Arc::new(path.into())),
        }
    }

    /// A log that only goes to the console
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Target file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref().map(PathBuf::as_path)
    }

    /// Append one timestamped line. Write failures are reported as warnings
    /// and never fail the caller.
    pub async fn append(&self, message: impl Into<String>) {
        let Some(path) = self.path.clone() else {
            return;
        };
        let line = format_line(Local::now(), &message.into());

        let result = tokio::task::spawn_blocking(move || append_line(&path, &line)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to write batch log"),
            Err(e) => warn!(error = %e, "Batch log writer task failed"),
        }
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}

/// Render a log line: `YYYY-MM-DD HH:MM:SS <message>\n`. Embedded newlines
/// are folded so each entry stays on one line.
pub fn format_line(at: DateTime<Local>, message: &str) -> String {
    let message = message.trim_end().replace("\r\n", " | ").replace(['\r', '\n'], " | ");
    format!("{} {}\n", at.format(TIMESTAMP_FORMAT), message)
}

/// Install the console subscriber. `RUST_LOG` wins when set; otherwise
/// `neurobatch=info`, or `neurobatch=debug` when `verbose`.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "neurobatch=debug" } else { "neurobatch=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
