//! Completion detection and pre-run reset
//!
//! Both operate on paths relative to a unit's root. Checking completion only
//! reads the filesystem; resetting removes the stale outputs of an incomplete
//! unit so the external tools start from a clean slate.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::batch::WorkUnit;

/// A success marker expected inside a unit-local log file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMarker {
    /// Log file, relative to the unit root
    pub log: PathBuf,
    /// Substring denoting success
    pub marker: String,
}

/// Decides whether a unit's pipeline has already completed
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompletionCheck {
    /// Files that must all exist (an empty list never matches)
    pub sentinels: Vec<PathBuf>,
    /// Fallback: a log file containing a success marker
    pub log_marker: Option<LogMarker>,
}

impl CompletionCheck {
    /// A check that never reports completion (always re-run)
    pub fn never() -> Self {
        Self::default()
    }

    /// Complete when a single sentinel file exists
    pub fn sentinel(path: impl Into<PathBuf>) -> Self {
        Self {
            sentinels: vec![path.into()],
            log_marker: None,
        }
    }

    /// Complete when every listed file exists
    pub fn all_of<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            sentinels: paths.into_iter().map(Into::into).collect(),
            log_marker: None,
        }
    }

    /// Add a log-marker fallback
    pub fn with_log_marker(mut self, log: impl Into<PathBuf>, marker: impl Into<String>) -> Self {
        self.log_marker = Some(LogMarker {
            log: log.into(),
            marker: marker.into(),
        });
        self
    }

    /// Whether the unit is complete. Sentinels are checked first, then the
    /// log marker. A unit whose root is absent is never complete.
    pub fn is_complete(&self, unit: &WorkUnit) -> bool {
        if !unit.root.is_dir() {
            return false;
        }

        if !self.sentinels.is_empty() && self.sentinels.iter().all(|p| unit.path(p).exists()) {
            return true;
        }

        match &self.log_marker {
            Some(LogMarker { log, marker }) => match fs::read(unit.path(log)) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).contains(marker.as_str()),
                Err(_) => false,
            },
            None => false,
        }
    }
}

/// Paths removed before an incomplete unit is retried
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResetPolicy {
    /// Files or directories, relative to the unit root
    pub paths: Vec<PathBuf>,
}

impl ResetPolicy {
    /// Remove nothing
    pub fn none() -> Self {
        Self::default()
    }

    /// Add a path to remove
    pub fn remove(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Whether the policy removes anything
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Remove every configured path that exists. Returns the removed paths.
    ///
    /// Paths must stay inside the unit root: absolute paths and `..`
    /// components are rejected.
    pub async fn apply(&self, unit: &WorkUnit) -> io::Result<Vec<PathBuf>> {
        let mut removed = Vec::new();

        for relative in &self.paths {
            if !is_contained(relative) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("reset path escapes the unit root: {}", relative.display()),
                ));
            }

            let target = unit.path(relative);
            let metadata = match tokio::fs::symlink_metadata(&target).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };

            if metadata.is_dir() {
                tokio::fs::remove_dir_all(&target).await?;
            } else {
                tokio::fs::remove_file(&target).await?;
            }
            debug!(unit = %unit.id, path = %target.display(), "Removed stale output");
            removed.push(target);
        }

        Ok(removed)
    }
}

fn is_contained(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
