//! Work unit discovery under a data root

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::batch::WorkUnit;
use crate::{NeuroBatchError, Result};

/// Directory names that are never work units by default
pub const DEFAULT_EXCLUSIONS: &[&str] = &["fsaverage"];

/// How units are laid out under the data root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitLayout {
    /// Every directory under the root is a subject
    Subjects {
        /// Only directories whose name starts with this prefix
        prefix: Option<String>,
        /// Only directories containing this relative subdirectory
        required_subdir: Option<PathBuf>,
    },
    /// `<root>/<subject>/<session>` directories are units
    Sessions {
        /// Prefix of subject directories, e.g. `sub_`
        subject_prefix: String,
        /// Prefix of session directories, e.g. `ses-`
        session_prefix: String,
    },
}

/// Discovery parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySpec {
    /// Directory layout
    pub layout: UnitLayout,
    /// Top-level names to skip (shared templates and similar)
    pub exclude: Vec<String>,
}

impl DiscoverySpec {
    /// Every subject directory, excluding the defaults
    pub fn subjects() -> Self {
        Self {
            layout: UnitLayout::Subjects {
                prefix: None,
                required_subdir: None,
            },
            exclude: DEFAULT_EXCLUSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Session directories below prefixed subject directories
    pub fn sessions(subject_prefix: impl Into<String>, session_prefix: impl Into<String>) -> Self {
        Self {
            layout: UnitLayout::Sessions {
                subject_prefix: subject_prefix.into(),
                session_prefix: session_prefix.into(),
            },
            exclude: DEFAULT_EXCLUSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Replace the exclusion list
    pub fn with_exclusions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = names.into_iter().map(Into::into).collect();
        self
    }

    /// Require a subdirectory inside each subject (subject layout only)
    pub fn requiring(mut self, subdir: impl Into<PathBuf>) -> Self {
        if let UnitLayout::Subjects { required_subdir, .. } = &mut self.layout {
            *required_subdir = Some(subdir.into());
        }
        self
    }

    /// Require a name prefix on subjects (subject layout only)
    pub fn with_prefix(mut self, value: impl Into<String>) -> Self {
        if let UnitLayout::Subjects { prefix, .. } = &mut self.layout {
            *prefix = Some(value.into());
        }
        self
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.exclude.iter().any(|e| e == name)
    }
}

impl Default for DiscoverySpec {
    fn default() -> Self {
        Self::subjects()
    }
}

/// Find the work units under `root`, sorted by id.
///
/// A missing root yields no units (with a warning). A root that exists but
/// cannot be listed is a [`NeuroBatchError::Discovery`].
pub fn discover_units(root: impl AsRef<Path>, spec: &DiscoverySpec) -> Result<Vec<WorkUnit>> {
    let root = root.as_ref();

    let entries = match list_dirs(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(root = %root.display(), "Data root does not exist; no units to schedule");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(NeuroBatchError::Discovery {
                path: root.to_path_buf(),
                source,
            })
        }
    };

    let mut units = Vec::new();

    for (name, path) in entries {
        if spec.is_excluded(&name) {
            debug!(entry = %name, "Excluded from discovery");
            continue;
        }

        match &spec.layout {
            UnitLayout::Subjects {
                prefix,
                required_subdir,
            } => {
                if prefix.as_deref().is_some_and(|p| !name.starts_with(p)) {
                    continue;
                }
                if let Some(subdir) = required_subdir {
                    if !path.join(subdir).is_dir() {
                        debug!(
                            entry = %name,
                            required = %subdir.display(),
                            "Skipping directory without required subdirectory"
                        );
                        continue;
                    }
                }
                units.push(WorkUnit::new(name, path));
            }
            UnitLayout::Sessions {
                subject_prefix,
                session_prefix,
            } => {
                if !name.starts_with(subject_prefix.as_str()) {
                    continue;
                }
                let sessions = list_dirs(&path).map_err(|source| NeuroBatchError::Discovery {
                    path: path.clone(),
                    source,
                })?;
                for (session, session_path) in sessions {
                    if session.starts_with(session_prefix.as_str()) {
                        units.push(WorkUnit::session(&name, &session, session_path));
                    }
                }
            }
        }
    }

    units.sort_by(|a, b| a.id.cmp(&b.id));
    debug!(root = %root.display(), count = units.len(), "Discovered units");

    if units.is_empty() {
        warn!(root = %root.display(), "No work units found");
    }

    Ok(units)
}

/// Visible subdirectories of `dir` as (name, path), sorted by name
fn list_dirs(dir: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            warn!(path = %path.display(), "Skipping directory with non UTF-8 name");
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        dirs.push((name, path));
    }

    dirs.sort();
    Ok(dirs)
}
