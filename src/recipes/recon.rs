//! FreeSurfer `recon-all` cortical reconstruction

use crate::batch::{CompletionCheck, DiscoverySpec, ResetPolicy};
use crate::config::{ReconLayout, ReconSettings};
use crate::pipeline::{literal, Pipeline, StepTemplate};
use crate::recipes::Recipe;
use crate::Result;

/// FreeSurfer subject directory created inside each unit
pub const SUBJECT_DIR: &str = "fs";
/// Written by recon-all when every stage finished
pub const DONE_FILE: &str = "fs/scripts/recon-all.done";
/// recon-all's own log
pub const LOG_FILE: &str = "fs/scripts/recon-all.log";
/// Success marker inside [`LOG_FILE`]
pub const SUCCESS_MARKER: &str = "finished without error";

/// Full cortical reconstruction of one T1 image per unit.
///
/// Each unit gets `recon-all -all -s fs -i <unit>/<input> -sd <unit>`; the
/// unit directory doubles as `SUBJECTS_DIR`, so outputs land in `<unit>/fs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconRecipe {
    layout: ReconLayout,
    input: String,
    subject_prefix: String,
    session_prefix: String,
    exclude: Option<Vec<String>>,
}

impl ReconRecipe {
    /// One unit per subject directory
    pub fn subjects(input: impl Into<String>) -> Self {
        Self {
            layout: ReconLayout::Subjects,
            input: input.into(),
            subject_prefix: "sub_".to_string(),
            session_prefix: "ses-".to_string(),
            exclude: None,
        }
    }

    /// One unit per `sub_*/ses-*` directory
    pub fn sessions(input: impl Into<String>) -> Self {
        Self {
            layout: ReconLayout::Sessions,
            ..Self::subjects(input)
        }
    }

    /// Build from settings
    pub fn from_settings(settings: &ReconSettings) -> Self {
        Self {
            layout: settings.layout,
            input: settings.input_image().to_string(),
            subject_prefix: settings.subject_prefix.clone(),
            session_prefix: settings.session_prefix.clone(),
            exclude: None,
        }
    }

    /// Replace the discovery exclusion list
    pub fn with_exclusions(mut self, names: Vec<String>) -> Self {
        self.exclude = Some(names);
        self
    }
}

impl Recipe for ReconRecipe {
    fn name(&self) -> &str {
        "recon-all"
    }

    fn discovery(&self) -> DiscoverySpec {
        let spec = match self.layout {
            ReconLayout::Subjects => DiscoverySpec::subjects(),
            ReconLayout::Sessions => DiscoverySpec::sessions(&self.subject_prefix, &self.session_prefix),
        };
        match &self.exclude {
            Some(names) => spec.with_exclusions(names.clone()),
            None => spec,
        }
    }

    fn pipeline(&self) -> Result<Pipeline> {
        let input = format!("{{unit_dir}}/{}", literal(&self.input));

        Ok(Pipeline::new(self.name())
            .require_input(input.clone())
            .completion(CompletionCheck::sentinel(DONE_FILE).with_log_marker(LOG_FILE, SUCCESS_MARKER))
            .reset(ResetPolicy::none().remove(SUBJECT_DIR))
            .step(
                StepTemplate::new("recon-all")
                    .args(["-all", "-s", SUBJECT_DIR, "-i"])
                    .arg(input)
                    .args(["-sd", "{unit_dir}"]),
            ))
    }
}
