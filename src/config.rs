//! # Run Configuration
//!
//! Immutable settings for every stage, loaded once from a TOML file. Every
//! field has a default, so an empty file (or none at all) is valid.
//!
//! ```rust
//! use neurobatch::config::Settings;
//!
//! let settings = Settings::from_toml_str(r#"
//!     [batch]
//!     data_dir = "/data/sorted"
//!     max_concurrency = 8
//!
//!     [dti]
//!     erode = false
//! "#).unwrap();
//!
//! assert_eq!(settings.batch.max_concurrency, Some(8));
//! assert!(!settings.dti.erode);
//! assert_eq!(settings.stats.hemispheres, vec!["lh", "rh"]);
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::DEFAULT_EXCLUSIONS;
use crate::recipes::{standard_atlases, AtlasDefinition};
use crate::{NeuroBatchError, Result};

/// All run settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Shared batch settings
    pub batch: BatchSettings,
    /// recon-all stage
    pub recon: ReconSettings,
    /// Atlas parcellation stage
    pub atlas: AtlasSettings,
    /// Diffusion stages (dtifit, erode + registration)
    pub dti: DtiSettings,
    /// Statistics aggregation stage
    pub stats: StatsSettings,
}

/// Settings shared by every stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Directory containing one folder per subject
    pub data_dir: PathBuf,
    /// Default worker count (number of CPUs when unset)
    pub max_concurrency: Option<usize>,
    /// Append-only batch log
    pub log_file: Option<PathBuf>,
    /// Top-level directory names that are never units
    pub exclude: Vec<String>,
    /// Write the JSON batch report here
    pub report_file: Option<PathBuf>,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            max_concurrency: None,
            log_file: None,
            exclude: DEFAULT_EXCLUSIONS.iter().map(|s| s.to_string()).collect(),
            report_file: None,
        }
    }
}

/// How recon-all units are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReconLayout {
    /// One unit per subject directory
    #[default]
    Subjects,
    /// One unit per `<subject>/<session>` directory
    Sessions,
}

/// recon-all settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconSettings {
    /// Unit layout
    pub layout: ReconLayout,
    /// T1 image relative to the unit (layout default when unset)
    pub input: Option<String>,
    /// Subject directory prefix for the session layout
    pub subject_prefix: String,
    /// Session directory prefix for the session layout
    pub session_prefix: String,
    /// Worker count for this stage
    pub max_concurrency: Option<usize>,
}

impl Default for ReconSettings {
    fn default() -> Self {
        Self {
            layout: ReconLayout::Subjects,
            input: None,
            subject_prefix: "sub_".to_string(),
            session_prefix: "ses-".to_string(),
            max_concurrency: None,
        }
    }
}

impl ReconSettings {
    /// Input image for the configured layout
    pub fn input_image(&self) -> &str {
        match (&self.input, self.layout) {
            (Some(input), _) => input,
            (None, ReconLayout::Subjects) => "t1/T1_unbiased.nii.gz",
            (None, ReconLayout::Sessions) => "anat/data.nii.gz",
        }
    }
}

/// Atlas parcellation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasSettings {
    /// Directory holding the atlas classifier, annotation and LUT files
    pub atlas_dir: PathBuf,
    /// FreeSurfer subject directory inside each unit
    pub freesurfer_dir: String,
    /// Template subject linked as `<data_dir>/fsaverage` when absent
    pub fsaverage: Option<PathBuf>,
    /// Atlases to apply, in order
    pub atlases: Vec<AtlasDefinition>,
    /// Worker count for this stage
    pub max_concurrency: Option<usize>,
}

impl Default for AtlasSettings {
    fn default() -> Self {
        Self {
            atlas_dir: PathBuf::from("atlas"),
            freesurfer_dir: "FreeSurfer".to_string(),
            fsaverage: None,
            atlases: standard_atlases(),
            max_concurrency: Some(4),
        }
    }
}

/// Diffusion settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DtiSettings {
    /// Erode and crop FA before registration; plain copy otherwise
    pub erode: bool,
    /// Registration reference (`$FSLDIR/data/standard/FMRIB58_FA_1mm` when unset)
    pub reference: Option<PathBuf>,
    /// FNIRT configuration name or path
    pub fnirt_config: String,
    /// Registered FA file stem, written under `dwi/`
    pub output_fa: String,
    /// Warped MD file stem, written under `dwi/`
    pub output_md: String,
    /// Worker count for these stages
    pub max_concurrency: Option<usize>,
}

impl Default for DtiSettings {
    fn default() -> Self {
        Self {
            erode: true,
            reference: None,
            fnirt_config: "FA_2_FMRIB58_1mm.cnf".to_string(),
            output_fa: "FA_in_MNI".to_string(),
            output_md: "MD_in_MNI".to_string(),
            max_concurrency: None,
        }
    }
}

impl DtiSettings {
    /// Registration reference image, falling back to `$FSLDIR`
    pub fn reference_image(&self) -> Result<PathBuf> {
        if let Some(reference) = &self.reference {
            return Ok(reference.clone());
        }
        match std::env::var_os("FSLDIR") {
            Some(fsl_dir) if !fsl_dir.is_empty() => {
                Ok(Path::new(&fsl_dir).join("data/standard/FMRIB58_FA_1mm"))
            }
            _ => Err(NeuroBatchError::InvalidSetting(
                "FSLDIR is not set and dti.reference is not configured".to_string(),
            )),
        }
    }
}

/// A subcortical volume table built with `asegstats2table`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubcorticalTable {
    /// Stats file stem in each subject's `stats/` (e.g. `aseg`)
    pub stats_file: String,
    /// Parcellation directory the table is written into
    pub table_dir: String,
}

/// Statistics aggregation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSettings {
    /// Output directory for tables, summary and workbooks
    pub output_dir: PathBuf,
    /// FreeSurfer subject directory inside each unit
    pub freesurfer_dir: String,
    /// Hemispheres tabulated
    pub hemispheres: Vec<String>,
    /// Surface measures tabulated
    pub measurements: Vec<String>,
    /// Surface parcellations tabulated
    pub parcellations: Vec<String>,
    /// Subcortical volume tables
    pub subcortical: Vec<SubcorticalTable>,
    /// Worker count for table extraction
    pub max_concurrency: Option<usize>,
}

impl Default for StatsSettings {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            output_dir: PathBuf::from("code"),
            freesurfer_dir: "FreeSurfer".to_string(),
            hemispheres: strings(&["lh", "rh"]),
            measurements: strings(&[
                "area", "volume", "thickness", "meancurv", "gauscurv", "foldind", "curvind",
            ]),
            parcellations: strings(&["aparc", "BN_Atlas", "Schaefer200", "hcp-mmp-b"]),
            subcortical: vec![
                SubcorticalTable {
                    stats_file: "aseg".to_string(),
                    table_dir: "aparc".to_string(),
                },
                SubcorticalTable {
                    stats_file: "BN_Atlas_subcotex".to_string(),
                    table_dir: "BN_Atlas".to_string(),
                },
            ],
            max_concurrency: Some(8),
        }
    }
}

impl StatsSettings {
    /// Every parcellation directory a table is written into
    pub fn table_dirs(&self) -> Vec<&str> {
        let mut dirs: Vec<&str> = self.parcellations.iter().map(String::as_str).collect();
        for table in &self.subcortical {
            if !dirs.contains(&table.table_dir.as_str()) {
                dirs.push(&table.table_dir);
            }
        }
        dirs
    }
}

impl Settings {
    /// Load and validate settings from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading settings from: {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(NeuroBatchError::InvalidSetting(msg));

        for (section, value) in [
            ("batch", self.batch.max_concurrency),
            ("recon", self.recon.max_concurrency),
            ("atlas", self.atlas.max_concurrency),
            ("dti", self.dti.max_concurrency),
            ("stats", self.stats.max_concurrency),
        ] {
            if value == Some(0) {
                return invalid(format!("{}.max_concurrency must be at least 1", section));
            }
        }

        if let Some(hemi) = self.stats.hemispheres.iter().find(|h| !matches!(h.as_str(), "lh" | "rh")) {
            return invalid(format!("unknown hemisphere '{}'", hemi));
        }

        let mut names = HashSet::new();
        for atlas in &self.atlas.atlases {
            if atlas.name.is_empty() {
                return invalid("atlas name must not be empty".to_string());
            }
            if !names.insert(atlas.name.as_str()) {
                return invalid(format!("atlas '{}' is defined twice", atlas.name));
            }
        }

        Ok(())
    }

    /// Worker count for a stage: its own setting, then the batch default,
    /// then the number of CPUs
    pub fn concurrency_for(&self, stage: Option<usize>) -> usize {
        stage
            .or(self.batch.max_concurrency)
            .unwrap_or_else(num_cpus::get)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_config_uses_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.batch.exclude, vec!["fsaverage"]);
        assert_eq!(settings.stats.measurements.len(), 7);
        assert_eq!(settings.stats.table_dirs(), vec!["aparc", "BN_Atlas", "Schaefer200", "hcp-mmp-b"]);
        assert_eq!(settings.atlas.atlases.len(), 3);
        assert_eq!(settings.recon.input_image(), "t1/T1_unbiased.nii.gz");
    }

    #[test]
    fn test_session_layout() {
        let settings = Settings::from_toml_str("[recon]\nlayout = \"sessions\"\n").unwrap();
        assert_eq!(settings.recon.layout, ReconLayout::Sessions);
        assert_eq!(settings.recon.input_image(), "anat/data.nii.gz");
    }

    #[test]
    fn test_concurrency_precedence() {
        let settings = Settings::from_toml_str("[batch]\nmax_concurrency = 6\n").unwrap();
        assert_eq!(settings.concurrency_for(Some(2)), 2);
        assert_eq!(settings.concurrency_for(None), 6);
        assert_eq!(settings.concurrency_for(settings.stats.max_concurrency), 8);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(matches!(
            Settings::from_toml_str("[batch]\nmax_concurrency = 0\n"),
            Err(NeuroBatchError::InvalidSetting(_))
        ));
        assert!(matches!(
            Settings::from_toml_str("[stats]\nhemispheres = [\"lh\", \"xh\"]\n"),
            Err(NeuroBatchError::InvalidSetting(_))
        ));
        assert!(matches!(
            Settings::from_toml_str("[batch]\nmax_concurrency = \"many\"\n"),
            Err(NeuroBatchError::Config(_))
        ));
    }

    #[test]
    fn test_explicit_reference_wins() {
        let dti = DtiSettings {
            reference: Some(PathBuf::from("/ref/FA")),
            ..Default::default()
        };
        assert_eq!(dti.reference_image().unwrap(), PathBuf::from("/ref/FA"));
    }
}
