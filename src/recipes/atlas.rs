//! Atlas-based cortical and subcortical parcellation
//!
//! Every atlas is described by an [`AtlasDefinition`]. File paths in a
//! definition may use `{atlas_dir}` and `{hemi}`; the recipe expands `{hemi}`
//! per hemisphere and renders the rest against the pipeline variables.
//! All steps run with `SUBJECTS_DIR` set to the data root, and subjects are
//! addressed as `<subject>/<freesurfer_dir>` relative to it.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::batch::{CompletionCheck, DiscoverySpec, ResetPolicy};
use crate::config::AtlasSettings;
use crate::pipeline::{literal, Pipeline, StepTemplate};
use crate::recipes::Recipe;
use crate::{NeuroBatchError, Result};

const HEMISPHERES: [&str; 2] = ["lh", "rh"];

/// Where a surface annotation comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AnnotSource {
    /// Classify the subject's surface with a `.gcs` atlas (`mris_ca_label`)
    Classifier {
        /// Per-hemisphere classifier path
        gcs: String,
    },
    /// Resample an annotation from a template subject (`mri_surf2surf`)
    Transfer {
        /// Per-hemisphere annotation path on the template
        annot: String,
        /// Template subject, relative to `SUBJECTS_DIR`
        #[serde(default = "default_source_subject")]
        source_subject: String,
    },
}

fn default_source_subject() -> String {
    "fsaverage".to_string()
}

/// Volumetric labelling that accompanies a surface atlas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubcorticalAtlas {
    /// Output stem, e.g. `BN_Atlas_subcotex`
    pub name: String,
    /// Gaussian classifier atlas (`.gca`)
    pub gca: String,
    /// Colour table for `mri_segstats`
    pub lut: String,
}

/// One parcellation scheme
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtlasDefinition {
    /// Annotation and stats stem, e.g. `BN_Atlas`
    pub name: String,
    /// Annotation source
    pub source: AnnotSource,
    /// Colour table passed to `mris_anatomical_stats -c`
    #[serde(default)]
    pub lut: Option<String>,
    /// Restrict stats to the cortex label and emit a per-region table (`-mgz -cortex ... -b`)
    #[serde(default)]
    pub detailed_stats: bool,
    /// Optional subcortical counterpart
    #[serde(default)]
    pub subcortical: Option<SubcorticalAtlas>,
}

impl AtlasDefinition {
    /// Brainnetome 246 (surface and subcortex)
    pub fn bna246() -> Self {
        Self {
            name: "BN_Atlas".to_string(),
            source: AnnotSource::Classifier {
                gcs: "{atlas_dir}/BN_Atlas_246/{hemi}.BN_Atlas.gcs".to_string(),
            },
            lut: Some("{atlas_dir}/BN_Atlas_246/BN_Atlas_246_LUT.txt".to_string()),
            detailed_stats: true,
            subcortical: Some(SubcorticalAtlas {
                name: "BN_Atlas_subcotex".to_string(),
                gca: "{atlas_dir}/BN_Atlas_246/BN_Atlas_subcortex.gca".to_string(),
                lut: "{atlas_dir}/BN_Atlas_246/BN_Atlas_246_LUT_sub.txt".to_string(),
            }),
        }
    }

    /// HCP multi-modal parcellation, classifier variant
    pub fn hcp_mmp1() -> Self {
        Self {
            name: "hcp-mmp-b".to_string(),
            source: AnnotSource::Classifier {
                gcs: "{atlas_dir}/HCP_MMP_1/{hemi}.hcp-mmp-b_7p1.gcs".to_string(),
            },
            lut: Some("{atlas_dir}/HCP_MMP_1/LUT_hcp-mmp-b.txt".to_string()),
            detailed_stats: false,
            subcortical: None,
        }
    }

    /// HCP multi-modal parcellation resampled from fsaverage
    pub fn hcp_mmp1_transfer() -> Self {
        Self {
            name: "HCP-MMP1".to_string(),
            source: AnnotSource::Transfer {
                annot: "{atlas_dir}/{hemi}.HCP-MMP1.annot".to_string(),
                source_subject: default_source_subject(),
            },
            lut: None,
            detailed_stats: false,
            subcortical: None,
        }
    }

    /// Schaefer 2018, 200 parcels, 17 networks
    pub fn schaefer200() -> Self {
        Self {
            name: "Schaefer200".to_string(),
            source: AnnotSource::Classifier {
                gcs: "{atlas_dir}/Schaefer200/{hemi}.Schaefer2018_200Parcels_17Networks.gcs".to_string(),
            },
            lut: Some("{atlas_dir}/Schaefer200/Schaefer2018_200Parcels_17Networks_order_LUT.txt".to_string()),
            detailed_stats: false,
            subcortical: None,
        }
    }

    fn annot(&self, hemi: &str) -> String {
        format!("{{label}}/{}.{}.annot", hemi, self.name)
    }

    fn stats(&self, hemi: &str) -> String {
        format!("{{stats}}/{}.{}.stats", hemi, self.name)
    }

    fn label_step(&self, hemi: &str) -> StepTemplate {
        let step = match &self.source {
            AnnotSource::Classifier { gcs } => StepTemplate::new("mris_ca_label").args([
                "-l".to_string(),
                format!("{{label}}/{}.cortex.label", hemi),
                "{subject_arg}".to_string(),
                hemi.to_string(),
                format!("{{surf}}/{}.sphere.reg", hemi),
                per_hemi(gcs, hemi),
                self.annot(hemi),
            ]),
            AnnotSource::Transfer { annot, source_subject } => StepTemplate::new("mri_surf2surf").args([
                "--srcsubject".to_string(),
                literal(source_subject),
                "--trgsubject".to_string(),
                "{subject_arg}".to_string(),
                "--hemi".to_string(),
                hemi.to_string(),
                "--sval-annot".to_string(),
                per_hemi(annot, hemi),
                "--tval".to_string(),
                self.annot(hemi),
            ]),
        };
        step.expect_output(self.annot(hemi))
    }

    fn stats_step(&self, hemi: &str) -> StepTemplate {
        let mut step = StepTemplate::new("mris_anatomical_stats");
        if self.detailed_stats {
            step = step
                .args(["-mgz", "-cortex"])
                .arg(format!("{{label}}/{}.cortex.label", hemi))
                .arg("-f")
                .arg(self.stats(hemi))
                .arg("-b")
                .arg("-a")
                .arg(self.annot(hemi));
        } else {
            step = step.arg("-a").arg(self.annot(hemi)).arg("-f").arg(self.stats(hemi));
        }
        if let Some(lut) = &self.lut {
            step = step.arg("-c").arg(lut.clone());
        }
        step = step.arg("{subject_arg}").arg(hemi);
        if self.detailed_stats {
            step = step.arg("white");
        }
        step.expect_output(self.stats(hemi))
    }

    /// Steps for this atlas: labels, subcortical labelling, then stats
    fn steps(&self) -> Vec<StepTemplate> {
        let mut steps: Vec<StepTemplate> = HEMISPHERES.iter().map(|h| self.label_step(h)).collect();

        if let Some(sub) = &self.subcortical {
            steps.push(
                StepTemplate::new("mri_ca_label")
                    .args(["{mri}/brain.mgz", "{mri}/transforms/talairach.m3z"])
                    .arg(sub.gca.clone())
                    .arg(format!("{{mri}}/{}.mgz", sub.name))
                    .expect_output(format!("{{mri}}/{}.mgz", sub.name)),
            );
        }

        steps.extend(HEMISPHERES.iter().map(|h| self.stats_step(h)));

        if let Some(sub) = &self.subcortical {
            steps.push(
                StepTemplate::new("mri_segstats")
                    .arg("--seg")
                    .arg(format!("{{mri}}/{}.mgz", sub.name))
                    .arg("--ctab")
                    .arg(sub.lut.clone())
                    .args(["--excludeid", "0", "--sum"])
                    .arg(format!("{{stats}}/{}.stats", sub.name))
                    .expect_output(format!("{{stats}}/{}.stats", sub.name)),
            );
        }

        steps
    }

    /// Stats files this atlas produces, relative to the FreeSurfer directory
    fn stats_outputs(&self) -> Vec<String> {
        let mut outputs: Vec<String> = HEMISPHERES
            .iter()
            .map(|h| format!("stats/{}.{}.stats", h, self.name))
            .collect();
        if let Some(sub) = &self.subcortical {
            outputs.push(format!("stats/{}.stats", sub.name));
        }
        outputs
    }

    /// Every file this atlas writes, relative to the FreeSurfer directory
    fn all_outputs(&self) -> Vec<String> {
        let mut outputs: Vec<String> = HEMISPHERES
            .iter()
            .map(|h| format!("label/{}.{}.annot", h, self.name))
            .collect();
        if let Some(sub) = &self.subcortical {
            outputs.push(format!("mri/{}.mgz", sub.name));
        }
        outputs.extend(self.stats_outputs());
        outputs
    }
}

fn per_hemi(template: &str, hemi: &str) -> String {
    template.replace("{hemi}", hemi)
}

/// BNA246, HCP-MMP1 and Schaefer200
pub fn standard_atlases() -> Vec<AtlasDefinition> {
    vec![
        AtlasDefinition::bna246(),
        AtlasDefinition::hcp_mmp1(),
        AtlasDefinition::schaefer200(),
    ]
}

/// Parcellate every subject with a list of atlases
#[derive(Debug, Clone)]
pub struct AtlasRecipe {
    data_dir: PathBuf,
    atlas_dir: PathBuf,
    freesurfer_dir: String,
    atlases: Vec<AtlasDefinition>,
    exclude: Option<Vec<String>>,
}

impl AtlasRecipe {
    /// Recipe over `data_dir` using atlas files from `atlas_dir`
    pub fn new(data_dir: impl Into<PathBuf>, atlas_dir: impl Into<PathBuf>, atlases: Vec<AtlasDefinition>) -> Self {
        Self {
            data_dir: data_dir.into(),
            atlas_dir: atlas_dir.into(),
            freesurfer_dir: "FreeSurfer".to_string(),
            atlases,
            exclude: None,
        }
    }

    /// Build from settings
    pub fn from_settings(data_dir: impl Into<PathBuf>, settings: &AtlasSettings) -> Self {
        Self {
            freesurfer_dir: settings.freesurfer_dir.clone(),
            ..Self::new(data_dir, settings.atlas_dir.clone(), settings.atlases.clone())
        }
    }

    /// Replace the discovery exclusion list
    pub fn with_exclusions(mut self, names: Vec<String>) -> Self {
        self.exclude = Some(names);
        self
    }

    fn fs_relative(&self, path: &str) -> PathBuf {
        Path::new(&self.freesurfer_dir).join(path)
    }
}

impl Recipe for AtlasRecipe {
    fn name(&self) -> &str {
        "atlas"
    }

    fn discovery(&self) -> DiscoverySpec {
        match &self.exclude {
            Some(names) => DiscoverySpec::subjects().with_exclusions(names.clone()),
            None => DiscoverySpec::subjects(),
        }
    }

    fn pipeline(&self) -> Result<Pipeline> {
        if self.atlases.is_empty() {
            return Err(NeuroBatchError::InvalidSetting("no atlases configured".to_string()));
        }

        let fs = literal(&self.freesurfer_dir);
        let mut pipeline = Pipeline::new(self.name())
            .var("data_dir", literal(&self.data_dir.to_string_lossy()))
            .var("atlas_dir", literal(&self.atlas_dir.to_string_lossy()))
            .var("fs", format!("{{unit_dir}}/{}", fs))
            .var("subject_arg", format!("{{subject}}/{}", fs))
            .var("label", "{fs}/label")
            .var("surf", "{fs}/surf")
            .var("mri", "{fs}/mri")
            .var("stats", "{fs}/stats")
            .prepare_dir("{label}")
            .prepare_dir("{stats}");

        for hemi in HEMISPHERES {
            pipeline = pipeline.require_input(format!("{{surf}}/{}.sphere.reg", hemi));
        }

        let completion = self
            .atlases
            .iter()
            .flat_map(|a| a.stats_outputs())
            .map(|p| self.fs_relative(&p));
        pipeline = pipeline.completion(CompletionCheck::all_of(completion));

        let mut reset = ResetPolicy::none();
        for output in self.atlases.iter().flat_map(|a| a.all_outputs()) {
            reset = reset.remove(self.fs_relative(&output));
        }
        pipeline = pipeline.reset(reset);

        for step in self.atlases.iter().flat_map(|a| a.steps()) {
            pipeline = pipeline.step(step.env("SUBJECTS_DIR", "{data_dir}"));
        }

        Ok(pipeline)
    }
}

/// Make the template subject visible as `<data_dir>/fsaverage`.
///
/// A relative `source` is resolved against the working directory so the link
/// never depends on where it is placed. A dangling link left by an earlier
/// run is replaced. Returns `true` when a link was created, `false` when a
/// usable entry already occupies the name.
pub fn ensure_template_link(data_dir: impl AsRef<Path>, source: impl AsRef<Path>) -> io::Result<bool> {
    let link = data_dir.as_ref().join("fsaverage");
    let source = if source.as_ref().is_absolute() {
        source.as_ref().to_path_buf()
    } else {
        std::env::current_dir()?.join(source.as_ref())
    };

    match link.symlink_metadata() {
        Ok(metadata) if metadata.file_type().is_symlink() && !link.exists() => {
            warn!(link = %link.display(), "Replacing dangling template link");
            remove_link(&link)?;
        }
        Ok(_) => return Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    symlink_dir(&source, &link)?;
    info!(link = %link.display(), source = %source.display(), "Linked template subject");
    Ok(true)
}

#[cfg(unix)]
fn remove_link(link: &Path) -> io::Result<()> {
    std::fs::remove_file(link)
}

#[cfg(windows)]
fn remove_link(link: &Path) -> io::Result<()> {
    std::fs::remove_dir(link)
}

#[cfg(unix)]
fn symlink_dir(source: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, link)
}

#[cfg(windows)]
fn symlink_dir(source: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(source, link)
}
