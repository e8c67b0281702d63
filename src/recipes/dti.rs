//! Diffusion tensor fitting and FA/MD registration to standard space

use std::path::PathBuf;

use crate::batch::{CompletionCheck, DiscoverySpec, ResetPolicy};
use crate::config::DtiSettings;
use crate::pipeline::{literal, Capture, Pipeline, StepTemplate};
use crate::recipes::Recipe;
use crate::Result;

/// `dtifit` on the preprocessed diffusion data of every subject with a `dwi` folder
#[derive(Debug, Clone, Default)]
pub struct DtifitRecipe {
    exclude: Option<Vec<String>>,
}

impl DtifitRecipe {
    /// Create the recipe
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the discovery exclusion list
    pub fn with_exclusions(mut self, names: Vec<String>) -> Self {
        self.exclude = Some(names);
        self
    }
}

impl Recipe for DtifitRecipe {
    fn name(&self) -> &str {
        "dtifit"
    }

    fn discovery(&self) -> DiscoverySpec {
        let spec = DiscoverySpec::subjects().requiring("dwi");
        match &self.exclude {
            Some(names) => spec.with_exclusions(names.clone()),
            None => spec,
        }
    }

    fn pipeline(&self) -> Result<Pipeline> {
        Ok(Pipeline::new(self.name())
            .var("dwi", "{unit_dir}/dwi")
            .var("out", "{dwi}/dtifit")
            .require_input("{dwi}/data_ud.nii.gz")
            .require_input("{dwi}/raw/b0_brain_mask.nii.gz")
            .require_input("{dwi}/bvecs")
            .require_input("{dwi}/bvals")
            .prepare_dir("{out}")
            .completion(CompletionCheck::all_of([
                "dwi/dtifit/dti_FA.nii.gz",
                "dwi/dtifit/dti_MD.nii.gz",
                "dwi/dtifit/dti_tensor.nii.gz",
            ]))
            .reset(ResetPolicy::none().remove("dwi/dtifit"))
            .step(
                StepTemplate::new("dtifit")
                    .args([
                        "--data={dwi}/data_ud.nii.gz",
                        "--out={out}/dti",
                        "--mask={dwi}/raw/b0_brain_mask.nii.gz",
                        "--bvecs={dwi}/bvecs",
                        "--bvals={dwi}/bvals",
                        "--save_tensor",
                    ])
                    .expect_output("{out}/dti_FA.nii.gz"),
            ))
    }
}

/// Erode/crop FA, register it to the FMRIB58 template (FLIRT then FNIRT) and
/// apply the same warp to MD
#[derive(Debug, Clone)]
pub struct RegistrationRecipe {
    erode: bool,
    reference: PathBuf,
    fnirt_config: String,
    output_fa: String,
    output_md: String,
    exclude: Option<Vec<String>>,
}

impl RegistrationRecipe {
    /// Registration against `reference` with the default FNIRT config and output names
    pub fn new(reference: impl Into<PathBuf>, erode: bool) -> Self {
        let defaults = DtiSettings::default();
        Self {
            erode,
            reference: reference.into(),
            fnirt_config: defaults.fnirt_config,
            output_fa: defaults.output_fa,
            output_md: defaults.output_md,
            exclude: None,
        }
    }

    /// Build from settings; fails when no reference image can be resolved
    pub fn from_settings(settings: &DtiSettings) -> Result<Self> {
        Ok(Self {
            erode: settings.erode,
            reference: settings.reference_image()?,
            fnirt_config: settings.fnirt_config.clone(),
            output_fa: settings.output_fa.clone(),
            output_md: settings.output_md.clone(),
            exclude: None,
        })
    }

    /// Replace the discovery exclusion list
    pub fn with_exclusions(mut self, names: Vec<String>) -> Self {
        self.exclude = Some(names);
        self
    }

    fn output_files(&self) -> [String; 2] {
        [
            format!("dwi/{}.nii.gz", self.output_fa),
            format!("dwi/{}.nii.gz", self.output_md),
        ]
    }
}

impl Recipe for RegistrationRecipe {
    fn name(&self) -> &str {
        "fa-registration"
    }

    fn discovery(&self) -> DiscoverySpec {
        let spec = DiscoverySpec::subjects().requiring("dwi/dtifit");
        match &self.exclude {
            Some(names) => spec.with_exclusions(names.clone()),
            None => spec,
        }
    }

    fn pipeline(&self) -> Result<Pipeline> {
        let [out_fa, out_md] = self.output_files();

        let mut pipeline = Pipeline::new(self.name())
            .var("ref", literal(&self.reference.to_string_lossy()))
            .var("fnirt_config", literal(&self.fnirt_config))
            .var("dwi", "{unit_dir}/dwi")
            .var("dti", "{dwi}/dtifit")
            .var("tmp", "{dti}/reg_temp")
            .var("fa_in", "{dti}/dti_FA.nii.gz")
            .var("md_in", "{dti}/dti_MD.nii.gz")
            .var("out_fa", format!("{{unit_dir}}/{}", literal(&out_fa)))
            .var("out_md", format!("{{unit_dir}}/{}", literal(&out_md)))
            .var("fa_ero", "{tmp}/FA_ero.nii.gz")
            .var("fa_mask", "{tmp}/FA_ero_mask.nii.gz")
            .var("affine", "{tmp}/fa2mni_affine.mat")
            .var("fa_lin", "{tmp}/FA_lin.nii.gz")
            .var("warp", "{tmp}/FA_to_MNI_warp.nii.gz")
            .var("fnirt_log", "{tmp}/fnirt.log")
            .require_input("{fa_in}")
            .require_input("{md_in}")
            .prepare_dir("{tmp}")
            .completion(CompletionCheck::all_of(self.output_files()))
            .reset(
                ResetPolicy::none()
                    .remove(out_fa)
                    .remove(out_md)
                    .remove("dwi/dtifit/reg_temp"),
            );

        if self.erode {
            for (axis, name) in [("dim1", "dimx"), ("dim2", "dimy"), ("dim3", "dimz")] {
                pipeline = pipeline.step(
                    StepTemplate::new("fslval")
                        .args(["{fa_in}", axis])
                        .capture(Capture::integer_offset(name, -2)),
                );
            }
            pipeline = pipeline.step(
                StepTemplate::new("fslmaths")
                    .args([
                        "{fa_in}", "-min", "1", "-ero", "-roi", "1", "{dimx}", "1", "{dimy}", "1", "{dimz}",
                        "0", "1", "{fa_ero}",
                    ])
                    .expect_output("{fa_ero}"),
            );
        } else {
            pipeline = pipeline.step(
                StepTemplate::new("cp")
                    .args(["{fa_in}", "{fa_ero}"])
                    .expect_output("{fa_ero}"),
            );
        }

        Ok(pipeline
            .step(StepTemplate::new("fslmaths").args(["{fa_ero}", "-bin", "{fa_mask}"]))
            .step(StepTemplate::new("flirt").args([
                "-in", "{fa_ero}", "-ref", "{ref}", "-omat", "{affine}", "-out", "{fa_lin}", "-interp",
                "trilinear", "-dof", "12", "-inweight", "{fa_mask}",
            ]))
            .step(
                StepTemplate::new("fnirt")
                    .args([
                        "--in={fa_ero}",
                        "--ref={ref}",
                        "--aff={affine}",
                        "--cout={warp}",
                        "--iout={out_fa}",
                        "--config={fnirt_config}",
                        "--logout={fnirt_log}",
                    ])
                    .expect_output("{out_fa}"),
            )
            .step(
                StepTemplate::new("applywarp")
                    .args([
                        "--in={md_in}",
                        "--ref={ref}",
                        "--warp={warp}",
                        "--out={out_md}",
                        "--abs",
                        "--interp=trilinear",
                    ])
                    .expect_output("{out_md}"),
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::WorkUnit;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_dtifit_command_line() {
        let steps = DtifitRecipe::new()
            .pipeline()
            .unwrap()
            .render_steps(&WorkUnit::new("AD01", "/sorted/AD01"))
            .unwrap();
        assert_eq!(
            steps[0].arguments,
            vec![
                "--data=/sorted/AD01/dwi/data_ud.nii.gz",
                "--out=/sorted/AD01/dwi/dtifit/dti",
                "--mask=/sorted/AD01/dwi/raw/b0_brain_mask.nii.gz",
                "--bvecs=/sorted/AD01/dwi/bvecs",
                "--bvals=/sorted/AD01/dwi/bvals",
                "--save_tensor",
            ]
        );
    }

    #[test]
    fn test_registration_with_erosion() {
        let pipeline = RegistrationRecipe::new("/fsl/data/standard/FMRIB58_FA_1mm", true)
            .pipeline()
            .unwrap();
        let steps = pipeline.render_steps(&WorkUnit::new("AD01", "/s/AD01")).unwrap();
        let programs: Vec<&str> = steps.iter().map(|s| s.program.as_str()).collect();
        assert_eq!(
            programs,
            vec!["fslval", "fslval", "fslval", "fslmaths", "fslmaths", "flirt", "fnirt", "applywarp"]
        );

        let tmp = "/s/AD01/dwi/dtifit/reg_temp";
        assert_eq!(
            steps[3].arguments,
            vec![
                "/s/AD01/dwi/dtifit/dti_FA.nii.gz".to_string(),
                "-min".to_string(),
                "1".to_string(),
                "-ero".to_string(),
                "-roi".to_string(),
                "1".to_string(),
                "<dimx>".to_string(),
                "1".to_string(),
                "<dimy>".to_string(),
                "1".to_string(),
                "<dimz>".to_string(),
                "0".to_string(),
                "1".to_string(),
                format!("{tmp}/FA_ero.nii.gz"),
            ]
        );
        assert_eq!(
            steps[6].arguments,
            vec![
                format!("--in={tmp}/FA_ero.nii.gz"),
                "--ref=/fsl/data/standard/FMRIB58_FA_1mm".to_string(),
                format!("--aff={tmp}/fa2mni_affine.mat"),
                format!("--cout={tmp}/FA_to_MNI_warp.nii.gz"),
                "--iout=/s/AD01/dwi/FA_in_MNI.nii.gz".to_string(),
                "--config=FA_2_FMRIB58_1mm.cnf".to_string(),
                format!("--logout={tmp}/fnirt.log"),
            ]
        );
        assert_eq!(
            pipeline.completion.sentinels,
            vec![PathBuf::from("dwi/FA_in_MNI.nii.gz"), PathBuf::from("dwi/MD_in_MNI.nii.gz")]
        );
    }

    #[test]
    fn test_registration_without_erosion_copies() {
        let steps = RegistrationRecipe::new("/ref", false)
            .pipeline()
            .unwrap()
            .render_steps(&WorkUnit::new("AD01", "/s/AD01"))
            .unwrap();
        assert_eq!(steps[0].program, "cp");
        assert_eq!(steps.len(), 5);
        assert!(steps[2].arguments.windows(2).any(|w| w == ["-dof", "12"]));
    }
}
