//! Group tables built by `aparcstats2table` and `asegstats2table`

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::batch::{BatchJob, ResetPolicy, WorkUnit};
use crate::config::StatsSettings;
use crate::pipeline::{literal, Pipeline, StepTemplate};
use crate::Result;

/// Write one `<unit root>/<freesurfer_dir>` line per unit. Returns the number
/// of lines written.
pub fn write_subjects_file(units: &[WorkUnit], freesurfer_dir: &str, path: &Path) -> Result<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut contents = String::new();
    for unit in units {
        contents.push_str(&unit.path(freesurfer_dir).to_string_lossy());
        contents.push('\n');
    }
    std::fs::File::create(path)?.write_all(contents.as_bytes())?;

    info!(path = %path.display(), subjects = units.len(), "Wrote subjects file");
    Ok(units.len())
}

/// Create `<output_dir>/<name>` for every table directory
pub fn create_parcellation_dirs(settings: &StatsSettings) -> Result<Vec<PathBuf>> {
    settings
        .table_dirs()
        .into_iter()
        .map(|name| {
            let dir = settings.output_dir.join(name);
            std::fs::create_dir_all(&dir)?;
            Ok(dir)
        })
        .collect()
}

/// One job per table: every (hemisphere, measure, parcellation) surface
/// table and every subcortical volume table.
///
/// Each job's unit is the directory the table lands in; the stale table is
/// removed before the tool runs and must exist afterwards.
pub fn table_jobs(settings: &StatsSettings, subjects_file: &Path) -> Vec<BatchJob> {
    let subjects = literal(&subjects_file.to_string_lossy());
    let mut jobs = Vec::new();

    for hemi in &settings.hemispheres {
        for meas in &settings.measurements {
            for parc in &settings.parcellations {
                let table = format!("{}.{}.{}.csv", hemi, parc, meas);
                let step = StepTemplate::new("aparcstats2table").args([
                    format!("--subjectsfile={}", subjects),
                    format!("--hemi={}", literal(hemi)),
                    format!("--meas={}", literal(meas)),
                    format!("--parc={}", literal(parc)),
                    format!("--tablefile={{unit_dir}}/{}", literal(&table)),
                    "--delimiter=comma".to_string(),
                    "--skip".to_string(),
                ]);
                jobs.push(table_job(settings, parc, &table, "aparcstats2table", step));
            }
        }
    }

    for sub in &settings.subcortical {
        let table = format!("{}.volume.csv", sub.stats_file);
        let step = StepTemplate::new("asegstats2table").args([
            format!("--subjectsfile={}", subjects),
            "--meas=volume".to_string(),
            format!("--statsfile={}.stats", literal(&sub.stats_file)),
            format!("--tablefile={{unit_dir}}/{}", literal(&table)),
            "--delimiter=comma".to_string(),
            "--skip".to_string(),
        ]);
        jobs.push(table_job(settings, &sub.table_dir, &table, "asegstats2table", step));
    }

    if jobs.is_empty() {
        warn!("No statistics tables configured");
    }
    jobs
}

fn table_job(settings: &StatsSettings, dir: &str, table: &str, tool: &str, step: StepTemplate) -> BatchJob {
    let unit = WorkUnit::new(format!("{}/{}", dir, table), settings.output_dir.join(dir));
    let pipeline = Pipeline::new(tool)
        .reset(ResetPolicy::none().remove(table))
        .step(step.expect_output(format!("{{unit_dir}}/{}", literal(table))));
    BatchJob::new(unit, Arc::new(pipeline))
}
