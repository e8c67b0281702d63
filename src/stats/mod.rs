//! Statistics aggregation over recon-all outputs
//!
//! - [`tables`]: group tables built by the FreeSurfer table tools
//! - [`extract`]: regex scraping of `.stats` files
//! - [`summary`]: the whole-brain `Global.csv`
//! - [`workbook`]: one xlsx workbook per parcellation

pub mod extract;
pub mod summary;
pub mod tables;
pub mod workbook;

pub use extract::{extract_from_file, extract_metrics, MetricKind, MetricRule, MetricSchema, MetricSet, MetricValue};
pub use summary::{collect_global_metrics, vertex_weighted_thickness, write_global_csv, GlobalRow, GLOBAL_COLUMNS};
pub use tables::{create_parcellation_dirs, table_jobs, write_subjects_file};
pub use workbook::{merge_parcellation_workbook, normalize_subject, sheet_name_for, SkippedTable, WorkbookReport};

use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::batch::{BatchExecutor, BatchReport, WorkUnit};
use crate::config::StatsSettings;
use crate::Result;

/// Name of the subject list handed to the table tools
pub const SUBJECTS_FILE: &str = "subj_path.txt";

/// Everything produced by one statistics run
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    /// Subjects listed in the subjects file
    pub subjects: usize,
    /// Table extraction batch, absent when there were no subjects
    pub tables: Option<BatchReport>,
    /// Summary table, when written
    pub global_csv: Option<PathBuf>,
    /// Rows in the summary table
    pub global_rows: usize,
    /// One entry per table directory
    pub workbooks: Vec<WorkbookReport>,
}

impl StatsReport {
    /// Whether any table job failed
    pub fn has_failures(&self) -> bool {
        self.tables.as_ref().map_or(false, |t| !t.is_success())
    }
}

/// Build group tables, the summary CSV and the workbooks for `units`.
///
/// Table jobs go through `executor`, so a failing table tool is reported
/// like any failing unit and the remaining outputs are still assembled.
#[instrument(skip(units, settings, executor), fields(subjects = units.len()))]
pub async fn run_stats(units: &[WorkUnit], settings: &StatsSettings, executor: &BatchExecutor) -> Result<StatsReport> {
    let out_dir = settings.output_dir.clone();
    let subjects_file = out_dir.join(SUBJECTS_FILE);
    let subjects = write_subjects_file(units, &settings.freesurfer_dir, &subjects_file)?;
    create_parcellation_dirs(settings)?;

    let tables = if subjects == 0 {
        warn!("No subjects found; skipping table extraction");
        None
    } else {
        Some(executor.run_batch(table_jobs(settings, &subjects_file)).await?)
    };

    let global_path = out_dir.join("aparc").join("Global.csv");
    let (global_rows, global_written) = {
        let units = units.to_vec();
        let fs_dir = settings.freesurfer_dir.clone();
        let path = global_path.clone();
        tokio::task::spawn_blocking(move || -> Result<(usize, bool)> {
            let rows = collect_global_metrics(&units, &fs_dir);
            let written = write_global_csv(&rows, &path)?;
            Ok((rows.len(), written))
        })
        .await??
    };

    let dirs: Vec<String> = settings.table_dirs().into_iter().map(str::to_string).collect();
    let workbooks = tokio::task::spawn_blocking(move || -> Result<Vec<WorkbookReport>> {
        dirs.iter()
            .map(|dir| merge_parcellation_workbook(&out_dir, dir))
            .collect()
    })
    .await??;

    let report = StatsReport {
        subjects,
        tables,
        global_csv: global_written.then_some(global_path),
        global_rows,
        workbooks,
    };
    info!(
        subjects = report.subjects,
        workbooks = report.workbooks.iter().filter(|w| w.path.is_some()).count(),
        skipped_tables = report.workbooks.iter().map(|w| w.skipped.len()).sum::<usize>(),
        "Statistics aggregation finished"
    );
    Ok(report)
}
