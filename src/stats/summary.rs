//! Whole-brain summary table (`Global.csv`)

use std::path::Path;

use tracing::{info, warn};

use crate::batch::WorkUnit;
use crate::stats::extract::{extract_from_file, MetricSchema, MetricSet, MetricValue};
use crate::Result;

/// Column order of the summary table
pub const GLOBAL_COLUMNS: [&str; 14] = [
    "case_dir",
    "GMV",
    "sGMV",
    "WMV",
    "Ventricles",
    "lhVertex",
    "rhVertex",
    "lhMeanThickness",
    "rhMeanThickness",
    "meanCT2",
    "lh_totaISA2",
    "rh_totaISA2",
    "totalSA2",
    "TCV",
];

/// Summary metrics of one subject
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalRow {
    /// Subject identifier
    pub case_dir: String,
    /// Extracted and derived metrics by column name
    pub metrics: MetricSet,
}

impl GlobalRow {
    /// Combine extracted metrics and compute the derived columns
    pub fn new(case_dir: impl Into<String>, mut metrics: MetricSet) -> Self {
        let case_dir = case_dir.into();
        let get = |m: &MetricSet, k: &str| m.get(k).copied().unwrap_or(MetricValue::Missing);

        let mean_ct2 = vertex_weighted_thickness(
            get(&metrics, "lhVertex"),
            get(&metrics, "lhMeanThickness"),
            get(&metrics, "rhVertex"),
            get(&metrics, "rhMeanThickness"),
        );
        if mean_ct2.is_missing() {
            warn!(subject = %case_dir, "meanCT2 unavailable: vertex or thickness data missing");
        }

        let total_sa2 = match (get(&metrics, "lh_totaISA2").as_f64(), get(&metrics, "rh_totaISA2").as_f64()) {
            (Some(lh), Some(rh)) => MetricValue::Float(lh + rh),
            _ => {
                warn!(subject = %case_dir, "totalSA2 unavailable: surface area missing");
                MetricValue::Missing
            }
        };

        metrics.insert("meanCT2".to_string(), mean_ct2);
        metrics.insert("totalSA2".to_string(), total_sa2);
        Self { case_dir, metrics }
    }

    /// Value of a metric column
    pub fn get(&self, column: &str) -> MetricValue {
        self.metrics.get(column).copied().unwrap_or(MetricValue::Missing)
    }

    /// Cells in [`GLOBAL_COLUMNS`] order, missing values empty
    pub fn cells(&self) -> Vec<String> {
        std::iter::once(self.case_dir.clone())
            .chain(GLOBAL_COLUMNS[1..].iter().map(|c| self.get(c).to_string()))
            .collect()
    }
}

/// Mean cortical thickness over both hemispheres, weighted by vertex count
pub fn vertex_weighted_thickness(
    lh_vertex: MetricValue,
    lh_thickness: MetricValue,
    rh_vertex: MetricValue,
    rh_thickness: MetricValue,
) -> MetricValue {
    match (
        lh_vertex.as_f64(),
        lh_thickness.as_f64(),
        rh_vertex.as_f64(),
        rh_thickness.as_f64(),
    ) {
        (Some(lv), Some(lt), Some(rv), Some(rt)) if lv + rv > 0.0 => {
            MetricValue::Float((lv * lt + rv * rt) / (lv + rv))
        }
        _ => MetricValue::Missing,
    }
}

/// Scrape the summary metrics of every unit from
/// `<unit>/<freesurfer_dir>/stats/{aseg,lh.aparc,rh.aparc}.stats`
pub fn collect_global_metrics(units: &[WorkUnit], freesurfer_dir: &str) -> Vec<GlobalRow> {
    let schemas = [
        MetricSchema::aseg(),
        MetricSchema::aparc("lh"),
        MetricSchema::aparc("rh"),
    ];

    units
        .iter()
        .map(|unit| {
            let stats_dir = unit.path(freesurfer_dir).join("stats");
            let mut metrics = MetricSet::new();
            for schema in &schemas {
                metrics.extend(extract_from_file(schema, &stats_dir, &unit.id));
            }
            GlobalRow::new(unit.id.clone(), metrics)
        })
        .collect()
}

/// Write the summary table. Returns `false` (and writes nothing) when there
/// are no rows.
pub fn write_global_csv(rows: &[GlobalRow], path: &Path) -> Result<bool> {
    if rows.is_empty() {
        warn!(path = %path.display(), "No subjects; summary table not written");
        return Ok(false);
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(GLOBAL_COLUMNS)?;
    for row in rows {
        writer.write_record(row.cells())?;
    }
    writer.flush()?;

    info!(path = %path.display(), rows = rows.len(), "Wrote summary table");
    Ok(true)
}
