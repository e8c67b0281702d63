use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use neurobatch::batch::{BatchExecutor, WorkUnit};
use neurobatch::config::{StatsSettings, SubcorticalTable};
use neurobatch::pipeline::{CommandRunner, PipelineStep, StepOutput};
use neurobatch::stats::{merge_parcellation_workbook, run_stats};

/// Writes the table named by `--tablefile=`; `meancurv` tables come out ragged
struct FakeTableTools;

#[async_trait]
impl CommandRunner for FakeTableTools {
    async fn run(&self, step: &PipelineStep) -> io::Result<StepOutput> {
        let table = step
            .arguments
            .iter()
            .find_map(|a| a.strip_prefix("--tablefile="))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no --tablefile"))?;

        let contents = if table.contains("meancurv") {
            "measure,region_a\n/d/s1/FreeSurfer\n".to_string()
        } else {
            "measure,region_a,region_b\n/d/s1/FreeSurfer,1.5,2\n/d/s2/FreeSurfer,3,\n".to_string()
        };
        std::fs::write(table, contents)?;
        Ok(StepOutput::ok(""))
    }
}

const ASEG: &str = "\
# Measure Cortex, CortexVol, Total cortical gray matter volume, 500000.5, mm^3
# Measure SubCortGray, SubCortGrayVol, Subcortical gray matter volume, 60000.0, mm^3
# Measure CerebralWhiteMatter, CerebralWhiteMatterVol, Total cerebral white matter volume, 450000.0, mm^3
# Measure VentricleChoroidVol, VentricleChoroidVol, Volume of ventricles and choroid plexus, 20000.0, mm^3
# Measure EstimatedTotalIntraCranialVol, eTIV, Estimated Total Intracranial Volume, 1500000.0, mm^3
";

fn aparc(vertices: u32, area: f64, thickness: f64) -> String {
    format!(
        "# Measure Cortex, NumVert, Number of Vertices, {}, unitless\n\
         # Measure Cortex, WhiteSurfArea, White Surface Total Area, {}, mm^2\n\
         # Measure Cortex, MeanThickness, Mean Thickness, {}, mm\n",
        vertices, area, thickness
    )
}

fn write_stats(root: &Path, subject: &str, files: &[(&str, String)]) -> WorkUnit {
    let stats = root.join(subject).join("FreeSurfer/stats");
    std::fs::create_dir_all(&stats).unwrap();
    for (name, text) in files {
        std::fs::write(stats.join(name), text).unwrap();
    }
    WorkUnit::new(subject, root.join(subject))
}

fn small_settings(out: &Path) -> StatsSettings {
    StatsSettings {
        output_dir: out.to_path_buf(),
        measurements: vec!["area".to_string(), "meancurv".to_string()],
        parcellations: vec!["aparc".to_string()],
        subcortical: vec![SubcorticalTable {
            stats_file: "aseg".to_string(),
            table_dir: "aparc".to_string(),
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_full_stats_run() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    let out = dir.path().join("code");

    let units = vec![
        write_stats(
            &data,
            "s1",
            &[
                ("aseg.stats", ASEG.to_string()),
                ("lh.aparc.stats", aparc(100, 1000.5, 2.0)),
                ("rh.aparc.stats", aparc(300, 999.5, 3.0)),
            ],
        ),
        write_stats(&data, "s2", &[("lh.aparc.stats", aparc(100, 1000.0, 2.5))]),
    ];

    let executor = BatchExecutor::new(Arc::new(FakeTableTools)).with_concurrency_limit(2);
    let report = run_stats(&units, &small_settings(&out), &executor).await.unwrap();

    assert_eq!(report.subjects, 2);
    let tables = report.tables.as_ref().unwrap();
    assert_eq!(tables.succeeded_count(), 2 * 2 + 1);
    assert!(!report.has_failures());

    let subjects = std::fs::read_to_string(out.join("subj_path.txt")).unwrap();
    assert_eq!(subjects.lines().count(), 2);
    assert!(subjects.lines().all(|l| l.ends_with("FreeSurfer")));

    let global = std::fs::read_to_string(out.join("aparc/Global.csv")).unwrap();
    let lines: Vec<&str> = global.lines().collect();
    assert_eq!(
        lines[0],
        "case_dir,GMV,sGMV,WMV,Ventricles,lhVertex,rhVertex,lhMeanThickness,rhMeanThickness,meanCT2,lh_totaISA2,rh_totaISA2,totalSA2,TCV"
    );
    assert_eq!(lines[1], "s1,500000.5,60000,450000,20000,100,300,2,3,2.75,1000.5,999.5,2000,1500000");
    assert_eq!(lines[2], "s2,,,,,100,,2.5,,,1000,,,");
    assert_eq!(report.global_rows, 2);

    let workbook = &report.workbooks[0];
    assert_eq!(workbook.parcellation, "aparc");
    assert_eq!(
        workbook.sheets,
        vec!["Global.table", "aseg.volume.table", "lh.aparc.area.table", "rh.aparc.area.table"]
    );
    assert_eq!(workbook.skipped.len(), 2);
    assert!(workbook
        .skipped
        .iter()
        .all(|s| s.path.to_string_lossy().contains("meancurv")));
    assert!(out.join("aparc_stats.xlsx").is_file());
}

#[tokio::test]
async fn test_no_subjects_skips_tables() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("code");

    let executor = BatchExecutor::new(Arc::new(FakeTableTools));
    let report = run_stats(&[], &small_settings(&out), &executor).await.unwrap();

    assert_eq!(report.subjects, 0);
    assert!(report.tables.is_none());
    assert!(report.global_csv.is_none());
    assert!(report.workbooks.iter().all(|w| w.path.is_none()));
    assert!(!out.join("aparc_stats.xlsx").exists());
}

#[test]
fn test_workbook_for_missing_directory() {
    let dir = TempDir::new().unwrap();
    let report = merge_parcellation_workbook(dir.path(), "BN_Atlas").unwrap();
    assert!(report.path.is_none());
    assert!(report.sheets.is_empty());
}

#[test]
fn test_non_aparc_workbook_ignores_global_ordering() {
    let dir = TempDir::new().unwrap();
    let parc = dir.path().join("BN_Atlas");
    std::fs::create_dir_all(&parc).unwrap();
    std::fs::write(parc.join("rh.BN_Atlas.area.csv"), "m,x\n/d/s1/FreeSurfer,1\n").unwrap();
    std::fs::write(parc.join("lh.BN_Atlas.area.csv"), "m,x\n/d/s1/FreeSurfer,1\n").unwrap();
    std::fs::write(parc.join("empty.csv"), "").unwrap();

    let report = merge_parcellation_workbook(dir.path(), "BN_Atlas").unwrap();
    assert_eq!(report.sheets, vec!["lh.BN_Atlas.area.table", "rh.BN_Atlas.area.table"]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.path, Some(dir.path().join("BN_Atlas_stats.xlsx")));
}
