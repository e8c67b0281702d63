//! Merge a parcellation's CSV tables into one multi-sheet workbook

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rust_xlsxwriter::{Workbook, Worksheet};
use serde::Serialize;
use tracing::{info, warn};

use crate::Result;

const GLOBAL_TABLE: &str = "Global.csv";
const MAX_SHEET_NAME: usize = 31;

/// A CSV that could not be added as a sheet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTable {
    /// CSV file
    pub path: PathBuf,
    /// Why it was skipped
    pub reason: String,
}

/// Outcome of merging one parcellation directory
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkbookReport {
    /// Parcellation (directory) name
    pub parcellation: String,
    /// Workbook written, if any sheet was added
    pub path: Option<PathBuf>,
    /// Sheet names, in workbook order
    pub sheets: Vec<String>,
    /// Tables left out
    pub skipped: Vec<SkippedTable>,
}

/// Sheet name for a table file: `.csv` becomes `.table`, cut to the 31
/// characters a sheet name may hold
pub fn sheet_name_for(file_name: &str) -> String {
    let base = file_name.strip_suffix(".csv").unwrap_or(file_name);
    format!("{}.table", base).chars().take(MAX_SHEET_NAME).collect()
}

/// Subject id from a `<data>/<subject>/FreeSurfer` path: the name of the
/// path's parent directory. Values without a parent are kept as-is.
pub fn normalize_subject(value: &str) -> String {
    Path::new(value)
        .parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| value.to_string())
}

/// Build `<out_dir>/<parcellation>_stats.xlsx` from `<out_dir>/<parcellation>/*.csv`.
///
/// Tables that cannot be read become [`SkippedTable`] entries. A directory
/// that yields no sheet produces no workbook.
pub fn merge_parcellation_workbook(out_dir: &Path, parcellation: &str) -> Result<WorkbookReport> {
    let parc_dir = out_dir.join(parcellation);
    let mut report = WorkbookReport {
        parcellation: parcellation.to_string(),
        ..Default::default()
    };

    if !parc_dir.is_dir() {
        warn!(dir = %parc_dir.display(), "Parcellation directory missing");
        return Ok(report);
    }

    let mut tables = Vec::new();
    if parcellation == "aparc" {
        let global = parc_dir.join(GLOBAL_TABLE);
        if global.is_file() {
            tables.push((global, false));
        }
    }

    let mut others: Vec<PathBuf> = std::fs::read_dir(&parc_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path.extension().map_or(false, |ext| ext == "csv")
                && path.file_name().map_or(false, |name| name != GLOBAL_TABLE)
        })
        .collect();
    others.sort();
    tables.extend(others.into_iter().map(|path| (path, true)));

    let mut workbook = Workbook::new();
    let mut used_names = HashSet::new();

    for (path, normalize) in tables {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let sheet_name = sheet_name_for(&file_name);

        if !used_names.insert(sheet_name.to_lowercase()) {
            skip(&mut report, path, format!("sheet name {} already used", sheet_name));
            continue;
        }

        let rows = match read_table(&path) {
            Ok(rows) if rows.is_empty() => {
                skip(&mut report, path, "empty table".to_string());
                continue;
            }
            Ok(rows) => rows,
            Err(e) => {
                skip(&mut report, path, e.to_string());
                continue;
            }
        };

        let mut worksheet = Worksheet::new();
        if let Err(e) = fill_sheet(&mut worksheet, &sheet_name, &rows, normalize) {
            skip(&mut report, path, e.to_string());
            continue;
        }
        workbook.push_worksheet(worksheet);
        info!(table = %path.display(), sheet = %sheet_name, "Added sheet");
        report.sheets.push(sheet_name);
    }

    if report.sheets.is_empty() {
        warn!(dir = %parc_dir.display(), "No tables to merge; workbook not written");
        return Ok(report);
    }

    let workbook_path = out_dir.join(format!("{}_stats.xlsx", parcellation));
    workbook.save(&workbook_path)?;
    info!(path = %workbook_path.display(), sheets = report.sheets.len(), "Saved workbook");
    report.path = Some(workbook_path);
    Ok(report)
}

fn skip(report: &mut WorkbookReport, path: PathBuf, reason: String) {
    warn!(table = %path.display(), %reason, "Skipping table");
    report.skipped.push(SkippedTable { path, reason });
}

fn read_table(path: &Path) -> std::result::Result<Vec<csv::StringRecord>, csv::Error> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)?
        .records()
        .collect()
}

fn fill_sheet(
    worksheet: &mut Worksheet,
    name: &str,
    rows: &[csv::StringRecord],
    normalize: bool,
) -> std::result::Result<(), rust_xlsxwriter::XlsxError> {
    worksheet.set_name(name)?;

    for (r, record) in rows.iter().enumerate() {
        let row = r as u32;
        for (c, cell) in record.iter().enumerate() {
            let col = c as u16;
            if r > 0 && c == 0 && normalize {
                worksheet.write_string(row, col, normalize_subject(cell))?;
            } else if r > 0 && !cell.is_empty() {
                match cell.trim().parse::<f64>() {
                    Ok(number) if number.is_finite() => {
                        worksheet.write_number(row, col, number)?;
                    }
                    _ => {
                        worksheet.write_string(row, col, cell)?;
                    }
                }
            } else if !cell.is_empty() {
                worksheet.write_string(row, col, cell)?;
            }
        }
    }
    Ok(())
}
