//! Schema-driven scraping of FreeSurfer `.stats` text files

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;

lazy_static! {
    static ref ASEG_RULES: Vec<(&'static str, Regex)> = vec![
        ("GMV", Regex::new(r"Measure Cortex, CortexVol, Total cortical gray matter volume, (\S+), mm\^3").unwrap()),
        ("sGMV", Regex::new(r"Measure SubCortGray, SubCortGrayVol, Subcortical gray matter volume, (\S+), mm\^3").unwrap()),
        ("WMV", Regex::new(r"Measure CerebralWhiteMatter, CerebralWhiteMatterVol, Total cerebral white matter volume, (\S+), mm\^3").unwrap()),
        ("Ventricles", Regex::new(r"Measure VentricleChoroidVol, VentricleChoroidVol, Volume of ventricles and choroid plexus, (\S+), mm\^3").unwrap()),
        ("TCV", Regex::new(r"Measure EstimatedTotalIntraCranialVol, eTIV, Estimated Total Intracranial Volume, (\S+), mm\^3").unwrap()),
    ];

    static ref VERTEX_RULE: Regex = Regex::new(r"Measure Cortex, NumVert, Number of Vertices, (\d+), unitless").unwrap();
    static ref AREA_RULE: Regex = Regex::new(r"Measure Cortex, WhiteSurfArea, White Surface Total Area, (\S+), mm\^2").unwrap();
    static ref THICKNESS_RULE: Regex = Regex::new(r"Measure Cortex, MeanThickness, Mean Thickness, (\S+), mm").unwrap();
}

/// How a captured value is parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricKind {
    /// Whole number (vertex counts)
    Integer,
    /// Real number
    Float,
}

/// An extracted metric, or its absence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    /// Integer metric
    Integer(i64),
    /// Real metric
    Float(f64),
    /// Not found or not parsable
    Missing,
}

impl MetricValue {
    /// Numeric value, if present
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            MetricValue::Integer(v) => Some(v as f64),
            MetricValue::Float(v) => Some(v),
            MetricValue::Missing => None,
        }
    }

    /// Whether the value is missing
    pub fn is_missing(&self) -> bool {
        matches!(self, MetricValue::Missing)
    }
}

/// Missing values render as an empty string (an empty CSV cell)
impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Integer(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{}", v),
            MetricValue::Missing => Ok(()),
        }
    }
}

/// One metric: output name, pattern with a single capture group, value kind
#[derive(Debug, Clone)]
pub struct MetricRule {
    /// Output column name
    pub name: String,
    /// Pattern whose first capture group holds the value
    pub pattern: Regex,
    /// Value kind
    pub kind: MetricKind,
}

/// The metrics scraped from one stats file
#[derive(Debug, Clone)]
pub struct MetricSchema {
    /// File name inside the subject's `stats/` directory
    pub file_name: String,
    /// Rules, in output order
    pub rules: Vec<MetricRule>,
}

impl MetricSchema {
    /// Empty schema for `file_name`
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            rules: Vec::new(),
        }
    }

    /// Add a rule from a pattern string
    pub fn rule(mut self, name: impl Into<String>, pattern: &str, kind: MetricKind) -> Result<Self> {
        self.rules.push(MetricRule {
            name: name.into(),
            pattern: Regex::new(pattern)?,
            kind,
        });
        Ok(self)
    }

    /// Whole-brain volumes from `aseg.stats`
    pub fn aseg() -> Self {
        Self {
            file_name: "aseg.stats".to_string(),
            rules: ASEG_RULES
                .iter()
                .map(|(name, pattern)| MetricRule {
                    name: name.to_string(),
                    pattern: pattern.clone(),
                    kind: MetricKind::Float,
                })
                .collect(),
        }
    }

    /// Cortex summary measures from `<hemi>.aparc.stats`, named
    /// `<hemi>Vertex`, `<hemi>_totaISA2` and `<hemi>MeanThickness`
    pub fn aparc(hemi: &str) -> Self {
        let rule = |name: String, pattern: &Regex, kind| MetricRule {
            name,
            pattern: pattern.clone(),
            kind,
        };
        Self {
            file_name: format!("{}.aparc.stats", hemi),
            rules: vec![
                rule(format!("{}Vertex", hemi), &VERTEX_RULE, MetricKind::Integer),
                rule(format!("{}_totaISA2", hemi), &AREA_RULE, MetricKind::Float),
                rule(format!("{}MeanThickness", hemi), &THICKNESS_RULE, MetricKind::Float),
            ],
        }
    }
}

/// Extracted metrics by name
pub type MetricSet = BTreeMap<String, MetricValue>;

/// Apply every rule of `schema` to `text`. Absent or unparsable values are
/// [`MetricValue::Missing`] and logged as warnings against `subject`.
pub fn extract_metrics(schema: &MetricSchema, text: &str, subject: &str) -> MetricSet {
    schema
        .rules
        .iter()
        .map(|rule| {
            let value = match rule.pattern.captures(text).and_then(|c| c.get(1)) {
                Some(m) => parse_value(m.as_str(), rule.kind).unwrap_or_else(|| {
                    warn!(subject, metric = %rule.name, raw = m.as_str(), file = %schema.file_name, "Unparsable metric value");
                    MetricValue::Missing
                }),
                None => {
                    warn!(subject, metric = %rule.name, file = %schema.file_name, "Metric not found");
                    MetricValue::Missing
                }
            };
            (rule.name.clone(), value)
        })
        .collect()
}

/// Read `<stats_dir>/<schema.file_name>` and extract from it. A missing or
/// unreadable file marks every metric missing.
pub fn extract_from_file(schema: &MetricSchema, stats_dir: &Path, subject: &str) -> MetricSet {
    let path = stats_dir.join(&schema.file_name);
    match std::fs::read(&path) {
        Ok(bytes) => extract_metrics(schema, &String::from_utf8_lossy(&bytes), subject),
        Err(e) => {
            if e.kind() == io::ErrorKind::NotFound {
                warn!(subject, file = %path.display(), "Stats file missing");
            } else {
                warn!(subject, file = %path.display(), error = %e, "Stats file unreadable");
            }
            schema
                .rules
                .iter()
                .map(|rule| (rule.name.clone(), MetricValue::Missing))
                .collect()
        }
    }
}

fn parse_value(raw: &str, kind: MetricKind) -> Option<MetricValue> {
    match kind {
        MetricKind::Integer => raw.parse().ok().map(MetricValue::Integer),
        MetricKind::Float => raw
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(MetricValue::Float),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const LH_APARC: &str = "\
# Measure Cortex, NumVert, Number of Vertices, 150000, unitless
# Measure Cortex, WhiteSurfArea, White Surface Total Area, 80000.5, mm^2
# Measure Cortex, MeanThickness, Mean Thickness, 2.5, mm
";

    #[test]
    fn test_aparc_extraction() {
        let metrics = extract_metrics(&MetricSchema::aparc("lh"), LH_APARC, "s1");
        assert_eq!(metrics["lhVertex"], MetricValue::Integer(150000));
        assert_eq!(metrics["lh_totaISA2"], MetricValue::Float(80000.5));
        assert_eq!(metrics["lhMeanThickness"], MetricValue::Float(2.5));
    }

    #[test]
    fn test_absent_metric_is_missing() {
        let text = "# Measure Cortex, CortexVol, Total cortical gray matter volume, 500000.0, mm^3\n";
        let metrics = extract_metrics(&MetricSchema::aseg(), text, "s1");
        assert_eq!(metrics["GMV"], MetricValue::Float(500000.0));
        assert!(metrics["TCV"].is_missing());
        assert_eq!(metrics["TCV"].to_string(), "");
    }

    #[test]
    fn test_unparsable_value_is_missing() {
        let text = "# Measure Cortex, MeanThickness, Mean Thickness, n/a, mm\n";
        let metrics = extract_metrics(&MetricSchema::aparc("rh"), text, "s1");
        assert!(metrics["rhMeanThickness"].is_missing());
    }

    #[test]
    fn test_missing_file_marks_all_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let metrics = extract_from_file(&MetricSchema::aseg(), dir.path(), "s1");
        assert_eq!(metrics.len(), 5);
        assert!(metrics.values().all(MetricValue::is_missing));
    }

    #[test]
    fn test_custom_rule() {
        let schema = MetricSchema::new("wm.stats")
            .rule("Hypo", r"WM-hypointensities, (\S+)", MetricKind::Float)
            .unwrap();
        let metrics = extract_metrics(&schema, "WM-hypointensities, 12.5", "s1");
        assert_eq!(metrics["Hypo"].as_f64(), Some(12.5));
        assert!(MetricSchema::new("x").rule("bad", "(", MetricKind::Float).is_err());
    }
}
