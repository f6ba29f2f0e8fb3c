//! Lab value parsing for laboratory reports.
//!
//! Each text line of the form `<test name> [:|-] <number> [unit]` is read as
//! one measurement. Only tests found in the reference table count: their
//! value is flagged against the adult reference range and checked against
//! the critical-value rules. A document with at least [`MIN_LAB_VALUES`]
//! recognized measurements is treated as a lab report.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::extraction::ExtractionError;
use super::{read_reference, reference_error};

pub const LAB_RANGES_FILE: &str = "lab_reference_ranges.json";

const BUNDLED_LAB_RANGES: &str = include_str!("../../resources/lab_reference_ranges.json");

/// Recognized measurements needed before a document counts as a lab report.
pub const MIN_LAB_VALUES: usize = 2;

/// Name, separator, value (thousands separators allowed), optional unit.
static LAB_LINE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*([A-Za-z][A-Za-z0-9 %/+()\-]*?)(?:\s*[:\-]\s*|\s+)([0-9]{1,3}(?:,[0-9]{3})+(?:\.[0-9]+)?|[0-9]+(?:\.[0-9]+)?)\s*([A-Za-z%/^.0-9\-]*)",
    )
    .expect("valid lab line pattern")
});

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabFlag {
    Normal,
    Low,
    High,
}

/// One recognized measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabValue {
    /// Test name as written.
    pub test: String,
    /// Canonical analyte key from the reference table.
    pub key: String,
    pub value: f64,
    /// Unit as written (aliases normalized), else the reference unit.
    pub unit: String,
    pub ref_low: f64,
    pub ref_high: f64,
    pub flag: LabFlag,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabReport {
    pub values: Vec<LabValue>,
    pub abnormal_count: usize,
    pub critical_flags: Vec<String>,
}

impl LabReport {
    pub fn is_lab_report(&self) -> bool {
        self.values.len() >= MIN_LAB_VALUES
    }
}

// ═══════════════════════════════════════════════════════════
// Reference table
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct RangesFile {
    analytes: BTreeMap<String, AnalyteEntry>,
    #[serde(default)]
    unit_aliases: BTreeMap<String, String>,
    #[serde(default)]
    critical: Vec<CriticalRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct AnalyteEntry {
    low: f64,
    high: f64,
    unit: String,
    #[serde(default)]
    aliases: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Comparison {
    Below,
    Above,
    AtLeast,
}

#[derive(Debug, Clone, Deserialize)]
struct CriticalRule {
    analyte: String,
    when: Comparison,
    value: f64,
    message: String,
}

impl CriticalRule {
    fn triggers(&self, value: f64) -> bool {
        match self.when {
            Comparison::Below => value < self.value,
            Comparison::Above => value > self.value,
            Comparison::AtLeast => value >= self.value,
        }
    }
}

/// Adult reference ranges, unit aliases and critical-value rules.
#[derive(Debug)]
pub struct LabReferenceRanges {
    analytes: HashMap<String, AnalyteEntry>,
    /// normalized alias -> analyte key
    aliases: HashMap<String, String>,
    /// lowercase unit -> canonical unit
    unit_aliases: HashMap<String, String>,
    critical: Vec<CriticalRule>,
}

impl LabReferenceRanges {
    pub fn bundled() -> Result<Self, ExtractionError> {
        Self::from_json(LAB_RANGES_FILE, BUNDLED_LAB_RANGES)
    }

    pub fn load(dir: &Path) -> Result<Self, ExtractionError> {
        let raw = read_reference(dir, LAB_RANGES_FILE)?;
        Self::from_json(LAB_RANGES_FILE, &raw)
    }

    pub fn from_json(file: &str, raw: &str) -> Result<Self, ExtractionError> {
        let parsed: RangesFile = serde_json::from_str(raw).map_err(|e| reference_error(file, e))?;
        Self::build(parsed).map_err(|reason| reference_error(file, reason))
    }

    fn build(file: RangesFile) -> Result<Self, String> {
        if file.analytes.is_empty() {
            return Err("no analytes defined".into());
        }

        let mut analytes = HashMap::new();
        let mut aliases = HashMap::new();
        for (key, entry) in file.analytes {
            let key = normalize_name(&key);
            if key.is_empty() {
                return Err("empty analyte key".into());
            }
            if !(entry.low.is_finite() && entry.high.is_finite() && entry.low <= entry.high) {
                return Err(format!("invalid range for {key:?}"));
            }
            for alias in &entry.aliases {
                let alias = normalize_name(alias);
                if !alias.is_empty() {
                    aliases.insert(alias, key.clone());
                }
            }
            analytes.insert(key, entry);
        }

        for rule in &file.critical {
            if !analytes.contains_key(&normalize_name(&rule.analyte)) {
                return Err(format!("critical rule for unknown analyte {:?}", rule.analyte));
            }
        }
        let critical = file
            .critical
            .into_iter()
            .map(|mut rule| {
                rule.analyte = normalize_name(&rule.analyte);
                rule
            })
            .collect();

        let unit_aliases = file
            .unit_aliases
            .into_iter()
            .map(|(from, to)| (compact_unit(&from).to_lowercase(), to))
            .collect();

        Ok(Self {
            analytes,
            aliases,
            unit_aliases,
            critical,
        })
    }

    pub fn len(&self) -> usize {
        self.analytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analytes.is_empty()
    }

    /// Canonical analyte key for a test name as written, if known.
    pub fn analyte_key(&self, test_name: &str) -> Option<String> {
        let name = normalize_name(test_name);
        let has = |word: &str| name.contains(word);

        let contextual = if has("glucose") || has("sugar") {
            if has("fast") || has("fbs") {
                Some("glucose fasting")
            } else if has("random") || has("pp") || has("post") {
                Some("glucose random")
            } else {
                None
            }
        } else if has("cholesterol") && !(has("ldl") || has("hdl") || has("trig")) {
            Some("cholesterol total")
        } else if has("bilirubin") && has("total") {
            Some("bilirubin total")
        } else {
            None
        };

        let key = contextual.map(str::to_string).unwrap_or(name);
        if self.analytes.contains_key(&key) {
            Some(key)
        } else {
            self.aliases.get(&key).cloned()
        }
    }

    fn unit_for(&self, raw: &str, key: &str) -> String {
        let unit = compact_unit(raw);
        let unit = unit.trim_end_matches('.');
        if unit.is_empty() {
            return self
                .analytes
                .get(key)
                .map(|a| a.unit.clone())
                .unwrap_or_default();
        }
        self.unit_aliases
            .get(&unit.to_lowercase())
            .cloned()
            .unwrap_or_else(|| unit.to_string())
    }
}

/// Lowercase, punctuation to spaces, whitespace collapsed.
fn normalize_name(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn compact_unit(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}

// ═══════════════════════════════════════════════════════════
// Parser
// ═══════════════════════════════════════════════════════════

pub struct LabValueParser {
    ranges: Arc<LabReferenceRanges>,
}

impl LabValueParser {
    pub fn new(ranges: Arc<LabReferenceRanges>) -> Self {
        Self { ranges }
    }

    /// Read every recognized measurement, in text order.
    pub fn parse(&self, text: &str) -> LabReport {
        let mut report = LabReport::default();

        for line in text.lines() {
            let Some(caps) = LAB_LINE_PATTERN.captures(line) else {
                continue;
            };
            let test = caps[1].trim();
            let Some(key) = self.ranges.analyte_key(test) else {
                continue;
            };
            let Ok(value) = caps[2].replace(',', "").parse::<f64>() else {
                continue;
            };
            let Some(entry) = self.ranges.analytes.get(&key) else {
                continue;
            };

            let flag = if value < entry.low {
                LabFlag::Low
            } else if value > entry.high {
                LabFlag::High
            } else {
                LabFlag::Normal
            };
            if flag != LabFlag::Normal {
                report.abnormal_count += 1;
            }

            report.critical_flags.extend(
                self.ranges
                    .critical
                    .iter()
                    .filter(|rule| rule.analyte == key && rule.triggers(value))
                    .map(|rule| rule.message.clone()),
            );

            let unit = self.ranges.unit_for(&caps[3], &key);
            report.values.push(LabValue {
                test: test.to_string(),
                key,
                value,
                unit,
                ref_low: entry.low,
                ref_high: entry.high,
                flag,
            });
        }

        tracing::debug!(
            values = report.values.len(),
            abnormal = report.abnormal_count,
            critical = report.critical_flags.len(),
            "Lab value scan complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> LabValueParser {
        LabValueParser::new(Arc::new(LabReferenceRanges::bundled().unwrap()))
    }

    #[test]
    fn bundled_table_loads() {
        let ranges = LabReferenceRanges::bundled().unwrap();
        assert!(ranges.len() >= 20);
        assert_eq!(ranges.analyte_key("Haemoglobin").as_deref(), Some("hb"));
        assert_eq!(ranges.analyte_key("SGPT").as_deref(), Some("alt"));
        assert_eq!(
            ranges.analyte_key("Glucose (Fasting)").as_deref(),
            Some("glucose fasting")
        );
        assert_eq!(
            ranges.analyte_key("Serum Cholesterol").as_deref(),
            Some("cholesterol total")
        );
        assert_eq!(ranges.analyte_key("LDL Cholesterol").as_deref(), Some("ldl"));
        assert_eq!(ranges.analyte_key("Betaloc"), None);
    }

    #[test]
    fn value_within_range_is_normal() {
        let report = parser().parse("Hb: 13.5 g/dL (12-16)");
        assert_eq!(report.values.len(), 1);
        let hb = &report.values[0];
        assert_eq!(hb.test, "Hb");
        assert_eq!(hb.key, "hb");
        assert_eq!(hb.value, 13.5);
        assert_eq!(hb.unit, "g/dL");
        assert_eq!((hb.ref_low, hb.ref_high), (12.0, 16.0));
        assert_eq!(hb.flag, LabFlag::Normal);
        assert_eq!(report.abnormal_count, 0);
        assert!(report.critical_flags.is_empty());
        assert!(!report.is_lab_report());
    }

    #[test]
    fn values_outside_range_are_flagged() {
        let report = parser().parse("Hemoglobin 10.2 g%\nLDL - 160 mg/dL\nPotassium: 4.0");
        let flags: Vec<LabFlag> = report.values.iter().map(|v| v.flag).collect();
        assert_eq!(flags, vec![LabFlag::Low, LabFlag::High, LabFlag::Normal]);
        assert_eq!(report.abnormal_count, 2);
        assert_eq!(report.values[0].unit, "g/dL");
        // unit omitted: reference unit
        assert_eq!(report.values[2].unit, "mmol/L");
        assert!(report.is_lab_report());
    }

    #[test]
    fn thousands_separator_is_read() {
        let report = parser().parse("WBC 12,300 /uL");
        assert_eq!(report.values[0].value, 12300.0);
        assert_eq!(report.values[0].unit, "/uL");
        assert_eq!(report.values[0].flag, LabFlag::High);
    }

    #[test]
    fn critical_values_are_reported() {
        let report = parser().parse("Hb 6.5 g/dL\nFasting Glucose 450 mg/dL\nSGOT 35 U/L");
        assert_eq!(report.abnormal_count, 2);
        assert_eq!(report.critical_flags.len(), 3);
        assert!(report.critical_flags[0].starts_with("CRITICAL: Severe anemia"));
        assert!(report.critical_flags[1].starts_with("WARNING: Diabetes range"));
        assert!(report.critical_flags[2].starts_with("CRITICAL: Severe hyperglycemia"));
    }

    #[test]
    fn prescription_lines_are_not_lab_values() {
        let report = parser().parse(
            "Metformin 500mg for 30 days\nAtorvastatin 10mg at night\nPatient: John Doe Age: 45",
        );
        assert!(report.values.is_empty());
        assert!(!report.is_lab_report());
    }

    #[test]
    fn lines_without_a_number_are_skipped() {
        let report = parser().parse("Complete blood count\nHb within normal limits");
        assert!(report.values.is_empty());
    }

    #[test]
    fn invalid_tables_are_rejected() {
        let inverted = r#"{"analytes": {"hb": {"low": 16, "high": 12, "unit": "g/dL"}}}"#;
        assert!(matches!(
            LabReferenceRanges::from_json(LAB_RANGES_FILE, inverted),
            Err(ExtractionError::ReferenceData { .. })
        ));

        let orphan_rule = r#"{"analytes": {"hb": {"low": 12, "high": 16, "unit": "g/dL"}},
            "critical": [{"analyte": "ldl", "when": "above", "value": 1, "message": "x"}]}"#;
        assert!(matches!(
            LabReferenceRanges::from_json(LAB_RANGES_FILE, orphan_rule),
            Err(ExtractionError::ReferenceData { .. })
        ));

        assert!(LabReferenceRanges::from_json(LAB_RANGES_FILE, r#"{"analytes": {}}"#).is_err());
    }

    #[test]
    fn load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(LAB_RANGES_FILE),
            r#"{"analytes": {"ferritin": {"low": 30, "high": 400, "unit": "ng/mL"}}}"#,
        )
        .unwrap();
        let ranges = LabReferenceRanges::load(dir.path()).unwrap();
        assert_eq!(ranges.len(), 1);
        let report = LabValueParser::new(Arc::new(ranges)).parse("Ferritin 12 ng/mL");
        assert_eq!(report.values[0].flag, LabFlag::Low);
    }
}
