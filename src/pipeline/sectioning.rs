//! Semantic sectioning of recognized prescription text.
//!
//! Splits the winning transcription into four display zones (facility
//! header, patient demographics, medication lines, provider/signature).
//! Sectioning is a display aid: `full_text` always carries the verbatim
//! input, and lines that fit no zone survive there.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::extraction::{ExtractionError, StructuredTranscription};

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Zones detected in one transcription. Recomputable; no identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSections {
    pub header: Option<String>,
    pub patient_info: Option<String>,
    pub medication_lines: Vec<String>,
    pub provider_info: Option<String>,
    pub full_text: String,
}

impl TextSections {
    /// Sections reported by the cloud transcription, if it returned any.
    pub fn from_structured(structured: &StructuredTranscription, full_text: &str) -> Self {
        Self {
            header: non_empty(&structured.header),
            patient_info: non_empty(&structured.patient_info),
            medication_lines: structured
                .medications
                .iter()
                .map(|m| m.trim())
                .filter(|m| !m.is_empty())
                .map(String::from)
                .collect(),
            provider_info: non_empty(&structured.doctor_info),
            full_text: full_text.to_string(),
        }
    }

    /// Medication lines joined into one text, `None` when the zone is empty.
    pub fn medication_zone(&self) -> Option<String> {
        if self.medication_lines.is_empty() {
            None
        } else {
            Some(self.medication_lines.join("\n"))
        }
    }

    pub fn has_sections(&self) -> bool {
        self.header.is_some()
            || self.patient_info.is_some()
            || !self.medication_lines.is_empty()
            || self.provider_info.is_some()
    }
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Zone a segment was assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Header,
    Patient,
    Medication,
    Provider,
}

/// Keyword sets per zone. Loaded once and handed to the sectioner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionKeywords {
    pub header: Vec<String>,
    pub demographic: Vec<String>,
    pub dosage: Vec<String>,
    pub provider: Vec<String>,
}

impl Default for SectionKeywords {
    fn default() -> Self {
        fn owned(words: &[&str]) -> Vec<String> {
            words.iter().map(|w| w.to_string()).collect()
        }
        Self {
            header: owned(&[
                "medical", "centre", "center", "hospital", "clinic", "polyclinic", "pharmacy",
                "healthcare", "laboratory", "street", "road", "avenue", "tel", "phone",
            ]),
            demographic: owned(&[
                "patient", "name", "age", "sex", "gender", "dob", "date", "address", "mrn",
                "mr no", "weight",
            ]),
            dosage: owned(&[
                "tab", "tabs", "tablet", "tablets", "cap", "caps", "capsule", "capsules", "syrup",
                "drops", "injection", "inj", "ointment", "cream", "inhaler", "suspension", "sig",
                "rx", "℞",
            ]),
            provider: owned(&[
                "dr", "dr.", "doctor", "physician", "signature", "signed", "mbbs", "reg no",
                "refill", "label",
            ]),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Patterns
// ═══════════════════════════════════════════════════════════

/// Drug-dose-frequency shapes. Any hit puts the segment in the medication zone.
static MEDICATION_SHAPES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b\d+(?:\.\d+)?\s*(?:(?:mg|mcg|µg|gm|g|ml|iu|units?)\b|%)",
        r"(?i)\b\d+(?:/\d+)?\s*(?:tabs?|tablets?|caps?|capsules?|drops?|puffs?|sachets?)\b",
        r"(?i)\b(?:bid|b\.i\.d|tid|t\.i\.d|qid|q\.i\.d|qd|qhs|tds|bd|od|prn)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid medication shape pattern"))
    .collect()
});

/// Labels that start a new segment even mid-line ("Name: A. Khan Age: 54").
static SEGMENT_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:patient|name|age|sex|date|rx|dr\.?)\s*[:.]")
        .expect("valid segment marker pattern")
});

// ═══════════════════════════════════════════════════════════
// Sectioner
// ═══════════════════════════════════════════════════════════

struct ZoneMatcher {
    zone: Zone,
    pattern: Option<Regex>,
}

pub struct TextSectioner {
    /// Header, demographic and provider matchers in evaluation order.
    zones: Vec<ZoneMatcher>,
    dosage: Option<Regex>,
}

impl TextSectioner {
    pub fn new(keywords: &SectionKeywords) -> Result<Self, ExtractionError> {
        Ok(Self {
            zones: vec![
                ZoneMatcher {
                    zone: Zone::Header,
                    pattern: keyword_pattern(&keywords.header)?,
                },
                ZoneMatcher {
                    zone: Zone::Patient,
                    pattern: keyword_pattern(&keywords.demographic)?,
                },
                ZoneMatcher {
                    zone: Zone::Provider,
                    pattern: keyword_pattern(&keywords.provider)?,
                },
            ],
            dosage: keyword_pattern(&keywords.dosage)?,
        })
    }

    /// Classify one segment. Medication shape wins over every keyword set.
    pub fn classify(&self, segment: &str) -> Option<Zone> {
        if MEDICATION_SHAPES.iter().any(|p| p.is_match(segment))
            || self.dosage.as_ref().is_some_and(|p| p.is_match(segment))
        {
            return Some(Zone::Medication);
        }
        self.zones
            .iter()
            .find(|m| m.pattern.as_ref().is_some_and(|p| p.is_match(segment)))
            .map(|m| m.zone)
    }

    /// Split `text` into zones. Pure and idempotent.
    pub fn section(&self, text: &str) -> TextSections {
        let mut header: Vec<&str> = Vec::new();
        let mut patient: Vec<&str> = Vec::new();
        let mut provider: Vec<&str> = Vec::new();
        let mut medication_lines: Vec<String> = Vec::new();
        let mut open: Option<Zone> = None;

        for segment in split_segments(text) {
            let zone = match self.classify(segment) {
                Some(zone) => {
                    open = Some(zone);
                    zone
                }
                None => match open {
                    Some(zone) => zone,
                    None => continue,
                },
            };
            match zone {
                Zone::Header => header.push(segment),
                Zone::Patient => patient.push(segment),
                Zone::Provider => provider.push(segment),
                Zone::Medication => medication_lines.push(segment.to_string()),
            }
        }

        let sections = TextSections {
            header: join_zone(&header),
            patient_info: join_zone(&patient),
            medication_lines,
            provider_info: join_zone(&provider),
            full_text: text.to_string(),
        };

        tracing::debug!(
            has_header = sections.header.is_some(),
            has_patient = sections.patient_info.is_some(),
            medication_lines = sections.medication_lines.len(),
            has_provider = sections.provider_info.is_some(),
            "Text sectioned"
        );

        sections
    }
}

/// Case-insensitive whole-word alternation over `keywords`.
/// `None` when the set is empty, so an empty zone never matches.
fn keyword_pattern(keywords: &[String]) -> Result<Option<Regex>, ExtractionError> {
    let mut words: Vec<&str> = keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .collect();
    if words.is_empty() {
        return Ok(None);
    }
    words.sort_by_key(|w| std::cmp::Reverse(w.len()));

    let alternatives: Vec<String> = words
        .iter()
        .map(|w| {
            let lead = if w.starts_with(char::is_alphanumeric) { r"\b" } else { "" };
            let trail = if w.ends_with(char::is_alphanumeric) { r"\b" } else { "" };
            format!("{lead}{}{trail}", regex::escape(w))
        })
        .collect();

    Regex::new(&format!("(?i)(?:{})", alternatives.join("|")))
        .map(Some)
        .map_err(|e| ExtractionError::ReferenceData {
            file: "section keywords".into(),
            reason: e.to_string(),
        })
}

/// Lines, further split at mid-line labels. Blank segments are dropped.
fn split_segments(text: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    for line in text.lines() {
        let mut start = 0;
        for m in SEGMENT_MARKER.find_iter(line) {
            if m.start() > start {
                segments.push(line[start..m.start()].trim());
                start = m.start();
            }
        }
        segments.push(line[start..].trim());
    }
    segments.retain(|s| !s.is_empty());
    segments
}

fn join_zone(parts: &[&str]) -> Option<String> {
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}
