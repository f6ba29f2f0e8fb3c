//! Pattern-based medical entity extraction.
//!
//! Three scans run over the same text: medicine names (curated vocabulary
//! plus drug-class suffixes), dosage expressions, and duration/frequency
//! expressions. Each medicine is then paired with the nearest dosage and
//! the nearest duration by byte-offset distance.
//!
//! Pairing is not exclusive: one dosage may be the nearest match for two
//! medicines. Frequency codes attached to a count-plus-form dosage
//! ("1 tab BID") belong to the dosage and are not reported as durations.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, LazyLock};

use regex::{Match, Regex};
use serde::{Deserialize, Serialize};

use super::extraction::ExtractionError;
use super::sectioning::TextSections;
use super::{read_reference, reference_error};

pub const VOCABULARY_FILE: &str = "medical_vocabulary.json";

const BUNDLED_VOCABULARY: &str = include_str!("../../resources/medical_vocabulary.json");

/// Same-name medicines starting within this many bytes collapse to one record.
pub const DEDUP_WINDOW: usize = 64;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Medicine,
    Dosage,
    Duration,
}

/// A span found in the source text. `&text[start..end] == self.text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub kind: EntityKind,
    pub text: String,
    pub start: usize,
    pub end: usize,
}

impl ExtractedEntity {
    fn from_match(kind: EntityKind, m: Match<'_>) -> Self {
        Self {
            kind,
            text: m.as_str().to_string(),
            start: m.start(),
            end: m.end(),
        }
    }

    fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }
}

/// Where a medicine record was read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MedicineSource {
    /// The extraction text; offsets refer to it.
    #[default]
    Transcript,
    /// A medication line reported by the cloud transcription; offsets
    /// refer to that line.
    StructuredList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicineRecord {
    pub name: String,
    pub dosage: Option<ExtractedEntity>,
    pub duration: Option<ExtractedEntity>,
    #[serde(default)]
    pub source: MedicineSource,
}

/// Which text the extractor scans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionScope {
    #[default]
    FullText,
    /// Medication lines only; falls back to the full text when the zone is empty.
    MedicationZone,
}

// ═══════════════════════════════════════════════════════════
// Vocabulary
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct VocabularyFile {
    medicines: Vec<String>,
    #[serde(default)]
    brand_aliases: BTreeMap<String, String>,
    #[serde(default)]
    class_suffixes: Vec<String>,
}

/// Immutable drug-name lookup tables, built once and shared.
#[derive(Debug)]
pub struct MedicalVocabulary {
    names: Vec<String>,
    /// lowercase name -> lowercase generic
    generics: HashMap<String, String>,
    suffixes: Vec<String>,
    name_pattern: Regex,
    suffix_pattern: Option<Regex>,
}

impl MedicalVocabulary {
    /// The vocabulary compiled into the binary.
    pub fn bundled() -> Result<Self, ExtractionError> {
        Self::from_json(VOCABULARY_FILE, BUNDLED_VOCABULARY)
    }

    /// Load `medical_vocabulary.json` from a reference-data directory.
    pub fn load(dir: &Path) -> Result<Self, ExtractionError> {
        let raw = read_reference(dir, VOCABULARY_FILE)?;
        Self::from_json(VOCABULARY_FILE, &raw)
    }

    pub fn from_json(file: &str, raw: &str) -> Result<Self, ExtractionError> {
        let parsed: VocabularyFile =
            serde_json::from_str(raw).map_err(|e| reference_error(file, e))?;
        Self::new(parsed.medicines, parsed.brand_aliases, parsed.class_suffixes)
            .map_err(|reason| reference_error(file, reason))
    }

    /// Build from parts. Brand aliases map brand name -> generic name and
    /// both sides become matchable names.
    pub fn new(
        medicines: Vec<String>,
        brand_aliases: BTreeMap<String, String>,
        class_suffixes: Vec<String>,
    ) -> Result<Self, String> {
        if medicines.is_empty() {
            return Err("vocabulary lists no medicines".into());
        }

        let mut names: Vec<String> = Vec::new();
        let mut generics: HashMap<String, String> = HashMap::new();

        let mut add_name = |name: &str, generic: &str| -> Result<(), String> {
            let name = name.trim();
            if !is_word_like(name) {
                return Err(format!("invalid medicine name {name:?}"));
            }
            let key = name.to_lowercase();
            if !generics.contains_key(&key) {
                names.push(name.to_string());
            }
            generics.insert(key, generic.trim().to_lowercase());
            Ok(())
        };

        for name in &medicines {
            add_name(name, name)?;
        }
        for (brand, generic) in &brand_aliases {
            add_name(generic, generic)?;
            add_name(brand, generic)?;
        }

        let mut suffixes = Vec::with_capacity(class_suffixes.len());
        for suffix in class_suffixes {
            let suffix = suffix.trim().to_lowercase();
            if suffix.len() < 3 || !suffix.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(format!("invalid class suffix {suffix:?}"));
            }
            suffixes.push(suffix);
        }
        // longest first so "prazole" wins over "azole"
        suffixes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        suffixes.dedup();

        let name_pattern = Regex::new(&alternation(&names)).map_err(|e| e.to_string())?;
        let suffix_pattern = if suffixes.is_empty() {
            None
        } else {
            let alts: Vec<&str> = suffixes.iter().map(String::as_str).collect();
            Some(
                Regex::new(&format!(r"(?i)\b[a-z]{{3,}}(?:{})\b", alts.join("|")))
                    .map_err(|e| e.to_string())?,
            )
        };

        Ok(Self {
            names,
            generics,
            suffixes,
            name_pattern,
            suffix_pattern,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.generics.contains_key(&name.trim().to_lowercase())
    }

    /// Lowercase generic name; unknown names are returned lowercased.
    pub fn generic_name(&self, name: &str) -> String {
        let key = name.trim().to_lowercase();
        self.generics.get(&key).cloned().unwrap_or(key)
    }

    /// Longest drug-class suffix `name` ends with, leaving a stem of three letters or more.
    pub fn class_suffix(&self, name: &str) -> Option<&str> {
        let lower = name.trim().to_lowercase();
        self.suffixes
            .iter()
            .find(|s| lower.len() >= s.len() + 3 && lower.ends_with(s.as_str()))
            .map(String::as_str)
    }
}

fn is_word_like(name: &str) -> bool {
    name.starts_with(char::is_alphanumeric) && name.ends_with(char::is_alphanumeric)
}

/// `(?i)\b(?:longest|...|short)\b` over escaped names.
fn alternation(names: &[String]) -> String {
    let mut sorted: Vec<&str> = names.iter().map(String::as_str).collect();
    sorted.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    let escaped: Vec<String> = sorted.iter().map(|n| regex::escape(n)).collect();
    format!(r"(?i)\b(?:{})\b", escaped.join("|"))
}

// ═══════════════════════════════════════════════════════════
// Patterns
// ═══════════════════════════════════════════════════════════

/// Amount plus unit, or count plus form with an optional frequency code.
static DOSAGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)\b\d+(?:\.\d+)?\s*(?:(?:mg|mcg|µg|gm|g|ml|iu|units?)\b|%)",
        r"|\b\d+(?:/\d+)?\s*(?:tabs?|tablets?|caps?|capsules?|drops?|puffs?|sachets?|tsp|tbsp)\b",
        r"(?:\s+(?:x\s*)?(?:bid|b\.i\.d|tid|t\.i\.d|qid|q\.i\.d|qds|tds|qhs|qd|bd|od|hs|prn|sos|stat",
        r"|once daily|twice daily|thrice daily|daily)\b)?",
    ))
    .expect("valid dosage pattern")
});

static DURATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b\d+(?:\s*-\s*\d+)?\s*(?:days?|weeks?|wks?|months?|mths?|years?|yrs?)\b",
    )
    .expect("valid duration pattern")
});

/// Frequency codes on their own; reported as durations when no dosage claimed them.
static FREQUENCY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:bid|b\.i\.d|tid|t\.i\.d|qid|q\.i\.d|qds|tds|qhs|qd|bd|od|prn|once daily|twice daily|thrice daily)\b",
    )
    .expect("valid frequency pattern")
});

// ═══════════════════════════════════════════════════════════
// Extractor
// ═══════════════════════════════════════════════════════════

pub struct MedicalEntityExtractor {
    vocabulary: Arc<MedicalVocabulary>,
}

impl MedicalEntityExtractor {
    pub fn new(vocabulary: Arc<MedicalVocabulary>) -> Self {
        Self { vocabulary }
    }

    pub fn vocabulary(&self) -> &MedicalVocabulary {
        &self.vocabulary
    }

    /// All entities in `text`, ordered by start offset.
    pub fn scan(&self, text: &str) -> Vec<ExtractedEntity> {
        let mut entities = self.scan_medicines(text);
        let dosages = scan_dosages(text);
        let durations = scan_durations(text, &dosages);
        entities.extend(dosages);
        entities.extend(durations);
        entities.sort_by_key(|e| (e.start, e.kind));
        entities
    }

    fn scan_medicines(&self, text: &str) -> Vec<ExtractedEntity> {
        let mut found: Vec<ExtractedEntity> = self
            .vocabulary
            .name_pattern
            .find_iter(text)
            .map(|m| ExtractedEntity::from_match(EntityKind::Medicine, m))
            .collect();

        if let Some(suffix_pattern) = &self.vocabulary.suffix_pattern {
            let by_suffix: Vec<ExtractedEntity> = suffix_pattern
                .find_iter(text)
                .filter(|m| !found.iter().any(|e| e.overlaps(m.start(), m.end())))
                .map(|m| ExtractedEntity::from_match(EntityKind::Medicine, m))
                .collect();
            found.extend(by_suffix);
        }

        found.sort_by_key(|e| e.start);
        found
    }

    /// Medicine records for `text`, deduplicated.
    pub fn extract(&self, text: &str) -> Vec<MedicineRecord> {
        let entities = self.scan(text);
        let records = pair_entities(&entities);

        tracing::debug!(
            entities = entities.len(),
            medicines = records.len(),
            text_len = text.len(),
            "Entities extracted"
        );

        records
    }

    /// Extract from the scope's text. Returns the scope actually used.
    pub fn extract_scoped(
        &self,
        sections: &TextSections,
        scope: ExtractionScope,
    ) -> (ExtractionScope, Vec<MedicineRecord>) {
        match scope {
            ExtractionScope::MedicationZone => match sections.medication_zone() {
                Some(zone) => (ExtractionScope::MedicationZone, self.extract(&zone)),
                None => {
                    tracing::debug!("Medication zone empty, extracting from full text");
                    (ExtractionScope::FullText, self.extract(&sections.full_text))
                }
            },
            ExtractionScope::FullText => {
                (ExtractionScope::FullText, self.extract(&sections.full_text))
            }
        }
    }

    /// Append medicines found in structured medication lines that are not
    /// already present. A brand and its generic count as the same medicine.
    /// Returns how many were added.
    pub fn merge_structured(&self, records: &mut Vec<MedicineRecord>, lines: &[String]) -> usize {
        let mut added = 0;
        for line in lines {
            for mut record in self.extract(line) {
                let generic = self.vocabulary.generic_name(&record.name);
                let exists = records
                    .iter()
                    .any(|r| self.vocabulary.generic_name(&r.name) == generic);
                if !exists {
                    record.source = MedicineSource::StructuredList;
                    records.push(record);
                    added += 1;
                }
            }
        }
        added
    }
}

fn scan_dosages(text: &str) -> Vec<ExtractedEntity> {
    DOSAGE_PATTERN
        .find_iter(text)
        .map(|m| ExtractedEntity::from_match(EntityKind::Dosage, m))
        .collect()
}

fn scan_durations(text: &str, dosages: &[ExtractedEntity]) -> Vec<ExtractedEntity> {
    let mut durations: Vec<ExtractedEntity> = DURATION_PATTERN
        .find_iter(text)
        .map(|m| ExtractedEntity::from_match(EntityKind::Duration, m))
        .collect();

    let frequencies: Vec<ExtractedEntity> = FREQUENCY_PATTERN
        .find_iter(text)
        .filter(|m| !dosages.iter().any(|d| d.overlaps(m.start(), m.end())))
        .filter(|m| !durations.iter().any(|d| d.overlaps(m.start(), m.end())))
        .map(|m| ExtractedEntity::from_match(EntityKind::Duration, m))
        .collect();

    durations.extend(frequencies);
    durations.sort_by_key(|e| e.start);
    durations
}

/// Pair each medicine with its nearest dosage and nearest duration.
///
/// Distance is `|candidate.start - medicine.start|`; ties go to the earlier
/// candidate. Same-name medicines within [`DEDUP_WINDOW`] bytes of a kept
/// record are dropped.
pub fn pair_entities(entities: &[ExtractedEntity]) -> Vec<MedicineRecord> {
    let of_kind = |kind: EntityKind| -> Vec<&ExtractedEntity> {
        let mut v: Vec<&ExtractedEntity> = entities.iter().filter(|e| e.kind == kind).collect();
        v.sort_by_key(|e| e.start);
        v
    };
    let medicines = of_kind(EntityKind::Medicine);
    let dosages = of_kind(EntityKind::Dosage);
    let durations = of_kind(EntityKind::Duration);

    let mut kept: Vec<(String, usize)> = Vec::new();
    let mut records = Vec::new();

    for medicine in medicines {
        let name = medicine.text.trim();
        if name.is_empty() {
            continue;
        }
        let key = name.to_lowercase();
        let duplicate = kept
            .iter()
            .any(|(k, start)| *k == key && medicine.start.abs_diff(*start) <= DEDUP_WINDOW);
        if duplicate {
            continue;
        }
        kept.push((key, medicine.start));

        records.push(MedicineRecord {
            name: name.to_string(),
            dosage: nearest(medicine.start, &dosages).cloned(),
            duration: nearest(medicine.start, &durations).cloned(),
            source: MedicineSource::Transcript,
        });
    }

    records
}

fn nearest<'a>(anchor: usize, candidates: &[&'a ExtractedEntity]) -> Option<&'a ExtractedEntity> {
    let mut best: Option<&'a ExtractedEntity> = None;
    for &candidate in candidates {
        let closer = match best {
            Some(b) => candidate.start.abs_diff(anchor) < b.start.abs_diff(anchor),
            None => true,
        };
        if closer {
            best = Some(candidate);
        }
    }
    best
}
