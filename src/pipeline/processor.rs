//! Document analysis orchestrator.
//!
//! Single entry point that drives the full pipeline for one image:
//! decode → OCR cascade → sectioning → entity extraction → diagnosis.
//! Documents carrying enough recognized lab measurements are routed to lab
//! value parsing instead of medicine extraction.
//!
//! All stages are injected at construction so the analyzer stays fully
//! testable with mock OCR adapters. Nothing is persisted here; the caller
//! owns the returned [`DocumentAnalysis`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::{DynamicImage, GenericImageView};
use serde::Serialize;
use uuid::Uuid;

use super::diagnosis::{ConditionKnowledge, DiagnosisSuggestionEngine, DiagnosisSuggestionResult};
use super::entities::{ExtractionScope, MedicalEntityExtractor, MedicalVocabulary, MedicineRecord};
use super::extraction::{
    decode_image, CancellationFlag, EngineId, ExifOrientationCorrector, ExtractionError,
    OcrCascadeController, OcrResult, OcrWarning, RecognitionAttempt,
};
use super::lab_values::{LabReferenceRanges, LabReport, LabValue, LabValueParser};
use super::sectioning::{SectionKeywords, TextSectioner, TextSections};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Prescription,
    LabReport,
}

/// Structured output for one analyzed document. JSON-serializable and the
/// sole contract with the calling service layer.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentAnalysis {
    pub analysis_id: Uuid,
    pub analyzed_at: DateTime<Utc>,
    pub ocr_text: String,
    pub ocr_confidence: f32,
    pub ocr_method: EngineId,
    pub is_handwritten: bool,
    pub quality_warning: Option<String>,
    pub quality_info: Option<String>,
    pub warnings: Vec<OcrWarning>,
    pub sections: TextSections,
    pub document_type: DocumentType,
    pub extraction_scope: ExtractionScope,
    /// Empty for lab reports.
    pub medicines: Vec<MedicineRecord>,
    /// `None` when no medicines were extracted.
    pub diagnosis_suggestions: Option<DiagnosisSuggestionResult>,
    /// Empty unless `document_type` is `LabReport`.
    pub lab_values: Vec<LabValue>,
    pub lab_abnormal_count: usize,
    pub lab_critical_flags: Vec<String>,
    pub summary: String,
    /// Retained for auditability.
    pub winning_attempt: RecognitionAttempt,
}

// ---------------------------------------------------------------------------
// Reference data
// ---------------------------------------------------------------------------

/// Lookup tables shared by the text stages. Loaded once per process.
#[derive(Clone)]
pub struct ReferenceData {
    pub vocabulary: Arc<MedicalVocabulary>,
    pub knowledge: Arc<ConditionKnowledge>,
    pub lab_ranges: Arc<LabReferenceRanges>,
    pub section_keywords: SectionKeywords,
}

impl ReferenceData {
    pub fn bundled() -> Result<Self, ExtractionError> {
        Ok(Self {
            vocabulary: Arc::new(MedicalVocabulary::bundled()?),
            knowledge: Arc::new(ConditionKnowledge::bundled()?),
            lab_ranges: Arc::new(LabReferenceRanges::bundled()?),
            section_keywords: SectionKeywords::default(),
        })
    }

    pub fn load(dir: &std::path::Path) -> Result<Self, ExtractionError> {
        Ok(Self {
            vocabulary: Arc::new(MedicalVocabulary::load(dir)?),
            knowledge: Arc::new(ConditionKnowledge::load(dir)?),
            lab_ranges: Arc::new(LabReferenceRanges::load(dir)?),
            section_keywords: SectionKeywords::default(),
        })
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

pub struct DocumentAnalyzer {
    cascade: OcrCascadeController,
    sectioner: TextSectioner,
    extractor: MedicalEntityExtractor,
    diagnosis: DiagnosisSuggestionEngine,
    lab_parser: LabValueParser,
    scope: ExtractionScope,
}

impl DocumentAnalyzer {
    pub fn new(
        cascade: OcrCascadeController,
        sectioner: TextSectioner,
        extractor: MedicalEntityExtractor,
        diagnosis: DiagnosisSuggestionEngine,
        lab_parser: LabValueParser,
    ) -> Self {
        Self {
            cascade,
            sectioner,
            extractor,
            diagnosis,
            lab_parser,
            scope: ExtractionScope::FullText,
        }
    }

    /// Wire the text stages from shared reference data.
    pub fn with_reference_data(
        cascade: OcrCascadeController,
        reference: &ReferenceData,
    ) -> Result<Self, ExtractionError> {
        Ok(Self::new(
            cascade,
            TextSectioner::new(&reference.section_keywords)?,
            MedicalEntityExtractor::new(reference.vocabulary.clone()),
            DiagnosisSuggestionEngine::new(
                reference.knowledge.clone(),
                reference.vocabulary.clone(),
            ),
            LabValueParser::new(reference.lab_ranges.clone()),
        ))
    }

    pub fn with_scope(mut self, scope: ExtractionScope) -> Self {
        self.scope = scope;
        self
    }

    /// Full pipeline from encoded image bytes. Decoding failure is the
    /// only input error; engine failures never abort the analysis.
    pub fn analyze_bytes(
        &self,
        bytes: &[u8],
        cancel: &CancellationFlag,
    ) -> Result<DocumentAnalysis, ExtractionError> {
        let image = decode_image(bytes, &ExifOrientationCorrector)?;
        self.analyze_image(&image, cancel)
    }

    /// Full pipeline from a decoded image.
    pub fn analyze_image(
        &self,
        image: &DynamicImage,
        cancel: &CancellationFlag,
    ) -> Result<DocumentAnalysis, ExtractionError> {
        let _span = tracing::info_span!(
            "analyze_document",
            width = image.width(),
            height = image.height()
        )
        .entered();

        let ocr = self.cascade.run(image, cancel)?;
        self.analyze_ocr_result(ocr, cancel)
    }

    /// Downstream stages over an already-resolved OCR result.
    pub fn analyze_ocr_result(
        &self,
        ocr: OcrResult,
        cancel: &CancellationFlag,
    ) -> Result<DocumentAnalysis, ExtractionError> {
        cancel.check()?;
        let structured = ocr.winning_attempt.structured().filter(|s| s.has_sections());
        let sections = match structured {
            Some(s) => TextSections::from_structured(s, &ocr.text),
            None => self.sectioner.section(&ocr.text),
        };
        tracing::info!(
            from_structured = structured.is_some(),
            medication_lines = sections.medication_lines.len(),
            "Sectioning complete"
        );

        cancel.check()?;
        let lab = self.lab_parser.parse(&ocr.text);
        let (document_type, scope, medicines, lab) = if lab.is_lab_report() {
            tracing::info!(
                values = lab.values.len(),
                abnormal = lab.abnormal_count,
                critical = lab.critical_flags.len(),
                "Lab report detected, skipping medicine extraction"
            );
            (DocumentType::LabReport, ExtractionScope::FullText, Vec::new(), lab)
        } else {
            let (scope, mut medicines) = self.extractor.extract_scoped(&sections, self.scope);
            if let Some(s) = structured {
                let merged = self.extractor.merge_structured(&mut medicines, &s.medications);
                if merged > 0 {
                    tracing::info!(merged, "Merged medicines from structured transcription");
                }
            }
            tracing::info!(
                scope = ?scope,
                medicines = medicines.len(),
                "Entity extraction complete"
            );
            (DocumentType::Prescription, scope, medicines, LabReport::default())
        };

        cancel.check()?;
        let diagnosis_suggestions = if medicines.is_empty() {
            None
        } else {
            Some(self.diagnosis.suggest_for_records(&medicines))
        };

        let summary = match document_type {
            DocumentType::LabReport => build_lab_summary(&ocr, &lab),
            DocumentType::Prescription => {
                build_summary(&ocr, medicines.len(), diagnosis_suggestions.as_ref())
            }
        };

        Ok(DocumentAnalysis {
            analysis_id: Uuid::new_v4(),
            analyzed_at: Utc::now(),
            ocr_text: ocr.text,
            ocr_confidence: ocr.display_confidence,
            ocr_method: ocr.engine_used,
            is_handwritten: ocr.is_handwritten,
            quality_warning: ocr.quality_warning,
            quality_info: ocr.quality_info,
            warnings: ocr.warnings,
            sections,
            document_type,
            extraction_scope: scope,
            medicines,
            diagnosis_suggestions,
            lab_values: lab.values,
            lab_abnormal_count: lab.abnormal_count,
            lab_critical_flags: lab.critical_flags,
            summary,
            winning_attempt: ocr.winning_attempt,
        })
    }
}

fn quality_sentence(ocr: &OcrResult) -> String {
    let percent = (ocr.display_confidence * 100.0).round() as u32;
    let words = ocr.winning_attempt.word_count;
    if ocr.is_handwritten {
        format!("Handwritten prescription detected (OCR: {percent}% confidence).")
    } else if ocr.display_confidence > 0.80 {
        format!("High-quality text extraction ({percent}% confidence, {words} words).")
    } else if ocr.display_confidence > 0.60 {
        format!("Text extracted with {percent}% confidence ({words} words).")
    } else if ocr.display_confidence > 0.40 {
        format!("Low-quality text ({percent}% confidence). Results may be incomplete.")
    } else {
        format!("Very poor OCR quality ({percent}% confidence). Text extraction unreliable.")
    }
}

/// One-paragraph description of OCR quality and what was found.
pub fn build_summary(
    ocr: &OcrResult,
    medicine_count: usize,
    diagnosis: Option<&DiagnosisSuggestionResult>,
) -> String {
    let mut parts: Vec<String> = vec![quality_sentence(ocr)];

    parts.push(if medicine_count > 0 {
        format!("Found {medicine_count} medicine(s).")
    } else if ocr.is_handwritten {
        "No medicines reliably extracted (handwriting limitation).".to_string()
    } else {
        "No medicines identified.".to_string()
    });

    if let Some(d) = diagnosis {
        if !d.possible_conditions.is_empty() {
            parts.push(format!(
                "{} possible condition(s) suggested.",
                d.possible_conditions.len()
            ));
        }
    }

    parts.join(" ")
}

/// Summary for a document routed to lab value parsing.
pub fn build_lab_summary(ocr: &OcrResult, lab: &LabReport) -> String {
    let mut parts: Vec<String> = vec![quality_sentence(ocr)];
    parts.push(format!(
        "Lab report with {} recognized value(s), {} outside the reference range.",
        lab.values.len(),
        lab.abnormal_count
    ));
    if !lab.critical_flags.is_empty() {
        parts.push(format!(
            "{} critical finding(s) need prompt review.",
            lab.critical_flags.len()
        ));
    }
    parts.join(" ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
