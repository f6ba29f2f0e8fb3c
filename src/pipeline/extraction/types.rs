use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::cascade::CancellationFlag;
use super::preprocess::PreparedImage;
use super::EngineFailure;

/// The OCR backends known to the cascade, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineId {
    CloudVision,
    LocalDeepLearning,
    RuleBased,
}

impl EngineId {
    /// Fixed cascade priority.
    pub const PRIORITY: [EngineId; 3] = [
        EngineId::CloudVision,
        EngineId::LocalDeepLearning,
        EngineId::RuleBased,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineId::CloudVision => "cloud-vision",
            EngineId::LocalDeepLearning => "local-deep-learning",
            EngineId::RuleBased => "rule-based",
        }
    }

    /// Image rendition each engine expects.
    pub fn profile(&self) -> PreprocessProfile {
        match self {
            EngineId::CloudVision => PreprocessProfile::CloudVision,
            EngineId::LocalDeepLearning => PreprocessProfile::LocalDeepLearning,
            EngineId::RuleBased => PreprocessProfile::RuleBased,
        }
    }
}

impl std::fmt::Display for EngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine-specific preprocessing recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreprocessProfile {
    CloudVision,
    LocalDeepLearning,
    RuleBased,
}

/// Lightweight description of the rendition an attempt ran on.
/// The pixels themselves are dropped once the attempt completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedImageRef {
    pub profile: PreprocessProfile,
    pub width: u32,
    pub height: u32,
    /// Edge irregularity metric (std of vertical + horizontal gradients).
    pub stroke_irregularity: f32,
}

/// Structured transcription returned by the cloud vision service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredTranscription {
    #[serde(default)]
    pub full_text: String,
    #[serde(default)]
    pub header: String,
    #[serde(default)]
    pub patient_info: String,
    #[serde(default)]
    pub medications: Vec<String>,
    #[serde(default)]
    pub doctor_info: String,
    /// Self-reported by the model; informational only.
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub is_handwritten: Option<bool>,
}

impl StructuredTranscription {
    /// True when at least one section field carries content.
    pub fn has_sections(&self) -> bool {
        !self.header.trim().is_empty()
            || !self.patient_info.trim().is_empty()
            || self.medications.iter().any(|m| !m.trim().is_empty())
            || !self.doctor_info.trim().is_empty()
    }
}

/// Backend-specific details attached to an attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptMetadata {
    /// Model or configuration that produced the text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Number of text blocks / lines the backend reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<StructuredTranscription>,
}

/// Successful output of a single backend call, before it becomes an attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub text: String,
    pub raw_confidence: f32,
    pub metadata: AttemptMetadata,
}

/// One engine try. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionAttempt {
    pub engine_id: EngineId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preprocessed_image: Option<PreparedImageRef>,
    pub raw_text: String,
    /// Native or synthetic confidence in [0, 1].
    pub raw_confidence: f32,
    pub word_count: usize,
    pub elapsed_ms: u64,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<EngineFailure>,
    pub metadata: AttemptMetadata,
}

impl RecognitionAttempt {
    /// Build an attempt from an adapter outcome. Confidence is clamped to [0, 1].
    pub fn from_outcome(
        engine_id: EngineId,
        preprocessed_image: Option<PreparedImageRef>,
        outcome: Result<Recognition, EngineFailure>,
        elapsed: Duration,
    ) -> Self {
        let elapsed_ms = elapsed.as_millis() as u64;
        match outcome {
            Ok(recognition) => {
                let raw_confidence = if recognition.raw_confidence.is_finite() {
                    recognition.raw_confidence.clamp(0.0, 1.0)
                } else {
                    0.0
                };
                Self {
                    engine_id,
                    preprocessed_image,
                    word_count: count_words(&recognition.text),
                    raw_text: recognition.text,
                    raw_confidence,
                    elapsed_ms,
                    succeeded: true,
                    failure_reason: None,
                    metadata: recognition.metadata,
                }
            }
            Err(reason) => Self::failed(engine_id, preprocessed_image, reason, elapsed_ms),
        }
    }

    pub fn failed(
        engine_id: EngineId,
        preprocessed_image: Option<PreparedImageRef>,
        reason: EngineFailure,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            engine_id,
            preprocessed_image,
            raw_text: String::new(),
            raw_confidence: 0.0,
            word_count: 0,
            elapsed_ms,
            succeeded: false,
            failure_reason: Some(reason),
            metadata: AttemptMetadata::default(),
        }
    }

    /// Attempt recorded for an engine that reported itself unavailable.
    pub fn unavailable(engine_id: EngineId, reason: impl Into<String>) -> Self {
        Self::failed(engine_id, None, EngineFailure::Unavailable(reason.into()), 0)
    }

    pub fn structured(&self) -> Option<&StructuredTranscription> {
        self.metadata.structured.as_ref()
    }
}

/// Whitespace-delimited word count used for acceptance and calibration.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Quality findings attached to the final OCR result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OcrWarning {
    /// No engine met its acceptance threshold; best available attempt used.
    NoEngineAccepted { best_engine: EngineId },
    /// Every engine failed outright; no text was produced.
    NoTextExtracted,
    LowConfidence { confidence: f32 },
    ModerateConfidence { confidence: f32 },
    HandwritingDetected,
    BlankPage,
    PoorContrast,
    BlurryImage,
}

impl OcrWarning {
    /// Informational findings do not populate `quality_warning`.
    pub fn is_informational(&self) -> bool {
        matches!(self, OcrWarning::ModerateConfidence { .. })
    }

    pub fn message(&self) -> String {
        match self {
            OcrWarning::NoEngineAccepted { best_engine } => format!(
                "No OCR engine met its acceptance threshold; best available result from {best_engine} is shown."
            ),
            OcrWarning::NoTextExtracted => {
                "No text could be extracted. Try a clearer, higher resolution image.".to_string()
            }
            OcrWarning::LowConfidence { .. } => {
                "Low quality text detected. Try better lighting, a higher resolution scan, or a clearer image.".to_string()
            }
            OcrWarning::ModerateConfidence { .. } => {
                "Text extracted with moderate confidence. Most content should be accurate.".to_string()
            }
            OcrWarning::HandwritingDetected => {
                "Handwritten text detected. Recognition accuracy is limited for handwriting; verify medicine names and doses.".to_string()
            }
            OcrWarning::BlankPage => "Page appears mostly blank.".to_string(),
            OcrWarning::PoorContrast => "Image has poor contrast.".to_string(),
            OcrWarning::BlurryImage => "Image appears blurry.".to_string(),
        }
    }
}

/// Selected and calibrated OCR output for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResult {
    pub text: String,
    /// Calibrated display value in [0, CONFIDENCE_CAP].
    pub display_confidence: f32,
    pub engine_used: EngineId,
    pub is_handwritten: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_info: Option<String>,
    pub warnings: Vec<OcrWarning>,
    /// Retained for auditability; all other attempts are discarded.
    pub winning_attempt: RecognitionAttempt,
}

/// Uniform contract over OCR backends.
///
/// Implementations must never panic or block indefinitely; every problem is
/// reported through `RecognitionAttempt::failure_reason`.
pub trait OcrEngineAdapter: Send + Sync {
    fn engine_id(&self) -> EngineId;

    /// Cheap check (credentials present, model configured). The cascade skips
    /// preprocessing for unavailable engines.
    fn is_available(&self) -> bool;

    /// Long waits inside an engine (retry backoff) end early once `cancel`
    /// is set; the cascade itself checks the flag between attempts.
    fn recognize(&self, image: &PreparedImage, cancel: &CancellationFlag) -> RecognitionAttempt;
}

/// Per-word OCR output from a native engine.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrWordResult {
    pub text: String,
    pub confidence: f32,
}

/// Raw page result from a native OCR engine.
#[derive(Debug)]
pub struct OcrPageResult {
    pub text: String,
    pub confidence: f32,
    pub word_confidences: Vec<OcrWordResult>,
}

/// Native OCR engine abstraction (allows mocking for tests).
pub trait OcrEngine: Send + Sync {
    /// Recognize a PNG-encoded page with the given page segmentation mode.
    fn ocr_image(&self, png_bytes: &[u8], page_seg_mode: u8) -> Result<OcrPageResult, EngineFailure>;
}
