use super::types::{EngineId, OcrWarning, RecognitionAttempt};

/// Confidence thresholds used by the cascade and the quality messages
pub mod thresholds {
    /// Below this (raw): low quality warning.
    pub const LOW: f32 = 0.50;

    /// Below this (raw): moderate confidence note.
    pub const MODERATE: f32 = 0.70;

    /// Additive boost applied to every winning attempt.
    pub const BASE_BOOST: f32 = 0.10;

    /// Upper bound of the word-count quality bonus.
    pub const MAX_QUALITY_BONUS: f32 = 0.15;

    /// Words per full bonus point (bonus = words / 200).
    pub const WORDS_PER_BONUS_UNIT: f32 = 200.0;

    /// Display confidence never exceeds this.
    pub const CONFIDENCE_CAP: f32 = 0.92;

    /// Handwriting score above which a document is flagged.
    pub const HANDWRITING_SCORE: f32 = 0.6;

    /// Stroke irregularity (gradient std sum) above which strokes look hand-drawn.
    pub const STROKE_IRREGULARITY: f32 = 60.0;

    /// Share of single-character words typical of fragmented handwriting OCR.
    pub const SINGLE_CHAR_RATIO: f32 = 0.3;
}

/// Acceptance rule for one engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptancePolicy {
    pub min_confidence: f32,
    pub min_words: usize,
    /// When false the confidence comparison is strict (`>`).
    pub inclusive: bool,
}

impl AcceptancePolicy {
    pub fn for_engine(engine: EngineId) -> Self {
        match engine {
            EngineId::CloudVision => Self {
                min_confidence: 0.50,
                min_words: 3,
                inclusive: true,
            },
            // Handwriting engine: raw confidence is pessimistic, so the bar is lower
            EngineId::LocalDeepLearning => Self {
                min_confidence: 0.20,
                min_words: 5,
                inclusive: false,
            },
            EngineId::RuleBased => Self {
                min_confidence: 0.50,
                min_words: 3,
                inclusive: true,
            },
        }
    }

    pub fn accepts(&self, attempt: &RecognitionAttempt) -> bool {
        if !attempt.succeeded || attempt.word_count < self.min_words {
            return false;
        }
        if self.inclusive {
            attempt.raw_confidence >= self.min_confidence
        } else {
            attempt.raw_confidence > self.min_confidence
        }
    }
}

/// Map a raw engine confidence to the value shown to users.
///
/// `min(cap, raw + BASE_BOOST + min(MAX_QUALITY_BONUS, words / 200))`.
/// Monotonic in both arguments; an attempt without words displays 0.
pub fn calibrate_confidence(raw_confidence: f32, word_count: usize) -> f32 {
    if word_count == 0 {
        return 0.0;
    }
    let raw = if raw_confidence.is_finite() {
        raw_confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let bonus = (word_count as f32 / thresholds::WORDS_PER_BONUS_UNIT)
        .min(thresholds::MAX_QUALITY_BONUS);
    (raw + thresholds::BASE_BOOST + bonus).min(thresholds::CONFIDENCE_CAP)
}

/// Signals feeding the handwriting heuristic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandwritingSignals {
    pub engine: EngineId,
    pub raw_confidence: f32,
    pub stroke_irregularity: f32,
    pub single_char_ratio: f32,
    /// Self-reported by the cloud model, when available.
    pub reported_handwritten: Option<bool>,
}

impl HandwritingSignals {
    pub fn from_attempt(attempt: &RecognitionAttempt) -> Self {
        Self {
            engine: attempt.engine_id,
            raw_confidence: attempt.raw_confidence,
            stroke_irregularity: attempt
                .preprocessed_image
                .as_ref()
                .map(|img| img.stroke_irregularity)
                .unwrap_or(0.0),
            single_char_ratio: single_char_word_ratio(&attempt.raw_text),
            reported_handwritten: attempt.structured().and_then(|s| s.is_handwritten),
        }
    }
}

/// Weighted handwriting score. Higher means more likely handwritten.
pub fn handwriting_score(signals: &HandwritingSignals) -> f32 {
    let mut score = if signals.raw_confidence < 0.40 {
        0.8
    } else if signals.raw_confidence < 0.60 {
        0.5
    } else {
        0.1
    };

    if signals.stroke_irregularity > thresholds::STROKE_IRREGULARITY {
        score += 0.3;
    }
    if signals.single_char_ratio > thresholds::SINGLE_CHAR_RATIO {
        score += 0.2;
    }
    if signals.engine == EngineId::LocalDeepLearning {
        score += 0.1;
    }
    score
}

pub fn detect_handwriting(signals: &HandwritingSignals) -> bool {
    if signals.reported_handwritten == Some(true) {
        return true;
    }
    handwriting_score(signals) > thresholds::HANDWRITING_SCORE
}

/// Fraction of whitespace-delimited words that are a single character.
pub fn single_char_word_ratio(text: &str) -> f32 {
    let mut total = 0usize;
    let mut single = 0usize;
    for word in text.split_whitespace() {
        total += 1;
        if word.chars().count() == 1 {
            single += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    single as f32 / total as f32
}

/// Graded quality findings for the winning attempt.
pub fn assess_result_quality(raw_confidence: f32, is_handwritten: bool) -> Vec<OcrWarning> {
    let mut warnings = Vec::new();
    if is_handwritten {
        warnings.push(OcrWarning::HandwritingDetected);
    }
    if raw_confidence < thresholds::LOW {
        warnings.push(OcrWarning::LowConfidence {
            confidence: raw_confidence,
        });
    } else if raw_confidence < thresholds::MODERATE {
        warnings.push(OcrWarning::ModerateConfidence {
            confidence: raw_confidence,
        });
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extraction::types::{AttemptMetadata, PreparedImageRef, PreprocessProfile};

    fn attempt(engine: EngineId, conf: f32, words: usize, succeeded: bool) -> RecognitionAttempt {
        RecognitionAttempt {
            engine_id: engine,
            preprocessed_image: None,
            raw_text: vec!["word"; words].join(" "),
            raw_confidence: conf,
            word_count: words,
            elapsed_ms: 0,
            succeeded,
            failure_reason: None,
            metadata: AttemptMetadata::default(),
        }
    }

    #[test]
    fn calibration_adds_boost_and_bonus() {
        // 0.5 + 0.10 + 40/200 capped to 0.15
        let c = calibrate_confidence(0.5, 40);
        assert!((c - 0.75).abs() < 1e-6);
        // 0.5 + 0.10 + 10/200
        let c = calibrate_confidence(0.5, 10);
        assert!((c - 0.65).abs() < 1e-6);
    }

    #[test]
    fn calibration_is_capped() {
        assert_eq!(calibrate_confidence(0.99, 500), thresholds::CONFIDENCE_CAP);
        assert_eq!(calibrate_confidence(1.0, 1), thresholds::CONFIDENCE_CAP);
    }

    #[test]
    fn calibration_zero_words_is_zero() {
        assert_eq!(calibrate_confidence(0.9, 0), 0.0);
    }

    #[test]
    fn calibration_monotonic_in_raw_confidence() {
        for words in [1usize, 5, 30, 100] {
            let mut prev = -1.0f32;
            for step in 0..=100 {
                let raw = step as f32 / 100.0;
                let c = calibrate_confidence(raw, words);
                assert!(c >= prev, "not monotonic at raw={raw} words={words}");
                assert!((0.0..=thresholds::CONFIDENCE_CAP).contains(&c));
                prev = c;
            }
        }
    }

    #[test]
    fn calibration_handles_out_of_range_input() {
        assert!(calibrate_confidence(f32::NAN, 10) <= thresholds::CONFIDENCE_CAP);
        assert!(calibrate_confidence(-3.0, 10) >= 0.0);
        assert_eq!(calibrate_confidence(7.0, 10), thresholds::CONFIDENCE_CAP);
    }

    #[test]
    fn local_policy_is_strict_at_threshold() {
        let policy = AcceptancePolicy::for_engine(EngineId::LocalDeepLearning);
        assert!(!policy.accepts(&attempt(EngineId::LocalDeepLearning, 0.20, 10, true)));
        assert!(policy.accepts(&attempt(EngineId::LocalDeepLearning, 0.21, 5, true)));
        assert!(!policy.accepts(&attempt(EngineId::LocalDeepLearning, 0.9, 4, true)));
    }

    #[test]
    fn cloud_policy_is_inclusive_at_threshold() {
        let policy = AcceptancePolicy::for_engine(EngineId::CloudVision);
        assert!(policy.accepts(&attempt(EngineId::CloudVision, 0.50, 3, true)));
        assert!(!policy.accepts(&attempt(EngineId::CloudVision, 0.49, 30, true)));
    }

    #[test]
    fn failed_attempt_never_accepted() {
        let policy = AcceptancePolicy::for_engine(EngineId::RuleBased);
        assert!(!policy.accepts(&attempt(EngineId::RuleBased, 0.99, 50, false)));
    }

    #[test]
    fn low_confidence_scores_as_handwriting() {
        let signals = HandwritingSignals {
            engine: EngineId::RuleBased,
            raw_confidence: 0.35,
            stroke_irregularity: 10.0,
            single_char_ratio: 0.0,
            reported_handwritten: None,
        };
        assert!((handwriting_score(&signals) - 0.8).abs() < 1e-6);
        assert!(detect_handwriting(&signals));
    }

    #[test]
    fn confident_printed_text_not_handwriting() {
        let signals = HandwritingSignals {
            engine: EngineId::RuleBased,
            raw_confidence: 0.9,
            stroke_irregularity: 80.0,
            single_char_ratio: 0.5,
            reported_handwritten: None,
        };
        // 0.1 + 0.3 + 0.2 = 0.6, not above threshold
        assert!(!detect_handwriting(&signals));
    }

    #[test]
    fn mid_confidence_with_irregular_strokes_is_handwriting() {
        let signals = HandwritingSignals {
            engine: EngineId::CloudVision,
            raw_confidence: 0.55,
            stroke_irregularity: 75.0,
            single_char_ratio: 0.0,
            reported_handwritten: None,
        };
        assert!(detect_handwriting(&signals));
    }

    #[test]
    fn local_engine_win_tips_the_score() {
        let base = HandwritingSignals {
            engine: EngineId::RuleBased,
            raw_confidence: 0.55,
            stroke_irregularity: 0.0,
            single_char_ratio: 0.0,
            reported_handwritten: None,
        };
        assert!(!detect_handwriting(&base));
        let local = HandwritingSignals {
            engine: EngineId::LocalDeepLearning,
            single_char_ratio: 0.4,
            ..base
        };
        assert!(detect_handwriting(&local));
    }

    #[test]
    fn cloud_report_forces_handwriting() {
        let signals = HandwritingSignals {
            engine: EngineId::CloudVision,
            raw_confidence: 0.95,
            stroke_irregularity: 0.0,
            single_char_ratio: 0.0,
            reported_handwritten: Some(true),
        };
        assert!(detect_handwriting(&signals));
    }

    #[test]
    fn signals_read_stroke_metric_from_rendition() {
        let mut a = attempt(EngineId::LocalDeepLearning, 0.3, 4, true);
        a.raw_text = "R x a b".into();
        a.preprocessed_image = Some(PreparedImageRef {
            profile: PreprocessProfile::LocalDeepLearning,
            width: 2400,
            height: 1800,
            stroke_irregularity: 72.5,
        });
        let signals = HandwritingSignals::from_attempt(&a);
        assert_eq!(signals.stroke_irregularity, 72.5);
        assert!((signals.single_char_ratio - 1.0).abs() < 1e-6);
    }

    #[test]
    fn single_char_ratio_of_empty_text_is_zero() {
        assert_eq!(single_char_word_ratio("   "), 0.0);
        assert!((single_char_word_ratio("a bc d ef") - 0.5).abs() < 1e-6);
    }

    #[test]
    fn quality_grades() {
        let low = assess_result_quality(0.3, false);
        assert!(matches!(low.as_slice(), [OcrWarning::LowConfidence { .. }]));

        let moderate = assess_result_quality(0.6, true);
        assert_eq!(moderate.len(), 2);
        assert_eq!(moderate[0], OcrWarning::HandwritingDetected);
        assert!(moderate[1].is_informational());

        assert!(assess_result_quality(0.85, false).is_empty());
    }
}
