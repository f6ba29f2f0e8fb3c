//! OCR cascade: tries engines strictly in priority order, never concurrently.
//!
//! `TryCloud -> TryLocalDeepLearning -> TryRuleBased -> Resolved`. The first
//! attempt meeting its engine's acceptance policy resolves the cascade. When
//! none does, the best available attempt is used and a warning attached.
//! Engine failures are data on the attempt; the only error this controller
//! returns is cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::DynamicImage;

use super::confidence::{
    assess_result_quality, calibrate_confidence, detect_handwriting, AcceptancePolicy,
    HandwritingSignals,
};
use super::preprocess::{
    metric_view, DocumentQualityAssessor, ImagePreprocessor, ProfilePreprocessor, QualityAssessor,
};
use super::sanitize::sanitize_extracted_text;
use super::types::{EngineId, OcrEngineAdapter, OcrResult, OcrWarning, RecognitionAttempt};
use super::{EngineFailure, ExtractionError};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared cancellation signal for one analysis request.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<(), ExtractionError> {
        if self.is_cancelled() {
            Err(ExtractionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` in short slices. Returns `false` as soon as
    /// cancellation is observed, `true` when the full wait elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(CANCEL_POLL_INTERVAL));
        }
    }
}

/// Cascade position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeState {
    Try(EngineId),
    Resolved,
}

impl CascadeState {
    pub fn start() -> Self {
        CascadeState::Try(EngineId::PRIORITY[0])
    }

    /// State after a rejected attempt on `engine`.
    pub fn advance(engine: EngineId) -> Self {
        EngineId::PRIORITY
            .iter()
            .position(|e| *e == engine)
            .and_then(|i| EngineId::PRIORITY.get(i + 1))
            .map_or(CascadeState::Resolved, |next| CascadeState::Try(*next))
    }
}

pub struct OcrCascadeController {
    adapters: Vec<Box<dyn OcrEngineAdapter>>,
    preprocessor: Box<dyn ImagePreprocessor>,
    quality: Box<dyn QualityAssessor>,
}

impl OcrCascadeController {
    /// Adapters may be given in any order; lookup is by engine id.
    pub fn new(adapters: Vec<Box<dyn OcrEngineAdapter>>) -> Self {
        Self {
            adapters,
            preprocessor: Box::new(ProfilePreprocessor),
            quality: Box::new(DocumentQualityAssessor),
        }
    }

    pub fn with_preprocessor(mut self, preprocessor: Box<dyn ImagePreprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn with_quality_assessor(mut self, quality: Box<dyn QualityAssessor>) -> Self {
        self.quality = quality;
        self
    }

    fn adapter(&self, engine: EngineId) -> Option<&dyn OcrEngineAdapter> {
        self.adapters
            .iter()
            .find(|a| a.engine_id() == engine)
            .map(|a| a.as_ref())
    }

    /// Run the cascade on a decoded image.
    pub fn run(
        &self,
        image: &DynamicImage,
        cancel: &CancellationFlag,
    ) -> Result<OcrResult, ExtractionError> {
        let _span = tracing::info_span!("ocr_cascade").entered();

        let quality = self.quality.assess(&metric_view(image).to_rgb8());

        let mut attempts: Vec<RecognitionAttempt> = Vec::with_capacity(EngineId::PRIORITY.len());
        let mut state = CascadeState::start();
        let mut accepted: Option<usize> = None;

        while let CascadeState::Try(engine) = state {
            cancel.check()?;

            let attempt = self.attempt(engine, image, cancel);
            let is_accepted = AcceptancePolicy::for_engine(engine).accepts(&attempt);

            tracing::info!(
                engine = %engine,
                elapsed_ms = attempt.elapsed_ms,
                word_count = attempt.word_count,
                raw_confidence = attempt.raw_confidence,
                succeeded = attempt.succeeded,
                accepted = is_accepted,
                failure = attempt.failure_reason.as_ref().map(|f| f.to_string()),
                "OCR attempt complete"
            );

            attempts.push(attempt);
            if is_accepted {
                accepted = Some(attempts.len() - 1);
                state = CascadeState::Resolved;
            } else {
                state = CascadeState::advance(engine);
            }
        }

        let (winner_index, was_accepted) = match accepted {
            Some(i) => (i, true),
            None => (best_available(&attempts), false),
        };
        let winner = attempts.swap_remove(winner_index);
        drop(attempts);

        let mut warnings = Vec::new();
        if !was_accepted {
            if winner.succeeded && winner.word_count > 0 {
                warnings.push(OcrWarning::NoEngineAccepted {
                    best_engine: winner.engine_id,
                });
            } else {
                warnings.push(OcrWarning::NoTextExtracted);
            }
        }

        let has_text = winner.word_count > 0;
        let is_handwritten = has_text && detect_handwriting(&HandwritingSignals::from_attempt(&winner));
        if has_text {
            warnings.extend(assess_result_quality(winner.raw_confidence, is_handwritten));
        }
        for w in quality.warnings {
            if !warnings.contains(&w) {
                warnings.push(w);
            }
        }

        let result = resolve(winner, is_handwritten, warnings);

        tracing::info!(
            engine = %result.engine_used,
            accepted = was_accepted,
            display_confidence = result.display_confidence,
            is_handwritten = result.is_handwritten,
            warnings = result.warnings.len(),
            "OCR cascade resolved"
        );

        Ok(result)
    }

    /// One engine try. Unavailable engines are recorded without preprocessing.
    fn attempt(
        &self,
        engine: EngineId,
        image: &DynamicImage,
        cancel: &CancellationFlag,
    ) -> RecognitionAttempt {
        let Some(adapter) = self.adapter(engine) else {
            return RecognitionAttempt::unavailable(engine, "engine not configured");
        };
        if !adapter.is_available() {
            return RecognitionAttempt::unavailable(engine, "engine reported unavailable");
        }
        match self.preprocessor.prepare(image, engine.profile()) {
            Ok(prepared) => adapter.recognize(&prepared, cancel),
            Err(e) => RecognitionAttempt::failed(
                engine,
                None,
                EngineFailure::Processing(e.to_string()),
                0,
            ),
        }
    }
}

/// Index of the best attempt when none was accepted: highest raw confidence,
/// succeeded attempts before failed ones, earliest priority on ties.
fn best_available(attempts: &[RecognitionAttempt]) -> usize {
    let mut best = 0;
    for (i, attempt) in attempts.iter().enumerate().skip(1) {
        let current = &attempts[best];
        let better = match (attempt.succeeded, current.succeeded) {
            (true, false) => true,
            (false, true) => false,
            _ => attempt.raw_confidence > current.raw_confidence,
        };
        if better {
            best = i;
        }
    }
    best
}

/// Build the final result from the winning attempt. Calibration uses only
/// the winner's raw confidence and word count.
fn resolve(winner: RecognitionAttempt, is_handwritten: bool, warnings: Vec<OcrWarning>) -> OcrResult {
    let join = |informational: bool| {
        let messages: Vec<String> = warnings
            .iter()
            .filter(|w| w.is_informational() == informational)
            .map(|w| w.message())
            .collect();
        (!messages.is_empty()).then(|| messages.join(" "))
    };
    let quality_warning = join(false);
    let quality_info = join(true);

    OcrResult {
        text: sanitize_extracted_text(&winner.raw_text),
        display_confidence: calibrate_confidence(winner.raw_confidence, winner.word_count),
        engine_used: winner.engine_id,
        is_handwritten,
        quality_warning,
        quality_info,
        warnings,
        winning_attempt: winner,
    }
}
