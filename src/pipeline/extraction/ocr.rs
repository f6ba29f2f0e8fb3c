use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::cascade::CancellationFlag;
use super::preprocess::PreparedImage;
use super::types::{
    AttemptMetadata, EngineId, OcrEngine, OcrEngineAdapter, OcrPageResult, OcrWordResult,
    Recognition, RecognitionAttempt,
};
use super::EngineFailure;

/// Page segmentation modes tried in order: uniform block, single column, automatic.
pub const PAGE_SEG_MODES: [u8; 3] = [6, 4, 3];

// ═══════════════════════════════════════════════════════════
// Rule-based adapter
// ═══════════════════════════════════════════════════════════

/// Adapter C: classical OCR for printed text, fully offline.
///
/// Runs every page segmentation mode and keeps the layout whose best words
/// are most confident. Engine errors in one mode do not abort the others.
pub struct RuleBasedOcrAdapter {
    engine: Option<Arc<dyn OcrEngine>>,
    modes: Vec<u8>,
}

impl RuleBasedOcrAdapter {
    pub fn new(engine: Arc<dyn OcrEngine>) -> Self {
        Self {
            engine: Some(engine),
            modes: PAGE_SEG_MODES.to_vec(),
        }
    }

    /// Adapter with no backend; every attempt fails as unavailable.
    pub fn unavailable() -> Self {
        Self {
            engine: None,
            modes: PAGE_SEG_MODES.to_vec(),
        }
    }

    /// Restrict the layouts tried (at least one mode is always kept).
    pub fn with_modes(mut self, modes: &[u8]) -> Self {
        if !modes.is_empty() {
            self.modes = modes.to_vec();
        }
        self
    }

    /// Adapter driving the `tesseract` executable. A missing binary shows up
    /// as a failed attempt, not as an unavailable engine.
    pub fn tesseract_cli(tessdata_dir: Option<&std::path::Path>) -> Self {
        Self::new(Arc::new(TesseractCli::new(tessdata_dir)))
    }

    /// Tesseract-backed adapter. Falls back to an unavailable adapter when
    /// the engine cannot be initialized.
    #[cfg(feature = "ocr")]
    pub fn tesseract(tessdata_dir: Option<&std::path::Path>) -> Self {
        match BundledTesseract::new(tessdata_dir) {
            Ok(engine) => Self::new(Arc::new(engine)),
            Err(e) => {
                tracing::warn!(error = %e, "Tesseract unavailable, rule-based OCR disabled");
                Self::unavailable()
            }
        }
    }

    fn run(&self, engine: &dyn OcrEngine, image: &PreparedImage) -> Result<Recognition, EngineFailure> {
        let mut best: Option<(u8, OcrPageResult, f32)> = None;
        let mut last_error = None;

        for &mode in &self.modes {
            match engine.ocr_image(&image.png_bytes, mode) {
                Ok(page) => {
                    let score = page_score(&page);
                    tracing::debug!(psm = mode, score, words = page.word_confidences.len(), "Layout pass");
                    if best.as_ref().map_or(true, |(_, _, s)| score > *s) {
                        best = Some((mode, page, score));
                    }
                }
                Err(e) => {
                    tracing::debug!(psm = mode, error = %e, "Layout pass failed");
                    last_error = Some(e);
                }
            }
        }

        let Some((mode, page, score)) = best else {
            return Err(last_error
                .unwrap_or_else(|| EngineFailure::Processing("no layout produced output".into())));
        };

        let text = page.text.trim().to_string();
        Ok(Recognition {
            metadata: AttemptMetadata {
                model: Some(format!("tesseract psm {mode}")),
                block_count: Some(text.lines().filter(|l| !l.trim().is_empty()).count()),
                structured: None,
            },
            text,
            raw_confidence: score,
        })
    }
}

impl OcrEngineAdapter for RuleBasedOcrAdapter {
    fn engine_id(&self) -> EngineId {
        EngineId::RuleBased
    }

    fn is_available(&self) -> bool {
        self.engine.is_some()
    }

    fn recognize(&self, image: &PreparedImage, _cancel: &CancellationFlag) -> RecognitionAttempt {
        let start = Instant::now();
        let outcome = match &self.engine {
            Some(engine) => self.run(engine.as_ref(), image),
            None => Err(EngineFailure::Unavailable("no rule-based OCR engine configured".into())),
        };
        RecognitionAttempt::from_outcome(
            EngineId::RuleBased,
            Some(image.reference()),
            outcome,
            start.elapsed(),
        )
    }
}

/// Layout score: top-half word confidence, or the page mean when the engine
/// reported no words.
fn page_score(page: &OcrPageResult) -> f32 {
    if page.word_confidences.is_empty() {
        return page.confidence.clamp(0.0, 1.0);
    }
    let confs: Vec<f32> = page.word_confidences.iter().map(|w| w.confidence).collect();
    top_half_confidence(&confs)
}

/// Mean of the best half of word confidences when more than four words,
/// else the plain mean. Stray low-confidence specks do not sink a layout.
pub fn top_half_confidence(confidences: &[f32]) -> f32 {
    if confidences.is_empty() {
        return 0.0;
    }
    let mut sorted = confidences.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let considered = if sorted.len() > 4 {
        &sorted[..sorted.len() / 2]
    } else {
        &sorted[..]
    };
    considered.iter().sum::<f32>() / considered.len() as f32
}

// ═══════════════════════════════════════════════════════════
// Tesseract
// ═══════════════════════════════════════════════════════════

/// Bundled Tesseract OCR engine.
/// Only available when compiled with the `ocr` feature flag.
#[cfg(feature = "ocr")]
pub struct BundledTesseract {
    tessdata_dir: Option<std::path::PathBuf>,
    lang: String,
}

#[cfg(feature = "ocr")]
impl BundledTesseract {
    /// Initialize with an optional tessdata directory (system default when `None`).
    pub fn new(tessdata_dir: Option<&std::path::Path>) -> Result<Self, EngineFailure> {
        if let Some(dir) = tessdata_dir {
            if !dir.join("eng.traineddata").exists() {
                return Err(EngineFailure::Unavailable(format!(
                    "eng.traineddata not found in {}",
                    dir.display()
                )));
            }
        }
        Ok(Self {
            tessdata_dir: tessdata_dir.map(|d| d.to_path_buf()),
            lang: "eng".to_string(),
        })
    }
}

#[cfg(feature = "ocr")]
impl OcrEngine for BundledTesseract {
    fn ocr_image(&self, png_bytes: &[u8], page_seg_mode: u8) -> Result<OcrPageResult, EngineFailure> {
        let datapath = match &self.tessdata_dir {
            Some(dir) => Some(
                dir.to_str()
                    .ok_or_else(|| EngineFailure::Unavailable("invalid tessdata path".into()))?,
            ),
            None => None,
        };

        let tess = tesseract::Tesseract::new(datapath, Some(&self.lang))
            .map_err(|e| EngineFailure::Unavailable(format!("{e:?}")))?
            .set_variable("tessedit_pageseg_mode", &page_seg_mode.to_string())
            .map_err(|e| EngineFailure::Processing(format!("{e:?}")))?;

        let mut tess = tess
            .set_image_from_mem(png_bytes)
            .map_err(|e| EngineFailure::Processing(format!("{e:?}")))?;

        let text = tess
            .get_text()
            .map_err(|e| EngineFailure::Processing(format!("{e:?}")))?;

        let confidence = tess.mean_text_conf().max(0) as f32 / 100.0;

        let word_confidences = match tess.get_tsv_text(0) {
            Ok(tsv) => parse_tsv_word_confidences(&tsv),
            Err(_) => text
                .split_whitespace()
                .map(|w| OcrWordResult {
                    text: w.to_string(),
                    confidence,
                })
                .collect(),
        };

        Ok(OcrPageResult {
            text,
            confidence,
            word_confidences,
        })
    }
}

/// Tesseract driven through its command-line executable, one process per
/// layout pass. Needs no native linkage, so it backs builds without `ocr`.
pub struct TesseractCli {
    program: std::path::PathBuf,
    tessdata_dir: Option<std::path::PathBuf>,
    lang: String,
}

impl TesseractCli {
    pub fn new(tessdata_dir: Option<&std::path::Path>) -> Self {
        Self {
            program: "tesseract".into(),
            tessdata_dir: tessdata_dir.map(|d| d.to_path_buf()),
            lang: "eng".to_string(),
        }
    }

    /// Use a specific executable instead of `tesseract` from `PATH`.
    pub fn with_program(mut self, program: impl Into<std::path::PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, input: &std::path::Path, page_seg_mode: u8) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.arg(input)
            .arg("stdout")
            .arg("-l")
            .arg(&self.lang)
            .arg("--psm")
            .arg(page_seg_mode.to_string());
        if let Some(dir) = &self.tessdata_dir {
            cmd.arg("--tessdata-dir").arg(dir);
        }
        cmd.arg("tsv");
        cmd
    }
}

impl OcrEngine for TesseractCli {
    fn ocr_image(&self, png_bytes: &[u8], page_seg_mode: u8) -> Result<OcrPageResult, EngineFailure> {
        let temp_error = |e: std::io::Error| EngineFailure::Processing(format!("temp image: {e}"));
        let mut input = tempfile::Builder::new()
            .prefix("rxscan-")
            .suffix(".png")
            .tempfile()
            .map_err(temp_error)?;
        input.write_all(png_bytes).map_err(temp_error)?;

        let output = self
            .command(input.path(), page_seg_mode)
            .output()
            .map_err(|e| {
                EngineFailure::Unavailable(format!(
                    "cannot run {}: {e}",
                    self.program.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineFailure::Processing(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(parse_tsv_page(&String::from_utf8_lossy(&output.stdout)))
    }
}

// ═══════════════════════════════════════════════════════════
// Mock engine
// ═══════════════════════════════════════════════════════════

/// Mock OCR engine for unit testing without Tesseract.
///
/// Returns the default page for every mode unless a mode-specific page was
/// registered. Without any page it fails like a broken engine.
pub struct MockOcrEngine {
    default_page: Option<(String, f32)>,
    per_mode: HashMap<u8, (String, f32)>,
    calls: AtomicUsize,
}

impl MockOcrEngine {
    pub fn new(text: &str, confidence: f32) -> Self {
        Self {
            default_page: Some((text.to_string(), confidence)),
            per_mode: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            default_page: None,
            per_mode: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_mode(mut self, mode: u8, text: &str, confidence: f32) -> Self {
        self.per_mode.insert(mode, (text.to_string(), confidence));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OcrEngine for MockOcrEngine {
    fn ocr_image(&self, _png_bytes: &[u8], page_seg_mode: u8) -> Result<OcrPageResult, EngineFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (text, confidence) = self
            .per_mode
            .get(&page_seg_mode)
            .or(self.default_page.as_ref())
            .ok_or_else(|| EngineFailure::Processing("mock engine failure".into()))?;

        let word_confidences = text
            .split_whitespace()
            .map(|w| OcrWordResult {
                text: w.to_string(),
                confidence: *confidence,
            })
            .collect();

        Ok(OcrPageResult {
            text: text.clone(),
            confidence: *confidence,
            word_confidences,
        })
    }
}

// ═══════════════════════════════════════════════════════════
// TSV parsing
// ═══════════════════════════════════════════════════════════

/// One level-5 (word) row of Tesseract TSV output.
struct TsvWord<'a> {
    /// (block, paragraph, line) the word belongs to.
    line: (&'a str, &'a str, &'a str),
    text: &'a str,
    confidence: f32,
}

/// TSV columns: level page_num block_num par_num line_num word_num left top width height conf text.
/// Confidence is 0-100, scaled to 0.0-1.0.
fn tsv_words(tsv: &str) -> impl Iterator<Item = TsvWord<'_>> {
    tsv.lines().skip(1).filter_map(|line| {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 12 || fields[0].parse::<i32>().ok()? != 5 {
            return None;
        }
        // Recent Tesseract versions emit fractional confidences
        let conf: f32 = fields[10].trim().parse().ok()?;
        let text = fields[11].trim();
        if text.is_empty() {
            return None;
        }
        // -1 marks words Tesseract could not score
        let confidence = if conf < 0.0 { 0.0 } else { (conf / 100.0).min(1.0) };
        Some(TsvWord {
            line: (fields[2], fields[3], fields[4]),
            text,
            confidence,
        })
    })
}

/// Per-word confidences from Tesseract TSV output.
pub fn parse_tsv_word_confidences(tsv: &str) -> Vec<OcrWordResult> {
    tsv_words(tsv)
        .map(|w| OcrWordResult {
            text: w.text.to_string(),
            confidence: w.confidence,
        })
        .collect()
}

/// Full page from TSV output: words joined per line, lines in reading order,
/// page confidence as the mean word confidence.
pub fn parse_tsv_page(tsv: &str) -> OcrPageResult {
    let mut text = String::new();
    let mut current_line = None;
    let mut word_confidences = Vec::new();

    for word in tsv_words(tsv) {
        match current_line {
            Some(line) if line == word.line => text.push(' '),
            Some(_) => text.push('\n'),
            None => {}
        }
        current_line = Some(word.line);
        text.push_str(word.text);
        word_confidences.push(OcrWordResult {
            text: word.text.to_string(),
            confidence: word.confidence,
        });
    }

    let confidence = if word_confidences.is_empty() {
        0.0
    } else {
        word_confidences.iter().map(|w| w.confidence).sum::<f32>() / word_confidences.len() as f32
    };

    OcrPageResult {
        text,
        confidence,
        word_confidences,
    }
}
