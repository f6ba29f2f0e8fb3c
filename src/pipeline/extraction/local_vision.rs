//! Adapter B: local deep-learning OCR.
//!
//! Runs fully offline against a vision model served by a local Ollama
//! instance. The model is asked for detected text blocks with a per-block
//! confidence; the adapter reports their mean as the raw confidence.
//! Raw confidence from this engine is pessimistic on handwriting, which is
//! why the cascade accepts it at a lower bar.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::cascade::CancellationFlag;
use super::preprocess::PreparedImage;
use super::sanitize::extract_json_object;
use super::types::{AttemptMetadata, EngineId, OcrEngineAdapter, Recognition, RecognitionAttempt};
use super::EngineFailure;

const BLOCK_PROMPT: &str = "\
Read every line of text in this image, including handwriting. \
Respond with JSON only, in the form \
{\"blocks\": [{\"text\": \"<line text>\", \"confidence\": <0.0-1.0>}]}. \
One block per line, top to bottom. Use a low confidence for words you are unsure of. \
Do not correct spelling and do not add text that is not visible.";

/// One detected text region.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TextBlock {
    pub text: String,
    #[serde(default)]
    pub confidence: f32,
}

/// Backend producing text blocks with native confidences.
pub trait TextBlockRecognizer: Send + Sync {
    fn model_name(&self) -> &str;
    fn recognize_blocks(&self, png_bytes: &[u8]) -> Result<Vec<TextBlock>, EngineFailure>;
}

// ──────────────────────────────────────────────
// LocalVisionAdapter
// ──────────────────────────────────────────────

pub struct LocalVisionAdapter {
    recognizer: Option<Arc<dyn TextBlockRecognizer>>,
}

impl LocalVisionAdapter {
    pub fn new(recognizer: Arc<dyn TextBlockRecognizer>) -> Self {
        Self {
            recognizer: Some(recognizer),
        }
    }

    /// Adapter with no model configured; every attempt fails as unavailable.
    pub fn unavailable() -> Self {
        Self { recognizer: None }
    }

    fn run(
        recognizer: &dyn TextBlockRecognizer,
        image: &PreparedImage,
    ) -> Result<Recognition, EngineFailure> {
        let blocks: Vec<TextBlock> = recognizer
            .recognize_blocks(&image.png_bytes)?
            .into_iter()
            .filter(|b| !b.text.trim().is_empty())
            .collect();

        Ok(Recognition {
            text: blocks
                .iter()
                .map(|b| b.text.trim())
                .collect::<Vec<_>>()
                .join("\n"),
            raw_confidence: mean_block_confidence(&blocks),
            metadata: AttemptMetadata {
                model: Some(recognizer.model_name().to_string()),
                block_count: Some(blocks.len()),
                structured: None,
            },
        })
    }
}

impl OcrEngineAdapter for LocalVisionAdapter {
    fn engine_id(&self) -> EngineId {
        EngineId::LocalDeepLearning
    }

    fn is_available(&self) -> bool {
        self.recognizer.is_some()
    }

    fn recognize(&self, image: &PreparedImage, _cancel: &CancellationFlag) -> RecognitionAttempt {
        let start = Instant::now();
        let outcome = match &self.recognizer {
            Some(recognizer) => Self::run(recognizer.as_ref(), image),
            None => Err(EngineFailure::Unavailable(
                "no local vision model configured".into(),
            )),
        };
        RecognitionAttempt::from_outcome(
            EngineId::LocalDeepLearning,
            Some(image.reference()),
            outcome,
            start.elapsed(),
        )
    }
}

/// Mean per-block confidence, 0 when nothing was detected.
pub fn mean_block_confidence(blocks: &[TextBlock]) -> f32 {
    if blocks.is_empty() {
        return 0.0;
    }
    let sum: f32 = blocks
        .iter()
        .map(|b| {
            if b.confidence.is_finite() {
                b.confidence.clamp(0.0, 1.0)
            } else {
                0.0
            }
        })
        .sum();
    sum / blocks.len() as f32
}

// ──────────────────────────────────────────────
// OllamaBlockRecognizer
// ──────────────────────────────────────────────

/// Text block recognition via a local Ollama vision model (`/api/chat`).
pub struct OllamaBlockRecognizer {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl OllamaBlockRecognizer {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Result<Self, EngineFailure> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| EngineFailure::Unavailable(format!("HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            timeout_secs,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    format: &'a str,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
    images: Vec<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl TextBlockRecognizer for OllamaBlockRecognizer {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn recognize_blocks(&self, png_bytes: &[u8]) -> Result<Vec<TextBlock>, EngineFailure> {
        let _span = tracing::info_span!(
            "local_vision_blocks",
            model = %self.model,
            image_size = png_bytes.len(),
        )
        .entered();

        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: BLOCK_PROMPT,
                images: vec![base64::engine::general_purpose::STANDARD.encode(png_bytes)],
            }],
            stream: false,
            format: "json",
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| EngineFailure::from_transport(&e, self.timeout_secs))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(EngineFailure::Unavailable(format!(
                "model '{}' is not installed",
                self.model
            )));
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(EngineFailure::from_status(status.as_u16(), body));
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| EngineFailure::MalformedResponse(e.to_string()))?;

        parse_block_response(&parsed.message.content)
    }
}

#[derive(Deserialize)]
struct BlockEnvelope {
    #[serde(default)]
    blocks: Vec<serde_json::Value>,
}

/// Parse the model's block JSON. Individual malformed blocks are skipped.
pub fn parse_block_response(content: &str) -> Result<Vec<TextBlock>, EngineFailure> {
    let json = extract_json_object(content)
        .ok_or_else(|| EngineFailure::MalformedResponse("no JSON object in response".into()))?;
    let envelope: BlockEnvelope = serde_json::from_str(json)
        .map_err(|e| EngineFailure::MalformedResponse(e.to_string()))?;
    Ok(envelope
        .blocks
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect())
}

// ──────────────────────────────────────────────
// MockBlockRecognizer (testing)
// ──────────────────────────────────────────────

/// Scripted block recognizer with a call counter.
pub struct MockBlockRecognizer {
    result: Result<Vec<TextBlock>, EngineFailure>,
    calls: AtomicUsize,
}

impl MockBlockRecognizer {
    pub fn new(blocks: &[(&str, f32)]) -> Self {
        Self {
            result: Ok(blocks
                .iter()
                .map(|(text, confidence)| TextBlock {
                    text: text.to_string(),
                    confidence: *confidence,
                })
                .collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(failure: EngineFailure) -> Self {
        Self {
            result: Err(failure),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextBlockRecognizer for MockBlockRecognizer {
    fn model_name(&self) -> &str {
        "mock-vision"
    }

    fn recognize_blocks(&self, _png_bytes: &[u8]) -> Result<Vec<TextBlock>, EngineFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extraction::types::PreprocessProfile;

    fn prepared() -> PreparedImage {
        PreparedImage {
            profile: PreprocessProfile::LocalDeepLearning,
            png_bytes: vec![1, 2, 3],
            width: 2400,
            height: 1800,
            stroke_irregularity: 70.0,
        }
    }

    #[test]
    fn averages_block_confidence_and_joins_lines() {
        let mock = Arc::new(MockBlockRecognizer::new(&[
            ("Betaloc 100mg", 0.30),
            ("1 tab BID", 0.20),
            ("   ", 0.90),
        ]));
        let adapter = LocalVisionAdapter::new(mock.clone());
        let attempt = adapter.recognize(&prepared(), &CancellationFlag::new());

        assert!(attempt.succeeded);
        assert_eq!(attempt.raw_text, "Betaloc 100mg\n1 tab BID");
        assert!((attempt.raw_confidence - 0.25).abs() < 1e-6);
        assert_eq!(attempt.word_count, 5);
        assert_eq!(attempt.metadata.block_count, Some(2));
        assert_eq!(attempt.metadata.model.as_deref(), Some("mock-vision"));
        assert_eq!(mock.calls(), 1);
    }

    #[test]
    fn no_blocks_is_empty_success() {
        let adapter = LocalVisionAdapter::new(Arc::new(MockBlockRecognizer::new(&[])));
        let attempt = adapter.recognize(&prepared(), &CancellationFlag::new());
        assert!(attempt.succeeded);
        assert_eq!(attempt.word_count, 0);
        assert_eq!(attempt.raw_confidence, 0.0);
    }

    #[test]
    fn backend_failure_is_recorded() {
        let adapter = LocalVisionAdapter::new(Arc::new(MockBlockRecognizer::failing(
            EngineFailure::Timeout(120),
        )));
        let attempt = adapter.recognize(&prepared(), &CancellationFlag::new());
        assert!(!attempt.succeeded);
        assert_eq!(attempt.failure_reason, Some(EngineFailure::Timeout(120)));
    }

    #[test]
    fn unavailable_adapter() {
        let adapter = LocalVisionAdapter::unavailable();
        assert!(!adapter.is_available());
        let attempt = adapter.recognize(&prepared(), &CancellationFlag::new());
        assert!(matches!(
            attempt.failure_reason,
            Some(EngineFailure::Unavailable(_))
        ));
    }

    #[test]
    fn mean_confidence_clamps_bad_values() {
        let blocks = vec![
            TextBlock { text: "a".into(), confidence: 1.5 },
            TextBlock { text: "b".into(), confidence: f32::NAN },
        ];
        assert!((mean_block_confidence(&blocks) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn parses_block_json() {
        let blocks = parse_block_response(
            r#"{"blocks": [{"text": "Atenolol 50mg", "confidence": 0.41}, {"text": "OD"}]}"#,
        )
        .unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].text, "Atenolol 50mg");
        assert_eq!(blocks[1].confidence, 0.0);
    }

    #[test]
    fn parse_skips_malformed_blocks() {
        let blocks =
            parse_block_response(r#"{"blocks": [{"confidence": 0.9}, {"text": "ok", "confidence": 0.5}]}"#)
                .unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].text, "ok");
    }

    #[test]
    fn parse_rejects_non_json() {
        assert!(matches!(
            parse_block_response("I cannot read this image"),
            Err(EngineFailure::MalformedResponse(_))
        ));
    }

    #[test]
    fn ollama_recognizer_trims_trailing_slash() {
        let recognizer = OllamaBlockRecognizer::new("http://localhost:11434/", "llava", 60).unwrap();
        assert_eq!(recognizer.base_url, "http://localhost:11434");
        assert_eq!(recognizer.model_name(), "llava");
    }
}
