//! Adapter A: cloud vision transcription (Google Gemini REST API).
//!
//! The service is asked for a structured JSON transcription of the
//! prescription. It reports no usable confidence, so one is assigned from
//! response completeness: word count tiers plus a bonus per populated
//! section. The model's self-reported confidence is kept only as metadata.
//!
//! Failure policy:
//! - 404 (model not served): try the next configured model
//! - 429 (rate limited): one retry after the backoff, then fail
//! - anything else: fail immediately, the cascade moves on

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine as _;

use super::cascade::CancellationFlag;
use super::preprocess::PreparedImage;
use super::sanitize::extract_json_object;
use super::types::{
    count_words, AttemptMetadata, EngineId, OcrEngineAdapter, Recognition, RecognitionAttempt,
    StructuredTranscription,
};
use super::EngineFailure;

const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Default model ids, tried in order when a model is not served.
pub const DEFAULT_GEMINI_MODELS: &[&str] = &["gemini-2.5-flash", "gemini-2.0-flash"];

const TRANSCRIPTION_PROMPT: &str = "\
You are an OCR and medical text extraction system. \
Extract ALL text from this medical document image with maximum accuracy. \
Return JSON only, in exactly this form:\n\
{\n\
  \"full_text\": \"complete extracted text, one line per printed or written line\",\n\
  \"header\": \"medical center or hospital name and address\",\n\
  \"patient_info\": \"patient name, age, record number, date\",\n\
  \"medications\": [\"medicine name, dosage, frequency (e.g. Betaloc 100mg - 1 tab BID)\"],\n\
  \"doctor_info\": \"doctor name and signature area\",\n\
  \"confidence\": 0.0,\n\
  \"is_handwritten\": false\n\
}\n\
Copy medicine names exactly as written. Keep dosages (mg, ml) and frequency codes (BID, TID, QD). \
Use empty strings for sections that are not present.";

/// Sends one image to one model and returns the model's raw text output.
pub trait VisionTranscriber: Send + Sync {
    fn transcribe(&self, model: &str, png_bytes: &[u8]) -> Result<String, EngineFailure>;
}

// ──────────────────────────────────────────────
// CloudVisionAdapter
// ──────────────────────────────────────────────

pub struct CloudVisionAdapter {
    transcriber: Option<Arc<dyn VisionTranscriber>>,
    models: Vec<String>,
    retry_backoff: Duration,
}

impl CloudVisionAdapter {
    pub fn new(transcriber: Arc<dyn VisionTranscriber>, models: Vec<String>) -> Self {
        Self {
            transcriber: Some(transcriber),
            models,
            retry_backoff: Duration::from_millis(2000),
        }
    }

    /// Adapter without credentials; every attempt fails as unavailable.
    pub fn unavailable() -> Self {
        Self {
            transcriber: None,
            models: Vec::new(),
            retry_backoff: Duration::ZERO,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    fn run(
        &self,
        transcriber: &dyn VisionTranscriber,
        image: &PreparedImage,
        cancel: &CancellationFlag,
    ) -> Result<Recognition, EngineFailure> {
        let mut retried = false;
        let mut models = self.models.iter();
        let mut current = models.next();

        while let Some(model) = current {
            match transcriber.transcribe(model, &image.png_bytes) {
                Ok(raw) => {
                    let (text, structured) = parse_transcription(&raw);
                    let raw_confidence = completeness_confidence(&text, structured.as_ref());
                    return Ok(Recognition {
                        text,
                        raw_confidence,
                        metadata: AttemptMetadata {
                            model: Some(model.clone()),
                            block_count: structured.as_ref().map(|s| s.medications.len()),
                            structured,
                        },
                    });
                }
                Err(EngineFailure::Backend { status: 404, .. }) => {
                    tracing::warn!(model = %model, "Cloud model not served, trying next");
                    current = models.next();
                }
                Err(EngineFailure::RateLimited) if !retried => {
                    tracing::warn!(
                        model = %model,
                        backoff_ms = self.retry_backoff.as_millis() as u64,
                        "Cloud vision rate limited, retrying once"
                    );
                    retried = true;
                    if !cancel.sleep(self.retry_backoff) {
                        tracing::info!(model = %model, "Cancelled during rate-limit backoff");
                        return Err(EngineFailure::RateLimited);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(EngineFailure::Unavailable(
            "none of the configured cloud models is served".into(),
        ))
    }
}

impl OcrEngineAdapter for CloudVisionAdapter {
    fn engine_id(&self) -> EngineId {
        EngineId::CloudVision
    }

    fn is_available(&self) -> bool {
        self.transcriber.is_some() && !self.models.is_empty()
    }

    fn recognize(&self, image: &PreparedImage, cancel: &CancellationFlag) -> RecognitionAttempt {
        let start = Instant::now();
        let outcome = match &self.transcriber {
            Some(t) if !self.models.is_empty() => self.run(t.as_ref(), image, cancel),
            _ => Err(EngineFailure::Unavailable(
                "cloud vision credential not configured".into(),
            )),
        };
        RecognitionAttempt::from_outcome(
            EngineId::CloudVision,
            Some(image.reference()),
            outcome,
            start.elapsed(),
        )
    }
}

/// Split a model response into plain text and the structured transcription.
///
/// Non-JSON responses are used verbatim as text. A JSON response without
/// `full_text` is rebuilt from its sections.
pub fn parse_transcription(raw: &str) -> (String, Option<StructuredTranscription>) {
    let parsed = extract_json_object(raw)
        .and_then(|json| serde_json::from_str::<StructuredTranscription>(json).ok());

    match parsed {
        Some(structured) => {
            let text = if structured.full_text.trim().is_empty() {
                let mut parts: Vec<&str> = vec![structured.header.trim()];
                parts.push(structured.patient_info.trim());
                parts.extend(structured.medications.iter().map(|m| m.trim()));
                parts.push(structured.doctor_info.trim());
                parts
                    .into_iter()
                    .filter(|p| !p.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n")
            } else {
                structured.full_text.trim().to_string()
            };
            (text, Some(structured))
        }
        None => (raw.trim().to_string(), None),
    }
}

/// Synthetic confidence from word count and populated sections, capped at 0.95.
pub fn completeness_confidence(text: &str, structured: Option<&StructuredTranscription>) -> f32 {
    let words = count_words(text);
    let base: f32 = match words {
        0 => return 0.0,
        1..=4 => 0.3,
        5..=19 => 0.5,
        20..=59 => 0.7,
        _ => 0.8,
    };

    let populated = structured.map_or(0, |s| {
        [
            !s.header.trim().is_empty(),
            !s.patient_info.trim().is_empty(),
            s.medications.iter().any(|m| !m.trim().is_empty()),
            !s.doctor_info.trim().is_empty(),
        ]
        .iter()
        .filter(|populated| **populated)
        .count()
    });

    (base + 0.03 * populated as f32).min(0.95)
}

// ──────────────────────────────────────────────
// GeminiClient
// ──────────────────────────────────────────────

/// Blocking Gemini `generateContent` client.
pub struct GeminiClient {
    api_key: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl GeminiClient {
    pub fn new(api_key: &str, timeout_secs: u64) -> Result<Self, EngineFailure> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| EngineFailure::Unavailable(format!("HTTP client: {e}")))?;
        Ok(Self {
            api_key: api_key.to_string(),
            client,
            timeout_secs,
        })
    }

    /// The key travels in a header so it never appears in request URLs.
    fn request(&self, model: &str, png_bytes: &[u8]) -> reqwest::blocking::RequestBuilder {
        let url = format!("{GEMINI_ENDPOINT}/{model}:generateContent");
        let body = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": TRANSCRIPTION_PROMPT },
                    {
                        "inline_data": {
                            "mime_type": "image/png",
                            "data": base64::engine::general_purpose::STANDARD.encode(png_bytes)
                        }
                    }
                ]
            }],
            "generationConfig": {
                "temperature": 0.1,
                "responseMimeType": "application/json"
            }
        });

        self.client
            .post(url)
            .header(API_KEY_HEADER, self.api_key.as_str())
            .json(&body)
    }
}

impl VisionTranscriber for GeminiClient {
    fn transcribe(&self, model: &str, png_bytes: &[u8]) -> Result<String, EngineFailure> {
        let _span = tracing::info_span!(
            "cloud_vision_transcribe",
            model = %model,
            image_size = png_bytes.len(),
        )
        .entered();

        let response = self
            .request(model, png_bytes)
            .send()
            .map_err(|e| EngineFailure::from_transport(&e.without_url(), self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(EngineFailure::from_status(status.as_u16(), body));
        }

        let json: serde_json::Value = response
            .json()
            .map_err(|e| EngineFailure::MalformedResponse(e.without_url().to_string()))?;

        extract_candidate_text(&json)
    }
}

/// Text of `candidates[0].content.parts[*].text`, concatenated.
pub fn extract_candidate_text(json: &serde_json::Value) -> Result<String, EngineFailure> {
    let parts = json["candidates"][0]["content"]["parts"]
        .as_array()
        .ok_or_else(|| {
            let reason = json["promptFeedback"]["blockReason"]
                .as_str()
                .map(|r| format!("response blocked: {r}"))
                .unwrap_or_else(|| "no candidates in response".to_string());
            EngineFailure::MalformedResponse(reason)
        })?;

    Ok(parts
        .iter()
        .filter_map(|p| p["text"].as_str())
        .collect::<Vec<_>>()
        .join(""))
}

// ──────────────────────────────────────────────
// MockTranscriber (testing)
// ──────────────────────────────────────────────

/// Scripted transcriber. Responses are consumed in order; the last one
/// repeats once the script runs out.
pub struct MockTranscriber {
    script: Mutex<VecDeque<Result<String, EngineFailure>>>,
    last: Result<String, EngineFailure>,
    models_called: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl MockTranscriber {
    pub fn always(response: Result<String, EngineFailure>) -> Self {
        Self::scripted(vec![response])
    }

    pub fn scripted(responses: Vec<Result<String, EngineFailure>>) -> Self {
        let last = responses
            .last()
            .cloned()
            .unwrap_or_else(|| Err(EngineFailure::Processing("empty mock script".into())));
        Self {
            script: Mutex::new(responses.into()),
            last,
            models_called: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn models_called(&self) -> Vec<String> {
        self.models_called
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

impl VisionTranscriber for MockTranscriber {
    fn transcribe(&self, model: &str, _png_bytes: &[u8]) -> Result<String, EngineFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut called) = self.models_called.lock() {
            called.push(model.to_string());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| self.last.clone())
    }
}
