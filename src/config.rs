//! Analyzer configuration derived from the process environment.
//!
//! Only the cloud engine needs a credential. The local model and Tesseract
//! are wired with defaults, so an empty environment still runs two engines;
//! an unreachable Ollama or a missing executable is a failed attempt.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::pipeline::entities::ExtractionScope;
use crate::pipeline::extraction::{
    CloudVisionAdapter, ExtractionError, GeminiClient, LocalVisionAdapter, OcrCascadeController,
    OcrEngineAdapter, OllamaBlockRecognizer, RuleBasedOcrAdapter, DEFAULT_GEMINI_MODELS,
};
use crate::pipeline::processor::{DocumentAnalyzer, ReferenceData};

/// Application-level constants
pub const APP_NAME: &str = "rxscan";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_LOCAL_MODEL: &str = "llava";
pub const DEFAULT_CLOUD_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CLOUD_RETRY_BACKOFF_MS: u64 = 2000;
pub const DEFAULT_LOCAL_TIMEOUT_SECS: u64 = 120;

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> String {
    format!("{APP_NAME}=info")
}

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Which cascade engines may be used. Disabled engines are wired as
/// unavailable, never removed, so attempts stay auditable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineToggles {
    pub cloud: bool,
    pub local: bool,
    pub rule_based: bool,
}

impl Default for EngineToggles {
    fn default() -> Self {
        Self {
            cloud: true,
            local: true,
            rule_based: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzerConfig {
    /// Never serialized.
    #[serde(skip)]
    pub gemini_api_key: Option<String>,
    pub gemini_models: Vec<String>,
    pub cloud_timeout_secs: u64,
    pub cloud_retry_backoff: Duration,
    pub ollama_url: String,
    pub local_model: String,
    pub local_timeout_secs: u64,
    pub tessdata_dir: Option<PathBuf>,
    /// Directory holding replacement vocabulary/knowledge JSON files.
    pub reference_dir: Option<PathBuf>,
    pub scope: ExtractionScope,
    pub engines: EngineToggles,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            gemini_models: DEFAULT_GEMINI_MODELS.iter().map(|m| m.to_string()).collect(),
            cloud_timeout_secs: DEFAULT_CLOUD_TIMEOUT_SECS,
            cloud_retry_backoff: Duration::from_millis(DEFAULT_CLOUD_RETRY_BACKOFF_MS),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            local_model: DEFAULT_LOCAL_MODEL.to_string(),
            local_timeout_secs: DEFAULT_LOCAL_TIMEOUT_SECS,
            tessdata_dir: None,
            reference_dir: None,
            scope: ExtractionScope::FullText,
            engines: EngineToggles::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Environment
// ═══════════════════════════════════════════════════════════

impl AnalyzerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset;
    /// unparsable numbers fall back to their defaults with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let number = |key: &str, default: u64| match get(key) {
            Some(raw) => raw.parse::<u64>().unwrap_or_else(|_| {
                tracing::warn!(key, value = %raw, default, "Ignoring non-numeric setting");
                default
            }),
            None => default,
        };

        let defaults = Self::default();
        let gemini_models = get("RXSCAN_GEMINI_MODELS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .filter(|models| !models.is_empty())
            .unwrap_or(defaults.gemini_models);

        Self {
            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_models,
            cloud_timeout_secs: number("RXSCAN_CLOUD_TIMEOUT_SECS", DEFAULT_CLOUD_TIMEOUT_SECS),
            cloud_retry_backoff: Duration::from_millis(number(
                "RXSCAN_CLOUD_RETRY_BACKOFF_MS",
                DEFAULT_CLOUD_RETRY_BACKOFF_MS,
            )),
            ollama_url: get("RXSCAN_OLLAMA_URL").unwrap_or(defaults.ollama_url),
            local_model: get("RXSCAN_LOCAL_MODEL").unwrap_or(defaults.local_model),
            local_timeout_secs: number("RXSCAN_LOCAL_TIMEOUT_SECS", DEFAULT_LOCAL_TIMEOUT_SECS),
            tessdata_dir: get("RXSCAN_TESSDATA").map(PathBuf::from),
            reference_dir: get("RXSCAN_REFERENCE_DIR").map(PathBuf::from),
            scope: defaults.scope,
            engines: defaults.engines,
        }
    }

    pub fn with_scope(mut self, scope: ExtractionScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_engines(mut self, engines: EngineToggles) -> Self {
        self.engines = engines;
        self
    }

    // ═══════════════════════════════════════════════════════════
    // Wiring
    // ═══════════════════════════════════════════════════════════

    pub fn cloud_adapter(&self) -> CloudVisionAdapter {
        let key = match (&self.gemini_api_key, self.engines.cloud) {
            (Some(key), true) => key,
            _ => return CloudVisionAdapter::unavailable(),
        };
        match GeminiClient::new(key, self.cloud_timeout_secs) {
            Ok(client) => CloudVisionAdapter::new(Arc::new(client), self.gemini_models.clone())
                .with_retry_backoff(self.cloud_retry_backoff),
            Err(e) => {
                tracing::warn!(error = %e, "Cloud vision client unavailable");
                CloudVisionAdapter::unavailable()
            }
        }
    }

    pub fn local_adapter(&self) -> LocalVisionAdapter {
        if !self.engines.local {
            return LocalVisionAdapter::unavailable();
        }
        let recognizer =
            OllamaBlockRecognizer::new(&self.ollama_url, &self.local_model, self.local_timeout_secs);
        match recognizer {
            Ok(recognizer) => LocalVisionAdapter::new(Arc::new(recognizer)),
            Err(e) => {
                tracing::warn!(error = %e, "Local vision recognizer unavailable");
                LocalVisionAdapter::unavailable()
            }
        }
    }

    #[cfg(feature = "ocr")]
    pub fn rule_based_adapter(&self) -> RuleBasedOcrAdapter {
        if !self.engines.rule_based {
            return RuleBasedOcrAdapter::unavailable();
        }
        RuleBasedOcrAdapter::tesseract(self.tessdata_dir.as_deref())
    }

    #[cfg(not(feature = "ocr"))]
    pub fn rule_based_adapter(&self) -> RuleBasedOcrAdapter {
        if !self.engines.rule_based {
            return RuleBasedOcrAdapter::unavailable();
        }
        RuleBasedOcrAdapter::tesseract_cli(self.tessdata_dir.as_deref())
    }

    pub fn build_cascade(&self) -> OcrCascadeController {
        let adapters: Vec<Box<dyn OcrEngineAdapter>> = vec![
            Box::new(self.cloud_adapter()),
            Box::new(self.local_adapter()),
            Box::new(self.rule_based_adapter()),
        ];
        tracing::info!(
            cloud = adapters[0].is_available(),
            local = adapters[1].is_available(),
            rule_based = adapters[2].is_available(),
            "OCR engines configured"
        );
        OcrCascadeController::new(adapters)
    }

    pub fn reference_data(&self) -> Result<ReferenceData, ExtractionError> {
        match &self.reference_dir {
            Some(dir) => ReferenceData::load(dir),
            None => ReferenceData::bundled(),
        }
    }

    /// Fully wired analyzer. Fails only when reference data is invalid.
    pub fn build_analyzer(&self) -> Result<DocumentAnalyzer, ExtractionError> {
        let reference = self.reference_data()?;
        Ok(
            DocumentAnalyzer::with_reference_data(self.build_cascade(), &reference)?
                .with_scope(self.scope),
        )
    }
}
