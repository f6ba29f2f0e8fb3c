pub mod types;
pub mod confidence;
pub mod sanitize;
pub mod preprocess;
pub mod ocr;
pub mod local_vision;
pub mod cloud_vision;
pub mod cascade;

pub use types::*;
pub use confidence::*;
pub use sanitize::*;
pub use preprocess::*;
pub use ocr::*;
pub use local_vision::*;
pub use cloud_vision::*;
pub use cascade::*;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal pipeline errors. These are the only errors surfaced to the caller;
/// engine-level problems are recorded as [`EngineFailure`] on each attempt.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image could not be decoded: {0}")]
    ImageDecode(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("Reference data {file} could not be loaded: {reason}")]
    ReferenceData { file: String, reason: String },

    #[error("Document analysis cancelled")]
    Cancelled,
}

/// Recoverable, per-engine failure. Never propagated past the cascade.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EngineFailure {
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Authentication rejected (status {0})")]
    Auth(u16),

    #[error("Rate limited by backend")]
    RateLimited,

    #[error("Backend returned error (status {status}): {body}")]
    Backend { status: u16, body: String },

    #[error("Malformed backend response: {0}")]
    MalformedResponse(String),

    #[error("Recognition failed: {0}")]
    Processing(String),
}

impl EngineFailure {
    /// Map a transport-level HTTP error.
    pub fn from_transport(err: &reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            EngineFailure::Timeout(timeout_secs)
        } else if err.is_connect() {
            EngineFailure::Network(format!("connection failed: {err}"))
        } else {
            EngineFailure::Network(err.to_string())
        }
    }

    /// Map a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => EngineFailure::Auth(status),
            429 => EngineFailure::RateLimited,
            _ => EngineFailure::Backend {
                status,
                body: truncate_body(body),
            },
        }
    }
}

/// Error bodies can be whole HTML pages; keep the start only.
fn truncate_body(body: String) -> String {
    const MAX: usize = 300;
    if body.len() <= MAX {
        return body;
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
