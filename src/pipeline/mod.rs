pub mod extraction;
pub mod sectioning;
pub mod entities;
pub mod lab_values;
pub mod diagnosis;
pub mod processor;

use std::path::Path;

use extraction::ExtractionError;

/// Read one reference-data file from `dir`.
pub(crate) fn read_reference(dir: &Path, file: &str) -> Result<String, ExtractionError> {
    std::fs::read_to_string(dir.join(file)).map_err(|e| reference_error(file, e))
}

pub(crate) fn reference_error(file: &str, reason: impl std::fmt::Display) -> ExtractionError {
    ExtractionError::ReferenceData {
        file: file.to_string(),
        reason: reason.to_string(),
    }
}
