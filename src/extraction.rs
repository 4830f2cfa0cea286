//! Pulls a renderable document out of raw model output.
//!
//! Model output may carry prose or markdown fencing around the code, so the
//! document is located by its boundary markers rather than parsed.

use tracing::warn;

use crate::errors::AppError;
use crate::models::ExtractedDocument;

pub const START_MARKER: &str = "<!doctype";
pub const END_MARKER: &str = "</html>";

/// Shorter than this and the model most likely answered with an explanation.
pub const MIN_DOCUMENT_LENGTH: usize = 100;

/// Best-effort extraction; never fails, `is_valid` tells whether the result is
/// worth rendering.
pub fn extract(raw: &str) -> ExtractedDocument {
    // ASCII lowercasing keeps byte offsets aligned with `raw`.
    let folded = raw.to_ascii_lowercase();

    let html = match folded.find(START_MARKER) {
        Some(start) => match folded[start..].rfind(END_MARKER) {
            Some(end) => &raw[start..start + end + END_MARKER.len()],
            None => &raw[start..],
        },
        None => raw,
    };
    let is_valid = html.trim().len() >= MIN_DOCUMENT_LENGTH;

    ExtractedDocument {
        raw: raw.to_string(),
        html: html.to_string(),
        is_valid,
    }
}

/// Extraction that fails loudly when no viable document was found.
pub fn extract_document(raw: &str) -> Result<ExtractedDocument, AppError> {
    let document = extract(raw);
    if !document.is_valid {
        let length = document.html.trim().len();
        warn!("Model output did not contain a viable document ({length} bytes)");
        return Err(AppError::ExtractionError {
            length,
            minimum: MIN_DOCUMENT_LENGTH,
        });
    }
    Ok(document)
}
