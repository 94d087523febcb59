//! Content hashing and preview generation.
//!
//! The content hash is the cache key for change detection: a document is
//! re-embedded whenever the SHA-256 of its cleaned text changes.

use sha2::{Digest, Sha256};

/// Maximum preview length (characters, not bytes)
pub const PREVIEW_LENGTH: usize = 200;

/// Suffix appended to previews of texts longer than `PREVIEW_LENGTH`
const TRUNCATION_SUFFIX: &str = "...";

/// Compute the lowercase hex SHA-256 digest of `text`.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// First `PREVIEW_LENGTH` characters of `text`, with an ellipsis when cut.
pub fn preview(text: &str) -> String {
    match text.char_indices().nth(PREVIEW_LENGTH) {
        // Find a safe truncation point (don't break UTF-8 sequences)
        Some((byte_idx, _)) => format!("{}{}", &text[..byte_idx], TRUNCATION_SUFFIX),
        None => text.to_string(),
    }
}
