//! Content hashes and transformation fingerprints.
//!
//! A fingerprint addresses one pipeline step's output in the
//! transformation cache. It covers the step name, the step's parameters
//! (canonical JSON, keys sorted) and the exact input text, so identical
//! work on identical content always lands on the same cache entry.

use sha2::{Digest, Sha256};

/// SHA-256 of a text, hex-encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fingerprint of `(step, params, input)`.
///
/// Each component is length-prefixed so that shifting bytes between
/// components can never produce a colliding preimage.
pub fn fingerprint(step: &str, params: &serde_json::Value, input: &str) -> String {
    let params = params.to_string();
    let mut hasher = Sha256::new();
    for part in [step, params.as_str(), input] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
