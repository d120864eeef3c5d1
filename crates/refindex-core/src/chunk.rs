//! Paragraph-boundary passage segmentation.
//!
//! Splits a reference's contents into [`Passage`]s that respect a
//! `max_tokens` limit. Splitting prefers paragraph boundaries (`\n\n`);
//! a paragraph that is too large on its own is cut at the last sentence
//! end, newline, or space that fits.
//!
//! Segmentation is a pure function of `(text, max_tokens)`: the same
//! input always yields the same passages and hashes, which is what lets
//! the downstream pipeline steps hit the transformation cache.
//!
//! # Example
//!
//! ```rust
//! use refindex_core::chunk::segment_text;
//!
//! let passages = segment_text("Hello world.\n\nSecond paragraph.", 512);
//! assert_eq!(passages.len(), 1);
//! assert_eq!(passages[0].index, 0);
//! ```

use crate::fingerprint::content_hash;
use crate::models::Passage;

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into passages on paragraph boundaries, respecting `max_tokens`.
///
/// Blank text yields no passages. Indices are contiguous from 0.
pub fn segment_text(text: &str, max_tokens: usize) -> Vec<Passage> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let joined_len = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };

        if joined_len > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }

        if para.len() > max_chars {
            pieces.extend(hard_split(para, max_chars));
            continue;
        }

        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
    }

    if !buf.is_empty() {
        pieces.push(buf);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(i, text)| Passage {
            index: i as i64,
            hash: content_hash(&text),
            text,
        })
        .collect()
}

/// Cut an oversized paragraph into pieces of at most `max_chars` bytes.
fn hard_split(para: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = para;

    while !rest.is_empty() {
        let mut cut = snap_to_char_boundary(rest, max_chars);
        if cut < rest.len() {
            let window = &rest[..cut];
            if let Some(pos) = window
                .rfind(". ")
                .map(|p| p + 2)
                .or_else(|| window.rfind('\n').map(|p| p + 1))
                .or_else(|| window.rfind(' ').map(|p| p + 1))
            {
                cut = pos;
            }
        }
        if cut == 0 {
            // A single char wider than the budget; take it whole.
            cut = rest
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
        }
        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        rest = &rest[cut..];
    }

    out
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
