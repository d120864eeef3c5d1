//! Keyword normalization and excerpt parsing.
//!
//! Every keyword written to storage passes through [`normalize_keyword`],
//! so differently cased or spaced spellings collapse onto one row:
//!
//! ```rust
//! use refindex_core::keywords::normalize_keyword;
//!
//! assert_eq!(normalize_keyword("Machine Learning"), "machine_learning");
//! assert_eq!(normalize_keyword("machine-learning"), "machine_learning");
//! assert_eq!(normalize_keyword(" machine_learning "), "machine_learning");
//! ```

use std::collections::BTreeSet;

/// Prefix the keyword extraction step puts in front of its comma list.
pub const KEYWORDS_PREFIX: &str = "Keywords:";

/// Canonicalize a keyword: trim, lowercase, spaces and hyphens to underscores.
///
/// Idempotent. An empty return value means the keyword should be discarded.
pub fn normalize_keyword(raw: &str) -> String {
    raw.trim().to_lowercase().replace([' ', '-'], "_")
}

/// Parse one passage's keyword excerpt (`"Keywords: a, b, c"`) into
/// normalized, non-empty keywords.
pub fn parse_keyword_excerpt(excerpt: &str) -> Vec<String> {
    let trimmed = excerpt.trim();
    let body = match trimmed.get(..KEYWORDS_PREFIX.len()) {
        Some(head) if head.eq_ignore_ascii_case(KEYWORDS_PREFIX) => &trimmed[KEYWORDS_PREFIX.len()..],
        _ => trimmed,
    };
    body.split(',')
        .map(normalize_keyword)
        .filter(|k| !k.is_empty())
        .collect()
}

/// Union the keywords of every passage excerpt into one set.
pub fn collect_keywords<'a, I>(excerpts: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    excerpts
        .into_iter()
        .flat_map(parse_keyword_excerpt)
        .collect()
}

/// Normalize and deduplicate a caller-supplied keyword filter.
///
/// The result is sorted; empty terms are dropped.
pub fn normalize_filter<S: AsRef<str>>(keywords: &[S]) -> Vec<String> {
    keywords
        .iter()
        .map(|k| normalize_keyword(k.as_ref()))
        .filter(|k| !k.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_equivalent_spellings() {
        for raw in ["Machine Learning", "machine-learning", " machine_learning "] {
            assert_eq!(normalize_keyword(raw), "machine_learning");
        }
    }

    #[test]
    fn test_normalize_idempotent() {
        for raw in [
            "  Deep-Learning  Models ",
            "ÉCOLE Normale",
            "a - b",
            "",
            "   ",
            "already_normal",
        ] {
            let once = normalize_keyword(raw);
            assert_eq!(normalize_keyword(&once), once, "not idempotent for {:?}", raw);
        }
    }

    #[test]
    fn test_normalize_blank_is_empty() {
        assert_eq!(normalize_keyword("   "), "");
    }

    #[test]
    fn test_parse_excerpt_strips_prefix() {
        let kws = parse_keyword_excerpt("Keywords: Cats, Dogs, pet-care");
        assert_eq!(kws, vec!["cats", "dogs", "pet_care"]);
    }

    #[test]
    fn test_parse_excerpt_without_prefix() {
        assert_eq!(parse_keyword_excerpt("rust, tokio"), vec!["rust", "tokio"]);
    }

    #[test]
    fn test_parse_excerpt_drops_empty_terms() {
        assert_eq!(parse_keyword_excerpt("Keywords: a,, ,b,"), vec!["a", "b"]);
        assert!(parse_keyword_excerpt("Keywords:").is_empty());
    }

    #[test]
    fn test_collect_unions_passages() {
        let set = collect_keywords(["Keywords: a, b", "Keywords: B, c"]);
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_normalize_filter_dedups() {
        let f = normalize_filter(&["Rust", "rust", " ", "Async IO"]);
        assert_eq!(f, vec!["async_io", "rust"]);
    }
}
