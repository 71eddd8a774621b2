//! Placeholder-token integrity: extraction, validation, sanitization and
//! deterministic repair of `__XT_*__` tokens in model output.

pub mod repair;
pub mod sanitize;
pub mod semantic;
pub mod validate;

use once_cell::sync::Lazy;
use regex::Regex;

pub use repair::repair_token_alignment;
pub use sanitize::{remove_broken_token_markers, sanitize_model_text};
pub use semantic::{is_korean_language, needs_semantic_repair, repair_semantic_mixups};
pub use validate::{validate_translation, violations_to_error, TokenViolation};

/// Masking tokens injected into source text before it reaches the model.
pub static XT_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"__XT_(?:PH|TERM)(?:_[A-Z0-9]+)?_[0-9]{4}__").unwrap());

/// Raw markup tags (`<mag>`, `<Alias=...>`, font tags) as they appear in
/// unmasked game strings.
pub static RAW_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());

pub static PAGEBREAK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[pagebreak\]").unwrap());

/// Sentinel appended to long-text chunks so truncated output is detectable.
pub const SENTINEL_TOKEN: &str = "__XT_PH_9999__";

const MOVABLE_PREFIXES: [&str; 3] = ["__XT_PH_MAG_", "__XT_PH_DUR_", "__XT_PH_NUM_"];

/// Numeric placeholders may legitimately move within a sentence when the
/// target language reorders the clause; everything else is position-fixed.
pub fn is_movable_token(token: &str) -> bool {
    MOVABLE_PREFIXES.iter().any(|p| token.starts_with(p))
}

pub fn extract_tokens(text: &str) -> Vec<String> {
    XT_TOKEN_RE
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSegment {
    Text(String),
    Token(String),
}

/// Splits text into alternating literal and token segments. Token-safe
/// transforms edit only the `Text` segments and reassemble.
pub fn split_by_tokens(text: &str) -> Vec<TokenSegment> {
    let mut segments = Vec::new();
    let mut cursor = 0;
    for m in XT_TOKEN_RE.find_iter(text) {
        if m.start() > cursor {
            segments.push(TokenSegment::Text(text[cursor..m.start()].to_string()));
        }
        segments.push(TokenSegment::Token(m.as_str().to_string()));
        cursor = m.end();
    }
    if cursor < text.len() {
        segments.push(TokenSegment::Text(text[cursor..].to_string()));
    }
    segments
}

pub fn join_segments(segments: &[TokenSegment]) -> String {
    let mut out = String::new();
    for seg in segments {
        match seg {
            TokenSegment::Text(t) | TokenSegment::Token(t) => out.push_str(t),
        }
    }
    out
}

/// Alphanumeric payload length with tokens excluded; the omission check
/// compares these between source and translation.
pub fn payload_len(text: &str) -> usize {
    let stripped = XT_TOKEN_RE.replace_all(text, "");
    stripped.chars().filter(|c| c.is_alphanumeric()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_regex_matches_expected_shapes() {
        for t in [
            "__XT_PH_0001__",
            "__XT_PH_MAG_0042__",
            "__XT_PH_DUR_0002__",
            "__XT_TERM_0007__",
            "__XT_TERM_SESS_0011__",
            "__XT_PH_9999__",
        ] {
            assert!(XT_TOKEN_RE.is_match(t), "{t}");
        }
        for t in ["__XT_PH_01__", "XT_PH_0001__", "__XT_FOO_0001__", "__XT_PH_0001_"] {
            let exact = XT_TOKEN_RE.find(t).map(|m| m.as_str() == t).unwrap_or(false);
            assert!(!exact, "{t}");
        }
    }

    #[test]
    fn split_round_trips() {
        let text = "Deal __XT_PH_MAG_0001__ damage for __XT_PH_DUR_0002__ seconds.";
        let segs = split_by_tokens(text);
        assert_eq!(join_segments(&segs), text);
        assert_eq!(
            segs.iter()
                .filter(|s| matches!(s, TokenSegment::Token(_)))
                .count(),
            2
        );
    }

    #[test]
    fn movable_prefixes() {
        assert!(is_movable_token("__XT_PH_MAG_0001__"));
        assert!(is_movable_token("__XT_PH_NUM_0003__"));
        assert!(!is_movable_token("__XT_PH_0001__"));
        assert!(!is_movable_token("__XT_TERM_0001__"));
    }

    #[test]
    fn payload_len_ignores_tokens() {
        assert_eq!(payload_len("ab __XT_PH_0001__ cd"), 4);
    }
}
