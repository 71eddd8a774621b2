use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::utils::{Result, TranslateError};

/// Everything a model must not touch: line breaks, markup tags, engine
/// format specifiers, brace variables and literal numbers with percent.
static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(\r\n|\r|\n|[+-]?<[^>]+>[\t ]*%|[+-]?<[^>]+>|\[pagebreak\]|%[A-Za-z0-9_]+%|%(?:[0-9]+\$)?[-+0-9.]*[A-Za-z]|\$[A-Za-z0-9_]+\$|\{\{[A-Za-z0-9_.,:+-]{1,40}\}\}|\{[A-Za-z0-9_.,:+-]{1,40}\}|[+-]?[0-9]+(?:\.[0-9]+)?[\t ]*%|%)",
    )
    .unwrap()
});

static SECONDS_AFTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*seconds?\b").unwrap());

/// A source string with its untranslatable spans replaced by
/// `__XT_PH_####__` tokens, plus the map back to the original spans.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaskedText {
    pub text: String,
    pub token_to_original: HashMap<String, String>,
}

/// Token 9999 is reserved for the long-text sentinel.
const MAX_PLACEHOLDERS: usize = 9999;

pub fn mask(text: &str) -> Result<MaskedText> {
    let mut token_to_original = HashMap::new();
    let mut overflow = false;
    let masked = PLACEHOLDER_RE.replace_all(text, |caps: &regex::Captures<'_>| {
        let m = match caps.get(0) {
            Some(m) => m,
            None => return String::new(),
        };
        let original = m.as_str();
        let idx = token_to_original.len();
        if idx >= MAX_PLACEHOLDERS {
            overflow = true;
            return original.to_string();
        }
        let token = match semantic_label(original, text, m.end()) {
            Some(label) => format!("__XT_PH_{label}_{idx:04}__"),
            None => format!("__XT_PH_{idx:04}__"),
        };
        token_to_original.insert(token.clone(), original.to_string());
        token
    });
    if overflow {
        return Err(TranslateError::Translation(
            "too many placeholders in a single string".to_string(),
        ));
    }
    Ok(MaskedText {
        text: masked.into_owned(),
        token_to_original,
    })
}

pub fn unmask(text: &str, token_to_original: &HashMap<String, String>) -> Result<String> {
    for token in token_to_original.keys() {
        if !text.contains(token) {
            return Err(TranslateError::OutputValidation(format!(
                "missing placeholder token in translation: {token}"
            )));
        }
    }
    let mut working = text.to_string();
    for (token, original) in token_to_original {
        working = working.replace(token, original);
    }
    Ok(working)
}

/// MAG/DUR/NUM labels steer the prompt and enable semantic validation.
fn semantic_label(placeholder: &str, full_text: &str, match_end: usize) -> Option<&'static str> {
    let s = placeholder.strip_prefix(['+', '-']).unwrap_or(placeholder);
    let (s, has_percent_suffix) = match s.strip_suffix('%') {
        Some(rest) => (rest.trim_end(), true),
        None => (s, false),
    };

    if has_percent_suffix && is_ascii_number(s) {
        return Some("NUM");
    }

    let inner = angle_inner(s)?;
    if inner.eq_ignore_ascii_case("mag") {
        return Some("MAG");
    }
    if inner.eq_ignore_ascii_case("dur") {
        return Some("DUR");
    }
    // "<100%>" style percent-in-brackets.
    if let Some(n) = inner.strip_suffix('%') {
        if is_ascii_number(n.trim_end()) {
            return Some("NUM");
        }
    }
    if inner.bytes().all(|b| b.is_ascii_digit()) && !inner.is_empty() {
        if has_percent_suffix {
            return Some("NUM");
        }
        // "<30> seconds" style duration placeholders.
        if SECONDS_AFTER_RE.is_match(&full_text[match_end.min(full_text.len())..]) {
            return Some("DUR");
        }
        return Some("NUM");
    }
    None
}

fn angle_inner(s: &str) -> Option<&str> {
    if s.len() < 3 || !s.starts_with('<') || !s.ends_with('>') {
        return None;
    }
    Some(s[1..s.len() - 1].trim())
}

fn is_ascii_number(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().any(|b| b.is_ascii_digit())
        && s.bytes().all(|b| b.is_ascii_digit() || b == b'.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_tags_and_numbers() {
        let masked = mask("Deals <mag> damage for <dur> seconds, +25% extra.").unwrap();
        assert!(masked.text.contains("__XT_PH_MAG_0000__"));
        assert!(masked.text.contains("__XT_PH_DUR_0001__"));
        assert!(masked.text.contains("__XT_PH_NUM_0002__"));
        assert!(!masked.text.contains("<mag>"));
        assert_eq!(masked.token_to_original.len(), 3);
    }

    #[test]
    fn numeric_angle_before_seconds_is_duration() {
        let masked = mask("Lasts <30> seconds.").unwrap();
        assert!(masked.text.contains("__XT_PH_DUR_0000__"));
    }

    #[test]
    fn line_breaks_become_tokens() {
        let masked = mask("line one\r\nline two").unwrap();
        assert!(!masked.text.contains('\n'));
        assert_eq!(masked.token_to_original.len(), 1);
    }

    #[test]
    fn unmask_round_trip() {
        let source = "Hit for <mag> points.\n[pagebreak]Next %s page.";
        let masked = mask(source).unwrap();
        let restored = unmask(&masked.text, &masked.token_to_original).unwrap();
        assert_eq!(restored, source);
    }

    #[test]
    fn unmask_rejects_missing_token() {
        let masked = mask("Hit for <mag> points.").unwrap();
        assert!(unmask("포인트 피해", &masked.token_to_original).is_err());
    }

    #[test]
    fn format_specifiers_masked() {
        let masked = mask("Found %d of %TOTAL% items in {location}").unwrap();
        assert_eq!(masked.token_to_original.len(), 3);
    }
}
