use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::utils::TranslateError;

use super::{extract_tokens, is_movable_token, payload_len, RAW_TAG_RE};

/// Signed runtime placeholder usage, e.g. `-<mag>%`. Sign and percent are
/// part of the meaning, so counts are compared per full key.
static PLACEHOLDER_USAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([+-]?)<\s*(mag|dur|bur)\s*>(\s*%)?").unwrap());

const OMISSION_MIN_INPUT: usize = 240;
const OMISSION_LONG_INPUT: usize = 800;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenViolation {
    MissingToken(String),
    UnexpectedToken(String),
    CountMismatch {
        token: String,
        expected: usize,
        got: usize,
    },
    SequenceMismatch,
    RawTagMismatch {
        tag: String,
        expected: usize,
        got: usize,
    },
    PlaceholderUsageMismatch {
        key: String,
        expected: usize,
        got: usize,
    },
    OmissionSuspected {
        required: usize,
        got: usize,
    },
}

impl fmt::Display for TokenViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenViolation::MissingToken(t) => write!(f, "missing token in translation: {t}"),
            TokenViolation::UnexpectedToken(t) => {
                write!(f, "unexpected token in translation: {t}")
            }
            TokenViolation::CountMismatch {
                token,
                expected,
                got,
            } => write!(f, "token count mismatch for {token}: expected {expected}, got {got}"),
            TokenViolation::SequenceMismatch => write!(f, "token sequence mismatch"),
            TokenViolation::RawTagMismatch { tag, expected, got } => {
                write!(f, "raw tag count mismatch for {tag}: expected {expected}, got {got}")
            }
            TokenViolation::PlaceholderUsageMismatch { key, expected, got } => write!(
                f,
                "placeholder usage mismatch for {key}: expected {expected}, got {got}"
            ),
            TokenViolation::OmissionSuspected { required, got } => write!(
                f,
                "suspected omission: {got} payload characters, at least {required} required"
            ),
        }
    }
}

pub fn violations_to_error(violations: &[TokenViolation]) -> TranslateError {
    let joined = violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    TranslateError::OutputValidation(joined)
}

/// Checks a sanitized translation against its masked input. Empty result
/// means the translation is integrity-clean.
pub fn validate_translation(input_masked: &str, output: &str) -> Vec<TokenViolation> {
    let mut violations = Vec::new();

    let expected = extract_tokens(input_masked);
    let actual = extract_tokens(output);

    if expected.len() == actual.len() {
        if expected != actual && !is_allowed_reorder(&expected, &actual) {
            violations.push(TokenViolation::SequenceMismatch);
        }
    } else {
        push_count_violations(&expected, &actual, &mut violations);
    }

    check_raw_tags(input_masked, output, &mut violations);
    check_placeholder_usage(input_masked, output, &mut violations);
    check_omission(input_masked, output, &mut violations);

    violations
}

/// Same-count reorders are legal only when every displaced token is a
/// movable numeric placeholder: the fixed-token skeleton must match in
/// order and each gap between fixed tokens must hold the same movable
/// multiset on both sides.
fn is_allowed_reorder(expected: &[String], actual: &[String]) -> bool {
    let (fixed_e, gaps_e) = split_fixed_and_gaps(expected);
    let (fixed_a, gaps_a) = split_fixed_and_gaps(actual);
    if fixed_e != fixed_a {
        return false;
    }
    gaps_e == gaps_a
}

fn split_fixed_and_gaps(tokens: &[String]) -> (Vec<&str>, Vec<HashMap<&str, usize>>) {
    let mut fixed = Vec::new();
    let mut gaps = vec![HashMap::new()];
    for token in tokens {
        if is_movable_token(token) {
            if let Some(last) = gaps.last_mut() {
                *last.entry(token.as_str()).or_insert(0) += 1;
            }
        } else {
            fixed.push(token.as_str());
            gaps.push(HashMap::new());
        }
    }
    (fixed, gaps)
}

fn push_count_violations(
    expected: &[String],
    actual: &[String],
    violations: &mut Vec<TokenViolation>,
) {
    let expected_counts = count_by(expected);
    let actual_counts = count_by(actual);

    for (token, &want) in &expected_counts {
        match actual_counts.get(token) {
            None => violations.push(TokenViolation::MissingToken((*token).to_string())),
            Some(&got) if got != want => violations.push(TokenViolation::CountMismatch {
                token: (*token).to_string(),
                expected: want,
                got,
            }),
            Some(_) => {}
        }
    }
    for token in actual_counts.keys() {
        if !expected_counts.contains_key(token) {
            violations.push(TokenViolation::UnexpectedToken((*token).to_string()));
        }
    }
}

fn count_by(tokens: &[String]) -> HashMap<&str, usize> {
    let mut counts = HashMap::new();
    for t in tokens {
        *counts.entry(t.as_str()).or_insert(0) += 1;
    }
    counts
}

fn check_raw_tags(input: &str, output: &str, violations: &mut Vec<TokenViolation>) {
    if !input.contains('<') && !output.contains('<') {
        return;
    }
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for m in RAW_TAG_RE.find_iter(input) {
        counts.entry(m.as_str()).or_default().0 += 1;
    }
    for m in RAW_TAG_RE.find_iter(output) {
        counts.entry(m.as_str()).or_default().1 += 1;
    }
    for (tag, (want, got)) in counts {
        if want != got {
            violations.push(TokenViolation::RawTagMismatch {
                tag: tag.to_string(),
                expected: want,
                got,
            });
        }
    }
}

fn check_placeholder_usage(input: &str, output: &str, violations: &mut Vec<TokenViolation>) {
    if !input.contains('<') {
        return;
    }
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for caps in PLACEHOLDER_USAGE_RE.captures_iter(input) {
        counts.entry(usage_key(&caps)).or_default().0 += 1;
    }
    for caps in PLACEHOLDER_USAGE_RE.captures_iter(output) {
        counts.entry(usage_key(&caps)).or_default().1 += 1;
    }
    for (key, (want, got)) in counts {
        if want != got {
            violations.push(TokenViolation::PlaceholderUsageMismatch {
                key,
                expected: want,
                got,
            });
        }
    }
}

fn usage_key(caps: &regex::Captures<'_>) -> String {
    let sign = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    let kind = caps
        .get(2)
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_default();
    let pct = if caps.get(3).is_some() { "%" } else { "" };
    format!("{sign}<{kind}>{pct}")
}

/// Long source segments that come back drastically shorter than a
/// length-proportional floor are flagged as suspected omissions.
fn check_omission(input: &str, output: &str, violations: &mut Vec<TokenViolation>) {
    let in_len = payload_len(input);
    if in_len < OMISSION_MIN_INPUT {
        return;
    }
    let (ratio, min_abs) = if in_len >= OMISSION_LONG_INPUT {
        (0.20, 120)
    } else {
        (0.16, 60)
    };
    let required = std::cmp::max(min_abs, (in_len as f64 * ratio).ceil() as usize);
    let got = payload_len(output);
    if got < required {
        violations.push(TokenViolation::OmissionSuspected { required, got });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movable_cannot_cross_fixed_token() {
        let input = "Hit __XT_PH_MAG_0001__ for __XT_PH_DUR_0002__s __XT_TERM_0003__";
        let output = "__XT_TERM_0003__에게 __XT_PH_DUR_0002__초간 __XT_PH_MAG_0001__의 피해";
        // Reorder moves movables across a fixed TERM token: not allowed.
        assert!(!validate_translation(input, output).is_empty());
    }

    #[test]
    fn movable_reorder_within_gap_passes() {
        let input = "Deal __XT_PH_MAG_0001__ damage over __XT_PH_DUR_0002__ seconds";
        let output = "__XT_PH_DUR_0002__초 동안 __XT_PH_MAG_0001__의 피해를 줍니다";
        assert!(validate_translation(input, output).is_empty());
    }

    #[test]
    fn fixed_token_reorder_fails() {
        let input = "__XT_PH_0001__ and __XT_PH_0002__";
        let output = "__XT_PH_0002__ 그리고 __XT_PH_0001__";
        assert_eq!(
            validate_translation(input, output),
            vec![TokenViolation::SequenceMismatch]
        );
    }

    #[test]
    fn missing_and_unexpected_tokens_reported() {
        let input = "a __XT_PH_0001__ b";
        let output = "a __XT_PH_0002__ b";
        let violations = validate_translation(input, output);
        assert!(violations.contains(&TokenViolation::MissingToken("__XT_PH_0001__".into())));
        assert!(violations.contains(&TokenViolation::UnexpectedToken("__XT_PH_0002__".into())));
    }

    #[test]
    fn duplicate_count_mismatch_reported() {
        let input = "__XT_PH_0001__ x __XT_PH_0001__";
        let output = "__XT_PH_0001__ y";
        let violations = validate_translation(input, output);
        assert!(matches!(
            violations[0],
            TokenViolation::CountMismatch { expected: 2, got: 1, .. }
        ));
    }

    #[test]
    fn raw_tag_counts_enforced() {
        let input = "Absorb <mag> points";
        let output = "포인트를 흡수";
        let violations = validate_translation(input, output);
        assert!(violations
            .iter()
            .any(|v| matches!(v, TokenViolation::RawTagMismatch { .. })));
    }

    #[test]
    fn signed_percent_usage_is_distinct() {
        let input = "Armor -<mag>%";
        let output = "방어력 <mag>%";
        let violations = validate_translation(input, output);
        assert!(violations
            .iter()
            .any(|v| matches!(v, TokenViolation::PlaceholderUsageMismatch { .. })));
    }

    #[test]
    fn short_output_for_long_input_is_omission() {
        let input = "word ".repeat(100); // 400 payload chars
        let output = "짧음";
        let violations = validate_translation(&input, output);
        assert!(violations
            .iter()
            .any(|v| matches!(v, TokenViolation::OmissionSuspected { .. })));
    }

    #[test]
    fn proportional_output_passes_omission_check() {
        let input = "word ".repeat(100);
        let output = "출력 ".repeat(40);
        let violations = validate_translation(&input, &output);
        assert!(violations.is_empty(), "{violations:?}");
    }
}
