use once_cell::sync::Lazy;
use regex::Regex;

use crate::tokens::{repair_semantic_mixups, sanitize_model_text, XT_TOKEN_RE};

static DOUBLE_PERCENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"%\s*%").unwrap());
static MULTI_SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"  +").unwrap());
static TOKEN_PERCENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(__XT_PH_(?:MAG|NUM)_[0-9]{4}__)\s*%").unwrap()
});

/// Deterministic cleanup chain applied to every accepted translation
/// before integrity validation: sanitize against the masked input, fix
/// Korean placeholder mixups, then normalize percent signs and spacing.
pub fn apply_post_fixers(input_masked: &str, output: &str, target_lang: &str) -> String {
    let working = sanitize_model_text(input_masked, output);
    let working = repair_semantic_mixups(input_masked, &working, target_lang);
    let working = fix_percent_signs(input_masked, &working);
    normalize_spacing(&working)
}

/// Numeric placeholder originals already carry their percent sign; a
/// model-added `%` right after the token would render doubled.
fn fix_percent_signs(input_masked: &str, output: &str) -> String {
    let mut working = DOUBLE_PERCENT_RE.replace_all(output, "%").into_owned();

    let input_has_bare_percent = {
        let stripped = XT_TOKEN_RE.replace_all(input_masked, "");
        stripped.contains('%')
    };
    if !input_has_bare_percent && TOKEN_PERCENT_RE.is_match(&working) {
        working = TOKEN_PERCENT_RE.replace_all(&working, "$1").into_owned();
    }
    working
}

fn normalize_spacing(text: &str) -> String {
    MULTI_SPACE_RE.replace_all(text.trim(), " ").into_owned()
}
