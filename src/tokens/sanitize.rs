use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{PAGEBREAK_RE, RAW_TAG_RE, XT_TOKEN_RE};

static SPACED_MAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([+-]?)<\s*mag\s*>").unwrap());
static SPACED_DUR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([+-]?)<\s*dur\s*>").unwrap());
static SPACED_BUR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([+-]?)<\s*bur\s*>").unwrap());

static LEAKED_INSTRUCTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:do not translate|keep (?:all )?placeholder|output only|return only|preserve (?:all )?tokens?)[^.\n]*\.?",
    )
    .unwrap()
});

/// Removes `__XT_`-shaped fragments that do not form a complete token
/// (truncated ids, missing underscores). Valid tokens pass through.
pub fn remove_broken_token_markers(text: &str) -> String {
    let Some(first) = text.find("__XT_") else {
        return text.to_string();
    };

    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    let mut idx = first;

    loop {
        out.push_str(&text[cursor..idx]);
        match XT_TOKEN_RE.find_at(text, idx) {
            Some(m) if m.start() == idx => {
                out.push_str(m.as_str());
                cursor = m.end();
            }
            _ => {
                let mut end = idx;
                while end < bytes.len() && is_token_char(bytes[end]) {
                    end += 1;
                }
                cursor = end;
            }
        }
        match text[cursor..].find("__XT_") {
            Some(rel) => idx = cursor + rel,
            None => break,
        }
    }
    out.push_str(&text[cursor..]);
    out
}

fn is_token_char(b: u8) -> bool {
    b == b'_' || b.is_ascii_alphanumeric()
}

/// Cleans one model answer against the masked input it was produced from:
/// normalizes runtime-tag spacing, strips hallucinated raw tags and
/// pagebreak markers, flattens stray line breaks and drops leaked prompt
/// instructions and broken token fragments.
pub fn sanitize_model_text(input_masked: &str, output: &str) -> String {
    if output.is_empty() {
        return String::new();
    }

    let mut working = output.to_string();

    if working.contains('<') {
        if input_masked.contains('<') {
            if input_masked.to_ascii_lowercase().contains("<mag") {
                working = SPACED_MAG_RE.replace_all(&working, "$1<mag>").into_owned();
            }
            if input_masked.to_ascii_lowercase().contains("<dur") {
                working = SPACED_DUR_RE.replace_all(&working, "$1<dur>").into_owned();
            }
            if input_masked.to_ascii_lowercase().contains("<bur") {
                working = SPACED_BUR_RE.replace_all(&working, "$1<bur>").into_owned();
            }

            let allowed: HashSet<&str> = RAW_TAG_RE
                .find_iter(input_masked)
                .map(|m| m.as_str())
                .collect();
            working = RAW_TAG_RE
                .replace_all(&working, |caps: &regex::Captures<'_>| {
                    let tag = caps.get(0).map(|m| m.as_str()).unwrap_or("");
                    if allowed.contains(tag) {
                        tag.to_string()
                    } else {
                        String::new()
                    }
                })
                .into_owned();
        } else {
            working = RAW_TAG_RE.replace_all(&working, "").into_owned();
        }
    }

    if working.to_ascii_lowercase().contains("[pagebreak]")
        && !input_masked.to_ascii_lowercase().contains("[pagebreak]")
    {
        working = PAGEBREAK_RE.replace_all(&working, "").into_owned();
    }

    // When the input carries no raw line breaks (they were masked into
    // tokens), raw CR/LF in the output is model noise.
    if (working.contains('\n') || working.contains('\r'))
        && !input_masked.contains('\n')
        && !input_masked.contains('\r')
    {
        working = working.replace(['\r', '\n'], " ");
    }

    if !input_masked.is_empty() && LEAKED_INSTRUCTION_RE.is_match(&working) {
        if !LEAKED_INSTRUCTION_RE.is_match(input_masked) {
            working = LEAKED_INSTRUCTION_RE.replace_all(&working, "").into_owned();
        }
    }

    remove_broken_token_markers(&working)
}
