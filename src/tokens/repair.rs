//! Greedy positional repair for translations whose tokens survived but
//! landed wrong: duplicated, renumbered, dropped or invented. Pure text
//! surgery; the caller re-validates the result.

use std::collections::HashMap;

use super::XT_TOKEN_RE;

const MAX_COUNT_DRIFT: usize = 12;
const LOOKAHEAD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MismatchDecision {
    Substitute,
    DropOutput,
    InsertExpected,
}

/// Re-aligns the token stream of `output` to that of `input_masked`.
/// `term_replacements` maps glossary tokens to the replacement text the
/// model may have leaked instead of the token itself.
///
/// Returns `None` when the output is beyond salvage (no tokens at all, or
/// counts drifted too far apart to guess).
pub fn repair_token_alignment(
    input_masked: &str,
    output: &str,
    term_replacements: &HashMap<String, String>,
) -> Option<String> {
    let expected: Vec<&str> = XT_TOKEN_RE.find_iter(input_masked).map(|m| m.as_str()).collect();
    if expected.is_empty() {
        return Some(output.to_string());
    }

    let actual: Vec<&str> = XT_TOKEN_RE.find_iter(output).map(|m| m.as_str()).collect();
    if actual.is_empty() {
        return None;
    }
    if expected.len().abs_diff(actual.len()) > MAX_COUNT_DRIFT {
        return None;
    }

    if expected.len() == actual.len() {
        // Straight positional substitution.
        let mut idx = 0;
        let repaired = XT_TOKEN_RE
            .replace_all(output, |_: &regex::Captures<'_>| {
                let t = expected.get(idx).copied().unwrap_or("");
                idx += 1;
                t.to_string()
            })
            .into_owned();
        return Some(repaired);
    }

    Some(repair_greedy(
        input_masked,
        &expected,
        output,
        term_replacements,
    ))
}

fn repair_greedy(
    input_masked: &str,
    expected: &[&str],
    output: &str,
    term_replacements: &HashMap<String, String>,
) -> String {
    let (mut texts, mut tokens) = split_texts_and_tokens(output);

    let mut i_exp = 0;
    let mut j_out = 0;

    while i_exp < expected.len() && j_out < tokens.len() {
        if tokens[j_out] == expected[i_exp] {
            i_exp += 1;
            j_out += 1;
            continue;
        }

        match decide_mismatch(expected, &tokens, i_exp, j_out) {
            MismatchDecision::DropOutput => {
                tokens[j_out].clear();
                j_out += 1;
            }
            MismatchDecision::InsertExpected => {
                insert_at_boundary(
                    input_masked,
                    &mut texts,
                    j_out,
                    expected[i_exp],
                    term_replacements,
                );
                i_exp += 1;
            }
            MismatchDecision::Substitute => {
                tokens[j_out] = expected[i_exp].to_string();
                i_exp += 1;
                j_out += 1;
            }
        }
    }

    // Anything still expected lands at the final boundary; anything still
    // in the output is surplus and gets blanked.
    while i_exp < expected.len() {
        let last = texts.len() - 1;
        insert_at_boundary(input_masked, &mut texts, last, expected[i_exp], term_replacements);
        i_exp += 1;
    }
    for token in tokens.iter_mut().skip(j_out) {
        token.clear();
    }

    join_texts_and_tokens(&texts, &tokens)
}

fn decide_mismatch(
    expected: &[&str],
    tokens: &[String],
    i_exp: usize,
    j_out: usize,
) -> MismatchDecision {
    let want = expected[i_exp];
    let have = tokens[j_out].as_str();

    let dist_out = find_within(tokens.iter().map(String::as_str), want, j_out + 1);
    let dist_exp = find_within(expected.iter().copied(), have, i_exp + 1);

    match (dist_out, dist_exp) {
        (Some(_), None) => MismatchDecision::DropOutput,
        (None, Some(_)) => MismatchDecision::InsertExpected,
        (Some(d_out), Some(d_exp)) => {
            // Both appear later: take the cheaper move, dropping on ties.
            if d_out - (j_out + 1) <= d_exp - (i_exp + 1) {
                MismatchDecision::DropOutput
            } else {
                MismatchDecision::InsertExpected
            }
        }
        (None, None) => MismatchDecision::Substitute,
    }
}

fn find_within<'a>(
    items: impl Iterator<Item = &'a str>,
    value: &str,
    start: usize,
) -> Option<usize> {
    items
        .enumerate()
        .skip(start)
        .take(LOOKAHEAD)
        .find(|(_, item)| *item == value)
        .map(|(idx, _)| idx)
}

/// texts has one more entry than tokens; texts[i] precedes tokens[i].
fn split_texts_and_tokens(text: &str) -> (Vec<String>, Vec<String>) {
    let mut texts = Vec::new();
    let mut tokens = Vec::new();
    let mut cursor = 0;
    for m in XT_TOKEN_RE.find_iter(text) {
        texts.push(text[cursor..m.start()].to_string());
        tokens.push(m.as_str().to_string());
        cursor = m.end();
    }
    texts.push(text[cursor..].to_string());
    (texts, tokens)
}

fn join_texts_and_tokens(texts: &[String], tokens: &[String]) -> String {
    let mut out = String::new();
    for (i, text) in texts.iter().enumerate() {
        out.push_str(text);
        if let Some(token) = tokens.get(i) {
            out.push_str(token);
        }
    }
    out
}

fn insert_at_boundary(
    input_masked: &str,
    texts: &mut [String],
    boundary: usize,
    token: &str,
    term_replacements: &HashMap<String, String>,
) {
    if boundary == 0 && input_masked.starts_with(token) && !texts[0].starts_with(token) {
        texts[0] = format!("{token}{}", texts[0]);
        return;
    }

    // A missing glossary token often shows up as its leaked replacement
    // text; swap that occurrence back to the token when we can find it.
    if token.starts_with("__XT_TERM_") {
        if let Some(replacement) = term_replacements.get(token).filter(|r| !r.trim().is_empty()) {
            if replace_first(texts, boundary, replacement, token) {
                return;
            }
            if boundary == texts.len() - 1 {
                for i in (0..texts.len() - 1).rev() {
                    if replace_first(texts, i, replacement, token) {
                        return;
                    }
                }
            }
        }
    }

    texts[boundary].push_str(token);
}

fn replace_first(texts: &mut [String], index: usize, needle: &str, replacement: &str) -> bool {
    let Some(text) = texts.get_mut(index) else {
        return false;
    };
    if text.is_empty() || needle.is_empty() {
        return false;
    }
    let Some(at) = text.find(needle) else {
        return false;
    };
    text.replace_range(at..at + needle.len(), replacement);
    true
}
