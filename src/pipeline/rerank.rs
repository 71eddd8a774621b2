//! Candidate reranking for structurally risky sources. Directional
//! phrases ("protect X from Y") and paired slash lists are where models
//! most often invert meaning, so those requests ask for several
//! candidates and keep the best-scoring one.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::tokens::{
    is_korean_language, needs_semantic_repair, repair_token_alignment, sanitize_model_text,
    validate_translation,
};

pub const MIN_RISKY_CANDIDATES: u32 = 2;
pub const MAX_RISKY_CANDIDATES: u32 = 8;

static UNRESOLVED_PARTICLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"을\(를\)|\(을\)를|은\(는\)|\(은\)는|이\(가\)|\(이\)가|와\(과\)|\(와\)과|\(으\)로")
        .unwrap()
});

pub fn is_structural_risk(source_text: &str) -> bool {
    let lower = source_text.to_lowercase();
    if lower.is_empty() {
        return false;
    }
    if lower.contains("protect") && lower.contains(" from ") {
        return true;
    }
    if lower.contains(" against ")
        || (lower.contains(" between ") && lower.contains(" and "))
        || lower.contains(" instead of ")
        || lower.contains(" rather than ")
        || lower.contains(" unless ")
        || lower.contains(" except ")
    {
        return true;
    }
    lower.contains('/') && (lower.contains(" per ") || lower.contains(" each "))
}

/// Candidate count for a source: more than one only when reranking can
/// actually catch something (Korean target, risky structure).
pub fn candidate_count_for(target_lang: &str, source_text: &str, configured: u32) -> u32 {
    if !is_korean_language(target_lang) || !is_structural_risk(source_text) {
        return 1;
    }
    configured.clamp(MIN_RISKY_CANDIDATES, MAX_RISKY_CANDIDATES)
}

/// Output still looks like the source language: long shared prefix or a
/// high share of source words surviving verbatim.
pub fn is_likely_untranslated(source: &str, output: &str) -> bool {
    let source = source.trim();
    let output = output.trim();
    if source.len() < 12 || output.is_empty() {
        return false;
    }
    if output.eq_ignore_ascii_case(source) {
        return true;
    }

    let source_words: Vec<&str> = source
        .split_whitespace()
        .filter(|w| w.len() >= 4 && w.chars().all(|c| c.is_ascii_alphabetic()))
        .collect();
    if source_words.len() < 3 {
        return false;
    }
    let lower_output = output.to_lowercase();
    let surviving = source_words
        .iter()
        .filter(|w| lower_output.contains(&w.to_lowercase()))
        .count();
    surviving * 10 >= source_words.len() * 7
}

pub fn has_unresolved_particle_markers(output: &str) -> bool {
    UNRESOLVED_PARTICLE_RE.is_match(output)
}

/// Scores one candidate translation of one item. Token integrity
/// dominates; style problems only break ties.
pub fn score_item_candidate(
    input_masked: &str,
    source: &str,
    raw_output: &str,
    target_lang: &str,
    term_replacements: &HashMap<String, String>,
) -> i32 {
    let mut score = 0;
    let cleaned = sanitize_model_text(input_masked, raw_output);

    let candidate = if validate_translation(input_masked, &cleaned).is_empty() {
        score += 30;
        cleaned
    } else {
        match repair_token_alignment(input_masked, &cleaned, term_replacements) {
            Some(repaired) if validate_translation(input_masked, &repaired).is_empty() => {
                score += 30;
                repaired
            }
            _ => return score - 300,
        }
    };

    if needs_semantic_repair(input_masked, &candidate, target_lang) {
        score -= 60;
    }
    if is_likely_untranslated(source, &candidate) {
        score -= 80;
    }
    if has_unresolved_particle_markers(&candidate) {
        score -= 30;
    }
    score
}
