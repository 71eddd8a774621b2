use std::collections::HashMap;

use regex::Regex;

use crate::store::GlossaryEntry;
use crate::tokens::{split_by_tokens, TokenSegment};

/// Result of applying project glossary terms to one masked string.
/// Enforced terms are replaced by `__XT_TERM_####__` tokens the model must
/// echo back; prompt-only terms become hint pairs in the request.
#[derive(Debug, Clone, Default)]
pub struct GlossaryApplication {
    pub text: String,
    pub token_to_target: HashMap<String, String>,
    pub token_to_source: HashMap<String, String>,
    pub prompt_pairs: Vec<(String, String)>,
}

pub fn apply_glossary(masked_text: &str, entries: &[GlossaryEntry]) -> GlossaryApplication {
    let mut enforced: Vec<&GlossaryEntry> = entries
        .iter()
        .filter(|e| !e.prompt_only && !e.source.trim().is_empty())
        .collect();
    // Longest source first so "Dragon Priest" wins over "Dragon".
    enforced.sort_by(|a, b| b.source.len().cmp(&a.source.len()));

    let mut token_to_target = HashMap::new();
    let mut token_to_source = HashMap::new();
    let mut segments = split_by_tokens(masked_text);
    let mut next_idx = 0usize;

    for entry in enforced {
        let Ok(re) = term_regex(&entry.source) else {
            continue;
        };
        for segment in segments.iter_mut() {
            let TokenSegment::Text(text) = segment else {
                continue;
            };
            if !re.is_match(text) {
                continue;
            }
            let token = format!("__XT_TERM_{next_idx:04}__");
            let replaced = re.replace_all(text, token.as_str()).into_owned();
            *text = replaced;
            token_to_target.insert(token.clone(), entry.target.clone());
            token_to_source.insert(token, entry.source.clone());
            next_idx += 1;
        }
    }

    // Re-split so nested scans see the new tokens as atomic.
    let text: String = segments
        .iter()
        .map(|s| match s {
            TokenSegment::Text(t) | TokenSegment::Token(t) => t.as_str(),
        })
        .collect();

    let lower = text.to_lowercase();
    let prompt_pairs = entries
        .iter()
        .filter(|e| e.prompt_only && !e.source.trim().is_empty())
        .filter(|e| lower.contains(&e.source.to_lowercase()))
        .map(|e| (e.source.clone(), e.target.clone()))
        .collect();

    GlossaryApplication {
        text,
        token_to_target,
        token_to_source,
        prompt_pairs,
    }
}

fn term_regex(source: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(source.trim());
    Regex::new(&format!(r"(?i)\b{escaped}\b"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(source: &str, target: &str, prompt_only: bool) -> GlossaryEntry {
        GlossaryEntry {
            source: source.to_string(),
            target: target.to_string(),
            prompt_only,
        }
    }

    #[test]
    fn enforced_terms_become_tokens() {
        let app = apply_glossary(
            "The Dragonborn arrives at Whiterun",
            &[entry("Whiterun", "화이트런", false)],
        );
        assert!(app.text.contains("__XT_TERM_0000__"));
        assert!(!app.text.contains("Whiterun"));
        assert_eq!(app.token_to_target["__XT_TERM_0000__"], "화이트런");
    }

    #[test]
    fn longer_terms_win() {
        let app = apply_glossary(
            "A Dragon Priest appears",
            &[
                entry("Dragon", "용", false),
                entry("Dragon Priest", "드래곤 프리스트", false),
            ],
        );
        assert_eq!(app.token_to_source.len(), 1);
        assert_eq!(
            app.token_to_target.values().next().map(String::as_str),
            Some("드래곤 프리스트")
        );
    }

    #[test]
    fn prompt_only_terms_become_pairs() {
        let app = apply_glossary(
            "the soul gem hums",
            &[entry("Soul Gem", "영혼석", true)],
        );
        assert!(app.token_to_target.is_empty());
        assert_eq!(app.prompt_pairs, vec![("Soul Gem".to_string(), "영혼석".to_string())]);
    }

    #[test]
    fn absent_prompt_terms_skipped() {
        let app = apply_glossary("nothing here", &[entry("Whiterun", "화이트런", true)]);
        assert!(app.prompt_pairs.is_empty());
    }

    #[test]
    fn term_inside_existing_token_untouched() {
        let app = apply_glossary(
            "__XT_PH_0000__ and Whiterun",
            &[entry("PH", "X", false), entry("Whiterun", "화이트런", false)],
        );
        assert!(app.text.starts_with("__XT_PH_0000__"));
        assert!(app.text.contains("__XT_TERM_"));
    }
}
