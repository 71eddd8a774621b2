//! Session term memory: proper names learned during a run so later rows
//! reuse the same rendering. Terms come from definition rows (FULL/NAME/
//! TITLE records); learned pairs are forced into masked text as
//! `__XT_TERM_SESS_####__` tokens and flushed to the project glossary as
//! prompt-only entries at the end of the run.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::RwLock;

use crate::store::{GlossaryEntry, ProjectStore};
use crate::tokens::{split_by_tokens, TokenSegment, XT_TOKEN_RE};
use crate::utils::Result;

pub const MAX_SESSION_TERMS: usize = 200;
pub const MAX_SEED_ROWS: usize = 20;
pub const MAX_PROMPT_PAIRS: usize = 60;

/// Title-cased multi-word English phrases, the usual shape of names.
pub static ENGLISH_PHRASE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:[A-Z][A-Za-z0-9'’\-]*)(?:\s+(?:[A-Z][A-Za-z0-9'’\-]*|of|the|and|or|to|a|an|in|on|for|with|from|at|by|de|la|le|du|van|von))+\b",
    )
    .unwrap()
});

pub static ENGLISH_TITLE_WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][A-Za-z0-9'’\-]{2,}\b").unwrap());

#[derive(Debug, Clone)]
struct TermEntry {
    source: String,
    target: String,
    token: String,
}

#[derive(Debug, Default)]
struct Inner {
    by_key: HashMap<String, TermEntry>,
    insertion_order: Vec<String>,
    next_id: usize,
    unflushed: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct SessionTermMemory {
    inner: RwLock<Inner>,
}

impl SessionTermMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_key.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Learns a term from a finished definition row. First mapping wins;
    /// the table stops growing at [`MAX_SESSION_TERMS`].
    pub async fn learn(&self, rec: Option<&str>, source: &str, translation: &str) -> bool {
        if !is_session_term_rec(rec) {
            return false;
        }
        if !is_definition_text(source) || !is_translation_text(translation) {
            return false;
        }
        let key = normalize_term_key(source);
        if key.is_empty() {
            return false;
        }

        let mut inner = self.inner.write().await;
        if inner.by_key.contains_key(&key) || inner.by_key.len() >= MAX_SESSION_TERMS {
            return false;
        }
        let token = format!("__XT_TERM_SESS_{:04}__", inner.next_id);
        inner.next_id += 1;
        tracing::debug!(term = %key, %token, "session term learned");
        inner.by_key.insert(
            key.clone(),
            TermEntry {
                source: source.trim().to_string(),
                target: translation.trim().to_string(),
                token,
            },
        );
        inner.insertion_order.push(key);
        inner
            .unflushed
            .push((source.trim().to_string(), translation.trim().to_string()));
        true
    }

    /// Replaces known terms in masked text with their session tokens.
    /// Returns the rewritten text plus token maps for the touched terms.
    pub async fn force_tokens(&self, masked: &str) -> ForcedTerms {
        let inner = self.inner.read().await;
        if inner.by_key.is_empty() {
            return ForcedTerms {
                text: masked.to_string(),
                ..ForcedTerms::default()
            };
        }

        let mut entries: Vec<&TermEntry> = inner.by_key.values().collect();
        entries.sort_by(|a, b| b.source.len().cmp(&a.source.len()));

        let mut segments = split_by_tokens(masked);
        let mut token_to_target = HashMap::new();
        let mut token_to_source = HashMap::new();

        for entry in entries {
            let mut used = false;
            for segment in segments.iter_mut() {
                let TokenSegment::Text(text) = segment else {
                    continue;
                };
                if let Some(replaced) = replace_term(text, &entry.source, &entry.token) {
                    *text = replaced;
                    used = true;
                }
            }
            if used {
                token_to_target.insert(entry.token.clone(), entry.target.clone());
                token_to_source.insert(entry.token.clone(), entry.source.clone());
            }
        }

        let text = segments
            .iter()
            .map(|s| match s {
                TokenSegment::Text(t) | TokenSegment::Token(t) => t.as_str(),
            })
            .collect();
        ForcedTerms {
            text,
            token_to_target,
            token_to_source,
        }
    }

    /// Adds learned pairs that occur in any of `texts` to the prompt-only
    /// glossary pairs, longest sources first, capped at
    /// [`MAX_PROMPT_PAIRS`].
    pub async fn merge_prompt_pairs(
        &self,
        texts: &[&str],
        base: &[(String, String)],
    ) -> Vec<(String, String)> {
        let inner = self.inner.read().await;
        if inner.by_key.is_empty() {
            return base.to_vec();
        }

        let lowered: Vec<String> = texts.iter().map(|t| t.to_lowercase()).collect();
        let mut merged: Vec<(String, String)> = base.to_vec();
        for key in &inner.insertion_order {
            let Some(entry) = inner.by_key.get(key) else {
                continue;
            };
            let needle = entry.source.to_lowercase();
            if !lowered.iter().any(|t| t.contains(&needle)) {
                continue;
            }
            if merged.iter().any(|(s, _)| s.eq_ignore_ascii_case(&entry.source)) {
                continue;
            }
            merged.push((entry.source.clone(), entry.target.clone()));
        }
        merged.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        merged.truncate(MAX_PROMPT_PAIRS);
        merged
    }

    /// Persists newly learned terms as prompt-only glossary entries.
    pub async fn flush_to_glossary(&self, store: &dyn ProjectStore) -> Result<usize> {
        let pending = {
            let mut inner = self.inner.write().await;
            std::mem::take(&mut inner.unflushed)
        };
        for (source, target) in &pending {
            store
                .upsert_glossary_entry(&GlossaryEntry {
                    source: source.clone(),
                    target: target.clone(),
                    prompt_only: true,
                })
                .await?;
        }
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "session terms flushed to glossary");
        }
        Ok(pending.len())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ForcedTerms {
    pub text: String,
    pub token_to_target: HashMap<String, String>,
    pub token_to_source: HashMap<String, String>,
}

/// Prefers article-carrying variants so "The Companions" collapses into
/// one token instead of leaving a dangling article.
fn replace_term(text: &str, source: &str, token: &str) -> Option<String> {
    let escaped = regex::escape(source);
    for pattern in [
        format!(r"(?i)\b(?:The|An|A)\s+{escaped}\b"),
        format!(r"\b{escaped}\b"),
    ] {
        let Ok(re) = Regex::new(&pattern) else {
            continue;
        };
        if re.is_match(text) {
            return Some(re.replace_all(text, token).into_owned());
        }
    }
    None
}

pub fn is_session_term_rec(rec: Option<&str>) -> bool {
    let Some(rec) = rec else {
        return false;
    };
    let upper = rec.to_uppercase();
    upper.contains(":FULL") || upper.contains(":NAME") || upper.contains(":NAM") || upper.contains(":TITLE")
}

/// Short name-shaped source text without sentence punctuation or tokens.
pub fn is_definition_text(source: &str) -> bool {
    let s = source.trim();
    if s.len() < 3 || s.len() > 60 {
        return false;
    }
    if s.contains('\r') || s.contains('\n') {
        return false;
    }
    if XT_TOKEN_RE.is_match(s) {
        return false;
    }
    if !s.contains(' ') && !is_single_word_candidate(s) {
        return false;
    }
    if s.contains(['.', '!', '?', ':', ';']) {
        return false;
    }
    s.chars()
        .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '\'' | '’'))
}

/// Single words must look like TitleCase names, not generic words.
pub fn is_single_word_candidate(term: &str) -> bool {
    let s = term.trim();
    if s.len() < 3 || s.len() > 40 {
        return false;
    }
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => {}
        _ => return false,
    }
    s.chars().any(|c| c.is_ascii_lowercase())
}

fn is_translation_text(translation: &str) -> bool {
    let s = translation.trim();
    if s.is_empty() || s.len() > 80 {
        return false;
    }
    if s.contains('\r') || s.contains('\n') {
        return false;
    }
    !XT_TOKEN_RE.is_match(s)
}

pub fn normalize_term_key(term: &str) -> String {
    let mut s = term.trim();
    for article in ["The ", "the ", "An ", "an ", "A ", "a "] {
        if let Some(rest) = s.strip_prefix(article) {
            s = rest.trim_start();
            break;
        }
    }
    s.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn learns_and_forces_terms() {
        let memory = SessionTermMemory::new();
        assert!(
            memory
                .learn(Some("NPC_:FULL"), "Whiterun Guard", "화이트런 경비병")
                .await
        );
        assert_eq!(memory.len().await, 1);

        let forced = memory.force_tokens("Talk to the Whiterun Guard now").await;
        assert!(forced.text.contains("__XT_TERM_SESS_0000__"));
        assert!(!forced.text.to_lowercase().contains("whiterun"));
        assert_eq!(
            forced.token_to_target["__XT_TERM_SESS_0000__"],
            "화이트런 경비병"
        );
    }

    #[tokio::test]
    async fn first_mapping_wins() {
        let memory = SessionTermMemory::new();
        assert!(memory.learn(Some("BOOK:FULL"), "Mara", "마라").await);
        assert!(!memory.learn(Some("BOOK:FULL"), "Mara", "메라").await);
        let forced = memory.force_tokens("Amulet of Mara").await;
        assert_eq!(forced.token_to_target.values().next().map(String::as_str), Some("마라"));
    }

    #[tokio::test]
    async fn rejects_non_definition_rows() {
        let memory = SessionTermMemory::new();
        assert!(!memory.learn(Some("INFO:NAM1"), "go away now.", "저리 가").await);
        assert!(!memory.learn(None, "Mara", "마라").await);
        assert!(!memory.learn(Some("WEAP:DESC"), "Mara", "마라").await);
        assert!(!memory.learn(Some("WEAP:FULL"), "sword", "검").await); // lowercase single word
    }

    #[tokio::test]
    async fn prompt_pairs_capped_and_sorted() {
        let memory = SessionTermMemory::new();
        memory.learn(Some("X:FULL"), "Mara", "마라").await;
        memory.learn(Some("X:FULL"), "Whiterun Guard", "경비병").await;
        let pairs = memory
            .merge_prompt_pairs(&["Mara blesses the Whiterun Guard"], &[])
            .await;
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "Whiterun Guard"); // longest first
    }

    #[tokio::test]
    async fn flush_writes_prompt_only_entries() {
        use crate::store::MemoryStore;
        let memory = SessionTermMemory::new();
        memory.learn(Some("X:FULL"), "Mara", "마라").await;
        let store = MemoryStore::new();
        assert_eq!(memory.flush_to_glossary(&store).await.unwrap(), 1);
        assert_eq!(memory.flush_to_glossary(&store).await.unwrap(), 0);
        let glossary = crate::store::ProjectStore::glossary(&store).await.unwrap();
        assert!(glossary[0].prompt_only);
    }

    #[test]
    fn term_key_strips_articles() {
        assert_eq!(normalize_term_key("The Companions"), "Companions");
        assert_eq!(normalize_term_key("A Night to Remember"), "Night to Remember");
        assert_eq!(normalize_term_key("Mara"), "Mara");
    }
}
