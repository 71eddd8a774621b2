//! Turns requested row ids into deduplicated work units: translation
//! memory short-circuit, masking, glossary enforcement, session term
//! injection and duplicate canonicalization.

use std::collections::HashMap;

use crate::session::SessionTermMemory;
use crate::store::{ProjectStore, RowRecord, RowStatus, RowUpdate, TmKey};
use crate::text::glossary::{apply_glossary, GlossaryApplication};
use crate::text::mask::{mask, MaskedText};
use crate::text::postfix::apply_post_fixers;
use crate::tokens::validate_translation;
use crate::utils::{Result, RunOptions};

use super::events::{EventSender, RowEvent};

pub const NOTE_TM_HIT: &str = "tm_hit";
pub const NOTE_TM_FALLBACK: &str = "tm_fallback";

/// One model-bound unit of work. Duplicates of the same canonical unit
/// are carried separately and fanned out after translation.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub id: i64,
    pub source: String,
    /// Fully prepared text: masked, glossary-enforced, session terms
    /// forced. This is what the model sees.
    pub masked: String,
    pub mask: MaskedText,
    pub glossary: GlossaryApplication,
    /// Session term tokens present in `masked`, mapped to target text.
    pub session_targets: HashMap<String, String>,
    pub session_sources: HashMap<String, String>,
    pub rec: Option<String>,
    pub edid: Option<String>,
    pub weight: usize,
    pub original_index: usize,
}

impl WorkUnit {
    /// All enforced-token replacements the model might leak as text:
    /// glossary targets plus session term sources.
    pub fn term_replacements(&self) -> HashMap<String, String> {
        let mut map = self.glossary.token_to_source.clone();
        for (token, source) in &self.session_sources {
            map.insert(token.clone(), source.clone());
        }
        map
    }
}

/// A row whose prepared text is identical to a canonical unit. It gets
/// the canonical unit's raw translation replayed through its own mask.
#[derive(Debug, Clone)]
pub struct DuplicateRow {
    pub id: i64,
    pub mask: MaskedText,
    pub glossary: GlossaryApplication,
}

#[derive(Debug, Clone)]
pub struct RowContext {
    pub rec: Option<String>,
    pub edid: Option<String>,
    pub order: i64,
    pub source: String,
}

#[derive(Debug, Default)]
pub struct PreparedItems {
    pub units: Vec<WorkUnit>,
    pub duplicates: HashMap<i64, Vec<DuplicateRow>>,
    pub row_ctx: HashMap<i64, RowContext>,
    /// Reference-only neighboring lines for dialogue rows.
    pub dialogue_ctx: HashMap<i64, String>,
    pub tm_hits: usize,
    pub skipped: usize,
}

pub async fn prepare_items(
    store: &dyn ProjectStore,
    session: Option<&SessionTermMemory>,
    options: &RunOptions,
    ids: &[i64],
    events: &EventSender,
) -> Result<PreparedItems> {
    let rows = store.rows_by_ids(ids).await?;
    let mut prepared = PreparedItems::default();

    for row in &rows {
        prepared.row_ctx.insert(
            row.id,
            RowContext {
                rec: row.rec.clone(),
                edid: row.edid.clone(),
                order: row.order,
                source: row.source.clone(),
            },
        );
    }

    prepared.dialogue_ctx = build_dialogue_windows(&rows);

    let glossary = store.glossary().await?;
    // Canonical prepared-text key -> index into units.
    let mut canonical: HashMap<String, usize> = HashMap::new();

    for (index, row) in rows.iter().enumerate() {
        if !row.status.is_translatable() {
            prepared.skipped += 1;
            continue;
        }
        if row.source.trim().is_empty() {
            prepared.skipped += 1;
            continue;
        }

        if options.translation_memory
            && try_translation_memory(store, session, options, row, events).await?
        {
            prepared.tm_hits += 1;
            continue;
        }

        let masked = mask(&row.source)?;
        let glossary_app = apply_glossary(&masked.text, &glossary);
        let (text, session_targets, session_sources) = match session {
            Some(memory) => {
                let forced = memory.force_tokens(&glossary_app.text).await;
                (forced.text, forced.token_to_target, forced.token_to_source)
            }
            None => (glossary_app.text.clone(), HashMap::new(), HashMap::new()),
        };

        let key = canonical_key(&text, &glossary_app);
        if let Some(&unit_index) = canonical.get(&key) {
            let unit_id = prepared.units[unit_index].id;
            prepared
                .duplicates
                .entry(unit_id)
                .or_default()
                .push(DuplicateRow {
                    id: row.id,
                    mask: masked,
                    glossary: glossary_app,
                });
            continue;
        }

        canonical.insert(key, prepared.units.len());
        let weight = text.chars().count();
        prepared.units.push(WorkUnit {
            id: row.id,
            source: row.source.clone(),
            masked: text,
            mask: masked,
            glossary: glossary_app,
            session_targets,
            session_sources,
            rec: row.rec.clone(),
            edid: row.edid.clone(),
            weight,
            original_index: index,
        });
    }

    tracing::info!(
        units = prepared.units.len(),
        duplicates = prepared.duplicates.values().map(Vec::len).sum::<usize>(),
        tm_hits = prepared.tm_hits,
        skipped = prepared.skipped,
        "items prepared"
    );
    Ok(prepared)
}

/// Two rows are duplicates only when both the prepared text and the
/// enforced glossary replacements match.
pub fn canonical_key(prepared_text: &str, glossary: &GlossaryApplication) -> String {
    let mut lines: Vec<String> = glossary
        .token_to_target
        .iter()
        .map(|(token, target)| format!("{token}={target}"))
        .collect();
    lines.sort();
    let mut key = String::with_capacity(prepared_text.len() + 32);
    key.push_str(prepared_text);
    key.push_str("\n__XT_GLOSSARY__");
    for line in lines {
        key.push('\n');
        key.push_str(&line);
    }
    key
}

const DIALOGUE_PREV_LINES: usize = 2;
const DIALOGUE_NEXT_LINES: usize = 1;
const DIALOGUE_LOOKAROUND: usize = 40;

fn is_dialogue_rec(rec: Option<&str>) -> bool {
    let base = rec
        .map(|r| r.split(':').next().unwrap_or(r).trim().to_uppercase())
        .unwrap_or_default();
    base == "DIAL" || base == "INFO"
}

/// Neighboring dialogue lines, trusted enough to show the model as
/// reference text. Lines with tokens or format specifiers are skipped.
fn sanitize_dialogue_line(source: &str) -> Option<&str> {
    let s = source.trim();
    if s.is_empty() || s.len() > 200 {
        return None;
    }
    if s.contains("__XT_") || s.contains('%') || s.contains('{') || s.contains('}') {
        return None;
    }
    Some(s)
}

/// Builds the per-row context windows: up to 2 preceding and 1 following
/// dialogue line of the same editor-id family (falling back to direct
/// adjacency when rows carry no editor id).
pub fn build_dialogue_windows(rows: &[RowRecord]) -> HashMap<i64, String> {
    use super::queue::normalize_edid_stem;

    let mut windows = HashMap::new();
    for (index, row) in rows.iter().enumerate() {
        if !is_dialogue_rec(row.rec.as_deref()) {
            continue;
        }
        let stem = row
            .edid
            .as_deref()
            .map(normalize_edid_stem)
            .filter(|s| !s.is_empty());

        let mut prev = Vec::new();
        let mut next = Vec::new();
        match &stem {
            Some(stem) => {
                for candidate in rows[..index].iter().rev().take(DIALOGUE_LOOKAROUND) {
                    if prev.len() >= DIALOGUE_PREV_LINES {
                        break;
                    }
                    if !is_dialogue_rec(candidate.rec.as_deref()) {
                        continue;
                    }
                    let candidate_stem =
                        candidate.edid.as_deref().map(normalize_edid_stem).unwrap_or_default();
                    if !candidate_stem.eq_ignore_ascii_case(stem) {
                        continue;
                    }
                    if let Some(line) = sanitize_dialogue_line(&candidate.source) {
                        prev.push(line);
                    }
                }
                prev.reverse();
                for candidate in rows[index + 1..].iter().take(DIALOGUE_LOOKAROUND) {
                    if next.len() >= DIALOGUE_NEXT_LINES {
                        break;
                    }
                    if !is_dialogue_rec(candidate.rec.as_deref()) {
                        continue;
                    }
                    let candidate_stem =
                        candidate.edid.as_deref().map(normalize_edid_stem).unwrap_or_default();
                    if !candidate_stem.eq_ignore_ascii_case(stem) {
                        continue;
                    }
                    if let Some(line) = sanitize_dialogue_line(&candidate.source) {
                        next.push(line);
                    }
                }
            }
            None => {
                for candidate in rows[..index].iter().rev() {
                    if prev.len() >= DIALOGUE_PREV_LINES
                        || !is_dialogue_rec(candidate.rec.as_deref())
                        || candidate.edid.as_deref().map(normalize_edid_stem).is_some_and(|s| !s.is_empty())
                    {
                        break;
                    }
                    if let Some(line) = sanitize_dialogue_line(&candidate.source) {
                        prev.push(line);
                    }
                }
                prev.reverse();
                for candidate in rows[index + 1..].iter() {
                    if next.len() >= DIALOGUE_NEXT_LINES
                        || !is_dialogue_rec(candidate.rec.as_deref())
                        || candidate.edid.as_deref().map(normalize_edid_stem).is_some_and(|s| !s.is_empty())
                    {
                        break;
                    }
                    if let Some(line) = sanitize_dialogue_line(&candidate.source) {
                        next.push(line);
                    }
                }
            }
        }

        if prev.is_empty() && next.is_empty() {
            continue;
        }
        let mut window = String::new();
        if !prev.is_empty() {
            window.push_str("Prev (reference only):\n");
            for line in &prev {
                window.push_str("- ");
                window.push_str(line);
                window.push('\n');
            }
        }
        if !next.is_empty() {
            if !window.is_empty() {
                window.push('\n');
            }
            window.push_str("Next (reference only):\n");
            for line in &next {
                window.push_str("- ");
                window.push_str(line);
                window.push('\n');
            }
        }
        windows.insert(row.id, window.trim().to_string());
    }
    windows
}

/// Attempts to settle a row from translation memory. A hit that fails
/// integrity validation leaves a `tm_fallback` note and sends the row to
/// the model instead.
async fn try_translation_memory(
    store: &dyn ProjectStore,
    session: Option<&SessionTermMemory>,
    options: &RunOptions,
    row: &RowRecord,
    events: &EventSender,
) -> Result<bool> {
    let key = TmKey::new(&options.source_lang, &options.target_lang, &row.source);
    let Some(hit) = store.tm_lookup(&key).await? else {
        return Ok(false);
    };

    let fixed = apply_post_fixers(&row.source, &hit, &options.target_lang);
    let violations = validate_translation(&row.source, &fixed);
    if !violations.is_empty() {
        let detail = violations
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        tracing::debug!(row_id = row.id, %detail, "translation memory hit failed validation");
        store.upsert_note(row.id, NOTE_TM_FALLBACK, &detail).await?;
        return Ok(false);
    }

    store
        .apply_updates(&[RowUpdate::done(row.id, fixed.clone())])
        .await?;
    store.delete_note(row.id, NOTE_TM_FALLBACK).await?;
    store.upsert_note(row.id, NOTE_TM_HIT, "reused").await?;
    if let Some(memory) = session {
        memory.learn(row.rec.as_deref(), &row.source, &fixed).await;
    }
    events.send(RowEvent {
        row_id: row.id,
        status: RowStatus::Done,
        dest: Some(fixed),
        error: None,
    });
    Ok(true)
}

#[cfg(test)]
mod tests {
    use crate::store::{GlossaryEntry, MemoryStore, RowStatus};

    use super::*;

    fn row(id: i64, source: &str) -> RowRecord {
        RowRecord {
            id,
            source: source.to_string(),
            dest: None,
            status: RowStatus::Pending,
            rec: Some("WEAP:FULL".to_string()),
            edid: Some(format!("Item{id:03}")),
            order: id,
            error: None,
        }
    }

    fn options() -> RunOptions {
        RunOptions::default()
    }

    #[tokio::test]
    async fn duplicates_collapse_to_one_unit() {
        let store = MemoryStore::with_rows([
            row(1, "Iron Sword"),
            row(2, "Iron Sword"),
            row(3, "Steel Dagger"),
        ]);
        let prepared = prepare_items(&store, None, &options(), &[1, 2, 3], &EventSender::disabled())
            .await
            .unwrap();
        assert_eq!(prepared.units.len(), 2);
        assert_eq!(prepared.duplicates[&1].len(), 1);
        assert_eq!(prepared.duplicates[&1][0].id, 2);
    }

    #[tokio::test]
    async fn settled_rows_are_skipped() {
        let mut done = row(1, "Iron Sword");
        done.status = RowStatus::Done;
        let mut edited = row(2, "Steel Dagger");
        edited.status = RowStatus::Edited;
        let store = MemoryStore::with_rows([done, edited, row(3, "Glass Bow")]);
        let prepared = prepare_items(&store, None, &options(), &[1, 2, 3], &EventSender::disabled())
            .await
            .unwrap();
        assert_eq!(prepared.units.len(), 1);
        assert_eq!(prepared.units[0].id, 3);
        assert_eq!(prepared.skipped, 2);
    }

    #[tokio::test]
    async fn tm_hit_short_circuits() {
        let store = MemoryStore::with_rows([row(1, "Iron Sword")]);
        let opts = options();
        let key = TmKey::new(&opts.source_lang, &opts.target_lang, "Iron Sword");
        store.seed_tm(&key, "철 검");
        let prepared = prepare_items(&store, None, &opts, &[1], &EventSender::disabled())
            .await
            .unwrap();
        assert!(prepared.units.is_empty());
        assert_eq!(prepared.tm_hits, 1);
        let updated = store.row(1).unwrap();
        assert_eq!(updated.status, RowStatus::Done);
        assert_eq!(updated.dest.as_deref(), Some("철 검"));
        assert_eq!(store.note(1, NOTE_TM_HIT).as_deref(), Some("reused"));
    }

    #[tokio::test]
    async fn invalid_tm_hit_falls_through_with_note() {
        let store = MemoryStore::with_rows([row(1, "Absorb <mag> points of Health.")]);
        let opts = options();
        let key = TmKey::new(
            &opts.source_lang,
            &opts.target_lang,
            "Absorb <mag> points of Health.",
        );
        store.seed_tm(&key, "체력을 흡수합니다."); // lost the <mag> tag
        let prepared = prepare_items(&store, None, &opts, &[1], &EventSender::disabled())
            .await
            .unwrap();
        assert_eq!(prepared.units.len(), 1);
        assert_eq!(prepared.tm_hits, 0);
        assert!(store.note(1, NOTE_TM_FALLBACK).is_some());
        assert_eq!(store.row(1).unwrap().status, RowStatus::Pending);
    }

    #[test]
    fn dialogue_windows_follow_edid_family() {
        let mut a = row(1, "Who goes there?");
        a.rec = Some("INFO:NAM1".to_string());
        a.edid = Some("GuardHello01".to_string());
        let mut b = row(2, "State your business.");
        b.rec = Some("INFO:NAM1".to_string());
        b.edid = Some("GuardHello02".to_string());
        let mut c = row(3, "Move along.");
        c.rec = Some("INFO:NAM1".to_string());
        c.edid = Some("GuardHello03".to_string());
        let mut other = row(4, "Iron Sword");
        other.rec = Some("WEAP:FULL".to_string());

        let windows = build_dialogue_windows(&[a, b, c, other]);
        let window = &windows[&2];
        assert!(window.contains("Prev (reference only):"));
        assert!(window.contains("- Who goes there?"));
        assert!(window.contains("Next (reference only):"));
        assert!(window.contains("- Move along."));
        assert!(!windows.contains_key(&4));
    }

    #[test]
    fn dialogue_lines_with_tokens_are_skipped() {
        let mut a = row(1, "Deal <mag> damage {alias}");
        a.rec = Some("INFO:NAM1".to_string());
        a.edid = Some("Line01".to_string());
        let mut b = row(2, "Fine words.");
        b.rec = Some("INFO:NAM1".to_string());
        b.edid = Some("Line02".to_string());
        let windows = build_dialogue_windows(&[a, b]);
        assert!(!windows.contains_key(&2));
    }

    #[tokio::test]
    async fn glossary_tokens_distinguish_duplicates() {
        let store = MemoryStore::with_rows([row(1, "Whiterun"), row(2, "Whiterun")]);
        store.insert_glossary(GlossaryEntry {
            source: "Whiterun".into(),
            target: "화이트런".into(),
            prompt_only: false,
        });
        let prepared = prepare_items(&store, None, &options(), &[1, 2], &EventSender::disabled())
            .await
            .unwrap();
        // Same glossary application on both rows: still duplicates.
        assert_eq!(prepared.units.len(), 1);
        assert_eq!(prepared.duplicates[&1].len(), 1);
        assert!(prepared.units[0].masked.contains("__XT_TERM_0000__"));
    }
}
