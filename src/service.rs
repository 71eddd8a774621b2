//! The run-level entry point: prepares items, seeds the session term
//! memory from recurring definition rows, drives the worker pool, and
//! reports the outcome.

use std::collections::HashMap;
use std::sync::Arc;

use crate::llm::{LlmClient, PromptCache};
use crate::pipeline;
use crate::scheduler::{
    build_queues, prepare_items, run_workers, EventSender, Lane, RunControl, RunState,
    RunStateParams, WorkUnit,
};
use crate::scheduler::queue::chunk_by;
use crate::session::{
    is_session_term_rec, normalize_term_key, SessionTermMemory, ENGLISH_PHRASE_RE,
    ENGLISH_TITLE_WORD_RE, MAX_SEED_ROWS,
};
use crate::store::{ProjectStore, RowStatus};
use crate::utils::{AppConfig, Result};

const CACHE_TTL_SECS: u64 = 3600;
/// Seed rows must be cheap; anything masked beyond this stays in the
/// normal queues.
const SEED_MAX_MASKED_CHARS: usize = 6000;
const SEED_MIN_OCCURRENCES: usize = 2;

/// What a finished run did, counted over the requested rows.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub requested: usize,
    pub translated: usize,
    pub failed: usize,
    pub tm_hits: usize,
    pub skipped: usize,
    pub session_terms: usize,
}

pub struct TranslationService {
    store: Arc<dyn ProjectStore>,
    client: Arc<dyn LlmClient>,
    config: AppConfig,
}

impl TranslationService {
    pub fn new(
        store: Arc<dyn ProjectStore>,
        client: Arc<dyn LlmClient>,
        config: AppConfig,
    ) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ProjectStore> {
        &self.store
    }

    /// Prepares a run without starting it; the caller keeps the control
    /// handle for pause and cancel.
    pub async fn begin(&self, ids: &[i64], events: EventSender) -> Result<TranslationRun> {
        let options = self.config.run.clone();
        let session = options
            .session_term_memory
            .then(|| Arc::new(SessionTermMemory::new()));
        let prompt_cache = options
            .prompt_cache
            .then(|| PromptCache::new(true, CACHE_TTL_SECS));

        let prepared = prepare_items(
            self.store.as_ref(),
            session.as_deref(),
            &options,
            ids,
            &events,
        )
        .await?;
        let tm_hits = prepared.tm_hits;
        let skipped = prepared.skipped;

        let mut units = prepared.units;
        let seed_units = if session.is_some() {
            extract_seed_units(&mut units)
        } else {
            Vec::new()
        };
        let queues = build_queues(units, &options);

        let system_instruction =
            pipeline::prompt::system_instruction(&options.source_lang, &options.target_lang);
        let prepared = crate::scheduler::PreparedItems {
            units: Vec::new(),
            duplicates: prepared.duplicates,
            row_ctx: prepared.row_ctx,
            dialogue_ctx: prepared.dialogue_ctx,
            tm_hits,
            skipped,
        };
        let (state, control) = RunState::new(RunStateParams {
            options,
            store: Arc::clone(&self.store),
            client: Arc::clone(&self.client),
            session,
            prompt_cache,
            system_instruction,
            prepared,
            queues,
            events,
        });

        Ok(TranslationRun {
            state,
            control,
            seed_units,
            requested: ids.to_vec(),
            tm_hits,
            skipped,
        })
    }

    pub async fn translate_ids(&self, ids: &[i64], events: EventSender) -> Result<RunReport> {
        self.begin(ids, events).await?.run().await
    }
}

pub struct TranslationRun {
    state: Arc<RunState>,
    control: RunControl,
    seed_units: Vec<WorkUnit>,
    requested: Vec<i64>,
    tm_hits: usize,
    skipped: usize,
}

impl TranslationRun {
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub async fn run(self) -> Result<RunReport> {
        let state = self.state;

        let mut outcome = match seed_session_terms(&state, self.seed_units).await {
            Ok(()) => run_workers(Arc::clone(&state)).await,
            Err(err) => Err(err),
        };

        // Cleanup runs on every exit path; an aborted run must not leak
        // the remote cached prompt.
        if let Some(session) = &state.session {
            let flushed = session.flush_to_glossary(state.store.as_ref()).await;
            if outcome.is_ok() {
                outcome = flushed.map(|_| ());
            }
        }
        if let Some(cache) = &state.prompt_cache {
            cache.teardown(state.client.as_ref()).await;
        }
        outcome?;

        let mut report = RunReport {
            requested: self.requested.len(),
            tm_hits: self.tm_hits,
            skipped: self.skipped,
            ..RunReport::default()
        };
        for row in state.store.rows_by_ids(&self.requested).await? {
            match row.status {
                RowStatus::Done => report.translated += 1,
                RowStatus::Error => report.failed += 1,
                _ => {}
            }
        }
        if let Some(session) = &state.session {
            report.session_terms = session.len().await;
        }
        tracing::info!(
            translated = report.translated,
            failed = report.failed,
            tm_hits = report.tm_hits,
            skipped = report.skipped,
            session_terms = report.session_terms,
            "run finished"
        );
        Ok(report)
    }
}

/// Translates the seed rows ahead of the worker pool. Definition rows
/// whose names recur later go first so the terms they establish are
/// reused by every later batch.
async fn seed_session_terms(state: &Arc<RunState>, seed_units: Vec<WorkUnit>) -> Result<()> {
    if seed_units.is_empty() {
        return Ok(());
    }
    tracing::info!(rows = seed_units.len(), "seeding session terms");
    let batch_size = state.options.batch_size.max(1);
    let max_chars = state.options.max_chars_per_request.max(1);
    for seed_batch in chunk_by(seed_units, batch_size, max_chars) {
        pipeline::batch::translate_batch_with_split(state, seed_batch, Lane::Short).await?;
    }
    if let Some(session) = &state.session {
        session.flush_to_glossary(state.store.as_ref()).await?;
    }
    Ok(())
}

/// Pulls the definition rows worth seeding out of the unit list: short
/// name rows whose term shows up at least twice across the run, most
/// frequent and longest first.
fn extract_seed_units(units: &mut Vec<WorkUnit>) -> Vec<WorkUnit> {
    let mut term_counts: HashMap<String, usize> = HashMap::new();
    for unit in units.iter() {
        for m in ENGLISH_PHRASE_RE.find_iter(&unit.source) {
            *term_counts
                .entry(normalize_term_key(m.as_str()))
                .or_default() += 1;
        }
        for m in ENGLISH_TITLE_WORD_RE.find_iter(&unit.source) {
            *term_counts
                .entry(normalize_term_key(m.as_str()))
                .or_default() += 1;
        }
    }

    let mut scored: Vec<(usize, usize, usize)> = Vec::new(); // (count, key_len, index)
    for (index, unit) in units.iter().enumerate() {
        if !is_session_term_rec(unit.rec.as_deref()) {
            continue;
        }
        // INFO subrecords match the NAM pattern; dialogue never seeds.
        let base = crate::scheduler::queue::rec_base(unit.rec.as_deref());
        if base == "DIAL" || base == "INFO" {
            continue;
        }
        if unit.masked.chars().count() > SEED_MAX_MASKED_CHARS {
            continue;
        }
        if !crate::session::is_definition_text(&unit.source) {
            continue;
        }
        let key = normalize_term_key(&unit.source);
        let count = term_counts.get(&key).copied().unwrap_or(0);
        if count < SEED_MIN_OCCURRENCES {
            continue;
        }
        scored.push((count, key.len(), index));
    }
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    scored.truncate(MAX_SEED_ROWS);

    let mut picked: Vec<usize> = scored.into_iter().map(|(_, _, index)| index).collect();
    picked.sort_unstable();
    let mut seeds = Vec::with_capacity(picked.len());
    for index in picked.into_iter().rev() {
        seeds.push(units.swap_remove(index));
    }
    seeds.reverse();
    seeds
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::text::glossary::GlossaryApplication;
    use crate::text::mask::MaskedText;

    use super::*;

    fn unit(id: i64, source: &str, rec: &str) -> WorkUnit {
        WorkUnit {
            id,
            source: source.to_string(),
            masked: source.to_string(),
            mask: MaskedText::default(),
            glossary: GlossaryApplication::default(),
            session_targets: HashMap::new(),
            session_sources: HashMap::new(),
            rec: Some(rec.to_string()),
            edid: None,
            weight: source.len(),
            original_index: id as usize,
        }
    }

    #[test]
    fn recurring_definition_rows_are_seeded() {
        let mut units = vec![
            unit(1, "Whiterun Guard", "NPC_:FULL"),
            unit(2, "Talk to the Whiterun Guard at the gate.", "QUST:CNAM"),
            unit(3, "The Whiterun Guard will not let you pass.", "INFO:NAM1"),
            unit(4, "Solitude", "CELL:FULL"), // mentioned nowhere else
        ];
        let seeds = extract_seed_units(&mut units);
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].id, 1);
        assert_eq!(units.len(), 3);
        assert!(units.iter().all(|u| u.id != 1));
    }

    #[test]
    fn dialogue_rows_never_seed() {
        let mut units = vec![
            unit(1, "Fine Words", "INFO:NAM1"),
            unit(2, "Fine Words again and again", "BOOK:DESC"),
        ];
        assert!(extract_seed_units(&mut units).is_empty());
        assert_eq!(units.len(), 2);
    }
}
