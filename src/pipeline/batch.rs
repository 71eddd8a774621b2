//! Batch translation: one JSON request for many units, token repair
//! sub-batches for the items the model mangled, per-item text fallback,
//! and a weight-midpoint split when the whole batch fails.

use std::collections::HashMap;
use std::time::Duration;

use crate::llm::{format_error, is_credential_error, GenerateRequest};
use crate::scheduler::queue::{chunk_by, HasWeight};
use crate::scheduler::{Lane, RunState, WorkUnit};
use crate::store::RowUpdate;
use crate::tokens::needs_semantic_repair;
use crate::utils::{Result, TranslateError};

use super::{
    duplicate_updates, ensure_tokens, finalize_output, generate_with_retries,
    merged_glossary_pairs, parse, persist_and_notify, prompt, record_done, rerank, single,
    translate_text_with_sentinel, TextRequest,
};

const REPAIR_MAX_ITEMS: usize = 8;
const REPAIR_MAX_WEIGHT: usize = 12000;
const REPAIR_TEMPERATURE: f32 = 0.0;
const REPAIR_RETRIES: u32 = 1;
const FALLBACK_TEMPERATURE: f32 = 0.0;
const FALLBACK_RETRIES: u32 = 1;

/// Translates a batch, recursively splitting it in half by weight when
/// the request as a whole fails. Single units go through the text path.
pub async fn translate_batch_with_split(
    state: &RunState,
    mut units: Vec<WorkUnit>,
    lane: Lane,
) -> Result<()> {
    if units.is_empty() {
        return Ok(());
    }
    if units.len() == 1 {
        if let Some(unit) = units.pop() {
            return single::translate_single_row(state, unit, lane).await;
        }
        return Ok(());
    }

    let err = match translate_batch_and_persist(state, &units, lane).await {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };
    if matches!(err, TranslateError::Cancelled) || is_credential_error(&err) {
        return Err(err);
    }

    let at = split_point(&units);
    tracing::debug!(
        size = units.len(),
        at,
        error = %err,
        "batch failed, splitting"
    );
    let right = units.split_off(at);
    Box::pin(translate_batch_with_split(state, units, lane)).await?;
    Box::pin(translate_batch_with_split(state, right, lane)).await
}

/// Index that divides the batch into two halves of similar weight.
fn split_point(units: &[WorkUnit]) -> usize {
    let total: usize = units.iter().map(|u| u.weight).sum();
    let mut running = 0usize;
    for (index, unit) in units.iter().enumerate() {
        running += unit.weight;
        if running * 2 >= total {
            return (index + 1).clamp(1, units.len() - 1);
        }
    }
    units.len() / 2
}

struct RepairCandidate {
    index: usize,
    current: String,
    /// Item was token-clean but used numeric tokens wrongly.
    semantic_only: bool,
    weight: usize,
}

impl HasWeight for RepairCandidate {
    fn weight(&self) -> usize {
        self.weight
    }
}

async fn translate_batch_and_persist(
    state: &RunState,
    units: &[WorkUnit],
    lane: Lane,
) -> Result<()> {
    let refs: Vec<&WorkUnit> = units.iter().collect();
    let glossary_pairs = merged_glossary_pairs(state, &refs).await;
    let items: Vec<prompt::PromptItem> = units
        .iter()
        .map(|unit| prompt::PromptItem {
            id: unit.id,
            text: unit.masked.clone(),
            rec: unit.rec.clone(),
            ctx: state.dialogue_window_for(unit.id).map(str::to_string),
        })
        .collect();
    let candidate_count = units
        .iter()
        .map(|unit| {
            rerank::candidate_count_for(
                &state.options.target_lang,
                &unit.source,
                state.options.candidate_count,
            )
        })
        .max()
        .unwrap_or(1);

    let request = GenerateRequest {
        system_instruction: Some(state.system_instruction.clone()),
        prompt: prompt::batch_user_prompt(
            &state.options.source_lang,
            &state.options.target_lang,
            &items,
            &glossary_pairs,
        ),
        temperature: state.options.temperature,
        candidate_count,
        response_schema: Some(state.response_schema.clone()),
        ..GenerateRequest::default()
    };
    let timeout = Duration::from_secs(state.options.batch_timeout_secs.max(1));
    let response = generate_with_retries(
        state,
        request,
        lane,
        Some(timeout),
        state.options.max_retries,
    )
    .await?;

    let primary = response
        .primary()
        .ok_or_else(|| TranslateError::OutputValidation("empty model response".to_string()))?;
    let mut by_id = parse::parse_translations(primary)?;
    if by_id.len() != units.len() {
        return Err(TranslateError::BatchSizeMismatch {
            expected: units.len(),
            got: by_id.len(),
        });
    }
    if response.candidates.len() > 1 {
        by_id = rerank_candidates(state, units, &response.candidates, by_id);
    }

    // First pass: enforce tokens, queue repairs.
    let mut results: HashMap<usize, String> = HashMap::new();
    let mut repairs: Vec<RepairCandidate> = Vec::new();
    for (index, unit) in units.iter().enumerate() {
        let Some(raw) = by_id.get(&unit.id) else {
            continue;
        };
        match ensure_tokens(&unit.masked, raw, &unit.term_replacements()) {
            Ok(clean) => {
                let semantic =
                    needs_semantic_repair(&unit.masked, &clean, &state.options.target_lang);
                if semantic {
                    repairs.push(RepairCandidate {
                        index,
                        weight: unit.masked.len() + clean.len(),
                        current: clean.clone(),
                        semantic_only: true,
                    });
                }
                results.insert(index, clean);
            }
            Err(err) => {
                tracing::debug!(row_id = unit.id, error = %err, "item failed token check");
                let current = crate::tokens::sanitize_model_text(&unit.masked, raw);
                repairs.push(RepairCandidate {
                    index,
                    weight: unit.masked.len() + current.len(),
                    current,
                    semantic_only: false,
                });
            }
        }
    }

    if !repairs.is_empty() {
        run_repair_batches(state, units, lane, &glossary_pairs, repairs, &mut results).await?;
    }

    // Any unit still without a usable result gets one individual try.
    let mut failures: HashMap<usize, String> = HashMap::new();
    for (index, unit) in units.iter().enumerate() {
        if results.contains_key(&index) {
            continue;
        }
        match fallback_single_item(state, unit, lane, &glossary_pairs).await {
            Ok(raw) => {
                results.insert(index, raw);
            }
            Err(err)
                if matches!(err, TranslateError::Cancelled) || is_credential_error(&err) =>
            {
                return Err(err)
            }
            Err(err) => {
                failures.insert(index, format_error(&err));
            }
        }
    }

    let mut updates: Vec<RowUpdate> = Vec::new();
    for (index, unit) in units.iter().enumerate() {
        if let Some(raw) = results.get(&index) {
            match finalize_output(
                &unit.source,
                raw,
                &unit.mask.token_to_original,
                &unit.glossary.token_to_target,
                &unit.session_targets,
                &state.options.target_lang,
            ) {
                Ok(mut final_text) => {
                    if state.options.refine_pass
                        && rerank::is_likely_untranslated(&unit.source, &final_text)
                    {
                        if let Some(better) =
                            refine_untranslated(state, unit, raw, lane, &glossary_pairs).await?
                        {
                            final_text = better;
                        }
                    }
                    record_done(state, unit.id, unit.rec.as_deref(), &unit.source, &final_text)
                        .await?;
                    updates.push(RowUpdate::done(unit.id, final_text));
                    updates.extend(duplicate_updates(state, unit, raw));
                }
                Err(err) => push_failure(state, unit, &format_error(&err), &mut updates),
            }
        } else {
            let message = failures
                .remove(&index)
                .unwrap_or_else(|| "no translation returned for item".to_string());
            push_failure(state, unit, &message, &mut updates);
        }
    }
    persist_and_notify(state, updates).await
}

fn push_failure(state: &RunState, unit: &WorkUnit, message: &str, updates: &mut Vec<RowUpdate>) {
    tracing::warn!(row_id = unit.id, error = %message, "batch item failed");
    updates.push(RowUpdate::failed(unit.id, message.to_string()));
    for dup in state.duplicates_of(unit.id) {
        updates.push(RowUpdate::failed(dup.id, message.to_string()));
    }
}

/// Per-item best-of selection across response candidates.
fn rerank_candidates(
    state: &RunState,
    units: &[WorkUnit],
    candidates: &[String],
    primary: HashMap<i64, String>,
) -> HashMap<i64, String> {
    let parsed: Vec<HashMap<i64, String>> = candidates
        .iter()
        .filter_map(|candidate| parse::parse_translations(candidate).ok())
        .collect();
    if parsed.len() <= 1 {
        return primary;
    }

    let mut best = primary;
    for unit in units {
        let replacements = unit.term_replacements();
        let mut top_score = best.get(&unit.id).map(|raw| {
            rerank::score_item_candidate(
                &unit.masked,
                &unit.source,
                raw,
                &state.options.target_lang,
                &replacements,
            )
        });
        for candidate in &parsed {
            let Some(raw) = candidate.get(&unit.id) else {
                continue;
            };
            let score = rerank::score_item_candidate(
                &unit.masked,
                &unit.source,
                raw,
                &state.options.target_lang,
                &replacements,
            );
            if top_score.map_or(true, |current| score > current) {
                top_score = Some(score);
                best.insert(unit.id, raw.clone());
            }
        }
    }
    best
}

/// Sends broken and semantically wrong items back in repair sub-batches.
/// Repairs are accepted only when strictly better; rejected items stay
/// queued for the per-item fallback (or keep their first-pass result).
async fn run_repair_batches(
    state: &RunState,
    units: &[WorkUnit],
    lane: Lane,
    glossary_pairs: &[(String, String)],
    repairs: Vec<RepairCandidate>,
    results: &mut HashMap<usize, String>,
) -> Result<()> {
    for chunk in chunk_by(repairs, REPAIR_MAX_ITEMS, REPAIR_MAX_WEIGHT) {
        let items: Vec<prompt::RepairItem> = chunk
            .iter()
            .map(|candidate| {
                let unit = &units[candidate.index];
                prompt::RepairItem {
                    id: unit.id,
                    source: unit.masked.clone(),
                    current: candidate.current.clone(),
                    rec: unit.rec.clone(),
                }
            })
            .collect();
        let request = GenerateRequest {
            system_instruction: Some(state.system_instruction.clone()),
            prompt: prompt::repair_batch_user_prompt(
                &state.options.source_lang,
                &state.options.target_lang,
                &items,
                glossary_pairs,
            ),
            temperature: REPAIR_TEMPERATURE,
            candidate_count: 1,
            response_schema: Some(state.response_schema.clone()),
            ..GenerateRequest::default()
        };

        let response =
            match generate_with_retries(state, request, lane, None, REPAIR_RETRIES).await {
                Ok(response) => response,
                Err(err)
                    if matches!(err, TranslateError::Cancelled) || is_credential_error(&err) =>
                {
                    return Err(err)
                }
                Err(err) => {
                    tracing::debug!(error = %err, "repair batch request failed");
                    continue;
                }
            };
        let Some(raw) = response.primary() else {
            continue;
        };
        let Ok(repaired_by_id) = parse::parse_translations(raw) else {
            continue;
        };

        for candidate in chunk {
            let unit = &units[candidate.index];
            let Some(repaired_raw) = repaired_by_id.get(&unit.id) else {
                continue;
            };
            let Ok(repaired) =
                ensure_tokens(&unit.masked, repaired_raw, &unit.term_replacements())
            else {
                continue;
            };
            if candidate.semantic_only
                && needs_semantic_repair(&unit.masked, &repaired, &state.options.target_lang)
            {
                continue;
            }
            results.insert(candidate.index, repaired);
        }
    }
    Ok(())
}

/// Last resort for one item of a batch: a plain text request at zero
/// temperature.
async fn fallback_single_item(
    state: &RunState,
    unit: &WorkUnit,
    lane: Lane,
    glossary_pairs: &[(String, String)],
) -> Result<String> {
    let hint = prompt::style_hint(&unit.source, unit.rec.as_deref());
    let hint = prompt::append_dialogue_context(hint, state.dialogue_window_for(unit.id));
    let replacements = unit.term_replacements();
    let request = TextRequest {
        text: &unit.masked,
        source: &unit.source,
        glossary_pairs,
        style_hint: hint.as_deref(),
        term_replacements: &replacements,
        lane,
        temperature: FALLBACK_TEMPERATURE,
        candidate_count: 1,
        max_retries: FALLBACK_RETRIES,
    };
    translate_text_with_sentinel(state, &request).await
}

/// Refine pass: a finished item that still reads as source language gets
/// one repair attempt; the repair wins only if it actually translates.
async fn refine_untranslated(
    state: &RunState,
    unit: &WorkUnit,
    raw: &str,
    lane: Lane,
    glossary_pairs: &[(String, String)],
) -> Result<Option<String>> {
    let Some(repaired_raw) =
        single::repair_text(state, unit, raw, glossary_pairs, None, lane).await?
    else {
        return Ok(None);
    };
    let Ok(final_text) = finalize_output(
        &unit.source,
        &repaired_raw,
        &unit.mask.token_to_original,
        &unit.glossary.token_to_target,
        &unit.session_targets,
        &state.options.target_lang,
    ) else {
        return Ok(None);
    };
    if rerank::is_likely_untranslated(&unit.source, &final_text) {
        return Ok(None);
    }
    Ok(Some(final_text))
}
