//! Single-row translation: the text path with sentinel, long-text
//! fallback, semantic repair and finalization. Rows land in Done or
//! Error here; only credential failures and cancellation bubble up.

use crate::llm::{format_error, is_credential_error, GenerateRequest};
use crate::scheduler::{Lane, RunState, WorkUnit};
use crate::store::RowUpdate;
use crate::tokens::needs_semantic_repair;
use crate::utils::{Result, TranslateError};

use super::long_text::{translate_long_text, LongTextContext};
use super::{
    duplicate_updates, ensure_tokens, finalize_output, generate_with_retries,
    merged_glossary_pairs, parse, persist_and_notify, prompt, record_done, rerank,
    translate_text_with_sentinel, TextRequest,
};

const REPAIR_TEMPERATURE: f32 = 0.0;
const REPAIR_RETRIES: u32 = 1;

pub async fn translate_single_row(state: &RunState, unit: WorkUnit, lane: Lane) -> Result<()> {
    match translate_single_inner(state, &unit, lane).await {
        Ok(raw) => {
            let final_text = match finalize_output(
                &unit.source,
                &raw,
                &unit.mask.token_to_original,
                &unit.glossary.token_to_target,
                &unit.session_targets,
                &state.options.target_lang,
            ) {
                Ok(text) => text,
                Err(err) => {
                    return persist_failure(state, &unit, &err).await;
                }
            };
            record_done(state, unit.id, unit.rec.as_deref(), &unit.source, &final_text).await?;
            let mut updates = vec![RowUpdate::done(unit.id, final_text)];
            updates.extend(duplicate_updates(state, &unit, &raw));
            persist_and_notify(state, updates).await
        }
        Err(err) if matches!(err, TranslateError::Cancelled) || is_credential_error(&err) => {
            Err(err)
        }
        Err(err) => persist_failure(state, &unit, &err).await,
    }
}

async fn persist_failure(state: &RunState, unit: &WorkUnit, err: &TranslateError) -> Result<()> {
    tracing::warn!(row_id = unit.id, error = %err, "row translation failed");
    let mut updates = vec![RowUpdate::failed(unit.id, format_error(err))];
    for dup in state.duplicates_of(unit.id) {
        updates.push(RowUpdate::failed(dup.id, format_error(err)));
    }
    persist_and_notify(state, updates).await
}

/// Produces the raw masked-space translation for one unit.
async fn translate_single_inner(state: &RunState, unit: &WorkUnit, lane: Lane) -> Result<String> {
    let glossary_pairs = merged_glossary_pairs(state, &[unit]).await;
    let hint = prompt::style_hint(&unit.source, unit.rec.as_deref());
    let hint = prompt::append_dialogue_context(hint, state.dialogue_window_for(unit.id));
    let replacements = unit.term_replacements();
    let ctx = LongTextContext {
        source: &unit.source,
        glossary_pairs: &glossary_pairs,
        style_hint: hint.as_deref(),
        term_replacements: &replacements,
        lane,
    };

    let raw = if unit.masked.chars().count() > state.options.max_chars_per_request {
        translate_long_text(state, &unit.masked, &ctx).await?
    } else {
        let request = TextRequest {
            text: &unit.masked,
            source: &unit.source,
            glossary_pairs: &glossary_pairs,
            style_hint: hint.as_deref(),
            term_replacements: &replacements,
            lane,
            temperature: state.options.temperature,
            candidate_count: rerank::candidate_count_for(
                &state.options.target_lang,
                &unit.source,
                state.options.candidate_count,
            ),
            max_retries: state.options.max_retries,
        };
        match translate_text_with_sentinel(state, &request).await {
            Ok(raw) => raw,
            Err(err)
                if !matches!(err, TranslateError::Cancelled) && !is_credential_error(&err) =>
            {
                tracing::debug!(row_id = unit.id, error = %err, "text path failed, chunking");
                translate_long_text(state, &unit.masked, &ctx).await?
            }
            Err(err) => return Err(err),
        }
    };

    if needs_semantic_repair(&unit.masked, &raw, &state.options.target_lang) {
        if let Some(repaired) =
            repair_text(state, unit, &raw, &glossary_pairs, hint.as_deref(), lane).await?
        {
            return Ok(repaired);
        }
    }
    Ok(raw)
}

/// One low-temperature repair pass over a translation whose numeric
/// token usage looks wrong. Keeps the original when the repair is not
/// strictly better.
pub(crate) async fn repair_text(
    state: &RunState,
    unit: &WorkUnit,
    current: &str,
    glossary_pairs: &[(String, String)],
    style_hint: Option<&str>,
    lane: Lane,
) -> Result<Option<String>> {
    let prompt_text = prompt::repair_text_user_prompt(
        &state.options.source_lang,
        &state.options.target_lang,
        &unit.masked,
        current,
        glossary_pairs,
        style_hint,
    );
    let request = GenerateRequest {
        system_instruction: Some(state.system_instruction.clone()),
        prompt: prompt_text,
        temperature: REPAIR_TEMPERATURE,
        candidate_count: 1,
        ..GenerateRequest::default()
    };
    let response = match generate_with_retries(state, request, lane, None, REPAIR_RETRIES).await {
        Ok(response) => response,
        Err(err) if matches!(err, TranslateError::Cancelled) || is_credential_error(&err) => {
            return Err(err)
        }
        Err(err) => {
            tracing::debug!(row_id = unit.id, error = %err, "semantic repair request failed");
            return Ok(None);
        }
    };
    let Some(raw) = response.primary() else {
        return Ok(None);
    };
    let reply = parse::normalize_text_reply(raw);
    let replacements = unit.term_replacements();
    match ensure_tokens(&unit.masked, &reply, &replacements) {
        Ok(repaired)
            if !needs_semantic_repair(&unit.masked, &repaired, &state.options.target_lang) =>
        {
            Ok(Some(repaired))
        }
        _ => Ok(None),
    }
}
