//! The translation pipeline: batch requests with split fallback, single
//! row and long-text paths, prompt construction, reply parsing and
//! candidate reranking. Everything here works in masked space; tokens
//! are substituted and unmasked only at finalization.

pub mod batch;
pub mod long_text;
pub mod parse;
pub mod prompt;
pub mod rerank;
pub mod single;

use std::collections::HashMap;
use std::time::Duration;

use crate::llm::{
    classify_cache_error, is_credential_error, is_rate_limit, retry_delay, should_retry,
    CacheFailure, GenerateRequest, GenerateResponse,
};
use crate::scheduler::{Lane, RowEvent, RunState, WorkUnit};
use crate::store::{RowUpdate, TmKey};
use crate::text::mask::unmask;
use crate::text::postfix::apply_post_fixers;
use crate::tokens::{
    repair_token_alignment, sanitize_model_text, validate_translation, violations_to_error,
    SENTINEL_TOKEN,
};
use crate::utils::{Result, TranslateError};

/// Forces token integrity on raw model output: sanitize, validate, and
/// if broken attempt deterministic repair before giving up.
pub(crate) fn ensure_tokens(
    input_masked: &str,
    raw_output: &str,
    term_replacements: &HashMap<String, String>,
) -> Result<String> {
    let cleaned = sanitize_model_text(input_masked, raw_output);
    let violations = validate_translation(input_masked, &cleaned);
    if violations.is_empty() {
        return Ok(cleaned);
    }
    if let Some(repaired) = repair_token_alignment(input_masked, &cleaned, term_replacements) {
        if validate_translation(input_masked, &repaired).is_empty() {
            return Ok(repaired);
        }
    }
    Err(violations_to_error(&violations))
}

/// One model call with the full governor stack: prompt cache, gates,
/// retry schedule, rate-limit reaction. A timeout is returned as-is so
/// the caller can split or re-chunk instead of retrying the same shape.
pub(crate) async fn generate_with_retries(
    state: &RunState,
    base: GenerateRequest,
    lane: Lane,
    timeout: Option<Duration>,
    max_retries: u32,
) -> Result<GenerateResponse> {
    let mut use_cache = state.prompt_cache.is_some();
    let mut cache_retry_done = false;
    let mut attempt = 0u32;

    loop {
        let mut request = base.clone();
        if use_cache {
            if let Some(cache) = &state.prompt_cache {
                match cache
                    .get_or_create(state.client.as_ref(), &state.system_instruction)
                    .await
                {
                    Some(name) => {
                        request.cached_content = Some(name);
                        request.system_instruction = None;
                    }
                    None => use_cache = false,
                }
            }
        }

        let call = state.generate_with_gate(&request, lane);
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(TranslateError::Timeout),
            },
            None => call.await,
        };
        let err = match result {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };
        if matches!(err, TranslateError::Cancelled) {
            return Err(err);
        }

        if request.cached_content.is_some() {
            if let Some(failure) = classify_cache_error(&err) {
                if let Some(cache) = &state.prompt_cache {
                    match failure {
                        CacheFailure::Invalid => cache.invalidate().await,
                        CacheFailure::Forbidden => cache.disable().await,
                    }
                }
                use_cache = false;
                if !cache_retry_done {
                    // One immediate retry without the stale cache entry.
                    cache_retry_done = true;
                    continue;
                }
            }
        }

        if matches!(err, TranslateError::Timeout) {
            return Err(err);
        }
        if is_credential_error(&err) || !should_retry(&err) || attempt >= max_retries {
            return Err(err);
        }

        let delay = retry_delay(&err, attempt);
        if is_rate_limit(&err) {
            state.adaptive.on_rate_limit();
            state.throttle.extend(delay);
        }
        tracing::debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "request failed, retrying"
        );
        tokio::select! {
            _ = state.cancel.cancelled() => return Err(TranslateError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Turns a raw masked-space translation into the final stored text:
/// glossary and session tokens substituted, placeholders unmasked,
/// post-fixers applied, and a last integrity check against the source.
pub(crate) fn finalize_output(
    source: &str,
    raw: &str,
    token_to_original: &HashMap<String, String>,
    glossary_targets: &HashMap<String, String>,
    session_targets: &HashMap<String, String>,
    target_lang: &str,
) -> Result<String> {
    let mut working = raw.to_string();
    for (token, target) in glossary_targets {
        working = working.replace(token, target);
    }
    for (token, target) in session_targets {
        working = working.replace(token, target);
    }
    let unmasked = unmask(&working, token_to_original)?;
    let fixed = apply_post_fixers(source, &unmasked, target_lang);
    let violations = validate_translation(source, &fixed);
    if !violations.is_empty() {
        return Err(violations_to_error(&violations));
    }
    Ok(fixed)
}

/// Prompt glossary pairs for a set of units: per-unit prompt-only pairs
/// deduplicated, then session terms that occur in the texts merged in.
pub(crate) async fn merged_glossary_pairs(
    state: &RunState,
    units: &[&WorkUnit],
) -> Vec<(String, String)> {
    let mut base: Vec<(String, String)> = Vec::new();
    for unit in units {
        for (source, target) in &unit.glossary.prompt_pairs {
            if !base.iter().any(|(s, _)| s.eq_ignore_ascii_case(source)) {
                base.push((source.clone(), target.clone()));
            }
        }
    }
    match &state.session {
        Some(session) => {
            let texts: Vec<&str> = units.iter().map(|u| u.masked.as_str()).collect();
            session.merge_prompt_pairs(&texts, &base).await
        }
        None => base,
    }
}

/// Applies updates and mirrors them onto the event channel.
pub(crate) async fn persist_and_notify(state: &RunState, updates: Vec<RowUpdate>) -> Result<()> {
    if updates.is_empty() {
        return Ok(());
    }
    state.store.apply_updates(&updates).await?;
    for update in updates {
        state.events.send(RowEvent {
            row_id: update.id,
            status: update.status,
            dest: update.dest,
            error: update.error,
        });
    }
    Ok(())
}

/// Bookkeeping for a finished row: translation memory, stale fallback
/// notes, session term learning.
pub(crate) async fn record_done(
    state: &RunState,
    id: i64,
    rec: Option<&str>,
    source: &str,
    final_text: &str,
) -> Result<()> {
    if state.options.translation_memory {
        let key = TmKey::new(&state.options.source_lang, &state.options.target_lang, source);
        state.store.tm_store(&key, final_text).await?;
    }
    state
        .store
        .delete_note(id, crate::scheduler::NOTE_TM_FALLBACK)
        .await?;
    if let Some(session) = &state.session {
        session.learn(rec, source, final_text).await;
    }
    Ok(())
}

/// Replays the canonical unit's raw translation through each duplicate
/// row's own mask and glossary. A duplicate that fails finalization gets
/// an Error row without touching its siblings.
pub(crate) fn duplicate_updates(state: &RunState, unit: &WorkUnit, raw: &str) -> Vec<RowUpdate> {
    let mut updates = Vec::new();
    for dup in state.duplicates_of(unit.id) {
        let source = state
            .row_ctx
            .get(&dup.id)
            .map(|ctx| ctx.source.as_str())
            .unwrap_or(unit.source.as_str());
        match finalize_output(
            source,
            raw,
            &dup.mask.token_to_original,
            &dup.glossary.token_to_target,
            &unit.session_targets,
            &state.options.target_lang,
        ) {
            Ok(final_text) => updates.push(RowUpdate::done(dup.id, final_text)),
            Err(err) => {
                tracing::debug!(row_id = dup.id, error = %err, "duplicate finalization failed");
                updates.push(RowUpdate::failed(dup.id, crate::llm::format_error(&err)));
            }
        }
    }
    updates
}

/// Inputs for one plain-text model request.
pub(crate) struct TextRequest<'a> {
    /// Masked text to translate, without the sentinel.
    pub text: &'a str,
    /// Source text used only for candidate scoring.
    pub source: &'a str,
    pub glossary_pairs: &'a [(String, String)],
    pub style_hint: Option<&'a str>,
    pub term_replacements: &'a HashMap<String, String>,
    pub lane: Lane,
    pub temperature: f32,
    pub candidate_count: u32,
    pub max_retries: u32,
}

/// Text-mode translation with a trailing sentinel token that makes
/// truncated output detectable. Returns the raw masked-space
/// translation, sentinel stripped and token integrity enforced.
pub(crate) async fn translate_text_with_sentinel(
    state: &RunState,
    req: &TextRequest<'_>,
) -> Result<String> {
    let sentinel_input = format!("{} {}", req.text, SENTINEL_TOKEN);
    let prompt = prompt::text_user_prompt(
        &state.options.source_lang,
        &state.options.target_lang,
        &sentinel_input,
        req.glossary_pairs,
        req.style_hint,
    );
    let request = GenerateRequest {
        system_instruction: Some(state.system_instruction.clone()),
        prompt,
        temperature: req.temperature,
        candidate_count: req.candidate_count,
        ..GenerateRequest::default()
    };

    let response = generate_with_retries(state, request, req.lane, None, req.max_retries).await?;
    let raw = pick_text_candidate(state, req, &sentinel_input, &response)?;
    let reply = parse::normalize_text_reply(&raw);
    let cleaned = sanitize_model_text(&sentinel_input, &reply);

    if !cleaned.contains(SENTINEL_TOKEN) {
        // Some models drop the trailing sentinel but translate everything;
        // accept that only when the output is clean against the real input.
        if validate_translation(req.text, &cleaned).is_empty() {
            return Ok(cleaned.trim().to_string());
        }
        return Err(TranslateError::OutputValidation(
            "translation ended early: sentinel token missing".to_string(),
        ));
    }

    let ensured = ensure_tokens(&sentinel_input, &cleaned, req.term_replacements)?;
    let stripped = ensured
        .replace(&format!(" {SENTINEL_TOKEN}"), "")
        .replace(SENTINEL_TOKEN, "");
    Ok(stripped.trim().to_string())
}

fn pick_text_candidate(
    state: &RunState,
    req: &TextRequest<'_>,
    sentinel_input: &str,
    response: &GenerateResponse,
) -> Result<String> {
    if response.candidates.len() <= 1 {
        return response
            .primary()
            .map(str::to_string)
            .ok_or_else(|| TranslateError::OutputValidation("empty model response".to_string()));
    }
    let best = response
        .candidates
        .iter()
        .max_by_key(|candidate| {
            rerank::score_item_candidate(
                sentinel_input,
                req.source,
                &parse::normalize_text_reply(candidate),
                &state.options.target_lang,
                req.term_replacements,
            )
        })
        .cloned();
    best.ok_or_else(|| TranslateError::OutputValidation("empty model response".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::mask::mask;

    #[test]
    fn ensure_tokens_repairs_leaked_targets() {
        let input = "Visit __XT_TERM_0000__ today";
        let mut replacements = HashMap::new();
        replacements.insert("__XT_TERM_0000__".to_string(), "Whiterun".to_string());
        // Model echoed the term as text instead of the token.
        let ensured = ensure_tokens(input, "오늘 Whiterun 방문", &replacements).unwrap();
        assert!(ensured.contains("__XT_TERM_0000__"));
    }

    #[test]
    fn ensure_tokens_rejects_unrepairable_output() {
        let input = "Deal __XT_PH_MAG_0000__ damage";
        assert!(ensure_tokens(input, "피해를 준다", &HashMap::new()).is_err());
    }

    #[test]
    fn finalize_substitutes_and_unmasks() {
        let masked = mask("Visit <city> now.\nBye.").unwrap();
        // Glossary token on top of the placeholder-masked text.
        let mut glossary_targets = HashMap::new();
        glossary_targets.insert("__XT_TERM_0000__".to_string(), "화이트런".to_string());
        let raw = masked
            .text
            .replace("Visit", "__XT_TERM_0000__")
            .replace("now.", "방문.")
            .replace("Bye.", "끝.");
        let final_text = finalize_output(
            "Visit <city> now.\nBye.",
            &raw,
            &masked.token_to_original,
            &glossary_targets,
            &HashMap::new(),
            "korean",
        )
        .unwrap();
        assert!(final_text.contains("화이트런"));
        assert!(final_text.contains("<city>"));
        assert!(final_text.contains('\n'));
    }

    #[test]
    fn finalize_rejects_missing_placeholder() {
        let masked = mask("Deal <mag> damage.").unwrap();
        let raw = "피해를 준다.".to_string(); // dropped the token
        assert!(finalize_output(
            "Deal <mag> damage.",
            &raw,
            &masked.token_to_original,
            &HashMap::new(),
            &HashMap::new(),
            "korean",
        )
        .is_err());
    }
}
