//! Long-text translation: masked text over the request limit is split
//! at sentence boundaries into chunks, each chunk translated with the
//! sentinel text path, and the results concatenated. A failing chunk is
//! re-split at half the size until the floor is reached.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use crate::llm::is_credential_error;
use crate::scheduler::{Lane, RunState};
use crate::text::split::split_long_text;
use crate::tokens::{extract_tokens, is_korean_language};
use crate::utils::{Result, TranslateError};

use super::{translate_text_with_sentinel, TextRequest};

pub const MIN_CHUNK_CHARS: usize = 256;
const DEFAULT_CHUNK_CHARS: usize = 6000;
const CJK_CHUNK_CHARS: usize = 4500;
const DENSE_TOKEN_COUNT: usize = 80;
const DENSE_CHUNK_CHARS: usize = 3000;
const BUSY_TOKEN_COUNT: usize = 40;
const BUSY_CHUNK_CHARS: usize = 4500;
/// Chunks run two at a time once the run has workers to spare.
const PARALLEL_MIN_CONCURRENCY: usize = 5;
const CHUNK_TEMPERATURE_CAP: f32 = 0.05;

/// CJK targets expand token-wise; their chunks start smaller.
pub fn is_cjk_language(lang: &str) -> bool {
    if is_korean_language(lang) {
        return true;
    }
    let lower = lang.trim().to_lowercase();
    ["japanese", "chinese", "日本語", "中文", "繁體", "简体"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Starting chunk size for a masked text: the request limit, tightened
/// for CJK targets and placeholder-dense content.
pub fn initial_chunk_size(masked: &str, max_chars: usize, target_lang: &str) -> usize {
    let mut chunk = max_chars.min(DEFAULT_CHUNK_CHARS);
    if is_cjk_language(target_lang) {
        chunk = chunk.min(CJK_CHUNK_CHARS);
    }
    let token_count = extract_tokens(masked).len();
    if token_count >= DENSE_TOKEN_COUNT {
        chunk = chunk.min(DENSE_CHUNK_CHARS);
    } else if token_count >= BUSY_TOKEN_COUNT {
        chunk = chunk.min(BUSY_CHUNK_CHARS);
    }
    chunk.max(MIN_CHUNK_CHARS)
}

/// Shared inputs for every chunk request of one long text.
pub(crate) struct LongTextContext<'a> {
    pub source: &'a str,
    pub glossary_pairs: &'a [(String, String)],
    pub style_hint: Option<&'a str>,
    pub term_replacements: &'a HashMap<String, String>,
    pub lane: Lane,
}

/// Translates masked text of any length, returning the raw masked-space
/// translation.
pub(crate) async fn translate_long_text(
    state: &RunState,
    masked: &str,
    ctx: &LongTextContext<'_>,
) -> Result<String> {
    let chunk_size = initial_chunk_size(
        masked,
        state.options.max_chars_per_request.max(1),
        &state.options.target_lang,
    );
    tracing::debug!(
        chars = masked.chars().count(),
        chunk_size,
        "long text translation started"
    );
    translate_segments(state, masked, chunk_size, ctx).await
}

fn translate_segments<'a>(
    state: &'a RunState,
    text: &'a str,
    chunk_size: usize,
    ctx: &'a LongTextContext<'a>,
) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
    Box::pin(async move {
        if text.chars().count() <= chunk_size {
            return translate_chunk(state, text, ctx).await;
        }
        let parts = split_long_text(text, chunk_size);
        if parts.len() <= 1 {
            return Err(TranslateError::Translation(
                "long text could not be split into smaller chunks".to_string(),
            ));
        }

        let mut results: Vec<String> = Vec::with_capacity(parts.len());
        if state.options.max_concurrency >= PARALLEL_MIN_CONCURRENCY {
            for pair in parts.chunks(2) {
                match pair {
                    [one] => results.push(translate_part(state, one, chunk_size, ctx).await?),
                    [left, right] => {
                        let (a, b) = tokio::join!(
                            translate_part(state, left, chunk_size, ctx),
                            translate_part(state, right, chunk_size, ctx)
                        );
                        results.push(a?);
                        results.push(b?);
                    }
                    _ => {}
                }
            }
        } else {
            for part in &parts {
                results.push(translate_part(state, part, chunk_size, ctx).await?);
            }
        }
        Ok(results.concat())
    })
}

/// One chunk, with halving re-split on failure. Credential errors and
/// cancellation propagate untouched.
async fn translate_part(
    state: &RunState,
    part: &str,
    chunk_size: usize,
    ctx: &LongTextContext<'_>,
) -> Result<String> {
    let err = match translate_chunk(state, part, ctx).await {
        Ok(translated) => return Ok(translated),
        Err(err) => err,
    };
    if matches!(err, TranslateError::Cancelled) || is_credential_error(&err) {
        return Err(err);
    }

    let part_chars = part.chars().count();
    let halved = (chunk_size / 2).min(part_chars / 2).max(MIN_CHUNK_CHARS);
    if halved >= chunk_size || part_chars <= MIN_CHUNK_CHARS {
        return Err(err);
    }
    tracing::debug!(
        from = chunk_size,
        to = halved,
        error = %err,
        "chunk failed, re-splitting at half size"
    );
    translate_segments(state, part, halved, ctx).await
}

async fn translate_chunk(
    state: &RunState,
    chunk: &str,
    ctx: &LongTextContext<'_>,
) -> Result<String> {
    let request = TextRequest {
        text: chunk,
        source: ctx.source,
        glossary_pairs: ctx.glossary_pairs,
        style_hint: ctx.style_hint,
        term_replacements: ctx.term_replacements,
        lane: ctx.lane,
        temperature: state.options.temperature.min(CHUNK_TEMPERATURE_CAP),
        candidate_count: 1,
        max_retries: state.options.max_retries,
    };
    translate_text_with_sentinel(state, &request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_shrinks_for_cjk_targets() {
        assert_eq!(initial_chunk_size("plain text", 9000, "german"), 6000);
        assert_eq!(initial_chunk_size("plain text", 9000, "korean"), 4500);
        assert_eq!(initial_chunk_size("plain text", 2000, "korean"), 2000);
    }

    #[test]
    fn chunk_size_shrinks_with_token_density() {
        let busy: String = (0..45).map(|i| format!("__XT_PH_{i:04}__ word ")).collect();
        assert_eq!(initial_chunk_size(&busy, 9000, "german"), 4500);
        let dense: String = (0..90).map(|i| format!("__XT_PH_{i:04}__ word ")).collect();
        assert_eq!(initial_chunk_size(&dense, 9000, "german"), 3000);
    }

    #[test]
    fn chunk_size_never_below_floor() {
        assert_eq!(initial_chunk_size("x", 100, "korean"), MIN_CHUNK_CHARS);
    }

    #[test]
    fn cjk_detection() {
        assert!(is_cjk_language("Korean"));
        assert!(is_cjk_language("japanese"));
        assert!(is_cjk_language("Chinese (Simplified)"));
        assert!(!is_cjk_language("german"));
    }
}
