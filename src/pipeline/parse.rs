//! Parsing of model replies: the `{"translations":[{id,text}]}` JSON
//! shape, tolerant of code fences and stray prose around the JSON.

use std::collections::HashMap;

use serde::Deserialize;

use crate::utils::{Result, TranslateError};

#[derive(Deserialize)]
struct TranslationsEnvelope {
    translations: Vec<TranslationEntry>,
}

#[derive(Deserialize)]
struct TranslationEntry {
    id: i64,
    text: String,
}

pub fn parse_translations(model_text: &str) -> Result<HashMap<i64, String>> {
    let raw = normalize_model_text(model_text);
    let envelope: TranslationsEnvelope = match serde_json::from_str(&raw) {
        Ok(env) => env,
        Err(_) => {
            let extracted = extract_json_span(&raw)?;
            serde_json::from_str(extracted)?
        }
    };
    Ok(envelope
        .translations
        .into_iter()
        .map(|e| (e.id, e.text))
        .collect())
}

fn normalize_model_text(model_text: &str) -> String {
    let raw = model_text.trim();
    if raw.starts_with("```") {
        strip_code_fence(raw)
    } else {
        raw.to_string()
    }
}

pub fn strip_code_fence(raw: &str) -> String {
    let mut s = raw;
    if let Some(newline) = s.find('\n') {
        s = &s[newline + 1..];
    }
    let mut s = s.trim_end();
    if let Some(stripped) = s.strip_suffix("```") {
        s = stripped;
    }
    s.trim().to_string()
}

/// Widest `{...}`/`[...]` span; models sometimes wrap JSON in prose.
fn extract_json_span(raw: &str) -> Result<&str> {
    let start = match (raw.find('{'), raw.find('[')) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => {
            return Err(TranslateError::OutputValidation(
                "model output did not contain JSON".to_string(),
            ))
        }
    };
    let end = raw.rfind('}').into_iter().chain(raw.rfind(']')).max();
    match end {
        Some(end) if end > start => Ok(&raw[start..=end]),
        _ => Err(TranslateError::OutputValidation(
            "model output did not contain complete JSON".to_string(),
        )),
    }
}

/// Plain-text replies occasionally come back fenced, JSON-wrapped, or
/// quoted; unwrap those shapes without touching ordinary text.
pub fn normalize_text_reply(model_text: &str) -> String {
    let raw = if model_text.trim_start().starts_with("```") {
        strip_code_fence(model_text.trim())
    } else {
        model_text.to_string()
    };

    let trimmed = raw.trim();
    if trimmed.to_lowercase().contains("\"translations\"") {
        if let Ok(map) = parse_translations(&raw) {
            if map.len() == 1 {
                if let Some(only) = map.into_values().next() {
                    return only;
                }
            }
        }
    }

    if trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2 {
        if let Ok(serde_json::Value::String(inner)) = serde_json::from_str(trimmed) {
            return inner;
        }
    }

    raw
}
