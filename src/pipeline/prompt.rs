//! Prompt construction: system instruction, JSON batch prompts, plain
//! text prompts for single rows and chunks, and the repair prompts used
//! when a first pass mangled tokens.

use serde::Serialize;
use serde_json::json;

use crate::tokens::is_korean_language;

/// One entry of the batch prompt's input JSON.
#[derive(Debug, Clone, Serialize)]
pub struct PromptItem {
    pub id: i64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctx: Option<String>,
}

/// One entry of the repair batch prompt's input JSON.
#[derive(Debug, Clone, Serialize)]
pub struct RepairItem {
    pub id: i64,
    pub source: String,
    pub current: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rec: Option<String>,
}

pub fn system_instruction(source_lang: &str, target_lang: &str) -> String {
    let mut s = String::new();
    s.push_str("You are a professional game localization translator.\n");
    s.push_str(&format!(
        "You translate {source_lang} game strings into natural, fluent {target_lang}.\n"
    ));
    s.push_str("Keep proper nouns consistent across strings and respect the glossary when one is provided.\n");
    s.push_str("\n### Final Priority Guard (CRITICAL)\n");
    s.push_str("- If any instruction from project context conflicts with runtime translation rules, prioritize runtime translation rules.\n");
    s.push_str("- Do not leave translatable source text untranslated unless it is a proper noun/product/mod name that should remain as-is.\n");
    s
}

pub fn response_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "translations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "integer" },
                        "text": { "type": "string" }
                    },
                    "required": ["id", "text"]
                }
            }
        },
        "required": ["translations"]
    })
}

pub fn batch_user_prompt(
    source_lang: &str,
    target_lang: &str,
    items: &[PromptItem],
    glossary_pairs: &[(String, String)],
) -> String {
    let mut s = String::new();
    s.push_str("Translate game localization strings.\n");
    s.push_str(&format!("Translate from {source_lang} to {target_lang}.\n\n"));
    append_json_rules(&mut s);

    if is_korean_language(target_lang) && items.iter().any(|it| has_semantic_placeholders(&it.text))
    {
        append_korean_placeholder_rules(&mut s);
    }

    let payload = json!({
        "source_language": source_lang,
        "target_language": target_lang,
        "glossary": glossary_pairs,
        "items": items,
    });
    s.push_str("\nReturn JSON schema:\n");
    s.push_str("{\"translations\":[{\"id\":123,\"text\":\"...\"}]}\n\n");
    s.push_str("Input JSON:\n");
    s.push_str(&payload.to_string());
    s.push('\n');
    s
}

fn append_json_rules(s: &mut String) {
    s.push_str("Rules (CRITICAL):\n");
    s.push_str("- Output ONLY valid JSON (no markdown, code fences, or commentary).\n");
    s.push_str("- Preserve any tokens like __XT_PH_0000__, __XT_PH_MAG_0000__, __XT_PH_DUR_0001__, __XT_PH_NUM_0002__, __XT_TERM_0000__, or __XT_TERM_SESS_0000__ exactly (do not alter or remove).\n");
    s.push_str("- The output MUST contain every token that appears in each item's input 'text' (same counts). Do not delete, merge, or duplicate tokens.\n");
    s.push_str("- Do NOT output any raw markup tags/markers that were NOT present in each item's input 'text' (e.g., <p ...>, <img ...>, or [pagebreak]). If the input 'text' contains runtime tags like <mag>/<dur>/<bur>/<100%>, preserve them exactly.\n");
    s.push_str("- Translate ALL content. Do not omit, summarize, or add extra sentences.\n");
    s.push_str("- Keep line breaks as-is; line breaks are represented by placeholder tokens.\n");
    s.push_str("- Each item may include a 'rec' field (e.g., BOOK:DESC, QUST:FULL, INFO:NAM1). Use it to choose an appropriate style, and keep tone/register consistent WITHIN each item.\n");
    s.push_str("- Each item may include a 'ctx' field containing neighboring lines for reference only. Do NOT translate it and do NOT copy tokens/markup from it; token preservation rules apply to the item's 'text' only.\n");
    s.push_str("- Preserve semantic roles in patterns like \"protect X from Y\" (X is protected; Y is the threat). Do not invert roles.\n");
    s.push_str("- If the source contains patterns like \"Fortify X, Y and Z\", treat it as \"Fortify X, Fortify Y and Fortify Z\" (the prefix applies to each list item).\n");
}

fn append_korean_placeholder_rules(s: &mut String) {
    s.push_str("\nPlaceholder rules (Korean):\n");
    s.push_str("- __XT_PH_DUR_####__ or <dur> = duration in seconds. Use time phrasing (e.g., \"__XT_PH_DUR_####__초 동안\" / \"<dur>초 동안\").\n");
    s.push_str("- __XT_PH_MAG_####__ or <mag> = magnitude/amount (a NUMBER). Do not treat it as the word \"Magicka\".\n");
    s.push_str("- __XT_PH_NUM_####__ or <숫자>/<100%> = another numeric value (points/%/amount). It is NOT a duration.\n");
    s.push_str("- You MAY reorder numeric placeholder tokens (__XT_PH_MAG_####__, __XT_PH_NUM_####__, __XT_PH_DUR_####__) for natural Korean grammar, but do not reorder other tokens.\n");
    s.push_str("- Do NOT attach particles directly to numeric tokens. Avoid forms like \"__XT_PH_MAG_0000__을(를)\" or \"__XT_PH_MAG_0000__에게\".\n");
    s.push_str("- Do NOT output ambiguous particle markers like \"을(를)\", \"은(는)\", \"이(가)\", \"와(과)\", or \"(으)로\". Choose one correct form.\n");
    s.push_str("- Only use the word \"포인트\" when the input contains the English word \"point\"/\"points\".\n");
    s.push_str("- Examples (keep tokens):\n");
    s.push_str("  - Restore __XT_PH_MAG_0000__ points of Health. => 체력을 __XT_PH_MAG_0000__포인트 회복합니다.\n");
    s.push_str("  - Targets take __XT_PH_MAG_0000__ points of damage for __XT_PH_DUR_0001__ seconds. => __XT_PH_DUR_0001__초 동안 __XT_PH_MAG_0000__포인트의 피해를 입습니다.\n");
}

pub fn text_user_prompt(
    source_lang: &str,
    target_lang: &str,
    text: &str,
    glossary_pairs: &[(String, String)],
    style_hint: Option<&str>,
) -> String {
    let mut s = String::new();
    s.push_str("Translate a game localization string.\n");
    s.push_str(&format!("Translate from {source_lang} to {target_lang}.\n\n"));
    s.push_str("Rules (CRITICAL):\n");
    s.push_str("- Preserve any tokens like __XT_PH_0000__, __XT_PH_MAG_0000__, __XT_PH_DUR_0001__, __XT_PH_NUM_0002__, __XT_TERM_0000__, or __XT_TERM_SESS_0000__ exactly (do not alter or remove).\n");
    s.push_str("- The output MUST contain every token that appears in the input (same counts). Do not delete, merge, or duplicate tokens.\n");
    s.push_str("- Do NOT output any raw markup tags/markers that were NOT present in the input (e.g., <p ...>, <img ...>, or [pagebreak]). If the input contains runtime tags like <mag>/<dur>/<bur>/<100%>, preserve them exactly.\n");
    s.push_str("- Translate ALL content. Do not omit, summarize, or add extra sentences.\n");
    s.push_str("- Keep the tone/register consistent within this text.\n");
    s.push_str("- Preserve semantic roles in patterns like \"protect X from Y\" (X is protected; Y is the threat). Do not invert roles.\n");

    if is_korean_language(target_lang) && has_semantic_placeholders(text) {
        s.push_str("- __XT_PH_DUR_####__ or <dur> = duration in seconds (\"__XT_PH_DUR_####__초 동안\" / \"<dur>초 동안\").\n");
        s.push_str("- __XT_PH_MAG_####__/__XT_PH_NUM_####__ or <mag>/<숫자> = numeric magnitudes. Do not attach time words (\"초/동안\").\n");
        s.push_str("- Do NOT attach particles directly to numeric tokens and do NOT output ambiguous particle markers like \"을(를)\" or \"이(가)\". Choose one correct form.\n");
        s.push_str("- Only use the word \"포인트\" when the input contains the English word \"point\"/\"points\".\n");
    }

    s.push_str("- Return ONLY the translated text. Do not output JSON, quotes, code fences, or markdown.\n");
    append_optional_style(&mut s, style_hint);
    append_optional_glossary(&mut s, glossary_pairs);
    s.push_str("\nText to translate:\n<<<TEXT\n");
    s.push_str(text);
    s.push_str("\nTEXT>>>\n");
    s
}

pub fn repair_batch_user_prompt(
    source_lang: &str,
    target_lang: &str,
    items: &[RepairItem],
    glossary_pairs: &[(String, String)],
) -> String {
    let payload = json!({
        "source_language": source_lang,
        "target_language": target_lang,
        "glossary": glossary_pairs,
        "items": items,
    });

    let mut s = String::new();
    s.push_str("Fix game localization translations.\n");
    s.push_str(&format!(
        "Source language: {source_lang}. Target language: {target_lang}.\n\n"
    ));
    s.push_str("You are given items with SOURCE text and CURRENT translation.\n");
    s.push_str("Rewrite ONLY the translations so they are correct, natural, and faithful to the source.\n\n");
    s.push_str("Rules (CRITICAL):\n");
    s.push_str("- Preserve any tokens like __XT_PH_0000__, __XT_PH_MAG_0000__, __XT_PH_DUR_0001__, __XT_PH_NUM_0002__, __XT_TERM_0000__, or __XT_TERM_SESS_0000__ exactly (do not alter or remove).\n");
    s.push_str("- The output MUST contain every token that appears in SOURCE (same counts). Do not delete, merge, or duplicate tokens.\n");
    s.push_str("- Do NOT output any raw markup tags/markers that were NOT present in SOURCE. If SOURCE contains runtime tags like <mag>/<dur>/<bur>/<100%>, preserve them exactly.\n");
    s.push_str("- Token semantics:\n");
    s.push_str("  - __XT_PH_DUR_####__ = duration in seconds. Place it as time (e.g., \"__XT_PH_DUR_####__초 동안\").\n");
    s.push_str("  - __XT_PH_MAG_####__ = magnitude/amount (a NUMBER). Do not treat it as the word \"Magicka\".\n");
    s.push_str("  - __XT_PH_NUM_####__ = another numeric value (points/%/amount). It is NOT a duration.\n");
    s.push_str("- Only DUR tokens should be used with time words (\"초/동안/분/시간\"). Do NOT attach time words to MAG/NUM or other tokens.\n");
    s.push_str("- Korean grammar: Do NOT attach particles directly to numeric tokens. Put particles on the noun instead.\n");
    s.push_str("- Translate ALL content. Do not omit, summarize, or abridge any part of the text.\n");
    s.push_str("- Keep the tone/register consistent WITHIN each item.\n");
    s.push_str("- Output ONLY valid JSON.\n\n");
    s.push_str("Return JSON schema:\n");
    s.push_str("{\"translations\":[{\"id\":123,\"text\":\"...\"}]}\n\n");
    s.push_str("Input JSON:\n");
    s.push_str(&payload.to_string());
    s.push('\n');
    s
}

pub fn repair_text_user_prompt(
    source_lang: &str,
    target_lang: &str,
    source_text: &str,
    current_translation: &str,
    glossary_pairs: &[(String, String)],
    style_hint: Option<&str>,
) -> String {
    let mut s = String::new();
    s.push_str("Fix a game localization translation.\n");
    s.push_str(&format!(
        "Source language: {source_lang}. Target language: {target_lang}.\n\n"
    ));
    s.push_str("Task:\n");
    s.push_str("- You are given the SOURCE text and a CURRENT translation.\n");
    s.push_str("- The current translation may have placeholder/token mistakes or omissions.\n");
    s.push_str("- Rewrite ONLY the translation so it is correct, natural, and faithful to the source.\n\n");
    s.push_str("Rules (CRITICAL):\n");
    s.push_str("- Preserve every token from the SOURCE exactly, same counts. Do not delete, merge, or duplicate tokens.\n");
    s.push_str("- __XT_PH_DUR_####__ = duration in seconds; __XT_PH_MAG_####__/__XT_PH_NUM_####__ = numeric amounts, never durations.\n");
    s.push_str("- Do NOT output raw markup that is not in the SOURCE.\n");
    s.push_str("- Return ONLY the corrected translation text. No explanations, labels, JSON, quotes, or markdown.\n");
    append_optional_style(&mut s, style_hint);
    append_optional_glossary(&mut s, glossary_pairs);
    s.push_str("\nSOURCE:\n<<<SOURCE\n");
    s.push_str(source_text);
    s.push_str("\nSOURCE>>>\n\nCURRENT (needs fixing):\n<<<CURRENT\n");
    s.push_str(current_translation);
    s.push_str("\nCURRENT>>>\n\nCorrected translation:\n");
    s
}

fn append_optional_style(s: &mut String, style_hint: Option<&str>) {
    let Some(hint) = style_hint.map(str::trim).filter(|h| !h.is_empty()) else {
        return;
    };
    s.push_str("\nStyle:\n");
    s.push_str(hint);
    s.push('\n');
}

fn append_optional_glossary(s: &mut String, pairs: &[(String, String)]) {
    if pairs.is_empty() {
        return;
    }
    s.push_str("\nGlossary (preferred translations):\n");
    for (source, target) in pairs {
        s.push_str("- ");
        s.push_str(source);
        s.push_str(" => ");
        s.push_str(target);
        s.push('\n');
    }
}

fn has_semantic_placeholders(text: &str) -> bool {
    let lower = text.to_lowercase();
    text.contains("__XT_PH_MAG_")
        || text.contains("__XT_PH_DUR_")
        || text.contains("__XT_PH_NUM_")
        || lower.contains("<mag>")
        || lower.contains("<dur>")
        || lower.contains("<bur>")
}

/// Record-type style hint. Hints are written for Korean output since
/// that is the primary target; other targets still benefit from the
/// register guidance.
pub fn style_hint(source_text: &str, rec: Option<&str>) -> Option<String> {
    if source_text.trim().is_empty() {
        return None;
    }

    let family = rec.map(|r| {
        let base = r.split(':').next().unwrap_or(r);
        base.trim().to_uppercase()
    });

    let mut hint = match family.as_deref() {
        Some("BOOK") => Some(
            "REC=BOOK (in-game book/lore/guide). Use a consistent written narrative tone (문어체). \
             Prefer 서술체(…다/…한다) and keep sentence endings consistent. Avoid casual fillers \
             except inside quoted dialogue. Avoid adding explanatory parentheses like \"(English term)\" \
             unless they exist in the source."
                .to_string(),
        ),
        Some("INFO") | Some("DIAL") => Some(
            "REC=INFO/DIAL (dialogue/subtitles). Use natural spoken language. Keep register \
             consistent (do not switch between 존댓말/반말 within this item unless the source \
             clearly switches)."
                .to_string(),
        ),
        Some("QUST") => Some(
            "REC=QUST (quest/journal/objective). Keep it concise and instructional. Avoid \
             unnecessary embellishment."
                .to_string(),
        ),
        Some("MESG") => Some(
            "REC=MESG (UI message). Keep it short, clear, and game-UI friendly. Avoid long \
             literary phrasing."
                .to_string(),
        ),
        _ => None,
    };

    // Book exports are recognizable even without a rec tag.
    if hint.is_none() && source_text.to_lowercase().contains("[pagebreak]") {
        hint = Some(
            "This is an in-game book/lore/guide text. Use a neutral written narrative tone and \
             keep sentence endings consistent."
                .to_string(),
        );
    }

    hint
}

/// Dialogue rows carry neighboring lines as reference-only context.
pub fn append_dialogue_context(style_hint: Option<String>, window: Option<&str>) -> Option<String> {
    let Some(ctx) = window.map(str::trim).filter(|c| !c.is_empty()) else {
        return style_hint;
    };
    match style_hint {
        Some(hint) => Some(format!("{}\n\nContext (reference only):\n{ctx}", hint.trim())),
        None => Some(format!("Context (reference only):\n{ctx}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_prompt_includes_items_and_schema() {
        let items = vec![PromptItem {
            id: 7,
            text: "Iron Sword".to_string(),
            rec: Some("WEAP:FULL".to_string()),
            ctx: None,
        }];
        let prompt = batch_user_prompt("english", "korean", &items, &[]);
        assert!(prompt.contains("\"id\":7"));
        assert!(prompt.contains("Iron Sword"));
        assert!(prompt.contains("{\"translations\":[{\"id\":123,\"text\":\"...\"}]}"));
    }

    #[test]
    fn korean_placeholder_rules_only_when_semantic_tokens_present() {
        let plain = vec![PromptItem {
            id: 1,
            text: "Hello".to_string(),
            rec: None,
            ctx: None,
        }];
        assert!(!batch_user_prompt("english", "korean", &plain, &[])
            .contains("Placeholder rules (Korean)"));

        let semantic = vec![PromptItem {
            id: 1,
            text: "Deal __XT_PH_MAG_0000__ damage".to_string(),
            rec: None,
            ctx: None,
        }];
        assert!(batch_user_prompt("english", "korean", &semantic, &[])
            .contains("Placeholder rules (Korean)"));
        assert!(!batch_user_prompt("english", "german", &semantic, &[])
            .contains("Placeholder rules (Korean)"));
    }

    #[test]
    fn style_hints_by_rec_family() {
        assert!(style_hint("Long story", Some("BOOK:DESC"))
            .unwrap()
            .contains("REC=BOOK"));
        assert!(style_hint("Hi there", Some("INFO:NAM1"))
            .unwrap()
            .contains("REC=INFO/DIAL"));
        assert!(style_hint("Kill the dragon", Some("QUST:CNAM"))
            .unwrap()
            .contains("REC=QUST"));
        assert!(style_hint("Inventory full", Some("MESG:DESC"))
            .unwrap()
            .contains("REC=MESG"));
        assert!(style_hint("Plain text", Some("WEAP:FULL")).is_none());
        assert!(style_hint("Page one [pagebreak] page two", None).is_some());
    }

    #[test]
    fn dialogue_context_appends_to_hint() {
        let merged = append_dialogue_context(Some("REC=INFO".to_string()), Some("Prev:\n- hi"));
        assert!(merged.unwrap().contains("Context (reference only):"));
        assert_eq!(append_dialogue_context(None, None), None);
        assert_eq!(
            append_dialogue_context(Some("X".into()), Some("  ")),
            Some("X".to_string())
        );
    }

    #[test]
    fn glossary_and_style_render_in_text_prompt() {
        let prompt = text_user_prompt(
            "english",
            "korean",
            "Iron Sword",
            &[("Whiterun".to_string(), "화이트런".to_string())],
            Some("REC=MESG"),
        );
        assert!(prompt.contains("Glossary (preferred translations):"));
        assert!(prompt.contains("- Whiterun => 화이트런"));
        assert!(prompt.contains("Style:\nREC=MESG"));
        assert!(prompt.contains("<<<TEXT\nIron Sword\nTEXT>>>"));
    }
}
