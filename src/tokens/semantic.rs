//! Korean-specific semantic repairs for numeric placeholders. Magic-effect
//! strings use magnitude and duration placeholders whose surrounding words
//! reveal how the model used them; a magnitude next to time words or a
//! duration next to amount words is almost always a swap.

use once_cell::sync::Lazy;
use regex::Regex;

use super::extract_tokens;

static NUMERIC_BAD_PARTICLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(__XT_PH_(?:MAG|NUM)_[0-9]{4}__)\s*(?:에게서|에게|에서|으로|로)").unwrap()
});
static RAW_MAG_BUR_BAD_PARTICLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([+-]?<\s*(?:mag|bur)\s*>)\s*(?:에게서|에게|에서|으로|로)").unwrap()
});
static RAW_MAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)[+-]?<\s*mag\s*>").unwrap());
static RAW_DUR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)[+-]?<\s*dur\s*>").unwrap());

const MAX_SEMANTIC_REPAIR_LEN: usize = 2000;

pub fn is_korean_language(lang: &str) -> bool {
    let s = lang.trim();
    if s.is_empty() {
        return false;
    }
    let lower = s.to_lowercase();
    lower == "ko"
        || lower.starts_with("ko-")
        || lower.starts_with("ko_")
        || lower.contains("korean")
        || s.contains("한국")
        || s == "한국어"
}

fn in_time_context(text: &str, token: &str) -> bool {
    let esc = regex::escape(token);
    let after = format!(r"{esc}\s*(?:초간|초|분|시간|일|주|개월|년|동안|간)");
    let before = format!(r"(?:초간|초|분|시간|일|주|개월|년|동안)\s*{esc}");
    matches_pattern(&after, text) || matches_pattern(&before, text)
}

fn in_amount_context(text: &str, token: &str) -> bool {
    let esc = regex::escape(token);
    matches_pattern(&format!(r"{esc}\s*(?:%|퍼센트|만큼|점|포인트|수치)"), text)
        || matches_pattern(&format!(r"{esc}\s*의\s*(?:피해|회복|흡수)"), text)
        || matches_pattern(&format!(r"{esc}.{{0,8}}(?:피해|회복|증가|감소|강화|약화)"), text)
}

fn matches_pattern(pattern: &str, text: &str) -> bool {
    Regex::new(pattern).map(|re| re.is_match(text)).unwrap_or(false)
}

fn single_mag_and_dur(input: &str) -> Option<(String, String)> {
    let mut mags: Vec<String> = Vec::new();
    let mut durs: Vec<String> = Vec::new();
    for t in extract_tokens(input) {
        if t.starts_with("__XT_PH_MAG_") && !mags.contains(&t) {
            mags.push(t);
        } else if t.starts_with("__XT_PH_DUR_") && !durs.contains(&t) {
            durs.push(t);
        }
    }
    if mags.len() == 1 && durs.len() == 1 {
        return durs.pop().and_then(|d| mags.pop().map(|m| (m, d)));
    }
    // Raw placeholder mode, no masking tokens present.
    if RAW_MAG_RE.find_iter(input).count() == 1 && RAW_DUR_RE.find_iter(input).count() == 1 {
        return Some(("<mag>".to_string(), "<dur>".to_string()));
    }
    None
}

fn single_dur_token(input: &str) -> Option<String> {
    let mut dur: Option<String> = None;
    for t in extract_tokens(input) {
        if !t.starts_with("__XT_PH_DUR_") {
            continue;
        }
        match &dur {
            None => dur = Some(t),
            Some(existing) if *existing != t => return None,
            Some(_) => {}
        }
    }
    if dur.is_some() {
        return dur;
    }
    if RAW_DUR_RE.find_iter(input).count() == 1 {
        return Some("<dur>".to_string());
    }
    None
}

fn looks_like_mag_dur_swap(text: &str, mag: &str, dur: &str) -> bool {
    let mag_in_time = in_time_context(text, mag);
    let dur_in_amount = in_amount_context(text, dur);
    if !mag_in_time || !dur_in_amount {
        return false;
    }
    // If both also appear in their correct contexts, don't guess.
    !(in_time_context(text, dur) && in_amount_context(text, mag))
}

fn swap_tokens(text: &str, a: &str, b: &str) -> String {
    const TMP: &str = "__XT_SWAP_TMP__";
    text.replace(a, TMP).replace(b, a).replace(TMP, b)
}

fn repair_mag_dur_swap(input: &str, output: &str) -> String {
    let Some((mag, dur)) = single_mag_and_dur(input) else {
        return output.to_string();
    };
    if !output.contains(&mag) || !output.contains(&dur) {
        return output.to_string();
    }
    if !looks_like_mag_dur_swap(output, &mag, &dur) {
        return output.to_string();
    }
    tracing::debug!(%mag, %dur, "swapping misused magnitude/duration placeholders");
    swap_tokens(output, &mag, &dur)
}

/// "늑대인간초 동안 DUR의 ..." treats the duration token like a noun.
/// Move it to the front of the time phrase: "DUR초 동안 늑대인간의 ...".
fn repair_dur_after_time_phrase(input: &str, output: &str) -> String {
    if !output.contains('초') && !output.contains("동안") {
        return output.to_string();
    }
    let Some(dur) = single_dur_token(input) else {
        return output.to_string();
    };
    let esc = regex::escape(&dur);
    let subject = r"([\p{L}\p{N}][\p{L}\p{N} \-'’]{0,40})";
    let time_unit = r"(?:초간|초|분|시간|일|주|개월|년)";

    let mut working = output.to_string();
    let pattern_a = format!(r"{subject}\s*초\s*동안\s*{esc}\s*{time_unit}?\s*의");
    if let Ok(re) = Regex::new(&pattern_a) {
        working = re
            .replace_all(&working, |caps: &regex::Captures<'_>| {
                let subj = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
                format!("{dur}초 동안 {subj}의")
            })
            .into_owned();
    }
    let pattern_b = format!(r"{subject}\s*초\s*동안\s*{esc}\s*{time_unit}?");
    if let Ok(re) = Regex::new(&pattern_b) {
        working = re
            .replace_all(&working, |caps: &regex::Captures<'_>| {
                let subj = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
                format!("{dur}초 동안 {subj}")
            })
            .into_owned();
    }
    working
}

fn repair_bad_particles(input: &str, output: &str) -> String {
    let mut working = output.to_string();
    if input.contains("__XT_PH_MAG_") || input.contains("__XT_PH_NUM_") {
        working = NUMERIC_BAD_PARTICLE_RE.replace_all(&working, "$1").into_owned();
    }
    let lower = input.to_ascii_lowercase();
    if lower.contains("<mag") || lower.contains("<bur") {
        working = RAW_MAG_BUR_BAD_PARTICLE_RE
            .replace_all(&working, "$1")
            .into_owned();
    }
    working
}

/// Deterministic repair chain; cheap, so it runs before any model-assisted
/// repair request. Returns the output unchanged for non-Korean targets.
pub fn repair_semantic_mixups(input_masked: &str, output: &str, target_lang: &str) -> String {
    if !is_korean_language(target_lang)
        || input_masked.len() > MAX_SEMANTIC_REPAIR_LEN
        || input_masked.trim().is_empty()
        || output.trim().is_empty()
    {
        return output.to_string();
    }
    let working = repair_mag_dur_swap(input_masked, output);
    let working = repair_dur_after_time_phrase(input_masked, &working);
    repair_bad_particles(input_masked, &working)
}

/// Whether a translation still misuses numeric placeholders after the
/// deterministic chain, warranting a model-assisted repair request.
pub fn needs_semantic_repair(input_masked: &str, output: &str, target_lang: &str) -> bool {
    if !is_korean_language(target_lang)
        || input_masked.len() > MAX_SEMANTIC_REPAIR_LEN
        || input_masked.trim().is_empty()
        || output.trim().is_empty()
    {
        return false;
    }

    let mut mags: Vec<String> = Vec::new();
    let mut durs: Vec<String> = Vec::new();
    let mut nums: Vec<String> = Vec::new();
    for t in extract_tokens(input_masked) {
        if t.starts_with("__XT_PH_DUR_") {
            durs.push(t);
        } else if t.starts_with("__XT_PH_MAG_") {
            mags.push(t);
        } else if t.starts_with("__XT_PH_NUM_") {
            nums.push(t);
        }
    }
    let lower = input_masked.to_ascii_lowercase();
    if lower.contains("<dur") {
        durs.push("<dur>".to_string());
    }
    if lower.contains("<mag") {
        mags.push("<mag>".to_string());
    }
    if lower.contains("<bur") {
        mags.push("<bur>".to_string());
    }
    if mags.is_empty() && durs.is_empty() && nums.is_empty() {
        return false;
    }

    for dur in &durs {
        if !output.contains(dur.as_str())
            || !in_time_context(output, dur)
            || in_amount_context(output, dur)
        {
            return true;
        }
    }
    for mag in &mags {
        if !output.contains(mag.as_str()) || in_time_context(output, mag) {
            return true;
        }
    }
    for num in &nums {
        if !output.contains(num.as_str()) || in_time_context(output, num) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn korean_language_detection() {
        assert!(is_korean_language("korean"));
        assert!(is_korean_language("ko-KR"));
        assert!(is_korean_language("한국어"));
        assert!(!is_korean_language("japanese"));
        assert!(!is_korean_language(""));
    }

    #[test]
    fn swapped_mag_dur_is_repaired() {
        let input = "Deal __XT_PH_MAG_0001__ damage for __XT_PH_DUR_0002__ seconds";
        let output = "__XT_PH_DUR_0002__%의 피해를 __XT_PH_MAG_0001__초 동안 입힙니다";
        let fixed = repair_semantic_mixups(input, output, "korean");
        assert!(fixed.contains("__XT_PH_MAG_0001__%"));
        assert!(fixed.contains("__XT_PH_DUR_0002__초"));
    }

    #[test]
    fn correct_usage_left_alone() {
        let input = "Deal __XT_PH_MAG_0001__ damage for __XT_PH_DUR_0002__ seconds";
        let output = "__XT_PH_DUR_0002__초 동안 __XT_PH_MAG_0001__의 피해를 입힙니다";
        assert_eq!(repair_semantic_mixups(input, output, "korean"), output);
    }

    #[test]
    fn non_korean_target_untouched() {
        let input = "__XT_PH_MAG_0001__ for __XT_PH_DUR_0002__s";
        let output = "__XT_PH_DUR_0002__% gedurende __XT_PH_MAG_0001__ seconden";
        assert_eq!(repair_semantic_mixups(input, output, "dutch"), output);
    }

    #[test]
    fn bad_particle_after_numeric_token_removed() {
        let input = "Restores __XT_PH_MAG_0001__ points";
        let output = "__XT_PH_MAG_0001__에게 회복";
        let fixed = repair_semantic_mixups(input, output, "korean");
        assert_eq!(fixed, "__XT_PH_MAG_0001__ 회복");
    }

    #[test]
    fn misplaced_dur_moved_before_time_phrase() {
        let input = "Become a werewolf for __XT_PH_DUR_0001__ seconds";
        let output = "늑대인간초 동안 __XT_PH_DUR_0001__의 모습이 됩니다";
        let fixed = repair_semantic_mixups(input, output, "korean");
        assert!(fixed.starts_with("__XT_PH_DUR_0001__초 동안 늑대인간의"));
    }

    #[test]
    fn semantic_repair_flag_fires_on_misuse() {
        let input = "Deal <mag> damage over <dur> seconds";
        let output = "<dur>%의 피해를 <mag>초 동안";
        assert!(needs_semantic_repair(input, output, "korean"));
    }

    #[test]
    fn semantic_repair_flag_quiet_on_clean_output() {
        let input = "Deal <mag> damage over <dur> seconds";
        let output = "<dur>초 동안 <mag>의 피해";
        assert!(!needs_semantic_repair(input, output, "korean"));
    }
}
