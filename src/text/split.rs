use crate::tokens::{split_by_tokens, TokenSegment};

/// Splits masked text into chunks of at most `max_chars` characters
/// without ever cutting through a placeholder token. Prefers sentence
/// boundaries, then whitespace, then a hard character cut.
pub fn split_long_text(masked: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    if masked.chars().count() <= max_chars {
        return vec![masked.to_string()];
    }

    let mut units: Vec<String> = Vec::new();
    for segment in split_by_tokens(masked) {
        match segment {
            TokenSegment::Token(t) => units.push(t),
            TokenSegment::Text(t) => units.extend(sentence_units(&t)),
        }
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    for unit in units {
        let unit_len = unit.chars().count();
        if current_len + unit_len > max_chars && current_len > 0 {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if unit_len > max_chars && !unit.starts_with("__XT_") {
            for piece in hard_split(&unit, max_chars) {
                let piece_len = piece.chars().count();
                if current_len + piece_len > max_chars && current_len > 0 {
                    chunks.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                current.push_str(&piece);
                current_len += piece_len;
            }
        } else {
            current.push_str(&unit);
            current_len += unit_len;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Sentence-ish fragments: break after terminal punctuation followed by
/// whitespace. Keeps the punctuation and trailing space with the left part.
fn sentence_units(text: &str) -> Vec<String> {
    let mut units = Vec::new();
    let mut start = 0;
    let mut prev_was_terminal = false;
    for (idx, ch) in text.char_indices() {
        if prev_was_terminal && ch.is_whitespace() {
            let end = idx + ch.len_utf8();
            units.push(text[start..end].to_string());
            start = end;
            prev_was_terminal = false;
            continue;
        }
        prev_was_terminal = matches!(ch, '.' | '!' | '?' | '…' | '。');
    }
    if start < text.len() {
        units.push(text[start..].to_string());
    }
    units
}

fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    let mut last_space: Option<usize> = None; // byte offset into current

    for ch in text.chars() {
        if current_len >= max_chars {
            if let Some(at) = last_space {
                let rest = current.split_off(at);
                pieces.push(std::mem::take(&mut current));
                current = rest;
                current_len = current.chars().count();
            } else {
                pieces.push(std::mem::take(&mut current));
                current_len = 0;
            }
            last_space = None;
        }
        if ch.is_whitespace() {
            last_space = Some(current.len() + ch.len_utf8());
        }
        current.push(ch);
        current_len += 1;
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::extract_tokens;

    #[test]
    fn short_text_single_chunk() {
        assert_eq!(split_long_text("short", 100), vec!["short".to_string()]);
    }

    #[test]
    fn splits_at_sentence_boundaries() {
        let text = "First sentence here. Second sentence there. Third one.";
        let chunks = split_long_text(text, 30);
        assert!(chunks.len() >= 2);
        assert_eq!(chunks.concat(), text);
        assert!(chunks[0].ends_with(". "));
    }

    #[test]
    fn tokens_never_cut() {
        let body = "word ".repeat(20);
        let text = format!("{body}__XT_PH_0001__ {body}__XT_PH_0002__ tail.");
        let chunks = split_long_text(&text, 40);
        assert_eq!(chunks.concat(), text);
        let mut seen = Vec::new();
        for chunk in &chunks {
            seen.extend(extract_tokens(chunk));
        }
        assert_eq!(seen, vec!["__XT_PH_0001__", "__XT_PH_0002__"]);
    }

    #[test]
    fn unbroken_text_hard_splits() {
        let text = "a".repeat(95);
        let chunks = split_long_text(&text, 40);
        assert_eq!(chunks.concat(), text);
        assert!(chunks.iter().all(|c| c.chars().count() <= 40));
    }
}
