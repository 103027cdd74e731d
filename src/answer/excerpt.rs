//! Excerpt summarization thresholds for citation text: long passages are
//! truncated to a head/tail pair at word boundaries rather than a hard
//! character cut, so neither end lands mid-word.

const LONG_THRESHOLD: usize = 950;
const LONG_HEAD: usize = 800;
const LONG_TAIL: usize = 150;
const MEDIUM_THRESHOLD: usize = 500;
const MEDIUM_HEAD: usize = 400;
const MEDIUM_TAIL: usize = 100;

/// If `existing` is Some (the citation was carried over from a previous
/// message), it is preferred verbatim over recomputing a new excerpt.
pub fn summarize(full_text: &str, existing: Option<&str>) -> String {
    if let Some(existing) = existing {
        return existing.to_string();
    }

    let len = full_text.chars().count();
    if len > LONG_THRESHOLD {
        format!("{}...{}", head_words(full_text, LONG_HEAD), tail_words(full_text, LONG_TAIL))
    } else if len >= MEDIUM_THRESHOLD {
        format!("{}...{}", head_words(full_text, MEDIUM_HEAD), tail_words(full_text, MEDIUM_TAIL))
    } else {
        full_text.to_string()
    }
}

fn head_words(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    let mut end = max_chars;
    while end > 0 && !chars[end - 1].is_whitespace() {
        end -= 1;
    }
    if end == 0 {
        end = max_chars;
    }
    chars[..end].iter().collect::<String>().trim_end().to_string()
}

fn tail_words(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    let mut start = chars.len() - max_chars;
    while start < chars.len() && !chars[start].is_whitespace() {
        start += 1;
    }
    if start >= chars.len() {
        start = chars.len() - max_chars;
    }
    chars[start..].iter().collect::<String>().trim_start().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_passes_through() {
        let text = "a short citation excerpt";
        assert_eq!(summarize(text, None), text);
    }

    #[test]
    fn long_text_gets_head_and_tail() {
        let text = "word ".repeat(400);
        let result = summarize(&text, None);
        assert!(result.contains("..."));
        assert!(result.len() < text.len());
    }

    #[test]
    fn existing_summary_is_preferred() {
        let text = "word ".repeat(400);
        let result = summarize(&text, Some("cached summary"));
        assert_eq!(result, "cached summary");
    }

    #[test]
    fn head_tail_break_on_whitespace_not_mid_word() {
        let text = "abcdefghij ".repeat(200);
        let result = summarize(&text, None);
        let head = result.split("...").next().unwrap();
        assert!(head.ends_with("abcdefghij") || head.is_empty());
    }
}
