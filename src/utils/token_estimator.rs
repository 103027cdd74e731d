//! Word-based token estimate used to keep prompt assembly under the
//! generator's context budget without a real tokenizer dependency.

use crate::store::models::Chunk;

/// Roughly 1.3 tokens per whitespace-delimited word, plus a small
/// formatting overhead.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let words = text.split_whitespace().count();
    ((words as f64 * 1.3) + 5.0).ceil() as usize
}

pub fn estimate_chunks_tokens(chunks: &[Chunk]) -> usize {
    chunks.iter().map(|chunk| estimate_tokens(&chunk.text)).sum()
}

pub fn would_exceed_limit(current_tokens: usize, new_text: &str, max_tokens: usize) -> bool {
    let new_tokens = estimate_tokens(new_text);
    current_tokens + new_tokens > max_tokens
}

pub fn estimate_system_tokens(system_prompt: &str, context: &str) -> usize {
    estimate_tokens(system_prompt) + estimate_tokens(context) + 10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_scale_with_word_count() {
        let text = "the quick brown fox jumps over the lazy dog";
        let tokens = estimate_tokens(text);
        assert!((15..=18).contains(&tokens));
    }

    #[test]
    fn empty_text_has_zero_tokens() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn limit_check_respects_budget() {
        let current = 1000;
        let text = "word ".repeat(500);
        assert!(would_exceed_limit(current, &text, 1500));
        assert!(!would_exceed_limit(current, &text, 2000));
    }
}
