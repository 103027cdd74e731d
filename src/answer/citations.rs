//! Citation-marker renumbering. The generator emits `[cN]` where N is the
//! 1-based index into the context blocks it was handed; this maps those
//! raw indices to sequential numbers in order of first appearance and
//! rewrites the answer text to match, largest marker first so replacing
//! `[c1]` never clobbers a `[c10]`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use crate::retrieval::RetrievedChunk;
use crate::store::models::Citation;

static MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[c(\d+)\]").unwrap());

const PREVIOUS_ANSWER_TRIGGERS: &[&str] = &[
    "previous answer",
    "you said",
    "earlier you",
    "last message",
    "before you",
    "you mentioned",
    "as you said",
];

pub fn mentions_previous_answer(question: &str) -> bool {
    let lower = question.to_lowercase();
    PREVIOUS_ANSWER_TRIGGERS.iter().any(|phrase| lower.contains(phrase))
}

/// Renumbers `[cN]` markers in `raw_answer` against the context blocks that
/// were actually sent to the generator (`contexts[i]` backs marker `i+1`).
/// Markers outside that range are dropped unless `history_citations` has
/// an entry for the original number, in which case they resolve there
/// instead (used when the question is about a previous answer).
pub fn renumber(
    raw_answer: &str,
    contexts: &[RetrievedChunk],
    history_citations: &HashMap<u32, Citation>,
) -> (String, Vec<Citation>) {
    let mut first_seen: Vec<u32> = Vec::new();
    for cap in MARKER.captures_iter(raw_answer) {
        if let Ok(n) = cap[1].parse::<u32>() {
            if !first_seen.contains(&n) {
                first_seen.push(n);
            }
        }
    }

    let mut new_number_of: HashMap<u32, u32> = HashMap::new();
    let mut citations = Vec::new();
    let mut next = 1u32;

    for old in &first_seen {
        let resolved = contexts
            .get((*old as usize).wrapping_sub(1))
            .map(|hit| Citation {
                label: String::new(),
                number: 0,
                document_id: hit.chunk.document_id,
                section_title: hit.chunk.section_title.clone(),
                page_number: hit.chunk.page_number,
                excerpt: crate::answer::excerpt::summarize(&hit.chunk.text, None),
                full_text: hit.chunk.text.clone(),
            })
            .or_else(|| history_citations.get(old).cloned());

        let Some(mut citation) = resolved else {
            continue;
        };

        citation.number = next;
        citation.label = format!("c{next}");
        new_number_of.insert(*old, next);
        citations.push(citation);
        next += 1;
    }

    let rewritten = rewrite_markers(raw_answer, &new_number_of);
    (rewritten, citations)
}

/// Replaces every resolvable `[cOLD]` with its final `[cNEW]` form in one
/// left-to-right pass (no intermediate string can accidentally match a
/// still-unprocessed marker); unresolved markers are dropped.
fn rewrite_markers(raw_answer: &str, new_number_of: &HashMap<u32, u32>) -> String {
    let mut out = String::with_capacity(raw_answer.len());
    let mut last_end = 0;
    for cap in MARKER.captures_iter(raw_answer) {
        let m = cap.get(0).unwrap();
        out.push_str(&raw_answer[last_end..m.start()]);
        if let Ok(old) = cap[1].parse::<u32>() {
            if let Some(new) = new_number_of.get(&old) {
                out.push_str(&format!("[c{new}]"));
            }
        }
        last_end = m.end();
    }
    out.push_str(&raw_answer[last_end..]);
    out
}

/// Builds a `number -> Citation` lookup from a prior assistant message, used
/// when the current question is about a previous answer.
pub fn resolve_from_history(previous_citations: &[Citation]) -> HashMap<u32, Citation> {
    previous_citations.iter().map(|c| (c.number, c.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{Chunk, DocumentId};
    use uuid::Uuid;

    fn hit(text: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk: Chunk {
                chunk_id: Uuid::new_v4().to_string(),
                document_id: DocumentId::new(),
                ordinal: 0,
                page_number: Some(1),
                section_title: None,
                text: text.to_string(),
                images: vec![],
                tables: vec![],
            },
            score: 0.9,
        }
    }

    #[test]
    fn renumbers_in_order_of_first_appearance() {
        let contexts = vec![hit("first"), hit("second"), hit("third")];
        let (rewritten, citations) = renumber("see [c3] and also [c1]", &contexts, &HashMap::new());
        assert_eq!(rewritten, "see [c1] and also [c2]");
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].number, 1);
        assert_eq!(citations[1].number, 2);
    }

    #[test]
    fn large_marker_does_not_collide_with_small_one() {
        let contexts: Vec<RetrievedChunk> = (0..10).map(|i| hit(&format!("chunk {i}"))).collect();
        let (rewritten, _) = renumber("[c10] then [c1]", &contexts, &HashMap::new());
        assert_eq!(rewritten, "[c1] then [c2]");
    }

    #[test]
    fn out_of_range_marker_is_dropped() {
        let contexts = vec![hit("only one")];
        let (rewritten, citations) = renumber("cites [c5] here", &contexts, &HashMap::new());
        assert_eq!(rewritten, "cites  here");
        assert!(citations.is_empty());
    }
}
