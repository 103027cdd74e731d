//! From-scratch TF-IDF keyword index over (1,2)-gram tokens. Rebuilt
//! incrementally per document whenever ingestion completes for that
//! document; queries are tokenized the same way and scored by cosine
//! similarity against the cached per-chunk sparse vectors.

use dashmap::DashMap;
use std::collections::HashMap;
use unicode_segmentation::UnicodeSegmentation;

use crate::store::models::{Chunk, DocumentId};

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "of", "to", "in", "on", "for", "is", "are",
    "was", "were", "with", "as", "by", "that", "this", "it", "be", "at", "from",
];

fn tokenize(text: &str) -> Vec<String> {
    let unigrams: Vec<String> = text
        .unicode_words()
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 1 && !STOP_WORDS.contains(&w.as_str()))
        .collect();

    let mut tokens = unigrams.clone();
    for window in unigrams.windows(2) {
        tokens.push(format!("{} {}", window[0], window[1]));
    }
    tokens
}

fn term_frequencies(tokens: &[String]) -> HashMap<String, f32> {
    let mut counts: HashMap<String, f32> = HashMap::new();
    for token in tokens {
        *counts.entry(token.clone()).or_insert(0.0) += 1.0;
    }
    let total = tokens.len().max(1) as f32;
    for v in counts.values_mut() {
        *v /= total;
    }
    counts
}

#[derive(Clone)]
struct IndexedChunk {
    chunk_id: String,
    document_id: DocumentId,
    tf: HashMap<String, f32>,
}

#[derive(Default)]
pub struct TfidfIndex {
    chunks: DashMap<String, IndexedChunk>,
    document_frequency: DashMap<String, usize>,
    document_count: std::sync::atomic::AtomicUsize,
}

impl TfidfIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove_document(&self, document_id: DocumentId) {
        let to_remove: Vec<String> = self
            .chunks
            .iter()
            .filter(|e| e.value().document_id == document_id)
            .map(|e| e.key().clone())
            .collect();
        for chunk_id in to_remove {
            if let Some((_, indexed)) = self.chunks.remove(&chunk_id) {
                for term in indexed.tf.keys() {
                    if let Some(mut count) = self.document_frequency.get_mut(term) {
                        *count = count.saturating_sub(1);
                    }
                }
                self.document_count.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
    }

    pub fn index_document(&self, document_id: DocumentId, chunks: &[Chunk]) {
        self.remove_document(document_id);
        for chunk in chunks {
            let tokens = tokenize(&chunk.text);
            let tf = term_frequencies(&tokens);
            for term in tf.keys() {
                *self.document_frequency.entry(term.clone()).or_insert(0) += 1;
            }
            self.chunks.insert(
                chunk.chunk_id.clone(),
                IndexedChunk { chunk_id: chunk.chunk_id.clone(), document_id, tf },
            );
            self.document_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn idf(&self, term: &str) -> f32 {
        let n = self.document_count.load(std::sync::atomic::Ordering::SeqCst).max(1) as f32;
        let df = *self.document_frequency.get(term).map(|v| *v).get_or_insert(0) as f32;
        ((n + 1.0) / (df + 1.0)).ln() + 1.0
    }

    pub fn search(&self, query: &str, document_ids: &[DocumentId], top_k: usize) -> Vec<(String, DocumentId, f32)> {
        let query_tf = term_frequencies(&tokenize(query));
        if query_tf.is_empty() {
            return Vec::new();
        }
        let query_vec: HashMap<&str, f32> = query_tf
            .iter()
            .map(|(term, tf)| (term.as_str(), tf * self.idf(term)))
            .collect();
        let query_norm = query_vec.values().map(|v| v * v).sum::<f32>().sqrt().max(1e-9);

        let mut scored: Vec<(String, DocumentId, f32)> = self
            .chunks
            .iter()
            .filter(|entry| document_ids.is_empty() || document_ids.contains(&entry.value().document_id))
            .filter_map(|entry| {
                let indexed = entry.value();
                let mut dot = 0.0f32;
                let mut doc_norm_sq = 0.0f32;
                for (term, tf) in &indexed.tf {
                    let weight = tf * self.idf(term);
                    doc_norm_sq += weight * weight;
                    if let Some(q) = query_vec.get(term.as_str()) {
                        dot += q * weight;
                    }
                }
                let doc_norm = doc_norm_sq.sqrt().max(1e-9);
                let score = dot / (query_norm * doc_norm);
                if score > 0.0 {
                    Some((indexed.chunk_id.clone(), indexed.document_id, score))
                } else {
                    None
                }
            })
            .collect();

        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap());
        scored.truncate(top_k);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, doc: DocumentId, text: &str) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            document_id: doc,
            ordinal: 0,
            page_number: None,
            section_title: None,
            text: text.to_string(),
            images: vec![],
            tables: vec![],
        }
    }

    #[test]
    fn exact_term_match_outranks_unrelated_chunk() {
        let index = TfidfIndex::new();
        let doc = DocumentId::new();
        index.index_document(
            doc,
            &[
                chunk("a", doc, "transformer attention mechanism for sequence modeling"),
                chunk("b", doc, "a recipe for baking sourdough bread at home"),
            ],
        );
        let results = index.search("transformer attention", &[doc], 5);
        assert_eq!(results[0].0, "a");
    }

    #[test]
    fn scoped_to_document_ids() {
        let index = TfidfIndex::new();
        let doc_a = DocumentId::new();
        let doc_b = DocumentId::new();
        index.index_document(doc_a, &[chunk("a", doc_a, "neural network training loss")]);
        index.index_document(doc_b, &[chunk("b", doc_b, "neural network training loss")]);
        let results = index.search("neural network", &[doc_a], 5);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1, doc_a);
    }
}
