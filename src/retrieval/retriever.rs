//! Unifies dense (pgvector), keyword (TF-IDF) and hybrid retrieval behind
//! one entry point used by the answer orchestrator. A session with no
//! attached document ids returns an empty result list. A document whose
//! vector index is entirely empty is a distinct condition from "no hits for
//! this query" -- callers use `document_has_vectors` to refuse generation
//! outright rather than answer from zero context.

use std::collections::HashMap;
use std::sync::Arc;

use crate::embedding::Embedder;
use crate::retrieval::tfidf::TfidfIndex;
use crate::store::chunks::ChunkStore;
use crate::store::models::{Chunk, DocumentId};
use crate::store::vectors::VectorIndex;
use crate::utils::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    Dense,
    Keyword,
    Hybrid,
}

impl Default for RetrievalMode {
    fn default() -> Self {
        Self::Hybrid
    }
}

const DEFAULT_ALPHA: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub score: f32,
}

pub struct Retriever {
    vector_index: Arc<dyn VectorIndex>,
    chunk_store: Arc<dyn ChunkStore>,
    embedder: Arc<Embedder>,
    tfidf: Arc<TfidfIndex>,
}

impl Retriever {
    pub fn new(
        vector_index: Arc<dyn VectorIndex>,
        chunk_store: Arc<dyn ChunkStore>,
        embedder: Arc<Embedder>,
        tfidf: Arc<TfidfIndex>,
    ) -> Self {
        Self { vector_index, chunk_store, embedder, tfidf }
    }

    /// Refreshes the keyword index for one document. Called after an
    /// ingestion pipeline run completes (or fails and needs clearing).
    pub async fn reindex_document(&self, document_id: DocumentId) -> Result<(), ApiError> {
        let chunks = self.chunk_store.list_for_document(document_id).await?;
        if chunks.is_empty() {
            self.tfidf.remove_document(document_id);
        } else {
            self.tfidf.index_document(document_id, &chunks);
        }
        Ok(())
    }

    pub fn drop_document(&self, document_id: DocumentId) {
        self.tfidf.remove_document(document_id);
    }

    /// Per-document signal distinct from the vector index's global
    /// emptiness: lets callers refuse to generate against a document that
    /// was never embedded instead of silently answering with no context.
    pub async fn document_has_vectors(&self, document_id: DocumentId) -> Result<bool, ApiError> {
        self.vector_index.has_vectors_for_document(document_id).await
    }

    pub async fn retrieve(
        &self,
        mode: RetrievalMode,
        query: &str,
        image: Option<&[u8]>,
        document_ids: &[DocumentId],
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, ApiError> {
        if document_ids.is_empty() {
            return Ok(Vec::new());
        }

        match mode {
            RetrievalMode::Dense => self.dense(query, image, document_ids, top_k).await,
            RetrievalMode::Keyword => self.keyword(query, document_ids, top_k).await,
            RetrievalMode::Hybrid => self.hybrid(query, image, document_ids, top_k, DEFAULT_ALPHA).await,
        }
    }

    async fn dense(
        &self,
        query: &str,
        image: Option<&[u8]>,
        document_ids: &[DocumentId],
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, ApiError> {
        if self.vector_index.is_empty().await? {
            return Ok(Vec::new());
        }
        let query_vector = self.embedder.encode_query(query, image).await?;
        let scored = self.vector_index.search(&query_vector, document_ids, top_k).await?;
        self.hydrate(scored.into_iter().map(|s| (s.chunk_id, s.score)).collect()).await
    }

    async fn keyword(&self, query: &str, document_ids: &[DocumentId], top_k: usize) -> Result<Vec<RetrievedChunk>, ApiError> {
        let scored = self.tfidf.search(query, document_ids, top_k);
        self.hydrate(scored.into_iter().map(|(id, _doc, score)| (id, score)).collect()).await
    }

    async fn hybrid(
        &self,
        query: &str,
        image: Option<&[u8]>,
        document_ids: &[DocumentId],
        top_k: usize,
        alpha: f32,
    ) -> Result<Vec<RetrievedChunk>, ApiError> {
        let wide_k = top_k.saturating_mul(2).max(top_k);
        let dense = if self.vector_index.is_empty().await? {
            Vec::new()
        } else {
            let query_vector = self.embedder.encode_query(query, image).await?;
            self.vector_index
                .search(&query_vector, document_ids, wide_k)
                .await?
                .into_iter()
                .map(|s| (s.chunk_id, s.score))
                .collect::<Vec<_>>()
        };
        let keyword = self
            .tfidf
            .search(query, document_ids, wide_k)
            .into_iter()
            .map(|(id, _doc, score)| (id, score))
            .collect::<Vec<_>>();

        let mut combined: HashMap<String, f32> = HashMap::new();
        for (id, score) in dense {
            *combined.entry(id).or_insert(0.0) += alpha * score;
        }
        for (id, score) in keyword {
            *combined.entry(id).or_insert(0.0) += (1.0 - alpha) * score;
        }

        let mut ranked: Vec<(String, f32)> = combined.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        ranked.truncate(top_k);

        self.hydrate(ranked).await
    }

    async fn hydrate(&self, scored: Vec<(String, f32)>) -> Result<Vec<RetrievedChunk>, ApiError> {
        let mut out = Vec::with_capacity(scored.len());
        for (chunk_id, score) in scored {
            if let Some(chunk) = self.chunk_store.get(&chunk_id).await? {
                out.push(RetrievedChunk { chunk, score });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::store::chunks::MockChunkStore;
    use crate::store::vectors::MockVectorIndex;

    async fn inert_embedder() -> Arc<Embedder> {
        let config = EmbeddingConfig {
            model: "test-model".into(),
            base_url: "http://localhost:1".into(),
            dimension: 4,
            api_key: None,
            batch_size: None,
            load_timeout_seconds: Some(1),
        };
        Arc::new(Embedder::new(&config, std::env::temp_dir().join("retriever-test-cache-unused")).await)
    }

    #[tokio::test]
    async fn retrieve_returns_empty_for_no_document_ids() {
        let retriever = Retriever::new(
            Arc::new(MockVectorIndex::new()),
            Arc::new(MockChunkStore::new()),
            inert_embedder().await,
            Arc::new(TfidfIndex::new()),
        );
        let hits = retriever.retrieve(RetrievalMode::Dense, "question", None, &[], 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn dense_retrieval_short_circuits_when_the_vector_index_is_globally_empty() {
        let mut vector_index = MockVectorIndex::new();
        vector_index.expect_is_empty().returning(|| Ok(true));
        let retriever = Retriever::new(
            Arc::new(vector_index),
            Arc::new(MockChunkStore::new()),
            inert_embedder().await,
            Arc::new(TfidfIndex::new()),
        );
        let hits = retriever
            .retrieve(RetrievalMode::Dense, "question", None, &[DocumentId::new()], 5)
            .await
            .unwrap();
        // No embedder call was made (it would fail against the unreachable
        // base url), proving the empty-index short circuit fired first.
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn document_has_vectors_delegates_to_the_vector_index() {
        let mut vector_index = MockVectorIndex::new();
        vector_index.expect_has_vectors_for_document().returning(|_| Ok(true));
        let retriever = Retriever::new(
            Arc::new(vector_index),
            Arc::new(MockChunkStore::new()),
            inert_embedder().await,
            Arc::new(TfidfIndex::new()),
        );
        assert!(retriever.document_has_vectors(DocumentId::new()).await.unwrap());
    }
}
