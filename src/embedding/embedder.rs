use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::document::chunker::SentenceEncoder;
use crate::embedding::cache::EmbeddingCache;
use crate::ingest::cancel::CancellationHandle;
use crate::store::models::{Chunk, DocumentId};
use crate::utils::error::ApiError;

const DEFAULT_BATCH_SIZE: usize = 8;
const TABLE_EMBED_MAX_CHARS: usize = 4000;
const QUERY_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    NotLoaded,
    Loaded,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// Process-wide embedding client. Model/connection warm-up is lazy and
/// guarded by a mutex + `Notify` so the first N concurrent callers block on
/// one load instead of racing N loads.
pub struct Embedder {
    client: Client,
    base_url: String,
    model: String,
    dimension: usize,
    api_key: Option<String>,
    batch_size: usize,
    load_timeout: Duration,
    load_state: Mutex<LoadState>,
    load_notify: Notify,
    cache: EmbeddingCache,
}

impl Embedder {
    pub async fn new(config: &EmbeddingConfig, cache_dir: PathBuf) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            dimension: config.dimension,
            api_key: config.api_key.clone(),
            batch_size: config.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            load_timeout: Duration::from_secs(config.load_timeout_seconds.unwrap_or(300)),
            load_state: Mutex::new(LoadState::NotLoaded),
            load_notify: Notify::new(),
            cache: EmbeddingCache::load(cache_dir.join("embeddings.jsonl")).await,
        }
    }

    /// Blocks the first caller until the embedding backend is confirmed
    /// reachable; subsequent callers return immediately once loaded.
    pub(crate) async fn ensure_loaded(&self) -> Result<(), ApiError> {
        {
            let state = self.load_state.lock().await;
            if *state == LoadState::Loaded {
                return Ok(());
            }
        }

        let mut state = self.load_state.lock().await;
        if *state == LoadState::Loaded {
            return Ok(());
        }

        let probe = tokio::time::timeout(self.load_timeout, self.client.get(&self.base_url).send());
        match probe.await {
            Ok(_) => {
                *state = LoadState::Loaded;
                self.load_notify.notify_waiters();
                Ok(())
            }
            Err(_) => {
                warn!("embedding backend warm-up timed out after {:?}", self.load_timeout);
                Err(ApiError::LlmError("embedding backend unavailable".into()))
            }
        }
    }

    async fn raw_embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        let mut request = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .json(&EmbeddingRequest { model: &self.model, input: texts.to_vec() });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::LlmError(format!("embedding request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::LlmError(format!("embedding api error {status}: {body}")));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ApiError::LlmError(format!("invalid embedding response: {e}")))?;

        for datum in &parsed.data {
            if datum.embedding.len() != self.dimension {
                return Err(ApiError::LlmError(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.dimension,
                    datum.embedding.len()
                )));
            }
        }

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    /// Single-sentence embed with no cache, used by the chunker's
    /// semantic splitter.
    pub async fn encode_sentence(&self, sentence: &str) -> Result<Vec<f32>, ApiError> {
        self.ensure_loaded().await?;
        let vectors = tokio::time::timeout(QUERY_TIMEOUT, self.raw_embed_batch(&[sentence.to_string()]))
            .await
            .map_err(|_| ApiError::LlmError("sentence embedding timed out".into()))??;
        vectors.into_iter().next().ok_or_else(|| ApiError::LlmError("empty embedding response".into()))
    }

    /// Embeds the question text and, when the caller attached an image,
    /// averages in a second embedding of that image so the query vector
    /// reflects both modalities. Falls back to the text-only vector if the
    /// image embedding call fails -- a caller's broken image attachment
    /// should degrade retrieval quality, not fail the whole request.
    pub async fn encode_query(&self, text: &str, image: Option<&[u8]>) -> Result<Vec<f32>, ApiError> {
        self.ensure_loaded().await?;
        let vectors = tokio::time::timeout(QUERY_TIMEOUT, self.raw_embed_batch(&[text.to_string()]))
            .await
            .map_err(|_| ApiError::LlmError("query embedding timed out".into()))??;
        let text_vector = vectors.into_iter().next().ok_or_else(|| ApiError::LlmError("empty embedding response".into()))?;

        let Some(image_bytes) = image else {
            return Ok(text_vector);
        };

        match self.encode_image(image_bytes).await {
            Ok(image_vector) => Ok(average_vectors(&[text_vector, image_vector])),
            Err(e) => {
                warn!("image embedding failed, falling back to text-only query vector: {e}");
                Ok(text_vector)
            }
        }
    }

    /// Embeds raw image bytes through the same text-embedding endpoint as a
    /// base64 payload. The backend is expected to be multimodal-capable;
    /// this crate does not ship its own image encoder.
    async fn encode_image(&self, bytes: &[u8]) -> Result<Vec<f32>, ApiError> {
        self.ensure_loaded().await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        let vectors = tokio::time::timeout(QUERY_TIMEOUT, self.raw_embed_batch(&[encoded]))
            .await
            .map_err(|_| ApiError::LlmError("image embedding timed out".into()))??;
        vectors.into_iter().next().ok_or_else(|| ApiError::LlmError("empty embedding response".into()))
    }

    /// Embeds every chunk of a document, batch by batch, checking the
    /// cancellation handle before each batch starts.
    pub async fn embed_chunks(
        &self,
        document_id: DocumentId,
        chunks: &[Chunk],
        cancel: &CancellationHandle,
    ) -> Result<Vec<(String, Vec<f32>)>, ApiError> {
        self.ensure_loaded().await?;
        let mut out = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                return Err(ApiError::Cancelled("embedding cancelled".into()));
            }

            let batch_timeout = Duration::from_secs(
                (60 + 5 * batch.len() as u64).clamp(120, 600),
            );

            let mut to_fetch = Vec::new();
            let mut cached = Vec::new();
            for chunk in batch {
                let key = EmbeddingCache::key(document_id, chunk.ordinal, &chunk.text);
                match self.cache.get(&key) {
                    Some(vector) => cached.push((chunk.chunk_id.clone(), vector)),
                    None => to_fetch.push((chunk, key)),
                }
            }

            if !to_fetch.is_empty() {
                let texts: Vec<String> = to_fetch.iter().map(|(c, _)| fuse_chunk_text(c)).collect();
                let fetch = tokio::time::timeout(batch_timeout, self.raw_embed_batch(&texts)).await;
                match fetch {
                    Ok(Ok(vectors)) => {
                        for ((chunk, key), vector) in to_fetch.into_iter().zip(vectors.into_iter()) {
                            self.cache.put(key, vector.clone()).await;
                            out.push((chunk.chunk_id.clone(), vector));
                        }
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Err(ApiError::LlmError("embedding batch timed out".into())),
                }
            }
            out.extend(cached);
            debug!("embedded batch of {} chunks for document {document_id}", batch.len());
        }

        Ok(out)
    }
}

/// Joins table markdown (truncated) and figure captions into the chunk text
/// so both contribute to the embedding rather than being silently dropped.
/// Figures carry only a blob path and caption at this stage, not raw bytes,
/// so "image averaging" at index time means folding the caption text in
/// here; a true joint image+text vector only happens at query time via
/// `encode_query`, where the caller can attach actual image bytes.
fn fuse_chunk_text(chunk: &Chunk) -> String {
    if chunk.tables.is_empty() && chunk.images.is_empty() {
        return chunk.text.clone();
    }
    let mut text = chunk.text.clone();
    for image in &chunk.images {
        if let Some(caption) = &image.caption {
            text.push_str("\n\n[figure] ");
            text.push_str(caption);
        }
    }
    for table in &chunk.tables {
        let truncated: String = table.markdown.chars().take(TABLE_EMBED_MAX_CHARS).collect();
        text.push_str("\n\n");
        text.push_str(&truncated);
    }
    text
}

fn average_vectors(vectors: &[Vec<f32>]) -> Vec<f32> {
    let len = vectors.iter().map(|v| v.len()).max().unwrap_or(0);
    let mut sum = vec![0.0f32; len];
    for vector in vectors {
        for (i, value) in vector.iter().enumerate() {
            sum[i] += value;
        }
    }
    let count = vectors.len() as f32;
    for value in sum.iter_mut() {
        *value /= count;
    }
    sum
}

#[async_trait]
impl SentenceEncoder for Embedder {
    async fn encode(&self, sentence: &str) -> Result<Vec<f32>, ApiError> {
        self.encode_sentence(sentence).await
    }
}
