//! The ten-step answer pipeline: load the session, pull recent history
//! (dropping a duplicate of the question under a race), retrieve context
//! chunks, assemble the LLM turn, persist the user message before calling
//! out, fall back to extractive generation on any LLM error, renumber
//! citations, derive confidence, persist the assistant message and publish
//! a chat event.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::answer::citations::{self, mentions_previous_answer};
use crate::answer::generator::{extractive_answer, Generator};
use crate::answer::models::{AnswerRequest, AnswerResult, ContentPart, LlmMessage};
use crate::config::GeneratorProvider;
use crate::retrieval::{RetrievedChunk, Retriever};
use crate::status::broadcaster::StatusBroadcaster;
use crate::store::blob::BlobStore;
use crate::store::chat::ChatSessionStore;
use crate::store::models::{Citation, NewChatMessage, Role};
use crate::utils::error::ApiError;
use crate::utils::token_estimator::estimate_tokens;

const HISTORY_LIMIT: i64 = 10;
const MAX_REFERENCE_IMAGES: usize = 4;
const MIN_DERIVED_CONFIDENCE: f32 = 0.3;
const MAX_DERIVED_CONFIDENCE: f32 = 0.95;
const DEFAULT_CONFIDENCE: f32 = 0.5;

static CONFIDENCE_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[CONFIDENCE:\s*([0-9]*\.?[0-9]+)\]").unwrap());

const SYSTEM_PROMPT: &str = "You are a research assistant answering questions about an ingested \
document. Prefer chat history when the question is a follow-up. Describe any attached images \
directly. Cite document context with [cN] markers, where N is the 1-based position of the \
[Context N] block you drew from -- never invent a marker for chat history or general knowledge. \
End every answer with a confidence token of the form [CONFIDENCE:x.xx].";

pub struct Orchestrator {
    chat_store: Arc<dyn ChatSessionStore>,
    blob_store: Arc<dyn BlobStore>,
    retriever: Arc<Retriever>,
    generator: Arc<Generator>,
    broadcaster: Arc<StatusBroadcaster>,
    max_context_tokens: usize,
}

impl Orchestrator {
    pub fn new(
        chat_store: Arc<dyn ChatSessionStore>,
        blob_store: Arc<dyn BlobStore>,
        retriever: Arc<Retriever>,
        generator: Arc<Generator>,
        broadcaster: Arc<StatusBroadcaster>,
        max_context_tokens: usize,
    ) -> Self {
        Self { chat_store, blob_store, retriever, generator, broadcaster, max_context_tokens }
    }

    /// Keeps contexts in retriever-ranked order but drops any past the
    /// point where their cumulative estimated token cost would blow the
    /// generator's context budget -- citation numbering is assigned after
    /// this trim, so a dropped context never leaves a numbering gap.
    fn fit_contexts(&self, contexts: Vec<RetrievedChunk>) -> Vec<RetrievedChunk> {
        fit_contexts_to_budget(contexts, self.max_context_tokens)
    }

    pub async fn answer(&self, request: AnswerRequest) -> Result<AnswerResult, ApiError> {
        let session = self
            .chat_store
            .get(request.session_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("chat session {} not found", request.session_id)))?;
        if session.id != request.session_id {
            return Err(ApiError::InternalError("session id mismatch".into()));
        }

        if !self.retriever.document_has_vectors(session.document_id).await? {
            return Err(ApiError::NotFound(format!(
                "document {} has no indexed content yet -- refusing to answer rather than generate from zero context",
                session.document_id
            )));
        }

        let full_history = self.chat_store.recent_messages(request.session_id, HISTORY_LIMIT).await?;

        // Race guard: a concurrent ask with identical text may have already
        // landed as a pending user message; exclude it before building the
        // prompt so the question is not duplicated in the turn sequence.
        let history: Vec<_> =
            full_history.iter().filter(|m| !(m.role == Role::User && m.content == request.question)).collect();

        let previous_citations: HashMap<u32, Citation> = if mentions_previous_answer(&request.question) {
            full_history
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant)
                .map(|m| citations::resolve_from_history(&m.citations))
                .unwrap_or_default()
        } else {
            HashMap::new()
        };

        let mut image_parts = Vec::with_capacity(request.user_images.len());
        for image in &request.user_images {
            image_parts.push(self.resolve_image(image).await?);
        }
        let query_image = match request.user_images.first() {
            Some(reference) => Some(self.fetch_image_bytes(reference).await?),
            None => None,
        };

        let contexts = self
            .retriever
            .retrieve(request.retriever_mode, &request.question, query_image.as_deref(), &[session.document_id], request.top_k)
            .await?;
        let contexts = self.fit_contexts(contexts);

        let user_message = self
            .chat_store
            .append_message(request.session_id, NewChatMessage::user(request.question.clone(), request.user_images.clone()))
            .await?;

        let messages = self.build_prompt(&request.question, &history, &image_parts, &contexts);

        let provider = request.generator.unwrap_or_else(|| self.generator.provider());
        let raw_answer = if provider == GeneratorProvider::Extractive {
            extractive_answer(&request.question, &contexts)
        } else {
            match self.generator.generate(provider, &messages, request.max_tokens).await {
                Ok(text) => text,
                Err(_) => extractive_answer(&request.question, &contexts),
            }
        };

        let (confidence_token, stripped) = extract_confidence(&raw_answer);
        let (rewritten, answer_citations) = citations::renumber(&stripped, &contexts, &previous_citations);
        let retriever_scores: Vec<f32> = contexts.iter().map(|c| c.score).collect();
        let confidence = confidence_token.unwrap_or_else(|| derive_confidence(&retriever_scores));

        let assistant_message = self
            .chat_store
            .append_message(
                request.session_id,
                NewChatMessage::assistant(rewritten.clone(), answer_citations.clone(), confidence, retriever_scores.clone()),
            )
            .await?;

        self.broadcaster.send_chat_event(session.document_id, session.id, "answer_ready").await;

        Ok(AnswerResult {
            session_id: session.id,
            question: user_message.content,
            answer: rewritten,
            citations: answer_citations,
            confidence,
            retriever_scores,
            message_id: assistant_message.id,
            timestamp: assistant_message.created_at,
        })
    }

    fn build_prompt(
        &self,
        question: &str,
        history: &[&crate::store::models::ChatMessage],
        image_parts: &[String],
        contexts: &[RetrievedChunk],
    ) -> Vec<LlmMessage> {
        let mut messages = vec![LlmMessage::text(Role::System, SYSTEM_PROMPT)];

        for turn in history {
            if turn.role == Role::System {
                continue;
            }
            messages.push(LlmMessage::text(turn.role, turn.content.clone()));
        }

        let mut parts = vec![ContentPart::Text(question.to_string())];
        for url in image_parts {
            parts.push(ContentPart::ImageUrl(url.clone()));
        }

        let mut reference_images_attached = 0;
        for (i, hit) in contexts.iter().enumerate() {
            parts.push(ContentPart::Text(format!("[Context {}] {}", i + 1, hit.chunk.text)));
            if reference_images_attached >= MAX_REFERENCE_IMAGES {
                continue;
            }
            for image in &hit.chunk.images {
                if reference_images_attached >= MAX_REFERENCE_IMAGES {
                    break;
                }
                parts.push(ContentPart::Text(format!("[Context {} figure] {}", i + 1, image.path)));
                reference_images_attached += 1;
            }
        }

        messages.push(LlmMessage { role: Role::User, parts });
        messages
    }

    /// Converts a user-supplied image reference to a data URL for the LLM
    /// call. Inputs already shaped as a data URL pass through unchanged;
    /// everything else is treated as a blob store path.
    async fn resolve_image(&self, reference: &str) -> Result<String, ApiError> {
        if reference.starts_with("data:") {
            return Ok(reference.to_string());
        }
        let bytes = self.blob_store.get(reference).await?;
        let mime = infer::get(&bytes).map(|kind| kind.mime_type()).unwrap_or("application/octet-stream");
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        Ok(format!("data:{mime};base64,{encoded}"))
    }

    /// Raw bytes behind a user image reference, for the embedder's
    /// image-aware query vector rather than the LLM-facing data URL.
    async fn fetch_image_bytes(&self, reference: &str) -> Result<Vec<u8>, ApiError> {
        if let Some(payload) = reference.strip_prefix("data:").and_then(|rest| rest.split_once(',')).map(|(_, data)| data) {
            return base64::engine::general_purpose::STANDARD
                .decode(payload)
                .map_err(|e| ApiError::BadRequest(format!("invalid image data url: {e}")));
        }
        self.blob_store.get(reference).await
    }
}

fn extract_confidence(raw_answer: &str) -> (Option<f32>, String) {
    if let Some(caps) = CONFIDENCE_TOKEN.captures(raw_answer) {
        let value = caps[1].parse::<f32>().ok();
        let stripped = CONFIDENCE_TOKEN.replace(raw_answer, "").trim().to_string();
        (value, stripped)
    } else {
        (None, raw_answer.to_string())
    }
}

fn fit_contexts_to_budget(contexts: Vec<RetrievedChunk>, max_context_tokens: usize) -> Vec<RetrievedChunk> {
    let mut kept = Vec::with_capacity(contexts.len());
    let mut used = 0usize;
    for hit in contexts {
        let cost = estimate_tokens(&hit.chunk.text);
        if !kept.is_empty() && used + cost > max_context_tokens {
            break;
        }
        used += cost;
        kept.push(hit);
    }
    kept
}

fn derive_confidence(retriever_scores: &[f32]) -> f32 {
    if retriever_scores.is_empty() {
        return DEFAULT_CONFIDENCE;
    }
    let mean = retriever_scores.iter().sum::<f32>() / retriever_scores.len() as f32;
    mean.clamp(MIN_DERIVED_CONFIDENCE, MAX_DERIVED_CONFIDENCE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{Chunk, DocumentId};
    use uuid::Uuid;

    fn fixture_chunk(text: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk: Chunk {
                chunk_id: Uuid::new_v4().to_string(),
                document_id: DocumentId::new(),
                ordinal: 0,
                page_number: None,
                section_title: None,
                text: text.to_string(),
                images: vec![],
                tables: vec![],
            },
            score: 0.5,
        }
    }

    #[test]
    fn fit_contexts_always_keeps_the_first_hit() {
        let huge = "word ".repeat(10_000);
        let kept = fit_contexts_to_budget(vec![fixture_chunk(&huge)], 10);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn fit_contexts_drops_past_budget() {
        let contexts = vec![fixture_chunk("short context one"), fixture_chunk(&"word ".repeat(500)), fixture_chunk("short context three")];
        let kept = fit_contexts_to_budget(contexts, 50);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn confidence_token_is_extracted_and_stripped() {
        let (value, stripped) = extract_confidence("The answer is 42. [CONFIDENCE:0.87]");
        assert_eq!(value, Some(0.87));
        assert_eq!(stripped, "The answer is 42.");
    }

    #[test]
    fn missing_token_leaves_text_untouched() {
        let (value, stripped) = extract_confidence("no token here");
        assert_eq!(value, None);
        assert_eq!(stripped, "no token here");
    }

    #[test]
    fn derived_confidence_is_clamped_to_range() {
        assert_eq!(derive_confidence(&[]), DEFAULT_CONFIDENCE);
        assert_eq!(derive_confidence(&[0.99, 0.99]), MAX_DERIVED_CONFIDENCE);
        assert_eq!(derive_confidence(&[0.01, 0.01]), MIN_DERIVED_CONFIDENCE);
    }
}
