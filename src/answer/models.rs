use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::GeneratorProvider;
use crate::retrieval::RetrievalMode;
use crate::store::models::Citation;

pub use crate::store::models::{ChatMessage, ChatSession, NewChatMessage, Role};

#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub session_id: Uuid,
    pub question: String,
    pub user_images: Vec<String>,
    pub retriever_mode: RetrievalMode,
    pub top_k: usize,
    pub max_tokens: usize,
    /// Per-request generator override; `None` uses the orchestrator's
    /// configured default provider.
    pub generator: Option<GeneratorProvider>,
}

#[derive(Debug, Clone)]
pub struct AnswerResult {
    pub session_id: Uuid,
    pub question: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub confidence: f32,
    pub retriever_scores: Vec<f32>,
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// One part of a multi-modal LLM turn; images are either a data URL (user
/// upload) or an http(s) URL (a reference asset pulled from the blob store).
#[derive(Debug, Clone)]
pub enum ContentPart {
    Text(String),
    ImageUrl(String),
}

#[derive(Debug, Clone)]
pub struct LlmMessage {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl LlmMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self { role, parts: vec![ContentPart::Text(text.into())] }
    }

    pub fn as_plain_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text(t) => Some(t.clone()),
                ContentPart::ImageUrl(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
