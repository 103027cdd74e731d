//! Dynamic dispatch over the configured answer generator. `Openai` and
//! `Ollama` call out to an OpenAI- or Ollama-shaped chat endpoint;
//! `Extractive` never calls a remote model and is also the fallback used
//! when either of those fails or times out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::answer::models::{ContentPart, LlmMessage};
use crate::config::{GeneratorProvider, LlmConfig};
use crate::retrieval::{RetrievedChunk, TfidfIndex};
use crate::store::models::{Chunk, DocumentId, Role};
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;

const DEFAULT_TIMEOUT_SECS: u64 = 60;

pub struct Generator {
    provider: GeneratorProvider,
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    limiters: Arc<Limiters>,
}

impl Generator {
    pub fn new(config: &LlmConfig, limiters: Arc<Limiters>) -> Self {
        Self {
            provider: config.provider,
            client: Client::new(),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs(if config.timeout_seconds > 0 {
                config.timeout_seconds
            } else {
                DEFAULT_TIMEOUT_SECS
            }),
            limiters,
        }
    }

    pub fn provider(&self) -> GeneratorProvider {
        self.provider
    }

    /// Generates with the caller-selected provider rather than the one
    /// fixed at startup, so a single deployment can field per-request
    /// generator choice (`provider()` remains the configured default for
    /// callers that don't pass one explicitly).
    pub async fn generate(&self, provider: GeneratorProvider, messages: &[LlmMessage], max_tokens: usize) -> Result<String, ApiError> {
        if provider == GeneratorProvider::Extractive {
            return Err(ApiError::LlmError("extractive provider does not call a remote model".into()));
        }

        let (_permit, wait) = Limiters::acquire_timed(self.limiters.llm_generate.clone(), self.limiters.acquire_timeout, "llm_generate")
            .await
            .map_err(|e| ApiError::LlmError(e.to_string()))?;
        debug!(wait_ms = wait.as_millis() as u64, "acquired llm_generate permit");

        match provider {
            GeneratorProvider::Extractive => unreachable!(),
            GeneratorProvider::Openai => self.call_openai(messages, max_tokens).await,
            GeneratorProvider::Ollama => self.call_ollama(messages, max_tokens).await,
        }
    }

    async fn call_openai(&self, messages: &[LlmMessage], max_tokens: usize) -> Result<String, ApiError> {
        let body = OpenAiRequest {
            model: &self.model,
            max_tokens,
            messages: messages.iter().map(to_openai_message).collect(),
        };

        let mut request = self.client.post(format!("{}/v1/chat/completions", self.base_url)).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| ApiError::LlmError("llm request timed out".into()))?
            .map_err(|e| ApiError::LlmError(format!("llm request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::LlmError(format!("llm api error {status}: {body}")));
        }

        let parsed: OpenAiResponse =
            response.json().await.map_err(|e| ApiError::LlmError(format!("invalid llm response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ApiError::LlmError("llm returned no choices".into()))
    }

    async fn call_ollama(&self, messages: &[LlmMessage], max_tokens: usize) -> Result<String, ApiError> {
        let body = OllamaRequest {
            model: &self.model,
            stream: false,
            messages: messages.iter().map(|m| OllamaMessage { role: m.role.as_str(), content: m.as_plain_text() }).collect(),
            options: OllamaOptions { num_predict: max_tokens },
        };

        let response = tokio::time::timeout(self.timeout, self.client.post(format!("{}/api/chat", self.base_url)).json(&body).send())
            .await
            .map_err(|_| ApiError::LlmError("llm request timed out".into()))?
            .map_err(|e| ApiError::LlmError(format!("llm request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::LlmError(format!("llm api error {status}: {body}")));
        }

        let parsed: OllamaResponse =
            response.json().await.map_err(|e| ApiError::LlmError(format!("invalid llm response: {e}")))?;

        Ok(parsed.message.content)
    }
}

fn to_openai_message(message: &LlmMessage) -> OpenAiMessage {
    let content = message
        .parts
        .iter()
        .map(|part| match part {
            ContentPart::Text(text) => OpenAiContentPart::Text { text: text.clone() },
            ContentPart::ImageUrl(url) => OpenAiContentPart::ImageUrl { image_url: OpenAiImageUrl { url: url.clone() } },
        })
        .collect();
    OpenAiMessage { role: message.role.as_str(), content }
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    messages: Vec<OpenAiMessage>,
}

#[derive(Serialize)]
struct OpenAiMessage {
    role: &'static str,
    content: Vec<OpenAiContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAiContentPart {
    Text { text: String },
    ImageUrl { image_url: OpenAiImageUrl },
}

#[derive(Serialize)]
struct OpenAiImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Deserialize)]
struct OpenAiChoiceMessage {
    content: String,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    stream: bool,
    messages: Vec<OllamaMessage>,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct OllamaOptions {
    num_predict: usize,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaResponseMessage,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

const NO_CONTEXT_ANSWER: &str = "No relevant context was found to answer this question.";

/// Picks the sentence from the retrieved contexts with the highest TF-IDF
/// cosine similarity to the question, using the same keyword index the
/// retriever's keyword mode runs on. Used when the configured provider is
/// `extractive` or as the fallback when a remote call fails.
pub fn extractive_answer(question: &str, contexts: &[RetrievedChunk]) -> String {
    if contexts.is_empty() {
        return NO_CONTEXT_ANSWER.to_string();
    }

    let mut sentence_text: HashMap<String, String> = HashMap::new();
    let mut per_document: HashMap<DocumentId, Vec<Chunk>> = HashMap::new();
    for (context_index, hit) in contexts.iter().enumerate() {
        for (sentence_index, sentence) in hit.chunk.text.split(['.', '!', '?']).enumerate() {
            let sentence = sentence.trim();
            if sentence.is_empty() {
                continue;
            }
            let sentence_id = format!("{context_index}:{sentence_index}");
            sentence_text.insert(sentence_id.clone(), sentence.to_string());
            per_document.entry(hit.chunk.document_id).or_default().push(Chunk {
                chunk_id: sentence_id,
                document_id: hit.chunk.document_id,
                ordinal: sentence_index as i32,
                page_number: hit.chunk.page_number,
                section_title: hit.chunk.section_title.clone(),
                text: sentence.to_string(),
                images: Vec::new(),
                tables: Vec::new(),
            });
        }
    }
    if per_document.is_empty() {
        return NO_CONTEXT_ANSWER.to_string();
    }

    let index = TfidfIndex::new();
    let document_ids: Vec<DocumentId> = per_document.keys().copied().collect();
    for (document_id, sentences) in &per_document {
        index.index_document(*document_id, sentences);
    }

    index
        .search(question, &document_ids, 1)
        .into_iter()
        .next()
        .and_then(|(sentence_id, _, _)| sentence_text.get(&sentence_id).cloned())
        .unwrap_or_else(|| NO_CONTEXT_ANSWER.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extractive_picks_highest_tfidf_sentence() {
        let contexts = vec![RetrievedChunk {
            chunk: Chunk {
                chunk_id: "a".into(),
                document_id: DocumentId::new(),
                ordinal: 0,
                page_number: None,
                section_title: None,
                text: "The sky is blue. Attention mechanisms weight relevant tokens.".into(),
                images: vec![],
                tables: vec![],
            },
            score: 0.8,
        }];
        let answer = extractive_answer("how do attention mechanisms work", &contexts);
        assert!(answer.contains("Attention"));
    }

    #[test]
    fn extractive_falls_back_when_no_contexts() {
        assert_eq!(extractive_answer("anything", &[]), NO_CONTEXT_ANSWER);
    }
}
