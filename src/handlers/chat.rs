//! Session creation and the ask / ask-with-upload endpoints.

use axum::extract::{Multipart, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::answer::AnswerRequest;
use crate::config::GeneratorProvider;
use crate::logging::{ActivityLog, ActivityStatus, ActivityType};
use crate::retrieval::RetrievalMode;
use crate::state::AppState;
use crate::store::models::{Citation, NewChatMessage};
use crate::utils::error::ApiError;

const DEFAULT_OWNER_ID: i64 = 0;
const DEFAULT_TOP_K: usize = 6;
const DEFAULT_MAX_TOKENS: usize = 1024;

/// A session title always reads `"Chat: <filename>"`, optionally followed
/// by a disambiguating ` - <timestamp> - <randomid>` suffix for re-opening
/// the same document under a fresh session. The filename segment is how the
/// session is bound to a document -- callers never pass a document id
/// directly.
fn filename_from_title(title: &str) -> Result<&str, ApiError> {
    let rest = title
        .strip_prefix("Chat: ")
        .ok_or_else(|| ApiError::BadRequest("title must start with \"Chat: <filename>\"".into()))?;
    let filename = rest.split(" - ").next().unwrap_or(rest).trim();
    if filename.is_empty() {
        return Err(ApiError::BadRequest("title is missing a filename".into()));
    }
    Ok(filename)
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    title: String,
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    initial_message: Option<String>,
    #[serde(default)]
    force_new: bool,
}

#[derive(Serialize)]
pub struct CreateSessionResponse {
    session_id: Uuid,
    title: String,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let owner_id = request.user_id.unwrap_or(DEFAULT_OWNER_ID);
    let filename = filename_from_title(&request.title)?;

    let document = state
        .document_repo
        .list_for_owner(owner_id)
        .await?
        .into_iter()
        .find(|document| document.filename == filename)
        .ok_or_else(|| ApiError::NotFound(format!("no document named '{filename}' for this owner")))?;

    let session = state.chat_store.create_or_get(owner_id, document.id, &request.title, request.force_new).await?;

    if let Some(initial_message) = request.initial_message.filter(|m| !m.is_empty()) {
        state.chat_store.append_message(session.id, NewChatMessage::user(initial_message, Vec::new())).await?;
    }

    Ok(Json(CreateSessionResponse { session_id: session.id, title: session.title }))
}

#[derive(Deserialize)]
pub struct AskRequest {
    session_id: Uuid,
    question: String,
    #[serde(default)]
    retriever_mode: RetrievalMode,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    max_tokens: Option<usize>,
    #[serde(default)]
    generator: Option<GeneratorProvider>,
}

#[derive(Serialize)]
pub struct AskResponse {
    session_id: Uuid,
    question: String,
    answer: String,
    cited_sections: Vec<Citation>,
    retriever_scores: Vec<f32>,
    message_id: Uuid,
    timestamp: chrono::DateTime<chrono::Utc>,
    confidence: f32,
}

impl From<crate::answer::AnswerResult> for AskResponse {
    fn from(result: crate::answer::AnswerResult) -> Self {
        Self {
            session_id: result.session_id,
            question: result.question,
            answer: result.answer,
            cited_sections: result.citations,
            retriever_scores: result.retriever_scores,
            message_id: result.message_id,
            timestamp: result.timestamp,
            confidence: result.confidence,
        }
    }
}

pub async fn ask(State(state): State<AppState>, Json(request): Json<AskRequest>) -> Result<Json<AskResponse>, ApiError> {
    let session_id = request.session_id;
    let answer_request = AnswerRequest {
        session_id,
        question: request.question,
        user_images: Vec::new(),
        retriever_mode: request.retriever_mode,
        top_k: request.top_k.unwrap_or(DEFAULT_TOP_K),
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        generator: request.generator,
    };

    let started = std::time::Instant::now();
    let outcome = state.orchestrator.answer(answer_request).await;
    let elapsed_ms = started.elapsed().as_millis() as i32;

    let log = match &outcome {
        Ok(result) => ActivityLog::builder(DEFAULT_OWNER_ID, ActivityType::MessageSent)
            .session_id(session_id)
            .processing_time(elapsed_ms)
            .similarity(result.confidence)
            .build(),
        Err(e) => ActivityLog::builder(DEFAULT_OWNER_ID, ActivityType::LlmError)
            .session_id(session_id)
            .status(ActivityStatus::Error)
            .error(e.to_string(), "ask_failed")
            .processing_time(elapsed_ms)
            .build(),
    };
    state.activity_logger.log(log);

    Ok(Json(outcome?.into()))
}

/// Same pipeline as `ask`, but the question arrives as a multipart form
/// alongside zero or more image attachments, which are written under
/// `temp_chat_images/` and passed to the orchestrator as blob store paths.
pub async fn ask_with_upload(State(state): State<AppState>, mut multipart: Multipart) -> Result<Json<AskResponse>, ApiError> {
    let mut session_id = None;
    let mut question = None;
    let mut retriever_mode = RetrievalMode::default();
    let mut top_k = DEFAULT_TOP_K;
    let mut max_tokens = DEFAULT_MAX_TOKENS;
    let mut generator = None;
    let mut user_images = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| ApiError::BadRequest(e.to_string()))? {
        match field.name() {
            Some("session_id") => {
                let text = field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
                session_id = Some(Uuid::parse_str(&text).map_err(|e| ApiError::BadRequest(e.to_string()))?);
            }
            Some("question") => {
                question = Some(field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?);
            }
            Some("retriever_mode") => {
                let text = field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
                retriever_mode = match text.as_str() {
                    "dense" => RetrievalMode::Dense,
                    "keyword" => RetrievalMode::Keyword,
                    _ => RetrievalMode::Hybrid,
                };
            }
            Some("top_k") => {
                let text = field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
                top_k = text.parse().unwrap_or(DEFAULT_TOP_K);
            }
            Some("max_tokens") => {
                let text = field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
                max_tokens = text.parse().unwrap_or(DEFAULT_MAX_TOKENS);
            }
            Some("generator") => {
                let text = field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
                generator = match text.as_str() {
                    "openai" => Some(GeneratorProvider::Openai),
                    "ollama" => Some(GeneratorProvider::Ollama),
                    "extractive" => Some(GeneratorProvider::Extractive),
                    _ => None,
                };
            }
            Some("image") => {
                let filename = field.file_name().map(|s| s.to_string()).unwrap_or_else(|| format!("{}.bin", Uuid::new_v4()));
                let bytes = field.bytes().await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
                let path = format!("temp_chat_images/{}_{}", Uuid::new_v4(), filename);
                state.blob_store.put(&path, &bytes).await?;
                user_images.push(path);
            }
            _ => {}
        }
    }

    let session_id = session_id.ok_or_else(|| ApiError::BadRequest("missing session_id field".into()))?;
    let question = question.ok_or_else(|| ApiError::BadRequest("missing question field".into()))?;

    let answer_request =
        AnswerRequest { session_id, question, user_images, retriever_mode, top_k, max_tokens, generator };

    let result = state.orchestrator.answer(answer_request).await?;
    Ok(Json(result.into()))
}
