use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use crate::store::models::{ChatMessage, ChatSession, Citation, DocumentId, NewChatMessage, Role};
use crate::store::pool::DbPool;
use crate::utils::error::ApiError;

/// Persists chat sessions and their message history, one session bound to
/// exactly one document. `create_or_get` enforces the "title uniquely
/// identifies the session per (owner, document) unless forced" invariant.
#[async_trait]
pub trait ChatSessionStore: Send + Sync {
    async fn create_or_get(
        &self,
        owner_id: i64,
        document_id: DocumentId,
        title: &str,
        force_new: bool,
    ) -> Result<ChatSession, ApiError>;
    async fn get(&self, session_id: Uuid) -> Result<Option<ChatSession>, ApiError>;
    async fn append_message(&self, session_id: Uuid, message: NewChatMessage) -> Result<ChatMessage, ApiError>;
    async fn recent_messages(&self, session_id: Uuid, limit: i64) -> Result<Vec<ChatMessage>, ApiError>;
    async fn delete_for_document(&self, document_id: DocumentId) -> Result<(), ApiError>;
}

pub struct PgChatSessionStore {
    pool: DbPool,
}

impl PgChatSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatSessionStore for PgChatSessionStore {
    async fn create_or_get(
        &self,
        owner_id: i64,
        document_id: DocumentId,
        title: &str,
        force_new: bool,
    ) -> Result<ChatSession, ApiError> {
        if !force_new {
            let row = sqlx::query(
                "SELECT id, owner_id, document_id, title, created_at, updated_at \
                 FROM chat_sessions WHERE owner_id = $1 AND document_id = $2 AND title = $3",
            )
            .bind(owner_id)
            .bind(document_id)
            .bind(title)
            .fetch_optional(self.pool.get())
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

            if let Some(row) = row {
                return row_to_session(row);
            }
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO chat_sessions (id, owner_id, document_id, title, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $5)",
        )
        .bind(id)
        .bind(owner_id)
        .bind(document_id)
        .bind(title)
        .bind(now)
        .execute(self.pool.get())
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        Ok(ChatSession { id, owner_id, document_id, title: title.to_string(), created_at: now, updated_at: now })
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<ChatSession>, ApiError> {
        let row = sqlx::query(
            "SELECT id, owner_id, document_id, title, created_at, updated_at FROM chat_sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(self.pool.get())
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        row.map(row_to_session).transpose()
    }

    /// Messages are totally ordered by `created_at`; the caller provides the
    /// user turn before the LLM runs, so chat history is consistent even if
    /// the LLM call is retried.
    async fn append_message(&self, session_id: Uuid, message: NewChatMessage) -> Result<ChatMessage, ApiError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let citations = serde_json::to_value(&message.citations).unwrap_or_default();
        let retriever_scores = serde_json::to_value(&message.retriever_scores).unwrap_or_default();
        let user_image_paths = serde_json::to_value(&message.user_image_paths).unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO chat_messages
                (id, session_id, role, content, citations, confidence, retriever_scores, user_image_paths, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(id)
        .bind(session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(citations)
        .bind(message.confidence)
        .bind(retriever_scores)
        .bind(user_image_paths)
        .bind(now)
        .execute(self.pool.get())
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        sqlx::query("UPDATE chat_sessions SET updated_at = $2 WHERE id = $1")
            .bind(session_id)
            .bind(now)
            .execute(self.pool.get())
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        Ok(ChatMessage {
            id,
            session_id,
            role: message.role,
            content: message.content,
            citations: message.citations,
            confidence: message.confidence,
            retriever_scores: message.retriever_scores,
            user_image_paths: message.user_image_paths,
            created_at: now,
        })
    }

    async fn recent_messages(&self, session_id: Uuid, limit: i64) -> Result<Vec<ChatMessage>, ApiError> {
        let rows = sqlx::query(
            "SELECT id, session_id, role, content, citations, confidence, retriever_scores, user_image_paths, created_at \
             FROM chat_messages WHERE session_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(self.pool.get())
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        let mut messages: Vec<ChatMessage> = rows.into_iter().map(row_to_message).collect::<Result<_, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn delete_for_document(&self, document_id: DocumentId) -> Result<(), ApiError> {
        sqlx::query(
            "DELETE FROM chat_messages WHERE session_id IN (SELECT id FROM chat_sessions WHERE document_id = $1)",
        )
        .bind(document_id)
        .execute(self.pool.get())
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        sqlx::query("DELETE FROM chat_sessions WHERE document_id = $1")
            .bind(document_id)
            .execute(self.pool.get())
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        Ok(())
    }
}

fn row_to_session(row: sqlx::postgres::PgRow) -> Result<ChatSession, ApiError> {
    Ok(ChatSession {
        id: row.try_get("id").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        owner_id: row.try_get("owner_id").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        document_id: row.try_get("document_id").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        title: row.try_get("title").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        updated_at: row.try_get("updated_at").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
    })
}

fn row_to_message(row: sqlx::postgres::PgRow) -> Result<ChatMessage, ApiError> {
    let role_raw: String = row.try_get("role").map_err(|e| ApiError::DatabaseError(e.to_string()))?;
    let citations: serde_json::Value = row.try_get("citations").unwrap_or_default();
    let retriever_scores: serde_json::Value = row.try_get("retriever_scores").unwrap_or_default();
    let user_image_paths: serde_json::Value = row.try_get("user_image_paths").unwrap_or_default();

    Ok(ChatMessage {
        id: row.try_get("id").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        session_id: row.try_get("session_id").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        role: Role::from_str(&role_raw),
        content: row.try_get("content").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        citations: serde_json::from_value::<Vec<Citation>>(citations).unwrap_or_default(),
        confidence: row.try_get("confidence").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        retriever_scores: serde_json::from_value::<Vec<f32>>(retriever_scores).unwrap_or_default(),
        user_image_paths: serde_json::from_value::<Vec<String>>(user_image_paths).unwrap_or_default(),
        created_at: row.try_get("created_at").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
    })
}
