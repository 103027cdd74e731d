use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;

use crate::store::models::{Document, DocumentId, DocumentStatus, FeatureState, FeatureStatus};
use crate::store::pool::DbPool;
use crate::utils::error::ApiError;

#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn create(&self, owner_id: i64, filename: &str, file_size: i64, content_hash: &str) -> Result<Document, ApiError>;
    async fn set_blob_path(&self, id: DocumentId, path: &str) -> Result<(), ApiError>;
    async fn set_status(&self, id: DocumentId, status: DocumentStatus, error_message: Option<&str>) -> Result<(), ApiError>;
    async fn set_feature_state(&self, id: DocumentId, feature: &str, state: FeatureState) -> Result<(), ApiError>;
    async fn set_summary(&self, id: DocumentId, summary: &str) -> Result<(), ApiError>;
    async fn set_page_count(&self, id: DocumentId, pages: i32) -> Result<(), ApiError>;
    async fn get(&self, id: DocumentId) -> Result<Option<Document>, ApiError>;
    async fn list_for_owner(&self, owner_id: i64) -> Result<Vec<Document>, ApiError>;
    async fn delete(&self, id: DocumentId) -> Result<(), ApiError>;
}

pub struct PgDocumentRepository {
    pool: DbPool,
}

impl PgDocumentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentRepository for PgDocumentRepository {
    async fn create(&self, owner_id: i64, filename: &str, file_size: i64, content_hash: &str) -> Result<Document, ApiError> {
        let id = DocumentId::new();
        let now = Utc::now();
        let feature_status = FeatureStatus::default();
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, owner_id, filename, file_size, content_hash, status,
                 embedding_status, summary_status, reference_status, skimming_status,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7, $7, $7, $8, $8)
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .bind(filename)
        .bind(file_size)
        .bind(content_hash)
        .bind(DocumentStatus::Uploading.as_str())
        .bind(FeatureState::Pending.as_str())
        .bind(now)
        .execute(self.pool.get())
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        Ok(Document {
            id,
            owner_id,
            filename: filename.to_string(),
            stored_blob_path: None,
            file_size,
            content_hash: content_hash.to_string(),
            status: DocumentStatus::Uploading,
            feature_status,
            page_count: None,
            summary: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn set_blob_path(&self, id: DocumentId, path: &str) -> Result<(), ApiError> {
        sqlx::query(
            "UPDATE documents SET stored_blob_path = $2, updated_at = now() \
             WHERE id = $1 AND stored_blob_path IS NULL",
        )
        .bind(id)
        .bind(path)
        .execute(self.pool.get())
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    async fn set_status(&self, id: DocumentId, status: DocumentStatus, error_message: Option<&str>) -> Result<(), ApiError> {
        sqlx::query(
            "UPDATE documents SET status = $2, error_message = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .execute(self.pool.get())
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    async fn set_feature_state(&self, id: DocumentId, feature: &str, state: FeatureState) -> Result<(), ApiError> {
        let column = match feature {
            "embedding" => "embedding_status",
            "summary" => "summary_status",
            "reference" => "reference_status",
            "skimming" => "skimming_status",
            other => return Err(ApiError::BadRequest(format!("unknown feature {other}"))),
        };
        let sql = format!("UPDATE documents SET {column} = $2, updated_at = now() WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .bind(state.as_str())
            .execute(self.pool.get())
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    async fn set_summary(&self, id: DocumentId, summary: &str) -> Result<(), ApiError> {
        sqlx::query("UPDATE documents SET summary = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(summary)
            .execute(self.pool.get())
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    async fn set_page_count(&self, id: DocumentId, pages: i32) -> Result<(), ApiError> {
        sqlx::query("UPDATE documents SET page_count = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(pages)
            .execute(self.pool.get())
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: DocumentId) -> Result<Option<Document>, ApiError> {
        let row = sqlx::query(
            "SELECT id, owner_id, filename, stored_blob_path, file_size, content_hash, status, \
                    embedding_status, summary_status, reference_status, skimming_status, \
                    page_count, summary, error_message, created_at, updated_at \
             FROM documents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool.get())
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        row.map(row_to_document).transpose()
    }

    async fn list_for_owner(&self, owner_id: i64) -> Result<Vec<Document>, ApiError> {
        let rows = sqlx::query(
            "SELECT id, owner_id, filename, stored_blob_path, file_size, content_hash, status, \
                    embedding_status, summary_status, reference_status, skimming_status, \
                    page_count, summary, error_message, created_at, updated_at \
             FROM documents WHERE owner_id = $1 ORDER BY created_at DESC",
        )
        .bind(owner_id)
        .fetch_all(self.pool.get())
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(row_to_document).collect()
    }

    async fn delete(&self, id: DocumentId) -> Result<(), ApiError> {
        sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(id)
            .execute(self.pool.get())
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        Ok(())
    }
}

fn feature_state(raw: &str) -> FeatureState {
    match raw {
        "running" => FeatureState::Running,
        "ready" => FeatureState::Ready,
        "failed" => FeatureState::Failed,
        _ => FeatureState::Pending,
    }
}

fn row_to_document(row: sqlx::postgres::PgRow) -> Result<Document, ApiError> {
    let status_raw: String = row.try_get("status").map_err(|e| ApiError::DatabaseError(e.to_string()))?;
    let status = match status_raw.as_str() {
        "parsing" => DocumentStatus::Parsing,
        "chunking" => DocumentStatus::Chunking,
        "embedding" => DocumentStatus::Embedding,
        "ready" => DocumentStatus::Ready,
        "failed" => DocumentStatus::Failed,
        _ => DocumentStatus::Uploading,
    };

    Ok(Document {
        id: row.try_get("id").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        owner_id: row.try_get("owner_id").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        filename: row.try_get("filename").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        stored_blob_path: row.try_get("stored_blob_path").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        file_size: row.try_get("file_size").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        content_hash: row.try_get("content_hash").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        status,
        feature_status: FeatureStatus {
            embedding: feature_state(&row.try_get::<String, _>("embedding_status").unwrap_or_default()),
            summary: feature_state(&row.try_get::<String, _>("summary_status").unwrap_or_default()),
            reference: feature_state(&row.try_get::<String, _>("reference_status").unwrap_or_default()),
            skimming: feature_state(&row.try_get::<String, _>("skimming_status").unwrap_or_default()),
        },
        page_count: row.try_get("page_count").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        summary: row.try_get("summary").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        error_message: row.try_get("error_message").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        updated_at: row.try_get("updated_at").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
    })
}
