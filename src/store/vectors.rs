use async_trait::async_trait;
use pgvector::Vector;
use sqlx::Row;

use crate::store::models::DocumentId;
use crate::store::pool::DbPool;
use crate::utils::error::ApiError;

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: DocumentId,
    pub score: f32,
}

/// Semantic contract for the vector index: nearest-neighbour search scoped
/// to a set of candidate document ids, backed here by pgvector.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, chunk_id: &str, document_id: DocumentId, vector: &[f32]) -> Result<(), ApiError>;
    async fn delete_for_document(&self, document_id: DocumentId) -> Result<(), ApiError>;
    async fn search(
        &self,
        query: &[f32],
        document_ids: &[DocumentId],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, ApiError>;
    async fn is_empty(&self) -> Result<bool, ApiError>;
    async fn has_vectors_for_document(&self, document_id: DocumentId) -> Result<bool, ApiError>;
}

pub struct PgVectorIndex {
    pool: DbPool,
}

impl PgVectorIndex {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    async fn upsert(&self, chunk_id: &str, document_id: DocumentId, vector: &[f32]) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, document_id, embedding)
            VALUES ($1, $2, $3)
            ON CONFLICT (chunk_id) DO UPDATE SET embedding = EXCLUDED.embedding
            "#,
        )
        .bind(chunk_id)
        .bind(document_id)
        .bind(Vector::from(vector.to_vec()))
        .execute(self.pool.get())
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    async fn delete_for_document(&self, document_id: DocumentId) -> Result<(), ApiError> {
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = $1")
            .bind(document_id)
            .execute(self.pool.get())
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        document_ids: &[DocumentId],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, ApiError> {
        if document_ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw_ids: Vec<Vec<u8>> = document_ids.iter().map(|id| id.as_bytes().to_vec()).collect();
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, document_id, 1 - (embedding <=> $1) AS score
            FROM chunk_vectors
            WHERE document_id = ANY($2)
            ORDER BY embedding <=> $1
            LIMIT $3
            "#,
        )
        .bind(Vector::from(query.to_vec()))
        .bind(raw_ids)
        .bind(top_k as i64)
        .fetch_all(self.pool.get())
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                Ok(ScoredChunk {
                    chunk_id: row.try_get("chunk_id").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
                    document_id: row.try_get("document_id").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
                    score: row.try_get::<f64, _>("score").map_err(|e| ApiError::DatabaseError(e.to_string()))? as f32,
                })
            })
            .collect()
    }

    async fn is_empty(&self) -> Result<bool, ApiError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(self.pool.get())
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        Ok(count == 0)
    }

    async fn has_vectors_for_document(&self, document_id: DocumentId) -> Result<bool, ApiError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM chunk_vectors WHERE document_id = $1)")
            .bind(document_id)
            .fetch_one(self.pool.get())
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        Ok(exists)
    }
}
