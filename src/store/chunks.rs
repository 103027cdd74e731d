use async_trait::async_trait;
use sqlx::Row;

use crate::store::models::{Chunk, DocumentId, ImageAsset, TableAsset};
use crate::store::pool::DbPool;
use crate::utils::error::ApiError;

/// Semantic contract for the chunk store: persisted text units keyed by
/// document, addressable by a content-derived id so re-ingestion of an
/// unchanged document is idempotent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn replace_all(&self, document_id: DocumentId, chunks: &[Chunk]) -> Result<(), ApiError>;
    async fn list_for_document(&self, document_id: DocumentId) -> Result<Vec<Chunk>, ApiError>;
    async fn get(&self, chunk_id: &str) -> Result<Option<Chunk>, ApiError>;
    async fn first_chunk(&self, document_id: DocumentId) -> Result<Option<Chunk>, ApiError>;
    async fn delete_for_document(&self, document_id: DocumentId) -> Result<(), ApiError>;
}

pub struct PgChunkStore {
    pool: DbPool,
}

impl PgChunkStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChunkStore for PgChunkStore {
    /// Idempotent rewrite: delete then insert inside one transaction, per
    /// the ingestion queue's "vector rewrite must be idempotent" contract.
    async fn replace_all(&self, document_id: DocumentId, chunks: &[Chunk]) -> Result<(), ApiError> {
        let mut tx = self
            .pool
            .get()
            .begin()
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        sqlx::query("DELETE FROM document_chunks WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        for chunk in chunks {
            let images = serde_json::to_value(&chunk.images).unwrap_or_default();
            let tables = serde_json::to_value(&chunk.tables).unwrap_or_default();
            sqlx::query(
                r#"
                INSERT INTO document_chunks
                    (chunk_id, document_id, ordinal, page_number, section_title, text, images, tables)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(&chunk.chunk_id)
            .bind(document_id)
            .bind(chunk.ordinal)
            .bind(chunk.page_number)
            .bind(&chunk.section_title)
            .bind(&chunk.text)
            .bind(images)
            .bind(tables)
            .execute(&mut *tx)
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    async fn list_for_document(&self, document_id: DocumentId) -> Result<Vec<Chunk>, ApiError> {
        let rows = sqlx::query(
            "SELECT chunk_id, document_id, ordinal, page_number, section_title, text, images, tables \
             FROM document_chunks WHERE document_id = $1 ORDER BY ordinal ASC",
        )
        .bind(document_id)
        .fetch_all(self.pool.get())
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(row_to_chunk).collect()
    }

    async fn get(&self, chunk_id: &str) -> Result<Option<Chunk>, ApiError> {
        let row = sqlx::query(
            "SELECT chunk_id, document_id, ordinal, page_number, section_title, text, images, tables \
             FROM document_chunks WHERE chunk_id = $1",
        )
        .bind(chunk_id)
        .fetch_optional(self.pool.get())
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        row.map(row_to_chunk).transpose()
    }

    async fn first_chunk(&self, document_id: DocumentId) -> Result<Option<Chunk>, ApiError> {
        let row = sqlx::query(
            "SELECT chunk_id, document_id, ordinal, page_number, section_title, text, images, tables \
             FROM document_chunks WHERE document_id = $1 ORDER BY ordinal ASC LIMIT 1",
        )
        .bind(document_id)
        .fetch_optional(self.pool.get())
        .await
        .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        row.map(row_to_chunk).transpose()
    }

    async fn delete_for_document(&self, document_id: DocumentId) -> Result<(), ApiError> {
        sqlx::query("DELETE FROM document_chunks WHERE document_id = $1")
            .bind(document_id)
            .execute(self.pool.get())
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        Ok(())
    }
}

fn row_to_chunk(row: sqlx::postgres::PgRow) -> Result<Chunk, ApiError> {
    let images: serde_json::Value = row.try_get("images").unwrap_or_default();
    let tables: serde_json::Value = row.try_get("tables").unwrap_or_default();
    Ok(Chunk {
        chunk_id: row.try_get("chunk_id").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        document_id: row.try_get("document_id").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        ordinal: row.try_get("ordinal").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        page_number: row.try_get("page_number").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        section_title: row.try_get("section_title").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        text: row.try_get("text").map_err(|e| ApiError::DatabaseError(e.to_string()))?,
        images: serde_json::from_value::<Vec<ImageAsset>>(images).unwrap_or_default(),
        tables: serde_json::from_value::<Vec<TableAsset>>(tables).unwrap_or_default(),
    })
}
