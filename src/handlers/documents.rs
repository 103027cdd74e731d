//! Upload, delete and download endpoints for ingested documents.

use axum::extract::{Multipart, Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ingest::IngestJob;
use crate::state::AppState;
use crate::store::models::{Document, DocumentId};
use crate::utils::error::ApiError;

const DEFAULT_OWNER_ID: i64 = 0;

#[derive(Serialize)]
pub struct UploadResponse {
    document_id: DocumentId,
    document: Document,
}

pub async fn upload_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut filename = None;
    let mut bytes = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| ApiError::BadRequest(e.to_string()))? {
        if field.name() == Some("file") {
            filename = field.file_name().map(|s| s.to_string());
            bytes = Some(field.bytes().await.map_err(|e| ApiError::BadRequest(e.to_string()))?.to_vec());
        }
    }

    let filename = filename.ok_or_else(|| ApiError::BadRequest("missing file field".into()))?;
    let bytes = bytes.ok_or_else(|| ApiError::BadRequest("missing file contents".into()))?;

    if !filename.to_lowercase().ends_with(".pdf") {
        return Err(ApiError::BadRequest("only PDF uploads are supported".into()));
    }

    let content_hash = hex::encode(Sha256::digest(&bytes));

    let document =
        state.document_repo.create(DEFAULT_OWNER_ID, &filename, bytes.len() as i64, &content_hash).await?;

    state
        .ingestion_queue
        .enqueue(IngestJob { document_id: document.id, filename: filename.clone(), bytes })
        .map_err(|_| ApiError::InternalError("ingestion queue unavailable".into()))?;

    Ok(Json(UploadResponse { document_id: document.id, document }))
}

#[derive(Deserialize)]
pub struct DeleteRequest {
    #[serde(default)]
    document_ids: Vec<DocumentId>,
    #[serde(default)]
    delete_all: bool,
}

pub async fn delete_documents(
    State(state): State<AppState>,
    Json(request): Json<DeleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let targets = if request.delete_all {
        state.document_repo.list_for_owner(DEFAULT_OWNER_ID).await?.into_iter().map(|d| d.id).collect()
    } else {
        request.document_ids
    };

    for document_id in targets {
        // Stop any in-flight ingestion before tearing down its output, so a
        // pipeline step racing this delete doesn't resurrect a row or blob
        // we are about to remove.
        state.cancellation.cancel(document_id);

        if let Some(document) = state.document_repo.get(document_id).await? {
            if let Some(path) = document.stored_blob_path {
                let _ = state.blob_store.delete(&path).await;
            }
        }
        let _ = state.blob_store.delete(&crate::store::blob::markdown_path(document_id)).await;
        state.chunk_store.delete_for_document(document_id).await?;
        state.vector_index.delete_for_document(document_id).await?;
        state.chat_store.delete_for_document(document_id).await?;
        state.retriever.drop_document(document_id);
        state.cancellation.clear(document_id);
        state.document_repo.delete(document_id).await?;
    }

    Ok(axum::http::StatusCode::NO_CONTENT)
}

pub async fn download_document(
    State(state): State<AppState>,
    Path(document_id): Path<DocumentId>,
) -> Result<impl IntoResponse, ApiError> {
    let document = state
        .document_repo
        .get(document_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("document {document_id} not found")))?;

    let Some(path) = document.stored_blob_path else {
        return Err(ApiError::NotReady("document has no stored blob path yet".into()));
    };
    if document.status != crate::store::models::DocumentStatus::Ready && !state.blob_store.exists(&path).await {
        return Err(ApiError::NotReady("document blob is not yet available".into()));
    }

    let bytes = state.blob_store.get(&path).await?;
    Ok(([(axum::http::header::CONTENT_TYPE, "application/pdf")], bytes))
}
