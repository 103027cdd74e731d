//! Single-consumer FIFO over the documents waiting to be ingested. One
//! background task drains the queue; callers only ever `enqueue`. Each
//! document's processing is dedup-locked by its blob path so a second
//! upload of the same path while the first is still running is skipped
//! rather than racing it.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::document::chunker::Chunker;
use crate::document::parser::DocumentParser;
use crate::embedding::Embedder;
use crate::ingest::cancel::CancellationGate;
use crate::retrieval::Retriever;
use crate::status::aggregator::{StatusAggregator, TaskName, TaskStatus};
use crate::store::blob::{self, BlobStore};
use crate::store::chunks::ChunkStore;
use crate::store::documents::DocumentRepository;
use crate::store::models::{DocumentId, DocumentStatus, FeatureState};
use crate::store::vectors::VectorIndex;
use crate::utils::error::ApiError;

pub struct IngestJob {
    pub document_id: DocumentId,
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone)]
pub struct IngestionQueue {
    sender: mpsc::UnboundedSender<IngestJob>,
}

pub struct IngestionDeps {
    pub blob_store: Arc<dyn BlobStore>,
    pub document_repo: Arc<dyn DocumentRepository>,
    pub chunk_store: Arc<dyn ChunkStore>,
    pub vector_index: Arc<dyn VectorIndex>,
    pub embedder: Arc<Embedder>,
    pub chunker: Arc<Chunker>,
    pub cancellation: Arc<CancellationGate>,
    pub status: Arc<StatusAggregator>,
    pub retriever: Arc<Retriever>,
}

struct ParseLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ParseLocks {
    fn new() -> Self {
        Self { locks: DashMap::new() }
    }

    fn for_path(&self, path: &str) -> Arc<Mutex<()>> {
        self.locks.entry(path.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

impl IngestionQueue {
    pub fn spawn(deps: IngestionDeps) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<IngestJob>();
        let deps = Arc::new(deps);
        let locks = Arc::new(ParseLocks::new());

        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let deps = deps.clone();
                let locks = locks.clone();
                process_one(deps, locks, job).await;
            }
            info!("ingestion queue consumer stopped");
        });

        Self { sender }
    }

    pub fn enqueue(&self, job: IngestJob) -> Result<(), ApiError> {
        self.sender
            .send(job)
            .map_err(|_| ApiError::InternalError("ingestion queue closed".into()))
    }
}

async fn process_one(deps: Arc<IngestionDeps>, locks: Arc<ParseLocks>, job: IngestJob) {
    let original_path = blob::raw_upload_path(job.document_id, &job.filename);
    let lock = locks.for_path(&original_path);

    let guard = match tokio::time::timeout(Duration::from_secs(1), lock.lock()).await {
        Ok(guard) => guard,
        Err(_) => {
            warn!("document {} already being ingested, skipping duplicate enqueue", job.document_id);
            return;
        }
    };

    if let Err(e) = run_pipeline(&deps, &job).await {
        match e {
            ApiError::Cancelled(_) => {
                info!("ingestion cancelled for document {}", job.document_id);
                let _ = deps.chunk_store.delete_for_document(job.document_id).await;
                let _ = deps.vector_index.delete_for_document(job.document_id).await;
                deps.retriever.drop_document(job.document_id);
                deps.cancellation.clear(job.document_id);
            }
            other => {
                error!("ingestion failed for document {}: {other}", job.document_id);
                let _ = deps
                    .document_repo
                    .set_status(job.document_id, DocumentStatus::Failed, Some(&other.to_string()))
                    .await;
                deps.status.notify_task_status(job.document_id, TaskName::Embedding, TaskStatus::Failed).await;
            }
        }
    }

    drop(guard);
}

async fn run_pipeline(deps: &IngestionDeps, job: &IngestJob) -> Result<(), ApiError> {
    let document_id = job.document_id;
    let cancel = deps.cancellation.handle_for(document_id);
    let original_path = blob::raw_upload_path(document_id, &job.filename);
    let markdown_path = blob::markdown_path(document_id);

    // Step 1: persist the raw upload, mark parsing.
    deps.blob_store.put(&original_path, &job.bytes).await?;
    deps.document_repo.set_blob_path(document_id, &original_path).await?;
    deps.document_repo.set_status(document_id, DocumentStatus::Parsing, None).await?;
    deps.status.notify_task_status(document_id, TaskName::Parsing, TaskStatus::Running).await;
    if cancel.is_cancelled() {
        return Err(ApiError::Cancelled("cancelled before parsing".into()));
    }

    // Step 2+3: reuse markdown if the cached artifact is newer than the
    // original upload, otherwise parse and write it.
    let extension = std::path::Path::new(&job.filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_string();

    let reuse = match (
        deps.blob_store.modified_at(&markdown_path).await,
        deps.blob_store.modified_at(&original_path).await,
    ) {
        (Some(md_time), Some(orig_time)) => md_time >= orig_time,
        _ => false,
    };

    let (markdown, page_count) = if reuse {
        let bytes = deps.blob_store.get(&markdown_path).await?;
        (String::from_utf8_lossy(&bytes).into_owned(), None)
    } else {
        let parsed = DocumentParser::parse_bytes(&job.bytes, &extension, document_id)?;
        deps.blob_store.put(&markdown_path, parsed.markdown.as_bytes()).await?;
        for figure in &parsed.figures {
            deps.blob_store.put(&figure.path, &figure.bytes).await?;
        }
        (parsed.markdown, Some(parsed.page_count as i32))
    };
    if let Some(pages) = page_count {
        deps.document_repo.set_page_count(document_id, pages).await?;
    }

    if cancel.is_cancelled() {
        return Err(ApiError::Cancelled("cancelled before chunking".into()));
    }

    // Step 4: chunk. The markdown already carries `![caption](path)` image
    // references and pipe-table blocks for whatever the parser detected;
    // the chunker's asset regexes turn those into `Chunk.images`/`.tables`.
    deps.document_repo.set_status(document_id, DocumentStatus::Chunking, None).await?;
    deps.status.notify_task_status(document_id, TaskName::Chunking, TaskStatus::Running).await;
    let chunks = deps.chunker.chunk(&markdown, document_id, deps.embedder.as_ref()).await?;

    // Step 5: figure bytes were already written to the blob store above,
    // alongside the markdown, so nothing further to copy here.

    if cancel.is_cancelled() {
        return Err(ApiError::Cancelled("cancelled before persisting chunks".into()));
    }

    // Step 6: persist chunks, then refresh the keyword index so hybrid and
    // keyword-only retrieval see this document immediately.
    deps.chunk_store.replace_all(document_id, &chunks).await?;
    deps.retriever.reindex_document(document_id).await?;

    // Step 7+8: embed.
    deps.document_repo.set_status(document_id, DocumentStatus::Embedding, None).await?;
    deps.document_repo.set_feature_state(document_id, "embedding", FeatureState::Running).await?;
    deps.status.notify_task_status(document_id, TaskName::Embedding, TaskStatus::Running).await;

    let embedded = deps.embedder.embed_chunks(document_id, &chunks, &cancel).await?;

    // Step 9: idempotent vector rewrite.
    deps.vector_index.delete_for_document(document_id).await?;
    for (chunk_id, vector) in &embedded {
        deps.vector_index.upsert(chunk_id, document_id, vector).await?;
    }

    // Step 10: mark ready.
    deps.document_repo.set_feature_state(document_id, "embedding", FeatureState::Ready).await?;
    deps.document_repo.set_status(document_id, DocumentStatus::Ready, None).await?;
    deps.status.notify_task_status(document_id, TaskName::Embedding, TaskStatus::Completed).await;

    Ok(())
}
