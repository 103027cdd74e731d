use std::sync::Arc;

use crate::answer::Orchestrator;
use crate::config::Settings;
use crate::document::chunker::Chunker;
use crate::embedding::Embedder;
use crate::ingest::{CancellationGate, IngestionQueue};
use crate::logging::ActivityLogger;
use crate::retrieval::Retriever;
use crate::status::{StatusAggregator, StatusBroadcaster};
use crate::store::blob::BlobStore;
use crate::store::chat::ChatSessionStore;
use crate::store::chunks::ChunkStore;
use crate::store::documents::DocumentRepository;
use crate::store::pool::DbPool;
use crate::store::vectors::VectorIndex;
use crate::utils::limiters::Limiters;

/// Everything a handler needs, assembled once in `main` and handed out via
/// axum's `State` extractor rather than any module-level static.
#[derive(Clone)]
pub struct AppState {
    pub db_pool: DbPool,
    pub settings: Settings,
    pub blob_store: Arc<dyn BlobStore>,
    pub document_repo: Arc<dyn DocumentRepository>,
    pub chunk_store: Arc<dyn ChunkStore>,
    pub vector_index: Arc<dyn VectorIndex>,
    pub chat_store: Arc<dyn ChatSessionStore>,
    pub embedder: Arc<Embedder>,
    pub chunker: Arc<Chunker>,
    pub ingestion_queue: IngestionQueue,
    pub cancellation: Arc<CancellationGate>,
    pub status_aggregator: Arc<StatusAggregator>,
    pub status_broadcaster: Arc<StatusBroadcaster>,
    pub retriever: Arc<Retriever>,
    pub orchestrator: Arc<Orchestrator>,
    pub activity_logger: Arc<ActivityLogger>,
    pub limiters: Arc<Limiters>,
}
