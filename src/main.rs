use anyhow::Result;
use axum::{extract::DefaultBodyLimit, routing::{get, post}, Router};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::info;

use paperwell_core::answer::{Generator, Orchestrator};
use paperwell_core::config::Settings;
use paperwell_core::document::Chunker;
use paperwell_core::embedding::Embedder;
use paperwell_core::handlers;
use paperwell_core::ingest::{CancellationGate, IngestionDeps, IngestionQueue};
use paperwell_core::logging::{ActivityLogger, LoggerConfig};
use paperwell_core::retrieval::{Retriever, TfidfIndex};
use paperwell_core::state::AppState;
use paperwell_core::status::{StatusAggregator, StatusBroadcaster};
use paperwell_core::store::{DbPool, FsBlobStore, PgChatSessionStore, PgChunkStore, PgDocumentRepository, PgVectorIndex};
use paperwell_core::utils::limiters::Limiters;

const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info,paperwell_core=debug".to_string()))
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .init();

    info!("starting paperwell-core");

    let settings = Settings::load()?;
    info!("configuration loaded");

    let db_pool = DbPool::new(&settings.database).await?;
    info!("database connection established");

    let blob_store: Arc<dyn paperwell_core::store::BlobStore> =
        Arc::new(FsBlobStore::new(PathBuf::from(&settings.storage.blob_root)));
    let document_repo: Arc<dyn paperwell_core::store::DocumentRepository> =
        Arc::new(PgDocumentRepository::new(db_pool.clone()));
    let chunk_store: Arc<dyn paperwell_core::store::ChunkStore> = Arc::new(PgChunkStore::new(db_pool.clone()));
    let vector_index: Arc<dyn paperwell_core::store::VectorIndex> = Arc::new(PgVectorIndex::new(db_pool.clone()));
    let chat_store: Arc<dyn paperwell_core::store::ChatSessionStore> = Arc::new(PgChatSessionStore::new(db_pool.clone()));

    let embedder = Arc::new(Embedder::new(&settings.embedding, PathBuf::from(&settings.storage.cache_dir)).await);
    let chunker = Arc::new(Chunker::new());
    let tfidf = Arc::new(TfidfIndex::new());
    let retriever = Arc::new(Retriever::new(vector_index.clone(), chunk_store.clone(), embedder.clone(), tfidf));

    let limiters = Arc::new(Limiters::new(&settings.limits));
    let generator = Arc::new(Generator::new(&settings.llm, limiters.clone()));

    let cancellation = Arc::new(CancellationGate::new());
    let status_broadcaster = Arc::new(StatusBroadcaster::new());
    let status_aggregator = Arc::new(StatusAggregator::new(document_repo.clone(), status_broadcaster.clone()));

    let ingestion_queue = IngestionQueue::spawn(IngestionDeps {
        blob_store: blob_store.clone(),
        document_repo: document_repo.clone(),
        chunk_store: chunk_store.clone(),
        vector_index: vector_index.clone(),
        embedder: embedder.clone(),
        chunker: chunker.clone(),
        cancellation: cancellation.clone(),
        status: status_aggregator.clone(),
        retriever: retriever.clone(),
    });

    let orchestrator = Arc::new(Orchestrator::new(
        chat_store.clone(),
        blob_store.clone(),
        retriever.clone(),
        generator,
        status_broadcaster.clone(),
        settings.rag.max_context_tokens,
    ));

    let activity_logger = Arc::new(ActivityLogger::new(db_pool.get().clone(), LoggerConfig::default()));

    let state = AppState {
        db_pool: db_pool.clone(),
        settings: settings.clone(),
        blob_store,
        document_repo,
        chunk_store,
        vector_index,
        chat_store,
        embedder,
        chunker,
        ingestion_queue,
        cancellation,
        status_aggregator,
        status_broadcaster,
        retriever,
        orchestrator,
        activity_logger,
        limiters,
    };

    let app = build_router(state);

    let addr = SocketAddr::from((settings.server.host.parse::<std::net::IpAddr>()?, settings.server.port));
    info!("server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check))
        .route("/ws/status/{document_id}", get(handlers::status_ws::status_stream));

    let routes = Router::new()
        .route("/api/documents", post(handlers::documents::upload_document))
        .route("/api/documents/delete", post(handlers::documents::delete_documents))
        .route("/api/documents/{document_id}/file", get(handlers::documents::download_document))
        .route("/api/chat/sessions", post(handlers::chat::create_session))
        .route("/api/chat/ask", post(handlers::chat::ask))
        .route("/api/chat/ask-with-upload", post(handlers::chat::ask_with_upload));

    Router::new()
        .merge(public_routes)
        .merge(routes)
        .with_state(state)
        .layer(CorsLayer::permissive().allow_origin(tower_http::cors::Any).allow_methods(tower_http::cors::Any).allow_headers(tower_http::cors::Any))
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default().include_headers(true)))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}
