//! Debounces per-document task-status updates, then reads the
//! authoritative feature status back from the document repository before
//! handing a composed snapshot to the broadcaster. Ported in structure
//! from a Python status aggregator that did exactly this (debounce, then
//! re-read the source of truth rather than trust the update payload).

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use crate::status::broadcaster::StatusBroadcaster;
use crate::store::documents::DocumentRepository;
use crate::store::models::{DocumentId, FeatureState};

const DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskName {
    Parsing,
    Chunking,
    Embedding,
    Summary,
    Reference,
    Skimming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub document_id: DocumentId,
    pub embedding_status: String,
    pub summary_status: String,
    pub reference_status: String,
    pub skimming_status: String,
    pub available_features: Vec<String>,
    pub all_ready: bool,
}

pub struct StatusAggregator {
    repository: Arc<dyn DocumentRepository>,
    broadcaster: Arc<StatusBroadcaster>,
    last_aggregated: DashMap<DocumentId, Instant>,
}

impl StatusAggregator {
    pub fn new(repository: Arc<dyn DocumentRepository>, broadcaster: Arc<StatusBroadcaster>) -> Self {
        Self { repository, broadcaster, last_aggregated: DashMap::new() }
    }

    /// Records the latest task status (currently informational — the
    /// snapshot always re-reads the repository) and schedules a debounced
    /// broadcast.
    pub async fn notify_task_status(&self, document_id: DocumentId, _task: TaskName, _status: TaskStatus) {
        let now = Instant::now();
        let should_wait = self
            .last_aggregated
            .get(&document_id)
            .map(|last| now.duration_since(*last) < DEBOUNCE)
            .unwrap_or(false);

        if should_wait {
            let remaining = DEBOUNCE - now.duration_since(*self.last_aggregated.get(&document_id).unwrap());
            tokio::time::sleep(remaining).await;
        }

        self.last_aggregated.insert(document_id, Instant::now());
        self.aggregate_and_broadcast(document_id).await;
    }

    /// Composes and broadcasts a snapshot immediately, bypassing the
    /// debounce. Used to give a freshly connected websocket client a
    /// snapshot without waiting on the next task-status update.
    pub(crate) async fn aggregate_and_broadcast(&self, document_id: DocumentId) {
        let Ok(Some(document)) = self.repository.get(document_id).await else {
            return;
        };

        let feature = &document.feature_status;
        let mut available = Vec::new();
        if matches!(feature.embedding, FeatureState::Ready) {
            available.push("embedding".to_string());
        }
        if matches!(feature.summary, FeatureState::Ready) {
            available.push("summary".to_string());
        }
        if matches!(feature.reference, FeatureState::Ready) {
            available.push("reference".to_string());
        }
        if matches!(feature.skimming, FeatureState::Ready) {
            available.push("skimming".to_string());
        }

        let snapshot = StatusSnapshot {
            document_id,
            embedding_status: feature.embedding.as_str().to_string(),
            summary_status: feature.summary.as_str().to_string(),
            reference_status: feature.reference.as_str().to_string(),
            skimming_status: feature.skimming.as_str().to_string(),
            available_features: available,
            all_ready: feature.all_ready(),
        };

        self.broadcaster.send_status(document_id, &snapshot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::broadcaster::StatusBroadcaster;
    use crate::store::models::{Document, DocumentStatus, FeatureStatus};
    use async_trait::async_trait;
    use chrono::Utc;

    struct FakeRepo(Document);

    #[async_trait]
    impl DocumentRepository for FakeRepo {
        async fn create(&self, _: i64, _: &str, _: i64, _: &str) -> Result<Document, crate::utils::error::ApiError> {
            unimplemented!()
        }
        async fn set_blob_path(&self, _: DocumentId, _: &str) -> Result<(), crate::utils::error::ApiError> { Ok(()) }
        async fn set_status(&self, _: DocumentId, _: DocumentStatus, _: Option<&str>) -> Result<(), crate::utils::error::ApiError> { Ok(()) }
        async fn set_feature_state(&self, _: DocumentId, _: &str, _: FeatureState) -> Result<(), crate::utils::error::ApiError> { Ok(()) }
        async fn set_summary(&self, _: DocumentId, _: &str) -> Result<(), crate::utils::error::ApiError> { Ok(()) }
        async fn set_page_count(&self, _: DocumentId, _: i32) -> Result<(), crate::utils::error::ApiError> { Ok(()) }
        async fn get(&self, _: DocumentId) -> Result<Option<Document>, crate::utils::error::ApiError> {
            Ok(Some(self.0.clone()))
        }
        async fn list_for_owner(&self, _: i64) -> Result<Vec<Document>, crate::utils::error::ApiError> { Ok(vec![]) }
        async fn delete(&self, _: DocumentId) -> Result<(), crate::utils::error::ApiError> { Ok(()) }
    }

    #[tokio::test]
    async fn snapshot_reflects_repository_state_not_the_reported_task() {
        let doc_id = DocumentId::new();
        let doc = Document {
            id: doc_id,
            owner_id: 1,
            filename: "paper.pdf".into(),
            stored_blob_path: Some("x".into()),
            file_size: 10,
            content_hash: "abc".into(),
            status: DocumentStatus::Ready,
            feature_status: FeatureStatus::default(),
            page_count: Some(3),
            summary: None,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let repo = Arc::new(FakeRepo(doc));
        let broadcaster = Arc::new(StatusBroadcaster::new());
        let aggregator = StatusAggregator::new(repo, broadcaster);
        aggregator.notify_task_status(doc_id, TaskName::Embedding, TaskStatus::Completed).await;
        // No panic and the debounce map records the document.
        assert!(aggregator.last_aggregated.contains_key(&doc_id));
    }
}
