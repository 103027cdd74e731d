//! Per-document WebSocket connection fan-out. Grounded on a Python
//! websocket manager that kept a `document_id -> set<connection>` map
//! guarded by a lock, wrote to every connection and pruned ones that
//! failed the write; this carries the same shape over axum's `ws` feature.

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::SinkExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::status::aggregator::StatusSnapshot;
use crate::store::models::DocumentId;

type Sender = SplitSink<WebSocket, Message>;

pub struct StatusBroadcaster {
    connections: DashMap<DocumentId, DashMap<u64, Arc<Mutex<Sender>>>>,
    next_id: AtomicU64,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self { connections: DashMap::new(), next_id: AtomicU64::new(1) }
    }

    pub fn register(&self, document_id: DocumentId, sender: Sender) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.connections
            .entry(document_id)
            .or_default()
            .insert(id, Arc::new(Mutex::new(sender)));
        id
    }

    pub fn disconnect(&self, document_id: DocumentId, connection_id: u64) {
        if let Some(set) = self.connections.get(&document_id) {
            set.remove(&connection_id);
        }
    }

    pub async fn send_status(&self, document_id: DocumentId, snapshot: &StatusSnapshot) {
        let Ok(payload) = serde_json::to_string(snapshot) else {
            return;
        };
        self.fan_out(document_id, payload).await;
    }

    /// Publishes the `{type: "chat", ...}` event fired when an answer is
    /// ready, over the same per-document connection set as status snapshots.
    pub async fn send_chat_event(&self, document_id: DocumentId, session_id: Uuid, status: &str) {
        let payload = serde_json::json!({
            "type": "chat",
            "session_id": session_id,
            "status": status,
            "document_id": document_id,
        });
        let Ok(payload) = serde_json::to_string(&payload) else {
            return;
        };
        self.fan_out(document_id, payload).await;
    }

    async fn fan_out(&self, document_id: DocumentId, payload: String) {
        let Some(set) = self.connections.get(&document_id) else {
            return;
        };

        let mut failed = Vec::new();
        for entry in set.iter() {
            let (conn_id, sender) = (*entry.key(), entry.value().clone());
            let mut guard = sender.lock().await;
            if guard.send(Message::Text(payload.clone().into())).await.is_err() {
                failed.push(conn_id);
            }
        }
        drop(set);

        if !failed.is_empty() {
            if let Some(set) = self.connections.get(&document_id) {
                for id in failed {
                    set.remove(&id);
                }
            }
            debug!("pruned dead websocket connections for document {document_id}");
        }
    }
}
