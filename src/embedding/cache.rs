//! On-disk embedding cache keyed by a hash over (document id, chunk
//! ordinal, first 500 characters of the chunk text). Stored as an
//! append-only JSON-lines file and loaded into memory at startup; this
//! keeps the dependency footprint to crates already in the stack
//! (`serde_json`, `sha2`) instead of pulling in an embedded database.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::store::models::DocumentId;

#[derive(Serialize, Deserialize)]
struct CacheRecord {
    key: String,
    vector: Vec<f32>,
}

pub struct EmbeddingCache {
    path: PathBuf,
    entries: Arc<DashMap<String, Vec<f32>>>,
    writer: Arc<Mutex<()>>,
}

impl EmbeddingCache {
    pub async fn load(path: PathBuf) -> Self {
        let entries = Arc::new(DashMap::new());
        if let Ok(contents) = tokio::fs::read_to_string(&path).await {
            for line in contents.lines() {
                if let Ok(record) = serde_json::from_str::<CacheRecord>(line) {
                    entries.insert(record.key, record.vector);
                }
            }
        }
        Self { path, entries, writer: Arc::new(Mutex::new(())) }
    }

    pub fn key(document_id: DocumentId, ordinal: i32, text: &str) -> String {
        let prefix: String = text.chars().take(500).collect();
        let mut hasher = Sha256::new();
        hasher.update(document_id.as_bytes());
        hasher.update(ordinal.to_le_bytes());
        hasher.update(prefix.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        self.entries.get(key).map(|v| v.clone())
    }

    pub async fn put(&self, key: String, vector: Vec<f32>) {
        self.entries.insert(key.clone(), vector.clone());
        let _guard = self.writer.lock().await;
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Ok(mut file) = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
        {
            let record = CacheRecord { key, vector };
            if let Ok(line) = serde_json::to_string(&record) {
                let _ = file.write_all(line.as_bytes()).await;
                let _ = file.write_all(b"\n").await;
            }
        }
    }
}
