use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef, Postgres};
use sqlx::{Decode, Encode, Type};
use uuid::Uuid;

/// Opaque 96-bit identifier for a document, stored as `BYTEA` and rendered
/// as 24 hex characters everywhere else (URLs, JSON, logs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(pub [u8; 12]);

#[derive(Debug, thiserror::Error)]
#[error("invalid document id")]
pub struct DocumentIdParseError;

impl DocumentId {
    /// Generates a fresh id from the low 12 bytes of a random UUIDv4 -- this
    /// crate has no dedicated id-generation crate, and a UUIDv4's bytes are
    /// already cryptographically random, so truncating them is sufficient.
    pub fn new() -> Self {
        let full = Uuid::new_v4().into_bytes();
        let mut bytes = [0u8; 12];
        bytes.copy_from_slice(&full[0..12]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for DocumentId {
    type Err = DocumentIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = hex::decode(s).map_err(|_| DocumentIdParseError)?;
        let bytes: [u8; 12] = decoded.try_into().map_err(|_| DocumentIdParseError)?;
        Ok(Self(bytes))
    }
}

impl Serialize for DocumentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(|_| D::Error::custom("invalid document id, expected 24 hex characters"))
    }
}

impl Type<Postgres> for DocumentId {
    fn type_info() -> PgTypeInfo {
        <Vec<u8> as Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <Vec<u8> as Type<Postgres>>::compatible(ty)
    }
}

impl Encode<'_, Postgres> for DocumentId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        <Vec<u8> as Encode<Postgres>>::encode(self.0.to_vec(), buf)
    }
}

impl<'r> Decode<'r, Postgres> for DocumentId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let bytes = <Vec<u8> as Decode<Postgres>>::decode(value)?;
        let bytes: [u8; 12] = bytes
            .try_into()
            .map_err(|_| BoxDynError::from("document_id column did not contain 12 bytes"))?;
        Ok(Self(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploading,
    Parsing,
    Chunking,
    Embedding,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Parsing => "parsing",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureState {
    Pending,
    Running,
    Ready,
    Failed,
}

impl FeatureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

/// Per-feature readiness, read by the status aggregator to compose a snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeatureStatus {
    pub embedding: FeatureState,
    pub summary: FeatureState,
    pub reference: FeatureState,
    pub skimming: FeatureState,
}

impl Default for FeatureStatus {
    fn default() -> Self {
        Self {
            embedding: FeatureState::Pending,
            summary: FeatureState::Pending,
            reference: FeatureState::Pending,
            skimming: FeatureState::Pending,
        }
    }
}

impl FeatureStatus {
    pub fn all_ready(&self) -> bool {
        matches!(self.embedding, FeatureState::Ready)
            && matches!(self.summary, FeatureState::Ready)
            && matches!(self.reference, FeatureState::Ready)
            && matches!(self.skimming, FeatureState::Ready)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub owner_id: i64,
    pub filename: String,
    pub stored_blob_path: Option<String>,
    pub file_size: i64,
    pub content_hash: String,
    pub status: DocumentStatus,
    pub feature_status: FeatureStatus,
    pub page_count: Option<i32>,
    pub summary: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAsset {
    pub path: String,
    pub figure_id: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableAsset {
    pub markdown: String,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: DocumentId,
    pub ordinal: i32,
    pub page_number: Option<i32>,
    pub section_title: Option<String>,
    pub text: String,
    pub images: Vec<ImageAsset>,
    pub tables: Vec<TableAsset>,
}

impl Chunk {
    /// Content-addressed id: stable across re-ingestion of identical content.
    pub fn derive_id(document_id: DocumentId, ordinal: i32, text: &str) -> String {
        use sha2::{Digest, Sha256};
        let prefix: String = text.chars().take(500).collect();
        let mut hasher = Sha256::new();
        hasher.update(document_id.as_bytes());
        hasher.update(ordinal.to_le_bytes());
        hasher.update(prefix.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn from_str(raw: &str) -> Self {
        match raw {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            _ => Self::System,
        }
    }
}

/// A citation attached to an assistant turn. `label`/`number` are assigned
/// by renumbering `[cN]` markers in order of first appearance in the
/// rewritten answer text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub label: String,
    pub number: u32,
    pub document_id: DocumentId,
    pub section_title: Option<String>,
    pub page_number: Option<i32>,
    pub excerpt: String,
    pub full_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub owner_id: i64,
    pub document_id: DocumentId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: Role,
    pub content: String,
    pub citations: Vec<Citation>,
    pub confidence: Option<f32>,
    pub retriever_scores: Vec<f32>,
    pub user_image_paths: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied by the orchestrator when appending a turn; `id` and
/// `created_at` are assigned by the store so ordering is authoritative.
#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub role: Role,
    pub content: String,
    pub citations: Vec<Citation>,
    pub confidence: Option<f32>,
    pub retriever_scores: Vec<f32>,
    pub user_image_paths: Vec<String>,
}

impl NewChatMessage {
    pub fn user(content: impl Into<String>, user_image_paths: Vec<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            citations: Vec::new(),
            confidence: None,
            retriever_scores: Vec::new(),
            user_image_paths,
        }
    }

    pub fn assistant(
        content: impl Into<String>,
        citations: Vec<Citation>,
        confidence: f32,
        retriever_scores: Vec<f32>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            citations,
            confidence: Some(confidence),
            retriever_scores,
            user_image_paths: Vec::new(),
        }
    }
}
