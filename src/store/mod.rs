pub mod blob;
pub mod chat;
pub mod chunks;
pub mod documents;
pub mod models;
pub mod pool;
pub mod vectors;

pub use blob::{BlobStore, FsBlobStore};
pub use chat::{ChatSessionStore, PgChatSessionStore};
pub use chunks::{ChunkStore, PgChunkStore};
pub use documents::{DocumentRepository, PgDocumentRepository};
pub use pool::DbPool;
pub use vectors::{PgVectorIndex, VectorIndex};
