pub mod retriever;
pub mod tfidf;

pub use retriever::{RetrievalMode, RetrievedChunk, Retriever};
pub use tfidf::TfidfIndex;
