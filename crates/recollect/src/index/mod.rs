
//! Semantic retrieval index over messages, summaries, and document chunks
pub mod embedding_index;
pub use embedding_index::{EmbeddingIndex, IndexStats, SearchHit};
