
//! Upstream collaborators: completion backend, embedding backend, tokenizer
pub mod embedding_client;
pub mod llm_client;
pub mod retry;
pub mod tokenizer;

pub use embedding_client::{EmbeddingClient, HttpEmbeddingClient};
pub use llm_client::{HttpLlmClient, LlmClient};
pub use retry::with_retry;
pub use tokenizer::{HeuristicTokenCounter, HttpTokenCounter, TokenCounter};
