// recollect/crates/recollect/src/lib.rs

pub mod config;
pub mod connectors;
pub mod engine;
pub mod error;
pub mod index;
pub mod ingest;
pub mod memory;
pub mod store;
pub mod telemetry;
pub mod upstream;

// Public API exports
pub use config::{EmbeddingConfig, EngineConfig, TokenBudget, UpstreamConfig};
pub use engine::{ContextManager, ContextStats, MemoryEngine, RetrievalComposer, SummarizationEngine, SummarizeOutcome};
pub use error::{EngineError, EngineResult, UpstreamError};
pub use memory::{ComposedContext, ContextItem, ContextWindow, Fragment, MemoryRecord, Message, SourceType, Summary, Tier};
pub use store::{ConversationStore, DatabaseStats, MemoryDatabase};

pub use connectors::{ConnectorRegistry, DocumentConnector};
pub use index::{EmbeddingIndex, SearchHit};
pub use ingest::DocumentProcessor;
pub use upstream::{EmbeddingClient, LlmClient, TokenCounter};
