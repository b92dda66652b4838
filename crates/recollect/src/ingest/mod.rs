
//! Document ingestion: chunk, embed, and index external documents
pub mod chunker;
pub use chunker::chunk_text;

use crate::config::EmbeddingConfig;
use crate::error::{EngineError, EngineResult};
use crate::memory::SourceType;
use crate::store::MemoryDatabase;
use crate::upstream::EmbeddingClient;
use std::sync::Arc;
use tracing::{debug, info};

/// Turns raw document text into `document_chunk` memory records. Documents
/// are shared across conversations: their records carry no conversation id,
/// so every retrieval scope sees them. Connector-specific fetching lives
/// behind [`crate::connectors::DocumentConnector`]; this type only consumes
/// the text.
pub struct DocumentProcessor {
    db: Arc<MemoryDatabase>,
    embedder: Arc<dyn EmbeddingClient>,
    config: EmbeddingConfig,
}

impl DocumentProcessor {
    pub fn new(db: Arc<MemoryDatabase>, embedder: Arc<dyn EmbeddingClient>, config: EmbeddingConfig) -> Self {
        Self { db, embedder, config }
    }

    fn chunk_source_id(document_id: &str, index: usize) -> String {
        format!("{}#{}", document_id, index)
    }

    /// Ingest (or re-ingest) one document. Unchanged chunks are detected by
    /// content hash and skipped; stale trailing chunks from a longer previous
    /// version are removed. Returns the number of chunks embedded.
    pub async fn ingest_document(&self, document_id: &str, text: &str) -> EngineResult<usize> {
        let chunks = chunk_text(text, self.config.chunk_size, self.config.chunk_overlap);
        let total = chunks.len();

        let mut pending: Vec<(String, String, String)> = Vec::new();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let source_id = Self::chunk_source_id(document_id, index);
            let content_hash = blake3::hash(chunk.as_bytes()).to_hex().to_string();
            let unchanged = self
                .db
                .index
                .get(SourceType::DocumentChunk, &source_id)
                .map_err(EngineError::Storage)?
                .map(|record| {
                    record.metadata.get("content_hash").and_then(|v| v.as_str()) == Some(content_hash.as_str())
                })
                .unwrap_or(false);
            if unchanged {
                debug!("Chunk {} unchanged, skipping", source_id);
                continue;
            }
            pending.push((source_id, chunk, content_hash));
        }

        if !pending.is_empty() {
            let texts: Vec<String> = pending.iter().map(|(_, chunk, _)| chunk.clone()).collect();
            let vectors = self
                .embedder
                .embed(&texts)
                .await
                .map_err(EngineError::Upstream)?;
            for ((source_id, chunk, content_hash), vector) in pending.iter().zip(vectors.iter()) {
                let index = source_id
                    .rsplit('#')
                    .next()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(0);
                let metadata = serde_json::json!({
                    "document_id": document_id,
                    "chunk_index": index,
                    "total_chunks": total,
                    "text": chunk,
                    "content_hash": content_hash,
                });
                self.db
                    .index
                    .upsert(SourceType::DocumentChunk, source_id, vector, metadata)
                    .map_err(EngineError::Storage)?;
            }
        }

        let stale = self.trailing_chunk_ids(document_id, total)?;
        if !stale.is_empty() {
            self.db.index.remove_sources(&stale).map_err(EngineError::Storage)?;
        }
        info!(
            "Ingested document {}: {} chunks ({} embedded, {} stale removed)",
            document_id,
            total,
            pending.len(),
            stale.len()
        );
        Ok(pending.len())
    }

    /// Remove every indexed chunk of a document.
    pub fn remove_document(&self, document_id: &str) -> EngineResult<usize> {
        let ids = self.trailing_chunk_ids(document_id, 0)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = self.db.index.remove_sources(&ids).map_err(EngineError::Storage)?;
        info!("Removed document {} ({} chunks)", document_id, removed);
        Ok(removed)
    }

    /// Chunk source ids for `document_id` with index >= `from`, probed in
    /// order until the first gap. Chunk indices are dense, so the first
    /// missing index ends the document.
    fn trailing_chunk_ids(&self, document_id: &str, from: usize) -> EngineResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut index = from;
        loop {
            let source_id = Self::chunk_source_id(document_id, index);
            match self
                .db
                .index
                .get(SourceType::DocumentChunk, &source_id)
                .map_err(EngineError::Storage)?
            {
                Some(_) => {
                    ids.push(source_id);
                    index += 1;
                }
                None => break,
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        dimension: usize,
        texts_embedded: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingClient for CountingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, UpstreamError> {
            self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![0.5; self.dimension]).collect())
        }
    }

    fn processor() -> (DocumentProcessor, Arc<CountingEmbedder>) {
        let config = EmbeddingConfig {
            dimension: 4,
            chunk_size: 100,
            chunk_overlap: 20,
            ..Default::default()
        };
        let db = Arc::new(MemoryDatabase::new_in_memory(&config).unwrap());
        let embedder = Arc::new(CountingEmbedder {
            dimension: 4,
            texts_embedded: AtomicUsize::new(0),
        });
        (
            DocumentProcessor::new(db, Arc::clone(&embedder) as Arc<dyn EmbeddingClient>, config),
            embedder,
        )
    }

    // ===== Ingestion Tests =====

    #[tokio::test]
    async fn test_ingest_indexes_every_chunk() {
        let (processor, _) = processor();
        let text = "sentence one. ".repeat(30);
        let embedded = processor.ingest_document("doc1", &text).await.unwrap();
        assert!(embedded > 1);
        assert_eq!(processor.db.get_stats().unwrap().total_records as usize, embedded);
    }

    #[tokio::test]
    async fn test_reingest_unchanged_document_skips_embedding() {
        let (processor, embedder) = processor();
        let text = "sentence one. ".repeat(30);
        processor.ingest_document("doc1", &text).await.unwrap();
        let first_pass = embedder.texts_embedded.load(Ordering::SeqCst);

        let embedded = processor.ingest_document("doc1", &text).await.unwrap();
        assert_eq!(embedded, 0);
        assert_eq!(embedder.texts_embedded.load(Ordering::SeqCst), first_pass);
    }

    #[tokio::test]
    async fn test_reingest_shorter_document_drops_stale_chunks() {
        let (processor, _) = processor();
        let long = "sentence one. ".repeat(40);
        processor.ingest_document("doc1", &long).await.unwrap();
        let before = processor.db.get_stats().unwrap().total_records;

        processor.ingest_document("doc1", "tiny now").await.unwrap();
        let after = processor.db.get_stats().unwrap().total_records;
        assert_eq!(after, 1);
        assert!(before > after);
    }

    #[tokio::test]
    async fn test_remove_document_clears_chunks() {
        let (processor, _) = processor();
        let text = "sentence one. ".repeat(30);
        processor.ingest_document("doc1", &text).await.unwrap();
        let removed = processor.remove_document("doc1").unwrap();
        assert!(removed > 0);
        assert_eq!(processor.db.get_stats().unwrap().total_records, 0);
        assert_eq!(processor.remove_document("doc1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_document_is_a_no_op() {
        let (processor, embedder) = processor();
        assert_eq!(processor.ingest_document("doc1", "   ").await.unwrap(), 0);
        assert_eq!(embedder.texts_embedded.load(Ordering::SeqCst), 0);
    }
}
