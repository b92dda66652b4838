
//! Per-turn context composition: semantic recall plus the bounded window
use crate::config::EmbeddingConfig;
use crate::engine::context_manager::ContextManager;
use crate::error::EngineResult;
use crate::memory::{ComposedContext, ContextItem, MemoryRecord};
use crate::store::MemoryDatabase;
use crate::upstream::EmbeddingClient;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RetrievalComposer {
    db: Arc<MemoryDatabase>,
    manager: Arc<ContextManager>,
    embedder: Arc<dyn EmbeddingClient>,
    config: EmbeddingConfig,
    /// Query texts repeat across turns (follow-ups, regenerations); their
    /// embeddings are deterministic, so cache them.
    query_cache: moka::sync::Cache<String, Arc<Vec<f32>>>,
}

impl RetrievalComposer {
    pub fn new(
        db: Arc<MemoryDatabase>,
        manager: Arc<ContextManager>,
        embedder: Arc<dyn EmbeddingClient>,
        config: EmbeddingConfig,
    ) -> Self {
        let query_cache = moka::sync::Cache::builder()
            .max_capacity(512)
            .time_to_live(Duration::from_secs(600))
            .build();
        Self {
            db,
            manager,
            embedder,
            config,
            query_cache,
        }
    }

    /// Compose the payload for one turn: semantic hits for the query first,
    /// then the window fragments in order. Failure anywhere on the semantic
    /// path degrades to window-only with `degraded = true`; window failures
    /// still surface as errors.
    pub async fn compose(&self, conversation_id: &str, user_query: &str) -> EngineResult<ComposedContext> {
        let window = self.manager.build_window(conversation_id).await?;
        let window_ids: std::collections::HashSet<&str> =
            window.fragments.iter().map(|f| f.source_id()).collect();

        let mut degraded = false;
        let mut items: Vec<ContextItem> = Vec::new();

        match self.semantic_hits(conversation_id, user_query).await {
            Ok(hits) => {
                for record in hits {
                    if window_ids.contains(record.source_id.as_str()) {
                        continue;
                    }
                    if let Some(item) = record_to_item(&record) {
                        items.push(item);
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Semantic retrieval failed for {}, composing window-only: {}",
                    conversation_id, e
                );
                degraded = true;
            }
        }

        items.extend(window.fragments.iter().map(|f| ContextItem {
            role: f.role().to_string(),
            text: f.text().to_string(),
            source_id: f.source_id().to_string(),
        }));

        debug!(
            "Composed context for {}: {} items (degraded: {})",
            conversation_id,
            items.len(),
            degraded
        );
        Ok(ComposedContext { items, degraded })
    }

    async fn semantic_hits(&self, conversation_id: &str, user_query: &str) -> anyhow::Result<Vec<MemoryRecord>> {
        let query_vec = match self.query_cache.get(user_query) {
            Some(cached) => cached,
            None => {
                let vectors = self.embedder.embed(&[user_query.to_string()]).await?;
                let vector = vectors
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("empty embedding response for query"))?;
                let vector = Arc::new(vector);
                self.query_cache.insert(user_query.to_string(), Arc::clone(&vector));
                vector
            }
        };
        let hits = self
            .db
            .index
            .search(&query_vec, Some(conversation_id), self.config.max_results)?;
        Ok(hits.into_iter().map(|h| h.record).collect())
    }
}

/// Records indexed without a text payload cannot be rendered; skip them.
fn record_to_item(record: &MemoryRecord) -> Option<ContextItem> {
    let text = record.metadata.get("text")?.as_str()?.to_string();
    let role = record
        .metadata
        .get("role")
        .and_then(|v| v.as_str())
        .unwrap_or("system")
        .to_string();
    Some(ContextItem {
        role,
        text,
        source_id: record.source_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn record(source_id: &str, metadata: serde_json::Value) -> MemoryRecord {
        MemoryRecord {
            id: 1,
            source_type: crate::memory::SourceType::Message,
            source_id: source_id.to_string(),
            embedding: vec![0.0; 4],
            metadata,
            created_at: Utc::now(),
        }
    }

    // ===== Record Rendering Tests =====

    #[test]
    fn test_record_with_text_and_role_renders() {
        let r = record("m1", json!({"text": "hello", "role": "user"}));
        let item = record_to_item(&r).unwrap();
        assert_eq!(item.role, "user");
        assert_eq!(item.text, "hello");
        assert_eq!(item.source_id, "m1");
    }

    #[test]
    fn test_record_without_role_defaults_to_system() {
        let r = record("s1", json!({"text": "summary text"}));
        assert_eq!(record_to_item(&r).unwrap().role, "system");
    }

    #[test]
    fn test_record_without_text_is_skipped() {
        let r = record("m1", json!({"role": "user"}));
        assert!(record_to_item(&r).is_none());
    }
}
