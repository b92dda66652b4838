
//! Context engine: budget accounting, summarization, and retrieval composition
pub mod composer;
pub mod context_manager;
pub mod summarizer;

pub use composer::RetrievalComposer;
pub use context_manager::{ContextManager, ContextStats};
pub use summarizer::{SummarizationEngine, SummarizeOutcome};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::memory::{ComposedContext, ContextWindow, Message, SourceType};
use crate::store::{ConversationStore, MemoryDatabase};
use crate::upstream::{
    EmbeddingClient, HttpEmbeddingClient, HttpLlmClient, HttpTokenCounter, LlmClient, TokenCounter,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Facade over the engine components, wired by constructor injection.
pub struct MemoryEngine {
    db: Arc<MemoryDatabase>,
    manager: Arc<ContextManager>,
    summarizer: SummarizationEngine,
    composer: RetrievalComposer,
    embedder: Arc<dyn EmbeddingClient>,
    counter: Arc<dyn TokenCounter>,
}

impl MemoryEngine {
    pub fn new(
        db: Arc<MemoryDatabase>,
        config: &EngineConfig,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn EmbeddingClient>,
        counter: Arc<dyn TokenCounter>,
    ) -> Self {
        let manager = Arc::new(ContextManager::new(Arc::clone(&db), config.budget.clone()));
        let summarizer = SummarizationEngine::new(
            Arc::clone(&db),
            Arc::clone(&manager),
            Arc::clone(&llm),
            Arc::clone(&embedder),
            Arc::clone(&counter),
        );
        let composer = RetrievalComposer::new(
            Arc::clone(&db),
            Arc::clone(&manager),
            Arc::clone(&embedder),
            config.embedding.clone(),
        );
        info!("Memory engine initialized");
        Self {
            db,
            manager,
            summarizer,
            composer,
            embedder,
            counter,
        }
    }

    /// Wire the engine against HTTP upstream clients from configuration.
    pub fn from_config(db: Arc<MemoryDatabase>, config: &EngineConfig) -> Self {
        let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(config.upstream.clone()));
        let embedder: Arc<dyn EmbeddingClient> =
            Arc::new(HttpEmbeddingClient::new(config.upstream.clone(), &config.embedding));
        let counter: Arc<dyn TokenCounter> = Arc::new(HttpTokenCounter::new(&config.upstream));
        Self::new(db, config, llm, embedder, counter)
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }

    pub fn manager(&self) -> &Arc<ContextManager> {
        &self.manager
    }

    /// Append a message: persist it, index it for retrieval (best-effort),
    /// and account for its tokens. Returns the stored message and whether
    /// the conversation crossed the summarization trigger.
    pub async fn append_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
    ) -> EngineResult<(Message, bool)> {
        if self.manager.is_halted(conversation_id) {
            return Err(EngineError::InvariantViolation {
                conversation_id: conversation_id.to_string(),
                detail: "writes are halted after an earlier invariant violation".to_string(),
            });
        }
        let token_count = self
            .counter
            .count_tokens(content)
            .await
            .map_err(EngineError::Upstream)?;
        let seq = self
            .db
            .conversations
            .next_seq(conversation_id)
            .map_err(EngineError::Storage)?;
        let message = Message::new(conversation_id, seq, role, content, token_count);
        self.db
            .conversations
            .append(&message)
            .map_err(EngineError::Storage)?;

        // Index the raw message. Best-effort: retrieval is eventually
        // consistent and the message itself is already durable.
        match self.embedder.embed(&[content.to_string()]).await {
            Ok(vectors) if !vectors.is_empty() => {
                let metadata = serde_json::json!({
                    "conversation_id": conversation_id,
                    "role": role,
                    "text": content,
                });
                if let Err(e) = self
                    .db
                    .index
                    .upsert(SourceType::Message, &message.id, &vectors[0], metadata)
                {
                    warn!("Failed to index message {}: {}", message.id, e);
                }
            }
            Ok(_) => warn!("Empty embedding response for message {}", message.id),
            Err(e) => warn!("Failed to embed message {}: {}", message.id, e),
        }

        let triggered = self.manager.register(&message)?;
        Ok((message, triggered))
    }

    /// Run one summarization cycle if the conversation is over its soft
    /// budget. Concurrent calls for the same conversation coalesce.
    pub async fn summarize(&self, conversation_id: &str) -> EngineResult<SummarizeOutcome> {
        self.summarizer.summarize(conversation_id).await
    }

    pub async fn build_window(&self, conversation_id: &str) -> EngineResult<ContextWindow> {
        self.manager.build_window(conversation_id).await
    }

    pub async fn compose(&self, conversation_id: &str, user_query: &str) -> EngineResult<ComposedContext> {
        self.composer.compose(conversation_id, user_query).await
    }

    pub fn context_stats(&self, conversation_id: &str) -> EngineResult<ContextStats> {
        self.manager.get_context_stats(conversation_id)
    }

    /// Delete a conversation and everything derived from it. An in-flight
    /// summarization is signalled to cancel and waited out before the rows
    /// go away.
    pub async fn delete_conversation(&self, conversation_id: &str) -> EngineResult<bool> {
        self.manager.request_cancel(conversation_id);
        let lock = self.manager.lock_for(conversation_id);
        let _exclusive = lock.write().await;
        let existed = self
            .db
            .delete_conversation(conversation_id)
            .map_err(EngineError::Storage)?;
        self.manager.forget(conversation_id);
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingConfig, TokenBudget, UpstreamConfig};
    use crate::error::UpstreamError;
    use crate::memory::{Summary, Tier};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Completion stub: fixed reply after an optional delay, call-counted.
    struct ScriptedLlm {
        reply: String,
        delay: Duration,
        calls: AtomicUsize,
        fail_with: Option<UpstreamError>,
    }

    impl ScriptedLlm {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                fail_with: None,
            }
        }

        fn slow(reply: &str, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(reply)
            }
        }

        fn failing(error: UpstreamError) -> Self {
            Self {
                fail_with: Some(error),
                ..Self::new("")
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(self.reply.clone()),
            }
        }
    }

    /// Embedding stub: constant small vector, optionally failing.
    struct StubEmbedder {
        dimension: usize,
        fail: AtomicBool,
    }

    impl StubEmbedder {
        fn new(dimension: usize) -> Self {
            Self {
                dimension,
                fail: AtomicBool::new(false),
            }
        }

        fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl EmbeddingClient for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, UpstreamError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(UpstreamError::Transient("embedding backend down".to_string()));
            }
            Ok(texts.iter().map(|_| vec![0.5; self.dimension]).collect())
        }
    }

    /// One token per character, so message sizes are exact in tests.
    struct CharCounter;

    #[async_trait]
    impl TokenCounter for CharCounter {
        async fn count_tokens(&self, text: &str) -> Result<usize, UpstreamError> {
            Ok(text.chars().count())
        }
    }

    struct Harness {
        engine: MemoryEngine,
        llm: Arc<ScriptedLlm>,
        embedder: Arc<StubEmbedder>,
    }

    fn harness_with(budget: TokenBudget, llm: ScriptedLlm) -> Harness {
        let embedding = EmbeddingConfig {
            dimension: 4,
            ..Default::default()
        };
        let config = EngineConfig {
            budget,
            upstream: UpstreamConfig::default(),
            embedding: embedding.clone(),
        };
        let db = Arc::new(MemoryDatabase::new_in_memory(&embedding).unwrap());
        let llm = Arc::new(llm);
        let embedder = Arc::new(StubEmbedder::new(4));
        let engine = MemoryEngine::new(
            db,
            &config,
            Arc::clone(&llm) as Arc<dyn LlmClient>,
            Arc::clone(&embedder) as Arc<dyn EmbeddingClient>,
            Arc::new(CharCounter),
        );
        Harness { engine, llm, embedder }
    }

    fn thousand_token_budget() -> TokenBudget {
        TokenBudget {
            max_context_tokens: 1000,
            trigger_ratio: 0.8,
            target_ratio: 0.5,
            fan_out_threshold: 5,
            min_recent_active: 2,
        }
    }

    async fn push(engine: &MemoryEngine, conversation_id: &str, chars: usize) -> (Message, bool) {
        engine
            .append_message(conversation_id, "user", &"x".repeat(chars))
            .await
            .unwrap()
    }

    // ===== Budget Trigger Scenarios =====

    #[tokio::test]
    async fn test_soft_budget_breach_summarizes_down_to_target() {
        let h = harness_with(thousand_token_budget(), ScriptedLlm::new("older span summary"));
        let mut triggered = false;
        for _ in 0..8 {
            triggered = push(&h.engine, "c1", 100).await.1;
        }
        let (_, t) = push(&h.engine, "c1", 50).await;
        triggered |= t;
        assert!(triggered, "850 active tokens must cross the 800 trigger");

        let outcome = h.engine.summarize("c1").await.unwrap();
        assert!(matches!(outcome, SummarizeOutcome::Summarized { .. }));

        // Active total is back at or below the 500-token target
        let remaining = h.engine.database().conversations.active_token_total("c1").unwrap();
        assert!(remaining <= 500, "active total {} still over target", remaining);
        assert_eq!(h.engine.manager().active_tokens("c1"), remaining as usize);

        // Exactly one summary, covering the summarized messages oldest-first
        let summaries = h.engine.database().summaries.unsuperseded("c1").unwrap();
        assert_eq!(summaries.len(), 1);
        assert!(!summaries[0].covered.is_empty());
        assert_eq!(h.llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_summarize_below_target_is_not_needed() {
        let h = harness_with(thousand_token_budget(), ScriptedLlm::new("unused"));
        push(&h.engine, "c1", 100).await;
        let outcome = h.engine.summarize("c1").await.unwrap();
        assert_eq!(outcome, SummarizeOutcome::NotNeeded);
        assert_eq!(h.llm.call_count(), 0);
    }

    // ===== Oversized Message Scenario =====

    #[tokio::test]
    async fn test_single_oversized_message_overflows_window() {
        let h = harness_with(thousand_token_budget(), ScriptedLlm::new("unused"));
        push(&h.engine, "c1", 1200).await;
        let err = h.engine.build_window("c1").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::ContextOverflow { required: 1200, budget: 1000 }
        ));
    }

    // ===== Degraded Retrieval Scenario =====

    #[tokio::test]
    async fn test_embedding_failure_degrades_to_window_only() {
        let h = harness_with(thousand_token_budget(), ScriptedLlm::new("unused"));
        push(&h.engine, "c1", 50).await;
        push(&h.engine, "c1", 50).await;
        h.embedder.set_failing(true);

        let composed = h.engine.compose("c1", "what did we discuss?").await.unwrap();
        assert!(composed.degraded);
        assert_eq!(composed.items.len(), 2);
    }

    #[tokio::test]
    async fn test_compose_includes_semantic_hits_not_in_window() {
        let h = harness_with(thousand_token_budget(), ScriptedLlm::new("span summary"));
        // Fill past the trigger, then summarize so old messages leave the window
        for _ in 0..9 {
            push(&h.engine, "c1", 100).await;
        }
        h.engine.summarize("c1").await.unwrap();

        let composed = h.engine.compose("c1", "earlier topic").await.unwrap();
        assert!(!composed.degraded);
        // Summarized messages stay retrievable through their index records
        let window = h.engine.build_window("c1").await.unwrap();
        let window_ids: std::collections::HashSet<String> =
            window.fragments.iter().map(|f| f.source_id().to_string()).collect();
        assert!(composed.items.iter().any(|i| !window_ids.contains(&i.source_id)));
        // Nothing appears twice
        let mut seen = std::collections::HashSet::new();
        for item in &composed.items {
            assert!(seen.insert(item.source_id.clone()), "duplicate {}", item.source_id);
        }
    }

    // ===== Hierarchical Merge Scenario =====

    #[tokio::test]
    async fn test_six_level_zero_summaries_merge_five_oldest() {
        let h = harness_with(thousand_token_budget(), ScriptedLlm::new("merged summary"));
        let db = h.engine.database();
        db.conversations.ensure_conversation("c1", None).unwrap();
        let mut newest_id = String::new();
        for i in 0..6 {
            let mut s = Summary::new("c1", 0, vec![format!("m{}", i)], &format!("span {}", i), 10);
            s.created_at = chrono::Utc::now() - chrono::Duration::seconds(60 - i);
            newest_id = s.id.clone();
            db.summaries.store(&s).unwrap();
        }

        let cancel = AtomicBool::new(false);
        h.engine.summarizer.merge_levels("c1", &cancel).await.unwrap();

        let live = db.summaries.unsuperseded("c1").unwrap();
        assert_eq!(live.len(), 2);
        let levels: Vec<i32> = live.iter().map(|s| s.level).collect();
        assert!(levels.contains(&1), "expected a level-1 summary, got {:?}", levels);
        // The newest level-0 summary survives un-merged
        assert!(live.iter().any(|s| s.id == newest_id));
        let merged = live.iter().find(|s| s.level == 1).unwrap();
        assert_eq!(merged.covered.len(), 5);
        assert_eq!(h.llm.call_count(), 1);
    }

    // ===== Coalescing Scenario =====

    #[tokio::test]
    async fn test_concurrent_triggers_coalesce_to_one_run() {
        let h = harness_with(
            thousand_token_budget(),
            ScriptedLlm::slow("span summary", Duration::from_millis(100)),
        );
        for _ in 0..9 {
            push(&h.engine, "c1", 100).await;
        }
        let engine = Arc::new(h.engine);
        let a = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.summarize("c1").await.unwrap() })
        };
        let b = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.summarize("c1").await.unwrap() })
        };
        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());

        let summarized = [&ra, &rb]
            .iter()
            .filter(|o| matches!(o, SummarizeOutcome::Summarized { .. }))
            .count();
        let coalesced_or_skipped = [&ra, &rb]
            .iter()
            .filter(|o| matches!(o, SummarizeOutcome::Coalesced | SummarizeOutcome::NotNeeded))
            .count();
        assert_eq!(summarized, 1, "outcomes: {:?} / {:?}", ra, rb);
        assert_eq!(coalesced_or_skipped, 1);
        assert_eq!(h.llm.call_count(), 1, "upstream must be called exactly once");
    }

    // ===== Upstream Failure Scenarios =====

    #[tokio::test]
    async fn test_transient_exhaustion_defers_and_keeps_inputs() {
        let h = harness_with(
            thousand_token_budget(),
            ScriptedLlm::failing(UpstreamError::Transient("overloaded".to_string())),
        );
        for _ in 0..9 {
            push(&h.engine, "c1", 100).await;
        }
        let outcome = h.engine.summarize("c1").await.unwrap();
        assert_eq!(outcome, SummarizeOutcome::Deferred);

        // Every message still Active, nothing written
        let active = h.engine.database().conversations.active_messages("c1").unwrap();
        assert_eq!(active.len(), 9);
        assert!(h.engine.database().summaries.unsuperseded("c1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_surfaces() {
        let h = harness_with(
            thousand_token_budget(),
            ScriptedLlm::failing(UpstreamError::Permanent("bad auth".to_string())),
        );
        for _ in 0..9 {
            push(&h.engine, "c1", 100).await;
        }
        let err = h.engine.summarize("c1").await.unwrap_err();
        assert!(matches!(err, EngineError::Upstream(UpstreamError::Permanent(_))));
    }

    // ===== Deletion / Cancellation Scenarios =====

    #[tokio::test]
    async fn test_delete_cancels_in_flight_summarization() {
        let h = harness_with(
            thousand_token_budget(),
            ScriptedLlm::slow("span summary", Duration::from_millis(200)),
        );
        for _ in 0..9 {
            push(&h.engine, "c1", 100).await;
        }
        let engine = Arc::new(h.engine);
        let summarize_task = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.summarize("c1").await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let existed = engine.delete_conversation("c1").await.unwrap();
        assert!(existed);
        assert_eq!(summarize_task.await.unwrap(), SummarizeOutcome::Cancelled);

        assert!(engine.database().conversations.active_messages("c1").unwrap().is_empty());
        assert_eq!(engine.database().get_stats().unwrap().total_summaries, 0);
    }

    #[tokio::test]
    async fn test_delete_conversation_clears_index_records() {
        let h = harness_with(thousand_token_budget(), ScriptedLlm::new("span summary"));
        for _ in 0..9 {
            push(&h.engine, "c1", 100).await;
        }
        h.engine.summarize("c1").await.unwrap();
        assert!(h.engine.database().get_stats().unwrap().total_records > 0);

        h.engine.delete_conversation("c1").await.unwrap();
        assert_eq!(h.engine.database().get_stats().unwrap().total_records, 0);
    }

    // ===== Reachability Invariant =====

    #[tokio::test]
    async fn test_every_message_reachable_after_summarization() {
        let h = harness_with(thousand_token_budget(), ScriptedLlm::new("span summary"));
        for _ in 0..9 {
            push(&h.engine, "c1", 100).await;
        }
        h.engine.summarize("c1").await.unwrap();
        for _ in 0..6 {
            push(&h.engine, "c1", 100).await;
        }
        h.engine.summarize("c1").await.unwrap();

        let db = h.engine.database();
        let all = db.conversations.list("c1", -1).unwrap();
        assert_eq!(all.len(), 15);
        for message in all {
            match message.tier {
                Tier::Active => assert!(message.summary_id.is_none()),
                Tier::Summarized | Tier::Archived => {
                    let summary_id = message.summary_id.expect("non-active message must link a summary");
                    let summary = db.summaries.get(&summary_id).unwrap().expect("linked summary exists");
                    assert!(
                        summary.covered.contains(&message.id),
                        "summary {} does not cover message {}",
                        summary.id,
                        message.id
                    );
                }
            }
        }
    }

    // ===== Window Budget Property =====

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(16))]
        #[test]
        fn prop_window_never_exceeds_budget(sizes in proptest::collection::vec(1usize..=300, 1..30)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async {
                let h = harness_with(thousand_token_budget(), ScriptedLlm::new("span summary"));
                for size in &sizes {
                    push(&h.engine, "c1", *size).await;
                }
                let window = h.engine.build_window("c1").await.unwrap();
                assert!(window.total_tokens <= 1000);
            });
        }
    }
}
