
//! Summarization: compress the oldest Active run, then merge summary levels
use crate::engine::context_manager::ContextManager;
use crate::error::{EngineError, EngineResult};
use crate::memory::{Message, SourceType, Summary};
use crate::store::MemoryDatabase;
use crate::upstream::{EmbeddingClient, LlmClient, TokenCounter};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Prompt wrapped around the transcript handed to the completion backend.
/// Low temperature keeps the output factual rather than creative.
const SUMMARY_INSTRUCTION: &str = "Summarize the following conversation excerpt. \
Preserve concrete facts, decisions, names, and open questions. \
Write a compact prose summary with no preamble.";

const MERGE_INSTRUCTION: &str = "Merge the following summaries of consecutive \
spans of one conversation into a single summary. Preserve concrete facts, \
decisions, names, and open questions. Write compact prose with no preamble.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummarizeOutcome {
    /// A new summary was applied and the Active total reduced.
    Summarized {
        summary_id: String,
        freed_tokens: i64,
    },
    /// Another run holds the conversation's lock; this trigger is a no-op.
    Coalesced,
    /// The Active total is already at or below the target.
    NotNeeded,
    /// Transient upstream exhaustion; inputs untouched, next trigger retries.
    Deferred,
    /// The conversation was deleted mid-run; partial output discarded.
    Cancelled,
}

pub struct SummarizationEngine {
    db: Arc<MemoryDatabase>,
    manager: Arc<ContextManager>,
    llm: Arc<dyn LlmClient>,
    embedder: Arc<dyn EmbeddingClient>,
    counter: Arc<dyn TokenCounter>,
}

impl SummarizationEngine {
    pub fn new(
        db: Arc<MemoryDatabase>,
        manager: Arc<ContextManager>,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn EmbeddingClient>,
        counter: Arc<dyn TokenCounter>,
    ) -> Self {
        Self {
            db,
            manager,
            llm,
            embedder,
            counter,
        }
    }

    /// One summarization cycle: compress the oldest Active run until the
    /// projected total is at or below the target, then fold over-full summary
    /// levels upward. At most one run per conversation; concurrent triggers
    /// coalesce into [`SummarizeOutcome::Coalesced`].
    pub async fn summarize(&self, conversation_id: &str) -> EngineResult<SummarizeOutcome> {
        if self.manager.is_halted(conversation_id) {
            return Err(EngineError::InvariantViolation {
                conversation_id: conversation_id.to_string(),
                detail: "writes are halted after an earlier invariant violation".to_string(),
            });
        }
        let lock = self.manager.lock_for(conversation_id);
        let _exclusive = match lock.try_write_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Summarization already in flight for {}, coalescing", conversation_id);
                return Ok(SummarizeOutcome::Coalesced);
            }
        };
        let cancel = self.manager.cancel_flag(conversation_id);
        if cancel.load(Ordering::SeqCst) {
            return Ok(SummarizeOutcome::Cancelled);
        }

        let budget = self.manager.budget().clone();
        let active = self
            .db
            .conversations
            .active_messages(conversation_id)
            .map_err(EngineError::Storage)?;
        let total: usize = active.iter().map(|m| m.token_count).sum();
        if total <= budget.target_tokens() {
            return Ok(SummarizeOutcome::NotNeeded);
        }

        let victims = select_victims(&active, total, budget.target_tokens(), budget.min_recent_active);
        if victims.is_empty() {
            warn!(
                "Conversation {} over target ({} tokens) but nothing eligible to summarize",
                conversation_id, total
            );
            return Ok(SummarizeOutcome::NotNeeded);
        }

        let transcript = render_transcript(&victims);
        let summary_text = match self.llm.complete(SUMMARY_INSTRUCTION, &transcript).await {
            Ok(text) => text,
            Err(e) if e.is_transient() => {
                warn!(
                    "Summarization deferred for {}: upstream exhausted ({}); conversation stays over soft budget",
                    conversation_id, e
                );
                return Ok(SummarizeOutcome::Deferred);
            }
            Err(e) => return Err(EngineError::Upstream(e)),
        };

        if cancel.load(Ordering::SeqCst) {
            info!("Summarization for {} cancelled, discarding output", conversation_id);
            return Ok(SummarizeOutcome::Cancelled);
        }

        let summary_tokens = self
            .counter
            .count_tokens(&summary_text)
            .await
            .map_err(EngineError::Upstream)?;
        let victim_ids: Vec<String> = victims.iter().map(|m| m.id.clone()).collect();
        let summary = Summary::new(conversation_id, 0, victim_ids.clone(), &summary_text, summary_tokens);
        let freed = self
            .manager
            .mark_summarized(conversation_id, &victim_ids, &summary)?;
        info!(
            "Summarized {} messages in {} into {} ({} -> {} active tokens)",
            victim_ids.len(),
            conversation_id,
            summary.id,
            total,
            total.saturating_sub(freed as usize)
        );

        self.embed_summary(conversation_id, &summary).await;
        self.merge_levels(conversation_id, &cancel).await?;

        Ok(SummarizeOutcome::Summarized {
            summary_id: summary.id,
            freed_tokens: freed,
        })
    }

    /// Fold over-full levels upward: while a level holds more than
    /// fan_out_threshold live summaries, merge the oldest fan_out_threshold
    /// into one summary at the next level. Raw messages covered by folded
    /// level-0 summaries move to Archived.
    pub(crate) async fn merge_levels(
        &self,
        conversation_id: &str,
        cancel: &std::sync::atomic::AtomicBool,
    ) -> EngineResult<()> {
        let fan_out = self.manager.budget().fan_out_threshold;
        let mut level = 0i32;
        loop {
            let siblings = self
                .db
                .summaries
                .unsuperseded_at_level(conversation_id, level)
                .map_err(EngineError::Storage)?;
            if siblings.len() <= fan_out {
                if siblings.is_empty() {
                    return Ok(());
                }
                level += 1;
                continue;
            }
            if cancel.load(Ordering::SeqCst) {
                return Ok(());
            }

            let oldest: Vec<&Summary> = siblings.iter().take(fan_out).collect();
            let joined = oldest
                .iter()
                .map(|s| s.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            let merged_text = match self.llm.complete(MERGE_INSTRUCTION, &joined).await {
                Ok(text) => text,
                Err(e) if e.is_transient() => {
                    warn!(
                        "Level-{} merge deferred for {}: upstream exhausted ({})",
                        level, conversation_id, e
                    );
                    return Ok(());
                }
                Err(e) => return Err(EngineError::Upstream(e)),
            };
            let merged_tokens = self
                .counter
                .count_tokens(&merged_text)
                .await
                .map_err(EngineError::Upstream)?;

            let folded_ids: Vec<String> = oldest.iter().map(|s| s.id.clone()).collect();
            // Raw messages under folded level-0 summaries retire to Archived.
            let archive_ids: Vec<String> = if level == 0 {
                oldest.iter().flat_map(|s| s.covered.iter().cloned()).collect()
            } else {
                Vec::new()
            };
            let merged = Summary::new(conversation_id, level + 1, folded_ids.clone(), &merged_text, merged_tokens);
            self.db
                .apply_merge(&merged, &folded_ids, &archive_ids)
                .map_err(EngineError::Storage)?;
            info!(
                "Merged {} level-{} summaries in {} into {} (level {})",
                folded_ids.len(),
                level,
                conversation_id,
                merged.id,
                level + 1
            );
            self.embed_summary(conversation_id, &merged).await;
            // Re-check the same level: it may still be over the threshold.
        }
    }

    /// Index the summary for retrieval. Best-effort: the raw message records
    /// persisted at append time remain the authoritative fallback, so a
    /// failure here only costs recall, never correctness.
    async fn embed_summary(&self, conversation_id: &str, summary: &Summary) {
        match self.embedder.embed(&[summary.content.clone()]).await {
            Ok(vectors) if !vectors.is_empty() => {
                let metadata = serde_json::json!({
                    "conversation_id": conversation_id,
                    "role": "system",
                    "text": summary.content,
                    "level": summary.level,
                });
                if let Err(e) = self.db.index.upsert(SourceType::Summary, &summary.id, &vectors[0], metadata) {
                    warn!("Failed to index summary {}: {}", summary.id, e);
                }
            }
            Ok(_) => warn!("Empty embedding response for summary {}", summary.id),
            Err(e) => warn!("Failed to embed summary {}: {}", summary.id, e),
        }
    }
}

/// Oldest-first whole messages until the projected Active total is at or
/// below `target`, always keeping the newest `min_recent` messages.
fn select_victims(
    active: &[Message],
    total: usize,
    target: usize,
    min_recent: usize,
) -> Vec<Message> {
    let eligible = active.len().saturating_sub(min_recent);
    let mut victims = Vec::new();
    let mut projected = total;
    for message in active.iter().take(eligible) {
        if projected <= target {
            break;
        }
        projected -= message.token_count;
        victims.push(message.clone());
    }
    victims
}

fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}
