
//! Budget accounting, window building, and per-conversation coordination
use crate::config::TokenBudget;
use crate::error::{EngineError, EngineResult};
use crate::memory::{ContextWindow, Fragment, Message, Summary};
use crate::store::{MarkOutcome, MemoryDatabase};
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Utilization snapshot for one conversation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContextStats {
    pub conversation_id: String,
    pub active_tokens: usize,
    pub max_context_tokens: usize,
    pub utilization_percent: f32,
    /// "healthy" below 70% utilization, "warning" below 90%, "critical" above.
    pub status: &'static str,
    pub active_messages: usize,
    pub live_summaries: usize,
}

/// Running Active-token total plus the highest seq folded into it. The seed
/// query covers every message persisted so far, so increments apply only to
/// messages newer than the seed.
struct TokenLedger {
    tokens: usize,
    seen_seq: i64,
}

/// Tracks the running Active token total per conversation and builds bounded
/// context windows. Also owns the per-conversation coordination state: the
/// summarization lock, the deletion cancel flag, and the halt list for
/// conversations with a detected invariant violation.
pub struct ContextManager {
    db: Arc<MemoryDatabase>,
    budget: TokenBudget,
    token_totals: DashMap<String, TokenLedger>,
    locks: DashMap<String, Arc<RwLock<()>>>,
    cancel_flags: DashMap<String, Arc<AtomicBool>>,
    halted: DashSet<String>,
}

impl ContextManager {
    pub fn new(db: Arc<MemoryDatabase>, budget: TokenBudget) -> Self {
        Self {
            db,
            budget,
            token_totals: DashMap::new(),
            locks: DashMap::new(),
            cancel_flags: DashMap::new(),
            halted: DashSet::new(),
        }
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    /// The shared summarization lock for a conversation. Writers
    /// (summarization, deletion) take it exclusively; window builds take it
    /// shared so they observe no half-applied tier flips.
    pub fn lock_for(&self, conversation_id: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Cooperative cancellation flag, set by conversation deletion and
    /// checked by in-flight summarization.
    pub fn cancel_flag(&self, conversation_id: &str) -> Arc<AtomicBool> {
        self.cancel_flags
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    pub fn is_halted(&self, conversation_id: &str) -> bool {
        self.halted.contains(conversation_id)
    }

    /// Stop accepting writes for a conversation after an invariant violation.
    /// Never undone automatically.
    pub fn halt(&self, conversation_id: &str, detail: &str) {
        warn!("Halting writes for conversation {}: {}", conversation_id, detail);
        self.halted.insert(conversation_id.to_string());
    }

    fn refuse_if_halted(&self, conversation_id: &str) -> EngineResult<()> {
        if self.is_halted(conversation_id) {
            return Err(EngineError::InvariantViolation {
                conversation_id: conversation_id.to_string(),
                detail: "writes are halted after an earlier invariant violation".to_string(),
            });
        }
        Ok(())
    }

    /// Account for an already-appended message and report whether the
    /// conversation crossed the summarization trigger. O(1) after the first
    /// call per conversation; the first call seeds the counter from storage.
    pub fn register(&self, message: &Message) -> EngineResult<bool> {
        self.refuse_if_halted(&message.conversation_id)?;
        let total = match self.token_totals.entry(message.conversation_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let ledger = entry.get_mut();
                // Messages at or below the watermark are already in the
                // total, either from the seed or an earlier register.
                if message.seq > ledger.seen_seq {
                    ledger.tokens += message.token_count;
                    ledger.seen_seq = message.seq;
                }
                ledger.tokens
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                // The message is already persisted, so the stored total
                // includes it along with everything appended before it.
                let seeded = self
                    .db
                    .conversations
                    .active_token_total(&message.conversation_id)
                    .map_err(EngineError::Storage)? as usize;
                let seen_seq = self
                    .db
                    .conversations
                    .next_seq(&message.conversation_id)
                    .map_err(EngineError::Storage)?
                    - 1;
                entry.insert(TokenLedger { tokens: seeded, seen_seq });
                seeded
            }
        };
        let triggered = total >= self.budget.trigger_tokens();
        if triggered {
            debug!(
                "Conversation {} at {} active tokens (trigger {})",
                message.conversation_id,
                total,
                self.budget.trigger_tokens()
            );
        }
        Ok(triggered)
    }

    pub fn active_tokens(&self, conversation_id: &str) -> usize {
        self.token_totals.get(conversation_id).map(|v| v.tokens).unwrap_or(0)
    }

    /// Apply a summary through the single tier-mutation path and keep the
    /// running counter in sync. A tier conflict means some other path touched
    /// the tiers; that is fatal for the conversation.
    pub fn mark_summarized(
        &self,
        conversation_id: &str,
        message_ids: &[String],
        summary: &Summary,
    ) -> EngineResult<i64> {
        self.refuse_if_halted(conversation_id)?;
        match self
            .db
            .mark_summarized(conversation_id, message_ids, summary)
            .map_err(EngineError::Storage)?
        {
            MarkOutcome::Applied { freed_tokens } => {
                if let Some(mut ledger) = self.token_totals.get_mut(conversation_id) {
                    ledger.tokens = ledger.tokens.saturating_sub(freed_tokens as usize);
                }
                Ok(freed_tokens)
            }
            MarkOutcome::TierConflict => {
                let detail = "summarization targeted messages that are no longer Active";
                self.halt(conversation_id, detail);
                Err(EngineError::InvariantViolation {
                    conversation_id: conversation_id.to_string(),
                    detail: detail.to_string(),
                })
            }
        }
    }

    /// Build the bounded window: un-superseded summaries (oldest coverage
    /// first), then Active messages in order. When the total exceeds the
    /// budget the oldest fragments are dropped first; a window whose newest
    /// fragment alone exceeds the budget is a hard overflow.
    pub async fn build_window(&self, conversation_id: &str) -> EngineResult<ContextWindow> {
        let lock = self.lock_for(conversation_id);
        let _shared = lock.read().await;

        let summaries = self
            .db
            .summaries
            .unsuperseded(conversation_id)
            .map_err(EngineError::Storage)?;
        let messages = self
            .db
            .conversations
            .active_messages(conversation_id)
            .map_err(EngineError::Storage)?;

        let mut fragments: Vec<Fragment> = Vec::with_capacity(summaries.len() + messages.len());
        fragments.extend(summaries.into_iter().map(Fragment::Summary));
        fragments.extend(messages.into_iter().map(Fragment::Message));

        let mut total: usize = fragments.iter().map(Fragment::token_count).sum();
        let mut trimmed = false;
        let mut start = 0;
        while total > self.budget.max_context_tokens && start + 1 < fragments.len() {
            total -= fragments[start].token_count();
            start += 1;
            trimmed = true;
        }
        if total > self.budget.max_context_tokens {
            return Err(EngineError::ContextOverflow {
                required: total,
                budget: self.budget.max_context_tokens,
            });
        }
        let fragments = fragments.split_off(start);

        if trimmed {
            info!(
                "Window for {} trimmed to {} fragments ({} tokens)",
                conversation_id,
                fragments.len(),
                total
            );
        }
        Ok(ContextWindow {
            conversation_id: conversation_id.to_string(),
            fragments,
            total_tokens: total,
            trimmed,
        })
    }

    pub fn get_context_stats(&self, conversation_id: &str) -> EngineResult<ContextStats> {
        let active_tokens = match self.token_totals.get(conversation_id) {
            Some(ledger) => ledger.tokens,
            None => self
                .db
                .conversations
                .active_token_total(conversation_id)
                .map_err(EngineError::Storage)? as usize,
        };
        let active_messages = self
            .db
            .conversations
            .active_messages(conversation_id)
            .map_err(EngineError::Storage)?
            .len();
        let live_summaries = self
            .db
            .summaries
            .unsuperseded(conversation_id)
            .map_err(EngineError::Storage)?
            .len();
        let utilization_percent =
            (active_tokens as f32 / self.budget.max_context_tokens as f32) * 100.0;
        let status = if utilization_percent < 70.0 {
            "healthy"
        } else if utilization_percent < 90.0 {
            "warning"
        } else {
            "critical"
        };
        Ok(ContextStats {
            conversation_id: conversation_id.to_string(),
            active_tokens,
            max_context_tokens: self.budget.max_context_tokens,
            utilization_percent,
            status,
            active_messages,
            live_summaries,
        })
    }

    /// Drop all in-memory coordination state for a deleted conversation.
    pub fn forget(&self, conversation_id: &str) {
        self.token_totals.remove(conversation_id);
        self.locks.remove(conversation_id);
        self.cancel_flags.remove(conversation_id);
        self.halted.remove(conversation_id);
    }

    /// Signal an in-flight summarization to discard its output.
    pub fn request_cancel(&self, conversation_id: &str) {
        self.cancel_flag(conversation_id).store(true, Ordering::SeqCst);
    }
}
