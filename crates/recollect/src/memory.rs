//! Core data model: messages, summaries, window fragments, memory records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle stage of a message. Transitions are strictly forward:
/// Active → Summarized → Archived, never backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Active,
    Summarized,
    Archived,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Active => "active",
            Tier::Summarized => "summarized",
            Tier::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Tier> {
        match s {
            "active" => Some(Tier::Active),
            "summarized" => Some(Tier::Summarized),
            "archived" => Some(Tier::Archived),
            _ => None,
        }
    }

    /// Whether `next` is a legal transition from `self`.
    pub fn can_transition_to(&self, next: Tier) -> bool {
        matches!(
            (self, next),
            (Tier::Active, Tier::Summarized) | (Tier::Summarized, Tier::Archived)
        )
    }
}

/// A single conversation message. Immutable once appended except for `tier`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub seq: i64,
    pub role: String,
    pub content: String,
    pub token_count: usize,
    pub tier: Tier,
    /// Set when tier leaves Active; the summary covering this message.
    pub summary_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(conversation_id: &str, seq: i64, role: &str, content: &str, token_count: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            seq,
            role: role.to_string(),
            content: content.to_string(),
            token_count,
            tier: Tier::Active,
            summary_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Compressed representation of a contiguous run of older content.
///
/// `level` 0 covers raw messages; level N covers level N-1 summaries.
/// `superseded_by` is set when a hierarchical merge folds this summary into a
/// higher-level one, at which point it no longer appears in context windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: String,
    pub conversation_id: String,
    pub level: i32,
    /// Ordered ids of the messages (level 0) or summaries (level > 0) covered.
    pub covered: Vec<String>,
    pub content: String,
    pub token_count: usize,
    pub superseded_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Summary {
    pub fn new(conversation_id: &str, level: i32, covered: Vec<String>, content: &str, token_count: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            level,
            covered,
            content: content.to_string(),
            token_count,
            superseded_by: None,
            created_at: Utc::now(),
        }
    }
}

/// One entry of a context window: either a live message or an un-superseded
/// summary standing in for the span it covers.
#[derive(Debug, Clone)]
pub enum Fragment {
    Message(Message),
    Summary(Summary),
}

impl Fragment {
    pub fn source_id(&self) -> &str {
        match self {
            Fragment::Message(m) => &m.id,
            Fragment::Summary(s) => &s.id,
        }
    }

    pub fn token_count(&self) -> usize {
        match self {
            Fragment::Message(m) => m.token_count,
            Fragment::Summary(s) => s.token_count,
        }
    }

    pub fn role(&self) -> &str {
        match self {
            Fragment::Message(m) => &m.role,
            Fragment::Summary(_) => "system",
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Fragment::Message(m) => &m.content,
            Fragment::Summary(s) => &s.content,
        }
    }
}

/// Transient, computed per build. Total never exceeds the budget.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    pub conversation_id: String,
    pub fragments: Vec<Fragment>,
    pub total_tokens: usize,
    /// True when older fragments were dropped to fit the budget.
    pub trimmed: bool,
}

/// Origin of an embedded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Message,
    Summary,
    DocumentChunk,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Message => "message",
            SourceType::Summary => "summary",
            SourceType::DocumentChunk => "document_chunk",
        }
    }

    pub fn parse(s: &str) -> Option<SourceType> {
        match s {
            "message" => Some(SourceType::Message),
            "summary" => Some(SourceType::Summary),
            "document_chunk" => Some(SourceType::DocumentChunk),
            _ => None,
        }
    }
}

/// An embedded fragment in the semantic index. Append-only: records persist
/// across tier transitions and are removed only when their source is deleted.
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub id: i64,
    pub source_type: SourceType,
    pub source_id: String,
    pub embedding: Vec<f32>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One entry of a composed per-turn context payload. Plain data, no
/// formatting imposed on the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub role: String,
    pub text: String,
    pub source_id: String,
}

/// Output of [`crate::engine::RetrievalComposer::compose`].
#[derive(Debug, Clone)]
pub struct ComposedContext {
    pub items: Vec<ContextItem>,
    /// True when the semantic path failed and only window content is present.
    pub degraded: bool,
}
