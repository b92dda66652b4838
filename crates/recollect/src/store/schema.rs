
//! Database schema definitions for the memory engine
use serde::{Deserialize, Serialize};

/// Row counts across the main tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub total_conversations: i64,
    pub total_messages: i64,
    pub total_summaries: i64,
    pub total_records: i64,
}

pub const SCHEMA_SQL: &str = "
-- Conversations table
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    title TEXT,
    created_at TIMESTAMP NOT NULL
);
-- Messages table
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    token_count INTEGER NOT NULL,
    tier TEXT NOT NULL DEFAULT 'active',
    summary_id TEXT,
    created_at TIMESTAMP NOT NULL,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    UNIQUE(conversation_id, seq)
);
-- Summaries table
CREATE TABLE IF NOT EXISTS summaries (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    level INTEGER NOT NULL,
    covered TEXT NOT NULL,
    content TEXT NOT NULL,
    token_count INTEGER NOT NULL,
    superseded_by TEXT,
    created_at TIMESTAMP NOT NULL,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
-- Memory records table (embedding index backing store)
CREATE TABLE IF NOT EXISTS memory_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_type TEXT NOT NULL,
    source_id TEXT NOT NULL,
    embedding BLOB NOT NULL,
    metadata TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL,
    UNIQUE(source_type, source_id)
);
-- Indexes for performance
CREATE INDEX IF NOT EXISTS idx_messages_conv_seq ON messages (conversation_id, seq);
CREATE INDEX IF NOT EXISTS idx_messages_conv_tier ON messages (conversation_id, tier);
CREATE INDEX IF NOT EXISTS idx_summaries_conv_level ON summaries (conversation_id, level);
CREATE INDEX IF NOT EXISTS idx_records_source ON memory_records (source_id);
";
