
//! Conversation message storage and retrieval operations
use crate::memory::{Message, Tier};
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Durable append-only message log. The engine queries it but does not own
/// the conversation lifecycle; callers append, the engine reads and flips
/// tiers through [`crate::store::MemoryDatabase::mark_summarized`].
pub trait ConversationStore: Send + Sync {
    fn append(&self, message: &Message) -> anyhow::Result<()>;
    /// Messages with `seq > since_seq`, ordered by seq ascending.
    fn list(&self, conversation_id: &str, since_seq: i64) -> anyhow::Result<Vec<Message>>;
    fn update_tier(&self, ids: &[String], tier: Tier, summary_id: Option<&str>) -> anyhow::Result<usize>;
}

pub struct SqliteConversationStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqliteConversationStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Create the conversation row if it does not exist yet.
    pub fn ensure_conversation(&self, conversation_id: &str, title: Option<&str>) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO conversations (id, title, created_at) VALUES (?1, ?2, ?3)",
            params![conversation_id, title, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get(&self, message_id: &str) -> anyhow::Result<Option<Message>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, seq, role, content, token_count, tier, summary_id, created_at
             FROM messages WHERE id = ?1",
        )?;
        let mut rows = stmt.query([message_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_message(row)?)),
            None => Ok(None),
        }
    }

    /// Active messages in chronological order.
    pub fn active_messages(&self, conversation_id: &str) -> anyhow::Result<Vec<Message>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, seq, role, content, token_count, tier, summary_id, created_at
             FROM messages WHERE conversation_id = ?1 AND tier = 'active'
             ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query([conversation_id])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(row_to_message(row)?);
        }
        Ok(messages)
    }

    /// Token total over Active messages. Used once to seed the incremental
    /// counter; never called on the register hot path afterward.
    pub fn active_token_total(&self, conversation_id: &str) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(token_count), 0) FROM messages
             WHERE conversation_id = ?1 AND tier = 'active'",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// All message ids of a conversation, regardless of tier.
    pub fn message_ids(&self, conversation_id: &str) -> anyhow::Result<HashSet<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT id FROM messages WHERE conversation_id = ?1")?;
        let ids = stmt
            .query_map([conversation_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(ids)
    }

    pub fn next_seq(&self, conversation_id: &str) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), -1) FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(max + 1)
    }
}

impl ConversationStore for SqliteConversationStore {
    fn append(&self, message: &Message) -> anyhow::Result<()> {
        self.ensure_conversation(&message.conversation_id, None)?;
        let conn = self.get_conn()?;
        debug!(
            "Appending message {} (seq {}) to conversation {}",
            message.id, message.seq, message.conversation_id
        );
        conn.execute(
            "INSERT INTO messages
             (id, conversation_id, seq, role, content, token_count, tier, summary_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &message.id,
                &message.conversation_id,
                message.seq,
                &message.role,
                &message.content,
                message.token_count as i64,
                message.tier.as_str(),
                message.summary_id,
                message.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn list(&self, conversation_id: &str, since_seq: i64) -> anyhow::Result<Vec<Message>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, seq, role, content, token_count, tier, summary_id, created_at
             FROM messages WHERE conversation_id = ?1 AND seq > ?2
             ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query(params![conversation_id, since_seq])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(row_to_message(row)?);
        }
        Ok(messages)
    }

    fn update_tier(&self, ids: &[String], tier: Tier, summary_id: Option<&str>) -> anyhow::Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; ids.len()].join(",");

        // Tiers only move forward; refuse the whole batch on any illegal step
        let select = format!("SELECT id, tier FROM messages WHERE id IN ({})", placeholders);
        let current_tiers: Vec<(String, String)> = {
            let mut stmt = conn.prepare(&select)?;
            let bound: Vec<&dyn rusqlite::ToSql> =
                ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
            let rows = stmt
                .query_map(rusqlite::params_from_iter(bound), |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        for (id, tier_str) in &current_tiers {
            let current = Tier::parse(tier_str)
                .ok_or_else(|| anyhow::anyhow!("Unknown tier value in database: {}", tier_str))?;
            if !current.can_transition_to(tier) {
                anyhow::bail!(
                    "Illegal tier transition {} -> {} for message {}",
                    current.as_str(),
                    tier.as_str(),
                    id
                );
            }
        }

        let query = format!(
            "UPDATE messages SET tier = '{}', summary_id = COALESCE(?, summary_id)
             WHERE id IN ({})",
            tier.as_str(),
            placeholders
        );
        let mut stmt = conn.prepare(&query)?;
        let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&summary_id];
        for id in ids {
            bound.push(id);
        }
        let changed = stmt.execute(rusqlite::params_from_iter(bound))?;
        Ok(changed)
    }
}

pub(crate) fn row_to_message(row: &Row) -> anyhow::Result<Message> {
    let tier_str: String = row.get(6)?;
    let tier = Tier::parse(&tier_str)
        .ok_or_else(|| anyhow::anyhow!("Unknown tier value in database: {}", tier_str))?;
    let created_at_str: String = row.get(8)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at_str)?.with_timezone(&Utc);
    let token_count: i64 = row.get(5)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        seq: row.get(2)?,
        role: row.get(3)?,
        content: row.get(4)?,
        token_count: token_count as usize,
        tier,
        summary_id: row.get(7)?,
        created_at,
    })
}
