
//! Memory database module - SQLite-based storage for conversations, summaries, and embeddings
pub mod conversation_store;
pub mod schema;
pub mod summary_store;
pub use conversation_store::{ConversationStore, SqliteConversationStore};
pub use schema::DatabaseStats;
pub use summary_store::SummaryStore;

use crate::config::EmbeddingConfig;
use crate::index::EmbeddingIndex;
use crate::memory::Summary;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of the atomic tier-flip in [`MemoryDatabase::mark_summarized`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Applied { freed_tokens: i64 },
    /// One or more of the target messages was no longer Active.
    TierConflict,
}

pub struct MemoryDatabase {
    pub conversations: SqliteConversationStore,
    pub summaries: SummaryStore,
    pub index: EmbeddingIndex,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MemoryDatabase {
    pub fn new(db_path: &Path, embedding: &EmbeddingConfig) -> anyhow::Result<Self> {
        info!("Opening memory database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;
        Self::from_pool(pool, embedding)
    }

    /// Shared-cache in-memory database. The URI carries a unique name so
    /// every pooled connection sees the same database and instances stay
    /// isolated from each other; the pool keeps its connections open, which
    /// keeps the shared database alive.
    pub fn new_in_memory(embedding: &EmbeddingConfig) -> anyhow::Result<Self> {
        let uri = format!("file:recollect-{}?mode=memory&cache=shared", uuid::Uuid::new_v4());
        let manager = SqliteConnectionManager::file(&uri)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;
        Self::from_pool(pool, embedding)
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>, embedding: &EmbeddingConfig) -> anyhow::Result<Self> {
        {
            let conn = pool.get()?;
            conn.execute_batch(schema::SCHEMA_SQL)?;
        }
        let pool = Arc::new(pool);
        info!("Memory database initialized successfully");
        Ok(Self {
            conversations: SqliteConversationStore::new(Arc::clone(&pool)),
            summaries: SummaryStore::new(Arc::clone(&pool)),
            index: EmbeddingIndex::new(Arc::clone(&pool), embedding.clone()),
            pool,
        })
    }

    /// Atomically flip the given Active messages to Summarized and link them
    /// to `summary`, persisting the summary in the same transaction. This is
    /// the only tier mutation path out of Active.
    pub fn mark_summarized(
        &self,
        conversation_id: &str,
        message_ids: &[String],
        summary: &Summary,
    ) -> anyhow::Result<MarkOutcome> {
        if message_ids.is_empty() {
            return Ok(MarkOutcome::Applied { freed_tokens: 0 });
        }
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let placeholders = vec!["?"; message_ids.len()].join(",");
        let check_sql = format!(
            "SELECT COUNT(*), COALESCE(SUM(token_count), 0) FROM messages
             WHERE conversation_id = ? AND tier = 'active' AND id IN ({})",
            placeholders
        );
        let (active_count, freed_tokens): (i64, i64) = {
            let mut stmt = tx.prepare(&check_sql)?;
            let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&conversation_id];
            for id in message_ids {
                bound.push(id);
            }
            stmt.query_row(rusqlite::params_from_iter(bound), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
        };
        if active_count != message_ids.len() as i64 {
            return Ok(MarkOutcome::TierConflict);
        }

        tx.execute(
            "INSERT INTO summaries
             (id, conversation_id, level, covered, content, token_count, superseded_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                &summary.id,
                &summary.conversation_id,
                summary.level,
                serde_json::to_string(&summary.covered)?,
                &summary.content,
                summary.token_count as i64,
                summary.superseded_by,
                summary.created_at.to_rfc3339(),
            ],
        )?;

        let update_sql = format!(
            "UPDATE messages SET tier = 'summarized', summary_id = ? WHERE id IN ({})",
            placeholders
        );
        {
            let mut stmt = tx.prepare(&update_sql)?;
            let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&summary.id];
            for id in message_ids {
                bound.push(id);
            }
            let _ = stmt.execute(rusqlite::params_from_iter(bound))?;
        }

        tx.commit()?;
        debug!(
            "Marked {} messages summarized under {} ({} tokens freed)",
            message_ids.len(),
            summary.id,
            freed_tokens
        );
        Ok(MarkOutcome::Applied { freed_tokens })
    }

    /// Persist a hierarchical merge in one transaction: store the merged
    /// summary, mark the folded summaries superseded, and move the raw
    /// messages they covered from Summarized to Archived.
    pub fn apply_merge(
        &self,
        merged: &Summary,
        superseded_ids: &[String],
        archive_message_ids: &[String],
    ) -> anyhow::Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO summaries
             (id, conversation_id, level, covered, content, token_count, superseded_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                &merged.id,
                &merged.conversation_id,
                merged.level,
                serde_json::to_string(&merged.covered)?,
                &merged.content,
                merged.token_count as i64,
                merged.superseded_by,
                merged.created_at.to_rfc3339(),
            ],
        )?;

        if !superseded_ids.is_empty() {
            let placeholders = vec!["?"; superseded_ids.len()].join(",");
            let sql = format!("UPDATE summaries SET superseded_by = ? WHERE id IN ({})", placeholders);
            let mut stmt = tx.prepare(&sql)?;
            let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&merged.id];
            for id in superseded_ids {
                bound.push(id);
            }
            let _ = stmt.execute(rusqlite::params_from_iter(bound))?;
        }

        if !archive_message_ids.is_empty() {
            let placeholders = vec!["?"; archive_message_ids.len()].join(",");
            let sql = format!(
                "UPDATE messages SET tier = 'archived' WHERE tier = 'summarized' AND id IN ({})",
                placeholders
            );
            let mut stmt = tx.prepare(&sql)?;
            let bound: Vec<&dyn rusqlite::ToSql> =
                archive_message_ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
            let _ = stmt.execute(rusqlite::params_from_iter(bound))?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Delete a conversation and everything derived from it: messages and
    /// summaries via FK cascade, memory records by source id.
    pub fn delete_conversation(&self, conversation_id: &str) -> anyhow::Result<bool> {
        let mut sources: Vec<String> = self
            .conversations
            .message_ids(conversation_id)?
            .into_iter()
            .collect();
        {
            let conn = self.pool.get()?;
            let mut stmt = conn.prepare("SELECT id FROM summaries WHERE conversation_id = ?1")?;
            let summary_ids = stmt
                .query_map([conversation_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            sources.extend(summary_ids);
        }
        self.index.remove_sources(&sources)?;

        let conn = self.pool.get()?;
        let deleted = conn.execute("DELETE FROM conversations WHERE id = ?1", [conversation_id])?;
        info!(
            "Deleted conversation {} ({} dependent records removed)",
            conversation_id,
            sources.len()
        );
        Ok(deleted > 0)
    }

    pub fn get_stats(&self) -> anyhow::Result<DatabaseStats> {
        let conn = self.pool.get()?;
        let count = |sql: &str| -> anyhow::Result<i64> {
            Ok(conn.query_row(sql, [], |row| row.get(0))?)
        };
        Ok(DatabaseStats {
            total_conversations: count("SELECT COUNT(*) FROM conversations")?,
            total_messages: count("SELECT COUNT(*) FROM messages")?,
            total_summaries: count("SELECT COUNT(*) FROM summaries")?,
            total_records: count("SELECT COUNT(*) FROM memory_records")?,
        })
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}
