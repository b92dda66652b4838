
//! Summary storage and retrieval operations
use crate::memory::Summary;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::sync::Arc;
use tracing::debug;

pub struct SummaryStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SummaryStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn store(&self, summary: &Summary) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        debug!(
            "Storing level-{} summary {} for conversation {} ({} covered)",
            summary.level,
            summary.id,
            summary.conversation_id,
            summary.covered.len()
        );
        conn.execute(
            "INSERT INTO summaries
             (id, conversation_id, level, covered, content, token_count, superseded_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
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
        Ok(())
    }

    pub fn get(&self, summary_id: &str) -> anyhow::Result<Option<Summary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, level, covered, content, token_count, superseded_by, created_at
             FROM summaries WHERE id = ?1",
        )?;
        let mut rows = stmt.query([summary_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_summary(row)?)),
            None => Ok(None),
        }
    }

    /// Summaries that still stand in for their covered span, oldest first.
    pub fn unsuperseded(&self, conversation_id: &str) -> anyhow::Result<Vec<Summary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, level, covered, content, token_count, superseded_by, created_at
             FROM summaries WHERE conversation_id = ?1 AND superseded_by IS NULL
             ORDER BY created_at ASC, id ASC",
        )?;
        let mut rows = stmt.query([conversation_id])?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next()? {
            summaries.push(row_to_summary(row)?);
        }
        Ok(summaries)
    }

    pub fn unsuperseded_at_level(&self, conversation_id: &str, level: i32) -> anyhow::Result<Vec<Summary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, level, covered, content, token_count, superseded_by, created_at
             FROM summaries
             WHERE conversation_id = ?1 AND level = ?2 AND superseded_by IS NULL
             ORDER BY created_at ASC, id ASC",
        )?;
        let mut rows = stmt.query(params![conversation_id, level])?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next()? {
            summaries.push(row_to_summary(row)?);
        }
        Ok(summaries)
    }

    pub fn mark_superseded(&self, ids: &[String], superseded_by: &str) -> anyhow::Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let query = format!(
            "UPDATE summaries SET superseded_by = ? WHERE id IN ({}) AND superseded_by IS NULL",
            placeholders
        );
        let mut stmt = conn.prepare(&query)?;
        let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&superseded_by];
        for id in ids {
            bound.push(id);
        }
        let changed = stmt.execute(rusqlite::params_from_iter(bound))?;
        Ok(changed)
    }
}

pub(crate) fn row_to_summary(row: &Row) -> anyhow::Result<Summary> {
    let covered_json: String = row.get(3)?;
    let covered: Vec<String> = serde_json::from_str(&covered_json)
        .map_err(|e| anyhow::anyhow!("Failed to parse covered ids: {}", e))?;
    let created_at_str: String = row.get(7)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at_str)?.with_timezone(&Utc);
    let token_count: i64 = row.get(5)?;
    Ok(Summary {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        level: row.get(2)?,
        covered,
        content: row.get(4)?,
        token_count: token_count as usize,
        superseded_by: row.get(6)?,
        created_at,
    })
}
