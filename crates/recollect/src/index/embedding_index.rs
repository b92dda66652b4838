
//! Embedding storage and similarity search with ANN indexing support
use crate::config::EmbeddingConfig;
use crate::memory::{MemoryRecord, SourceType};
use chrono::{DateTime, Utc};
use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexStats {
    pub total_records: usize,
    pub dimension: usize,
    pub index_type: String,
}

/// A scored index match. Scores are cosine similarity in [-1, 1].
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: MemoryRecord,
    pub score: f32,
}

/// Similarity index over derived memory records. SQLite is the source of
/// truth; the HNSW structure and the embedding cache are rebuildable
/// acceleration state.
pub struct EmbeddingIndex {
    pool: Arc<Pool<SqliteConnectionManager>>,
    config: EmbeddingConfig,
    ann_index: RwLock<Option<HNSWIndex<f32, i64>>>,
    embedding_cache: RwLock<HashMap<i64, Vec<f32>>>,
}

impl EmbeddingIndex {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>, config: EmbeddingConfig) -> Self {
        Self {
            pool,
            config,
            ann_index: RwLock::new(None),
            embedding_cache: RwLock::new(HashMap::new()),
        }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Load every persisted record and (re)build the ANN structure.
    pub fn initialize(&self) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT id, embedding FROM memory_records")?;
        let mut rows = stmt.query([])?;

        let mut cache = self.embedding_cache.write().unwrap();
        cache.clear();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let embedding_bytes: Vec<u8> = row.get(1)?;
            let embedding: Vec<f32> = bincode::deserialize(&embedding_bytes)
                .map_err(|e| anyhow::anyhow!("Deserialization error: {}", e))?;
            cache.insert(id, embedding);
        }

        let index = build_hnsw(self.config.dimension, &cache)?;
        *self.ann_index.write().unwrap() = Some(index);
        info!("ANN index initialized with {} records", cache.len());
        Ok(())
    }

    /// Insert or replace the record for `(source_type, source_id)`. Retrying
    /// the same upsert is a no-op apart from refreshing the stored vector.
    pub fn upsert(
        &self,
        source_type: SourceType,
        source_id: &str,
        embedding: &[f32],
        metadata: serde_json::Value,
    ) -> anyhow::Result<i64> {
        if embedding.len() != self.config.dimension {
            return Err(anyhow::anyhow!(
                "Embedding dimension mismatch: got {}, index expects {}",
                embedding.len(),
                self.config.dimension
            ));
        }
        let embedding_bytes = bincode::serialize(embedding)?;
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO memory_records (source_type, source_id, embedding, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(source_type, source_id)
             DO UPDATE SET embedding = excluded.embedding, metadata = excluded.metadata",
            params![
                source_type.as_str(),
                source_id,
                embedding_bytes,
                serde_json::to_string(&metadata)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let record_id: i64 = conn.query_row(
            "SELECT id FROM memory_records WHERE source_type = ?1 AND source_id = ?2",
            params![source_type.as_str(), source_id],
            |row| row.get(0),
        )?;

        let mut cache = self.embedding_cache.write().unwrap();
        cache.insert(record_id, embedding.to_vec());
        if self.ann_index.read().unwrap().is_some() {
            // hora has no in-place update or delete, so fold the change in
            // by rebuilding from the cache.
            let index = build_hnsw(self.config.dimension, &cache)?;
            *self.ann_index.write().unwrap() = Some(index);
        }
        debug!("Upserted {} record for source {}", source_type.as_str(), source_id);
        Ok(record_id)
    }

    /// Similarity search scoped to one conversation. Records whose metadata
    /// carries no conversation id (document chunks) are shared and always
    /// eligible. Results are filtered by the relevance threshold, ordered by
    /// score descending with newer records winning ties, and capped at
    /// `limit`.
    pub fn search(
        &self,
        query_embedding: &[f32],
        conversation_id: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<SearchHit>> {
        if query_embedding.len() != self.config.dimension {
            return Err(anyhow::anyhow!(
                "Query dimension mismatch: got {}, index expects {}",
                query_embedding.len(),
                self.config.dimension
            ));
        }
        let candidate_ids: Option<Vec<i64>> = {
            let index_guard = self.ann_index.read().unwrap();
            index_guard.as_ref().map(|index| {
                // Over-fetch so scope and threshold filtering still leaves
                // enough survivors.
                index.search(query_embedding, (limit * 4).max(32))
            })
        };

        let records = match candidate_ids {
            Some(ids) => self.load_records(&ids)?,
            None => {
                warn!("ANN index not available, falling back to linear scan");
                self.load_all_records()?
            }
        };

        let mut hits: Vec<SearchHit> = records
            .into_iter()
            .filter(|record| in_scope(record, conversation_id))
            .map(|record| {
                let score = cosine_similarity(query_embedding, &record.embedding);
                SearchHit { record, score }
            })
            .filter(|hit| hit.score >= self.config.relevance_threshold)
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.record.created_at.cmp(&a.record.created_at))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// Drop every record derived from the given source ids and rebuild the
    /// ANN structure without them.
    pub fn remove_sources(&self, source_ids: &[String]) -> anyhow::Result<usize> {
        if source_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; source_ids.len()].join(",");

        let select_sql = format!("SELECT id FROM memory_records WHERE source_id IN ({})", placeholders);
        let removed_ids: Vec<i64> = {
            let mut stmt = conn.prepare(&select_sql)?;
            let bound: Vec<&dyn rusqlite::ToSql> =
                source_ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
            let ids = stmt
                .query_map(rusqlite::params_from_iter(bound), |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };

        let delete_sql = format!("DELETE FROM memory_records WHERE source_id IN ({})", placeholders);
        let mut stmt = conn.prepare(&delete_sql)?;
        let bound: Vec<&dyn rusqlite::ToSql> =
            source_ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        let removed = stmt.execute(rusqlite::params_from_iter(bound))?;

        let mut cache = self.embedding_cache.write().unwrap();
        for id in &removed_ids {
            cache.remove(id);
        }
        if self.ann_index.read().unwrap().is_some() {
            let index = build_hnsw(self.config.dimension, &cache)?;
            *self.ann_index.write().unwrap() = Some(index);
        }
        if removed > 0 {
            debug!("Removed {} index records for {} sources", removed, source_ids.len());
        }
        Ok(removed)
    }

    pub fn get(&self, source_type: SourceType, source_id: &str) -> anyhow::Result<Option<MemoryRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, source_type, source_id, embedding, metadata, created_at
             FROM memory_records WHERE source_type = ?1 AND source_id = ?2",
        )?;
        let mut rows = stmt.query(params![source_type.as_str(), source_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_record(row)?)),
            None => Ok(None),
        }
    }

    fn load_records(&self, ids: &[i64]) -> anyhow::Result<Vec<MemoryRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT id, source_type, source_id, embedding, metadata, created_at
             FROM memory_records WHERE id IN ({})",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let bound: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(bound))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }

    fn load_all_records(&self) -> anyhow::Result<Vec<MemoryRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, source_type, source_id, embedding, metadata, created_at FROM memory_records",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }

    pub fn get_stats(&self) -> anyhow::Result<IndexStats> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM memory_records", [], |row| row.get(0))?;
        let index_type = if self.ann_index.read().unwrap().is_some() {
            "HNSW".to_string()
        } else {
            "Linear".to_string()
        };
        Ok(IndexStats {
            total_records: count as usize,
            dimension: self.config.dimension,
            index_type,
        })
    }
}

fn build_hnsw(dimension: usize, cache: &HashMap<i64, Vec<f32>>) -> anyhow::Result<HNSWIndex<f32, i64>> {
    let params = HNSWParams {
        n_neighbor: 16,
        ef_build: 100,
        ef_search: 50,
        ..Default::default()
    };
    let mut index = HNSWIndex::<f32, i64>::new(dimension, &params);
    for (id, embedding) in cache {
        let _ = index.add(embedding, *id);
    }
    index
        .build(Metric::CosineSimilarity)
        .map_err(|e| anyhow::anyhow!("Failed to build index: {}", e))?;
    Ok(index)
}

fn in_scope(record: &MemoryRecord, conversation_id: Option<&str>) -> bool {
    let Some(wanted) = conversation_id else {
        return true;
    };
    match record.metadata.get("conversation_id").and_then(|v| v.as_str()) {
        Some(owner) => owner == wanted,
        None => true,
    }
}

fn row_to_record(row: &Row) -> anyhow::Result<MemoryRecord> {
    let source_type_str: String = row.get(1)?;
    let source_type = SourceType::parse(&source_type_str)
        .ok_or_else(|| anyhow::anyhow!("Unknown source type in database: {}", source_type_str))?;
    let embedding_bytes: Vec<u8> = row.get(3)?;
    let embedding: Vec<f32> = bincode::deserialize(&embedding_bytes)
        .map_err(|e| anyhow::anyhow!("Deserialization error: {}", e))?;
    let metadata_json: String = row.get(4)?;
    let metadata: serde_json::Value = serde_json::from_str(&metadata_json)?;
    let created_at_str: String = row.get(5)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at_str)?.with_timezone(&Utc);
    Ok(MemoryRecord {
        id: row.get(0)?,
        source_type,
        source_id: row.get(2)?,
        embedding,
        metadata,
        created_at,
    })
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
