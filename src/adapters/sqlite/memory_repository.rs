//! SQLite persistence for semantic memories.
//!
//! Embeddings are stored as little-endian f32 blobs and compared with a
//! pure-Rust cosine scan; content is mirrored into an FTS5 index for the
//! full-text fallback path.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::memory::{
    Entity, EntityRelationship, EntityType, LinkType, Memory, MemoryLink,
};

#[derive(Clone)]
pub struct MemoryRepository {
    pool: SqlitePool,
}

impl MemoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert(&self, memory: &Memory) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO memories
             (id, content, metadata, collection, confidence, tags, auto_tags, keywords,
              embedding, created_at, updated_at, valid_from, valid_until, superseded_by)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&memory.id)
        .bind(&memory.content)
        .bind(memory.metadata.to_string())
        .bind(&memory.collection)
        .bind(memory.confidence)
        .bind(serde_json::to_string(&memory.tags)?)
        .bind(serde_json::to_string(&memory.auto_tags)?)
        .bind(serde_json::to_string(&memory.keywords)?)
        .bind(memory.embedding.as_ref().map(|e| embedding_to_bytes(e)))
        .bind(memory.created_at.timestamp_millis())
        .bind(memory.updated_at.timestamp_millis())
        .bind(memory.valid_from.map(|t| t.timestamp_millis()))
        .bind(memory.valid_until.map(|t| t.timestamp_millis()))
        .bind(&memory.superseded_by)
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT INTO memories_fts (memory_id, content) VALUES (?, ?)")
            .bind(&memory.id)
            .bind(&memory.content)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update(&self, memory: &Memory) -> DomainResult<()> {
        let result = sqlx::query(
            "UPDATE memories SET
                 content = ?, metadata = ?, collection = ?, confidence = ?,
                 tags = ?, auto_tags = ?, keywords = ?, embedding = ?,
                 updated_at = ?, valid_from = ?, valid_until = ?, superseded_by = ?
             WHERE id = ?",
        )
        .bind(&memory.content)
        .bind(memory.metadata.to_string())
        .bind(&memory.collection)
        .bind(memory.confidence)
        .bind(serde_json::to_string(&memory.tags)?)
        .bind(serde_json::to_string(&memory.auto_tags)?)
        .bind(serde_json::to_string(&memory.keywords)?)
        .bind(memory.embedding.as_ref().map(|e| embedding_to_bytes(e)))
        .bind(memory.updated_at.timestamp_millis())
        .bind(memory.valid_from.map(|t| t.timestamp_millis()))
        .bind(memory.valid_until.map(|t| t.timestamp_millis()))
        .bind(&memory.superseded_by)
        .bind(&memory.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound {
                entity: "memory",
                id: memory.id.clone(),
            });
        }

        sqlx::query("DELETE FROM memories_fts WHERE memory_id = ?")
            .bind(&memory.id)
            .execute(&self.pool)
            .await?;
        sqlx::query("INSERT INTO memories_fts (memory_id, content) VALUES (?, ?)")
            .bind(&memory.id)
            .bind(&memory.content)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> DomainResult<Option<Memory>> {
        let row: Option<MemoryRow> = sqlx::query_as(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_memory).transpose()
    }

    pub async fn delete(&self, id: &str) -> DomainResult<()> {
        sqlx::query("DELETE FROM memories_fts WHERE memory_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM memory_links WHERE source_id = ? OR target_id = ?")
            .bind(id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM memory_entities WHERE memory_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM memories WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound {
                entity: "memory",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// All memories of a collection that carry an embedding, decoded for
    /// the cosine scan.
    pub async fn embedded_memories(
        &self,
        collection: Option<&str>,
    ) -> DomainResult<Vec<(Memory, Vec<f32>)>> {
        let rows: Vec<MemoryRow> = if let Some(collection) = collection {
            sqlx::query_as(&format!(
                "SELECT {MEMORY_COLUMNS} FROM memories
                 WHERE embedding IS NOT NULL AND collection = ?"
            ))
            .bind(collection)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(&format!(
                "SELECT {MEMORY_COLUMNS} FROM memories WHERE embedding IS NOT NULL"
            ))
            .fetch_all(&self.pool)
            .await?
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let memory = row_to_memory(row)?;
            if let Some(embedding) = memory.embedding.clone() {
                out.push((memory, embedding));
            }
        }
        Ok(out)
    }

    /// Full-text candidates ranked by the FTS engine.
    pub async fn fts_search(
        &self,
        query: &str,
        collection: Option<&str>,
        limit: i64,
    ) -> DomainResult<Vec<Memory>> {
        let sanitized = sanitize_fts5_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<MemoryRow> = if let Some(collection) = collection {
            sqlx::query_as(&format!(
                "SELECT {MEMORY_COLUMNS_QUALIFIED} FROM memories m
                 INNER JOIN memories_fts f ON m.id = f.memory_id
                 WHERE memories_fts MATCH ? AND m.collection = ?
                 ORDER BY rank LIMIT ?"
            ))
            .bind(&sanitized)
            .bind(collection)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(&format!(
                "SELECT {MEMORY_COLUMNS_QUALIFIED} FROM memories m
                 INNER JOIN memories_fts f ON m.id = f.memory_id
                 WHERE memories_fts MATCH ?
                 ORDER BY rank LIMIT ?"
            ))
            .bind(&sanitized)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };
        rows.into_iter().map(row_to_memory).collect()
    }

    pub async fn list_collection(&self, collection: &str) -> DomainResult<Vec<Memory>> {
        let rows: Vec<MemoryRow> = sqlx::query_as(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE collection = ? ORDER BY created_at ASC"
        ))
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_memory).collect()
    }

    pub async fn list_all(&self) -> DomainResult<Vec<Memory>> {
        let rows: Vec<MemoryRow> = sqlx::query_as(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_memory).collect()
    }

    // -- links --

    /// Insert a link, silently skipping duplicates of
    /// `(source, target, type)`.
    pub async fn insert_link(
        &self,
        source_id: &str,
        target_id: &str,
        link_type: LinkType,
        strength: f64,
    ) -> DomainResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO memory_links (source_id, target_id, link_type, strength)
             VALUES (?, ?, ?, ?)",
        )
        .bind(source_id)
        .bind(target_id)
        .bind(link_type.as_str())
        .bind(strength)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn links_for(&self, memory_id: &str) -> DomainResult<Vec<MemoryLink>> {
        let rows: Vec<(i64, String, String, String, f64)> = sqlx::query_as(
            "SELECT id, source_id, target_id, link_type, strength FROM memory_links
             WHERE source_id = ? OR target_id = ? ORDER BY id ASC",
        )
        .bind(memory_id)
        .bind(memory_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(id, source_id, target_id, link_type, strength)| {
                Ok(MemoryLink {
                    id,
                    source_id,
                    target_id,
                    link_type: LinkType::from_str(&link_type).ok_or_else(|| {
                        DomainError::Validation(format!("unknown link type '{link_type}'"))
                    })?,
                    strength,
                })
            })
            .collect()
    }

    // -- entities --

    /// Insert or fetch an entity, deduplicated case-insensitively on
    /// `(name, entity_type)`. Returns its id.
    pub async fn upsert_entity(&self, name: &str, entity_type: EntityType) -> DomainResult<i64> {
        sqlx::query("INSERT OR IGNORE INTO entities (name, entity_type) VALUES (?, ?)")
            .bind(name)
            .bind(entity_type.as_str())
            .execute(&self.pool)
            .await?;
        let (id,): (i64,) = sqlx::query_as(
            "SELECT id FROM entities WHERE lower(name) = lower(?) AND entity_type = ?",
        )
        .bind(name)
        .bind(entity_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn link_memory_entity(&self, memory_id: &str, entity_id: i64) -> DomainResult<()> {
        sqlx::query("INSERT OR IGNORE INTO memory_entities (memory_id, entity_id) VALUES (?, ?)")
            .bind(memory_id)
            .bind(entity_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert a relationship triple, deduplicated on
    /// `(subject, predicate, object)`.
    pub async fn upsert_relationship(
        &self,
        subject: &str,
        predicate: &str,
        object: &str,
        confidence: f64,
        memory_id: &str,
    ) -> DomainResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO entity_relationships
             (subject, predicate, object, confidence, memory_id)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(subject)
        .bind(predicate)
        .bind(object)
        .bind(confidence)
        .bind(memory_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn entities_for(&self, memory_id: &str) -> DomainResult<Vec<Entity>> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT e.id, e.name, e.entity_type FROM entities e
             INNER JOIN memory_entities me ON me.entity_id = e.id
             WHERE me.memory_id = ? ORDER BY e.id ASC",
        )
        .bind(memory_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(id, name, entity_type)| {
                Ok(Entity {
                    id,
                    name,
                    entity_type: EntityType::from_str(&entity_type).ok_or_else(|| {
                        DomainError::Validation(format!("unknown entity type '{entity_type}'"))
                    })?,
                })
            })
            .collect()
    }

    pub async fn relationships_for(&self, memory_id: &str) -> DomainResult<Vec<EntityRelationship>> {
        let rows: Vec<(i64, String, String, String, f64, String)> = sqlx::query_as(
            "SELECT id, subject, predicate, object, confidence, memory_id
             FROM entity_relationships WHERE memory_id = ? ORDER BY id ASC",
        )
        .bind(memory_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, subject, predicate, object, confidence, memory_id)| EntityRelationship {
                id,
                subject,
                predicate,
                object,
                confidence,
                memory_id,
            })
            .collect())
    }
}

const MEMORY_COLUMNS: &str = "id, content, metadata, collection, confidence, tags, auto_tags, \
     keywords, embedding, created_at, updated_at, valid_from, valid_until, superseded_by";

const MEMORY_COLUMNS_QUALIFIED: &str = "m.id, m.content, m.metadata, m.collection, m.confidence, \
     m.tags, m.auto_tags, m.keywords, m.embedding, m.created_at, m.updated_at, m.valid_from, \
     m.valid_until, m.superseded_by";

#[derive(Debug, sqlx::FromRow)]
struct MemoryRow {
    id: String,
    content: String,
    metadata: String,
    collection: String,
    confidence: f64,
    tags: String,
    auto_tags: String,
    keywords: String,
    embedding: Option<Vec<u8>>,
    created_at: i64,
    updated_at: i64,
    valid_from: Option<i64>,
    valid_until: Option<i64>,
    superseded_by: Option<String>,
}

fn row_to_memory(row: MemoryRow) -> DomainResult<Memory> {
    Ok(Memory {
        id: row.id,
        content: row.content,
        metadata: serde_json::from_str(&row.metadata)?,
        collection: row.collection,
        confidence: row.confidence,
        tags: serde_json::from_str(&row.tags)?,
        auto_tags: serde_json::from_str(&row.auto_tags)?,
        keywords: serde_json::from_str(&row.keywords)?,
        embedding: row.embedding.as_deref().map(bytes_to_embedding).transpose()?,
        created_at: millis(row.created_at)?,
        updated_at: millis(row.updated_at)?,
        valid_from: row.valid_from.map(millis).transpose()?,
        valid_until: row.valid_until.map(millis).transpose()?,
        superseded_by: row.superseded_by,
    })
}

fn millis(ms: i64) -> DomainResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DomainError::Validation(format!("bad timestamp {ms}")))
}

/// Serialize an embedding as little-endian f32 bytes.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub fn bytes_to_embedding(bytes: &[u8]) -> DomainResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(DomainError::Validation(
            "invalid embedding bytes length".to_string(),
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Cosine distance between two vectors; `f32::MAX` for degenerate input.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::MAX;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return f32::MAX;
    }
    1.0 - (dot / (mag_a * mag_b))
}

/// Sanitize a search query for use with the FTS5 MATCH syntax.
///
/// FTS5 interprets bare `AND`/`OR`/`NOT`, quotes, and punctuation as
/// syntax. Wrapping each whitespace token in double quotes (with interior
/// quotes stripped) makes every token a literal phrase.
fn sanitize_fts5_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "")))
        .filter(|token| token.len() > 2)
        .collect::<Vec<_>>()
        .join(" ")
}
