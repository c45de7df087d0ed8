//! JSONL snapshots of memories and cells, one canonical JSON object per
//! line. Embeddings are never exported. Import skips duplicate ids and
//! isolates per-line failures from the batch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapters::sqlite::memory_repository::MemoryRepository;
use crate::domain::errors::DomainResult;
use crate::domain::models::cell::Cell;
use crate::domain::models::memory::Memory;

/// Export projection of one memory. `information` carries the content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryExport {
    pub id: String,
    pub information: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl MemoryExport {
    pub fn from_memory(memory: &Memory) -> Self {
        Self {
            id: memory.id.clone(),
            information: memory.content.clone(),
            created_at: memory.created_at.timestamp_millis(),
            metadata: match &memory.metadata {
                Value::Object(map) if map.is_empty() => None,
                other => Some(other.clone()),
            },
            tags: if memory.tags.is_empty() {
                None
            } else {
                Some(memory.tags.clone())
            },
            confidence: Some(memory.confidence),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped_duplicates: usize,
    /// `(line number, error)` for records that failed individually.
    pub failed: Vec<(usize, String)>,
}

/// Serialize memories to JSONL, one line per memory.
pub fn serialize_memories(memories: &[Memory]) -> DomainResult<String> {
    let mut out = String::new();
    for memory in memories {
        out.push_str(&serde_json::to_string(&MemoryExport::from_memory(memory))?);
        out.push('\n');
    }
    Ok(out)
}

/// Parse a JSONL document into export records. Invalid lines are
/// reported by index without failing the rest.
pub fn parse_memories(jsonl: &str) -> (Vec<MemoryExport>, Vec<(usize, String)>) {
    let mut records = Vec::new();
    let mut failed = Vec::new();
    for (index, line) in jsonl.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<MemoryExport>(line) {
            Ok(record) => records.push(record),
            Err(error) => failed.push((index + 1, error.to_string())),
        }
    }
    (records, failed)
}

/// Export every memory (optionally one collection) as JSONL.
pub async fn export_memories(
    repo: &MemoryRepository,
    collection: Option<&str>,
) -> DomainResult<String> {
    let memories = match collection {
        Some(collection) => repo.list_collection(collection).await?,
        None => repo.list_all().await?,
    };
    serialize_memories(&memories)
}

/// Import a JSONL document. Existing ids are skipped; invalid lines fail
/// individually while the batch proceeds.
pub async fn import_memories(
    repo: &MemoryRepository,
    jsonl: &str,
    collection: &str,
) -> DomainResult<ImportReport> {
    let (records, failed) = parse_memories(jsonl);
    let mut report = ImportReport {
        failed,
        ..ImportReport::default()
    };

    for record in records {
        if repo.get(&record.id).await?.is_some() {
            report.skipped_duplicates += 1;
            continue;
        }
        let created_at = match chrono::DateTime::from_timestamp_millis(record.created_at) {
            Some(ts) => ts,
            None => {
                report
                    .failed
                    .push((0, format!("record {}: bad created_at", record.id)));
                continue;
            }
        };
        let memory = Memory {
            id: record.id,
            content: record.information,
            metadata: record
                .metadata
                .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            collection: collection.to_string(),
            confidence: record.confidence.unwrap_or(0.5),
            tags: record.tags.unwrap_or_default(),
            auto_tags: Vec::new(),
            keywords: Vec::new(),
            embedding: None,
            created_at,
            updated_at: created_at,
            valid_from: None,
            valid_until: None,
            superseded_by: None,
        };
        match repo.insert(&memory).await {
            Ok(()) => report.imported += 1,
            Err(error) => report.failed.push((0, format!("{}: {error}", memory.id))),
        }
    }
    Ok(report)
}

/// Export cells as JSONL of their projection rows.
pub fn serialize_cells(cells: &[Cell]) -> DomainResult<String> {
    let mut out = String::new();
    for cell in cells {
        out.push_str(&serde_json::to_string(cell)?);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn memory(content: &str) -> Memory {
        // Millisecond precision only, matching the export encoding.
        let now = chrono::DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        Memory {
            id: Memory::new_id(),
            content: content.to_string(),
            metadata: serde_json::json!({"source": "test"}),
            collection: "default".into(),
            confidence: 0.8,
            tags: vec!["infra".into()],
            auto_tags: vec![],
            keywords: vec![],
            embedding: Some(vec![1.0, 0.0]),
            created_at: now,
            updated_at: now,
            valid_from: None,
            valid_until: None,
            superseded_by: None,
        }
    }

    #[test]
    fn jsonl_round_trips_the_export_projection() {
        let m = memory("wal checkpoints flush the log");
        let jsonl = serialize_memories(std::slice::from_ref(&m)).unwrap();
        let (records, failed) = parse_memories(&jsonl);
        assert!(failed.is_empty());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0], MemoryExport::from_memory(&m));
    }

    #[test]
    fn embeddings_never_appear_in_exports() {
        let jsonl = serialize_memories(&[memory("x")]).unwrap();
        assert!(!jsonl.contains("embedding"));
    }

    #[test]
    fn invalid_lines_fail_individually() {
        let m = memory("valid");
        let mut jsonl = serialize_memories(&[m]).unwrap();
        jsonl.push_str("{not json}\n");
        jsonl.push_str("{\"missing\": \"fields\"}\n");

        let (records, failed) = parse_memories(&jsonl);
        assert_eq!(records.len(), 1);
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].0, 2);
        assert_eq!(failed[1].0, 3);
    }
}
