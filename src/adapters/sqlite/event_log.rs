//! The append-only event log.
//!
//! One store-wide monotonic sequence, assigned inside the append
//! transaction. Projection folds run on the same transaction, so an
//! appended event and its derived rows become visible together or not at
//! all. Replay is pure reads plus projection writes; events themselves are
//! never updated or deleted.
//!
//! Sequence assignment is a read-modify-write over `MAX(sequence)`, so it
//! must never race. Writers in this process serialize on a shared lock
//! (all clones of an `EventLog` share it); a writer in another process
//! that claims the same sequence trips the unique sequence index, and the
//! losing transaction rolls back and retries against the new tail.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use super::projections;
use crate::domain::errors::{DomainError, DomainResult, ErrorContext};
use crate::domain::models::event::{Event, EventPayload, EventStream};

/// Attempts before giving up on cross-process sequence contention.
const MAX_APPEND_ATTEMPTS: u32 = 5;

/// Filter for reads and replays. All present criteria are ANDed.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub stream: Option<EventStream>,
    pub project_key: Option<String>,
    pub entity_id: Option<String>,
    pub kinds: Vec<String>,
    pub since_sequence: Option<i64>,
    pub until_sequence: Option<i64>,
    pub since_time: Option<DateTime<Utc>>,
    pub until_time: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(mut self, stream: EventStream) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn project_key(mut self, key: impl Into<String>) -> Self {
        self.project_key = Some(key.into());
        self
    }

    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kinds.push(kind.into());
        self
    }

    pub fn since_sequence(mut self, sequence: i64) -> Self {
        self.since_sequence = Some(sequence);
        self
    }

    pub fn until_sequence(mut self, sequence: i64) -> Self {
        self.until_sequence = Some(sequence);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Clone)]
pub struct EventLog {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl EventLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Append one event on its payload's default stream.
    pub async fn append(&self, project_key: &str, payload: EventPayload) -> DomainResult<Event> {
        let mut events = self.append_all(project_key, vec![payload]).await?;
        Ok(events.pop().expect("append_all returns one event per payload"))
    }

    /// Append a batch of events in a single transaction. Sequences are
    /// assigned in order; projection folds run on the same transaction.
    pub async fn append_all(
        &self,
        project_key: &str,
        payloads: Vec<EventPayload>,
    ) -> DomainResult<Vec<Event>> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.write_lock.lock().await;

        let mut attempts = 0;
        loop {
            if let Some(events) = self.append_attempt(project_key, &payloads).await? {
                return Ok(events);
            }
            attempts += 1;
            if attempts >= MAX_APPEND_ATTEMPTS {
                return Err(DomainError::Storage(format!(
                    "sequence contention persisted across {MAX_APPEND_ATTEMPTS} append attempts"
                )));
            }
        }
    }

    /// One transactional append attempt. `Ok(None)` means a writer in
    /// another process claimed the sequence first; the transaction has
    /// rolled back and the caller retries against the new tail.
    async fn append_attempt(
        &self,
        project_key: &str,
        payloads: &[EventPayload],
    ) -> DomainResult<Option<Vec<Event>>> {
        let mut tx = self.pool.begin().await?;
        let (mut sequence,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(sequence), 0) FROM events")
                .fetch_one(&mut *tx)
                .await?;

        let mut events = Vec::with_capacity(payloads.len());
        for payload in payloads {
            sequence += 1;
            let timestamp = Utc::now();
            let entity_id = payload.entity_id(sequence);
            let payload_json = serde_json::to_string(payload)?;
            let stream = payload.stream();

            let inserted = sqlx::query(
                "INSERT INTO events (sequence, stream, project_key, entity_id, timestamp, type, payload)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(sequence)
            .bind(stream.as_str())
            .bind(project_key)
            .bind(&entity_id)
            .bind(timestamp.timestamp_millis())
            .bind(payload.kind())
            .bind(&payload_json)
            .execute(&mut *tx)
            .await;

            let result = match inserted {
                Ok(result) => result,
                Err(error) if is_sequence_conflict(&error) => return Ok(None),
                Err(error) => return Err(error.into()),
            };

            let event = Event {
                id: result.last_insert_rowid(),
                sequence,
                stream,
                project_key: project_key.to_string(),
                entity_id,
                timestamp,
                payload: payload.clone(),
            };
            projections::apply(&mut *tx, &event).await?;
            events.push(event);
        }

        tx.commit().await?;
        Ok(Some(events))
    }

    /// Validate and append an untyped `(type, body)` pair from a host
    /// boundary. Unknown types and malformed bodies are rejected before
    /// the store is touched.
    pub async fn append_raw(
        &self,
        kind: &str,
        project_key: &str,
        body: &Value,
    ) -> DomainResult<Event> {
        let payload = EventPayload::from_raw(kind, body)?;
        self.append(project_key, payload).await
    }

    /// Read events matching `filter` in ascending sequence order.
    pub async fn read(&self, filter: &EventFilter) -> DomainResult<Vec<Event>> {
        let (sql, binds) = compose_query(filter);
        let mut query = sqlx::query_as::<_, EventRow>(&sql);
        for bind in &binds {
            query = match bind {
                Bind::Int(v) => query.bind(*v),
                Bind::Text(v) => query.bind(v.clone()),
            };
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_event).collect()
    }

    /// Rebuild projections by folding events in sequence order. With
    /// `truncate`, all projection tables are cleared first. Returns the
    /// number of events applied.
    pub async fn replay(&self, filter: &EventFilter, truncate: bool) -> DomainResult<u64> {
        // Appends also write projections; do not interleave with them.
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        if truncate {
            projections::truncate_all(&mut *tx).await?;
        }
        let (sql, binds) = compose_query(filter);
        let mut query = sqlx::query_as::<_, EventRow>(&sql);
        for bind in &binds {
            query = match bind {
                Bind::Int(v) => query.bind(*v),
                Bind::Text(v) => query.bind(v.clone()),
            };
        }
        let rows = query.fetch_all(&mut *tx).await?;
        let mut count = 0u64;
        for row in rows {
            let event = row_to_event(row)?;
            projections::apply(&mut *tx, &event).await?;
            count += 1;
        }
        tx.commit().await?;
        Ok(count)
    }

    pub async fn latest_sequence(&self) -> DomainResult<Option<i64>> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(sequence) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn count(&self) -> DomainResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Position of a consumer cursor; 0 when the cursor does not exist.
    pub async fn cursor(&self, stream: &str, checkpoint: &str) -> DomainResult<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT position FROM cursors WHERE stream = ? AND checkpoint = ?")
                .bind(stream)
                .bind(checkpoint)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(p,)| p).unwrap_or(0))
    }

    pub async fn advance_cursor(
        &self,
        stream: &str,
        checkpoint: &str,
        position: i64,
    ) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO cursors (stream, checkpoint, position, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(stream, checkpoint) DO UPDATE SET
                 position = excluded.position, updated_at = excluded.updated_at",
        )
        .bind(stream)
        .bind(checkpoint)
        .bind(position)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Build diagnostic context from the tail of the log.
    pub async fn error_context(&self, project_key: &str) -> ErrorContext {
        let filter = EventFilter::new().project_key(project_key);
        let (sql, binds) = compose_query_desc(&filter, 5);
        let mut query = sqlx::query_as::<_, EventRow>(&sql);
        for bind in &binds {
            query = match bind {
                Bind::Int(v) => query.bind(*v),
                Bind::Text(v) => query.bind(v.clone()),
            };
        }
        let mut ctx = ErrorContext::new();
        if let Ok(rows) = query.fetch_all(&self.pool).await {
            if let Some(first) = rows.first() {
                ctx.sequence = Some(first.sequence);
                ctx.timestamp = chrono::DateTime::from_timestamp_millis(first.timestamp);
            }
            ctx.recent_events = rows
                .iter()
                .map(|r| format!("{}: {}", r.sequence, r.event_type))
                .collect();
        }
        ctx
    }
}

/// Did this insert trip the unique sequence guard? That is the signature
/// of losing a sequence race to a writer in another process.
fn is_sequence_conflict(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            let message = db.message();
            message.contains("idx_events_sequence") || message.contains("events.sequence")
        }
        _ => false,
    }
}

enum Bind {
    Int(i64),
    Text(String),
}

fn compose_query(filter: &EventFilter) -> (String, Vec<Bind>) {
    let (mut sql, mut binds) = compose_where(filter);
    sql.push_str(" ORDER BY sequence ASC");
    if let Some(limit) = filter.limit {
        sql.push_str(" LIMIT ?");
        binds.push(Bind::Int(limit));
        if let Some(offset) = filter.offset {
            sql.push_str(" OFFSET ?");
            binds.push(Bind::Int(offset));
        }
    }
    (sql, binds)
}

fn compose_query_desc(filter: &EventFilter, limit: i64) -> (String, Vec<Bind>) {
    let (mut sql, mut binds) = compose_where(filter);
    sql.push_str(" ORDER BY sequence DESC LIMIT ?");
    binds.push(Bind::Int(limit));
    (sql, binds)
}

fn compose_where(filter: &EventFilter) -> (String, Vec<Bind>) {
    let mut sql = String::from(
        "SELECT id, sequence, stream, project_key, entity_id, timestamp, type AS event_type, payload
         FROM events WHERE 1=1",
    );
    let mut binds = Vec::new();

    if let Some(stream) = filter.stream {
        sql.push_str(" AND stream = ?");
        binds.push(Bind::Text(stream.as_str().to_string()));
    }
    if let Some(project_key) = &filter.project_key {
        sql.push_str(" AND project_key = ?");
        binds.push(Bind::Text(project_key.clone()));
    }
    if let Some(entity_id) = &filter.entity_id {
        sql.push_str(" AND entity_id = ?");
        binds.push(Bind::Text(entity_id.clone()));
    }
    if !filter.kinds.is_empty() {
        sql.push_str(" AND type IN (");
        for (i, kind) in filter.kinds.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push('?');
            binds.push(Bind::Text(kind.clone()));
        }
        sql.push(')');
    }
    if let Some(since) = filter.since_sequence {
        sql.push_str(" AND sequence >= ?");
        binds.push(Bind::Int(since));
    }
    if let Some(until) = filter.until_sequence {
        sql.push_str(" AND sequence <= ?");
        binds.push(Bind::Int(until));
    }
    if let Some(since) = filter.since_time {
        sql.push_str(" AND timestamp >= ?");
        binds.push(Bind::Int(since.timestamp_millis()));
    }
    if let Some(until) = filter.until_time {
        sql.push_str(" AND timestamp <= ?");
        binds.push(Bind::Int(until.timestamp_millis()));
    }
    (sql, binds)
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: i64,
    sequence: i64,
    stream: String,
    project_key: String,
    entity_id: Option<String>,
    timestamp: i64,
    event_type: String,
    payload: String,
}

fn row_to_event(row: EventRow) -> DomainResult<Event> {
    let stream = EventStream::from_str(&row.stream)
        .ok_or_else(|| DomainError::Validation(format!("unknown stream '{}'", row.stream)))?;
    let timestamp = DateTime::from_timestamp_millis(row.timestamp)
        .ok_or_else(|| DomainError::Validation(format!("bad timestamp {}", row.timestamp)))?;
    let payload: EventPayload = serde_json::from_str(&row.payload)?;
    if payload.kind() != row.event_type {
        return Err(DomainError::Validation(format!(
            "event {} type column '{}' does not match payload tag '{}'",
            row.sequence,
            row.event_type,
            payload.kind()
        )));
    }
    Ok(Event {
        id: row.id,
        sequence: row.sequence,
        stream,
        project_key: row.project_key,
        entity_id: row.entity_id,
        timestamp,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::{create_pool, create_test_pool};
    use crate::adapters::sqlite::migrations::Migrator;
    use serde_json::json;

    async fn setup() -> EventLog {
        let pool = create_test_pool().await.unwrap();
        Migrator::new(pool.clone()).run().await.unwrap();
        EventLog::new(pool)
    }

    fn checkpoint_payload(label: &str) -> EventPayload {
        EventPayload::CheckpointSaved {
            agent: "swift-otter".into(),
            label: label.into(),
            data: json!({}),
        }
    }

    #[tokio::test]
    async fn sequences_are_monotonic() {
        let log = setup().await;
        let a = log.append("proj", checkpoint_payload("a")).await.unwrap();
        let b = log.append("proj", checkpoint_payload("b")).await.unwrap();
        let c = log.append("proj", checkpoint_payload("c")).await.unwrap();
        assert_eq!((a.sequence, b.sequence, c.sequence), (1, 2, 3));
        assert_eq!(log.latest_sequence().await.unwrap(), Some(3));
        assert_eq!(log.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn concurrent_appends_assign_unique_contiguous_sequences() {
        // File-backed pool so writers really run on separate pooled
        // connections, not the single shared in-memory one.
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("events.db").display());
        let pool = create_pool(&url, None).await.unwrap();
        Migrator::new(pool.clone()).run().await.unwrap();
        let log = EventLog::new(pool);

        let mut workers = Vec::new();
        for worker in 0..8 {
            let log = log.clone();
            workers.push(tokio::spawn(async move {
                for i in 0..5 {
                    log.append("proj", checkpoint_payload(&format!("w{worker}-{i}")))
                        .await
                        .unwrap();
                }
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        let events = log.read(&EventFilter::new()).await.unwrap();
        assert_eq!(events.len(), 40);
        let sequences: Vec<i64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=40).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn batch_append_assigns_contiguous_sequences() {
        let log = setup().await;
        let events = log
            .append_all(
                "proj",
                vec![checkpoint_payload("a"), checkpoint_payload("b")],
            )
            .await
            .unwrap();
        assert_eq!(events[0].sequence + 1, events[1].sequence);
    }

    #[tokio::test]
    async fn read_filters_by_kind_and_sequence() {
        let log = setup().await;
        log.append("proj", checkpoint_payload("a")).await.unwrap();
        log.append(
            "proj",
            EventPayload::FeedbackRecorded {
                agent: "swift-otter".into(),
                target_agent: None,
                content: "looks good".into(),
            },
        )
        .await
        .unwrap();
        log.append("proj", checkpoint_payload("b")).await.unwrap();

        let checkpoints = log
            .read(&EventFilter::new().kind("checkpoint_saved"))
            .await
            .unwrap();
        assert_eq!(checkpoints.len(), 2);

        let later = log
            .read(&EventFilter::new().since_sequence(2))
            .await
            .unwrap();
        assert_eq!(later.len(), 2);
        assert!(later.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[tokio::test]
    async fn append_raw_validates_at_the_boundary() {
        let log = setup().await;
        let err = log
            .append_raw("not_a_real_event", "proj", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(log.count().await.unwrap(), 0);

        let event = log
            .append_raw(
                "feedback_recorded",
                "proj",
                &json!({"agent": "swift-otter", "content": "hi"}),
            )
            .await
            .unwrap();
        assert_eq!(event.kind(), "feedback_recorded");
    }

    #[tokio::test]
    async fn error_context_reports_the_recent_tail() {
        let log = setup().await;
        for i in 0..8 {
            log.append("proj", checkpoint_payload(&format!("cp-{i}")))
                .await
                .unwrap();
        }

        let ctx = log.error_context("proj").await;
        assert_eq!(ctx.sequence, Some(8));
        assert_eq!(ctx.recent_events.len(), 5);
        assert!(ctx.recent_events[0].starts_with("8: checkpoint_saved"));
        assert!(ctx.timestamp.is_some());
    }

    #[tokio::test]
    async fn cursors_advance_and_rebuild() {
        let log = setup().await;
        assert_eq!(log.cursor("mail", "dashboard").await.unwrap(), 0);
        log.advance_cursor("mail", "dashboard", 7).await.unwrap();
        assert_eq!(log.cursor("mail", "dashboard").await.unwrap(), 7);
        log.advance_cursor("mail", "dashboard", 9).await.unwrap();
        assert_eq!(log.cursor("mail", "dashboard").await.unwrap(), 9);
    }
}
