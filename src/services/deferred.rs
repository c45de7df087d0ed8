//! Durable deferred: a persisted single-shot promise addressed by URL.
//!
//! Resolution is written to the store with a conditional update (so two
//! racing resolvers settle exactly one winner) and also signalled to
//! in-process awaiters. Awaiters in other processes observe resolution
//! through a polling tick against the database.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DeferredConfig {
    /// Database poll interval for awaiters.
    pub poll_interval_ms: u64,
    pub default_ttl_seconds: i64,
}

impl Default for DeferredConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            default_ttl_seconds: 300,
        }
    }
}

/// Handle to a created deferred. The URL is the durable address; any
/// process that knows it can await, resolve, or reject.
#[derive(Debug, Clone)]
pub struct Deferred {
    pub url: String,
    pub expires_at: chrono::DateTime<Utc>,
}

type Settlement = Result<Value, String>;
type NotifierMap = Arc<Mutex<HashMap<String, Vec<oneshot::Sender<Settlement>>>>>;

#[derive(Clone)]
pub struct DeferredManager {
    pool: SqlitePool,
    notifiers: NotifierMap,
    config: DeferredConfig,
}

impl DeferredManager {
    pub fn new(pool: SqlitePool, config: DeferredConfig) -> Self {
        Self {
            pool,
            notifiers: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Create a pending deferred.
    pub async fn create(&self, ttl_seconds: Option<i64>) -> DomainResult<Deferred> {
        let url = format!("deferred://{}", Uuid::new_v4());
        let now = Utc::now();
        let ttl = ttl_seconds.unwrap_or(self.config.default_ttl_seconds).max(1);
        let expires_at = now + Duration::seconds(ttl);

        sqlx::query(
            "INSERT INTO deferreds (url, resolved, value, error, created_at, expires_at)
             VALUES (?, 0, NULL, NULL, ?, ?)",
        )
        .bind(&url)
        .bind(now.timestamp_millis())
        .bind(expires_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(Deferred { url, expires_at })
    }

    /// Await the deferred at `url`.
    ///
    /// Terminates in exactly one of three ways: the resolved value, a
    /// `DeferredRejected` error, or `Timeout` at the row's TTL. A vanished
    /// row fails with `NotFound`.
    pub async fn wait(&self, url: &str) -> DomainResult<Value> {
        let started = Utc::now();
        let mut receiver = Some(self.subscribe(url).await);
        let poll = StdDuration::from_millis(self.config.poll_interval_ms.max(1));

        loop {
            if let Some(settled) = self.check_row(url, started).await? {
                return settled;
            }

            let mut notifier_gone = false;
            match receiver.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        outcome = rx => {
                            match outcome {
                                Ok(Ok(value)) => return Ok(value),
                                Ok(Err(error)) => {
                                    return Err(DomainError::DeferredRejected {
                                        url: url.to_string(),
                                        error,
                                    })
                                }
                                // Notifier dropped (e.g. resolver lives in
                                // another process); keep polling.
                                Err(_) => notifier_gone = true,
                            }
                        }
                        () = tokio::time::sleep(poll) => {}
                    }
                }
                None => tokio::time::sleep(poll).await,
            }
            if notifier_gone {
                receiver = None;
            }
        }
    }

    /// Resolve `url` with `value`. At most one of resolve/reject ever
    /// succeeds; late callers get `NotFound`.
    pub async fn resolve(&self, url: &str, value: Value) -> DomainResult<()> {
        let updated = sqlx::query(
            "UPDATE deferreds SET resolved = 1, value = ? WHERE url = ? AND resolved = 0",
        )
        .bind(value.to_string())
        .bind(url)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(DomainError::NotFound {
                entity: "deferred",
                id: url.to_string(),
            });
        }
        self.notify(url, Ok(value)).await;
        Ok(())
    }

    /// Reject `url` with an error message. Same at-most-once contract as
    /// `resolve`.
    pub async fn reject(&self, url: &str, error: &str) -> DomainResult<()> {
        let updated = sqlx::query(
            "UPDATE deferreds SET resolved = 1, error = ? WHERE url = ? AND resolved = 0",
        )
        .bind(error)
        .bind(url)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(DomainError::NotFound {
                entity: "deferred",
                id: url.to_string(),
            });
        }
        self.notify(url, Err(error.to_string())).await;
        Ok(())
    }

    /// Purge expired rows. Safe to call periodically.
    pub async fn cleanup_expired(&self) -> DomainResult<u64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query("DELETE FROM deferreds WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        let mut notifiers = self.notifiers.lock().await;
        notifiers.retain(|_, senders| !senders.is_empty());
        Ok(result.rows_affected())
    }

    async fn subscribe(&self, url: &str) -> oneshot::Receiver<Settlement> {
        let (sender, receiver) = oneshot::channel();
        self.notifiers
            .lock()
            .await
            .entry(url.to_string())
            .or_default()
            .push(sender);
        receiver
    }

    async fn notify(&self, url: &str, settlement: Settlement) {
        let senders = self.notifiers.lock().await.remove(url).unwrap_or_default();
        for sender in senders {
            // An awaiter that timed out already is gone; ignore.
            let _ = sender.send(settlement.clone());
        }
    }

    /// One poll of the row. `Some` means the wait is over.
    async fn check_row(
        &self,
        url: &str,
        started: chrono::DateTime<Utc>,
    ) -> DomainResult<Option<DomainResult<Value>>> {
        let row: Option<(i64, Option<String>, Option<String>, i64)> = sqlx::query_as(
            "SELECT resolved, value, error, expires_at FROM deferreds WHERE url = ?",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        let Some((resolved, value, error, expires_at)) = row else {
            return Ok(Some(Err(DomainError::NotFound {
                entity: "deferred",
                id: url.to_string(),
            })));
        };

        if resolved != 0 {
            if let Some(error) = error {
                return Ok(Some(Err(DomainError::DeferredRejected {
                    url: url.to_string(),
                    error,
                })));
            }
            let value = value.unwrap_or_else(|| "null".to_string());
            let parsed: Value = serde_json::from_str(&value)?;
            return Ok(Some(Ok(parsed)));
        }

        let now = Utc::now();
        if now.timestamp_millis() > expires_at {
            let waited_ms = (now - started).num_milliseconds().max(0) as u64;
            return Ok(Some(Err(DomainError::Timeout {
                what: url.to_string(),
                waited_ms,
            })));
        }
        Ok(None)
    }
}
