//! Durable lock: a single-row CAS mutex per resource name.
//!
//! Acquire inserts `seq = 0`, or advances `seq + 1` over a row that is
//! expired or already held by the caller. Release expires the row in
//! place, holder-checked, so the seq counter survives and a stale handle
//! from another process can never release a lock it no longer owns.
//! Contention is retried on a jittered exponential schedule; there is no
//! fairness, and starvation under persistent contention is acceptable.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LockConfig {
    pub ttl_seconds: i64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 30,
            max_retries: 10,
            base_delay_ms: 50,
        }
    }
}

/// Per-acquire options; unset fields fall back to the manager's config.
#[derive(Debug, Clone, Default)]
pub struct LockOptions {
    pub ttl_seconds: Option<i64>,
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub holder: Option<String>,
}

/// A held lock. Dropping an unreleased handle schedules a best-effort
/// release so `with_lock` lets go even when the wrapped future panics or
/// is cancelled.
#[derive(Debug)]
pub struct LockHandle {
    pub resource: String,
    pub holder: String,
    pub seq: i64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pool: SqlitePool,
    released: bool,
}

impl LockHandle {
    /// Release the lock. Idempotent for this handle; the underlying
    /// update targets `(resource, holder, seq)` so it is exactly-once in
    /// effect.
    pub async fn release(&mut self) -> DomainResult<()> {
        if self.released {
            return Ok(());
        }
        let released = release_row(&self.pool, &self.resource, &self.holder, Some(self.seq)).await?;
        if !released {
            return Err(DomainError::LockNotHeld {
                resource: self.resource.clone(),
                holder: self.holder.clone(),
            });
        }
        self.released = true;
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = self.pool.clone();
        let resource = self.resource.clone();
        let holder = self.holder.clone();
        let seq = self.seq;
        runtime.spawn(async move {
            if let Err(error) = release_row(&pool, &resource, &holder, Some(seq)).await {
                tracing::warn!(%resource, %holder, %error, "best-effort lock release failed");
            }
        });
    }
}

#[derive(Clone)]
pub struct LockManager {
    pool: SqlitePool,
    config: LockConfig,
}

enum Attempt {
    Acquired(i64),
    Contended { holder: String },
}

impl LockManager {
    pub fn new(pool: SqlitePool, config: LockConfig) -> Self {
        Self { pool, config }
    }

    /// Acquire `resource`, retrying contention with exponential backoff.
    pub async fn acquire(&self, resource: &str, options: LockOptions) -> DomainResult<LockHandle> {
        self.ensure_table().await?;

        let ttl = options.ttl_seconds.unwrap_or(self.config.ttl_seconds).max(1);
        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);
        let base_delay_ms = options.base_delay_ms.unwrap_or(self.config.base_delay_ms);
        let holder = options
            .holder
            .unwrap_or_else(|| format!("holder-{}", Uuid::new_v4()));

        let mut schedule = ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(base_delay_ms),
            randomization_factor: 0.25,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(5),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        schedule.reset();

        let mut attempts = 0u32;
        loop {
            let now = Utc::now();
            let expires_at = now + Duration::seconds(ttl);
            match self.try_acquire(resource, &holder, now, expires_at).await? {
                Attempt::Acquired(seq) => {
                    tracing::debug!(resource, holder = %holder, seq, "lock acquired");
                    return Ok(LockHandle {
                        resource: resource.to_string(),
                        holder,
                        seq,
                        acquired_at: now,
                        expires_at,
                        pool: self.pool.clone(),
                        released: false,
                    });
                }
                Attempt::Contended { holder: current } => {
                    if attempts >= max_retries {
                        tracing::debug!(resource, held_by = %current, "lock attempts exhausted");
                        return Err(DomainError::LockTimeout {
                            resource: resource.to_string(),
                            attempts: attempts + 1,
                        });
                    }
                    attempts += 1;
                    if let Some(delay) = schedule.next_backoff() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Run `work` under the lock, releasing on every exit path. A panic
    /// or cancellation inside `work` still releases through the handle's
    /// drop hook.
    pub async fn with_lock<T, F, Fut>(
        &self,
        resource: &str,
        options: LockOptions,
        work: F,
    ) -> DomainResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = DomainResult<T>>,
    {
        let mut handle = self.acquire(resource, options).await?;
        let result = work().await;
        match handle.release().await {
            // A TTL expiry during `work` means there is nothing left to
            // release; the work's own result is what matters.
            Ok(()) | Err(DomainError::LockNotHeld { .. }) => result,
            Err(release_error) => result.and(Err(release_error)),
        }
    }

    /// Release whatever lock `holder` has on `resource`, regardless of
    /// handle. Fails with `LockNotHeld` when there is nothing to release.
    pub async fn release(&self, resource: &str, holder: &str) -> DomainResult<()> {
        self.ensure_table().await?;
        if release_row(&self.pool, resource, holder, None).await? {
            Ok(())
        } else {
            Err(DomainError::LockNotHeld {
                resource: resource.to_string(),
                holder: holder.to_string(),
            })
        }
    }

    /// Drop released/expired rows; disk hygiene only, never required for
    /// correctness.
    pub async fn cleanup_expired(&self, older_than: Duration) -> DomainResult<u64> {
        self.ensure_table().await?;
        let cutoff = (Utc::now() - older_than).timestamp_millis();
        let result = sqlx::query("DELETE FROM locks WHERE expires_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn try_acquire(
        &self,
        resource: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> DomainResult<Attempt> {
        let now_ms = now.timestamp_millis();
        let expires_ms = expires_at.timestamp_millis();

        // CAS step 1: advance an expired or same-holder row.
        let updated = sqlx::query(
            "UPDATE locks SET holder = ?, seq = seq + 1, acquired_at = ?, expires_at = ?
             WHERE resource = ? AND (expires_at < ? OR holder = ?)",
        )
        .bind(holder)
        .bind(now_ms)
        .bind(expires_ms)
        .bind(resource)
        .bind(now_ms)
        .bind(holder)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 1 {
            let (seq,): (i64,) = sqlx::query_as("SELECT seq FROM locks WHERE resource = ?")
                .bind(resource)
                .fetch_one(&self.pool)
                .await?;
            return Ok(Attempt::Acquired(seq));
        }

        // CAS step 2: first acquire inserts seq 0. A concurrent insert
        // loses the conflict and falls through to contention.
        let inserted = sqlx::query(
            "INSERT INTO locks (resource, holder, seq, acquired_at, expires_at)
             VALUES (?, ?, 0, ?, ?)
             ON CONFLICT(resource) DO NOTHING",
        )
        .bind(resource)
        .bind(holder)
        .bind(now_ms)
        .bind(expires_ms)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 1 {
            return Ok(Attempt::Acquired(0));
        }

        let current: Option<(String,)> =
            sqlx::query_as("SELECT holder FROM locks WHERE resource = ?")
                .bind(resource)
                .fetch_optional(&self.pool)
                .await?;
        Ok(Attempt::Contended {
            holder: current.map(|(h,)| h).unwrap_or_default(),
        })
    }

    async fn ensure_table(&self) -> DomainResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS locks (
                resource TEXT NOT NULL,
                holder TEXT NOT NULL,
                seq INTEGER NOT NULL DEFAULT 0,
                acquired_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (resource)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Expire the row in place when it is still owned by `holder` (and, for
/// handle releases, still at the handle's seq). Returns whether a row was
/// released.
async fn release_row(
    pool: &SqlitePool,
    resource: &str,
    holder: &str,
    seq: Option<i64>,
) -> DomainResult<bool> {
    let now_ms = Utc::now().timestamp_millis();
    let result = if let Some(seq) = seq {
        sqlx::query(
            "UPDATE locks SET expires_at = ?
             WHERE resource = ? AND holder = ? AND seq = ? AND expires_at > ?",
        )
        .bind(now_ms - 1)
        .bind(resource)
        .bind(holder)
        .bind(seq)
        .bind(now_ms)
        .execute(pool)
        .await?
    } else {
        sqlx::query(
            "UPDATE locks SET expires_at = ?
             WHERE resource = ? AND holder = ? AND expires_at > ?",
        )
        .bind(now_ms - 1)
        .bind(resource)
        .bind(holder)
        .bind(now_ms)
        .execute(pool)
        .await?
    };
    Ok(result.rows_affected() == 1)
}
