//! File reservations: TTL-scoped advisory leases on path patterns.
//!
//! The grant policy is permissive by design: conflicting requests are
//! still recorded ("record intent"), and the conflict is reported to the
//! caller and journaled as `file_conflict` events. Consumers that want
//! refusal enforce it themselves.

use chrono::{DateTime, Duration, Utc};

use crate::adapters::sqlite::event_log::EventLog;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::event::EventPayload;
use crate::domain::models::reservation::{patterns_intersect, Reservation, ReservationConflict};
use crate::services::mailbox::SessionRegistry;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReservationConfig {
    pub default_ttl_seconds: i64,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 3600,
        }
    }
}

/// Input for `reserve`.
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub paths: Vec<String>,
    pub reason: Option<String>,
    pub exclusive: bool,
    pub ttl_seconds: Option<i64>,
}

impl Default for ReserveRequest {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            reason: None,
            exclusive: true,
            ttl_seconds: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GrantedReservation {
    pub id: i64,
    pub path: String,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of `reserve`. Grants are always written; `conflicts` and
/// `warning` report collisions with other agents' live exclusive leases.
#[derive(Debug, Clone)]
pub struct ReserveOutcome {
    pub granted: Vec<GrantedReservation>,
    pub conflicts: Vec<ReservationConflict>,
    pub warning: Option<String>,
}

/// Input for `release`. With neither ids nor paths, every live
/// reservation held by the agent is released.
#[derive(Debug, Clone, Default)]
pub struct ReleaseRequest {
    pub paths: Option<Vec<String>>,
    pub reservation_ids: Option<Vec<i64>>,
}

#[derive(Debug, Clone)]
pub struct ReleaseOutcome {
    pub released: usize,
    pub reservation_ids: Vec<i64>,
}

#[derive(Clone)]
pub struct Reservations {
    log: EventLog,
    registry: SessionRegistry,
    config: ReservationConfig,
}

impl Reservations {
    pub fn new(log: EventLog, registry: SessionRegistry, config: ReservationConfig) -> Self {
        Self {
            log,
            registry,
            config,
        }
    }

    /// Reserve path patterns for `agent`.
    pub async fn reserve(
        &self,
        project_key: &str,
        agent: &str,
        request: ReserveRequest,
    ) -> DomainResult<ReserveOutcome> {
        self.require_session(project_key, agent).await?;
        if request.paths.is_empty() {
            return Err(DomainError::Validation("no paths to reserve".to_string()));
        }

        let now = Utc::now();
        let ttl = request.ttl_seconds.unwrap_or(self.config.default_ttl_seconds);
        let expires_at = now + Duration::seconds(ttl.max(1));

        let live = self.live_reservations(project_key, now).await?;

        let mut conflicts = Vec::new();
        let mut payloads = Vec::with_capacity(request.paths.len());
        for path in &request.paths {
            let mut holders: Vec<String> = live
                .iter()
                .filter(|r| {
                    r.agent != agent && r.exclusive && patterns_intersect(&r.path_pattern, path)
                })
                .map(|r| r.agent.clone())
                .collect();
            holders.sort();
            holders.dedup();
            if !holders.is_empty() {
                conflicts.push(ReservationConflict {
                    path: path.clone(),
                    holders,
                });
            }
        }

        for path in &request.paths {
            payloads.push(EventPayload::FileReserved {
                agent: agent.to_string(),
                path_pattern: path.clone(),
                reason: request.reason.clone(),
                exclusive: request.exclusive,
                expires_at_ms: expires_at.timestamp_millis(),
            });
        }
        for conflict in &conflicts {
            payloads.push(EventPayload::FileConflict {
                requesting_agent: agent.to_string(),
                path: conflict.path.clone(),
                holders: conflict.holders.clone(),
            });
        }

        let events = self.log.append_all(project_key, payloads).await?;
        let granted = events
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::FileReserved { .. }))
            .zip(request.paths.iter())
            .map(|(event, path)| GrantedReservation {
                id: event.sequence,
                path: path.clone(),
                expires_at,
            })
            .collect();

        let warning = if conflicts.is_empty() {
            None
        } else {
            Some(
                conflicts
                    .iter()
                    .map(|c| format!("{} already reserved by {}", c.path, c.holders.join(", ")))
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        };
        if let Some(warning) = &warning {
            tracing::warn!(agent, %warning, "reservation conflict");
        }

        Ok(ReserveOutcome {
            granted,
            conflicts,
            warning,
        })
    }

    /// Release reservations held by `agent`.
    pub async fn release(
        &self,
        project_key: &str,
        agent: &str,
        request: ReleaseRequest,
    ) -> DomainResult<ReleaseOutcome> {
        self.require_session(project_key, agent).await?;
        let now = Utc::now();
        let mine: Vec<Reservation> = self
            .live_reservations(project_key, now)
            .await?
            .into_iter()
            .filter(|r| r.agent == agent)
            .collect();

        let matching: Vec<&Reservation> = match (&request.reservation_ids, &request.paths) {
            (Some(ids), _) => mine.iter().filter(|r| ids.contains(&r.id)).collect(),
            (None, Some(paths)) => mine
                .iter()
                .filter(|r| paths.iter().any(|p| p == &r.path_pattern))
                .collect(),
            (None, None) => mine.iter().collect(),
        };

        let reservation_ids: Vec<i64> = matching.iter().map(|r| r.id).collect();
        let paths: Vec<String> = matching.iter().map(|r| r.path_pattern.clone()).collect();
        if reservation_ids.is_empty() {
            return Ok(ReleaseOutcome {
                released: 0,
                reservation_ids,
            });
        }

        self.log
            .append(
                project_key,
                EventPayload::FileReleased {
                    agent: agent.to_string(),
                    reservation_ids: reservation_ids.clone(),
                    paths,
                },
            )
            .await?;

        Ok(ReleaseOutcome {
            released: reservation_ids.len(),
            reservation_ids,
        })
    }

    /// Live reservations for a project at `now`.
    pub async fn live_reservations(
        &self,
        project_key: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<Reservation>> {
        let rows: Vec<ReservationRow> = sqlx::query_as(
            "SELECT id, project_key, agent, path_pattern, reason, exclusive, created_at,
                    expires_at, released_at
             FROM reservations
             WHERE project_key = ? AND released_at IS NULL AND expires_at > ?
             ORDER BY id ASC",
        )
        .bind(project_key)
        .bind(now.timestamp_millis())
        .fetch_all(self.log.pool())
        .await?;
        rows.into_iter().map(ReservationRow::into_reservation).collect()
    }

    async fn require_session(&self, project_key: &str, agent: &str) -> DomainResult<()> {
        if self.registry.contains(project_key, agent).await {
            Ok(())
        } else {
            Err(DomainError::NotInitialized(agent.to_string()))
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReservationRow {
    id: i64,
    project_key: String,
    agent: String,
    path_pattern: String,
    reason: Option<String>,
    exclusive: i64,
    created_at: i64,
    expires_at: i64,
    released_at: Option<i64>,
}

impl ReservationRow {
    fn into_reservation(self) -> DomainResult<Reservation> {
        let ts = |ms: i64| {
            DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| DomainError::Validation(format!("bad timestamp {ms}")))
        };
        Ok(Reservation {
            id: self.id,
            project_key: self.project_key,
            agent: self.agent,
            path_pattern: self.path_pattern,
            reason: self.reason,
            exclusive: self.exclusive != 0,
            created_at: ts(self.created_at)?,
            expires_at: ts(self.expires_at)?,
            released_at: self.released_at.map(ts).transpose()?,
        })
    }
}
