//! Swarm Mail: actor-style mailboxes over the event log.
//!
//! The inbox ceiling and body-on-demand policy are hard contracts, not
//! presentation choices: agents have finite context windows, and an
//! unpaginated dump of full bodies would blow them up.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::adapters::sqlite::event_log::EventLog;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::agent::{generate_agent_name, Agent};
use crate::domain::models::event::{EventPayload, Importance};
use crate::domain::models::message::{Message, MessageRecipient, MessageSummary};

/// Mailbox policy knobs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MailConfig {
    /// Hard ceiling on inbox page size.
    pub max_inbox_limit: i64,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self { max_inbox_limit: 5 }
    }
}

/// An active agent session.
#[derive(Debug, Clone)]
pub struct Session {
    pub project_key: String,
    pub agent: String,
    pub started_at: DateTime<Utc>,
}

/// Explicit in-process session registry, owned by the embedding process.
/// Tests call `clear`; there is no ambient global.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<(String, String), Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Session) -> bool {
        let key = (session.project_key.clone(), session.agent.clone());
        self.inner.write().await.insert(key, session).is_some()
    }

    pub async fn contains(&self, project_key: &str, agent: &str) -> bool {
        self.inner
            .read()
            .await
            .contains_key(&(project_key.to_string(), agent.to_string()))
    }

    pub async fn remove(&self, project_key: &str, agent: &str) -> Option<Session> {
        self.inner
            .write()
            .await
            .remove(&(project_key.to_string(), agent.to_string()))
    }

    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }
}

/// Result of `init`.
#[derive(Debug, Clone)]
pub struct InitOutcome {
    pub agent: String,
    pub project_key: String,
    pub already_initialized: bool,
}

/// Input for `send`.
#[derive(Debug, Clone, Default)]
pub struct SendMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub thread_id: Option<String>,
    pub importance: Importance,
    pub ack_required: bool,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message_id: i64,
    pub recipients: usize,
}

/// Inbox query parameters.
#[derive(Debug, Clone, Default)]
pub struct InboxQuery {
    pub limit: Option<i64>,
    pub urgent_only: bool,
    pub unread_only: bool,
    pub thread_id: Option<String>,
}

/// Inbox page. `note` points readers at `read_message` for bodies.
#[derive(Debug, Clone)]
pub struct InboxOutcome {
    pub messages: Vec<MessageSummary>,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct AckOutcome {
    pub message_id: i64,
    pub acked: bool,
    pub already_acked: bool,
}

#[derive(Clone)]
pub struct Mailbox {
    log: EventLog,
    registry: SessionRegistry,
    config: MailConfig,
}

impl Mailbox {
    pub fn new(log: EventLog, registry: SessionRegistry, config: MailConfig) -> Self {
        Self {
            log,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Register the agent for `project_path` and open a session.
    ///
    /// Without a name, an adjective-noun one is generated and checked
    /// against already-registered agents. Re-init of an open session is
    /// reported, not rejected.
    pub async fn init(
        &self,
        project_path: &str,
        agent_name: Option<&str>,
        program: Option<String>,
        model: Option<String>,
    ) -> DomainResult<InitOutcome> {
        let project_key = normalize_project_key(project_path);

        let agent = match agent_name {
            Some(name) => name.to_string(),
            None => self.pick_fresh_name(&project_key).await?,
        };

        let already_initialized = self.registry.contains(&project_key, &agent).await;
        self.log
            .append(
                &project_key,
                EventPayload::AgentRegistered {
                    agent: agent.clone(),
                    program,
                    model,
                },
            )
            .await?;

        if !already_initialized {
            self.registry
                .insert(Session {
                    project_key: project_key.clone(),
                    agent: agent.clone(),
                    started_at: Utc::now(),
                })
                .await;
        }

        Ok(InitOutcome {
            agent,
            project_key,
            already_initialized,
        })
    }

    /// Send a message to one or more agents.
    pub async fn send(
        &self,
        project_key: &str,
        from_agent: &str,
        message: SendMessage,
    ) -> DomainResult<SendOutcome> {
        self.require_session(project_key, from_agent).await?;
        if message.to.is_empty() {
            return Err(DomainError::Validation(
                "message has no recipients".to_string(),
            ));
        }
        if message.subject.trim().is_empty() {
            return Err(DomainError::Validation("message subject is empty".to_string()));
        }

        let recipients = message.to.len();
        let event = self
            .log
            .append(
                project_key,
                EventPayload::MessageSent {
                    from: from_agent.to_string(),
                    to: message.to,
                    subject: message.subject,
                    body: message.body,
                    thread_id: message.thread_id,
                    importance: message.importance,
                    ack_required: message.ack_required,
                },
            )
            .await?;

        tracing::debug!(message_id = event.sequence, recipients, "message sent");
        Ok(SendOutcome {
            message_id: event.sequence,
            recipients,
        })
    }

    /// Page of the agent's inbox, newest first (oldest first within an
    /// explicit thread). Bodies are omitted.
    pub async fn inbox(
        &self,
        project_key: &str,
        agent: &str,
        query: InboxQuery,
    ) -> DomainResult<InboxOutcome> {
        self.require_session(project_key, agent).await?;

        let limit = query
            .limit
            .unwrap_or(self.config.max_inbox_limit)
            .clamp(1, self.config.max_inbox_limit);

        let mut sql = String::from(
            "SELECT m.id, m.from_agent, m.subject, m.thread_id, m.importance, m.ack_required,
                    m.created_at, r.read_at
             FROM messages m
             INNER JOIN message_recipients r ON r.message_id = m.id
             WHERE m.project_key = ? AND r.agent = ?",
        );
        if query.urgent_only {
            sql.push_str(" AND m.importance = 'urgent'");
        }
        if query.unread_only {
            sql.push_str(" AND r.read_at IS NULL");
        }
        let order = if query.thread_id.is_some() {
            sql.push_str(" AND m.thread_id = ?");
            " ORDER BY m.created_at ASC, m.id ASC LIMIT ?"
        } else {
            " ORDER BY m.created_at DESC, m.id DESC LIMIT ?"
        };
        sql.push_str(order);

        let mut db_query = sqlx::query_as::<_, InboxRow>(&sql)
            .bind(project_key)
            .bind(agent);
        if let Some(thread_id) = &query.thread_id {
            db_query = db_query.bind(thread_id);
        }
        let rows = db_query.bind(limit).fetch_all(self.log.pool()).await?;

        let messages = rows
            .into_iter()
            .map(InboxRow::into_summary)
            .collect::<DomainResult<Vec<_>>>()?;

        Ok(InboxOutcome {
            messages,
            note: "message bodies omitted; call read_message with a message id to fetch one"
                .to_string(),
        })
    }

    /// Fetch a full message, stamping `message_read` on the recipient's
    /// first read. Subsequent reads are idempotent.
    pub async fn read_message(
        &self,
        project_key: &str,
        agent: &str,
        message_id: i64,
    ) -> DomainResult<Message> {
        self.require_session(project_key, agent).await?;

        let row: Option<MessageRow> = sqlx::query_as(
            "SELECT id, project_key, from_agent, subject, body, thread_id, importance,
                    ack_required, created_at
             FROM messages WHERE id = ? AND project_key = ?",
        )
        .bind(message_id)
        .bind(project_key)
        .fetch_optional(self.log.pool())
        .await?;
        let message = row
            .ok_or_else(|| DomainError::NotFound {
                entity: "message",
                id: message_id.to_string(),
            })?
            .into_message()?;

        let recipient: Option<(Option<i64>,)> = sqlx::query_as(
            "SELECT read_at FROM message_recipients WHERE message_id = ? AND agent = ?",
        )
        .bind(message_id)
        .bind(agent)
        .fetch_optional(self.log.pool())
        .await?;

        match recipient {
            Some((None,)) => {
                self.log
                    .append(
                        project_key,
                        EventPayload::MessageRead {
                            message_id,
                            reader: agent.to_string(),
                        },
                    )
                    .await?;
            }
            Some((Some(_),)) => {}
            None if message.from_agent == agent => {}
            None => {
                return Err(DomainError::NotFound {
                    entity: "message",
                    id: message_id.to_string(),
                });
            }
        }

        Ok(message)
    }

    /// Acknowledge an ack-required message. Idempotent.
    pub async fn ack(
        &self,
        project_key: &str,
        agent: &str,
        message_id: i64,
    ) -> DomainResult<AckOutcome> {
        self.require_session(project_key, agent).await?;

        let row: Option<(i64, Option<i64>)> = sqlx::query_as(
            "SELECT m.ack_required, r.acked_at
             FROM messages m INNER JOIN message_recipients r ON r.message_id = m.id
             WHERE m.id = ? AND m.project_key = ? AND r.agent = ?",
        )
        .bind(message_id)
        .bind(project_key)
        .bind(agent)
        .fetch_optional(self.log.pool())
        .await?;

        let (ack_required, acked_at) = row.ok_or_else(|| DomainError::NotFound {
            entity: "message",
            id: message_id.to_string(),
        })?;

        if ack_required == 0 || acked_at.is_some() {
            return Ok(AckOutcome {
                message_id,
                acked: acked_at.is_some(),
                already_acked: acked_at.is_some(),
            });
        }

        self.log
            .append(
                project_key,
                EventPayload::MessageAcked {
                    message_id,
                    agent: agent.to_string(),
                },
            )
            .await?;
        Ok(AckOutcome {
            message_id,
            acked: true,
            already_acked: false,
        })
    }

    /// Registered agents for a project, most recently active first.
    pub async fn agents(&self, project_key: &str) -> DomainResult<Vec<Agent>> {
        let rows: Vec<(String, String, i64, i64, Option<String>, Option<String>)> =
            sqlx::query_as(
                "SELECT project_key, name, registered_at, last_active_at, program, model
                 FROM agents WHERE project_key = ? ORDER BY last_active_at DESC, name ASC",
            )
            .bind(project_key)
            .fetch_all(self.log.pool())
            .await?;
        rows.into_iter()
            .map(
                |(project_key, name, registered_at, last_active_at, program, model)| {
                    Ok(Agent {
                        project_key,
                        name,
                        registered_at: timestamp(registered_at)?,
                        last_active_at: timestamp(last_active_at)?,
                        program,
                        model,
                    })
                },
            )
            .collect()
    }

    /// Per-recipient delivery state of a message; lets senders check who
    /// has read or acknowledged.
    pub async fn recipients(&self, message_id: i64) -> DomainResult<Vec<MessageRecipient>> {
        let rows: Vec<(i64, String, Option<i64>, Option<i64>)> = sqlx::query_as(
            "SELECT message_id, agent, read_at, acked_at
             FROM message_recipients WHERE message_id = ? ORDER BY agent ASC",
        )
        .bind(message_id)
        .fetch_all(self.log.pool())
        .await?;
        rows.into_iter()
            .map(|(message_id, agent, read_at, acked_at)| {
                Ok(MessageRecipient {
                    message_id,
                    agent,
                    read_at: read_at.map(timestamp).transpose()?,
                    acked_at: acked_at.map(timestamp).transpose()?,
                })
            })
            .collect()
    }

    /// Close the agent's session: releases its live reservations and
    /// drops it from the registry.
    pub async fn end_session(&self, project_key: &str, agent: &str) -> DomainResult<()> {
        self.require_session(project_key, agent).await?;
        self.log
            .append(
                project_key,
                EventPayload::AgentSessionEnded {
                    agent: agent.to_string(),
                },
            )
            .await?;
        self.registry.remove(project_key, agent).await;
        Ok(())
    }

    async fn require_session(&self, project_key: &str, agent: &str) -> DomainResult<()> {
        if self.registry.contains(project_key, agent).await {
            Ok(())
        } else {
            Err(DomainError::NotInitialized(agent.to_string()))
        }
    }

    async fn pick_fresh_name(&self, project_key: &str) -> DomainResult<String> {
        for _ in 0..16 {
            let candidate = generate_agent_name();
            let taken: Option<(String,)> =
                sqlx::query_as("SELECT name FROM agents WHERE project_key = ? AND name = ?")
                    .bind(project_key)
                    .bind(&candidate)
                    .fetch_optional(self.log.pool())
                    .await?;
            if taken.is_none() {
                return Ok(candidate);
            }
        }
        // Name space exhausted under collisions; disambiguate with the
        // would-be event sequence.
        let next = self.log.latest_sequence().await?.unwrap_or(0) + 1;
        Ok(format!("{}-{next}", generate_agent_name()))
    }
}

fn timestamp(ms: i64) -> DomainResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DomainError::Validation(format!("bad timestamp {ms}")))
}

/// Project keys are normalized paths: trailing separators stripped so the
/// same checkout always maps to the same key.
pub fn normalize_project_key(project_path: &str) -> String {
    let trimmed = project_path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InboxRow {
    id: i64,
    from_agent: String,
    subject: String,
    thread_id: Option<String>,
    importance: String,
    ack_required: i64,
    created_at: i64,
    read_at: Option<i64>,
}

impl InboxRow {
    fn into_summary(self) -> DomainResult<MessageSummary> {
        Ok(MessageSummary {
            id: self.id,
            from_agent: self.from_agent,
            subject: self.subject,
            thread_id: self.thread_id,
            importance: Importance::from_str(&self.importance).ok_or_else(|| {
                DomainError::Validation(format!("unknown importance '{}'", self.importance))
            })?,
            ack_required: self.ack_required != 0,
            created_at: DateTime::from_timestamp_millis(self.created_at).ok_or_else(|| {
                DomainError::Validation(format!("bad timestamp {}", self.created_at))
            })?,
            read: self.read_at.is_some(),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: i64,
    project_key: String,
    from_agent: String,
    subject: String,
    body: String,
    thread_id: Option<String>,
    importance: String,
    ack_required: i64,
    created_at: i64,
}

impl MessageRow {
    fn into_message(self) -> DomainResult<Message> {
        Ok(Message {
            id: self.id,
            project_key: self.project_key,
            from_agent: self.from_agent,
            subject: self.subject,
            body: self.body,
            thread_id: self.thread_id,
            importance: Importance::from_str(&self.importance).ok_or_else(|| {
                DomainError::Validation(format!("unknown importance '{}'", self.importance))
            })?,
            ack_required: self.ack_required != 0,
            created_at: DateTime::from_timestamp_millis(self.created_at).ok_or_else(|| {
                DomainError::Validation(format!("bad timestamp {}", self.created_at))
            })?,
        })
    }
}
