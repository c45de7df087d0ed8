//! Domain errors for the apiary coordination substrate.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Domain-level errors surfaced by substrate operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Operation requires an agent session that does not exist.
    #[error("Agent '{0}' is not initialized; call init first")]
    NotInitialized(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Exclusive reservation collision. Under the permissive grant policy
    /// this is reported inside reserve outcomes as a warning; it is raised
    /// as an error only by consumers that choose to enforce refusal.
    #[error("Path '{path}' already reserved by {holders:?}")]
    ReservationConflict { path: String, holders: Vec<String> },

    #[error("Dependency from '{from}' to '{to}' would introduce a cycle")]
    Cycle { from: String, to: String },

    #[error("Could not acquire lock '{resource}' after {attempts} attempts")]
    LockTimeout { resource: String, attempts: u32 },

    #[error("Lock '{resource}' is held by '{holder}'")]
    LockContention { resource: String, holder: String },

    #[error("Lock '{resource}' is not held by '{holder}'")]
    LockNotHeld { resource: String, holder: String },

    #[error("Timed out waiting for {what} after {waited_ms}ms")]
    Timeout { what: String, waited_ms: u64 },

    /// A deferred was rejected by its resolver.
    #[error("Deferred {url} rejected: {error}")]
    DeferredRejected { url: String, error: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    /// Migration refuses to recreate a populated table with a type mismatch.
    #[error("Schema drift on table '{table}' with {rows} existing rows; refusing destructive recreate")]
    SchemaDrift { table: String, rows: u64 },

    #[error("Inference client unavailable: {0}")]
    InferenceUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Validation(err.to_string())
    }
}

/// Structured context attached to error reports at the host boundary.
///
/// Built from the event log so an agent runtime can show what the
/// substrate was doing right before the failure.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ErrorContext {
    pub agent: Option<String>,
    pub cell_id: Option<String>,
    pub epic_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub sequence: Option<i64>,
    /// Short `sequence: type` descriptions of the last few events.
    pub recent_events: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn cell(mut self, cell_id: impl Into<String>) -> Self {
        self.cell_id = Some(cell_id.into());
        self
    }

    pub fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}
