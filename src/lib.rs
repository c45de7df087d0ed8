//! Apiary - durable coordination substrate for agent swarms
//!
//! A single-host, multi-process coordination library for teams of
//! autonomous coding agents sharing a repository:
//! - Append-only event log with materialized projections
//! - Actor-style mailboxes with inbox ceilings and body-on-demand
//! - TTL-scoped file reservations with conflict reporting
//! - CAS-based durable locks and durable deferreds
//! - Event-sourced work items ("cells") with epics and dependencies
//! - Semantic memory with decay, temporal validity, and smart upsert
//! - SQLite storage with WAL mode and schema-drift-aware migrations

pub mod adapters;
pub mod config;
pub mod domain;
pub mod logging;
pub mod services;
pub mod substrate;

// Re-export the surface most hosts touch.
pub use adapters::sqlite::{EventFilter, EventLog, Migrator, StorageAdapter};
pub use config::{Config, ConfigLoader};
pub use domain::errors::{DomainError, DomainResult, ErrorContext};
pub use domain::models::{
    Cell, CellRelationship, CellStatus, CellType, Event, EventPayload, EventStream, Importance,
    Memory, Message, NewCell, Reservation,
};
pub use domain::ports::{InferenceClient, NullInferenceClient};
pub use services::{
    DeferredManager, Hive, LockManager, Mailbox, MemoryStore, QueryBuilder, Replay,
    Reservations, SessionRegistry,
};
pub use substrate::Substrate;
