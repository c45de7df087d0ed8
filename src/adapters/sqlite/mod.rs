//! SQLite storage adapters.

pub mod adapter;
pub mod connection;
pub mod event_log;
pub mod memory_repository;
pub mod migrations;
pub mod placeholders;
pub mod projections;
pub mod schema;

pub use adapter::{Dialect, RowSet, StorageAdapter};
pub use connection::{create_pool, create_test_pool, verify_connection, ConnectionError, PoolConfig};
pub use event_log::{EventFilter, EventLog};
pub use memory_repository::MemoryRepository;
pub use migrations::{MigrationError, MigrationReport, Migrator};
pub use schema::{declared_schema, ColType, ColumnSpec, IndexSpec, TableSpec};
