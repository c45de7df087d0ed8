//! Schema migration management.
//!
//! The runner reconciles the live schema against the declared table
//! descriptors: missing tables are created, missing columns added with
//! constant defaults, and type mismatches recreate the table only when it
//! is empty. A populated table with a type mismatch is never touched —
//! the run fails naming the table and its row count.

use sqlx::{Row, SqlitePool};
use thiserror::Error;

use super::schema::{declared_schema, ColType, ColumnSpec, TableSpec, SCHEMA_REVISION};
use crate::domain::errors::DomainError;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Failed to migrate table {table}: {source}")]
    ExecutionError {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("Failed to get schema version: {0}")]
    VersionCheckError(#[source] sqlx::Error),
    #[error("Table '{table}' has {rows} rows and a column type mismatch on '{column}'; refusing destructive recreate")]
    Drift {
        table: String,
        column: String,
        rows: u64,
    },
}

impl From<MigrationError> for DomainError {
    fn from(err: MigrationError) -> Self {
        match err {
            MigrationError::Drift { table, rows, .. } => DomainError::SchemaDrift { table, rows },
            other => DomainError::Storage(other.to_string()),
        }
    }
}

/// What a migration run changed.
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub created_tables: Vec<String>,
    pub added_columns: Vec<String>,
    pub recreated_tables: Vec<String>,
    pub version: i64,
}

pub struct Migrator {
    pool: SqlitePool,
}

#[derive(Debug)]
struct LiveColumn {
    name: String,
    col_type: ColType,
}

impl Migrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Reconcile the live schema with the declared one.
    pub async fn run(&self) -> Result<MigrationReport, MigrationError> {
        self.ensure_version_table().await?;
        let mut report = MigrationReport::default();

        for table in declared_schema() {
            self.sync_table(&table, &mut report).await?;
        }

        let current = self.current_version().await?;
        if current < SCHEMA_REVISION {
            sqlx::query(
                "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?, ?)",
            )
            .bind(SCHEMA_REVISION)
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| exec_err("schema_version", e))?;
        }
        report.version = SCHEMA_REVISION;

        // Flush the write-ahead log so other processes see a settled file.
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(|e| exec_err("wal_checkpoint", e))?;

        Ok(report)
    }

    pub async fn current_version(&self) -> Result<i64, MigrationError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_version")
                .fetch_optional(&self.pool)
                .await
                .map_err(MigrationError::VersionCheckError)?;
        Ok(row.map(|(v,)| v).unwrap_or(0))
    }

    async fn ensure_version_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| exec_err("schema_version", e))?;
        Ok(())
    }

    async fn sync_table(
        &self,
        table: &TableSpec,
        report: &mut MigrationReport,
    ) -> Result<(), MigrationError> {
        let exists = self.table_exists(table.name).await?;

        if table.virtual_sql.is_some() {
            if !exists {
                self.create_table(table, report).await?;
            }
            return Ok(());
        }

        if !exists {
            self.create_table(table, report).await?;
            return Ok(());
        }

        let live = self.live_columns(table.name).await?;

        // Legacy cursor layout predates the (stream, checkpoint) key.
        // Cursor rows are ephemeral, so drop and recreate.
        if table.name == "cursors" && live.iter().any(|c| c.name == "stream_id") {
            self.drop_and_create(table, report).await?;
            return Ok(());
        }

        for declared in &table.columns {
            match live.iter().find(|c| c.name == declared.name) {
                None => {
                    self.add_column(table.name, declared).await?;
                    report
                        .added_columns
                        .push(format!("{}.{}", table.name, declared.name));
                }
                Some(live_col) if live_col.col_type != declared.col_type => {
                    let rows = self.row_count(table.name).await?;
                    if rows > 0 {
                        return Err(MigrationError::Drift {
                            table: table.name.to_string(),
                            column: declared.name.to_string(),
                            rows,
                        });
                    }
                    self.drop_and_create(table, report).await?;
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        for sql in table.index_sql() {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| exec_err(table.name, e))?;
        }
        Ok(())
    }

    async fn create_table(
        &self,
        table: &TableSpec,
        report: &mut MigrationReport,
    ) -> Result<(), MigrationError> {
        sqlx::query(&table.create_sql())
            .execute(&self.pool)
            .await
            .map_err(|e| exec_err(table.name, e))?;
        for sql in table.index_sql() {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| exec_err(table.name, e))?;
        }
        report.created_tables.push(table.name.to_string());
        Ok(())
    }

    async fn drop_and_create(
        &self,
        table: &TableSpec,
        report: &mut MigrationReport,
    ) -> Result<(), MigrationError> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table.name))
            .execute(&self.pool)
            .await
            .map_err(|e| exec_err(table.name, e))?;
        self.create_table(table, report).await?;
        report.created_tables.retain(|t| t != table.name);
        report.recreated_tables.push(table.name.to_string());
        Ok(())
    }

    /// `ALTER TABLE … ADD COLUMN` with a constant default. The engine
    /// rejects non-constant defaults in ALTER, so a declared non-constant
    /// default is synthesized as the type-appropriate constant.
    async fn add_column(
        &self,
        table_name: &str,
        column: &ColumnSpec,
    ) -> Result<(), MigrationError> {
        let default = column
            .default
            .filter(|d| is_constant_default(d))
            .unwrap_or_else(|| column.col_type.constant_default());
        let mut sql = format!(
            "ALTER TABLE {table_name} ADD COLUMN {} {}",
            column.name,
            column.col_type.as_sql()
        );
        if column.not_null {
            sql.push_str(" NOT NULL");
            sql.push_str(&format!(" DEFAULT {default}"));
        } else if column.default.is_some() {
            sql.push_str(&format!(" DEFAULT {default}"));
        }
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| exec_err(table_name, e))?;
        Ok(())
    }

    async fn table_exists(&self, name: &str) -> Result<bool, MigrationError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE (type = 'table' OR type = 'view') AND name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| exec_err(name, e))?;
        Ok(row.is_some())
    }

    async fn live_columns(&self, table_name: &str) -> Result<Vec<LiveColumn>, MigrationError> {
        let rows = sqlx::query(&format!("PRAGMA table_info({table_name})"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| exec_err(table_name, e))?;
        Ok(rows
            .iter()
            .map(|row| LiveColumn {
                name: row.get::<String, _>("name"),
                col_type: normalize_type(&row.get::<String, _>("type")),
            })
            .collect())
    }

    async fn row_count(&self, table_name: &str) -> Result<u64, MigrationError> {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table_name}"))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| exec_err(table_name, e))?;
        Ok(count.max(0) as u64)
    }
}

fn exec_err(table: &str, source: sqlx::Error) -> MigrationError {
    MigrationError::ExecutionError {
        table: table.to_string(),
        source,
    }
}

/// Map a declared SQL type string to the engine's storage class, following
/// the engine's affinity rules.
fn normalize_type(declared: &str) -> ColType {
    let upper = declared.to_uppercase();
    if upper.contains("INT") {
        ColType::Integer
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        ColType::Text
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        ColType::Real
    } else if upper.is_empty() || upper.contains("BLOB") {
        ColType::Blob
    } else {
        // NUMERIC and friends land on REAL, the closest storage class.
        ColType::Real
    }
}

/// A default is constant when it is a literal, not an expression.
fn is_constant_default(default: &str) -> bool {
    !default.contains('(')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::create_test_pool;

    #[tokio::test]
    async fn run_creates_all_declared_tables() {
        let pool = create_test_pool().await.unwrap();
        let migrator = Migrator::new(pool.clone());
        let report = migrator.run().await.unwrap();
        assert!(report.created_tables.iter().any(|t| t == "events"));
        assert!(report.created_tables.iter().any(|t| t == "memories_fts"));

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let pool = create_test_pool().await.unwrap();
        let migrator = Migrator::new(pool);
        migrator.run().await.unwrap();
        let second = migrator.run().await.unwrap();
        assert!(second.created_tables.is_empty());
        assert!(second.added_columns.is_empty());
        assert_eq!(second.version, SCHEMA_REVISION);
    }

    #[tokio::test]
    async fn missing_column_is_added() {
        let pool = create_test_pool().await.unwrap();
        // Pre-create messages without the importance column.
        sqlx::query(
            "CREATE TABLE messages (id INTEGER PRIMARY KEY, project_key TEXT NOT NULL,
             from_agent TEXT NOT NULL, subject TEXT NOT NULL, body TEXT NOT NULL,
             thread_id TEXT, ack_required INTEGER NOT NULL DEFAULT 0,
             created_at INTEGER NOT NULL)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let migrator = Migrator::new(pool);
        let report = migrator.run().await.unwrap();
        assert!(report
            .added_columns
            .iter()
            .any(|c| c == "messages.importance"));
    }

    #[tokio::test]
    async fn empty_table_with_type_mismatch_is_recreated() {
        let pool = create_test_pool().await.unwrap();
        sqlx::query("CREATE TABLE locks (resource TEXT PRIMARY KEY, holder TEXT NOT NULL, seq TEXT NOT NULL, acquired_at INTEGER NOT NULL, expires_at INTEGER NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();

        let migrator = Migrator::new(pool);
        let report = migrator.run().await.unwrap();
        assert!(report.recreated_tables.iter().any(|t| t == "locks"));
    }

    #[tokio::test]
    async fn populated_table_with_type_mismatch_is_refused() {
        let pool = create_test_pool().await.unwrap();
        sqlx::query(
            "CREATE TABLE messages (id INTEGER PRIMARY KEY, project_key INTEGER NOT NULL,
             from_agent TEXT NOT NULL, subject TEXT NOT NULL, body TEXT NOT NULL,
             thread_id TEXT, importance TEXT NOT NULL DEFAULT 'normal',
             ack_required INTEGER NOT NULL DEFAULT 0, created_at INTEGER NOT NULL)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO messages (id, project_key, from_agent, subject, body, created_at)
             VALUES (1, 42, 'a', 's', 'b', 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let migrator = Migrator::new(pool.clone());
        let err = migrator.run().await.unwrap_err();
        match err {
            MigrationError::Drift { table, rows, .. } => {
                assert_eq!(table, "messages");
                assert_eq!(rows, 1);
            }
            other => panic!("expected Drift, got {other:?}"),
        }

        // The offending row is preserved.
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn legacy_cursor_table_is_recreated() {
        let pool = create_test_pool().await.unwrap();
        sqlx::query(
            "CREATE TABLE cursors (stream_id TEXT PRIMARY KEY, position INTEGER NOT NULL)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO cursors (stream_id, position) VALUES ('mail', 3)")
            .execute(&pool)
            .await
            .unwrap();

        let migrator = Migrator::new(pool.clone());
        let report = migrator.run().await.unwrap();
        assert!(report.recreated_tables.iter().any(|t| t == "cursors"));

        // New layout, old ephemeral rows gone.
        let rows = sqlx::query("PRAGMA table_info(cursors)")
            .fetch_all(&pool)
            .await
            .unwrap();
        let names: Vec<String> = rows.iter().map(|r| r.get::<String, _>("name")).collect();
        assert!(names.contains(&"stream".to_string()));
        assert!(names.contains(&"checkpoint".to_string()));
        assert!(!names.contains(&"stream_id".to_string()));
    }
}
