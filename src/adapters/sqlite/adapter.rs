//! Storage adapter: the one surface through which raw SQL reaches the
//! embedded engine.
//!
//! Typed repositories speak sqlx directly; this adapter exists for the
//! places where query text arrives as data (the analytics runner, the
//! migration runner) and therefore needs placeholder normalization and
//! uniform row decoding.

use serde_json::{json, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, SqlitePool};

use super::placeholders::convert_placeholders;
use crate::domain::errors::DomainResult;

/// SQL dialect tag carried by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
}

/// Decoded result set: column names plus JSON-encoded cell values.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Clone)]
pub struct StorageAdapter {
    pool: SqlitePool,
    dialect: Dialect,
}

impl StorageAdapter {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            dialect: Dialect::Sqlite,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run a query written with `$N` placeholders against the engine.
    pub async fn query(&self, sql: &str, params: &[Value]) -> DomainResult<RowSet> {
        let (sql, bound) = convert_placeholders(sql, params)?;
        let mut query = sqlx::query(&sql);
        for value in &bound {
            query = bind_value(query, value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(decode_rows(&rows))
    }

    /// Execute a statement; returns affected row count.
    pub async fn exec(&self, sql: &str) -> DomainResult<u64> {
        let result = sqlx::query(sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Flush the write-ahead log into the main database file.
    pub async fn checkpoint(&self) -> DomainResult<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

type SqliteQuery<'q> =
    sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

/// Bind a JSON value to the next placeholder. Arrays and objects are
/// bound as their canonical JSON text.
pub fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

fn decode_rows(rows: &[SqliteRow]) -> RowSet {
    let columns = rows.first().map_or_else(Vec::new, |row| {
        row.columns().iter().map(|c| c.name().to_string()).collect()
    });
    let decoded = rows
        .iter()
        .map(|row| (0..row.columns().len()).map(|i| column_value(row, i)).collect())
        .collect();
    RowSet {
        columns,
        rows: decoded,
    }
}

/// Decode one cell into JSON, trying the SQLite storage classes in turn.
fn column_value(row: &SqliteRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map_or(Value::Null, |x| json!(x));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map_or(Value::Null, |x| json!(x));
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map_or(Value::Null, Value::String);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v.map_or(Value::Null, |bytes| {
            Value::String(bytes.iter().map(|b| format!("{b:02x}")).collect())
        });
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::create_test_pool;

    #[tokio::test]
    async fn query_normalizes_pg_placeholders() {
        let pool = create_test_pool().await.unwrap();
        let adapter = StorageAdapter::new(pool);
        adapter
            .exec("CREATE TABLE t (a TEXT, b INTEGER)")
            .await
            .unwrap();
        adapter
            .query("INSERT INTO t (a, b) VALUES ($1, $2)", &[json!("x"), json!(7)])
            .await
            .unwrap();

        let result = adapter
            .query("SELECT a, b FROM t WHERE b = ANY($1)", &[json!([7, 9])])
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["a", "b"]);
        assert_eq!(result.rows, vec![vec![json!("x"), json!(7)]]);
    }

    #[tokio::test]
    async fn null_cells_decode_as_null() {
        let pool = create_test_pool().await.unwrap();
        let adapter = StorageAdapter::new(pool);
        adapter.exec("CREATE TABLE t (a TEXT)").await.unwrap();
        adapter
            .query("INSERT INTO t (a) VALUES ($1)", &[Value::Null])
            .await
            .unwrap();
        let result = adapter.query("SELECT a FROM t", &[]).await.unwrap();
        assert_eq!(result.rows, vec![vec![Value::Null]]);
    }
}
