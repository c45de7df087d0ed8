//! Analytics query builder and result encoders.
//!
//! A fluent composer accumulates clauses and `$N`-style parameters in
//! call order; the storage adapter normalizes placeholders when the query
//! runs. Results can be rendered as an aligned text table, compact JSON,
//! JSONL, or RFC-4180 CSV.

use serde_json::Value;

use crate::adapters::sqlite::adapter::StorageAdapter;
use crate::domain::errors::{DomainError, DomainResult};

/// A built query, ready to run.
#[derive(Debug, Clone)]
pub struct AnalyticsQuery {
    pub name: String,
    pub description: String,
    pub sql: String,
    pub parameters: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    name: String,
    description: String,
    selects: Vec<String>,
    from: Option<String>,
    wheres: Vec<String>,
    group_bys: Vec<String>,
    havings: Vec<String>,
    order_bys: Vec<String>,
    limit: Option<i64>,
    parameters: Vec<Value>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, expr: impl Into<String>) -> Self {
        self.selects.push(expr.into());
        self
    }

    pub fn from(mut self, table: impl Into<String>) -> Self {
        self.from = Some(table.into());
        self
    }

    /// Add a WHERE condition. Placeholders in `cond` are `$N`, numbered
    /// against the builder's accumulated parameter list.
    pub fn where_clause(mut self, cond: impl Into<String>, params: Vec<Value>) -> Self {
        self.wheres.push(cond.into());
        self.parameters.extend(params);
        self
    }

    pub fn group_by(mut self, expr: impl Into<String>) -> Self {
        self.group_bys.push(expr.into());
        self
    }

    pub fn having(mut self, cond: impl Into<String>, params: Vec<Value>) -> Self {
        self.havings.push(cond.into());
        self.parameters.extend(params);
        self
    }

    pub fn order_by(mut self, expr: impl Into<String>) -> Self {
        self.order_bys.push(expr.into());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Render the SQL with the canonical clause order:
    /// SELECT FROM WHERE GROUP BY HAVING ORDER BY LIMIT.
    pub fn build(self) -> DomainResult<AnalyticsQuery> {
        let from = self
            .from
            .ok_or_else(|| DomainError::Validation("query has no FROM table".to_string()))?;
        let mut sql = String::from("SELECT ");
        if self.selects.is_empty() {
            sql.push('*');
        } else {
            sql.push_str(&self.selects.join(", "));
        }
        sql.push_str(" FROM ");
        sql.push_str(&from);
        if !self.wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.wheres.join(" AND "));
        }
        if !self.group_bys.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group_bys.join(", "));
        }
        if !self.havings.is_empty() {
            sql.push_str(" HAVING ");
            sql.push_str(&self.havings.join(" AND "));
        }
        if !self.order_bys.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_bys.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        Ok(AnalyticsQuery {
            name: self.name,
            description: self.description,
            sql,
            parameters: self.parameters,
        })
    }
}

/// Result of running an analytics query.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub execution_time_ms: u64,
}

/// Execute a built query through the storage adapter.
pub async fn run_query(
    adapter: &StorageAdapter,
    query: &AnalyticsQuery,
) -> DomainResult<QueryResult> {
    let started = std::time::Instant::now();
    let rows = adapter.query(&query.sql, &query.parameters).await?;
    let execution_time_ms = started.elapsed().as_millis() as u64;
    Ok(QueryResult {
        row_count: rows.rows.len(),
        columns: rows.columns,
        rows: rows.rows,
        execution_time_ms,
    })
}

/// Output encodings for a `QueryResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    Jsonl,
    Csv,
}

pub fn format_result(result: &QueryResult, format: OutputFormat) -> String {
    match format {
        OutputFormat::Table => format_table(result),
        OutputFormat::Json => format_json(result),
        OutputFormat::Jsonl => format_jsonl(result),
        OutputFormat::Csv => format_csv(result),
    }
}

/// Aligned text table with a row-count footer.
fn format_table(result: &QueryResult) -> String {
    let mut widths: Vec<usize> = result.columns.iter().map(String::len).collect();
    let cells: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| row.iter().map(cell_text).collect())
        .collect();
    for row in &cells {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() && cell.len() > widths[i] {
                widths[i] = cell.len();
            }
        }
    }

    let mut out = String::new();
    let header: Vec<String> = result
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{:<width$}", c, width = widths[i]))
        .collect();
    out.push_str(&header.join(" | "));
    out.push('\n');
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&rule.join("-+-"));
    out.push('\n');
    for row in &cells {
        let line: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let width = widths.get(i).copied().unwrap_or(cell.len());
                format!("{cell:<width$}")
            })
            .collect();
        out.push_str(&line.join(" | "));
        out.push('\n');
    }
    out.push_str(&format!(
        "({} row{})",
        result.row_count,
        if result.row_count == 1 { "" } else { "s" }
    ));
    out
}

/// Compact JSON: an array of column-keyed objects.
fn format_json(result: &QueryResult) -> String {
    Value::Array(result.rows.iter().map(|row| row_object(result, row)).collect()).to_string()
}

/// One JSON object per line.
fn format_jsonl(result: &QueryResult) -> String {
    result
        .rows
        .iter()
        .map(|row| row_object(result, row).to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// RFC-4180: quote fields containing comma, quote, or newline; double
/// embedded quotes; nulls become empty fields.
fn format_csv(result: &QueryResult) -> String {
    let mut out = String::new();
    out.push_str(
        &result
            .columns
            .iter()
            .map(|c| csv_field(c))
            .collect::<Vec<_>>()
            .join(","),
    );
    for row in &result.rows {
        out.push_str("\r\n");
        out.push_str(
            &row.iter()
                .map(|v| match v {
                    Value::Null => String::new(),
                    other => csv_field(&cell_text(other)),
                })
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    out
}

fn row_object(result: &QueryResult, row: &[Value]) -> Value {
    let mut object = serde_json::Map::with_capacity(result.columns.len());
    for (i, column) in result.columns.iter().enumerate() {
        object.insert(column.clone(), row.get(i).cloned().unwrap_or(Value::Null));
    }
    Value::Object(object)
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_orders_clauses_canonically() {
        let query = QueryBuilder::new()
            .with_name("cells-by-status")
            .with_description("cell counts per status")
            .select("status")
            .select("COUNT(*) AS n")
            .from("cells")
            .where_clause("project_key = $1", vec![json!("/p")])
            .group_by("status")
            .having("COUNT(*) > $2", vec![json!(1)])
            .order_by("n DESC")
            .limit(10)
            .build()
            .unwrap();

        assert_eq!(
            query.sql,
            "SELECT status, COUNT(*) AS n FROM cells WHERE project_key = $1 \
             GROUP BY status HAVING COUNT(*) > $2 ORDER BY n DESC LIMIT 10"
        );
        assert_eq!(query.parameters, vec![json!("/p"), json!(1)]);
        assert_eq!(query.name, "cells-by-status");
    }

    #[test]
    fn parameters_accumulate_in_call_order() {
        let query = QueryBuilder::new()
            .from("t")
            .where_clause("a = $1", vec![json!(1)])
            .where_clause("b = $2", vec![json!(2)])
            .having("c = $3", vec![json!(3)])
            .build()
            .unwrap();
        assert_eq!(query.parameters, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn build_requires_from() {
        assert!(QueryBuilder::new().select("1").build().is_err());
    }

    fn sample_result() -> QueryResult {
        QueryResult {
            columns: vec!["name".to_string(), "count".to_string()],
            rows: vec![
                vec![json!("mail"), json!(3)],
                vec![json!("res,ervation"), json!(1)],
                vec![Value::Null, json!(0)],
            ],
            row_count: 3,
            execution_time_ms: 2,
        }
    }

    #[test]
    fn table_aligns_and_counts() {
        let text = format_table(&sample_result());
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("name"));
        assert!(lines[1].contains("-+-"));
        assert_eq!(lines.last().unwrap(), &"(3 rows)");
        // All data lines align on the separator.
        let column = lines[0].find('|').unwrap();
        assert_eq!(lines[2].find('|').unwrap(), column);
        assert_eq!(lines[3].find('|').unwrap(), column);
    }

    #[test]
    fn json_and_jsonl_are_column_keyed() {
        let result = sample_result();
        let json_text = format_json(&result);
        let parsed: Value = serde_json::from_str(&json_text).unwrap();
        assert_eq!(parsed[0]["name"], "mail");
        assert_eq!(parsed[2]["name"], Value::Null);

        let jsonl = format_jsonl(&result);
        assert_eq!(jsonl.lines().count(), 3);
        let first: Value = serde_json::from_str(jsonl.lines().next().unwrap()).unwrap();
        assert_eq!(first["count"], 3);
    }

    #[test]
    fn csv_quotes_and_escapes() {
        let result = QueryResult {
            columns: vec!["a".to_string(), "b".to_string()],
            rows: vec![vec![json!("plain"), json!("has,comma")], vec![
                json!("has \"quote\""),
                Value::Null,
            ]],
            row_count: 2,
            execution_time_ms: 0,
        };
        let csv = format_csv(&result);
        let lines: Vec<&str> = csv.split("\r\n").collect();
        assert_eq!(lines[0], "a,b");
        assert_eq!(lines[1], "plain,\"has,comma\"");
        assert_eq!(lines[2], "\"has \"\"quote\"\"\",");
    }
}
