//! Declared schema: static table descriptors consumed by the migration
//! runner.
//!
//! Column types are normalized to the engine's storage classes
//! (`INTEGER | TEXT | REAL | BLOB`); timestamps are epoch milliseconds,
//! booleans 0/1, embeddings little-endian f32 blobs.

use crate::domain::models::memory::EMBEDDING_DIM;

/// Current schema revision recorded in `schema_version` after a
/// successful run.
pub const SCHEMA_REVISION: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColType {
    Integer,
    Text,
    Real,
    Blob,
}

impl ColType {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Text => "TEXT",
            Self::Real => "REAL",
            Self::Blob => "BLOB",
        }
    }

    /// Constant default used when adding this column to an existing table.
    pub fn constant_default(self) -> &'static str {
        match self {
            Self::Integer => "0",
            Self::Real => "0.0",
            Self::Text => "''",
            Self::Blob => "X''",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub col_type: ColType,
    pub not_null: bool,
    pub default: Option<&'static str>,
    pub autoincrement: bool,
    /// Declared dimensionality for embedding blobs; informational, the
    /// engine stores a plain blob.
    pub vector_dim: Option<usize>,
}

impl ColumnSpec {
    fn new(name: &'static str, col_type: ColType) -> Self {
        Self {
            name,
            col_type,
            not_null: false,
            default: None,
            autoincrement: false,
            vector_dim: None,
        }
    }

    fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    fn default(mut self, default: &'static str) -> Self {
        self.default = Some(default);
        self
    }

    fn autoincrement(mut self) -> Self {
        self.autoincrement = true;
        self
    }

    fn vector(mut self, dim: usize) -> Self {
        self.vector_dim = Some(dim);
        self
    }
}

#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    pub unique: bool,
}

#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: Vec<ColumnSpec>,
    pub primary_key: &'static [&'static str],
    pub indexes: Vec<IndexSpec>,
    /// Raw creation SQL for virtual tables; drift checking is skipped.
    pub virtual_sql: Option<&'static str>,
}

impl TableSpec {
    /// Render the `CREATE TABLE` statement for this descriptor.
    pub fn create_sql(&self) -> String {
        if let Some(sql) = self.virtual_sql {
            return sql.to_string();
        }
        let single_auto_pk = self.primary_key.len() == 1
            && self
                .columns
                .iter()
                .any(|c| c.name == self.primary_key[0] && c.autoincrement);

        let mut parts: Vec<String> = Vec::with_capacity(self.columns.len() + 1);
        for col in &self.columns {
            let mut part = format!("{} {}", col.name, col.col_type.as_sql());
            if single_auto_pk && col.name == self.primary_key[0] {
                part.push_str(" PRIMARY KEY AUTOINCREMENT");
            }
            if col.not_null {
                part.push_str(" NOT NULL");
            }
            if let Some(default) = col.default {
                part.push_str(" DEFAULT ");
                part.push_str(default);
            }
            parts.push(part);
        }
        if !self.primary_key.is_empty() && !single_auto_pk {
            parts.push(format!("PRIMARY KEY ({})", self.primary_key.join(", ")));
        }
        format!("CREATE TABLE {} ({})", self.name, parts.join(", "))
    }

    pub fn index_sql(&self) -> Vec<String> {
        self.indexes
            .iter()
            .map(|idx| {
                format!(
                    "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                    if idx.unique { "UNIQUE " } else { "" },
                    idx.name,
                    self.name,
                    idx.columns.join(", ")
                )
            })
            .collect()
    }
}

/// The full declared schema, in creation order.
#[allow(clippy::too_many_lines)]
pub fn declared_schema() -> Vec<TableSpec> {
    use ColType::{Blob, Integer, Real, Text};
    vec![
        TableSpec {
            name: "events",
            columns: vec![
                ColumnSpec::new("id", Integer).autoincrement(),
                ColumnSpec::new("sequence", Integer).not_null(),
                ColumnSpec::new("stream", Text).not_null(),
                ColumnSpec::new("project_key", Text).not_null(),
                ColumnSpec::new("entity_id", Text),
                ColumnSpec::new("timestamp", Integer).not_null(),
                ColumnSpec::new("type", Text).not_null(),
                ColumnSpec::new("payload", Text).not_null(),
            ],
            primary_key: &["id"],
            indexes: vec![
                IndexSpec {
                    name: "idx_events_sequence",
                    columns: &["sequence"],
                    unique: true,
                },
                IndexSpec {
                    name: "idx_events_stream_seq",
                    columns: &["stream", "sequence"],
                    unique: false,
                },
                IndexSpec {
                    name: "idx_events_project",
                    columns: &["project_key", "sequence"],
                    unique: false,
                },
                IndexSpec {
                    name: "idx_events_entity",
                    columns: &["entity_id"],
                    unique: false,
                },
            ],
            virtual_sql: None,
        },
        TableSpec {
            name: "agents",
            columns: vec![
                ColumnSpec::new("project_key", Text).not_null(),
                ColumnSpec::new("name", Text).not_null(),
                ColumnSpec::new("registered_at", Integer).not_null(),
                ColumnSpec::new("last_active_at", Integer).not_null(),
                ColumnSpec::new("program", Text),
                ColumnSpec::new("model", Text),
            ],
            primary_key: &["project_key", "name"],
            indexes: vec![],
            virtual_sql: None,
        },
        TableSpec {
            name: "messages",
            columns: vec![
                ColumnSpec::new("id", Integer).not_null(),
                ColumnSpec::new("project_key", Text).not_null(),
                ColumnSpec::new("from_agent", Text).not_null(),
                ColumnSpec::new("subject", Text).not_null(),
                ColumnSpec::new("body", Text).not_null(),
                ColumnSpec::new("thread_id", Text),
                ColumnSpec::new("importance", Text).not_null().default("'normal'"),
                ColumnSpec::new("ack_required", Integer).not_null().default("0"),
                ColumnSpec::new("created_at", Integer).not_null(),
            ],
            primary_key: &["id"],
            indexes: vec![IndexSpec {
                name: "idx_messages_thread",
                columns: &["thread_id"],
                unique: false,
            }],
            virtual_sql: None,
        },
        TableSpec {
            name: "message_recipients",
            columns: vec![
                ColumnSpec::new("message_id", Integer).not_null(),
                ColumnSpec::new("agent", Text).not_null(),
                ColumnSpec::new("read_at", Integer),
                ColumnSpec::new("acked_at", Integer),
            ],
            primary_key: &["message_id", "agent"],
            indexes: vec![IndexSpec {
                name: "idx_recipients_agent",
                columns: &["agent"],
                unique: false,
            }],
            virtual_sql: None,
        },
        TableSpec {
            name: "reservations",
            columns: vec![
                ColumnSpec::new("id", Integer).not_null(),
                ColumnSpec::new("project_key", Text).not_null(),
                ColumnSpec::new("agent", Text).not_null(),
                ColumnSpec::new("path_pattern", Text).not_null(),
                ColumnSpec::new("reason", Text),
                ColumnSpec::new("exclusive", Integer).not_null().default("1"),
                ColumnSpec::new("created_at", Integer).not_null(),
                ColumnSpec::new("expires_at", Integer).not_null(),
                ColumnSpec::new("released_at", Integer),
            ],
            primary_key: &["id"],
            indexes: vec![IndexSpec {
                name: "idx_reservations_project_agent",
                columns: &["project_key", "agent"],
                unique: false,
            }],
            virtual_sql: None,
        },
        TableSpec {
            name: "cells",
            columns: vec![
                ColumnSpec::new("id", Text).not_null(),
                ColumnSpec::new("project_key", Text).not_null(),
                ColumnSpec::new("cell_type", Text).not_null().default("'task'"),
                ColumnSpec::new("status", Text).not_null().default("'open'"),
                ColumnSpec::new("title", Text).not_null(),
                ColumnSpec::new("description", Text).not_null().default("''"),
                ColumnSpec::new("priority", Integer).not_null().default("2"),
                ColumnSpec::new("parent_id", Text),
                ColumnSpec::new("assignee", Text),
                ColumnSpec::new("created_at", Integer).not_null(),
                ColumnSpec::new("updated_at", Integer).not_null(),
                ColumnSpec::new("closed_at", Integer),
                ColumnSpec::new("closed_reason", Text),
                ColumnSpec::new("blocked", Integer).not_null().default("0"),
            ],
            primary_key: &["id"],
            indexes: vec![
                IndexSpec {
                    name: "idx_cells_project_status",
                    columns: &["project_key", "status"],
                    unique: false,
                },
                IndexSpec {
                    name: "idx_cells_parent",
                    columns: &["parent_id"],
                    unique: false,
                },
            ],
            virtual_sql: None,
        },
        TableSpec {
            name: "cell_dependencies",
            columns: vec![
                ColumnSpec::new("from_cell", Text).not_null(),
                ColumnSpec::new("to_cell", Text).not_null(),
                ColumnSpec::new("relationship", Text).not_null(),
            ],
            primary_key: &["from_cell", "to_cell", "relationship"],
            indexes: vec![IndexSpec {
                name: "idx_deps_to_cell",
                columns: &["to_cell"],
                unique: false,
            }],
            virtual_sql: None,
        },
        TableSpec {
            name: "cell_labels",
            columns: vec![
                ColumnSpec::new("cell_id", Text).not_null(),
                ColumnSpec::new("label", Text).not_null(),
            ],
            primary_key: &["cell_id", "label"],
            indexes: vec![],
            virtual_sql: None,
        },
        TableSpec {
            name: "cell_comments",
            columns: vec![
                ColumnSpec::new("id", Text).not_null(),
                ColumnSpec::new("cell_id", Text).not_null(),
                ColumnSpec::new("author", Text).not_null(),
                ColumnSpec::new("body", Text).not_null(),
                ColumnSpec::new("created_at", Integer).not_null(),
                ColumnSpec::new("updated_at", Integer).not_null(),
            ],
            primary_key: &["id"],
            indexes: vec![IndexSpec {
                name: "idx_comments_cell",
                columns: &["cell_id"],
                unique: false,
            }],
            virtual_sql: None,
        },
        TableSpec {
            name: "dirty_cells",
            columns: vec![
                ColumnSpec::new("cell_id", Text).not_null(),
                ColumnSpec::new("marked_at", Integer).not_null(),
            ],
            primary_key: &["cell_id"],
            indexes: vec![],
            virtual_sql: None,
        },
        TableSpec {
            name: "cursors",
            columns: vec![
                ColumnSpec::new("stream", Text).not_null(),
                ColumnSpec::new("checkpoint", Text).not_null(),
                ColumnSpec::new("position", Integer).not_null().default("0"),
                ColumnSpec::new("updated_at", Integer).not_null(),
            ],
            primary_key: &["stream", "checkpoint"],
            indexes: vec![],
            virtual_sql: None,
        },
        TableSpec {
            name: "locks",
            columns: vec![
                ColumnSpec::new("resource", Text).not_null(),
                ColumnSpec::new("holder", Text).not_null(),
                ColumnSpec::new("seq", Integer).not_null().default("0"),
                ColumnSpec::new("acquired_at", Integer).not_null(),
                ColumnSpec::new("expires_at", Integer).not_null(),
            ],
            primary_key: &["resource"],
            indexes: vec![],
            virtual_sql: None,
        },
        TableSpec {
            name: "deferreds",
            columns: vec![
                ColumnSpec::new("url", Text).not_null(),
                ColumnSpec::new("resolved", Integer).not_null().default("0"),
                ColumnSpec::new("value", Text),
                ColumnSpec::new("error", Text),
                ColumnSpec::new("created_at", Integer).not_null(),
                ColumnSpec::new("expires_at", Integer).not_null(),
            ],
            primary_key: &["url"],
            indexes: vec![],
            virtual_sql: None,
        },
        TableSpec {
            name: "memories",
            columns: vec![
                ColumnSpec::new("id", Text).not_null(),
                ColumnSpec::new("content", Text).not_null(),
                ColumnSpec::new("metadata", Text).not_null().default("'{}'"),
                ColumnSpec::new("collection", Text).not_null().default("'default'"),
                ColumnSpec::new("confidence", Real).not_null().default("0.5"),
                ColumnSpec::new("tags", Text).not_null().default("'[]'"),
                ColumnSpec::new("auto_tags", Text).not_null().default("'[]'"),
                ColumnSpec::new("keywords", Text).not_null().default("'[]'"),
                ColumnSpec::new("embedding", Blob).vector(EMBEDDING_DIM),
                ColumnSpec::new("created_at", Integer).not_null(),
                ColumnSpec::new("updated_at", Integer).not_null(),
                ColumnSpec::new("valid_from", Integer),
                ColumnSpec::new("valid_until", Integer),
                ColumnSpec::new("superseded_by", Text),
            ],
            primary_key: &["id"],
            indexes: vec![IndexSpec {
                name: "idx_memories_collection",
                columns: &["collection"],
                unique: false,
            }],
            virtual_sql: None,
        },
        TableSpec {
            name: "memory_links",
            columns: vec![
                ColumnSpec::new("id", Integer).autoincrement(),
                ColumnSpec::new("source_id", Text).not_null(),
                ColumnSpec::new("target_id", Text).not_null(),
                ColumnSpec::new("link_type", Text).not_null(),
                ColumnSpec::new("strength", Real).not_null().default("1.0"),
            ],
            primary_key: &["id"],
            indexes: vec![IndexSpec {
                name: "idx_links_unique",
                columns: &["source_id", "target_id", "link_type"],
                unique: true,
            }],
            virtual_sql: None,
        },
        TableSpec {
            name: "entities",
            columns: vec![
                ColumnSpec::new("id", Integer).autoincrement(),
                ColumnSpec::new("name", Text).not_null(),
                ColumnSpec::new("entity_type", Text).not_null(),
            ],
            primary_key: &["id"],
            indexes: vec![IndexSpec {
                name: "idx_entities_unique",
                columns: &["lower(name)", "entity_type"],
                unique: true,
            }],
            virtual_sql: None,
        },
        TableSpec {
            name: "entity_relationships",
            columns: vec![
                ColumnSpec::new("id", Integer).autoincrement(),
                ColumnSpec::new("subject", Text).not_null(),
                ColumnSpec::new("predicate", Text).not_null(),
                ColumnSpec::new("object", Text).not_null(),
                ColumnSpec::new("confidence", Real).not_null().default("0.5"),
                ColumnSpec::new("memory_id", Text).not_null(),
            ],
            primary_key: &["id"],
            indexes: vec![IndexSpec {
                name: "idx_relationships_unique",
                columns: &["subject", "predicate", "object"],
                unique: true,
            }],
            virtual_sql: None,
        },
        TableSpec {
            name: "memory_entities",
            columns: vec![
                ColumnSpec::new("memory_id", Text).not_null(),
                ColumnSpec::new("entity_id", Integer).not_null(),
            ],
            primary_key: &["memory_id", "entity_id"],
            indexes: vec![],
            virtual_sql: None,
        },
        TableSpec {
            name: "memories_fts",
            columns: vec![],
            primary_key: &[],
            indexes: vec![],
            virtual_sql: Some(
                "CREATE VIRTUAL TABLE memories_fts USING fts5(memory_id UNINDEXED, content)",
            ),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_sql_renders_autoincrement_pk_inline() {
        let schema = declared_schema();
        let events = schema.iter().find(|t| t.name == "events").unwrap();
        let sql = events.create_sql();
        assert!(sql.contains("id INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(!sql.contains("PRIMARY KEY (id)"));
    }

    #[test]
    fn create_sql_renders_composite_pk_as_constraint() {
        let schema = declared_schema();
        let agents = schema.iter().find(|t| t.name == "agents").unwrap();
        assert!(agents.create_sql().contains("PRIMARY KEY (project_key, name)"));
    }

    #[test]
    fn virtual_tables_use_raw_sql() {
        let schema = declared_schema();
        let fts = schema.iter().find(|t| t.name == "memories_fts").unwrap();
        assert!(fts.create_sql().starts_with("CREATE VIRTUAL TABLE"));
    }

    #[test]
    fn table_names_are_unique() {
        let schema = declared_schema();
        let mut names: Vec<&str> = schema.iter().map(|t| t.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), schema.len());
    }
}
