//! Hive: the event-sourced work-item engine.
//!
//! Every operation appends one of the cell event family and lets the
//! projection folds maintain the `cells`, `cell_dependencies`,
//! `cell_labels`, `cell_comments`, and `dirty_cells` tables. Reads go to
//! the projections.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::adapters::sqlite::event_log::EventLog;
use crate::adapters::sqlite::projections;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::cell::{
    generate_cell_id, slugify, Cell, CellComment, CellDependency, CellStatus, CellType, NewCell,
};
use crate::domain::models::event::{CellRelationship, EventPayload};

/// Filter for `list_cells`. Tombstones are excluded unless asked for.
#[derive(Debug, Clone, Default)]
pub struct CellFilter {
    pub status: Option<CellStatus>,
    pub cell_type: Option<CellType>,
    pub assignee: Option<String>,
    pub include_tombstones: bool,
    pub limit: Option<i64>,
}

/// Partial update for a cell.
#[derive(Debug, Clone, Default)]
pub struct CellPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i64>,
    pub assignee: Option<String>,
}

#[derive(Clone)]
pub struct Hive {
    log: EventLog,
}

impl Hive {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }

    /// Create a cell. The id embeds the project slug, a project-key
    /// fingerprint, and a timestamped suffix.
    pub async fn create_cell(&self, project_key: &str, new_cell: NewCell) -> DomainResult<Cell> {
        if new_cell.title.trim().is_empty() {
            return Err(DomainError::Validation("cell title is empty".to_string()));
        }
        if !(0..=3).contains(&new_cell.priority) {
            return Err(DomainError::Validation(format!(
                "priority {} out of range 0..3",
                new_cell.priority
            )));
        }
        if let Some(parent) = &new_cell.parent_id {
            self.get_cell(parent).await?;
        }

        let slug = discover_slug(project_key);
        let cell_id = generate_cell_id(&slug, project_key, Utc::now());
        self.log
            .append(
                project_key,
                EventPayload::CellCreated {
                    cell_id: cell_id.clone(),
                    cell_type: new_cell.cell_type.as_str().to_string(),
                    title: new_cell.title,
                    description: new_cell.description,
                    priority: new_cell.priority,
                    parent_id: new_cell.parent_id,
                    assignee: new_cell.assignee,
                },
            )
            .await?;
        self.get_cell(&cell_id).await
    }

    pub async fn get_cell(&self, cell_id: &str) -> DomainResult<Cell> {
        let row: Option<CellRow> = sqlx::query_as(&format!(
            "SELECT {CELL_COLUMNS} FROM cells WHERE id = ?"
        ))
        .bind(cell_id)
        .fetch_optional(self.log.pool())
        .await?;
        row.ok_or_else(|| DomainError::NotFound {
            entity: "cell",
            id: cell_id.to_string(),
        })?
        .into_cell()
    }

    pub async fn list_cells(
        &self,
        project_key: &str,
        filter: CellFilter,
    ) -> DomainResult<Vec<Cell>> {
        let mut sql = format!("SELECT {CELL_COLUMNS} FROM cells WHERE project_key = ?");
        if !filter.include_tombstones {
            sql.push_str(" AND status != 'tombstone'");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.cell_type.is_some() {
            sql.push_str(" AND cell_type = ?");
        }
        if filter.assignee.is_some() {
            sql.push_str(" AND assignee = ?");
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query_as::<_, CellRow>(&sql).bind(project_key);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(cell_type) = filter.cell_type {
            query = query.bind(cell_type.as_str());
        }
        if let Some(assignee) = &filter.assignee {
            query = query.bind(assignee.clone());
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit);
        }

        let rows = query.fetch_all(self.log.pool()).await?;
        rows.into_iter().map(CellRow::into_cell).collect()
    }

    pub async fn update_cell(
        &self,
        project_key: &str,
        cell_id: &str,
        patch: CellPatch,
    ) -> DomainResult<Cell> {
        self.get_cell(cell_id).await?;
        if let Some(priority) = patch.priority {
            if !(0..=3).contains(&priority) {
                return Err(DomainError::Validation(format!(
                    "priority {priority} out of range 0..3"
                )));
            }
        }
        self.log
            .append(
                project_key,
                EventPayload::CellUpdated {
                    cell_id: cell_id.to_string(),
                    title: patch.title,
                    description: patch.description,
                    priority: patch.priority,
                    assignee: patch.assignee,
                },
            )
            .await?;
        self.get_cell(cell_id).await
    }

    /// Status change along the open/in_progress/blocked machine. Closing
    /// and deleting go through `close_cell` / `delete_cell`, which carry
    /// their own bookkeeping.
    pub async fn change_status(
        &self,
        project_key: &str,
        cell_id: &str,
        to: CellStatus,
    ) -> DomainResult<Cell> {
        if matches!(to, CellStatus::Closed | CellStatus::Tombstone) {
            return Err(DomainError::Validation(format!(
                "status '{}' is set by close_cell / delete_cell",
                to.as_str()
            )));
        }
        let cell = self.get_cell(cell_id).await?;
        cell.status.validate_transition(to)?;
        self.log
            .append(
                project_key,
                EventPayload::CellStatusChanged {
                    cell_id: cell_id.to_string(),
                    from: cell.status.as_str().to_string(),
                    to: to.as_str().to_string(),
                },
            )
            .await?;
        self.get_cell(cell_id).await
    }

    /// Close a cell. Epics refuse while any child is not closed.
    pub async fn close_cell(
        &self,
        project_key: &str,
        cell_id: &str,
        reason: Option<String>,
    ) -> DomainResult<Cell> {
        let cell = self.get_cell(cell_id).await?;
        match cell.status {
            CellStatus::Closed => {
                return Err(DomainError::InvalidStatusTransition {
                    from: "closed".to_string(),
                    to: "closed".to_string(),
                })
            }
            CellStatus::Tombstone => {
                return Err(DomainError::NotFound {
                    entity: "cell",
                    id: cell_id.to_string(),
                })
            }
            _ => {}
        }
        if cell.cell_type == CellType::Epic && !self.epic_eligible_to_close(cell_id).await? {
            return Err(DomainError::Validation(format!(
                "epic {cell_id} has children that are not closed"
            )));
        }
        self.log
            .append(
                project_key,
                EventPayload::CellClosed {
                    cell_id: cell_id.to_string(),
                    reason,
                },
            )
            .await?;
        self.get_cell(cell_id).await
    }

    pub async fn reopen_cell(&self, project_key: &str, cell_id: &str) -> DomainResult<Cell> {
        let cell = self.get_cell(cell_id).await?;
        if cell.status != CellStatus::Closed {
            return Err(DomainError::InvalidStatusTransition {
                from: cell.status.as_str().to_string(),
                to: "open".to_string(),
            });
        }
        self.log
            .append(
                project_key,
                EventPayload::CellReopened {
                    cell_id: cell_id.to_string(),
                },
            )
            .await?;
        self.get_cell(cell_id).await
    }

    /// Tombstone a cell. Allowed from any status.
    pub async fn delete_cell(&self, project_key: &str, cell_id: &str) -> DomainResult<()> {
        self.get_cell(cell_id).await?;
        self.log
            .append(
                project_key,
                EventPayload::CellDeleted {
                    cell_id: cell_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    /// Add a typed dependency edge. For `blocks`, `from_cell` blocks
    /// `to_cell`; self-edges and cycles are rejected before any event is
    /// written.
    pub async fn add_dependency(
        &self,
        project_key: &str,
        from_cell: &str,
        to_cell: &str,
        relationship: CellRelationship,
    ) -> DomainResult<()> {
        if from_cell == to_cell {
            return Err(DomainError::Cycle {
                from: from_cell.to_string(),
                to: to_cell.to_string(),
            });
        }
        self.get_cell(from_cell).await?;
        self.get_cell(to_cell).await?;

        if relationship == CellRelationship::Blocks
            && self.blocks_path_exists(project_key, to_cell, from_cell).await?
        {
            return Err(DomainError::Cycle {
                from: from_cell.to_string(),
                to: to_cell.to_string(),
            });
        }

        self.log
            .append(
                project_key,
                EventPayload::CellDependencyAdded {
                    from_cell: from_cell.to_string(),
                    to_cell: to_cell.to_string(),
                    relationship,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn remove_dependency(
        &self,
        project_key: &str,
        from_cell: &str,
        to_cell: &str,
        relationship: CellRelationship,
    ) -> DomainResult<()> {
        self.log
            .append(
                project_key,
                EventPayload::CellDependencyRemoved {
                    from_cell: from_cell.to_string(),
                    to_cell: to_cell.to_string(),
                    relationship,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn dependencies_of(&self, cell_id: &str) -> DomainResult<Vec<CellDependency>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT from_cell, to_cell, relationship FROM cell_dependencies
             WHERE from_cell = ? OR to_cell = ? ORDER BY from_cell, to_cell",
        )
        .bind(cell_id)
        .bind(cell_id)
        .fetch_all(self.log.pool())
        .await?;
        rows.into_iter()
            .map(|(from_cell, to_cell, relationship)| {
                Ok(CellDependency {
                    from_cell,
                    to_cell,
                    relationship: CellRelationship::from_str(&relationship).ok_or_else(|| {
                        DomainError::Validation(format!("unknown relationship '{relationship}'"))
                    })?,
                })
            })
            .collect()
    }

    pub async fn add_label(
        &self,
        project_key: &str,
        cell_id: &str,
        label: &str,
    ) -> DomainResult<()> {
        self.get_cell(cell_id).await?;
        self.log
            .append(
                project_key,
                EventPayload::CellLabelAdded {
                    cell_id: cell_id.to_string(),
                    label: label.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn remove_label(
        &self,
        project_key: &str,
        cell_id: &str,
        label: &str,
    ) -> DomainResult<()> {
        self.log
            .append(
                project_key,
                EventPayload::CellLabelRemoved {
                    cell_id: cell_id.to_string(),
                    label: label.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn labels_of(&self, cell_id: &str) -> DomainResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT label FROM cell_labels WHERE cell_id = ? ORDER BY label")
                .bind(cell_id)
                .fetch_all(self.log.pool())
                .await?;
        Ok(rows.into_iter().map(|(label,)| label).collect())
    }

    pub async fn add_comment(
        &self,
        project_key: &str,
        cell_id: &str,
        author: &str,
        body: &str,
    ) -> DomainResult<String> {
        self.get_cell(cell_id).await?;
        let comment_id = format!("cmt-{}", Uuid::new_v4());
        self.log
            .append(
                project_key,
                EventPayload::CellCommentAdded {
                    cell_id: cell_id.to_string(),
                    comment_id: comment_id.clone(),
                    author: author.to_string(),
                    body: body.to_string(),
                },
            )
            .await?;
        Ok(comment_id)
    }

    pub async fn update_comment(
        &self,
        project_key: &str,
        cell_id: &str,
        comment_id: &str,
        body: &str,
    ) -> DomainResult<()> {
        let exists: Option<(String,)> =
            sqlx::query_as("SELECT id FROM cell_comments WHERE id = ? AND cell_id = ?")
                .bind(comment_id)
                .bind(cell_id)
                .fetch_optional(self.log.pool())
                .await?;
        if exists.is_none() {
            return Err(DomainError::NotFound {
                entity: "comment",
                id: comment_id.to_string(),
            });
        }
        self.log
            .append(
                project_key,
                EventPayload::CellCommentUpdated {
                    cell_id: cell_id.to_string(),
                    comment_id: comment_id.to_string(),
                    body: body.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn delete_comment(
        &self,
        project_key: &str,
        cell_id: &str,
        comment_id: &str,
    ) -> DomainResult<()> {
        self.log
            .append(
                project_key,
                EventPayload::CellCommentDeleted {
                    cell_id: cell_id.to_string(),
                    comment_id: comment_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn comments_of(&self, cell_id: &str) -> DomainResult<Vec<CellComment>> {
        let rows: Vec<(String, String, String, String, i64, i64)> = sqlx::query_as(
            "SELECT id, cell_id, author, body, created_at, updated_at
             FROM cell_comments WHERE cell_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(cell_id)
        .fetch_all(self.log.pool())
        .await?;
        rows.into_iter()
            .map(|(id, cell_id, author, body, created_at, updated_at)| {
                Ok(CellComment {
                    id,
                    cell_id,
                    author,
                    body,
                    created_at: timestamp(created_at)?,
                    updated_at: timestamp(updated_at)?,
                })
            })
            .collect()
    }

    /// The next cells to work on: open, unblocked, highest priority first
    /// (lowest number), ties broken by creation time.
    pub async fn ready_queue(&self, project_key: &str, limit: i64) -> DomainResult<Vec<Cell>> {
        let rows: Vec<CellRow> = sqlx::query_as(&format!(
            "SELECT {CELL_COLUMNS} FROM cells
             WHERE project_key = ? AND status = 'open' AND blocked = 0
             ORDER BY priority ASC, created_at ASC, id ASC LIMIT ?"
        ))
        .bind(project_key)
        .bind(limit)
        .fetch_all(self.log.pool())
        .await?;
        rows.into_iter().map(CellRow::into_cell).collect()
    }

    /// O(1) read of the blocked cache.
    pub async fn is_blocked(&self, cell_id: &str) -> DomainResult<bool> {
        Ok(self.get_cell(cell_id).await?.blocked)
    }

    /// Re-fold the blocked cache from dependencies and statuses.
    pub async fn rebuild_blocked_cache(&self, project_key: &str) -> DomainResult<u64> {
        let mut conn = self.log.pool().acquire().await?;
        projections::rebuild_blocked_cache(&mut *conn, project_key).await
    }

    pub async fn epic_children(&self, epic_id: &str) -> DomainResult<Vec<Cell>> {
        let rows: Vec<CellRow> = sqlx::query_as(&format!(
            "SELECT {CELL_COLUMNS} FROM cells
             WHERE parent_id = ? AND status != 'tombstone'
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(epic_id)
        .fetch_all(self.log.pool())
        .await?;
        rows.into_iter().map(CellRow::into_cell).collect()
    }

    /// An epic may close iff every child is closed.
    pub async fn epic_eligible_to_close(&self, epic_id: &str) -> DomainResult<bool> {
        let children = self.epic_children(epic_id).await?;
        Ok(children.iter().all(|c| c.status == CellStatus::Closed))
    }

    pub async fn add_epic_child(
        &self,
        project_key: &str,
        epic_id: &str,
        child_id: &str,
    ) -> DomainResult<()> {
        let epic = self.get_cell(epic_id).await?;
        if epic.cell_type != CellType::Epic {
            return Err(DomainError::Validation(format!(
                "cell {epic_id} is not an epic"
            )));
        }
        self.get_cell(child_id).await?;
        self.log
            .append(
                project_key,
                EventPayload::CellEpicChildAdded {
                    epic_id: epic_id.to_string(),
                    child_id: child_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn remove_epic_child(
        &self,
        project_key: &str,
        epic_id: &str,
        child_id: &str,
    ) -> DomainResult<()> {
        self.log
            .append(
                project_key,
                EventPayload::CellEpicChildRemoved {
                    epic_id: epic_id.to_string(),
                    child_id: child_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    /// Decompose an epic into child cells in one batch, journaling an
    /// `epic_decomposed` event after the children.
    pub async fn decompose_epic(
        &self,
        project_key: &str,
        epic_id: &str,
        agent: &str,
        children: Vec<NewCell>,
    ) -> DomainResult<Vec<String>> {
        let epic = self.get_cell(epic_id).await?;
        if epic.cell_type != CellType::Epic {
            return Err(DomainError::Validation(format!(
                "cell {epic_id} is not an epic"
            )));
        }

        let slug = discover_slug(project_key);
        let mut payloads = Vec::with_capacity(children.len() + 1);
        let mut child_ids = Vec::with_capacity(children.len());
        for child in children {
            if child.title.trim().is_empty() {
                return Err(DomainError::Validation("cell title is empty".to_string()));
            }
            let cell_id = generate_cell_id(&slug, project_key, Utc::now());
            child_ids.push(cell_id.clone());
            payloads.push(EventPayload::CellCreated {
                cell_id,
                cell_type: child.cell_type.as_str().to_string(),
                title: child.title,
                description: child.description,
                priority: child.priority,
                parent_id: Some(epic_id.to_string()),
                assignee: child.assignee,
            });
        }
        payloads.push(EventPayload::EpicDecomposed {
            epic_id: epic_id.to_string(),
            agent: agent.to_string(),
            child_ids: child_ids.clone(),
        });
        self.log.append_all(project_key, payloads).await?;
        Ok(child_ids)
    }

    /// Drain the dirty set: cells whose projection rows changed since the
    /// last export. Returns their ids and clears the marks.
    pub async fn drain_dirty(&self, project_key: &str) -> DomainResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT d.cell_id FROM dirty_cells d
             INNER JOIN cells c ON c.id = d.cell_id
             WHERE c.project_key = ? ORDER BY d.marked_at ASC, d.cell_id ASC",
        )
        .bind(project_key)
        .fetch_all(self.log.pool())
        .await?;
        let ids: Vec<String> = rows.into_iter().map(|(id,)| id).collect();
        for id in &ids {
            sqlx::query("DELETE FROM dirty_cells WHERE cell_id = ?")
                .bind(id)
                .execute(self.log.pool())
                .await?;
        }
        Ok(ids)
    }

    /// Is there a `blocks` path from `start` to `goal`?
    async fn blocks_path_exists(
        &self,
        project_key: &str,
        start: &str,
        goal: &str,
    ) -> DomainResult<bool> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT d.from_cell, d.to_cell FROM cell_dependencies d
             INNER JOIN cells c ON c.id = d.from_cell
             WHERE d.relationship = 'blocks' AND c.project_key = ?",
        )
        .bind(project_key)
        .fetch_all(self.log.pool())
        .await?;

        let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
        for (from, to) in &rows {
            graph.entry(from.as_str()).or_default().push(to.as_str());
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if node == goal {
                return Ok(true);
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(next) = graph.get(node) {
                stack.extend(next.iter().copied());
            }
        }
        Ok(false)
    }
}

const CELL_COLUMNS: &str = "id, project_key, cell_type, status, title, description, priority, \
     parent_id, assignee, created_at, updated_at, closed_at, closed_reason, blocked";

#[derive(Debug, sqlx::FromRow)]
struct CellRow {
    id: String,
    project_key: String,
    cell_type: String,
    status: String,
    title: String,
    description: String,
    priority: i64,
    parent_id: Option<String>,
    assignee: Option<String>,
    created_at: i64,
    updated_at: i64,
    closed_at: Option<i64>,
    closed_reason: Option<String>,
    blocked: i64,
}

impl CellRow {
    fn into_cell(self) -> DomainResult<Cell> {
        Ok(Cell {
            cell_type: CellType::from_str(&self.cell_type).ok_or_else(|| {
                DomainError::Validation(format!("unknown cell type '{}'", self.cell_type))
            })?,
            status: CellStatus::from_str(&self.status).ok_or_else(|| {
                DomainError::Validation(format!("unknown status '{}'", self.status))
            })?,
            id: self.id,
            project_key: self.project_key,
            title: self.title,
            description: self.description,
            priority: self.priority,
            parent_id: self.parent_id,
            assignee: self.assignee,
            created_at: timestamp(self.created_at)?,
            updated_at: timestamp(self.updated_at)?,
            closed_at: self.closed_at.map(timestamp).transpose()?,
            closed_reason: self.closed_reason,
            blocked: self.blocked != 0,
        })
    }
}

fn timestamp(ms: i64) -> DomainResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DomainError::Validation(format!("bad timestamp {ms}")))
}

/// Slug for cell ids: the project's package name when one is
/// discoverable, else `cell`.
fn discover_slug(project_key: &str) -> String {
    let dir = Path::new(project_key);

    if let Ok(text) = std::fs::read_to_string(dir.join("package.json")) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            if let Some(name) = value.get("name").and_then(|n| n.as_str()) {
                return slugify(name);
            }
        }
    }

    if let Ok(text) = std::fs::read_to_string(dir.join("Cargo.toml")) {
        for line in text.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("name") {
                let rest = rest.trim_start();
                if let Some(value) = rest.strip_prefix('=') {
                    let name = value.trim().trim_matches('"');
                    if !name.is_empty() {
                        return slugify(name);
                    }
                }
            }
        }
    }

    "cell".to_string()
}
