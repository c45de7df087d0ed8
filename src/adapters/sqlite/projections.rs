//! Projection engine: fold functions from events to materialized rows.
//!
//! Every fold runs on the same connection (and therefore in the same
//! transaction) as the append that produced the event, so observers see
//! event-and-projection atomically. Folds are idempotent — re-applying an
//! event leaves the same row — which makes replay safe to run twice.
//!
//! Projection rows take their timestamps from the events, never from
//! `now()`, so truncate-and-replay reproduces state bit for bit.

use sqlx::SqliteConnection;

use crate::domain::errors::DomainResult;
use crate::domain::models::event::{Event, EventPayload};

/// Apply one event to the projection tables.
#[allow(clippy::too_many_lines)]
pub async fn apply(conn: &mut SqliteConnection, event: &Event) -> DomainResult<()> {
    let ts = event.timestamp_ms();
    match &event.payload {
        EventPayload::AgentRegistered {
            agent,
            program,
            model,
        } => {
            sqlx::query(
                "INSERT INTO agents (project_key, name, registered_at, last_active_at, program, model)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(project_key, name) DO UPDATE SET
                     last_active_at = excluded.last_active_at,
                     program = COALESCE(excluded.program, agents.program),
                     model = COALESCE(excluded.model, agents.model)",
            )
            .bind(&event.project_key)
            .bind(agent)
            .bind(ts)
            .bind(ts)
            .bind(program)
            .bind(model)
            .execute(&mut *conn)
            .await?;
        }

        EventPayload::AgentSessionEnded { agent } => {
            sqlx::query(
                "UPDATE agents SET last_active_at = ? WHERE project_key = ? AND name = ?",
            )
            .bind(ts)
            .bind(&event.project_key)
            .bind(agent)
            .execute(&mut *conn)
            .await?;
            // End of session releases the agent's live reservations.
            sqlx::query(
                "UPDATE reservations SET released_at = ?
                 WHERE project_key = ? AND agent = ? AND released_at IS NULL",
            )
            .bind(ts)
            .bind(&event.project_key)
            .bind(agent)
            .execute(&mut *conn)
            .await?;
        }

        EventPayload::MessageSent {
            from,
            to,
            subject,
            body,
            thread_id,
            importance,
            ack_required,
        } => {
            sqlx::query(
                "INSERT OR REPLACE INTO messages
                 (id, project_key, from_agent, subject, body, thread_id, importance, ack_required, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(event.sequence)
            .bind(&event.project_key)
            .bind(from)
            .bind(subject)
            .bind(body)
            .bind(thread_id)
            .bind(importance.as_str())
            .bind(i64::from(*ack_required))
            .bind(ts)
            .execute(&mut *conn)
            .await?;
            for recipient in to {
                sqlx::query(
                    "INSERT OR IGNORE INTO message_recipients (message_id, agent) VALUES (?, ?)",
                )
                .bind(event.sequence)
                .bind(recipient)
                .execute(&mut *conn)
                .await?;
            }
        }

        EventPayload::MessageRead { message_id, reader } => {
            sqlx::query(
                "UPDATE message_recipients SET read_at = ?
                 WHERE message_id = ? AND agent = ? AND read_at IS NULL",
            )
            .bind(ts)
            .bind(message_id)
            .bind(reader)
            .execute(&mut *conn)
            .await?;
        }

        EventPayload::MessageAcked { message_id, agent } => {
            sqlx::query(
                "UPDATE message_recipients SET acked_at = ?
                 WHERE message_id = ? AND agent = ? AND acked_at IS NULL",
            )
            .bind(ts)
            .bind(message_id)
            .bind(agent)
            .execute(&mut *conn)
            .await?;
        }

        EventPayload::FileReserved {
            agent,
            path_pattern,
            reason,
            exclusive,
            expires_at_ms,
        } => {
            sqlx::query(
                "INSERT OR REPLACE INTO reservations
                 (id, project_key, agent, path_pattern, reason, exclusive, created_at, expires_at, released_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL)",
            )
            .bind(event.sequence)
            .bind(&event.project_key)
            .bind(agent)
            .bind(path_pattern)
            .bind(reason)
            .bind(i64::from(*exclusive))
            .bind(ts)
            .bind(expires_at_ms)
            .execute(&mut *conn)
            .await?;
        }

        EventPayload::FileReleased {
            reservation_ids, ..
        } => {
            for id in reservation_ids {
                sqlx::query(
                    "UPDATE reservations SET released_at = ? WHERE id = ? AND released_at IS NULL",
                )
                .bind(ts)
                .bind(id)
                .execute(&mut *conn)
                .await?;
            }
        }

        // Conflicts are log-only; the reservation rows carry the state.
        EventPayload::FileConflict { .. } => {}

        EventPayload::CellCreated {
            cell_id,
            cell_type,
            title,
            description,
            priority,
            parent_id,
            assignee,
        } => {
            sqlx::query(
                "INSERT OR REPLACE INTO cells
                 (id, project_key, cell_type, status, title, description, priority, parent_id,
                  assignee, created_at, updated_at, closed_at, closed_reason, blocked)
                 VALUES (?, ?, ?, 'open', ?, ?, ?, ?, ?, ?, ?, NULL, NULL, 0)",
            )
            .bind(cell_id)
            .bind(&event.project_key)
            .bind(cell_type)
            .bind(title)
            .bind(description)
            .bind(priority)
            .bind(parent_id)
            .bind(assignee)
            .bind(ts)
            .bind(ts)
            .execute(&mut *conn)
            .await?;
            if let Some(parent) = parent_id {
                sqlx::query(
                    "INSERT OR IGNORE INTO cell_dependencies (from_cell, to_cell, relationship)
                     VALUES (?, ?, 'parent')",
                )
                .bind(parent)
                .bind(cell_id)
                .execute(&mut *conn)
                .await?;
            }
            mark_dirty(conn, cell_id, ts).await?;
        }

        EventPayload::CellUpdated {
            cell_id,
            title,
            description,
            priority,
            assignee,
        } => {
            sqlx::query(
                "UPDATE cells SET
                     title = COALESCE(?, title),
                     description = COALESCE(?, description),
                     priority = COALESCE(?, priority),
                     assignee = COALESCE(?, assignee),
                     updated_at = ?
                 WHERE id = ?",
            )
            .bind(title)
            .bind(description)
            .bind(priority)
            .bind(assignee)
            .bind(ts)
            .bind(cell_id)
            .execute(&mut *conn)
            .await?;
            mark_dirty(conn, cell_id, ts).await?;
        }

        EventPayload::CellStatusChanged { cell_id, to, .. } => {
            sqlx::query("UPDATE cells SET status = ?, updated_at = ? WHERE id = ?")
                .bind(to)
                .bind(ts)
                .bind(cell_id)
                .execute(&mut *conn)
                .await?;
            recompute_blocked_for_dependents(conn, cell_id).await?;
            mark_dirty(conn, cell_id, ts).await?;
        }

        EventPayload::CellClosed { cell_id, reason } => {
            sqlx::query(
                "UPDATE cells SET status = 'closed', closed_at = ?, closed_reason = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(ts)
            .bind(reason)
            .bind(ts)
            .bind(cell_id)
            .execute(&mut *conn)
            .await?;
            recompute_blocked_for_dependents(conn, cell_id).await?;
            mark_dirty(conn, cell_id, ts).await?;
        }

        EventPayload::CellReopened { cell_id } => {
            sqlx::query(
                "UPDATE cells SET status = 'open', closed_at = NULL, closed_reason = NULL, updated_at = ?
                 WHERE id = ?",
            )
            .bind(ts)
            .bind(cell_id)
            .execute(&mut *conn)
            .await?;
            recompute_blocked_for_dependents(conn, cell_id).await?;
            mark_dirty(conn, cell_id, ts).await?;
        }

        EventPayload::CellDeleted { cell_id } => {
            sqlx::query("UPDATE cells SET status = 'tombstone', updated_at = ? WHERE id = ?")
                .bind(ts)
                .bind(cell_id)
                .execute(&mut *conn)
                .await?;
            recompute_blocked_for_dependents(conn, cell_id).await?;
            mark_dirty(conn, cell_id, ts).await?;
        }

        EventPayload::CellDependencyAdded {
            from_cell,
            to_cell,
            relationship,
        } => {
            sqlx::query(
                "INSERT OR IGNORE INTO cell_dependencies (from_cell, to_cell, relationship)
                 VALUES (?, ?, ?)",
            )
            .bind(from_cell)
            .bind(to_cell)
            .bind(relationship.as_str())
            .execute(&mut *conn)
            .await?;
            recompute_blocked(conn, to_cell).await?;
            mark_dirty(conn, to_cell, ts).await?;
        }

        EventPayload::CellDependencyRemoved {
            from_cell,
            to_cell,
            relationship,
        } => {
            sqlx::query(
                "DELETE FROM cell_dependencies
                 WHERE from_cell = ? AND to_cell = ? AND relationship = ?",
            )
            .bind(from_cell)
            .bind(to_cell)
            .bind(relationship.as_str())
            .execute(&mut *conn)
            .await?;
            recompute_blocked(conn, to_cell).await?;
            mark_dirty(conn, to_cell, ts).await?;
        }

        EventPayload::CellLabelAdded { cell_id, label } => {
            sqlx::query("INSERT OR IGNORE INTO cell_labels (cell_id, label) VALUES (?, ?)")
                .bind(cell_id)
                .bind(label)
                .execute(&mut *conn)
                .await?;
            mark_dirty(conn, cell_id, ts).await?;
        }

        EventPayload::CellLabelRemoved { cell_id, label } => {
            sqlx::query("DELETE FROM cell_labels WHERE cell_id = ? AND label = ?")
                .bind(cell_id)
                .bind(label)
                .execute(&mut *conn)
                .await?;
            mark_dirty(conn, cell_id, ts).await?;
        }

        EventPayload::CellCommentAdded {
            cell_id,
            comment_id,
            author,
            body,
        } => {
            sqlx::query(
                "INSERT OR REPLACE INTO cell_comments (id, cell_id, author, body, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(comment_id)
            .bind(cell_id)
            .bind(author)
            .bind(body)
            .bind(ts)
            .bind(ts)
            .execute(&mut *conn)
            .await?;
            mark_dirty(conn, cell_id, ts).await?;
        }

        EventPayload::CellCommentUpdated {
            cell_id,
            comment_id,
            body,
        } => {
            sqlx::query("UPDATE cell_comments SET body = ?, updated_at = ? WHERE id = ?")
                .bind(body)
                .bind(ts)
                .bind(comment_id)
                .execute(&mut *conn)
                .await?;
            mark_dirty(conn, cell_id, ts).await?;
        }

        EventPayload::CellCommentDeleted {
            cell_id,
            comment_id,
        } => {
            sqlx::query("DELETE FROM cell_comments WHERE id = ?")
                .bind(comment_id)
                .execute(&mut *conn)
                .await?;
            mark_dirty(conn, cell_id, ts).await?;
        }

        EventPayload::CellEpicChildAdded { epic_id, child_id } => {
            sqlx::query("UPDATE cells SET parent_id = ?, updated_at = ? WHERE id = ?")
                .bind(epic_id)
                .bind(ts)
                .bind(child_id)
                .execute(&mut *conn)
                .await?;
            sqlx::query(
                "INSERT OR IGNORE INTO cell_dependencies (from_cell, to_cell, relationship)
                 VALUES (?, ?, 'parent')",
            )
            .bind(epic_id)
            .bind(child_id)
            .execute(&mut *conn)
            .await?;
            mark_dirty(conn, child_id, ts).await?;
        }

        EventPayload::CellEpicChildRemoved { epic_id, child_id } => {
            sqlx::query(
                "UPDATE cells SET parent_id = NULL, updated_at = ? WHERE id = ? AND parent_id = ?",
            )
            .bind(ts)
            .bind(child_id)
            .bind(epic_id)
            .execute(&mut *conn)
            .await?;
            sqlx::query(
                "DELETE FROM cell_dependencies
                 WHERE from_cell = ? AND to_cell = ? AND relationship = 'parent'",
            )
            .bind(epic_id)
            .bind(child_id)
            .execute(&mut *conn)
            .await?;
            mark_dirty(conn, child_id, ts).await?;
        }

        // Log-only families: consumed by replay and analytics, no rows.
        EventPayload::CheckpointSaved { .. }
        | EventPayload::EpicDecomposed { .. }
        | EventPayload::OutcomeRecorded { .. }
        | EventPayload::FeedbackRecorded { .. }
        | EventPayload::ValidationRecorded { .. }
        | EventPayload::ContextCompacted { .. } => {}
    }
    Ok(())
}

const PROJECTION_TABLES: &[&str] = &[
    "agents",
    "messages",
    "message_recipients",
    "reservations",
    "cells",
    "cell_dependencies",
    "cell_labels",
    "cell_comments",
    "dirty_cells",
];

/// Truncate every projection table ahead of a rebuild.
pub async fn truncate_all(conn: &mut SqliteConnection) -> DomainResult<()> {
    for table in PROJECTION_TABLES {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

const BLOCKED_EXPR: &str = "(CASE WHEN EXISTS (
    SELECT 1 FROM cell_dependencies d
    JOIN cells b ON b.id = d.from_cell
    WHERE d.to_cell = cells.id AND d.relationship = 'blocks' AND b.status != 'closed'
) THEN 1 ELSE 0 END)";

/// Refresh the blocked flag of one cell.
pub async fn recompute_blocked(conn: &mut SqliteConnection, cell_id: &str) -> DomainResult<()> {
    sqlx::query(&format!(
        "UPDATE cells SET blocked = {BLOCKED_EXPR} WHERE id = ?"
    ))
    .bind(cell_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Refresh the blocked flag of every cell the given cell blocks.
async fn recompute_blocked_for_dependents(
    conn: &mut SqliteConnection,
    blocker_id: &str,
) -> DomainResult<()> {
    sqlx::query(&format!(
        "UPDATE cells SET blocked = {BLOCKED_EXPR}
         WHERE id IN (SELECT to_cell FROM cell_dependencies
                      WHERE from_cell = ? AND relationship = 'blocks')"
    ))
    .bind(blocker_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Re-fold the blocked cache for a whole project.
pub async fn rebuild_blocked_cache(
    conn: &mut SqliteConnection,
    project_key: &str,
) -> DomainResult<u64> {
    let result = sqlx::query(&format!(
        "UPDATE cells SET blocked = {BLOCKED_EXPR} WHERE project_key = ?"
    ))
    .bind(project_key)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

async fn mark_dirty(conn: &mut SqliteConnection, cell_id: &str, ts: i64) -> DomainResult<()> {
    sqlx::query(
        "INSERT INTO dirty_cells (cell_id, marked_at) VALUES (?, ?)
         ON CONFLICT(cell_id) DO UPDATE SET marked_at = excluded.marked_at",
    )
    .bind(cell_id)
    .bind(ts)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
