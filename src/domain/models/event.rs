//! Event model: the append-only log's row type and its typed payload families.
//!
//! Every mutation of mailbox, reservation, and hive state is recorded as one
//! of these events. Payloads are validated at the producer boundary: an
//! append with an unknown `type` tag or a malformed body is rejected before
//! anything touches the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::{DomainError, DomainResult};

/// Namespace on the event log identifying the originating subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStream {
    Agent,
    Mail,
    Reservation,
    Cell,
    Memory,
    Session,
}

impl EventStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Mail => "mail",
            Self::Reservation => "reservation",
            Self::Cell => "cell",
            Self::Memory => "memory",
            Self::Session => "session",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "agent" => Some(Self::Agent),
            "mail" => Some(Self::Mail),
            "reservation" => Some(Self::Reservation),
            "cell" => Some(Self::Cell),
            "memory" => Some(Self::Memory),
            "session" => Some(Self::Session),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed event family, used for payload validation and coarse filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFamily {
    Agent,
    Message,
    Reservation,
    Task,
    Checkpoint,
    Decomposition,
    Outcome,
    Feedback,
    Validation,
    ContextCompaction,
}

/// Message importance levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

/// Typed relationship between two cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellRelationship {
    Blocks,
    Related,
    Duplicates,
    Parent,
}

impl CellRelationship {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::Related => "related",
            Self::Duplicates => "duplicates",
            Self::Parent => "parent",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "blocks" => Some(Self::Blocks),
            "related" => Some(Self::Related),
            "duplicates" => Some(Self::Duplicates),
            "parent" => Some(Self::Parent),
            _ => None,
        }
    }
}

/// The typed payload of an event, tagged by the wire-level `type` string.
///
/// The serde tag doubles as the `type` column in the events table, so the
/// set of valid type strings is exactly the set of variants here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // -- agent family --
    AgentRegistered {
        agent: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        program: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    AgentSessionEnded {
        agent: String,
    },

    // -- message family --
    MessageSent {
        from: String,
        to: Vec<String>,
        subject: String,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default)]
        importance: Importance,
        #[serde(default)]
        ack_required: bool,
    },
    MessageRead {
        message_id: i64,
        reader: String,
    },
    MessageAcked {
        message_id: i64,
        agent: String,
    },

    // -- reservation family --
    FileReserved {
        agent: String,
        path_pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        exclusive: bool,
        expires_at_ms: i64,
    },
    FileReleased {
        agent: String,
        reservation_ids: Vec<i64>,
        paths: Vec<String>,
    },
    FileConflict {
        requesting_agent: String,
        path: String,
        holders: Vec<String>,
    },

    // -- task (cell) family --
    CellCreated {
        cell_id: String,
        cell_type: String,
        title: String,
        #[serde(default)]
        description: String,
        priority: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
    },
    CellUpdated {
        cell_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
    },
    CellStatusChanged {
        cell_id: String,
        from: String,
        to: String,
    },
    CellClosed {
        cell_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    CellReopened {
        cell_id: String,
    },
    CellDeleted {
        cell_id: String,
    },
    CellDependencyAdded {
        from_cell: String,
        to_cell: String,
        relationship: CellRelationship,
    },
    CellDependencyRemoved {
        from_cell: String,
        to_cell: String,
        relationship: CellRelationship,
    },
    CellLabelAdded {
        cell_id: String,
        label: String,
    },
    CellLabelRemoved {
        cell_id: String,
        label: String,
    },
    CellCommentAdded {
        cell_id: String,
        comment_id: String,
        author: String,
        body: String,
    },
    CellCommentUpdated {
        cell_id: String,
        comment_id: String,
        body: String,
    },
    CellCommentDeleted {
        cell_id: String,
        comment_id: String,
    },
    CellEpicChildAdded {
        epic_id: String,
        child_id: String,
    },
    CellEpicChildRemoved {
        epic_id: String,
        child_id: String,
    },

    // -- checkpoint family --
    CheckpointSaved {
        agent: String,
        label: String,
        data: serde_json::Value,
    },

    // -- decomposition family --
    EpicDecomposed {
        epic_id: String,
        agent: String,
        child_ids: Vec<String>,
    },

    // -- outcome family --
    OutcomeRecorded {
        agent: String,
        cell_id: String,
        success: bool,
        summary: String,
    },

    // -- feedback family --
    FeedbackRecorded {
        agent: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_agent: Option<String>,
        content: String,
    },

    // -- validation family --
    ValidationRecorded {
        cell_id: String,
        validator: String,
        passed: bool,
        #[serde(default)]
        details: String,
    },

    // -- context-compaction family --
    ContextCompacted {
        agent: String,
        tokens_before: i64,
        tokens_after: i64,
        summary: String,
    },
}

impl EventPayload {
    /// Wire-level type string; identical to the serde tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentRegistered { .. } => "agent_registered",
            Self::AgentSessionEnded { .. } => "agent_session_ended",
            Self::MessageSent { .. } => "message_sent",
            Self::MessageRead { .. } => "message_read",
            Self::MessageAcked { .. } => "message_acked",
            Self::FileReserved { .. } => "file_reserved",
            Self::FileReleased { .. } => "file_released",
            Self::FileConflict { .. } => "file_conflict",
            Self::CellCreated { .. } => "cell_created",
            Self::CellUpdated { .. } => "cell_updated",
            Self::CellStatusChanged { .. } => "cell_status_changed",
            Self::CellClosed { .. } => "cell_closed",
            Self::CellReopened { .. } => "cell_reopened",
            Self::CellDeleted { .. } => "cell_deleted",
            Self::CellDependencyAdded { .. } => "cell_dependency_added",
            Self::CellDependencyRemoved { .. } => "cell_dependency_removed",
            Self::CellLabelAdded { .. } => "cell_label_added",
            Self::CellLabelRemoved { .. } => "cell_label_removed",
            Self::CellCommentAdded { .. } => "cell_comment_added",
            Self::CellCommentUpdated { .. } => "cell_comment_updated",
            Self::CellCommentDeleted { .. } => "cell_comment_deleted",
            Self::CellEpicChildAdded { .. } => "cell_epic_child_added",
            Self::CellEpicChildRemoved { .. } => "cell_epic_child_removed",
            Self::CheckpointSaved { .. } => "checkpoint_saved",
            Self::EpicDecomposed { .. } => "epic_decomposed",
            Self::OutcomeRecorded { .. } => "outcome_recorded",
            Self::FeedbackRecorded { .. } => "feedback_recorded",
            Self::ValidationRecorded { .. } => "validation_recorded",
            Self::ContextCompacted { .. } => "context_compacted",
        }
    }

    pub fn family(&self) -> EventFamily {
        match self {
            Self::AgentRegistered { .. } | Self::AgentSessionEnded { .. } => EventFamily::Agent,
            Self::MessageSent { .. } | Self::MessageRead { .. } | Self::MessageAcked { .. } => {
                EventFamily::Message
            }
            Self::FileReserved { .. } | Self::FileReleased { .. } | Self::FileConflict { .. } => {
                EventFamily::Reservation
            }
            Self::CellCreated { .. }
            | Self::CellUpdated { .. }
            | Self::CellStatusChanged { .. }
            | Self::CellClosed { .. }
            | Self::CellReopened { .. }
            | Self::CellDeleted { .. }
            | Self::CellDependencyAdded { .. }
            | Self::CellDependencyRemoved { .. }
            | Self::CellLabelAdded { .. }
            | Self::CellLabelRemoved { .. }
            | Self::CellCommentAdded { .. }
            | Self::CellCommentUpdated { .. }
            | Self::CellCommentDeleted { .. }
            | Self::CellEpicChildAdded { .. }
            | Self::CellEpicChildRemoved { .. } => EventFamily::Task,
            Self::CheckpointSaved { .. } => EventFamily::Checkpoint,
            Self::EpicDecomposed { .. } => EventFamily::Decomposition,
            Self::OutcomeRecorded { .. } => EventFamily::Outcome,
            Self::FeedbackRecorded { .. } => EventFamily::Feedback,
            Self::ValidationRecorded { .. } => EventFamily::Validation,
            Self::ContextCompacted { .. } => EventFamily::ContextCompaction,
        }
    }

    /// Default stream for this payload's family.
    pub fn stream(&self) -> EventStream {
        match self.family() {
            EventFamily::Agent => EventStream::Agent,
            EventFamily::Message => EventStream::Mail,
            EventFamily::Reservation => EventStream::Reservation,
            EventFamily::Task | EventFamily::Decomposition | EventFamily::Validation => {
                EventStream::Cell
            }
            EventFamily::Checkpoint
            | EventFamily::Outcome
            | EventFamily::Feedback
            | EventFamily::ContextCompaction => EventStream::Session,
        }
    }

    /// The id of the entity this event concerns, used for entity-scoped
    /// reads such as epic replay. `sequence` is the sequence assigned to
    /// the event itself: self-identifying events (a `message_sent` creates
    /// the message whose id *is* the sequence) use it.
    pub fn entity_id(&self, sequence: i64) -> Option<String> {
        match self {
            Self::AgentRegistered { agent, .. }
            | Self::AgentSessionEnded { agent }
            | Self::CheckpointSaved { agent, .. }
            | Self::FeedbackRecorded { agent, .. }
            | Self::ContextCompacted { agent, .. } => Some(agent.clone()),
            Self::MessageSent { .. } | Self::FileReserved { .. } => Some(sequence.to_string()),
            Self::MessageRead { message_id, .. } | Self::MessageAcked { message_id, .. } => {
                Some(message_id.to_string())
            }
            Self::FileReleased { agent, .. } => Some(agent.clone()),
            Self::FileConflict { path, .. } => Some(path.clone()),
            Self::CellCreated { cell_id, .. }
            | Self::CellUpdated { cell_id, .. }
            | Self::CellStatusChanged { cell_id, .. }
            | Self::CellClosed { cell_id, .. }
            | Self::CellReopened { cell_id }
            | Self::CellDeleted { cell_id }
            | Self::CellLabelAdded { cell_id, .. }
            | Self::CellLabelRemoved { cell_id, .. }
            | Self::CellCommentAdded { cell_id, .. }
            | Self::CellCommentUpdated { cell_id, .. }
            | Self::CellCommentDeleted { cell_id, .. }
            | Self::OutcomeRecorded { cell_id, .. }
            | Self::ValidationRecorded { cell_id, .. } => Some(cell_id.clone()),
            Self::CellDependencyAdded { to_cell, .. }
            | Self::CellDependencyRemoved { to_cell, .. } => Some(to_cell.clone()),
            Self::CellEpicChildAdded { epic_id, .. }
            | Self::CellEpicChildRemoved { epic_id, .. }
            | Self::EpicDecomposed { epic_id, .. } => Some(epic_id.clone()),
        }
    }

    /// Validate a raw `(type, body)` pair from an untyped producer.
    ///
    /// Rejects unknown type tags and bodies that do not match the declared
    /// family shape.
    pub fn from_raw(kind: &str, body: &serde_json::Value) -> DomainResult<Self> {
        let mut tagged = body
            .as_object()
            .cloned()
            .ok_or_else(|| DomainError::Validation("event payload must be an object".into()))?;
        tagged.insert("type".to_string(), serde_json::Value::String(kind.to_string()));
        serde_json::from_value(serde_json::Value::Object(tagged)).map_err(|e| {
            DomainError::Validation(format!("payload does not match event family '{kind}': {e}"))
        })
    }
}

/// A stored event. `sequence` is store-wide monotonic; replay in sequence
/// order is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub sequence: i64,
    pub stream: EventStream,
    pub project_key: String,
    pub entity_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_kind_matches_serde_tag() {
        let payload = EventPayload::MessageSent {
            from: "BlueFalcon".into(),
            to: vec!["RedOtter".into()],
            subject: "hi".into(),
            body: "hello".into(),
            thread_id: None,
            importance: Importance::Normal,
            ack_required: false,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], payload.kind());
    }

    #[test]
    fn from_raw_accepts_known_family() {
        let body = json!({"cell_id": "cell-abc123-xyz", "from": "open", "to": "in_progress"});
        let payload = EventPayload::from_raw("cell_status_changed", &body).unwrap();
        assert_eq!(payload.kind(), "cell_status_changed");
    }

    #[test]
    fn from_raw_rejects_unknown_type() {
        let err = EventPayload::from_raw("bogus_event", &json!({})).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn from_raw_rejects_malformed_body() {
        // message_sent requires from/to/subject/body
        let err = EventPayload::from_raw("message_sent", &json!({"subject": "s"})).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn entity_id_uses_sequence_for_self_identifying_events() {
        let payload = EventPayload::FileReserved {
            agent: "BlueFalcon".into(),
            path_pattern: "src/**".into(),
            reason: None,
            exclusive: true,
            expires_at_ms: 0,
        };
        assert_eq!(payload.entity_id(42), Some("42".to_string()));
    }
}
